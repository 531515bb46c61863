//! In-process network with a shared append-only history store
//!
//! Every [`MemoryTransport`] handed out by a [`MemoryHub`] publishes into the
//! same store and sees the same history. Links between peers are explicit
//! (`connect` / `disconnect`) and each change is delivered to both ends as a
//! [`ConnectivityEvent`].
//!
//! The hub can also inject raw payloads, trim history and fail the next N
//! publishes or queries, so store misbehaviour can be exercised in tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::transport::{NetworkError, Transport};
use crate::types::{ConnectivityEvent, ContentTopic, PeerId, PubsubTopic, Receipt, StoredMessage};

/// Shared in-process network
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<RwLock<HubState>>,
}

#[derive(Default)]
struct HubState {
    store: Vec<Envelope>,
    nodes: HashMap<PeerId, NodeState>,
    next_seq: u64,
    last_timestamp: i64,
    failing_publishes: usize,
    failing_queries: usize,
}

struct Envelope {
    topic: PubsubTopic,
    classifier: ContentTopic,
    message: StoredMessage,
}

struct NodeState {
    links: HashSet<PeerId>,
    events: mpsc::UnboundedSender<ConnectivityEvent>,
    closed: bool,
}

impl HubState {
    /// Strictly increasing store clock
    fn stamp(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_micros();
        self.last_timestamp = now.max(self.last_timestamp + 1);
        self.last_timestamp
    }

    fn notify(&self, to: &PeerId, peer: &PeerId, connected: bool) {
        if let Some(node) = self.nodes.get(to) {
            let _ = node.events.send(ConnectivityEvent {
                peer: peer.clone(),
                connected,
            });
        }
    }

    fn node(&self, peer: &PeerId) -> Result<&NodeState, NetworkError> {
        match self.nodes.get(peer) {
            Some(node) if !node.closed => Ok(node),
            _ => Err(NetworkError::Closed),
        }
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a peer; returns its transport and connectivity stream
    pub fn join(&self, peer: PeerId) -> (MemoryTransport, mpsc::UnboundedReceiver<ConnectivityEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        self.state.write().nodes.insert(
            peer.clone(),
            NodeState {
                links: HashSet::new(),
                events,
                closed: false,
            },
        );
        debug!(peer = %peer.short(), "peer attached to memory hub");
        let transport = MemoryTransport {
            hub: self.clone(),
            peer,
        };
        (transport, rx)
    }

    /// Link two attached peers
    pub fn connect(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.state.write();
        if a == b || !state.nodes.contains_key(a) || !state.nodes.contains_key(b) {
            return;
        }
        let added = state
            .nodes
            .get_mut(a)
            .map(|n| n.links.insert(b.clone()))
            .unwrap_or(false);
        if let Some(n) = state.nodes.get_mut(b) {
            n.links.insert(a.clone());
        }
        if added {
            state.notify(a, b, true);
            state.notify(b, a, true);
        }
    }

    /// Drop the link between two peers
    pub fn disconnect(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.state.write();
        let removed = state
            .nodes
            .get_mut(a)
            .map(|n| n.links.remove(b))
            .unwrap_or(false);
        if let Some(n) = state.nodes.get_mut(b) {
            n.links.remove(a);
        }
        if removed {
            state.notify(a, b, false);
            state.notify(b, a, false);
        }
    }

    /// Append a raw payload to the store, bypassing any transport
    pub fn inject(&self, topic: &PubsubTopic, classifier: &ContentTopic, payload: Vec<u8>) -> Receipt {
        let mut state = self.state.write();
        let timestamp = state.stamp();
        Self::append(&mut state, topic, classifier, payload, timestamp)
    }

    /// Drop stored history older than `timestamp`
    pub fn trim_before(&self, timestamp: i64) {
        let mut state = self.state.write();
        state.store.retain(|e| e.message.timestamp >= timestamp);
    }

    /// Fail the next `n` publishes with `Unreachable`
    pub fn fail_next_publishes(&self, n: usize) {
        self.state.write().failing_publishes = n;
    }

    /// Fail the next `n` queries with `Unreachable`
    pub fn fail_next_queries(&self, n: usize) {
        self.state.write().failing_queries = n;
    }

    /// Number of messages currently held by the store
    pub fn stored_len(&self) -> usize {
        self.state.read().store.len()
    }

    fn append(
        state: &mut HubState,
        topic: &PubsubTopic,
        classifier: &ContentTopic,
        payload: Vec<u8>,
        timestamp: i64,
    ) -> Receipt {
        let seq = state.next_seq;
        state.next_seq += 1;
        state.store.push(Envelope {
            topic: topic.clone(),
            classifier: classifier.clone(),
            message: StoredMessage { payload, timestamp },
        });
        Receipt { seq, timestamp }
    }
}

/// One peer's view of a [`MemoryHub`]
#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
    peer: PeerId,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(
        &self,
        topic: &PubsubTopic,
        classifier: &ContentTopic,
        payload: Vec<u8>,
    ) -> Result<Receipt, NetworkError> {
        let mut state = self.hub.state.write();
        if state.node(&self.peer)?.links.is_empty() {
            return Err(NetworkError::Unreachable("no relay peers".into()));
        }
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(NetworkError::Unreachable("injected publish failure".into()));
        }
        let timestamp = state.stamp();
        let receipt = MemoryHub::append(&mut state, topic, classifier, payload, timestamp);
        debug!(peer = %self.peer.short(), seq = receipt.seq, %classifier, "published");
        Ok(receipt)
    }

    async fn query(
        &self,
        topic: &PubsubTopic,
        classifier: &ContentTopic,
    ) -> Result<Vec<StoredMessage>, NetworkError> {
        let mut state = self.hub.state.write();
        state.node(&self.peer)?;
        if state.failing_queries > 0 {
            state.failing_queries -= 1;
            return Err(NetworkError::Unreachable("injected query failure".into()));
        }
        Ok(state
            .store
            .iter()
            .filter(|e| &e.topic == topic && &e.classifier == classifier)
            .map(|e| e.message.clone())
            .collect())
    }

    fn peer_count(&self) -> usize {
        self.hub
            .state
            .read()
            .nodes
            .get(&self.peer)
            .map_or(0, |n| n.links.len())
    }

    async fn shutdown(&self) {
        let mut state = self.hub.state.write();
        let links: Vec<PeerId> = match state.nodes.get_mut(&self.peer) {
            Some(node) if !node.closed => {
                node.closed = true;
                node.links.drain().collect()
            }
            _ => return,
        };
        for other in &links {
            if let Some(n) = state.nodes.get_mut(other) {
                n.links.remove(&self.peer);
            }
            state.notify(other, &self.peer, false);
        }
        info!(peer = %self.peer.short(), "memory transport shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LOBBY_CONTENT_TOPIC, PUBSUB_TOPIC};

    fn topics() -> (PubsubTopic, ContentTopic) {
        (
            PubsubTopic(PUBSUB_TOPIC.into()),
            ContentTopic(LOBBY_CONTENT_TOPIC.into()),
        )
    }

    #[tokio::test]
    async fn test_connect_emits_events_to_both_ends() {
        let hub = MemoryHub::new();
        let (a, b) = (PeerId::new("a"), PeerId::new("b"));
        let (ta, mut rx_a) = hub.join(a.clone());
        let (tb, mut rx_b) = hub.join(b.clone());

        hub.connect(&a, &b);
        assert_eq!(ta.peer_count(), 1);
        assert_eq!(tb.peer_count(), 1);
        assert_eq!(rx_a.recv().await.unwrap(), ConnectivityEvent { peer: b.clone(), connected: true });
        assert_eq!(rx_b.recv().await.unwrap(), ConnectivityEvent { peer: a.clone(), connected: true });

        // second connect is a no-op
        hub.connect(&a, &b);
        assert!(rx_a.try_recv().is_err());

        hub.disconnect(&a, &b);
        assert_eq!(ta.peer_count(), 0);
        assert!(!rx_b.recv().await.unwrap().connected);
    }

    #[tokio::test]
    async fn test_publish_then_query_scoped_by_classifier() {
        let hub = MemoryHub::new();
        let (a, b) = (PeerId::new("a"), PeerId::new("b"));
        let (ta, _rx) = hub.join(a.clone());
        let (tb, _rx2) = hub.join(b.clone());
        hub.connect(&a, &b);

        let (topic, lobby) = topics();
        let gameplay = ContentTopic(crate::GAMEPLAY_CONTENT_TOPIC.into());
        let r1 = ta.publish(&topic, &lobby, b"one".to_vec()).await.unwrap();
        let r2 = ta.publish(&topic, &gameplay, b"move".to_vec()).await.unwrap();
        assert!(r2.timestamp > r1.timestamp);

        let got = tb.query(&topic, &lobby).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, b"one");
    }

    #[tokio::test]
    async fn test_publish_without_links_is_unreachable() {
        let hub = MemoryHub::new();
        let (ta, _rx) = hub.join(PeerId::new("a"));
        let (topic, lobby) = topics();
        let err = ta.publish(&topic, &lobby, vec![1]).await.unwrap_err();
        assert!(matches!(err, NetworkError::Unreachable(_)));
        assert_eq!(hub.stored_len(), 0);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let hub = MemoryHub::new();
        let (ta, _rx) = hub.join(PeerId::new("a"));
        let (topic, lobby) = topics();
        hub.fail_next_queries(1);
        assert!(ta.query(&topic, &lobby).await.is_err());
        assert!(ta.query(&topic, &lobby).await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_closes_transport_and_notifies_peers() {
        let hub = MemoryHub::new();
        let (a, b) = (PeerId::new("a"), PeerId::new("b"));
        let (ta, _rx_a) = hub.join(a.clone());
        let (tb, mut rx_b) = hub.join(b.clone());
        hub.connect(&a, &b);
        let _ = rx_b.recv().await;

        ta.shutdown().await;
        assert_eq!(tb.peer_count(), 0);
        assert_eq!(rx_b.recv().await.unwrap(), ConnectivityEvent { peer: a, connected: false });

        let (topic, lobby) = topics();
        assert_eq!(ta.query(&topic, &lobby).await.unwrap_err(), NetworkError::Closed);
    }

    #[tokio::test]
    async fn test_trim_before_drops_old_history() {
        let hub = MemoryHub::new();
        let (ta, _rx) = hub.join(PeerId::new("a"));
        let (topic, lobby) = topics();
        let first = hub.inject(&topic, &lobby, b"old".to_vec());
        let second = hub.inject(&topic, &lobby, b"new".to_vec());
        hub.trim_before(second.timestamp);
        assert!(first.timestamp < second.timestamp);

        let got = ta.query(&topic, &lobby).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, b"new");
    }
}
