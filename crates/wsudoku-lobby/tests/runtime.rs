//! Lobby runtime driven end to end over the in-process network

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use wsudoku_lobby::{
    derive_id, Command, DirectoryStatus, JoinState, Lobby, LobbyConfig, LobbyHandle, LobbyRuntime,
};
use wsudoku_p2p::{
    ContentTopic, MemoryHub, MemoryTransport, NetworkError, PeerId, PubsubTopic, Receipt, StoredMessage,
    Transport,
};

fn start(hub: &MemoryHub, name: &str, config: LobbyConfig) -> LobbyHandle {
    let peer = PeerId::new(name);
    let (transport, connectivity) = hub.join(peer.clone());
    LobbyRuntime::spawn(Lobby::new(Arc::new(transport), peer, config), connectivity)
}

async fn settle<F>(handle: &LobbyHandle, f: F) -> wsudoku_lobby::LobbyView
where
    F: FnMut(&wsudoku_lobby::LobbyView) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), handle.wait_for(f))
        .await
        .expect("view never settled")
        .unwrap()
}

#[tokio::test]
async fn test_create_join_finish() {
    let hub = MemoryHub::new();
    let (c, d) = (PeerId::new("C"), PeerId::new("D"));
    let host = start(&hub, "C", LobbyConfig::default());
    let guest = start(&hub, "D", LobbyConfig::default());
    hub.connect(&c, &d);
    settle(&host, |v| v.connected_peers == 1).await;

    let id = host.create("Sudoku-42", vec![1, 2, 3]).await.unwrap();
    let view = settle(&host, |v| v.snapshot.get(&id).is_some()).await;
    assert_eq!(view.status, DirectoryStatus::Listed(1));
    assert!(view.snapshot.get(&id).unwrap().participant(&c).unwrap().is_admin);

    guest.send(Command::Refresh).await.unwrap();
    settle(&guest, |v| v.snapshot.get(&id).is_some()).await;
    guest.send(Command::Join(id.clone())).await.unwrap();

    let view = settle(&guest, |v| {
        v.join_attempt(&id).map(|a| &a.state) == Some(&JoinState::Confirmed)
    })
    .await;
    let session = view.snapshot.get(&id).unwrap();
    assert_eq!(session.player_count(), 2);
    assert!(!session.participant(&d).unwrap().is_admin);
    assert!(view.message.unwrap().starts_with("joined"));

    guest.send(Command::Finish(id.clone())).await.unwrap();
    settle(&guest, |v| {
        v.snapshot
            .get(&id)
            .and_then(|s| s.participant(&d))
            .map_or(false, |p| p.finished)
    })
    .await;

    host.send(Command::Refresh).await.unwrap();
    let view = settle(&host, |v| v.snapshot.get(&id).map_or(false, |s| s.player_count() == 2)).await;
    let session = view.snapshot.get(&id).unwrap();
    assert!(session.participant(&d).unwrap().finished);
    assert!(!session.participant(&c).unwrap().finished);

    host.shutdown().await.unwrap();
    guest.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_joining_twice_is_rejected() {
    let hub = MemoryHub::new();
    let host = start(&hub, "C", LobbyConfig::default());
    let _guest = start(&hub, "D", LobbyConfig::default());
    hub.connect(&PeerId::new("C"), &PeerId::new("D"));
    settle(&host, |v| v.connected_peers == 1).await;

    let id = host.create("Mine", vec![]).await.unwrap();
    settle(&host, |v| v.snapshot.get(&id).is_some()).await;

    // the creator is already a participant
    host.send(Command::Join(id.clone())).await.unwrap();
    let view = settle(&host, |v| v.message.as_deref().map_or(false, |m| m.starts_with("already joined"))).await;
    assert!(view.joins.is_empty());
    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_leave_removes_participant() {
    let hub = MemoryHub::new();
    let (c, d) = (PeerId::new("C"), PeerId::new("D"));
    let host = start(&hub, "C", LobbyConfig::default());
    let guest = start(&hub, "D", LobbyConfig::default());
    hub.connect(&c, &d);
    settle(&guest, |v| v.connected_peers == 1).await;

    let id = host.create("S", vec![]).await.unwrap();
    settle(&host, |v| v.snapshot.get(&id).is_some()).await;
    guest.send(Command::Refresh).await.unwrap();
    settle(&guest, |v| v.snapshot.get(&id).is_some()).await;
    guest.send(Command::Join(id.clone())).await.unwrap();
    settle(&guest, |v| v.join_attempt(&id).map(|a| &a.state) == Some(&JoinState::Confirmed)).await;

    guest.send(Command::Leave(id.clone())).await.unwrap();
    let view = settle(&guest, |v| v.snapshot.get(&id).map_or(false, |s| !s.contains(&d))).await;
    assert!(view.join_attempt(&id).is_none());
    // session outlives its participants
    assert!(view.snapshot.get(&id).unwrap().contains(&c));

    host.shutdown().await.unwrap();
    guest.shutdown().await.unwrap();
}

/// Accepts publishes but never stores them
struct Blackhole {
    inner: MemoryTransport,
}

#[async_trait]
impl Transport for Blackhole {
    async fn publish(&self, _: &PubsubTopic, _: &ContentTopic, _: Vec<u8>) -> Result<Receipt, NetworkError> {
        Ok(Receipt { seq: 0, timestamp: 0 })
    }

    async fn query(&self, topic: &PubsubTopic, classifier: &ContentTopic) -> Result<Vec<StoredMessage>, NetworkError> {
        self.inner.query(topic, classifier).await
    }

    fn peer_count(&self) -> usize {
        self.inner.peer_count()
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_join_times_out_and_retries() {
    let hub = MemoryHub::new();
    let (c, d) = (PeerId::new("C"), PeerId::new("D"));
    let host = start(&hub, "C", LobbyConfig::default());
    let (inner, connectivity) = hub.join(d.clone());
    let config = LobbyConfig {
        join_confirm_timeout_ms: 1_000,
        ..Default::default()
    };
    let guest = LobbyRuntime::spawn(
        Lobby::new(Arc::new(Blackhole { inner }), d.clone(), config),
        connectivity,
    );
    hub.connect(&c, &d);
    settle(&host, |v| v.connected_peers == 1).await;

    let id = host.create("Lost", vec![]).await.unwrap();
    settle(&host, |v| v.snapshot.get(&id).is_some()).await;
    guest.send(Command::Refresh).await.unwrap();
    settle(&guest, |v| v.snapshot.get(&id).is_some()).await;

    guest.send(Command::Join(id.clone())).await.unwrap();
    settle(&guest, |v| matches!(v.join_attempt(&id).map(|a| &a.state), Some(JoinState::Published { .. }))).await;

    let view = settle(&guest, |v| v.join_attempt(&id).map(|a| &a.state) == Some(&JoinState::TimedOut)).await;
    assert!(view.message.unwrap().contains("not confirmed"));

    guest.send(Command::Retry(id.clone())).await.unwrap();
    let view = settle(&guest, |v| v.join_attempt(&id).map_or(false, |a| a.publishes == 2)).await;
    assert!(matches!(view.join_attempt(&id).unwrap().state, JoinState::Published { .. }));

    guest.send(Command::Abandon(id.clone())).await.unwrap();
    settle(&guest, |v| v.join_attempt(&id).is_none()).await;

    host.shutdown().await.unwrap();
    guest.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_query_shows_failed_status() {
    let hub = MemoryHub::new();
    let handle = start(&hub, "A", LobbyConfig::default());

    hub.fail_next_queries(1);
    handle.send(Command::Refresh).await.unwrap();
    let view = settle(&handle, |v| v.refreshes == 1).await;
    assert!(matches!(view.status, DirectoryStatus::Failed(_)));

    handle.send(Command::Refresh).await.unwrap();
    let view = settle(&handle, |v| v.refreshes == 2).await;
    assert_eq!(view.status, DirectoryStatus::Empty);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_refresh_burst_is_coalesced() {
    let hub = MemoryHub::new();
    let handle = start(&hub, "A", LobbyConfig::default());

    for _ in 0..10 {
        handle.send(Command::Refresh).await.unwrap();
    }
    handle.send(Command::Create { title: None, puzzle: vec![] }).await.unwrap();
    // create fails without peers; its status line marks the end of the burst
    settle(&handle, |v| v.message.is_some()).await;
    settle(&handle, |v| v.refreshes >= 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let refreshes = handle.view().refreshes;
    assert!((1..10).contains(&refreshes), "refreshes = {}", refreshes);
    handle.shutdown().await.unwrap();
}

/// Slow store that records the order of calls
struct Recording {
    inner: MemoryTransport,
    delay: Duration,
    calls: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl Transport for Recording {
    async fn publish(
        &self,
        topic: &PubsubTopic,
        classifier: &ContentTopic,
        payload: Vec<u8>,
    ) -> Result<Receipt, NetworkError> {
        tokio::time::sleep(self.delay).await;
        let receipt = self.inner.publish(topic, classifier, payload).await;
        self.calls.lock().push("publish");
        receipt
    }

    async fn query(&self, topic: &PubsubTopic, classifier: &ContentTopic) -> Result<Vec<StoredMessage>, NetworkError> {
        self.inner.query(topic, classifier).await
    }

    fn peer_count(&self) -> usize {
        self.inner.peer_count()
    }

    async fn shutdown(&self) {
        self.calls.lock().push("shutdown");
        self.inner.shutdown().await
    }
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_publish() {
    let hub = MemoryHub::new();
    let (a, b) = (PeerId::new("A"), PeerId::new("B"));
    let (inner, connectivity) = hub.join(a.clone());
    let _ = hub.join(b.clone());
    hub.connect(&a, &b);

    let calls = Arc::new(Mutex::new(Vec::new()));
    let transport = Recording {
        inner,
        delay: Duration::from_millis(50),
        calls: calls.clone(),
    };
    let handle = LobbyRuntime::spawn(Lobby::new(Arc::new(transport), a, LobbyConfig::default()), connectivity);
    let mut view = handle.subscribe();

    handle.create("Drained", vec![]).await.unwrap();
    handle.shutdown().await.unwrap();

    assert_eq!(*calls.lock(), vec!["publish", "shutdown"]);
    assert_eq!(hub.stored_len(), 1);
    assert!(!view.borrow_and_update().running);

    // the store outlives the peer that wrote to it
    let other = start(&hub, "B", LobbyConfig::default());
    other.send(Command::Refresh).await.unwrap();
    let listed = settle(&other, |v| v.refreshes == 1).await;
    assert!(listed.snapshot.get(&derive_id("Drained").unwrap()).is_some());
    other.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_view_reports_stopped_runtime() {
    let hub = MemoryHub::new();
    let handle = start(&hub, "A", LobbyConfig::default());
    let view = handle.subscribe();
    handle.shutdown().await.unwrap();
    assert!(!view.borrow().running);
}
