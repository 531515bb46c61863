//! Bounded log of peer connectivity changes shown alongside the directory

use std::collections::{BTreeSet, VecDeque};
use wsudoku_p2p::{ConnectivityEvent, PeerId};

#[derive(Debug, Clone)]
pub struct PeerLog {
    entries: VecDeque<String>,
    capacity: usize,
    connected: BTreeSet<PeerId>,
}

impl PeerLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            connected: BTreeSet::new(),
        }
    }

    /// Apply a connectivity event; oldest entries fall off the front
    pub fn record(&mut self, event: &ConnectivityEvent) {
        let line = if event.connected {
            self.connected.insert(event.peer.clone());
            format!("Peer connected: {}", event.peer)
        } else {
            self.connected.remove(&event.peer);
            format!("Peer disconnected: {}", event.peer)
        };
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(line);
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn connected(&self) -> impl Iterator<Item = &PeerId> {
        self.connected.iter()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(peer: &str, connected: bool) -> ConnectivityEvent {
        ConnectivityEvent {
            peer: PeerId::new(peer),
            connected,
        }
    }

    #[test]
    fn test_tracks_connected_set() {
        let mut log = PeerLog::new(10);
        log.record(&event("a", true));
        log.record(&event("b", true));
        log.record(&event("a", false));
        assert_eq!(log.connected_count(), 1);
        assert_eq!(log.connected().next(), Some(&PeerId::new("b")));
        assert_eq!(
            log.entries().collect::<Vec<_>>(),
            vec!["Peer connected: a", "Peer connected: b", "Peer disconnected: a"]
        );
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut log = PeerLog::new(2);
        for p in ["a", "b", "c"] {
            log.record(&event(p, true));
        }
        assert_eq!(
            log.entries().collect::<Vec<_>>(),
            vec!["Peer connected: b", "Peer connected: c"]
        );
        assert_eq!(log.connected_count(), 3);
    }
}
