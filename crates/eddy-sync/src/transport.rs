//! Transport contract and an in-process network.
//!
//! A [`Transport`] sends opaque payloads to peers by [`PeerId`]. Incoming
//! traffic and connectivity changes are delivered separately as
//! [`TransportEvent`]s on the channel returned when a peer attaches, so the
//! shared log can drive a single receive loop.
//!
//! [`MemoryNetwork`] connects any number of peers inside one process. It is
//! what the tests run on and what embedders can use for local replicas.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use eddy_types::PeerId;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::SyncError;

/// Something that happened on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A payload arrived from `from`.
    Message { from: PeerId, bytes: Bytes },
    /// A peer became reachable.
    PeerJoined(PeerId),
    /// A peer is no longer reachable.
    PeerLeft(PeerId),
}

/// Receiving half handed out together with a transport.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Point-to-point delivery of encoded messages.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The peer this transport speaks for.
    fn local_peer(&self) -> PeerId;

    /// Peers currently reachable.
    fn peers(&self) -> Vec<PeerId>;

    /// Deliver `bytes` to `to`.
    async fn send(&self, to: PeerId, bytes: Bytes) -> Result<(), SyncError>;

    /// Deliver `bytes` to every reachable peer. Unreachable peers are skipped.
    async fn broadcast(&self, bytes: Bytes) -> Result<(), SyncError> {
        for peer in self.peers() {
            if let Err(e) = self.send(peer, bytes.clone()).await {
                debug!(%peer, error = %e, "broadcast skipped peer");
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct NetworkState {
    peers: HashMap<PeerId, mpsc::UnboundedSender<TransportEvent>>,
    /// Pairs `(a, b)` with `a < b` that cannot reach each other.
    partitions: HashSet<(PeerId, PeerId)>,
}

fn link(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

/// An in-process hub routing messages between attached peers.
///
/// Cheap to clone; clones share the same hub.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
    delivered: Arc<AtomicU64>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `peer` to the network.
    ///
    /// Every already attached peer observes [`TransportEvent::PeerJoined`]
    /// for `peer`, and `peer` observes one for each of them.
    pub fn attach(&self, peer: PeerId) -> (Arc<MemoryTransport>, TransportEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().expect("network lock poisoned");
        for (other, other_tx) in state.peers.iter() {
            if state.partitions.contains(&link(peer, *other)) {
                continue;
            }
            let _ = other_tx.send(TransportEvent::PeerJoined(peer));
            let _ = tx.send(TransportEvent::PeerJoined(*other));
        }
        state.peers.insert(peer, tx);
        debug!(%peer, "attached to memory network");

        let transport = MemoryTransport {
            network: self.clone(),
            peer,
        };
        (Arc::new(transport), rx)
    }

    /// Detach `peer`. The remaining peers observe [`TransportEvent::PeerLeft`].
    pub fn detach(&self, peer: &PeerId) {
        let mut state = self.state.lock().expect("network lock poisoned");
        if state.peers.remove(peer).is_none() {
            return;
        }
        for (other, tx) in state.peers.iter() {
            if !state.partitions.contains(&link(*peer, *other)) {
                let _ = tx.send(TransportEvent::PeerLeft(*peer));
            }
        }
        debug!(%peer, "detached from memory network");
    }

    /// Cut the link between `a` and `b`. Both sides observe `PeerLeft`.
    pub fn partition(&self, a: PeerId, b: PeerId) {
        let mut state = self.state.lock().expect("network lock poisoned");
        if !state.partitions.insert(link(a, b)) {
            return;
        }
        if let Some(tx) = state.peers.get(&a) {
            let _ = tx.send(TransportEvent::PeerLeft(b));
        }
        if let Some(tx) = state.peers.get(&b) {
            let _ = tx.send(TransportEvent::PeerLeft(a));
        }
    }

    /// Restore the link between `a` and `b`. Both sides observe `PeerJoined`.
    pub fn heal(&self, a: PeerId, b: PeerId) {
        let mut state = self.state.lock().expect("network lock poisoned");
        if !state.partitions.remove(&link(a, b)) {
            return;
        }
        if !(state.peers.contains_key(&a) && state.peers.contains_key(&b)) {
            return;
        }
        if let Some(tx) = state.peers.get(&a) {
            let _ = tx.send(TransportEvent::PeerJoined(b));
        }
        if let Some(tx) = state.peers.get(&b) {
            let _ = tx.send(TransportEvent::PeerJoined(a));
        }
    }

    /// Number of payloads delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn reachable(&self, from: PeerId) -> Vec<PeerId> {
        let state = self.state.lock().expect("network lock poisoned");
        if !state.peers.contains_key(&from) {
            return Vec::new();
        }
        let mut peers: Vec<PeerId> = state
            .peers
            .keys()
            .filter(|p| **p != from && !state.partitions.contains(&link(from, **p)))
            .copied()
            .collect();
        peers.sort();
        peers
    }

    fn deliver(&self, from: PeerId, to: PeerId, bytes: Bytes) -> Result<(), SyncError> {
        let state = self.state.lock().expect("network lock poisoned");
        if !state.peers.contains_key(&from) || state.partitions.contains(&link(from, to)) {
            return Err(SyncError::Unreachable(to));
        }
        let tx = state.peers.get(&to).ok_or(SyncError::Unreachable(to))?;
        tx.send(TransportEvent::Message { from, bytes })
            .map_err(|_| SyncError::Unreachable(to))?;
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// One peer's handle onto a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    peer: PeerId,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.peer
    }

    fn peers(&self) -> Vec<PeerId> {
        self.network.reachable(self.peer)
    }

    async fn send(&self, to: PeerId, bytes: Bytes) -> Result<(), SyncError> {
        self.network.deliver(self.peer, to, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId::from([n; 32])
    }

    #[tokio::test]
    async fn test_attach_announces_both_sides() {
        let net = MemoryNetwork::new();
        let (_a, mut a_rx) = net.attach(peer(1));
        let (_b, mut b_rx) = net.attach(peer(2));

        assert_eq!(a_rx.recv().await, Some(TransportEvent::PeerJoined(peer(2))));
        assert_eq!(b_rx.recv().await, Some(TransportEvent::PeerJoined(peer(1))));
    }

    #[tokio::test]
    async fn test_send_routes_by_peer() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = net.attach(peer(1));
        let (_b, mut b_rx) = net.attach(peer(2));
        let (_c, mut c_rx) = net.attach(peer(3));

        a.send(peer(3), Bytes::from_static(b"hi")).await.unwrap();

        // c saw only the join events and the payload.
        let mut got = Vec::new();
        while let Ok(ev) = c_rx.try_recv() {
            got.push(ev);
        }
        assert!(got.contains(&TransportEvent::Message {
            from: peer(1),
            bytes: Bytes::from_static(b"hi"),
        }));
        while let Ok(ev) = b_rx.try_recv() {
            assert!(!matches!(ev, TransportEvent::Message { .. }));
        }
        assert_eq!(net.delivered(), 1);
    }

    #[tokio::test]
    async fn test_detach_and_unreachable() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = net.attach(peer(1));
        let (_b, _b_rx) = net.attach(peer(2));
        net.detach(&peer(2));

        assert_eq!(a_rx.recv().await, Some(TransportEvent::PeerJoined(peer(2))));
        assert_eq!(a_rx.recv().await, Some(TransportEvent::PeerLeft(peer(2))));
        assert!(matches!(
            a.send(peer(2), Bytes::new()).await,
            Err(SyncError::Unreachable(_))
        ));
        assert!(a.peers().is_empty());
    }

    #[tokio::test]
    async fn test_partition_blocks_delivery_until_healed() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = net.attach(peer(1));
        let (_b, _b_rx) = net.attach(peer(2));

        net.partition(peer(1), peer(2));
        assert!(a.send(peer(2), Bytes::new()).await.is_err());
        assert!(a.peers().is_empty());

        net.heal(peer(2), peer(1));
        a.send(peer(2), Bytes::new()).await.unwrap();
        assert_eq!(a.peers(), vec![peer(2)]);
    }
}
