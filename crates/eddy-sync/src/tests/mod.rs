//! Multi-peer tests over an in-process network.

mod membership_tests;
mod replication_tests;
mod retention_tests;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use eddy_log::{BlockStore, Blocks, Ed25519Identity, Identity};
use eddy_replication::{ReplicationIndex, ReplicationSpec};
use eddy_types::PeerId;

use crate::message::SyncMessage;
use crate::shared_log::{SharedLog, SharedLogOptions};
use crate::transport::{MemoryNetwork, MemoryTransport, Transport, TransportEvent, TransportEvents};

/// Deterministic identity from a seed.
fn test_identity(seed: u8) -> Arc<dyn Identity> {
    Arc::new(Ed25519Identity::from_seed([seed; 32]))
}

/// Immediately mature roles and a short batching window.
fn fast_options() -> SharedLogOptions {
    SharedLogOptions {
        role_maturity: Duration::ZERO,
        debounce: Duration::from_millis(10),
        ..SharedLogOptions::default()
    }
}

/// The whole ring.
fn full_ring() -> ReplicationSpec {
    ReplicationSpec::Factor {
        factor: 1.0,
        offset: None,
    }
}

struct TestNetwork {
    net: MemoryNetwork,
}

impl TestNetwork {
    fn new() -> Self {
        Self {
            net: MemoryNetwork::new(),
        }
    }

    /// A shared log with its own in-memory store and index.
    async fn open(&self, seed: u8, options: SharedLogOptions) -> SharedLog {
        self.open_with(
            seed,
            Arc::new(Blocks::in_memory()),
            ReplicationIndex::in_memory(),
            options,
        )
        .await
    }

    async fn open_with(
        &self,
        seed: u8,
        store: Arc<dyn BlockStore>,
        index: ReplicationIndex,
        options: SharedLogOptions,
    ) -> SharedLog {
        let identity = test_identity(seed);
        let (transport, events) = self.net.attach(identity.peer_id());
        SharedLog::open(identity, store, index, transport, events, options)
            .await
            .unwrap()
    }

    /// A peer speaking the wire protocol by hand.
    fn raw(&self, seed: u8) -> RawPeer {
        let identity = test_identity(seed);
        let (transport, events) = self.net.attach(identity.peer_id());
        RawPeer {
            identity,
            transport,
            events,
        }
    }
}

struct RawPeer {
    identity: Arc<dyn Identity>,
    transport: Arc<MemoryTransport>,
    events: TransportEvents,
}

impl RawPeer {
    fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    async fn send(&self, to: PeerId, message: SyncMessage) {
        self.transport
            .send(to, message.encode().unwrap())
            .await
            .unwrap();
    }

    /// Next message matching `want`, skipping everything else.
    async fn expect(&mut self, want: impl Fn(&SyncMessage) -> bool) -> SyncMessage {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = self.events.recv().await.expect("network closed");
                if let TransportEvent::Message { bytes, .. } = event {
                    let message = SyncMessage::decode(&bytes).unwrap();
                    if want(&message) {
                        return message;
                    }
                }
            }
        })
        .await
        .expect("timed out waiting for message")
    }

    /// Whether no message matching `want` arrives within `window`.
    async fn quiet(&mut self, window: Duration, want: impl Fn(&SyncMessage) -> bool) -> bool {
        let waited = tokio::time::timeout(window, async {
            loop {
                match self.events.recv().await {
                    Some(TransportEvent::Message { bytes, .. }) => {
                        if let Ok(message) = SyncMessage::decode(&bytes) {
                            if want(&message) {
                                return;
                            }
                        }
                    }
                    Some(_) => {}
                    None => std::future::pending::<()>().await,
                }
            }
        })
        .await;
        waited.is_err()
    }
}

/// Poll `check` until it holds, failing after five seconds.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `log` knows `count` segments in total.
async fn await_segments(log: &SharedLog, count: usize) {
    eventually("segment exchange", move || async move {
        log.all_segments().unwrap().len() == count
    })
    .await;
}
