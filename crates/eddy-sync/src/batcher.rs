//! Debounced head gossip.
//!
//! Heads destined for the same peer within one debounce window leave in a
//! single [`SyncMessage::ExchangeHeads`], however many appends or joins
//! produced them. A message is only split when it would exceed the
//! configured size limit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use eddy_types::{EntryHash, PeerId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::message::SyncMessage;
use crate::transport::Transport;

/// Room left for the enum tag and length prefixes of a batch.
const FRAME_OVERHEAD: usize = 1024;

/// An encoded entry waiting to be gossiped.
pub(crate) type Head = (EntryHash, Vec<u8>);

struct Queued {
    to: PeerId,
    heads: Vec<Head>,
}

/// Handle to the batching task.
#[derive(Clone)]
pub(crate) struct HeadBatcher {
    tx: mpsc::UnboundedSender<Queued>,
}

impl HeadBatcher {
    /// Start the batching task. It runs until `cancel` fires.
    pub(crate) fn spawn(
        transport: Arc<dyn Transport>,
        window: Duration,
        max_message_size: usize,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(rx, transport, window, max_message_size, cancel));
        (Self { tx }, handle)
    }

    /// Queue `heads` for `to`. They are sent when the current window closes.
    pub(crate) fn queue(&self, to: PeerId, heads: Vec<Head>) {
        if heads.is_empty() {
            return;
        }
        if self.tx.send(Queued { to, heads }).is_err() {
            debug!(peer = %to, "batcher stopped, dropping heads");
        }
    }
}

#[derive(Default)]
struct Window {
    order: Vec<PeerId>,
    per_peer: HashMap<PeerId, (HashSet<EntryHash>, Vec<Vec<u8>>)>,
}

impl Window {
    fn add(&mut self, queued: Queued) {
        let slot = self.per_peer.entry(queued.to).or_insert_with(|| {
            self.order.push(queued.to);
            (HashSet::new(), Vec::new())
        });
        for (hash, block) in queued.heads {
            if slot.0.insert(hash) {
                slot.1.push(block);
            }
        }
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<Queued>,
    transport: Arc<dyn Transport>,
    window: Duration,
    max_message_size: usize,
    cancel: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => return,
            queued = rx.recv() => match queued {
                Some(q) => q,
                None => return,
            },
        };

        let mut batch = Window::default();
        batch.add(first);

        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        let mut closed = false;
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = cancel.cancelled() => return,
                queued = rx.recv() => match queued {
                    Some(q) => batch.add(q),
                    None => {
                        closed = true;
                        break;
                    }
                },
            }
        }

        flush(transport.as_ref(), batch, max_message_size).await;
        if closed {
            return;
        }
    }
}

async fn flush(transport: &dyn Transport, mut batch: Window, max_message_size: usize) {
    for peer in batch.order {
        let Some((_, blocks)) = batch.per_peer.remove(&peer) else {
            continue;
        };
        let count = blocks.len();
        for heads in split(blocks, max_message_size.saturating_sub(FRAME_OVERHEAD)) {
            let bytes = match (SyncMessage::ExchangeHeads { heads }).encode() {
                Ok(b) => b,
                Err(e) => {
                    error!(%peer, error = %e, "failed to encode heads");
                    continue;
                }
            };
            if let Err(e) = transport.send(peer, bytes).await {
                error!(%peer, error = %e, "failed to send heads");
            }
        }
        debug!(%peer, count, "flushed heads");
    }
}

/// Group blocks so each group stays under `budget` bytes. A single block
/// larger than the budget travels alone.
fn split(blocks: Vec<Vec<u8>>, budget: usize) -> Vec<Vec<Vec<u8>>> {
    let mut groups = Vec::new();
    let mut current: Vec<Vec<u8>> = Vec::new();
    let mut size = 0usize;
    for block in blocks {
        if !current.is_empty() && size + block.len() > budget {
            groups.push(std::mem::take(&mut current));
            size = 0;
        }
        size += block.len();
        current.push(block);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, TransportEvent};

    fn peer(n: u8) -> PeerId {
        PeerId::from([n; 32])
    }

    fn head(n: u8) -> Head {
        (EntryHash::from_data(&[n]), vec![n; 8])
    }

    #[tokio::test]
    async fn test_one_message_per_peer_per_window() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = net.attach(peer(1));
        let (_b, mut b_rx) = net.attach(peer(2));
        let (_c, mut c_rx) = net.attach(peer(3));
        let cancel = CancellationToken::new();
        let (batcher, _task) =
            HeadBatcher::spawn(a, Duration::from_millis(20), 1 << 20, cancel.clone());

        batcher.queue(peer(2), vec![head(1)]);
        batcher.queue(peer(2), vec![head(2), head(3)]);
        batcher.queue(peer(3), vec![head(1)]);
        batcher.queue(peer(2), vec![head(1)]);

        let to_b = next_message(&mut b_rx).await;
        let to_c = next_message(&mut c_rx).await;
        assert_eq!(to_b.len(), 3, "duplicates collapse within a window");
        assert_eq!(to_c.len(), 1);
        assert_eq!(net.delivered(), 2);
        cancel.cancel();
    }

    #[test]
    fn test_split_respects_budget() {
        let blocks = vec![vec![0u8; 40], vec![0u8; 40], vec![0u8; 40], vec![0u8; 200]];
        let groups = split(blocks, 100);
        let sizes: Vec<usize> = groups.iter().map(|g| g.len()).collect();
        assert_eq!(sizes, vec![2, 1, 1]);
    }

    async fn next_message(rx: &mut crate::transport::TransportEvents) -> Vec<Vec<u8>> {
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for heads")
                .expect("network closed");
            if let TransportEvent::Message { bytes, .. } = ev {
                match SyncMessage::decode(&bytes).unwrap() {
                    SyncMessage::ExchangeHeads { heads } => return heads,
                    other => panic!("unexpected {other:?}"),
                }
            }
        }
    }
}
