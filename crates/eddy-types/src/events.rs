//! Membership and log events of one peer.
//!
//! Every event a shared log raises is a variant of [`LogEvent`] and travels
//! over a single broadcast channel, so listeners observe replicator and
//! join events in the order they happened. [`EventBus::subscribe`] narrows
//! the stream to one event type, [`EventBus::subscribe_all`] keeps it whole.
//!
//! ```rust
//! use eddy_types::events::{EventBus, ReplicatorJoined};
//! use eddy_types::PeerId;
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe::<ReplicatorJoined>();
//!
//! bus.emit(ReplicatorJoined {
//!     peer: PeerId::from([1u8; 32]),
//! });
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.peer, PeerId::from([1u8; 32]));
//! # });
//! ```

use std::marker::PhantomData;

use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::{EntryHash, PeerId, SegmentId};

/// Events buffered per subscriber before the slowest one starts lagging.
const CHANNEL_CAPACITY: usize = 1024;

/// The first segment of a replicator appeared in the replication index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicatorJoined {
    /// Owner of the new segment.
    pub peer: PeerId,
}

/// The last segment of a replicator was removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicatorLeft {
    /// Owner whose segments are all gone.
    pub peer: PeerId,
}

/// A segment has existed for the full maturity period without being reset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicatorMature {
    /// Owner of the matured segment.
    pub peer: PeerId,
    /// The segment that matured.
    pub segment: SegmentId,
}

/// Entries were merged into the local log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntriesJoined {
    /// Hashes of the newly present entries.
    pub hashes: Vec<EntryHash>,
    /// Peer that delivered them, `None` for local calls.
    pub from: Option<PeerId>,
}

/// Anything a shared log reports to its listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogEvent {
    ReplicatorJoined(ReplicatorJoined),
    ReplicatorLeft(ReplicatorLeft),
    ReplicatorMature(ReplicatorMature),
    EntriesJoined(EntriesJoined),
}

impl LogEvent {
    /// Peer the event is about: the replicator, or the delivering peer.
    pub fn peer(&self) -> Option<PeerId> {
        match self {
            LogEvent::ReplicatorJoined(e) => Some(e.peer),
            LogEvent::ReplicatorLeft(e) => Some(e.peer),
            LogEvent::ReplicatorMature(e) => Some(e.peer),
            LogEvent::EntriesJoined(e) => e.from,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            LogEvent::ReplicatorJoined(_) => "replicator:join",
            LogEvent::ReplicatorLeft(_) => "replicator:leave",
            LogEvent::ReplicatorMature(_) => "replicator:mature",
            LogEvent::EntriesJoined(_) => "entries:join",
        }
    }
}

/// One variant of [`LogEvent`].
pub trait Event: Clone + Send + 'static {
    fn wrap(self) -> LogEvent;
    fn unwrap_from(event: LogEvent) -> Option<Self>;
}

macro_rules! log_event {
    ($($name:ident),* $(,)?) => {
        $(
            impl Event for $name {
                fn wrap(self) -> LogEvent {
                    LogEvent::$name(self)
                }

                fn unwrap_from(event: LogEvent) -> Option<Self> {
                    match event {
                        LogEvent::$name(e) => Some(e),
                        _ => None,
                    }
                }
            }

            impl From<$name> for LogEvent {
                fn from(event: $name) -> Self {
                    LogEvent::$name(event)
                }
            }
        )*
    };
}

log_event!(ReplicatorJoined, ReplicatorLeft, ReplicatorMature, EntriesJoined);

/// Event fan-out for one peer. Cheap to clone; clones share the channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LogEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Deliver `event` to every current subscriber. Without subscribers the
    /// event is dropped.
    pub fn emit<E: Event>(&self, event: E) {
        let event = event.wrap();
        trace!(kind = event.kind(), "event");
        let _ = self.tx.send(event);
    }

    /// Events of type `E` emitted from now on.
    pub fn subscribe<E: Event>(&self) -> EventReceiver<E> {
        EventReceiver {
            rx: self.tx.subscribe(),
            _kind: PhantomData,
        }
    }

    /// Every event emitted from now on, in emission order.
    pub fn subscribe_all(&self) -> EventReceiver<LogEvent> {
        EventReceiver {
            rx: self.tx.subscribe(),
            _kind: PhantomData,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Event for LogEvent {
    fn wrap(self) -> LogEvent {
        self
    }

    fn unwrap_from(event: LogEvent) -> Option<Self> {
        Some(event)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

/// Receiving end narrowed to events of type `E`.
pub struct EventReceiver<E: Event> {
    rx: broadcast::Receiver<LogEvent>,
    _kind: PhantomData<fn() -> E>,
}

impl<E: Event> EventReceiver<E> {
    /// Wait for the next event of type `E`.
    ///
    /// Returns `None` once every bus clone is dropped. Lagged events are
    /// skipped with a warning.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if let Some(event) = E::unwrap_from(event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// An already buffered event of type `E`, without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if let Some(event) = E::unwrap_from(event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId::from([n; 32])
    }

    #[tokio::test]
    async fn test_typed_subscriber_skips_other_kinds() {
        let bus = EventBus::new();
        let mut mature = bus.subscribe::<ReplicatorMature>();

        bus.emit(ReplicatorJoined { peer: peer(1) });
        bus.emit(ReplicatorMature {
            peer: peer(1),
            segment: SegmentId::from([4u8; 32]),
        });

        let event = mature.recv().await.unwrap();
        assert_eq!(event.segment, SegmentId::from([4u8; 32]));
        assert!(mature.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_all_preserves_order() {
        let bus = EventBus::new();
        let mut all = bus.subscribe_all();

        bus.emit(ReplicatorJoined { peer: peer(1) });
        bus.emit(EntriesJoined {
            hashes: vec![EntryHash::from_data(b"e")],
            from: Some(peer(2)),
        });
        bus.emit(ReplicatorLeft { peer: peer(1) });

        let kinds: Vec<&str> = [
            all.recv().await.unwrap(),
            all.recv().await.unwrap(),
            all.recv().await.unwrap(),
        ]
        .iter()
        .map(LogEvent::kind)
        .collect();
        assert_eq!(kinds, ["replicator:join", "entries:join", "replicator:leave"]);
    }

    #[tokio::test]
    async fn test_subscribe_after_emit_misses_past() {
        let bus = EventBus::new();
        bus.emit(ReplicatorLeft { peer: peer(1) });

        let mut rx = bus.subscribe::<ReplicatorLeft>();
        assert!(rx.try_recv().is_none());

        bus.emit(ReplicatorLeft { peer: peer(2) });
        assert_eq!(rx.recv().await.unwrap().peer, peer(2));
    }

    #[tokio::test]
    async fn test_clones_share_the_channel() {
        let bus = EventBus::new();
        let other = bus.clone();
        let mut rx = bus.subscribe::<EntriesJoined>();
        assert_eq!(other.subscriber_count(), 1);

        other.emit(EntriesJoined {
            hashes: vec![EntryHash::from_data(b"e")],
            from: None,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.hashes.len(), 1);
        assert_eq!(LogEvent::from(event).peer(), None);
    }

    #[tokio::test]
    async fn test_recv_ends_when_bus_dropped() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe::<ReplicatorJoined>();
        drop(bus);
        assert!(rx.recv().await.is_none());
    }
}
