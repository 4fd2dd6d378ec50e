//! Outstanding sync requests.
//!
//! When this peer asks a remote for entries, the `(remote, entry)` pair is
//! recorded here so that another peer offering the same entry shortly after
//! is not asked for it too. Records expire after a TTL, are dropped when the
//! entry is finally joined, and are dropped wholesale when the remote leaves.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use eddy_types::{EntryHash, PeerId};

/// What was requested: a full hash or a compact entry number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Wanted {
    Hash(EntryHash),
    Number(u64),
}

impl Wanted {
    fn number(&self) -> u64 {
        match self {
            Wanted::Hash(h) => h.number(),
            Wanted::Number(n) => *n,
        }
    }
}

pub(crate) struct InFlight {
    ttl: Duration,
    requests: HashMap<(PeerId, Wanted), Instant>,
}

impl InFlight {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            requests: HashMap::new(),
        }
    }

    /// Whether some peer other than `except` has an unexpired request for
    /// `wanted` outstanding.
    pub(crate) fn pending_elsewhere(&self, wanted: Wanted, except: &PeerId, now: Instant) -> bool {
        let number = wanted.number();
        self.requests.iter().any(|((peer, w), at)| {
            peer != except && w.number() == number && now.duration_since(*at) < self.ttl
        })
    }

    pub(crate) fn record(&mut self, peer: PeerId, wanted: Wanted, now: Instant) {
        self.requests.insert((peer, wanted), now);
    }

    /// Forget every request for an entry that has now been joined.
    pub(crate) fn resolve(&mut self, hash: &EntryHash) {
        let number = hash.number();
        self.requests.retain(|(_, w), _| w.number() != number);
    }

    /// Forget every request addressed to `peer`.
    pub(crate) fn clear_peer(&mut self, peer: &PeerId) {
        self.requests.retain(|(p, _), _| p != peer);
    }

    pub(crate) fn prune(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.requests.retain(|_, at| now.duration_since(*at) < ttl);
    }

    pub(crate) fn clear(&mut self) {
        self.requests.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId::from([n; 32])
    }

    #[test]
    fn test_pending_elsewhere_ignores_asker() {
        let mut table = InFlight::new(Duration::from_secs(30));
        let now = Instant::now();
        let hash = EntryHash::from_data(b"e");
        table.record(peer(1), Wanted::Hash(hash), now);

        assert!(!table.pending_elsewhere(Wanted::Hash(hash), &peer(1), now));
        assert!(table.pending_elsewhere(Wanted::Hash(hash), &peer(2), now));
        // A number request for the same entry counts as the same request.
        assert!(table.pending_elsewhere(Wanted::Number(hash.number()), &peer(2), now));
    }

    #[test]
    fn test_expired_requests_do_not_block() {
        let mut table = InFlight::new(Duration::from_millis(10));
        let then = Instant::now();
        let hash = EntryHash::from_data(b"e");
        table.record(peer(1), Wanted::Hash(hash), then);

        let later = then + Duration::from_millis(20);
        assert!(!table.pending_elsewhere(Wanted::Hash(hash), &peer(2), later));
        table.prune(later);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_resolve_and_clear_peer() {
        let mut table = InFlight::new(Duration::from_secs(30));
        let now = Instant::now();
        let a = EntryHash::from_data(b"a");
        let b = EntryHash::from_data(b"b");
        table.record(peer(1), Wanted::Hash(a), now);
        table.record(peer(2), Wanted::Number(a.number()), now);
        table.record(peer(2), Wanted::Hash(b), now);

        table.resolve(&a);
        assert_eq!(table.len(), 1);

        table.clear_peer(&peer(2));
        assert_eq!(table.len(), 0);
    }
}
