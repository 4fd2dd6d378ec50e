//! Mapping entries and domain-native values onto the coordinate ring.
//!
//! Coordinates are `u32` values on a ring of [`RING_SIZE`] points. A domain
//! must be deterministic: every peer maps the same entry to the same
//! coordinate without communicating.

use std::sync::Arc;

use eddy_log::Entry;
use eddy_types::config::{DomainKind, ReplicationSection};

/// Number of points on the coordinate ring.
pub const RING_SIZE: u64 = 1 << 32;

/// Maps entries, times and durations onto ring coordinates.
pub trait ReplicationDomain: Send + Sync {
    /// Coordinate of an entry.
    fn from_entry(&self, entry: &Entry) -> u32;

    /// Coordinate of a point in time (milliseconds since the Unix epoch).
    fn from_time(&self, unix_ms: u64) -> u32;

    /// Width on the ring of a span of `ms` milliseconds.
    fn from_duration(&self, ms: u64) -> u32;
}

/// Places entries by the hash of their gid, so a whole branch lands on one
/// coordinate and is replicated together.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashDomain;

impl HashDomain {
    /// Coordinate of a gid.
    pub fn from_gid(gid: &str) -> u32 {
        let hash = blake3::hash(gid.as_bytes());
        let bytes: [u8; 4] = hash.as_bytes()[..4].try_into().expect("4 bytes");
        u32::from_le_bytes(bytes)
    }
}

impl ReplicationDomain for HashDomain {
    fn from_entry(&self, entry: &Entry) -> u32 {
        Self::from_gid(entry.gid())
    }

    /// Times wrap around the ring.
    fn from_time(&self, unix_ms: u64) -> u32 {
        (unix_ms % RING_SIZE) as u32
    }

    fn from_duration(&self, ms: u64) -> u32 {
        ms.min(u32::MAX as u64) as u32
    }
}

/// Places entries by write time: one coordinate per millisecond after
/// `origin_ms`, saturating at the end of the ring.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeDomain {
    origin_ms: u64,
}

impl TimeDomain {
    pub fn new(origin_ms: u64) -> Self {
        Self { origin_ms }
    }

    pub fn origin_ms(&self) -> u64 {
        self.origin_ms
    }
}

impl ReplicationDomain for TimeDomain {
    fn from_entry(&self, entry: &Entry) -> u32 {
        self.from_time(entry.timestamp().wall_time / 1_000_000)
    }

    fn from_time(&self, unix_ms: u64) -> u32 {
        unix_ms
            .saturating_sub(self.origin_ms)
            .min(u32::MAX as u64) as u32
    }

    fn from_duration(&self, ms: u64) -> u32 {
        ms.min(u32::MAX as u64) as u32
    }
}

/// Build the configured domain.
pub fn from_config(section: &ReplicationSection) -> Arc<dyn ReplicationDomain> {
    match section.domain {
        DomainKind::Hash => Arc::new(HashDomain),
        DomainKind::Time => Arc::new(TimeDomain::new(section.time_origin_ms)),
    }
}
