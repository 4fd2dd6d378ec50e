//! Replication responsibility for eddy logs.
//!
//! Entries are mapped onto a ring of `u32` coordinates by a
//! [`ReplicationDomain`]. Replicators claim arcs of the ring
//! ([`ReplicationSegment`]), recorded per peer in a [`ReplicationIndex`].
//! [`get_cover`] answers which mature replicators serve a range, and
//! [`select_leaders`] deterministically picks the replicators responsible
//! for a coordinate.

mod cover;
mod domain;
mod error;
mod index;
mod segment;

pub use cover::{get_cover, select_from, select_leaders, CoverRange};
pub use domain::{from_config, HashDomain, ReplicationDomain, TimeDomain, RING_SIZE};
pub use error::ReplicationError;
pub use index::{ReplicationIndex, SegmentQuery};
pub use segment::{clockwise, owner_offset, ReplicationSegment, ReplicationSpec};
