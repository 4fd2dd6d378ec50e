//! Signed, causally ordered, append-only DAG log.
//!
//! Every write is an [`Entry`]: a payload plus causal metadata (a hybrid
//! logical [`Clock`], a branch id and predecessor hashes), signed by one or
//! more identities and addressed by the blake3 hash of its signed form.
//! Entries form a Merkle DAG held by a [`Log`], which tracks heads and tails
//! and merges entries from other peers with [`Log::join`]. Concurrent
//! branches are kept, never serialized.
//!
//! Retention is bounded by [`TrimOptions`] (entry count, byte size or age).

mod clock;
mod entry;
mod error;
mod identity;
mod index;
mod log;
mod store;
mod trim;

#[cfg(test)]
mod tests;

pub use clock::{Clock, HlcConfig, HybridLogicalClock, Timestamp, WallClock};
pub use entry::{
    AppendPolicy, CreateEntry, Encoding, Entry, EntryType, Meta, Payload, ShallowEntry,
};
pub use error::{ClockError, LogError, StoreError};
pub use identity::{Ed25519Identity, Identity, PublicKey, SignatureWithKey};
pub use log::{
    AppendOptions, AppendResult, JoinItem, JoinOptions, JoinResult, Log, LogOptions,
};
pub use store::{BlockStore, Blocks};
pub use trim::{TrimCondition, TrimFilter, TrimOptions};
