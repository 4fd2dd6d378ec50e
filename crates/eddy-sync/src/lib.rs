//! Replication of eddy logs between peers.
//!
//! A [`SharedLog`] binds a [`eddy_log::Log`] to a [`Transport`] and a
//! [`eddy_replication::ReplicationIndex`]:
//!
//! - local appends are gossiped as [`SyncMessage::ExchangeHeads`], batched
//!   per destination within a debounce window;
//! - before pulling entries, peers negotiate what is still needed with
//!   [`SyncMessage::RequestMaybeSync`] and its coordinate variant, and an
//!   in-flight table keeps two peers from delivering the same entry;
//! - replicators announce their segments, and membership changes surface
//!   as events on the log's [`eddy_types::events::EventBus`];
//! - a configured retention never drops entries the local peer still leads
//!   or that no mature replicator holds yet.

mod batcher;
mod error;
mod in_flight;
mod membership;
mod message;
mod retention;
mod shared_log;
mod transport;

#[cfg(test)]
mod tests;

pub use error::SyncError;
pub use message::SyncMessage;
pub use shared_log::{CoverOptions, SharedJoinOptions, SharedLog, SharedLogOptions, WaitOptions};
pub use transport::{MemoryNetwork, MemoryTransport, Transport, TransportEvent, TransportEvents};
