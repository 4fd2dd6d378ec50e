//! Protocol messages exchanged between peers sharing a log.
//!
//! Every message is a single postcard-encoded [`SyncMessage`].

use bytes::Bytes;
use eddy_replication::ReplicationSegment;
use eddy_types::EntryHash;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Messages of the head exchange and need-negotiation protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Signed entry blocks the sender believes the receiver should hold.
    ///
    /// Receivers recompute every hash from the block, so a peer cannot
    /// smuggle an entry under a foreign address.
    ExchangeHeads {
        /// Encoded entries, parents before children.
        heads: Vec<Vec<u8>>,
    },

    /// Segments the sender started replicating, in addition to its
    /// existing ones.
    AddedReplicationSegments {
        /// The new segments.
        segments: Vec<ReplicationSegment>,
    },

    /// The complete set of segments the sender replicates. An empty list
    /// means the sender no longer replicates anything.
    AllReplicatingSegments {
        /// Every segment of the sender.
        segments: Vec<ReplicationSegment>,
    },

    /// Ask the receiver to answer with [`SyncMessage::AllReplicatingSegments`].
    RequestReplicationInfo,

    /// "Do you still need these entries?"
    RequestMaybeSync {
        /// Offered entry hashes.
        hashes: Vec<EntryHash>,
    },

    /// "Yes, send me these entries (and what they depend on)."
    ResponseMaybeSync {
        /// Entry hashes the sender lacks.
        hashes: Vec<EntryHash>,
    },

    /// Compact form of [`SyncMessage::RequestMaybeSync`] using entry numbers
    /// (the first eight bytes of each hash).
    RequestMaybeSyncCoordinate {
        /// Offered entry numbers.
        numbers: Vec<u64>,
    },

    /// Compact form of [`SyncMessage::ResponseMaybeSync`].
    ResponseMaybeSyncCoordinate {
        /// Entry numbers the sender lacks.
        numbers: Vec<u64>,
    },
}

impl SyncMessage {
    /// Encode with postcard.
    pub fn encode(&self) -> Result<Bytes, SyncError> {
        Ok(Bytes::from(postcard::to_allocvec(self)?))
    }

    /// Decode a postcard payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        Ok(postcard::from_bytes(bytes)?)
    }

    /// Short name for log output.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::ExchangeHeads { .. } => "exchange-heads",
            SyncMessage::AddedReplicationSegments { .. } => "added-segments",
            SyncMessage::AllReplicatingSegments { .. } => "all-segments",
            SyncMessage::RequestReplicationInfo => "request-replication-info",
            SyncMessage::RequestMaybeSync { .. } => "request-maybe-sync",
            SyncMessage::ResponseMaybeSync { .. } => "response-maybe-sync",
            SyncMessage::RequestMaybeSyncCoordinate { .. } => "request-maybe-sync-coordinate",
            SyncMessage::ResponseMaybeSyncCoordinate { .. } => "response-maybe-sync-coordinate",
        }
    }
}
