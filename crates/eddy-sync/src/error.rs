//! Error types for the sync layer.

use eddy_log::LogError;
use eddy_replication::ReplicationError;
use eddy_types::PeerId;

/// Errors that can occur while synchronizing a shared log.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The underlying log rejected the operation.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// Replication index or spec failure.
    #[error("replication error: {0}")]
    Replication(#[from] ReplicationError),

    /// The destination peer is not connected.
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),

    /// A message could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An encoded message exceeds the configured limit.
    #[error("message of {size} bytes exceeds limit of {max} bytes")]
    MessageTooLarge {
        /// Encoded size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// A wait did not complete before its deadline.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The caller's abort signal fired.
    #[error("aborted")]
    Aborted,

    /// The shared log has been closed.
    #[error("shared log is closed")]
    Closed,
}

impl From<postcard::Error> for SyncError {
    fn from(e: postcard::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
