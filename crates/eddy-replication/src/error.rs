//! Error types for the replication crate.

/// Errors that can occur while managing replication segments.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// Segment index backend failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Encoding or decoding failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A replication spec cannot be turned into segments.
    #[error("invalid replication spec: {0}")]
    InvalidSpec(String),
}

impl From<postcard::Error> for ReplicationError {
    fn from(e: postcard::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
