//! Error types for the log crate.

use eddy_types::EntryHash;

/// Hybrid logical clock failures.
///
/// These abort the single operation that triggered them and never modify
/// the clock's last observed timestamp.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClockError {
    /// A received timestamp is further ahead of local wall time than allowed.
    #[error("received timestamp is {offset}ns ahead of wall time (max offset {max_offset}ns)")]
    ClockOffset {
        /// Observed distance in nanoseconds.
        offset: u64,
        /// Configured limit in nanoseconds.
        max_offset: u64,
    },

    /// The clock would have to run further ahead of wall time than tolerated.
    #[error("clock would jump {jump}ns past wall time (tolerated {tolerated}ns)")]
    ForwardJump {
        /// Distance in nanoseconds.
        jump: u64,
        /// Configured limit in nanoseconds.
        tolerated: u64,
    },

    /// The resulting wall time exceeds the configured upper bound.
    #[error("wall time {wall_time} exceeds maximum {max_wall_time}")]
    WallTimeOverflow {
        /// Offending wall time.
        wall_time: u64,
        /// Configured bound.
        max_wall_time: u64,
    },
}

/// Errors from block storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend failed.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A stored block does not hash to the address it was requested under.
    #[error("block {expected} is corrupt (hashes to {actual})")]
    Corrupt {
        /// Address that was requested.
        expected: EntryHash,
        /// Hash of the bytes actually found.
        actual: EntryHash,
    },
}

/// Errors that can occur during log operations.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Signature verification failed or a policy rejected the entry.
    #[error("access error: {0}")]
    Access(String),

    /// The hybrid logical clock refused to advance.
    #[error("clock error: {0}")]
    Clock(#[from] ClockError),

    /// A predecessor does not causally precede the entry.
    #[error("next {next} must happen before entry")]
    NextNotBefore {
        /// The offending predecessor.
        next: EntryHash,
    },

    /// An explicitly requested predecessor is not in the log.
    #[error("unknown next {next}")]
    UnknownNext {
        /// The missing predecessor.
        next: EntryHash,
    },

    /// The log has been closed.
    #[error("log is closed")]
    Closed,

    /// Block storage failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Encoding or decoding failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An identity could not produce a signature.
    #[error("signing failed: {0}")]
    Signing(String),

    /// Trim options are incomplete or inconsistent.
    #[error("invalid trim options: {0}")]
    InvalidTrim(String),
}

impl From<postcard::Error> for LogError {
    fn from(e: postcard::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
