//! Shared types and identifiers for eddy.
//!
//! This crate defines the identifiers used across the workspace
//! ([`EntryHash`], [`PeerId`], [`SegmentId`]), the typed intra-peer
//! [`events::EventBus`], TOML [`config`] and tracing initialisation
//! ([`telemetry`]).

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod config;
pub mod events;
pub mod telemetry;

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create an ID by hashing arbitrary data with BLAKE3.
            pub fn from_data(data: &[u8]) -> Self {
                Self(blake3::hash(data).into())
            }

            /// Return the raw 32-byte representation.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// First eight bytes interpreted as a little-endian number.
            pub fn number(&self) -> u64 {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&self.0[..8]);
                u64::from_le_bytes(buf)
            }

            /// Abbreviated hex form for log output.
            pub fn fmt_short(&self) -> String {
                self.to_string()[..10].to_string()
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.fmt_short())
            }
        }
    };
}

define_id!(
    /// Content address of a fully signed entry: `blake3(serialized_entry)`.
    EntryHash
);

define_id!(
    /// Identifier of a peer: `blake3(public_key_bytes)`.
    PeerId
);

define_id!(
    /// Identifier of a replication segment, unique per owner.
    SegmentId
);

/// Milliseconds since the Unix epoch, saturating to zero on clock skew.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Nanoseconds since the Unix epoch, saturating to zero on clock skew.
pub fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
