//! TOML configuration for an eddy peer.
//!
//! Every section has defaults, so an empty document (or no file at all)
//! yields a working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Errors produced while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The document is not valid TOML for [`EddyConfig`].
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EddyConfig {
    /// Hybrid logical clock bounds.
    pub clock: ClockSection,
    /// Replication factor, domain and role maturity.
    pub replication: ReplicationSection,
    /// Gossip batching and in-flight bookkeeping.
    pub sync: SyncSection,
    /// Optional bounded retention.
    pub trim: Option<TrimSection>,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[clock]` section. Zero disables a bound.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClockSection {
    /// Largest accepted distance (ns) between a received timestamp and local wall time.
    pub max_offset_ns: u64,
    /// Largest accepted forward jump (ns) of a produced timestamp past local wall time.
    pub tolerated_forward_jump_ns: u64,
    /// Upper bound for any wall time the clock may produce or accept.
    pub max_wall_time_ns: u64,
}

impl Default for ClockSection {
    fn default() -> Self {
        Self {
            max_offset_ns: 0,
            tolerated_forward_jump_ns: 0,
            max_wall_time_ns: u64::MAX,
        }
    }
}

/// Which replication domain maps entries onto the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainKind {
    /// Coordinates derived from the hash of the entry's gid.
    Hash,
    /// Coordinates derived from the entry's wall time.
    Time,
}

/// `[replication]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReplicationSection {
    /// Number of replicators responsible for each entry.
    pub replicas: usize,
    /// How long a segment must exist before its owner counts as mature.
    pub time_until_role_maturity_ms: u64,
    /// Active replication domain.
    pub domain: DomainKind,
    /// Origin (ms since epoch) of the time domain.
    pub time_origin_ms: u64,
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            replicas: 2,
            time_until_role_maturity_ms: 60_000,
            domain: DomainKind::Hash,
            time_origin_ms: 0,
        }
    }
}

impl ReplicationSection {
    /// Maturity period as a [`Duration`].
    pub fn time_until_role_maturity(&self) -> Duration {
        Duration::from_millis(self.time_until_role_maturity_ms)
    }
}

/// `[sync]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    /// Window during which outgoing heads are batched per destination.
    pub debounce_ms: u64,
    /// After this long an unanswered sync request no longer blocks others.
    pub in_flight_ttl_ms: u64,
    /// Largest encoded message accepted from the transport.
    pub max_message_size: usize,
    /// How long a join waits for entries it had to request from peers.
    pub fetch_timeout_ms: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            debounce_ms: 25,
            in_flight_ttl_ms: 30_000,
            max_message_size: 8 * 1024 * 1024,
            fetch_timeout_ms: 5_000,
        }
    }
}

impl SyncSection {
    /// Debounce window as a [`Duration`].
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// In-flight expiry as a [`Duration`].
    pub fn in_flight_ttl(&self) -> Duration {
        Duration::from_millis(self.in_flight_ttl_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Retention condition kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrimKind {
    /// Bound the number of entries.
    Length,
    /// Bound the serialized size of all entries.
    Bytelength,
    /// Bound the age of entries.
    Time,
}

/// `[trim]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TrimSection {
    /// Condition kind.
    pub kind: TrimKind,
    /// Target size after trimming (`length`, `bytelength`).
    #[serde(default)]
    pub to: Option<u64>,
    /// Size that triggers trimming; defaults to `to`.
    #[serde(default)]
    pub from: Option<u64>,
    /// Maximum entry age (`time`).
    #[serde(default)]
    pub max_age_ms: Option<u64>,
}

/// `[log]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl EddyConfig {
    /// Load config from a TOML file, or use defaults if no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p).map_err(|source| ConfigError::Io {
                    path: p.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&content)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }
}
