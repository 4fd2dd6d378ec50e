//! Hybrid logical clock.
//!
//! Timestamps combine a wall time in nanoseconds with a logical counter.
//! [`HybridLogicalClock`] hands out strictly increasing timestamps and merges
//! timestamps observed on remote entries, refusing to follow peers whose
//! clocks are too far ahead.

use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, Mutex};

use eddy_types::config::ClockSection;
use serde::{Deserialize, Serialize};

use crate::error::ClockError;

/// A point in hybrid logical time, ordered by `(wall_time, logical)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Wall time in nanoseconds since the Unix epoch.
    pub wall_time: u64,
    /// Tie-break counter within one wall time.
    pub logical: u32,
}

impl Timestamp {
    /// Create a timestamp.
    pub fn new(wall_time: u64, logical: u32) -> Self {
        Self { wall_time, logical }
    }

    /// Total order over timestamps.
    pub fn compare(a: &Timestamp, b: &Timestamp) -> Ordering {
        a.cmp(b)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.wall_time, self.logical)
    }
}

/// A writer's clock reading: timestamp plus the writer's public key bytes.
///
/// Ordered by timestamp, ties broken by lexicographic comparison of `id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Clock {
    /// Writer public key bytes.
    pub id: Vec<u8>,
    /// Hybrid logical time of the write.
    pub timestamp: Timestamp,
}

impl Clock {
    /// Create a clock reading.
    pub fn new(id: Vec<u8>, timestamp: Timestamp) -> Self {
        Self { id, timestamp }
    }

    /// Total order over clocks.
    pub fn compare(a: &Clock, b: &Clock) -> Ordering {
        a.cmp(b)
    }
}

impl Ord for Clock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Clock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Bounds enforced by the clock. Zero disables `max_offset` and
/// `tolerated_forward_jump`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HlcConfig {
    /// Largest accepted lead (ns) of a received timestamp over wall time.
    pub max_offset: u64,
    /// Largest accepted lead (ns) of a produced timestamp over wall time.
    pub tolerated_forward_jump: u64,
    /// No timestamp may carry a wall time above this.
    pub max_wall_time: u64,
}

impl Default for HlcConfig {
    fn default() -> Self {
        Self {
            max_offset: 0,
            tolerated_forward_jump: 0,
            max_wall_time: u64::MAX,
        }
    }
}

impl From<&ClockSection> for HlcConfig {
    fn from(section: &ClockSection) -> Self {
        Self {
            max_offset: section.max_offset_ns,
            tolerated_forward_jump: section.tolerated_forward_jump_ns,
            max_wall_time: section.max_wall_time_ns,
        }
    }
}

/// Source of physical time in nanoseconds.
pub type WallClock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Hybrid logical clock shared by everything that writes to one log.
pub struct HybridLogicalClock {
    config: HlcConfig,
    wall_clock: WallClock,
    last: Mutex<Timestamp>,
}

impl HybridLogicalClock {
    /// Create a clock reading the system wall time.
    pub fn new(config: HlcConfig) -> Self {
        Self::with_wall_clock(config, Arc::new(eddy_types::unix_nanos))
    }

    /// Create a clock with an explicit wall time source.
    pub fn with_wall_clock(config: HlcConfig, wall_clock: WallClock) -> Self {
        Self {
            config,
            wall_clock,
            last: Mutex::new(Timestamp::default()),
        }
    }

    /// Return a timestamp strictly greater than every one produced or observed so far.
    pub fn now(&self) -> Result<Timestamp, ClockError> {
        self.advance(None)
    }

    /// Merge a received timestamp and return the resulting local timestamp,
    /// which is strictly greater than `received`.
    pub fn update(&self, received: &Timestamp) -> Result<Timestamp, ClockError> {
        self.advance(Some(*received))
    }

    /// Current reading of the physical time source, in nanoseconds.
    pub fn wall_time(&self) -> u64 {
        (self.wall_clock)()
    }

    /// The most recent timestamp handed out.
    pub fn last(&self) -> Timestamp {
        *self.last.lock().expect("clock lock poisoned")
    }

    /// The timestamp [`now`](Self::now) or [`update`](Self::update) would
    /// return, without moving the clock. Pair with [`commit`](Self::commit)
    /// once the write it stamps is accepted.
    pub fn propose(&self, received: Option<&Timestamp>) -> Result<Timestamp, ClockError> {
        let last = *self.last.lock().expect("clock lock poisoned");
        self.next(last, received.copied())
    }

    /// Move the clock to at least `timestamp`.
    pub fn commit(&self, timestamp: Timestamp) {
        let mut last = self.last.lock().expect("clock lock poisoned");
        if timestamp > *last {
            *last = timestamp;
        }
    }

    fn advance(&self, received: Option<Timestamp>) -> Result<Timestamp, ClockError> {
        let mut last = self.last.lock().expect("clock lock poisoned");
        let next = self.next(*last, received)?;
        *last = next;
        Ok(next)
    }

    fn next(&self, last: Timestamp, received: Option<Timestamp>) -> Result<Timestamp, ClockError> {
        let physical = (self.wall_clock)();

        if let Some(r) = received {
            if r.wall_time > self.config.max_wall_time {
                return Err(ClockError::WallTimeOverflow {
                    wall_time: r.wall_time,
                    max_wall_time: self.config.max_wall_time,
                });
            }

            let offset = r.wall_time.saturating_sub(physical);
            if self.config.max_offset > 0 && offset > self.config.max_offset {
                return Err(ClockError::ClockOffset {
                    offset,
                    max_offset: self.config.max_offset,
                });
            }
        }

        let other = received.unwrap_or(last);
        let wall_time = last.wall_time.max(other.wall_time).max(physical);

        let logical = if wall_time == last.wall_time && wall_time == other.wall_time {
            last.logical.max(other.logical).checked_add(1)
        } else if wall_time == last.wall_time {
            last.logical.checked_add(1)
        } else if wall_time == other.wall_time {
            other.logical.checked_add(1)
        } else {
            Some(0)
        };

        // An exhausted counter carries into the wall time.
        let (wall_time, logical) = match logical {
            Some(logical) => (wall_time, logical),
            None => {
                let carried = wall_time.checked_add(1).ok_or(ClockError::WallTimeOverflow {
                    wall_time,
                    max_wall_time: self.config.max_wall_time,
                })?;
                (carried, 0)
            }
        };

        if wall_time > self.config.max_wall_time {
            return Err(ClockError::WallTimeOverflow {
                wall_time,
                max_wall_time: self.config.max_wall_time,
            });
        }

        let jump = wall_time.saturating_sub(physical);
        if self.config.tolerated_forward_jump > 0 && jump > self.config.tolerated_forward_jump {
            return Err(ClockError::ForwardJump {
                jump,
                tolerated: self.config.tolerated_forward_jump,
            });
        }

        Ok(Timestamp::new(wall_time, logical))
    }
}

impl fmt::Debug for HybridLogicalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridLogicalClock")
            .field("config", &self.config)
            .field("last", &self.last())
            .finish_non_exhaustive()
    }
}
