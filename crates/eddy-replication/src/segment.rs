//! Replication segments: claimed arcs of the coordinate ring.

use eddy_types::{PeerId, SegmentId};
use serde::{Deserialize, Serialize};

use crate::domain::RING_SIZE;
use crate::error::ReplicationError;

/// An arc `[offset, offset + width)` of the ring claimed by one replicator.
///
/// `width` ranges from 0 (claims nothing) to [`RING_SIZE`] (the whole
/// ring), so it needs more than 32 bits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicationSegment {
    pub id: SegmentId,
    pub owner: PeerId,
    pub offset: u32,
    pub width: u64,
    /// Registration time, ms since the Unix epoch.
    pub created_at: u64,
}

impl ReplicationSegment {
    /// A segment with a fresh random id registered now.
    pub fn new(owner: PeerId, offset: u32, width: u64) -> Self {
        Self::with_id(
            SegmentId::from(rand::random::<[u8; 32]>()),
            owner,
            offset,
            width,
            eddy_types::unix_millis(),
        )
    }

    pub fn with_id(id: SegmentId, owner: PeerId, offset: u32, width: u64, created_at: u64) -> Self {
        Self {
            id,
            owner,
            offset,
            width: width.min(RING_SIZE),
            created_at,
        }
    }

    /// The whole ring.
    pub fn full(owner: PeerId) -> Self {
        Self::new(owner, 0, RING_SIZE)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0
    }

    /// Whether `coordinate` lies on this arc.
    pub fn contains(&self, coordinate: u32) -> bool {
        clockwise(self.offset, coordinate) < self.width
    }

    /// Whether this arc shares at least one point with `[start, start + width)`.
    pub fn overlaps(&self, start: u32, width: u64) -> bool {
        if self.width == 0 || width == 0 {
            return false;
        }
        clockwise(self.offset, start) < self.width || clockwise(start, self.offset) < width
    }

    /// Ring distance from the arc to `coordinate`; zero when contained.
    pub fn distance(&self, coordinate: u32) -> u64 {
        if self.width == 0 {
            return RING_SIZE;
        }
        if self.contains(coordinate) {
            return 0;
        }
        let last = ((self.offset as u64 + self.width - 1) % RING_SIZE) as u32;
        clockwise(coordinate, self.offset).min(clockwise(last, coordinate))
    }

    /// Whether the segment has existed for at least `role_age_ms` at `now_ms`.
    pub fn is_mature(&self, now_ms: u64, role_age_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at) >= role_age_ms
    }
}

/// Clockwise distance from `from` to `to`.
pub fn clockwise(from: u32, to: u32) -> u64 {
    to.wrapping_sub(from) as u64
}

/// What a replicator wants to claim.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationSpec {
    /// An explicit arc.
    Range { offset: u32, width: u64 },
    /// A fraction of the ring in `[0, 1]`, starting at `offset` or at a
    /// point derived from the owner's id.
    Factor { factor: f64, offset: Option<u32> },
    /// The largest span no other replicator claims, or the whole ring when
    /// there are no other replicators.
    FillRemaining,
    /// One single-point segment per entry coordinate.
    Entries(Vec<u32>),
}

impl ReplicationSpec {
    /// Turn this request into concrete segments for `owner`, given the segments
    /// other replicators currently claim.
    pub fn resolve(
        &self,
        owner: PeerId,
        others: &[ReplicationSegment],
    ) -> Result<Vec<ReplicationSegment>, ReplicationError> {
        match self {
            ReplicationSpec::Range { offset, width } => {
                Ok(vec![ReplicationSegment::new(owner, *offset, *width)])
            }
            ReplicationSpec::Factor { factor, offset } => {
                let width = factor_width(*factor)?;
                let offset = offset.unwrap_or_else(|| owner_offset(&owner));
                Ok(vec![ReplicationSegment::new(owner, offset, width)])
            }
            ReplicationSpec::FillRemaining => Ok(vec![fill_remaining(owner, others)]),
            ReplicationSpec::Entries(coordinates) => {
                let mut coordinates = coordinates.clone();
                coordinates.sort_unstable();
                coordinates.dedup();
                Ok(coordinates
                    .into_iter()
                    .map(|c| ReplicationSegment::new(owner, c, 1))
                    .collect())
            }
        }
    }
}

fn factor_width(factor: f64) -> Result<u64, ReplicationError> {
    if !factor.is_finite() || !(0.0..=1.0).contains(&factor) {
        return Err(ReplicationError::InvalidSpec(format!(
            "factor {factor} is outside [0, 1]"
        )));
    }
    Ok((factor * RING_SIZE as f64).round() as u64)
}

/// Default start of an owner's segment, spread by owner id.
pub fn owner_offset(owner: &PeerId) -> u32 {
    let bytes: [u8; 4] = owner.as_bytes()[..4].try_into().expect("4 bytes");
    u32::from_le_bytes(bytes)
}

/// Claim the largest arc nobody else covers.
fn fill_remaining(owner: PeerId, others: &[ReplicationSegment]) -> ReplicationSegment {
    let mut covered: Vec<(u64, u64)> = Vec::new();
    let mut peers: Vec<PeerId> = Vec::new();
    for s in others.iter().filter(|s| s.owner != owner && !s.is_empty()) {
        if !peers.contains(&s.owner) {
            peers.push(s.owner);
        }
        let start = s.offset as u64;
        let end = start + s.width;
        if end > RING_SIZE {
            covered.push((start, RING_SIZE));
            covered.push((0, end - RING_SIZE));
        } else {
            covered.push((start, end));
        }
    }

    if covered.is_empty() {
        return ReplicationSegment::full(owner);
    }

    covered.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(covered.len());
    for (start, end) in covered {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }

    // Gaps between consecutive covered runs, plus the one across zero.
    let mut best: Option<(u64, u64)> = None;
    for pair in merged.windows(2) {
        let gap = (pair[0].1, pair[1].0 - pair[0].1);
        if best.map_or(true, |b| gap.1 > b.1) {
            best = Some(gap);
        }
    }
    let first = merged[0];
    let last = merged[merged.len() - 1];
    let wrap = (last.1 % RING_SIZE, RING_SIZE - last.1 + first.0);
    if best.map_or(true, |b| wrap.1 > b.1) {
        best = Some(wrap);
    }

    match best {
        Some((start, width)) if width > 0 => ReplicationSegment::new(owner, start as u32, width),
        _ => {
            let share = RING_SIZE / (peers.len() as u64 + 1);
            ReplicationSegment::new(owner, owner_offset(&owner), share)
        }
    }
}
