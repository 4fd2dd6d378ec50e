//! Coverage queries and deterministic leader selection.
//!
//! Leaders for a coordinate are chosen from one snapshot of the
//! [`ReplicationIndex`] with no randomness, so every peer holding the same
//! snapshot elects the same set without talking to anyone.
//!
//! Selection places `replicas` sample points evenly around the ring, the
//! first at the coordinate itself. For each point, segments are ranked by
//!
//! 1. maturity (mature before immature),
//! 2. ring distance from the segment to the point (0 when contained),
//! 3. clockwise offset from the segment start to the point,
//! 4. owner id,
//!
//! and the best ranked owner not already chosen is taken. When points run
//! out of fresh owners, the remaining slots are filled with the best ranked
//! unchosen owners relative to the coordinate.

use std::collections::BTreeMap;

use eddy_types::PeerId;

use crate::domain::RING_SIZE;
use crate::error::ReplicationError;
use crate::index::{ReplicationIndex, SegmentQuery};
use crate::segment::{clockwise, ReplicationSegment};

/// Part of the ring a coverage query is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverRange {
    /// The whole ring.
    Full,
    /// `[start, start + width)`.
    Range { start: u32, width: u64 },
    /// A single coordinate.
    Point(u32),
}

impl CoverRange {
    fn bounds(self) -> (u32, u64) {
        match self {
            CoverRange::Full => (0, RING_SIZE),
            CoverRange::Range { start, width } => (start, width.min(RING_SIZE)),
            CoverRange::Point(c) => (c, 1),
        }
    }
}

/// Owners whose segments intersect `range` and have existed for at least
/// `role_age_ms` at `now_ms`, sorted by owner id.
pub fn get_cover(
    index: &ReplicationIndex,
    range: CoverRange,
    role_age_ms: u64,
    now_ms: u64,
) -> Result<Vec<PeerId>, ReplicationError> {
    let (start, width) = range.bounds();
    let query = SegmentQuery::all()
        .non_empty()
        .intersecting(start, width)
        .mature_at(now_ms, role_age_ms);
    Ok(index.owners(&query)?.into_iter().collect())
}

type Rank = (bool, u64, u64, PeerId);

fn rank(segment: &ReplicationSegment, point: u32, mature: bool) -> Rank {
    (
        !mature,
        segment.distance(point),
        clockwise(segment.offset, point),
        segment.owner,
    )
}

/// The `replicas` owners responsible for `coordinate`, in selection order.
///
/// Returns fewer owners when fewer replicators exist.
pub fn select_leaders(
    index: &ReplicationIndex,
    coordinate: u32,
    replicas: usize,
    role_age_ms: u64,
    now_ms: u64,
) -> Result<Vec<PeerId>, ReplicationError> {
    let segments = index.iterate(&SegmentQuery::all().non_empty())?;
    Ok(select_from(&segments, coordinate, replicas, role_age_ms, now_ms))
}

/// [`select_leaders`] over an explicit snapshot.
pub fn select_from(
    segments: &[ReplicationSegment],
    coordinate: u32,
    replicas: usize,
    role_age_ms: u64,
    now_ms: u64,
) -> Vec<PeerId> {
    let candidates: Vec<(&ReplicationSegment, bool)> = segments
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| (s, s.is_mature(now_ms, role_age_ms)))
        .collect();
    if candidates.is_empty() || replicas == 0 {
        return Vec::new();
    }

    let mut chosen: Vec<PeerId> = Vec::with_capacity(replicas);
    let step = RING_SIZE / replicas as u64;

    for i in 0..replicas as u64 {
        let point = ((coordinate as u64 + i * step) % RING_SIZE) as u32;
        let best = candidates
            .iter()
            .filter(|(s, _)| !chosen.contains(&s.owner))
            .map(|(s, mature)| rank(s, point, *mature))
            .min();
        match best {
            Some(best) => chosen.push(best.3),
            None => break,
        }
    }

    if chosen.len() < replicas {
        // Best rank per remaining owner relative to the coordinate.
        let mut remaining: BTreeMap<PeerId, Rank> = BTreeMap::new();
        for (s, mature) in &candidates {
            if chosen.contains(&s.owner) {
                continue;
            }
            let r = rank(s, coordinate, *mature);
            remaining
                .entry(s.owner)
                .and_modify(|current| {
                    if r < *current {
                        *current = r;
                    }
                })
                .or_insert(r);
        }
        let mut ranked: Vec<Rank> = remaining.into_values().collect();
        ranked.sort();
        chosen.extend(ranked.into_iter().take(replicas - chosen.len()).map(|r| r.3));
    }

    chosen
}
