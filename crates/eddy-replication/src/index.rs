//! Persistent record of which ring segments each replicator claims
//! (Fjall disk or pure in-memory).
//!
//! Segments are keyed by `owner ++ segment id`, so all segments of one
//! owner are a contiguous prefix.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, RwLock};

use eddy_types::{PeerId, SegmentId};
use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use tempfile::TempDir;
use tracing::debug;

use crate::error::ReplicationError;
use crate::segment::ReplicationSegment;

type Result<T> = std::result::Result<T, ReplicationError>;

fn storage_err(e: impl std::fmt::Display) -> ReplicationError {
    ReplicationError::Storage(e.to_string())
}

fn key(owner: &PeerId, id: &SegmentId) -> [u8; 64] {
    let mut out = [0u8; 64];
    out[..32].copy_from_slice(owner.as_bytes());
    out[32..].copy_from_slice(id.as_bytes());
    out
}

/// Filter for [`ReplicationIndex::iterate`], [`ReplicationIndex::count`]
/// and [`ReplicationIndex::sum`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentQuery {
    pub owner: Option<PeerId>,
    /// Segment must contain this coordinate.
    pub containing: Option<u32>,
    /// Segment must intersect `[start, start + width)`.
    pub intersecting: Option<(u32, u64)>,
    /// Segment must have existed for `role_age_ms` at `now_ms`: `(now_ms, role_age_ms)`.
    pub mature_at: Option<(u64, u64)>,
    /// Exclude zero-width segments.
    pub non_empty: bool,
}

impl SegmentQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn owner(mut self, owner: PeerId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn containing(mut self, coordinate: u32) -> Self {
        self.containing = Some(coordinate);
        self
    }

    pub fn intersecting(mut self, start: u32, width: u64) -> Self {
        self.intersecting = Some((start, width));
        self
    }

    pub fn mature_at(mut self, now_ms: u64, role_age_ms: u64) -> Self {
        self.mature_at = Some((now_ms, role_age_ms));
        self
    }

    pub fn non_empty(mut self) -> Self {
        self.non_empty = true;
        self
    }

    pub fn matches(&self, segment: &ReplicationSegment) -> bool {
        if self.owner.is_some_and(|o| o != segment.owner) {
            return false;
        }
        if self.non_empty && segment.is_empty() {
            return false;
        }
        if self.containing.is_some_and(|c| !segment.contains(c)) {
            return false;
        }
        if let Some((start, width)) = self.intersecting {
            if !segment.overlaps(start, width) {
                return false;
            }
        }
        if let Some((now, age)) = self.mature_at {
            if !segment.is_mature(now, age) {
                return false;
            }
        }
        true
    }
}

enum Backend {
    Fjall {
        #[allow(dead_code)]
        db: Database,
        segments: Keyspace,
        _tmp: Option<TempDir>,
    },
    Memory(RwLock<BTreeMap<[u8; 64], ReplicationSegment>>),
}

/// The segment index. Cloning yields another handle to the same index.
#[derive(Clone)]
pub struct ReplicationIndex {
    backend: Arc<Backend>,
}

impl ReplicationIndex {
    /// Open a persistent index at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open().map_err(storage_err)?;
        Self::init_fjall(db, None)
    }

    /// Open a Fjall index in a scratch directory removed on drop.
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir().map_err(storage_err)?;
        let db = Database::builder(tmp.path())
            .temporary(true)
            .open()
            .map_err(storage_err)?;
        Self::init_fjall(db, Some(tmp))
    }

    /// Create a pure in-memory index.
    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(Backend::Memory(RwLock::new(BTreeMap::new()))),
        }
    }

    fn init_fjall(db: Database, tmp: Option<TempDir>) -> Result<Self> {
        let segments = db
            .keyspace("segments", KeyspaceCreateOptions::default)
            .map_err(storage_err)?;
        Ok(Self {
            backend: Arc::new(Backend::Fjall {
                db,
                segments,
                _tmp: tmp,
            }),
        })
    }

    /// Insert or replace a segment. Returns the previous version.
    pub fn put(&self, segment: &ReplicationSegment) -> Result<Option<ReplicationSegment>> {
        let previous = self.get(&segment.owner, &segment.id)?;
        let k = key(&segment.owner, &segment.id);
        match self.backend.as_ref() {
            Backend::Fjall { segments, .. } => {
                let bytes = postcard::to_allocvec(segment)?;
                segments.insert(k, bytes).map_err(storage_err)?;
            }
            Backend::Memory(m) => {
                m.write().unwrap().insert(k, segment.clone());
            }
        }
        debug!(owner = %segment.owner.fmt_short(), offset = segment.offset, width = segment.width, "put segment");
        Ok(previous)
    }

    pub fn get(&self, owner: &PeerId, id: &SegmentId) -> Result<Option<ReplicationSegment>> {
        let k = key(owner, id);
        match self.backend.as_ref() {
            Backend::Fjall { segments, .. } => match segments.get(k).map_err(storage_err)? {
                Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
                None => Ok(None),
            },
            Backend::Memory(m) => Ok(m.read().unwrap().get(&k).cloned()),
        }
    }

    /// Remove one segment, returning it if it existed.
    pub fn del(&self, owner: &PeerId, id: &SegmentId) -> Result<Option<ReplicationSegment>> {
        let previous = self.get(owner, id)?;
        if previous.is_some() {
            let k = key(owner, id);
            match self.backend.as_ref() {
                Backend::Fjall { segments, .. } => {
                    segments.remove(k).map_err(storage_err)?;
                }
                Backend::Memory(m) => {
                    m.write().unwrap().remove(&k);
                }
            }
        }
        Ok(previous)
    }

    /// Remove every segment of `owner`, returning them.
    pub fn del_owner(&self, owner: &PeerId) -> Result<Vec<ReplicationSegment>> {
        let removed = self.by_owner(owner)?;
        for segment in &removed {
            self.del(owner, &segment.id)?;
        }
        Ok(removed)
    }

    /// Segments of one owner.
    pub fn by_owner(&self, owner: &PeerId) -> Result<Vec<ReplicationSegment>> {
        match self.backend.as_ref() {
            Backend::Fjall { segments, .. } => {
                let mut result = Vec::new();
                for guard in segments.prefix(owner.as_bytes()) {
                    let (_, value) = guard.into_inner().map_err(storage_err)?;
                    result.push(postcard::from_bytes(&value)?);
                }
                Ok(result)
            }
            Backend::Memory(m) => {
                let mut lower = [0u8; 64];
                lower[..32].copy_from_slice(owner.as_bytes());
                let mut upper = [0xffu8; 64];
                upper[..32].copy_from_slice(owner.as_bytes());
                Ok(m.read()
                    .unwrap()
                    .range(lower..=upper)
                    .map(|(_, s)| s.clone())
                    .collect())
            }
        }
    }

    /// Segments matching `query`, ordered by owner then segment id.
    pub fn iterate(&self, query: &SegmentQuery) -> Result<Vec<ReplicationSegment>> {
        if let Some(owner) = query.owner {
            return Ok(self
                .by_owner(&owner)?
                .into_iter()
                .filter(|s| query.matches(s))
                .collect());
        }
        match self.backend.as_ref() {
            Backend::Fjall { segments, .. } => {
                let mut result = Vec::new();
                for guard in segments.iter() {
                    let (_, value) = guard.into_inner().map_err(storage_err)?;
                    let segment: ReplicationSegment = postcard::from_bytes(&value)?;
                    if query.matches(&segment) {
                        result.push(segment);
                    }
                }
                Ok(result)
            }
            Backend::Memory(m) => Ok(m
                .read()
                .unwrap()
                .values()
                .filter(|s| query.matches(s))
                .cloned()
                .collect()),
        }
    }

    pub fn count(&self, query: &SegmentQuery) -> Result<usize> {
        Ok(self.iterate(query)?.len())
    }

    /// Total width of matching segments.
    pub fn sum(&self, query: &SegmentQuery) -> Result<u64> {
        Ok(self.iterate(query)?.iter().map(|s| s.width).sum())
    }

    /// Distinct owners of matching segments.
    pub fn owners(&self, query: &SegmentQuery) -> Result<BTreeSet<PeerId>> {
        Ok(self.iterate(query)?.into_iter().map(|s| s.owner).collect())
    }

    /// Reset `created_at` of every segment of `owner` to `now_ms`, so role
    /// age counts from now. Returns the updated segments.
    pub fn restamp_owner(&self, owner: &PeerId, now_ms: u64) -> Result<Vec<ReplicationSegment>> {
        let mut updated = self.by_owner(owner)?;
        for segment in &mut updated {
            segment.created_at = now_ms;
            self.put(segment)?;
        }
        Ok(updated)
    }
}
