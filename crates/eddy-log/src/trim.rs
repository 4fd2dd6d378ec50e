//! Bounded retention.
//!
//! A trim pass walks entries in clock order (oldest first) and deletes
//! them, together with their blocks, until the configured bound holds. An
//! optional [`TrimFilter`] protects entries that are still needed; it is
//! consulted once per gid per pass.
//!
//! Length and byte-length passes remember where they stopped, so steady
//! state trimming only visits entries added since the previous pass.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eddy_types::config::{TrimKind, TrimSection};
use tracing::debug;

use crate::entry::Entry;
use crate::error::LogError;
use crate::index::{EntryIndex, SortKey};
use crate::store::BlockStore;

/// What a trim pass must achieve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimCondition {
    /// Keep at most `to` entries once the log exceeds `from` (default `to`).
    Length { to: u64, from: Option<u64> },
    /// Keep at most `to` bytes of blocks once the log exceeds `from`.
    ByteLength { to: u64, from: Option<u64> },
    /// Drop entries whose wall time is older than `max_age`, measured
    /// against the log clock's wall time source.
    Time { max_age: Duration },
}

/// Protects entries from being trimmed.
#[async_trait]
pub trait TrimFilter: Send + Sync {
    /// Return `false` to keep `entry` (and, for this pass, every entry of its gid).
    async fn can_trim(&self, entry: &Entry) -> bool;

    /// Changes whenever earlier `can_trim` answers may no longer hold.
    fn cache_id(&self) -> Option<String> {
        None
    }
}

/// A trim condition plus optional filter.
#[derive(Clone)]
pub struct TrimOptions {
    pub condition: TrimCondition,
    pub filter: Option<Arc<dyn TrimFilter>>,
}

impl TrimOptions {
    /// Keep at most `to` entries.
    pub fn length(to: u64) -> Self {
        Self::new(TrimCondition::Length { to, from: None })
    }

    /// Keep at most `to` bytes.
    pub fn byte_length(to: u64) -> Self {
        Self::new(TrimCondition::ByteLength { to, from: None })
    }

    /// Keep entries younger than `max_age`.
    pub fn time(max_age: Duration) -> Self {
        Self::new(TrimCondition::Time { max_age })
    }

    pub fn new(condition: TrimCondition) -> Self {
        Self {
            condition,
            filter: None,
        }
    }

    /// Only start trimming once the measure exceeds `from`.
    pub fn with_from(mut self, from: u64) -> Self {
        match &mut self.condition {
            TrimCondition::Length { from: f, .. } | TrimCondition::ByteLength { from: f, .. } => {
                *f = Some(from);
            }
            TrimCondition::Time { .. } => {}
        }
        self
    }

    pub fn with_filter(mut self, filter: Arc<dyn TrimFilter>) -> Self {
        self.filter = Some(filter);
        self
    }
}

impl fmt::Debug for TrimOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrimOptions")
            .field("condition", &self.condition)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

impl TryFrom<&TrimSection> for TrimOptions {
    type Error = LogError;

    fn try_from(section: &TrimSection) -> Result<Self, Self::Error> {
        let to = || {
            section
                .to
                .ok_or_else(|| LogError::InvalidTrim("`to` is required".into()))
        };
        let options = match section.kind {
            TrimKind::Length => Self::length(to()?),
            TrimKind::Bytelength => Self::byte_length(to()?),
            TrimKind::Time => {
                let max_age = section
                    .max_age_ms
                    .ok_or_else(|| LogError::InvalidTrim("`max_age_ms` is required".into()))?;
                Self::time(Duration::from_millis(max_age))
            }
        };
        Ok(match section.from {
            Some(from) => options.with_from(from),
            None => options,
        })
    }
}

/// Where the previous bounded pass stopped, and under which options.
struct Cursor {
    key: SortKey,
    kind: mem::Discriminant<TrimCondition>,
    to: u64,
    cache_id: Option<String>,
}

/// Trim state owned by one log. Passes run through `&mut self`, so they
/// are serialized with every other log mutation.
#[derive(Default)]
pub(crate) struct Trimmer {
    cursor: Option<Cursor>,
}

impl Trimmer {
    pub(crate) async fn run(
        &mut self,
        index: &mut EntryIndex,
        store: &dyn BlockStore,
        options: &TrimOptions,
        now: u64,
    ) -> Result<Vec<Entry>, LogError> {
        match options.condition {
            TrimCondition::Time { max_age } => {
                self.cursor = None;
                trim_by_age(index, store, options, max_age, now).await
            }
            TrimCondition::Length { to, from } | TrimCondition::ByteLength { to, from } => {
                self.trim_bounded(index, store, options, to, from.unwrap_or(to))
                    .await
            }
        }
    }

    async fn trim_bounded(
        &mut self,
        index: &mut EntryIndex,
        store: &dyn BlockStore,
        options: &TrimOptions,
        to: u64,
        from: u64,
    ) -> Result<Vec<Entry>, LogError> {
        let measure = |index: &EntryIndex| match options.condition {
            TrimCondition::ByteLength { .. } => index.byte_length(),
            _ => index.len() as u64,
        };

        let oldest_insert = index.take_oldest_insert();
        if measure(index) <= from {
            if let (Some(inserted), Some(cursor)) = (&oldest_insert, &self.cursor) {
                if *inserted < cursor.key {
                    self.cursor = None;
                }
            }
            return Ok(Vec::new());
        }

        let kind = mem::discriminant(&options.condition);
        let cache_id = options.filter.as_ref().and_then(|f| f.cache_id());

        let mut position = match self.cursor.take() {
            Some(c)
                if c.kind == kind
                    && to >= c.to
                    && c.cache_id == cache_id
                    && oldest_insert.as_ref().map_or(true, |k| *k > c.key) =>
            {
                Some(c.key)
            }
            _ => None,
        };

        let mut verdicts: HashMap<String, bool> = HashMap::new();
        let mut removed = Vec::new();
        let mut misses = 0usize;

        while measure(index) > to && misses < index.len() {
            let next = position
                .as_ref()
                .and_then(|k| index.key_after(k))
                .or_else(|| index.first_key());
            let Some(key) = next else { break };
            position = Some(key.clone());

            let Some(entry) = index.hash_at(&key).and_then(|h| index.get(&h)).cloned() else {
                misses += 1;
                continue;
            };

            if allowed(options, &entry, &mut verdicts).await {
                index.remove(&entry.hash());
                store.rm(&entry.hash()).await?;
                removed.push(entry);
                misses = 0;
            } else {
                misses += 1;
            }
        }

        self.cursor = position.map(|key| Cursor {
            key,
            kind,
            to,
            cache_id,
        });

        if !removed.is_empty() {
            debug!(count = removed.len(), remaining = index.len(), "trimmed entries");
        }
        Ok(removed)
    }
}

async fn trim_by_age(
    index: &mut EntryIndex,
    store: &dyn BlockStore,
    options: &TrimOptions,
    max_age: Duration,
    now: u64,
) -> Result<Vec<Entry>, LogError> {
    let cutoff = now.saturating_sub(max_age.as_nanos() as u64);
    let mut verdicts = HashMap::new();
    let mut removed = Vec::new();

    let mut position = index.first_key();
    while let Some(key) = position {
        if key.wall_time() >= cutoff {
            break;
        }
        position = index.key_after(&key);

        let Some(entry) = index.hash_at(&key).and_then(|h| index.get(&h)).cloned() else {
            continue;
        };
        if allowed(options, &entry, &mut verdicts).await {
            index.remove(&entry.hash());
            store.rm(&entry.hash()).await?;
            removed.push(entry);
        }
    }

    if !removed.is_empty() {
        debug!(count = removed.len(), "trimmed expired entries");
    }
    Ok(removed)
}

async fn allowed(
    options: &TrimOptions,
    entry: &Entry,
    verdicts: &mut HashMap<String, bool>,
) -> bool {
    let Some(filter) = &options.filter else {
        return true;
    };
    if let Some(verdict) = verdicts.get(entry.gid()) {
        return *verdict;
    }
    let verdict = filter.can_trim(entry).await;
    verdicts.insert(entry.gid().to_string(), verdict);
    verdict
}
