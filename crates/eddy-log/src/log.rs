//! The replicated log.
//!
//! A [`Log`] owns an arena of entries keyed by hash together with the
//! derived heads, tails and clock order. Local writes go through
//! [`Log::append`]; entries obtained from other peers go through
//! [`Log::join`], which is idempotent and order-independent.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use eddy_types::EntryHash;
use tracing::{debug, warn};

use crate::clock::{HlcConfig, HybridLogicalClock};
use crate::entry::{AppendPolicy, CreateEntry, Entry, EntryType, Payload, ShallowEntry};
use crate::error::LogError;
use crate::identity::Identity;
use crate::index::EntryIndex;
use crate::store::BlockStore;
use crate::trim::{TrimOptions, Trimmer};

type Result<T> = std::result::Result<T, LogError>;

/// Construction options.
#[derive(Clone, Default)]
pub struct LogOptions {
    /// Clock bounds.
    pub clock: HlcConfig,
    /// Retention applied after every append and join.
    pub trim: Option<TrimOptions>,
    /// Admission check for appended and joined entries.
    pub can_append: Option<Arc<dyn AppendPolicy>>,
}

/// Per-call options for [`Log::append`].
#[derive(Default)]
pub struct AppendOptions {
    pub entry_type: EntryType,
    /// Application metadata stored in `meta.data`.
    pub data: Option<Vec<u8>>,
    /// Seed for the gid of a root entry.
    pub gid_seed: Option<Vec<u8>>,
    /// Explicit predecessors instead of the current heads.
    pub next: Option<Vec<EntryHash>>,
    /// Co-signers. The log identity signs alone when empty.
    pub signers: Vec<Arc<dyn Identity>>,
    /// Overrides the log's admission check.
    pub can_append: Option<Arc<dyn AppendPolicy>>,
    /// Overrides the log's retention for this call.
    pub trim: Option<TrimOptions>,
}

/// Outcome of [`Log::append`].
#[derive(Debug)]
pub struct AppendResult {
    pub entry: Entry,
    /// Entries trimmed as a consequence.
    pub removed: Vec<Entry>,
}

/// Something to merge into a log.
#[derive(Debug, Clone)]
pub enum JoinItem {
    /// A decoded entry.
    Entry(Entry),
    /// A hash resolved through the block store.
    Hash(EntryHash),
    /// A shallow reference resolved through the block store.
    Shallow(ShallowEntry),
}

impl From<Entry> for JoinItem {
    fn from(entry: Entry) -> Self {
        JoinItem::Entry(entry)
    }
}

impl From<EntryHash> for JoinItem {
    fn from(hash: EntryHash) -> Self {
        JoinItem::Hash(hash)
    }
}

impl From<ShallowEntry> for JoinItem {
    fn from(shallow: ShallowEntry) -> Self {
        JoinItem::Shallow(shallow)
    }
}

/// Per-call options for [`Log::join`].
#[derive(Clone)]
pub struct JoinOptions {
    /// Reject entries whose signatures do not verify.
    pub verify_signatures: bool,
    /// Overrides the log's admission check.
    pub can_append: Option<Arc<dyn AppendPolicy>>,
    /// Overrides the log's retention for this call.
    pub trim: Option<TrimOptions>,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            verify_signatures: true,
            can_append: None,
            trim: None,
        }
    }
}

/// Outcome of [`Log::join`].
#[derive(Debug, Default)]
pub struct JoinResult {
    /// Newly inserted entries, parents before children.
    pub added: Vec<Entry>,
    /// Entries trimmed afterwards.
    pub removed: Vec<Entry>,
    /// Entries discarded because they failed verification or policy.
    pub rejected: Vec<EntryHash>,
    /// Referenced hashes that could not be resolved.
    pub missing: Vec<EntryHash>,
}

/// A signed, causally ordered, append-only DAG log.
pub struct Log {
    identity: Arc<dyn Identity>,
    store: Arc<dyn BlockStore>,
    clock: HybridLogicalClock,
    index: EntryIndex,
    trimmer: Trimmer,
    trim: Option<TrimOptions>,
    can_append: Option<Arc<dyn AppendPolicy>>,
    closed: bool,
}

impl Log {
    /// Create an empty log writing blocks to `store`.
    pub fn new(identity: Arc<dyn Identity>, store: Arc<dyn BlockStore>, options: LogOptions) -> Self {
        Self::with_clock(identity, store, HybridLogicalClock::new(options.clock), options)
    }

    /// Create an empty log with an explicit clock.
    pub fn with_clock(
        identity: Arc<dyn Identity>,
        store: Arc<dyn BlockStore>,
        clock: HybridLogicalClock,
        options: LogOptions,
    ) -> Self {
        Self {
            identity,
            store,
            clock,
            index: EntryIndex::default(),
            trimmer: Trimmer::default(),
            trim: options.trim,
            can_append: options.can_append,
            closed: false,
        }
    }

    pub fn identity(&self) -> &Arc<dyn Identity> {
        &self.identity
    }

    pub fn clock(&self) -> &HybridLogicalClock {
        &self.clock
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Replace the retention applied after appends and joins.
    pub fn set_trim(&mut self, trim: Option<TrimOptions>) {
        self.trim = trim;
    }

    /// Create and store a new entry whose predecessors are the current heads.
    pub async fn append(&mut self, payload: Payload, options: AppendOptions) -> Result<AppendResult> {
        self.ensure_open()?;

        let next: Vec<Entry> = match &options.next {
            Some(hashes) => hashes
                .iter()
                .map(|h| {
                    self.index
                        .get(h)
                        .cloned()
                        .ok_or(LogError::UnknownNext { next: *h })
                })
                .collect::<Result<_>>()?,
            None => self
                .index
                .heads()
                .iter()
                .filter_map(|h| self.index.get(h).cloned())
                .collect(),
        };

        let policy = options.can_append.as_deref().or(self.can_append.as_deref());
        let entry = Entry::create(CreateEntry {
            identity: self.identity.as_ref(),
            signers: &options.signers,
            clock: &self.clock,
            payload,
            next: &next,
            entry_type: options.entry_type,
            data: options.data,
            gid_seed: options.gid_seed,
            can_append: policy,
        })
        .await?;

        self.store.put(entry.to_block()?).await?;
        self.index.insert(entry.clone());
        debug!(hash = %entry.hash(), heads = self.index.heads().len(), "appended entry");

        let removed = self.trim(options.trim.as_ref()).await?;
        Ok(AppendResult { entry, removed })
    }

    /// Merge entries into the log.
    ///
    /// Items already present are skipped. Missing predecessors are fetched
    /// from the block store and inserted before their children; those that
    /// cannot be fetched stay behind as tail hashes. Entries that fail
    /// verification or the admission check are reported in
    /// [`JoinResult::rejected`] and never inserted.
    pub async fn join<I>(&mut self, items: I, options: JoinOptions) -> Result<JoinResult>
    where
        I: IntoIterator<Item = JoinItem>,
    {
        self.ensure_open()?;

        let policy = options.can_append.clone().or_else(|| self.can_append.clone());
        let mut result = JoinResult::default();
        let mut visited = HashSet::new();

        for item in items {
            let root = match item {
                JoinItem::Entry(entry) => Some(entry),
                JoinItem::Hash(hash) => self.resolve(hash, &mut result).await?,
                JoinItem::Shallow(shallow) => self.resolve(shallow.hash, &mut result).await?,
            };
            if let Some(root) = root {
                self.join_entry(root, &options, policy.as_deref(), &mut visited, &mut result)
                    .await?;
            }
        }

        result.missing.retain(|h| !self.index.has(h));
        result.missing.sort();
        result.missing.dedup();

        if !result.added.is_empty() {
            result.removed = self.trim(options.trim.as_ref()).await?;
            debug!(
                added = result.added.len(),
                rejected = result.rejected.len(),
                heads = self.index.heads().len(),
                "joined entries"
            );
        }
        Ok(result)
    }

    async fn resolve(&self, hash: EntryHash, result: &mut JoinResult) -> Result<Option<Entry>> {
        if self.index.has(&hash) {
            return Ok(None);
        }
        let fetched = self.fetch(&hash).await?;
        if fetched.is_none() {
            result.missing.push(hash);
        }
        Ok(fetched)
    }

    /// Depth-first insert of `root` and its unknown ancestors.
    async fn join_entry(
        &mut self,
        root: Entry,
        options: &JoinOptions,
        policy: Option<&dyn AppendPolicy>,
        visited: &mut HashSet<EntryHash>,
        result: &mut JoinResult,
    ) -> Result<()> {
        let mut stack = vec![(root, false)];

        while let Some((entry, expanded)) = stack.pop() {
            let hash = entry.hash();
            if self.index.has(&hash) {
                continue;
            }

            if !expanded {
                if !visited.insert(hash) {
                    continue;
                }
                let mut parents = Vec::new();
                for parent in entry.next() {
                    if self.index.has(parent) || visited.contains(parent) {
                        continue;
                    }
                    match self.fetch(parent).await? {
                        Some(p) => parents.push(p),
                        None => result.missing.push(*parent),
                    }
                }
                stack.push((entry, true));
                stack.extend(parents.into_iter().rev().map(|p| (p, false)));
                continue;
            }

            if let Err(e) = self.admit(&entry, options, policy).await {
                warn!(hash = %hash, error = %e, "rejected entry");
                result.rejected.push(hash);
                continue;
            }

            self.store.put(entry.to_block()?).await?;
            self.index.insert(entry.clone());
            result.added.push(entry);
        }
        Ok(())
    }

    async fn admit(
        &self,
        entry: &Entry,
        options: &JoinOptions,
        policy: Option<&dyn AppendPolicy>,
    ) -> Result<()> {
        if options.verify_signatures && !entry.verify() {
            return Err(LogError::Access(format!(
                "entry {} failed verification",
                entry.hash()
            )));
        }

        for parent in entry.next() {
            if let Some(p) = self.index.get(parent) {
                if p.meta().clock >= entry.meta().clock {
                    return Err(LogError::NextNotBefore { next: *parent });
                }
            }
        }

        if let Some(policy) = policy {
            if !policy.can_append(entry).await {
                return Err(LogError::Access(format!(
                    "join of {} rejected by policy",
                    entry.hash()
                )));
            }
        }

        self.clock.update(&entry.timestamp())?;
        Ok(())
    }

    async fn fetch(&self, hash: &EntryHash) -> Result<Option<Entry>> {
        let bytes = match self.store.get(hash).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(e @ crate::error::StoreError::Corrupt { .. }) => {
                warn!(hash = %hash, error = %e, "ignoring corrupt block");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        match Entry::from_block(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(hash = %hash, error = %e, "undecodable block");
                Ok(None)
            }
        }
    }

    /// Run a trim pass with `options`, or the configured retention.
    ///
    /// Returns the deleted entries, possibly none.
    pub async fn trim(&mut self, options: Option<&TrimOptions>) -> Result<Vec<Entry>> {
        let Some(options) = options.or(self.trim.as_ref()) else {
            return Ok(Vec::new());
        };
        let now = self.clock.wall_time();
        self.trimmer
            .run(&mut self.index, self.store.as_ref(), options, now)
            .await
    }

    /// Remove one entry and its block.
    pub async fn delete(&mut self, hash: &EntryHash) -> Result<Option<Entry>> {
        let Some(entry) = self.index.remove(hash) else {
            return Ok(None);
        };
        self.store.rm(hash).await?;
        Ok(Some(entry))
    }

    /// Entries without a known successor, in insertion order.
    pub fn heads(&self) -> Vec<&Entry> {
        self.index
            .heads()
            .iter()
            .filter_map(|h| self.index.get(h))
            .collect()
    }

    pub fn head_hashes(&self) -> Vec<EntryHash> {
        self.index.heads().to_vec()
    }

    /// Entries none of whose predecessors are present, ordered by writer
    /// key then timestamp.
    pub fn tails(&self) -> Vec<&Entry> {
        self.index.tails()
    }

    /// Hashes referenced as predecessors but not present.
    pub fn tail_hashes(&self) -> Vec<EntryHash> {
        self.index.tail_hashes()
    }

    /// All entries in clock order.
    pub fn values(&self) -> Vec<&Entry> {
        self.index.values().collect()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.len() == 0
    }

    /// Sum of block sizes of present entries.
    pub fn byte_length(&self) -> u64 {
        self.index.byte_length()
    }

    pub fn has(&self, hash: &EntryHash) -> bool {
        self.index.has(hash)
    }

    pub fn get(&self, hash: &EntryHash) -> Option<&Entry> {
        self.index.get(hash)
    }

    /// Entries behind `from` that are not in or behind `known`, parents first.
    pub fn ancestry(&self, from: &[EntryHash], known: &HashSet<EntryHash>) -> Vec<Entry> {
        self.index.ancestry(from, known)
    }

    /// Refuse further appends and joins.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Delete every entry and block, then close.
    pub async fn drop_all(&mut self) -> Result<()> {
        for entry in self.index.clear() {
            self.store.rm(&entry.hash()).await?;
        }
        self.closed = true;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(LogError::Closed)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for Log {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Log")
            .field("peer", &self.identity.peer_id())
            .field("len", &self.index.len())
            .field("heads", &self.index.heads().len())
            .field("closed", &self.closed)
            .finish()
    }
}
