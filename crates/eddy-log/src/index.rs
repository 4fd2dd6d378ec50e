//! In-memory arena of entries keyed by hash, plus derived heads, tails and
//! clock order. Edges are hashes, never references.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::ops::Bound;

use eddy_types::EntryHash;

use crate::clock::Clock;
use crate::entry::Entry;

/// Position of an entry in clock order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct SortKey {
    clock: Clock,
    hash: EntryHash,
}

impl SortKey {
    pub(crate) fn of(entry: &Entry) -> Self {
        Self {
            clock: entry.meta().clock.clone(),
            hash: entry.hash(),
        }
    }

    pub(crate) fn wall_time(&self) -> u64 {
        self.clock.timestamp.wall_time
    }
}

#[derive(Default)]
pub(crate) struct EntryIndex {
    entries: HashMap<EntryHash, Entry>,
    sorted: BTreeMap<SortKey, EntryHash>,
    /// Present entries without a present successor, in insertion order.
    heads: Vec<EntryHash>,
    /// hash -> present entries naming it in `next`. Keys may be absent
    /// from `entries`; those are the tail hashes.
    successors: HashMap<EntryHash, HashSet<EntryHash>>,
    byte_length: u64,
    /// Smallest key inserted since the last [`EntryIndex::take_oldest_insert`].
    oldest_insert: Option<SortKey>,
}

impl EntryIndex {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn byte_length(&self) -> u64 {
        self.byte_length
    }

    pub(crate) fn has(&self, hash: &EntryHash) -> bool {
        self.entries.contains_key(hash)
    }

    pub(crate) fn get(&self, hash: &EntryHash) -> Option<&Entry> {
        self.entries.get(hash)
    }

    /// Insert an entry. Returns `false` if it was already present.
    pub(crate) fn insert(&mut self, entry: Entry) -> bool {
        let hash = entry.hash();
        if self.entries.contains_key(&hash) {
            return false;
        }

        for parent in entry.next() {
            self.successors.entry(*parent).or_default().insert(hash);
            self.heads.retain(|h| h != parent);
        }

        let superseded = self
            .successors
            .get(&hash)
            .is_some_and(|children| !children.is_empty());
        if !superseded {
            self.heads.push(hash);
        }

        let key = SortKey::of(&entry);
        if self.oldest_insert.as_ref().map_or(true, |k| key < *k) {
            self.oldest_insert = Some(key.clone());
        }
        self.sorted.insert(key, hash);
        self.byte_length += entry.byte_length() as u64;
        self.entries.insert(hash, entry);
        true
    }

    /// Remove an entry. Predecessors left without a present successor
    /// become heads again.
    pub(crate) fn remove(&mut self, hash: &EntryHash) -> Option<Entry> {
        let entry = self.entries.remove(hash)?;
        self.sorted.remove(&SortKey::of(&entry));
        self.byte_length -= entry.byte_length() as u64;
        self.heads.retain(|h| h != hash);

        for parent in entry.next() {
            let orphaned = match self.successors.get_mut(parent) {
                Some(children) => {
                    children.remove(hash);
                    children.is_empty()
                }
                None => false,
            };
            if orphaned {
                self.successors.remove(parent);
                if self.entries.contains_key(parent) && !self.heads.contains(parent) {
                    self.heads.push(*parent);
                }
            }
        }
        Some(entry)
    }

    pub(crate) fn clear(&mut self) -> Vec<Entry> {
        let removed = self.entries.drain().map(|(_, e)| e).collect();
        *self = Self::default();
        removed
    }

    pub(crate) fn heads(&self) -> &[EntryHash] {
        &self.heads
    }

    /// Hashes referenced by a present entry but not present themselves.
    pub(crate) fn tail_hashes(&self) -> Vec<EntryHash> {
        let mut out: Vec<EntryHash> = self
            .successors
            .keys()
            .filter(|h| !self.entries.contains_key(h))
            .copied()
            .collect();
        out.sort();
        out
    }

    /// Present entries none of whose predecessors are present.
    pub(crate) fn tails(&self) -> Vec<&Entry> {
        let mut out: Vec<&Entry> = self
            .entries
            .values()
            .filter(|e| e.next().iter().all(|p| !self.entries.contains_key(p)))
            .collect();
        out.sort_by(|a, b| {
            let (ca, cb) = (&a.meta().clock, &b.meta().clock);
            ca.id
                .cmp(&cb.id)
                .then_with(|| ca.timestamp.cmp(&cb.timestamp))
                .then_with(|| a.hash().cmp(&b.hash()))
        });
        out
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &Entry> {
        self.sorted.values().filter_map(|h| self.entries.get(h))
    }

    pub(crate) fn first_key(&self) -> Option<SortKey> {
        self.sorted.keys().next().cloned()
    }

    /// The first key strictly after `key`, which need not be present.
    pub(crate) fn key_after(&self, key: &SortKey) -> Option<SortKey> {
        self.sorted
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
    }

    pub(crate) fn hash_at(&self, key: &SortKey) -> Option<EntryHash> {
        self.sorted.get(key).copied()
    }

    pub(crate) fn take_oldest_insert(&mut self) -> Option<SortKey> {
        self.oldest_insert.take()
    }

    /// Entries reachable backward from `from`, excluding `known` and
    /// anything behind it, with parents ordered before children.
    pub(crate) fn ancestry(&self, from: &[EntryHash], known: &HashSet<EntryHash>) -> Vec<Entry> {
        let mut queue: VecDeque<EntryHash> = from.iter().copied().collect();
        let mut found: HashMap<EntryHash, &Entry> = HashMap::new();

        while let Some(hash) = queue.pop_front() {
            if found.contains_key(&hash) || known.contains(&hash) {
                continue;
            }
            if let Some(entry) = self.entries.get(&hash) {
                for parent in entry.next() {
                    if !known.contains(parent) && !found.contains_key(parent) {
                        queue.push_back(*parent);
                    }
                }
                found.insert(hash, entry);
            }
        }

        // Kahn's algorithm; ties resolved in clock order so every peer
        // produces the same sequence.
        let mut in_degree: HashMap<EntryHash, usize> = HashMap::new();
        let mut children: HashMap<EntryHash, Vec<EntryHash>> = HashMap::new();
        for (hash, entry) in &found {
            let parents: Vec<&EntryHash> = entry
                .next()
                .iter()
                .filter(|p| found.contains_key(*p))
                .collect();
            in_degree.insert(*hash, parents.len());
            for parent in parents {
                children.entry(*parent).or_default().push(*hash);
            }
        }

        let mut ready: BTreeSet<SortKey> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(h, _)| SortKey::of(found[h]))
            .collect();

        let mut result = Vec::with_capacity(found.len());
        while let Some(key) = ready.pop_first() {
            result.push(found[&key.hash].clone());
            for kid in children.get(&key.hash).into_iter().flatten() {
                if let Some(deg) = in_degree.get_mut(kid) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(SortKey::of(found[kid]));
                    }
                }
            }
        }
        result
    }
}
