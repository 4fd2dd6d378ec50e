//! Tests for the log crate.

mod join_tests;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eddy_types::EntryHash;

use crate::clock::HybridLogicalClock;
use crate::entry::{Entry, Payload};
use crate::identity::{Ed25519Identity, Identity};
use crate::log::{AppendOptions, JoinItem, Log, LogOptions};
use crate::store::Blocks;

/// Deterministic identity from a seed.
fn test_identity(seed: u8) -> Arc<dyn Identity> {
    Arc::new(Ed25519Identity::from_seed([seed; 32]))
}

/// A log over its own in-memory block store, reading system time.
fn test_log(seed: u8) -> Log {
    Log::new(
        test_identity(seed),
        Arc::new(Blocks::in_memory()),
        LogOptions::default(),
    )
}

/// Manually advanced wall time shared by several logs.
fn test_time(start: u64) -> Arc<AtomicU64> {
    Arc::new(AtomicU64::new(start))
}

fn set_time(time: &AtomicU64, value: u64) {
    time.store(value, Ordering::SeqCst);
}

/// A log whose clock reads `time`.
fn timed_log(seed: u8, time: &Arc<AtomicU64>, options: LogOptions) -> Log {
    timed_log_with_store(seed, time, Arc::new(Blocks::in_memory()), options)
}

fn timed_log_with_store(
    seed: u8,
    time: &Arc<AtomicU64>,
    store: Arc<Blocks>,
    options: LogOptions,
) -> Log {
    let source = time.clone();
    let clock = HybridLogicalClock::with_wall_clock(
        options.clock,
        Arc::new(move || source.load(Ordering::SeqCst)),
    );
    Log::with_clock(test_identity(seed), store, clock, options)
}

async fn append_text(log: &mut Log, text: &str) -> Entry {
    log.append(Payload::text(text), AppendOptions::default())
        .await
        .unwrap()
        .entry
}

/// Every entry of `log` as join items, in clock order.
fn join_items(log: &Log) -> Vec<JoinItem> {
    log.values().into_iter().cloned().map(JoinItem::from).collect()
}

fn hash_set<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> HashSet<EntryHash> {
    entries.into_iter().map(|e| e.hash()).collect()
}
