use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::{
    append_text, hash_set, join_items, set_time, test_identity, test_log, test_time, timed_log,
    timed_log_with_store,
};
use crate::entry::{AppendPolicy, Entry, Payload};
use crate::identity::{Ed25519Identity, Identity, PublicKey, SignatureWithKey};
use crate::log::{AppendOptions, JoinItem, JoinOptions, Log, LogOptions};
use crate::error::LogError;
use crate::store::{BlockStore, Blocks};

struct RejectPayload(&'static str);

#[async_trait]
impl AppendPolicy for RejectPayload {
    async fn can_append(&self, entry: &Entry) -> bool {
        entry.payload().bytes != self.0.as_bytes()
    }
}

struct CountingPolicy(AtomicUsize);

#[async_trait]
impl AppendPolicy for CountingPolicy {
    async fn can_append(&self, _entry: &Entry) -> bool {
        self.0.fetch_add(1, Ordering::SeqCst);
        true
    }
}

struct Impostor(PublicKey, Ed25519Identity);

#[async_trait]
impl Identity for Impostor {
    fn public_key(&self) -> PublicKey {
        self.0
    }

    async fn sign(&self, data: &[u8]) -> Result<SignatureWithKey, LogError> {
        let mut signature = self.1.sign(data).await?;
        signature.public_key = self.0;
        Ok(signature)
    }
}

async fn two_entry_logs() -> (Log, Log) {
    let time = test_time(100);
    let mut a = timed_log(1, &time, LogOptions::default());
    let mut b = timed_log(2, &time, LogOptions::default());
    append_text(&mut a, "helloA1").await;
    set_time(&time, 200);
    append_text(&mut b, "helloB1").await;
    set_time(&time, 300);
    append_text(&mut a, "helloA2").await;
    set_time(&time, 400);
    append_text(&mut b, "helloB2").await;
    (a, b)
}

#[tokio::test]
async fn test_join_is_idempotent() {
    let (mut a, b) = two_entry_logs().await;

    let first = a.join(join_items(&b), JoinOptions::default()).await.unwrap();
    assert_eq!(first.added.len(), 2);
    let heads = a.head_hashes();
    let len = a.len();

    let second = a.join(join_items(&b), JoinOptions::default()).await.unwrap();
    assert!(second.added.is_empty());
    assert_eq!(a.head_hashes(), heads);
    assert_eq!(a.len(), len);

    // Joining our own entries is a no-op too.
    let own = a.join(join_items(&a), JoinOptions::default()).await.unwrap();
    assert!(own.added.is_empty());
}

#[tokio::test]
async fn test_join_is_commutative() {
    let (mut a, mut b) = two_entry_logs().await;
    let a_items = join_items(&a);
    let b_items = join_items(&b);

    a.join(b_items, JoinOptions::default()).await.unwrap();
    b.join(a_items, JoinOptions::default()).await.unwrap();

    assert_eq!(hash_set(a.heads()), hash_set(b.heads()));
    assert_eq!(hash_set(a.values()), hash_set(b.values()));
    assert_eq!(a.len(), 4);
}

#[tokio::test]
async fn test_join_order_does_not_matter() {
    let (a, b) = two_entry_logs().await;
    let mut items = join_items(&a);
    items.extend(join_items(&b));

    let mut forward = test_log(5);
    forward.join(items.clone(), JoinOptions::default()).await.unwrap();

    let mut backward = test_log(6);
    items.reverse();
    let result = backward.join(items, JoinOptions::default()).await.unwrap();

    assert_eq!(hash_set(forward.heads()), hash_set(backward.heads()));
    assert_eq!(forward.len(), backward.len());
    assert!(backward.tail_hashes().is_empty());
    assert!(result.missing.is_empty());
}

#[tokio::test]
async fn test_causal_ordering_holds_after_join() {
    let (mut a, b) = two_entry_logs().await;
    a.join(join_items(&b), JoinOptions::default()).await.unwrap();
    append_text(&mut a, "merge").await;

    for entry in a.values() {
        for parent in entry.next() {
            let parent = a.get(parent).unwrap();
            assert!(parent.timestamp() < entry.timestamp());
        }
    }
}

#[tokio::test]
async fn test_join_hash_fetches_ancestors_from_store() {
    let time = test_time(100);
    let shared = Arc::new(Blocks::in_memory());
    let mut writer = timed_log_with_store(1, &time, shared.clone(), LogOptions::default());
    let mut reader = timed_log_with_store(2, &time, shared, LogOptions::default());

    let e1 = append_text(&mut writer, "1").await;
    let e2 = append_text(&mut writer, "2").await;
    let e3 = append_text(&mut writer, "3").await;

    let result = reader
        .join(vec![JoinItem::Hash(e3.hash())], JoinOptions::default())
        .await
        .unwrap();
    let added: Vec<_> = result.added.iter().map(|e| e.hash()).collect();
    assert_eq!(added, vec![e1.hash(), e2.hash(), e3.hash()]);
    assert_eq!(reader.head_hashes(), vec![e3.hash()]);

    let shallow = reader
        .join(vec![JoinItem::Shallow(e2.shallow())], JoinOptions::default())
        .await
        .unwrap();
    assert!(shallow.added.is_empty());
}

#[tokio::test]
async fn test_unfetchable_parent_becomes_tail_hash() {
    let mut writer = test_log(1);
    let e1 = append_text(&mut writer, "1").await;
    let e2 = append_text(&mut writer, "2").await;
    let e3 = append_text(&mut writer, "3").await;

    let mut reader = test_log(2);
    let result = reader
        .join(vec![e3.clone().into()], JoinOptions::default())
        .await
        .unwrap();
    assert_eq!(result.added.len(), 1);
    assert_eq!(result.missing, vec![e2.hash()]);
    assert_eq!(reader.tail_hashes(), vec![e2.hash()]);
    assert_eq!(reader.head_hashes(), vec![e3.hash()]);

    // The parent arriving later fills the gap.
    reader
        .join(vec![e2.clone().into()], JoinOptions::default())
        .await
        .unwrap();
    assert_eq!(reader.head_hashes(), vec![e3.hash()]);
    assert_eq!(reader.tail_hashes(), vec![e1.hash()]);
}

#[tokio::test]
async fn test_unknown_hash_is_reported_missing() {
    let mut log = test_log(1);
    let hash = eddy_types::EntryHash::from_data(b"missing");
    let result = log
        .join(vec![JoinItem::Hash(hash)], JoinOptions::default())
        .await
        .unwrap();
    assert!(result.added.is_empty());
    assert_eq!(result.missing, vec![hash]);
}

#[tokio::test]
async fn test_policy_rejection_skips_only_bad_entries() {
    let mut writer = test_log(1);
    let good = writer
        .append(
            Payload::text("good"),
            AppendOptions {
                next: Some(vec![]),
                ..AppendOptions::default()
            },
        )
        .await
        .unwrap()
        .entry;
    let bad = writer
        .append(
            Payload::text("bad"),
            AppendOptions {
                next: Some(vec![]),
                ..AppendOptions::default()
            },
        )
        .await
        .unwrap()
        .entry;

    let mut reader = test_log(2);
    let options = JoinOptions {
        can_append: Some(Arc::new(RejectPayload("bad"))),
        ..JoinOptions::default()
    };
    let result = reader
        .join(vec![good.clone().into(), bad.clone().into()], options)
        .await
        .unwrap();

    assert_eq!(result.rejected, vec![bad.hash()]);
    assert!(reader.has(&good.hash()));
    assert!(!reader.has(&bad.hash()));
    assert!(!reader.store().has(&bad.hash()).await.unwrap());
}

#[tokio::test]
async fn test_forged_entries_are_rejected() {
    let mut forger = Log::new(
        Arc::new(Impostor(
            test_identity(1).public_key(),
            Ed25519Identity::from_seed([7; 32]),
        )),
        Arc::new(Blocks::in_memory()),
        LogOptions::default(),
    );
    let forged = append_text(&mut forger, "forged").await;

    let mut reader = test_log(2);
    let result = reader
        .join(vec![forged.clone().into()], JoinOptions::default())
        .await
        .unwrap();
    assert_eq!(result.rejected, vec![forged.hash()]);
    assert!(reader.is_empty());

    let lenient = JoinOptions {
        verify_signatures: false,
        ..JoinOptions::default()
    };
    let result = reader.join(vec![forged.into()], lenient).await.unwrap();
    assert_eq!(result.added.len(), 1);
}

#[tokio::test]
async fn test_log_policy_applies_to_join() {
    let policy = Arc::new(CountingPolicy(AtomicUsize::new(0)));
    let mut reader = Log::new(
        test_identity(2),
        Arc::new(Blocks::in_memory()),
        LogOptions {
            can_append: Some(policy.clone()),
            ..LogOptions::default()
        },
    );
    let (a, _) = two_entry_logs().await;
    reader.join(join_items(&a), JoinOptions::default()).await.unwrap();
    reader.join(join_items(&a), JoinOptions::default()).await.unwrap();
    assert_eq!(policy.0.load(Ordering::SeqCst), 2, "present entries are not re-checked");
}
