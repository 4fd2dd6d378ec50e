use std::sync::Arc;
use std::time::Duration;

use eddy_log::{AppendOptions, Blocks, Log, LogOptions, Payload};

use super::*;
use crate::shared_log::SharedJoinOptions;

#[tokio::test]
async fn test_join_with_replicate_claims_entry_segment() {
    let net = TestNetwork::new();
    let a = net.open(1, fast_options()).await;
    let b = net.open(2, fast_options()).await;

    let hash = a
        .append(Payload::text("hello"), AppendOptions::default())
        .await
        .unwrap()
        .entry
        .hash();

    // B's store has never seen the entry; it is fetched from A.
    let result = b.join([hash], SharedJoinOptions::default()).await.unwrap();
    assert!(result.missing.is_empty());
    assert_eq!(result.added.len(), 1);
    assert_eq!(b.segment_count().unwrap(), 0);
    assert_eq!(b.log().await.len(), 1);
    assert_eq!(b.in_flight(), 0);

    let replicate = SharedJoinOptions {
        replicate: true,
        ..Default::default()
    };
    b.join([hash], replicate.clone()).await.unwrap();
    assert_eq!(b.segment_count().unwrap(), 1);
    assert_eq!(b.log().await.len(), 1);

    // The coordinate is already claimed.
    b.join([hash], replicate).await.unwrap();
    assert_eq!(b.segment_count().unwrap(), 1);
}

#[tokio::test]
async fn test_join_by_hash_pulls_ancestors() {
    let net = TestNetwork::new();
    let a = net.open(1, fast_options()).await;
    let b = net.open(2, fast_options()).await;

    for text in ["one", "two"] {
        a.append(Payload::text(text), AppendOptions::default())
            .await
            .unwrap();
    }
    let head = a
        .append(Payload::text("three"), AppendOptions::default())
        .await
        .unwrap()
        .entry
        .hash();

    let result = b.join([head], SharedJoinOptions::default()).await.unwrap();
    assert!(result.missing.is_empty());
    assert_eq!(result.added.len(), 3);
    let log = b.log().await;
    assert_eq!(log.len(), 3);
    assert_eq!(log.head_hashes(), vec![head]);
    assert!(log.tail_hashes().is_empty());
}

#[tokio::test]
async fn test_join_of_unknown_hash_gives_up_after_timeout() {
    let net = TestNetwork::new();
    let _a = net.open(1, fast_options()).await;
    let b = net.open(2, fast_options()).await;

    let nowhere = eddy_types::EntryHash::from_data(b"nowhere");
    let options = SharedJoinOptions {
        fetch_timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let started = tokio::time::Instant::now();
    let result = b.join([nowhere], options).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(result.missing, vec![nowhere]);
    assert!(result.added.is_empty());
    assert!(b.log().await.is_empty());
    assert_eq!(b.in_flight(), 0);
}

#[tokio::test]
async fn test_join_without_peers_does_not_wait() {
    let net = TestNetwork::new();
    let b = net.open(2, fast_options()).await;

    let nowhere = eddy_types::EntryHash::from_data(b"nowhere");
    let result = tokio::time::timeout(
        Duration::from_secs(1),
        b.join([nowhere], SharedJoinOptions::default()),
    )
    .await
    .expect("join waited without anyone to ask")
    .unwrap();
    assert_eq!(result.missing, vec![nowhere]);
}

#[tokio::test]
async fn test_leader_is_agreed_without_communication() {
    let net = TestNetwork::new();
    let a = net.open(1, fast_options()).await;
    let b = net.open(2, fast_options()).await;
    a.replicate(full_ring(), true).await.unwrap();
    b.replicate(full_ring(), true).await.unwrap();
    await_segments(&a, 2).await;
    await_segments(&b, 2).await;

    for text in ["one", "two", "three", "four"] {
        let entry = a
            .append(Payload::text(text), AppendOptions::default())
            .await
            .unwrap()
            .entry;
        let on_a = a.is_leader(&entry, Some(1)).unwrap();
        let on_b = b.is_leader(&entry, Some(1)).unwrap();
        assert_ne!(on_a, on_b, "exactly one leader for {text}");
        assert_eq!(
            a.find_leaders(&entry, Some(2)).unwrap(),
            b.find_leaders(&entry, Some(2)).unwrap()
        );
    }
}

#[tokio::test]
async fn test_two_peers_converge() {
    let net = TestNetwork::new();
    let a = net.open(1, fast_options()).await;
    let b = net.open(2, fast_options()).await;
    a.replicate(full_ring(), true).await.unwrap();
    b.replicate(full_ring(), true).await.unwrap();
    await_segments(&a, 2).await;
    await_segments(&b, 2).await;

    for i in 0..3 {
        a.append(Payload::text(&format!("a{i}")), AppendOptions::default())
            .await
            .unwrap();
        b.append(Payload::text(&format!("b{i}")), AppendOptions::default())
            .await
            .unwrap();
    }

    let (a_ref, b_ref) = (&a, &b);
    eventually("both logs hold six entries", move || async move {
        a_ref.log().await.len() == 6 && b_ref.log().await.len() == 6
    })
    .await;

    let mut a_heads = a.log().await.head_hashes();
    let mut b_heads = b.log().await.head_hashes();
    a_heads.sort();
    b_heads.sort();
    assert_eq!(a_heads, b_heads);
}

#[tokio::test]
async fn test_appends_leave_in_one_message_per_window() {
    let net = TestNetwork::new();
    let options = SharedLogOptions {
        debounce: Duration::from_millis(200),
        ..fast_options()
    };
    let a = net.open(1, options.clone()).await;
    let b = net.open(2, options).await;
    a.replicate(full_ring(), true).await.unwrap();
    b.replicate(full_ring(), true).await.unwrap();
    await_segments(&a, 2).await;
    await_segments(&b, 2).await;
    // Let handshake replies settle before counting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let before = net.net.delivered();

    for i in 0..5 {
        a.append(Payload::text(&format!("e{i}")), AppendOptions::default())
            .await
            .unwrap();
    }

    let b_ref = &b;
    eventually("b holds the batch", move || async move {
        b_ref.log().await.len() == 5
    })
    .await;
    assert_eq!(net.net.delivered() - before, 1);
}

#[tokio::test]
async fn test_joined_entries_are_gossiped_together() {
    let net = TestNetwork::new();
    let options = SharedLogOptions {
        debounce: Duration::from_millis(200),
        ..fast_options()
    };
    let a = net.open(1, options.clone()).await;
    let b = net.open(2, options).await;
    a.replicate(full_ring(), true).await.unwrap();
    b.replicate(full_ring(), true).await.unwrap();
    await_segments(&a, 2).await;
    await_segments(&b, 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Entries written offline by a third writer.
    let mut offline = Log::new(
        test_identity(9),
        Arc::new(Blocks::in_memory()),
        LogOptions::default(),
    );
    let mut entries = Vec::new();
    for i in 0..3 {
        let entry = offline
            .append(Payload::text(&format!("x{i}")), AppendOptions::default())
            .await
            .unwrap()
            .entry;
        entries.push(entry);
    }

    let before = net.net.delivered();
    let replicate = SharedJoinOptions {
        replicate: true,
        ..Default::default()
    };
    let result = a.join(entries, replicate).await.unwrap();
    assert_eq!(result.added.len(), 3);

    let b_ref = &b;
    eventually("b holds the joined entries", move || async move {
        b_ref.log().await.len() == 3
    })
    .await;
    assert_eq!(net.net.delivered() - before, 1);
}

#[tokio::test]
async fn test_existing_entries_are_offered_to_new_replicator() {
    let net = TestNetwork::new();
    let a = net.open(1, fast_options()).await;
    for i in 0..3 {
        a.append(Payload::text(&format!("early{i}")), AppendOptions::default())
            .await
            .unwrap();
    }

    let b = net.open(2, fast_options()).await;
    b.replicate(full_ring(), true).await.unwrap();

    let b_ref = &b;
    eventually("b catches up", move || async move {
        b_ref.log().await.len() == 3
    })
    .await;
    assert!(b.log().await.tail_hashes().is_empty());
}

#[tokio::test]
async fn test_large_offers_travel_as_numbers() {
    let net = TestNetwork::new();
    let a = net.open(1, fast_options()).await;
    for i in 0..70 {
        a.append(Payload::text(&format!("bulk{i}")), AppendOptions::default())
            .await
            .unwrap();
    }

    let b = net.open(2, fast_options()).await;
    b.replicate(full_ring(), true).await.unwrap();

    let b_ref = &b;
    eventually("b catches up", move || async move {
        b_ref.log().await.len() == 70
    })
    .await;
    assert_eq!(b.in_flight(), 0);
}

#[tokio::test]
async fn test_options_from_config_apply_trim() {
    let config = eddy_types::config::EddyConfig::from_toml(
        r#"
        [replication]
        replicas = 3
        time_until_role_maturity_ms = 10

        [trim]
        kind = "length"
        to = 2
        "#,
    )
    .unwrap();
    let options = SharedLogOptions::from_config(&config).unwrap();
    assert_eq!(options.replicas, 3);
    assert_eq!(options.role_maturity, Duration::from_millis(10));

    let net = TestNetwork::new();
    let a = net.open(1, options).await;
    for i in 0..4 {
        a.append(Payload::text(&format!("t{i}")), AppendOptions::default())
            .await
            .unwrap();
    }
    assert_eq!(a.log().await.len(), 2);
}
