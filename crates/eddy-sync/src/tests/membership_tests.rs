use std::time::Duration;

use eddy_replication::ReplicationIndex;
use eddy_types::events::{ReplicatorJoined, ReplicatorLeft, ReplicatorMature};

use super::*;
use crate::error::SyncError;
use crate::shared_log::WaitOptions;

fn maturing_in(ms: u64) -> SharedLogOptions {
    SharedLogOptions {
        role_maturity: Duration::from_millis(ms),
        ..fast_options()
    }
}

#[tokio::test]
async fn test_maturity_fires_once_per_epoch() {
    let net = TestNetwork::new();
    let a = net.open(1, maturing_in(80)).await;
    let mut mature = a.events().subscribe::<ReplicatorMature>();

    let first = a.replicate(full_ring(), true).await.unwrap();
    assert_eq!(a.pending_maturity(), 1);
    let event = tokio::time::timeout(Duration::from_secs(2), mature.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.peer, a.peer_id());
    assert_eq!(event.segment, first[0].id);
    assert_eq!(a.pending_maturity(), 0);

    // Nothing further for the same epoch.
    let again = tokio::time::timeout(Duration::from_millis(200), mature.recv()).await;
    assert!(again.is_err());

    let second = a.replicate(full_ring(), true).await.unwrap();
    assert_ne!(first[0].id, second[0].id);
    let event = tokio::time::timeout(Duration::from_secs(2), mature.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.segment, second[0].id);
    assert_eq!(a.pending_maturity(), 0);
}

#[tokio::test]
async fn test_reset_before_maturity_cancels_old_timer() {
    let net = TestNetwork::new();
    let a = net.open(1, maturing_in(150)).await;
    let mut mature = a.events().subscribe::<ReplicatorMature>();

    a.replicate(full_ring(), true).await.unwrap();
    let mut latest = Vec::new();
    for _ in 0..10 {
        latest = a.replicate(full_ring(), true).await.unwrap();
    }
    assert_eq!(a.pending_maturity(), 1);

    let event = tokio::time::timeout(Duration::from_secs(2), mature.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.segment, latest[0].id);
    assert_eq!(a.pending_maturity(), 0);
    assert!(mature.try_recv().is_none());
}

#[tokio::test]
async fn test_unreplicate_cancels_pending_timers() {
    let net = TestNetwork::new();
    let a = net.open(1, maturing_in(60_000)).await;
    a.replicate(full_ring(), true).await.unwrap();
    a.replicate(
        ReplicationSpec::Range {
            offset: 0,
            width: 1 << 20,
        },
        false,
    )
    .await
    .unwrap();
    assert_eq!(a.pending_maturity(), 2);

    a.unreplicate().await.unwrap();
    assert_eq!(a.pending_maturity(), 0);
    assert_eq!(a.segment_count().unwrap(), 0);
}

#[tokio::test]
async fn test_remote_join_and_leave_events() {
    let net = TestNetwork::new();
    let a = net.open(1, fast_options()).await;
    let mut joined = a.events().subscribe::<ReplicatorJoined>();
    let mut left = a.events().subscribe::<ReplicatorLeft>();
    let b = net.open(2, fast_options()).await;

    b.replicate(full_ring(), true).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(2), joined.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.peer, b.peer_id());

    // More segments from the same owner are not a new join.
    b.replicate(
        ReplicationSpec::Range {
            offset: 7,
            width: 100,
        },
        false,
    )
    .await
    .unwrap();
    await_segments(&a, 2).await;
    assert!(joined.try_recv().is_none());

    b.unreplicate().await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(2), left.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.peer, b.peer_id());
    assert!(a.all_segments().unwrap().is_empty());
}

#[tokio::test]
async fn test_disconnect_removes_replicator() {
    let net = TestNetwork::new();
    let a = net.open(1, fast_options()).await;
    let mut left = a.events().subscribe::<ReplicatorLeft>();
    let b = net.open(2, fast_options()).await;
    b.replicate(full_ring(), true).await.unwrap();
    await_segments(&a, 1).await;

    net.net.detach(&b.peer_id());
    let event = tokio::time::timeout(Duration::from_secs(2), left.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.peer, b.peer_id());
    assert!(a.all_segments().unwrap().is_empty());
}

#[tokio::test]
async fn test_wait_for_replicators_times_out_alone() {
    let net = TestNetwork::new();
    let a = net.open(1, fast_options()).await;
    a.replicate(full_ring(), true).await.unwrap();

    let result = a
        .wait_for_replicators(WaitOptions {
            timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        })
        .await;
    assert!(matches!(result, Err(SyncError::Timeout(_))));
}

#[tokio::test]
async fn test_wait_for_replicators_honours_role_age() {
    let net = TestNetwork::new();
    let a = net.open(1, maturing_in(60_000)).await;
    let b = net.open(2, maturing_in(60_000)).await;
    b.replicate(full_ring(), true).await.unwrap();
    await_segments(&a, 1).await;

    let started = tokio::time::Instant::now();
    a.wait_for_replicators(WaitOptions {
        role_age: Some(Duration::from_millis(150)),
        timeout: Some(Duration::from_secs(3)),
        ..Default::default()
    })
    .await
    .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn test_wait_for_replicators_can_be_aborted() {
    let net = TestNetwork::new();
    let a = net.open(1, fast_options()).await;
    let signal = tokio_util::sync::CancellationToken::new();
    signal.cancel();

    let result = a
        .wait_for_replicators(WaitOptions {
            signal: Some(signal),
            timeout: Some(Duration::from_secs(2)),
            ..Default::default()
        })
        .await;
    assert!(matches!(result, Err(SyncError::Aborted)));
}

#[tokio::test]
async fn test_reopen_restarts_role_age() {
    let net = TestNetwork::new();
    let index = ReplicationIndex::in_memory();
    let a = net
        .open_with(
            1,
            std::sync::Arc::new(eddy_log::Blocks::in_memory()),
            index.clone(),
            maturing_in(60_000),
        )
        .await;
    let claimed = a.replicate(full_ring(), true).await.unwrap();
    a.close().await;
    net.net.detach(&a.peer_id());

    tokio::time::sleep(Duration::from_millis(20)).await;
    let reopened = net
        .open_with(
            1,
            std::sync::Arc::new(eddy_log::Blocks::in_memory()),
            index,
            maturing_in(60_000),
        )
        .await;
    let segments = reopened.segments().unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].id, claimed[0].id);
    assert!(segments[0].created_at > claimed[0].created_at);
    assert_eq!(reopened.pending_maturity(), 1);
}
