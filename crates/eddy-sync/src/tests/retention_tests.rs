use std::time::Duration;

use eddy_log::{AppendOptions, LogOptions, Payload, TrimOptions};
use eddy_types::events::ReplicatorMature;

use super::*;

fn trimmed_to(length: u64, options: SharedLogOptions) -> SharedLogOptions {
    SharedLogOptions {
        log: LogOptions {
            trim: Some(TrimOptions::length(length)),
            ..LogOptions::default()
        },
        ..options
    }
}

async fn append_n(log: &SharedLog, n: usize) {
    for i in 0..n {
        log.append(Payload::text(format!("e{i}")), AppendOptions::default())
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_led_entries_survive_length_trim() {
    let net = TestNetwork::new();
    let a = net.open(1, trimmed_to(2, fast_options())).await;
    a.replicate(full_ring(), true).await.unwrap();

    append_n(&a, 4).await;
    assert_eq!(a.log().await.len(), 4);
}

#[tokio::test]
async fn test_entries_held_by_mature_replicator_are_trimmed() {
    let net = TestNetwork::new();
    let options = SharedLogOptions {
        replicas: 1,
        ..trimmed_to(2, fast_options())
    };
    let a = net.open(1, options).await;
    let b = net.open(2, fast_options()).await;
    b.replicate(full_ring(), true).await.unwrap();
    await_segments(&a, 1).await;

    append_n(&a, 4).await;
    assert_eq!(a.log().await.len(), 2);

    let b_ref = &b;
    eventually("b holds every entry", move || async move {
        b_ref.log().await.len() == 4
    })
    .await;
}

#[tokio::test]
async fn test_entries_kept_until_replicator_matures() {
    let net = TestNetwork::new();
    let options = SharedLogOptions {
        replicas: 1,
        role_maturity: Duration::from_millis(300),
        ..trimmed_to(2, fast_options())
    };
    let a = net.open(1, options).await;
    let mut mature = a.events().subscribe::<ReplicatorMature>();

    let b = net.open(2, fast_options()).await;
    b.replicate(full_ring(), true).await.unwrap();
    await_segments(&a, 1).await;

    append_n(&a, 4).await;
    assert_eq!(a.log().await.len(), 4, "the only leader is not mature yet");

    let event = tokio::time::timeout(Duration::from_secs(5), mature.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.peer, b.peer_id());

    a.append(Payload::text("after"), AppendOptions::default())
        .await
        .unwrap();
    assert_eq!(a.log().await.len(), 2);
}

#[tokio::test]
async fn test_retention_without_replicators_applies_as_configured() {
    let net = TestNetwork::new();
    let a = net.open(1, trimmed_to(2, fast_options())).await;

    append_n(&a, 4).await;
    assert_eq!(a.log().await.len(), 2);
}
