//! Member and broker lifecycle, statistics and the metrics bridge.

use std::collections::HashSet;
use std::time::Duration;

use relay_bus::{BrokerError, Handle};
use relay_telemetry::BrokerMetrics;
use tokio::sync::mpsc::unbounded_channel;

use super::fixtures::*;

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_member_close_fails_pending_and_frees_handle() {
    let broker = broker(TIMEOUT);
    let client = broker.add_member(Handle::new(1, 1), silent).unwrap();
    broker.add_member(Handle::new(2, 1), silent).unwrap();

    let (tx, mut rx) = unbounded_channel();
    client
        .request_multiple(
            Handle::new(2, 1),
            Command::new(Handle::new(10, 1), 0),
            move |result| {
                let _ = tx.send(result);
                true
            },
        )
        .await;
    assert_eq!(client.pending_requests(), 1);

    client.close();

    assert_eq!(
        rx.recv().await.unwrap().unwrap_err(),
        BrokerError::MemberClosed {
            member: Handle::new(1, 1)
        }
    );
    assert!(!broker.is_registered(Handle::new(1, 1)));
    assert_eq!(broker.stats().requests_cancelled, 1);

    // The handle is free for a new member.
    let replacement = broker.add_member(Handle::new(1, 1), silent).unwrap();
    assert!(!replacement.is_closed());
}

#[tokio::test]
async fn test_closing_stale_member_keeps_replacement() {
    let broker = broker(TIMEOUT);
    let first = broker.add_member(Handle::new(1, 1), silent).unwrap();
    first.close();
    let _second = broker.add_member(Handle::new(1, 1), silent).unwrap();

    // Closing the old instance again must not evict the new one.
    first.close();
    assert!(broker.is_registered(Handle::new(1, 1)));
    assert_eq!(broker.member_count(), 1);
}

#[tokio::test]
async fn test_registration_errors() {
    let broker = broker(TIMEOUT);
    broker.add_member(Handle::new(1, 1), silent).unwrap();

    assert_eq!(
        broker.add_member(Handle::new(1, 1), silent).unwrap_err(),
        BrokerError::MemberExists(Handle::new(1, 1))
    );
    assert_eq!(
        broker.add_member(Handle::of_type(1), silent).unwrap_err(),
        BrokerError::InvalidMemberHandle(Handle::of_type(1))
    );
}

#[tokio::test]
async fn test_shutdown_delivers_queued_then_refuses() {
    let broker = broker(TIMEOUT);
    let sender = broker.add_member(Handle::new(1, 1), silent).unwrap();
    let (_receiver, mut rx) = add_recorder(&broker, Handle::new(3, 1));

    for seq in 1..=10 {
        sender
            .send(Handle::new(3, 1), Command::new(Handle::new(7, seq), seq.into()))
            .await;
    }
    broker.shutdown().await;

    // Each delivery runs on its own task, so arrival order is not fixed.
    let mut bodies = HashSet::new();
    for _ in 1..=10 {
        bodies.insert(rx.recv().await.unwrap().1.body);
    }
    assert_eq!(bodies, (1..=10u64).collect::<HashSet<_>>());

    // Everything after close is dropped without error.
    sender
        .send(Handle::new(3, 1), Command::new(Handle::new(7, 11), 11))
        .await;
    assert!(stays_quiet(&mut rx).await);
    assert_eq!(
        broker.add_member(Handle::new(4, 1), silent).unwrap_err(),
        BrokerError::BrokerClosed
    );
}

#[tokio::test]
async fn test_stats_feed_metrics() {
    let broker = broker(TIMEOUT);
    let client = broker.add_member(Handle::new(1, 1), silent).unwrap();
    add_incrementer(&broker, Handle::new(2, 1));

    client
        .request(Handle::new(2, 1), Command::new(Handle::new(10, 1), 1))
        .await
        .unwrap();

    let snapshot = broker.stats();
    assert_eq!(snapshot.requests_started, 1);
    assert_eq!(snapshot.requests_completed, 1);
    assert_eq!(snapshot.requests_in_flight(), 0);
    assert_eq!(snapshot.messages_enqueued, 2);

    let json = serde_json::to_value(snapshot).unwrap();
    assert_eq!(json["requests_completed"], 1);

    // The only caller of the process-wide registry in this binary.
    let metrics = BrokerMetrics::register().unwrap();
    metrics.observe(&snapshot);
    let text = metrics.encode().unwrap();
    assert!(text.contains("relay_bus_requests_completed 1"));
    assert!(text.contains("relay_bus_messages_enqueued 2"));
}
