//! Request/response correlation through the broker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_bus::{BrokerError, Handle, Member};
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::Instant;

use super::fixtures::*;

const TIMEOUT: Duration = Duration::from_millis(200);
const CLIENT: Handle = Handle::new(1, 1);
const SERVICE: Handle = Handle::new(2, 1);

#[tokio::test]
async fn test_request_round_trip() {
    let broker = broker(TIMEOUT);
    let client = broker.add_member(CLIENT, silent).unwrap();
    add_incrementer(&broker, SERVICE);

    let request = Command::new(Handle::new(10, 1), 41);
    let response = client.request(SERVICE, request.clone()).await.unwrap();

    assert_eq!(response.body, 42);
    assert_eq!(response.reference, request.id);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_request_to_type_group() {
    let broker = broker(TIMEOUT);
    let client = broker.add_member(CLIENT, silent).unwrap();
    add_incrementer(&broker, Handle::new(2, 5));
    add_incrementer(&broker, Handle::new(2, 6));

    for seq in 1..=5 {
        let response = client
            .request(Handle::of_type(2), Command::new(Handle::new(10, seq), 1))
            .await
            .unwrap();
        assert_eq!(response.body, 2);
    }
}

#[tokio::test(start_paused = true)]
async fn test_request_times_out() {
    let broker = broker(TIMEOUT);
    let client = broker.add_member(CLIENT, silent).unwrap();
    broker.add_member(SERVICE, silent).unwrap();

    let key = Handle::new(10, 1);
    let started = Instant::now();
    let err = client
        .request(SERVICE, Command::new(key, 0))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        BrokerError::RequestTimeout {
            key,
            timeout: TIMEOUT
        }
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= TIMEOUT);
    assert!(elapsed < TIMEOUT + Duration::from_millis(50));
    assert_eq!(broker.stats().requests_timed_out, 1);
}

#[tokio::test(start_paused = true)]
async fn test_conflicting_key_is_rejected_while_in_flight() {
    let broker = broker(TIMEOUT);
    let client = broker.add_member(CLIENT, silent).unwrap();
    broker.add_member(SERVICE, silent).unwrap();

    let key = Handle::new(10, 1);
    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.request(SERVICE, Command::new(key, 0)).await })
    };
    assert!(eventually(|| client.pending_requests() == 1).await);

    let err = client
        .request(SERVICE, Command::new(key, 1))
        .await
        .unwrap_err();
    assert_eq!(err, BrokerError::HandleConflict { key });

    // The first request is unaffected by the rejected one.
    assert!(first.await.unwrap().unwrap_err().is_timeout());
    assert_eq!(broker.stats().request_conflicts, 1);
}

#[tokio::test]
async fn test_key_is_reusable_after_completion() {
    let broker = broker(TIMEOUT);
    let client = broker.add_member(CLIENT, silent).unwrap();
    add_incrementer(&broker, SERVICE);

    let key = Handle::new(10, 1);
    for body in [1, 2, 3] {
        let response = client.request(SERVICE, Command::new(key, body)).await.unwrap();
        assert_eq!(response.body, body + 1);
    }
}

#[tokio::test]
async fn test_same_key_to_different_peers_is_independent() {
    let broker = broker(TIMEOUT);
    let client = broker.add_member(CLIENT, silent).unwrap();
    add_incrementer(&broker, Handle::new(2, 1));
    add_incrementer(&broker, Handle::new(3, 1));

    let key = Handle::new(10, 1);
    let (a, b) = tokio::join!(
        client.request(Handle::new(2, 1), Command::new(key, 10)),
        client.request(Handle::new(3, 1), Command::new(key, 20)),
    );

    assert_eq!(a.unwrap().body, 11);
    assert_eq!(b.unwrap().body, 21);
}

#[tokio::test(start_paused = true)]
async fn test_streaming_responses_refresh_the_deadline() {
    let broker = broker(TIMEOUT);
    let client = broker.add_member(CLIENT, silent).unwrap();
    // Three parts, each arriving before the deadline, together well past it.
    add_streamer(&broker, SERVICE, 3, Duration::from_millis(150));

    let bodies = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&bodies);
    let started = Instant::now();
    client
        .request_multiple(
            SERVICE,
            Command::new(Handle::new(10, 1), 0),
            move |result: Result<Command, BrokerError>| {
                let body = result.unwrap().body;
                seen.lock().unwrap().push(body);
                body == 0
            },
        )
        .await;

    assert!(eventually(|| bodies.lock().unwrap().len() == 3).await);
    assert_eq!(*bodies.lock().unwrap(), vec![2, 1, 0]);
    assert!(started.elapsed() >= Duration::from_millis(450));
    assert_eq!(broker.stats().requests_timed_out, 0);
    assert_eq!(broker.stats().requests_completed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_stream_times_out_after_partial() {
    let broker = broker(TIMEOUT);
    let client = broker.add_member(CLIENT, silent).unwrap();
    // One partial response, then silence.
    broker
        .add_member(SERVICE, |member: Member<Command>, sender: Handle, cmd: Command| {
            let partial = cmd.reply(Handle::new(REPLY_TYPE, 1), 5);
            async move { member.send(sender, partial).await }
        })
        .unwrap();

    let (tx, mut rx) = unbounded_channel();
    client
        .request_multiple(
            SERVICE,
            Command::new(Handle::new(10, 1), 0),
            move |result: Result<Command, BrokerError>| {
                let _ = tx.send(result);
                false
            },
        )
        .await;

    assert_eq!(rx.recv().await.unwrap().unwrap().body, 5);
    assert!(rx.recv().await.unwrap().unwrap_err().is_timeout());
    // The handler is never invoked again after the timeout.
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_unmatched_message_goes_to_message_handler() {
    let broker = broker(TIMEOUT);
    let (_client, mut client_rx) = add_recorder(&broker, CLIENT);
    let service = broker.add_member(SERVICE, silent).unwrap();

    // A response to a request the client never made.
    let stray = Command {
        id: Handle::new(REPLY_TYPE, 1),
        reference: Handle::new(10, 77),
        body: 9,
    };
    service.send(CLIENT, stray.clone()).await;

    let (from, received) = client_rx.recv().await.unwrap();
    assert_eq!(from, SERVICE);
    assert_eq!(received, stray);
}

#[tokio::test(start_paused = true)]
async fn test_late_response_becomes_unsolicited() {
    let broker = broker(TIMEOUT);
    let (client, mut client_rx) = add_recorder(&broker, CLIENT);
    broker
        .add_member(SERVICE, |member: Member<Command>, sender: Handle, cmd: Command| {
            let reply = cmd.reply(Handle::new(REPLY_TYPE, 1), 1);
            async move {
                tokio::time::sleep(TIMEOUT * 2).await;
                member.send(sender, reply).await;
            }
        })
        .unwrap();

    let key = Handle::new(10, 1);
    let err = client
        .request(SERVICE, Command::new(key, 0))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    let (from, late) = client_rx.recv().await.unwrap();
    assert_eq!(from, SERVICE);
    assert_eq!(late.reference, key);
    assert_eq!(broker.stats().unsolicited_messages, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_response_handler_can_reenter_its_member() {
    let broker = broker(TIMEOUT);
    let client = broker.add_member(CLIENT, silent).unwrap();
    add_streamer(&broker, SERVICE, 2, Duration::from_millis(10));

    let (tx, mut rx) = unbounded_channel();
    let observer = client.clone();
    client
        .request_multiple(
            SERVICE,
            Command::new(Handle::new(10, 1), 0),
            move |result: Result<Command, BrokerError>| {
                let body = result.unwrap().body;
                let _ = tx.send((body, observer.pending_requests()));
                body == 0
            },
        )
        .await;

    for expected in [(1, 1), (0, 1)] {
        let seen = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("response handler blocked on its member")
            .unwrap();
        assert_eq!(seen, expected);
    }
    assert!(eventually(|| client.pending_requests() == 0).await);
    assert_eq!(broker.stats().requests_completed, 1);
}
