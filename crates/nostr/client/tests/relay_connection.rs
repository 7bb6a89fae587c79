//! RelayConnection against a live mock relay.

mod common;

use common::*;
use nostr::{KIND_SHORT_TEXT_NOTE, Keys};
use nostr_client::{
    ClientError, ConnectionState, Filter, RelayConfig, RelayConnection, RelaySubscriptionMessage,
    RetryPolicy,
};
use tokio::time::{Duration, Instant, timeout};

fn fast_retry(max_retries: u32) -> RelayConfig {
    RelayConfig {
        connect_timeout: Duration::from_millis(500),
        retry: RetryPolicy {
            initial_interval: Duration::from_millis(20),
            multiplier: 2.0,
            max_retries,
        },
    }
}

#[tokio::test]
async fn test_retries_exactly_max_then_abandons() {
    init_tracing();
    let url = closed_port_url().await;
    let relay = RelayConnection::with_config(&url, fast_retry(3)).unwrap();
    let mut states = relay.state_receiver();

    let started = Instant::now();
    assert!(matches!(relay.connect().await, Err(ClientError::Connection(_))));

    timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == ConnectionState::Abandoned),
    )
    .await
    .expect("relay should be abandoned")
    .unwrap();

    // 20ms + 40ms + 80ms of backoff between the four attempts.
    assert!(started.elapsed() >= Duration::from_millis(140));
    assert_eq!(relay.connection_attempts(), 4);
    assert_eq!(relay.retry_count(), 3);
    assert!(relay.last_error().is_some());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(relay.connection_attempts(), 4, "no attempts after abandoning");
    assert_eq!(relay.state(), ConnectionState::Abandoned);
}

#[tokio::test]
async fn test_explicit_connect_restarts_abandoned_relay() {
    init_tracing();
    let url = closed_port_url().await;
    let relay = RelayConnection::with_config(&url, fast_retry(0)).unwrap();

    assert!(relay.connect().await.is_err());
    let mut states = relay.state_receiver();
    timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == ConnectionState::Abandoned),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(relay.connection_attempts(), 1);

    assert!(relay.connect().await.is_err());
    assert_eq!(relay.connection_attempts(), 2);
}

#[tokio::test]
async fn test_connect_while_retrying_reports_failure() {
    init_tracing();
    let url = closed_port_url().await;
    let relay = RelayConnection::with_config(
        &url,
        RelayConfig {
            connect_timeout: Duration::from_millis(500),
            retry: RetryPolicy {
                initial_interval: Duration::from_secs(30),
                multiplier: 2.0,
                max_retries: 3,
            },
        },
    )
    .unwrap();

    assert!(relay.connect().await.is_err());
    assert_eq!(relay.state(), ConnectionState::Retrying);

    match relay.connect().await {
        Err(ClientError::Connection(reason)) => assert!(reason.contains("retrying")),
        other => panic!("expected connection error, got {:?}", other),
    }
    assert_eq!(relay.connection_attempts(), 1, "backoff schedule untouched");
    assert_eq!(relay.retry_count(), 1);
    relay.disconnect().await;
}

#[tokio::test]
async fn test_same_event_published_twice_concurrently() {
    let keys = Keys::generate();
    let event = signed_event(&keys, KIND_SHORT_TEXT_NOTE, "twice", vec![], 1_700_000_000);
    let mock = MockRelay::start().await;
    let relay = RelayConnection::new(&mock.url).unwrap();
    relay.connect().await.unwrap();

    let (first, second) = tokio::join!(
        relay.publish_event(&event, Duration::from_millis(500)),
        relay.publish_event(&event, Duration::from_millis(500)),
    );
    assert!(first.unwrap().accepted);
    assert!(second.unwrap().accepted);
    relay.disconnect().await;
}

#[tokio::test]
async fn test_connect_and_disconnect() {
    let mock = MockRelay::start().await;
    let relay = RelayConnection::new(&mock.url).unwrap();

    relay.connect().await.unwrap();
    assert!(relay.is_connected());
    assert!(wait_until(Duration::from_secs(2), || mock.connections() == 1).await);

    // Already running: no second socket.
    relay.connect().await.unwrap();
    assert_eq!(mock.connections(), 1);

    relay.disconnect().await;
    assert_eq!(relay.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_publish_waits_for_ok() {
    let keys = Keys::generate();
    let event = signed_event(&keys, KIND_SHORT_TEXT_NOTE, "hi", vec![], 1_700_000_000);

    let accepting = MockRelay::start().await;
    let relay = RelayConnection::new(&accepting.url).unwrap();
    relay.connect().await.unwrap();
    let confirmation = relay
        .publish_event(&event, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(confirmation.accepted);
    assert_eq!(confirmation.event_id, event.id);

    let rejecting = MockRelay::with_behavior(Behavior {
        accept: false,
        ..Behavior::default()
    })
    .await;
    let relay = RelayConnection::new(&rejecting.url).unwrap();
    relay.connect().await.unwrap();
    let confirmation = relay
        .publish_event(&event, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(!confirmation.accepted);
    assert_eq!(confirmation.message, "blocked: test relay");
}

#[tokio::test]
async fn test_publish_times_out_without_ok() {
    let mock = MockRelay::with_behavior(Behavior {
        silent_on_publish: true,
        ..Behavior::default()
    })
    .await;
    let relay = RelayConnection::new(&mock.url).unwrap();
    relay.connect().await.unwrap();

    let event = signed_event(&Keys::generate(), 1, "hi", vec![], 1_700_000_000);
    let result = relay.publish_event(&event, Duration::from_millis(100)).await;
    assert!(matches!(result, Err(ClientError::Timeout(_))));
}

#[tokio::test]
async fn test_malformed_frames_are_dropped() {
    let keys = Keys::generate();
    let stored = signed_event(&keys, 1, "survivor", vec![], 1_700_000_000);
    let mock = MockRelay::with_behavior(Behavior {
        raw_frames: vec![
            "not json".to_string(),
            r#"["EVENT"]"#.to_string(),
            r#"{"type":"EVENT"}"#.to_string(),
            r#"["UNKNOWN","x"]"#.to_string(),
        ],
        stored: vec![stored.clone()],
        ..Behavior::default()
    })
    .await;
    let relay = RelayConnection::new(&mock.url).unwrap();
    relay.connect().await.unwrap();

    let mut rx = relay.subscribe("sub1", vec![Filter::new().kind(1)]).unwrap();
    let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, RelaySubscriptionMessage::Event(stored));
    let second = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(second, RelaySubscriptionMessage::Eose);
    assert!(relay.is_connected());
}

#[tokio::test]
async fn test_unsubscribe_sends_close() {
    let mock = MockRelay::start().await;
    let relay = RelayConnection::new(&mock.url).unwrap();
    relay.connect().await.unwrap();

    let _rx = relay.subscribe("sub-close", vec![Filter::new().kind(1)]).unwrap();
    assert_eq!(relay.active_subscriptions(), vec!["sub-close".to_string()]);
    relay.unsubscribe("sub-close");
    assert!(relay.active_subscriptions().is_empty());

    assert!(
        wait_until(Duration::from_secs(2), || {
            mock.frames_of("CLOSE")
                .iter()
                .any(|f| f[1] == "sub-close")
        })
        .await
    );
}

#[tokio::test]
async fn test_reconnect_reissues_subscriptions() {
    init_tracing();
    let mock = MockRelay::start().await;
    let relay = RelayConnection::with_config(&mock.url, fast_retry(5)).unwrap();
    relay.connect().await.unwrap();

    let mut rx = relay.subscribe("sticky", vec![Filter::new().kind(1)]).unwrap();
    assert_eq!(
        timeout(Duration::from_secs(2), rx.recv()).await.unwrap(),
        Some(RelaySubscriptionMessage::Eose)
    );

    mock.drop_connections();
    assert!(matches!(
        timeout(Duration::from_secs(2), rx.recv()).await.unwrap(),
        Some(RelaySubscriptionMessage::Closed(_))
    ));

    // Same route, re-issued on the new socket.
    assert!(
        wait_until(Duration::from_secs(3), || {
            mock.frames_of("REQ")
                .iter()
                .filter(|f| f[1] == "sticky")
                .count()
                == 2
        })
        .await
    );
    assert_eq!(mock.connections(), 2);
    assert!(relay.is_connected());
    assert_eq!(relay.retry_count(), 0);
    assert_eq!(
        timeout(Duration::from_secs(2), rx.recv()).await.unwrap(),
        Some(RelaySubscriptionMessage::Eose)
    );
}
