mod common;

use std::time::Duration;

use common::{connect, eventually, network, options, payload_of, try_connect, EventLog, A, B, C};
use relaybee_client::{transport::ServerError, ClientError, ConnectionState, EventKind};
use tracing_test::traced_test;

const WAIT: Duration = Duration::from_secs(3);

#[tokio::test]
#[traced_test]
async fn test_reconnect_preserves_interest() {
    let network = network(&[A, B]);
    let log = EventLog::default();
    let conn = connect(&network, options(&[A, B]), &log).await;
    assert_eq!(conn.connected_url().as_deref(), Some(A));

    let sub = conn.subscribe("prices.>").await.unwrap();
    conn.publish("prices.btc", "1").await.unwrap();
    assert_eq!(payload_of(&sub.next_msg(WAIT).await.unwrap()), "1");

    network.stop_node(A);
    assert!(eventually(WAIT, || log.count(EventKind::Reconnected) == 1).await);
    assert!(conn.is_connected());
    assert_eq!(conn.connected_url().as_deref(), Some(B));
    assert_eq!(conn.stats().reconnects, 1);
    assert_eq!(
        log.lifecycle(),
        vec![
            EventKind::Connected,
            EventKind::Disconnected,
            EventKind::Reconnected
        ]
    );

    conn.publish("prices.eth", "2").await.unwrap();
    assert_eq!(payload_of(&sub.next_msg(WAIT).await.unwrap()), "2");
    assert_eq!(network.sessions_on(B), 1);
    assert!(logs_contain("Reconnected to"));
}

#[tokio::test]
async fn test_publishes_are_buffered_while_reconnecting() {
    let network = network(&[A]);
    let log = EventLog::default();
    let conn = connect(&network, options(&[A]), &log).await;
    let sub = conn.subscribe("orders").await.unwrap();

    network.set_reachable(A, false);
    network.disconnect(A);
    assert!(eventually(WAIT, || conn.state() == ConnectionState::Reconnecting).await);

    for i in 0..3 {
        conn.publish("orders", format!("{i}")).await.unwrap();
    }
    assert!(conn.buffered().await > 0);

    network.set_reachable(A, true);
    assert!(eventually(WAIT, || conn.is_connected()).await);
    conn.flush(WAIT).await.unwrap();

    for i in 0..3 {
        let msg = sub.next_msg(WAIT).await.unwrap();
        assert_eq!(payload_of(&msg), i.to_string());
    }
    assert_eq!(conn.buffered().await, 0);
}

#[tokio::test]
async fn test_reconnect_buffer_limit() {
    let network = network(&[A]);
    let mut opts = options(&[A]);
    opts.reconnect_buffer_size = 64;
    let conn = connect(&network, opts, &EventLog::default()).await;

    network.stop_node(A);
    assert!(eventually(WAIT, || conn.state() == ConnectionState::Reconnecting).await);

    let mut result = Ok(());
    for _ in 0..10 {
        result = conn.publish("bulk", vec![0u8; 32]).await;
        if result.is_err() {
            break;
        }
    }
    assert!(matches!(result, Err(ClientError::ReconnectBufferExceeded)));
}

#[tokio::test]
#[traced_test]
async fn test_pool_exhaustion_closes_connection() {
    let network = network(&[A, B, C]);
    let log = EventLog::default();
    let mut opts = options(&[A, B, C]);
    opts.max_reconnect_attempts = Some(2);
    let conn = connect(&network, opts, &log).await;

    for node in [A, B, C] {
        network.set_reachable(node, false);
    }
    network.reset_attempts();
    network.disconnect(A);

    assert!(eventually(WAIT, || conn.is_closed()).await);
    for node in [A, B, C] {
        assert_eq!(network.open_attempts(node), 2, "attempts on {node}");
    }
    assert!(eventually(WAIT, || log.count(EventKind::Closed) == 1).await);

    let settled = log.kinds().len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(log.kinds().len(), settled);
    assert_eq!(log.kinds().last(), Some(&EventKind::Closed));
    assert!(log.errors().iter().any(|e| e.contains("No servers")));

    assert!(matches!(
        conn.publish("late", "x").await,
        Err(ClientError::ConnectionClosed)
    ));
    assert!(matches!(
        conn.subscribe("late").await,
        Err(ClientError::BadSubscription)
    ));
    assert!(logs_contain("Server pool exhausted"));
}

#[tokio::test]
async fn test_initial_connect_failure() {
    let network = network(&[A]);
    network.set_reachable(A, false);

    let result = try_connect(&network, options(&[A]), &EventLog::default()).await;
    assert!(matches!(result, Err(ClientError::NoServers)));
    assert_eq!(network.open_attempts(A), 1);
}

#[tokio::test]
async fn test_initial_connect_retries_in_background() {
    let network = network(&[A]);
    network.set_reachable(A, false);

    let log = EventLog::default();
    let mut opts = options(&[A]);
    opts.reconnect_on_connect = true;
    let conn = try_connect(&network, opts, &log).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Reconnecting);

    // Publishes made before the first session are buffered.
    conn.publish("early", "x").await.unwrap();

    network.set_reachable(A, true);
    assert!(eventually(WAIT, || conn.is_connected()).await);
    assert!(eventually(WAIT, || log.count(EventKind::Connected) == 1).await);
    assert_eq!(log.count(EventKind::Reconnected), 0);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let network = network(&[A]);
    let log = EventLog::default();
    let conn = connect(&network, options(&[A]), &log).await;
    conn.subscribe("a").await.unwrap();

    conn.close().await;
    conn.close().await;
    assert!(conn.is_closed());
    assert_eq!(conn.num_subscriptions(), 0);

    assert!(eventually(WAIT, || log.count(EventKind::Closed) == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(log.count(EventKind::Closed), 1);
    assert_eq!(log.kinds().last(), Some(&EventKind::Closed));

    assert!(matches!(
        conn.flush(WAIT).await,
        Err(ClientError::ConnectionClosed)
    ));
    assert!(eventually(WAIT, || network.session_count() == 0).await);
}

#[tokio::test]
async fn test_disconnect_without_reconnect_closes() {
    let network = network(&[A]);
    let log = EventLog::default();
    let mut opts = options(&[A]);
    opts.allow_reconnect = false;
    let conn = connect(&network, opts, &log).await;

    network.disconnect(A);
    assert!(eventually(WAIT, || conn.is_closed()).await);
    assert!(eventually(WAIT, || log.count(EventKind::Closed) == 1).await);
    assert_eq!(
        log.lifecycle(),
        vec![EventKind::Connected, EventKind::Disconnected, EventKind::Closed]
    );
}

#[tokio::test]
async fn test_authorization_failure_is_reported() {
    let network = network(&[A, B]);
    network.reject_auth(B, true);

    let log = EventLog::default();
    let mut opts = options(&[A, B]);
    opts.max_reconnect_attempts = Some(1);
    let conn = connect(&network, opts, &log).await;

    network.stop_node(A);
    assert!(eventually(WAIT, || conn.is_closed()).await);
    assert!(eventually(WAIT, || log.count(EventKind::Closed) == 1).await);
    assert!(log
        .errors()
        .iter()
        .any(|e| e.contains("Authorization violation")));
}

#[tokio::test]
async fn test_server_auth_error_on_live_session_fails_over() {
    let network = network(&[A, B]);
    let log = EventLog::default();
    let conn = connect(&network, options(&[A, B]), &log).await;

    network.send_error(A, ServerError::AuthorizationViolation);
    assert!(eventually(WAIT, || log.count(EventKind::Reconnected) == 1).await);
    assert!(log.count(EventKind::AsyncError) >= 1);
    assert!(conn.is_connected());
}

#[tokio::test]
async fn test_discovered_servers_join_the_pool() {
    let network = network(&[A, B]);
    let log = EventLog::default();
    let conn = connect(&network, options(&[A]), &log).await;
    assert_eq!(conn.servers().len(), 1);

    network.announce(A, &["b:4222"]);
    assert!(eventually(WAIT, || conn.servers().len() == 2).await);
    assert!(eventually(WAIT, || log.count(EventKind::ServersDiscovered) == 1).await);
    assert!(conn.servers()[1].discovered);

    network.stop_node(A);
    assert!(eventually(WAIT, || log.count(EventKind::Reconnected) == 1).await);
    assert_eq!(conn.connected_url().as_deref(), Some(B));
}

#[tokio::test]
#[traced_test]
async fn test_stale_connection_is_detected_by_keepalive() {
    let network = network(&[A]);
    let log = EventLog::default();
    let mut opts = options(&[A]);
    opts.ping_interval_ms = 20;
    opts.max_pings_outstanding = 2;
    let conn = connect(&network, opts, &log).await;

    network.stall(A, true);
    assert!(eventually(WAIT, || log.count(EventKind::Disconnected) >= 1).await);
    network.stall(A, false);

    assert!(eventually(WAIT, || conn.stats().reconnects >= 1).await);
    let mut flushed = false;
    for _ in 0..10 {
        if conn.flush(Duration::from_millis(200)).await.is_ok() {
            flushed = true;
            break;
        }
    }
    assert!(flushed);
    assert!(logs_contain("connection is stale"));
}

#[tokio::test]
async fn test_state_watch_follows_failover() {
    let network = network(&[A, B]);
    let conn = connect(&network, options(&[A, B]), &EventLog::default()).await;
    let mut state = conn.subscribe_state();
    assert_eq!(*state.borrow_and_update(), ConnectionState::Connected);

    network.set_reachable(B, false);
    network.stop_node(A);
    tokio::time::timeout(WAIT, state.changed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(*state.borrow_and_update(), ConnectionState::Reconnecting);

    network.set_reachable(B, true);
    tokio::time::timeout(WAIT, state.changed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(*state.borrow(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_flush_waits_for_round_trip() {
    let network = network(&[A]);
    let conn = connect(&network, options(&[A]), &EventLog::default()).await;
    conn.flush(WAIT).await.unwrap();

    network.stall(A, true);
    assert!(matches!(
        conn.flush(Duration::from_millis(30)).await,
        Err(ClientError::Timeout)
    ));
}
