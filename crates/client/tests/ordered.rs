mod common;

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use common::{connect, eventually, network, options, EventLog, A, B};
use relaybee_client::{
    ClientError, ConsumerPhase, EventKind, Message, MessageManager, MessageManagerFactory,
    OrderedConsumer, OrderedConsumerConfig, PendingSink,
};
use tracing_test::traced_test;

const WAIT: Duration = Duration::from_secs(3);
const STREAM: &str = "ORDERS";

/// Loses each listed stream sequence the first time it is seen.
struct DropOnce {
    seqs: Arc<Mutex<HashSet<u64>>>,
}

struct Dropper {
    seqs: Arc<Mutex<HashSet<u64>>>,
    tracker: Arc<dyn MessageManager>,
}

impl MessageManagerFactory for DropOnce {
    fn wrap(&self, tracker: Arc<dyn MessageManager>) -> Arc<dyn MessageManager> {
        Arc::new(Dropper {
            seqs: self.seqs.clone(),
            tracker,
        })
    }
}

impl MessageManager for Dropper {
    fn process(&self, msg: Message, sink: &dyn PendingSink) {
        if let Some(seq) = msg.sequence() {
            if self.seqs.lock().unwrap().remove(&seq.stream) {
                return;
            }
        }
        self.tracker.process(msg, sink)
    }
}

fn config() -> OrderedConsumerConfig {
    OrderedConsumerConfig::new(STREAM)
        .filter_subject("orders.>")
        .idle_heartbeat(Duration::from_millis(20))
        .heartbeat_margin(2.0)
        .recovery_delay(Duration::from_millis(10))
}

async fn publish_range(conn: &relaybee_client::Connection, range: std::ops::RangeInclusive<u64>) {
    for i in range {
        conn.publish("orders.new", format!("{i}")).await.unwrap();
    }
    conn.flush(WAIT).await.unwrap();
}

async fn collect(consumer: &OrderedConsumer, count: usize) -> Vec<u64> {
    let mut seqs = Vec::with_capacity(count);
    while seqs.len() < count {
        let msg = consumer.next(WAIT).await.unwrap();
        seqs.push(msg.sequence().unwrap().stream);
    }
    seqs
}

#[tokio::test]
#[traced_test]
async fn test_loss_is_repaired_gaplessly() {
    let network = network(&[A]);
    network.add_stream(STREAM, &["orders.>"]);
    let conn = connect(&network, options(&[A]), &EventLog::default()).await;

    publish_range(&conn, 1..=10).await;

    let lost = Arc::new(Mutex::new(HashSet::from([5, 12])));
    let consumer = conn
        .ordered_consumer(config())
        .message_manager_factory(DropOnce { seqs: lost.clone() })
        .start()
        .await
        .unwrap();

    publish_range(&conn, 11..=20).await;

    let seqs = collect(&consumer, 20).await;
    assert_eq!(seqs, (1..=20).collect::<Vec<_>>());
    assert!(lost.lock().unwrap().is_empty());

    let stats = consumer.stats();
    assert!(stats.recoveries >= 1);
    assert!(stats.gaps >= 1);
    assert_eq!(stats.delivered, 20);
    assert_eq!(stats.last_stream_seq, 20);

    assert!(matches!(
        consumer.next(Duration::from_millis(50)).await,
        Err(ClientError::Timeout)
    ));
    assert!(logs_contain("Ordered consumer started on stream ORDERS"));
}

#[tokio::test]
async fn test_trailing_loss_is_found_by_heartbeat() {
    let network = network(&[A]);
    network.add_stream(STREAM, &["orders.>"]);
    let conn = connect(&network, options(&[A]), &EventLog::default()).await;

    // The last message is lost; only the heartbeat reveals it.
    let lost = Arc::new(Mutex::new(HashSet::from([3])));
    let consumer = conn
        .ordered_consumer(config())
        .message_manager_factory(DropOnce { seqs: lost })
        .start()
        .await
        .unwrap();

    publish_range(&conn, 1..=3).await;
    assert_eq!(collect(&consumer, 3).await, vec![1, 2, 3]);
    assert!(consumer.stats().gaps >= 1);
}

#[tokio::test]
async fn test_heartbeat_loss_triggers_resubscribe() {
    let network = network(&[A]);
    network.add_stream(STREAM, &["orders.>"]);
    let conn = connect(&network, options(&[A]), &EventLog::default()).await;

    let consumer = conn.ordered_consumer(config()).start().await.unwrap();
    publish_range(&conn, 1..=5).await;
    assert_eq!(collect(&consumer, 5).await, vec![1, 2, 3, 4, 5]);

    assert!(network.forget_consumers() >= 1);
    assert!(eventually(WAIT, || consumer.stats().heartbeat_timeouts >= 1).await);
    assert!(eventually(WAIT, || consumer.phase() == ConsumerPhase::Active).await);

    publish_range(&conn, 6..=10).await;
    assert_eq!(collect(&consumer, 5).await, vec![6, 7, 8, 9, 10]);
}

#[tokio::test]
async fn test_reconnect_resumes_after_last_delivered() {
    let network = network(&[A, B]);
    network.add_stream(STREAM, &["orders.>"]);
    let log = EventLog::default();
    let conn = connect(&network, options(&[A, B]), &log).await;

    let consumer = conn.ordered_consumer(config()).start().await.unwrap();
    publish_range(&conn, 1..=3).await;
    assert_eq!(collect(&consumer, 3).await, vec![1, 2, 3]);

    network.stop_node(A);
    assert!(eventually(WAIT, || log.count(EventKind::Reconnected) == 1).await);

    publish_range(&conn, 4..=6).await;
    assert_eq!(collect(&consumer, 3).await, vec![4, 5, 6]);
    assert!(consumer.stats().recoveries >= 1);
}

#[tokio::test]
async fn test_queue_overflow_counts_as_gap() {
    let network = network(&[A]);
    network.add_stream(STREAM, &["orders.>"]);
    let conn = connect(&network, options(&[A]), &EventLog::default()).await;

    let consumer = conn
        .ordered_consumer(config().pending_limits(2, 1 << 20))
        .start()
        .await
        .unwrap();
    publish_range(&conn, 1..=10).await;

    assert_eq!(collect(&consumer, 10).await, (1..=10).collect::<Vec<_>>());
    assert!(consumer.stats().gaps >= 1);
}

#[tokio::test]
async fn test_idle_caller_does_not_trigger_resubscribe_storm() {
    let network = network(&[A]);
    network.add_stream(STREAM, &["orders.>"]);
    let log = EventLog::default();
    let conn = connect(&network, options(&[A]), &log).await;

    let consumer = conn
        .ordered_consumer(
            config()
                .idle_heartbeat(Duration::ZERO)
                .pending_limits(2, 1 << 20),
        )
        .start()
        .await
        .unwrap();
    publish_range(&conn, 1..=10).await;

    // Nobody reads: the consumer waits for room instead of resubscribing.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let idle = consumer.stats();
    assert!(idle.recoveries <= 1, "recoveries while idle: {}", idle.recoveries);
    assert!(idle.gaps <= 1, "gaps while idle: {}", idle.gaps);
    assert_eq!(consumer.phase(), ConsumerPhase::Recovering);

    assert_eq!(collect(&consumer, 10).await, (1..=10).collect::<Vec<_>>());
    assert!(consumer.stats().recoveries <= 10);

    // Overflow of an ordered consumer is repaired, not reported.
    assert_eq!(log.count(EventKind::AsyncError), 0);
}

#[tokio::test]
async fn test_consume_delivers_in_order() {
    let network = network(&[A]);
    network.add_stream(STREAM, &["orders.>"]);
    let conn = connect(&network, options(&[A]), &EventLog::default()).await;

    let lost = Arc::new(Mutex::new(HashSet::from([4])));
    let consumer = conn
        .ordered_consumer(config())
        .message_manager_factory(DropOnce { seqs: lost })
        .start()
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handle = consumer
        .consume(move |msg: Message| {
            let sink = sink.clone();
            async move {
                if let Some(seq) = msg.sequence() {
                    sink.lock().unwrap().push(seq.stream);
                }
            }
        })
        .await
        .unwrap();

    assert!(matches!(
        consumer.next(Duration::from_millis(10)).await,
        Err(ClientError::InvalidOperation(_))
    ));

    publish_range(&conn, 1..=10).await;
    assert!(eventually(WAIT, || seen.lock().unwrap().len() == 10).await);
    assert_eq!(*seen.lock().unwrap(), (1..=10).collect::<Vec<_>>());

    handle.stop();
    publish_range(&conn, 11..=11).await;
    assert_eq!(collect(&consumer, 1).await, vec![11]);
}

#[tokio::test]
async fn test_start_sequence_and_fetch() {
    let network = network(&[A]);
    network.add_stream(STREAM, &["orders.>"]);
    let conn = connect(&network, options(&[A]), &EventLog::default()).await;
    publish_range(&conn, 1..=5).await;

    let consumer = conn
        .ordered_consumer(config().start_sequence(3))
        .start()
        .await
        .unwrap();

    let batch = consumer.fetch(10, Duration::from_millis(200)).await.unwrap();
    let seqs: Vec<u64> = batch.iter().map(|m| m.sequence().unwrap().stream).collect();
    assert_eq!(seqs, vec![3, 4, 5]);

    let empty = consumer.fetch(10, Duration::from_millis(30)).await.unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
async fn test_stop_and_close() {
    let network = network(&[A]);
    network.add_stream(STREAM, &["orders.>"]);
    let conn = connect(&network, options(&[A]), &EventLog::default()).await;

    let stopped = conn.ordered_consumer(config()).start().await.unwrap();
    let running = conn.ordered_consumer(config()).start().await.unwrap();
    assert_eq!(conn.num_subscriptions(), 2);

    stopped.stop().await;
    assert_eq!(stopped.phase(), ConsumerPhase::Stopped);
    assert_eq!(conn.num_subscriptions(), 1);
    assert!(matches!(
        stopped.next(Duration::from_millis(10)).await,
        Err(ClientError::InvalidOperation(_))
    ));

    let waiter = tokio::spawn(async move {
        let result = running.next(Duration::from_secs(10)).await;
        (result, running)
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    conn.close().await;

    let (result, running) = tokio::time::timeout(WAIT, waiter).await.unwrap().unwrap();
    assert!(matches!(result, Err(ClientError::ConnectionClosed)));
    assert!(eventually(WAIT, || running.phase() == ConsumerPhase::Stopped).await);

    assert!(matches!(
        conn.ordered_consumer(config()).start().await,
        Err(ClientError::BadSubscription)
    ));
}
