//! Ordered consumers: gapless, in-order stream delivery over unreliable sessions.
//!
//! An `OrderedConsumer` owns one delivery endpoint (pending queue, counters, optional
//! handler) and keeps exactly one underlying subscription bound to an ephemeral
//! server-side consumer. The subscription is disposable: whenever loss is suspected
//! it is torn down and a fresh one is created that resumes right after the last
//! stream sequence admitted to the endpoint. The caller never sees the swap.
//!
//! # Phases
//!
//! `Starting -> Active -> Recovering -> Active ... -> Stopped`
//!
//! # Loss detection
//!
//! A sequence tracker sits in front of the pending queue (as the route's
//! `MessageManager`) and checks every message before it is admitted:
//! - a delivery must carry the next consumer sequence, counting from 1 on every new
//!   server-side consumer
//! - a heartbeat reporting more deliveries than were received means messages were lost
//! - a message the pending queue rejects (overflow) is lost as well
//!
//! Recovery after an overflow waits until the caller has drained the pending queue to
//! half its limits, so a slow caller is not answered with a resubscribe per message.
//!
//! Independently, a control task expects a message or heartbeat at least every
//! `idle_heartbeat × heartbeat_margin`; silence means the server forgot the consumer.
//! A reconnect of the connection also triggers recovery, because ordered routes are
//! not replayed by the registry.
//!
//! # Consumption modes
//!
//! `next`, `fetch` and `consume` are mutually exclusive. Starting a second mode while
//! one is attached fails with `InvalidOperation`.
//!
//! # Usage
//!
//! ```ignore
//! let consumer = conn
//!     .ordered_consumer(OrderedConsumerConfig::new("ORDERS").filter_subject("orders.>"))
//!     .start()
//!     .await?;
//!
//! let batch = consumer.fetch(100, Duration::from_secs(1)).await?;
//! let handle = consumer.consume(|msg: Message| async move { handle(msg).await }).await?;
//! handle.stop();
//! ```
//!
//! Tests can inject a `MessageManagerFactory` to wrap the sequence tracker, for example
//! to drop frames on purpose.

use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, RouteSpec, Shared},
    error::ClientError,
    events::{EventKind, ListenerId},
    message::{Message, StreamMeta},
    subject::validate_subject,
    subscription::{Delivery, InvalidReason, MessageHandler, MessageManager, PendingSink},
    transport::{ConsumerSpec, DeliverPolicy},
};

/// Configuration of one ordered consumer.
#[derive(Debug, Clone)]
pub struct OrderedConsumerConfig {
    pub stream: String,

    /// Subjects of the stream to deliver. Defaults to every subject (`>`).
    pub filter_subject: String,

    /// First stream sequence to deliver. `None` delivers the whole stream.
    pub start_sequence: Option<u64>,

    /// Overrides `Options::idle_heartbeat_ms`. Zero disables heartbeat monitoring.
    pub idle_heartbeat: Option<Duration>,

    /// Overrides `Options::heartbeat_margin`.
    pub heartbeat_margin: Option<f64>,

    pub pending_msgs_limit: Option<usize>,
    pub pending_bytes_limit: Option<usize>,

    /// Pause between failed resubscribe attempts.
    pub recovery_delay: Duration,
}

impl OrderedConsumerConfig {
    pub fn new(stream: impl Into<String>) -> Self {
        OrderedConsumerConfig {
            stream: stream.into(),
            filter_subject: ">".into(),
            start_sequence: None,
            idle_heartbeat: None,
            heartbeat_margin: None,
            pending_msgs_limit: None,
            pending_bytes_limit: None,
            recovery_delay: Duration::from_millis(250),
        }
    }

    pub fn filter_subject(mut self, subject: impl Into<String>) -> Self {
        self.filter_subject = subject.into();
        self
    }

    pub fn start_sequence(mut self, seq: u64) -> Self {
        self.start_sequence = Some(seq);
        self
    }

    pub fn idle_heartbeat(mut self, interval: Duration) -> Self {
        self.idle_heartbeat = Some(interval);
        self
    }

    pub fn heartbeat_margin(mut self, margin: f64) -> Self {
        self.heartbeat_margin = Some(margin);
        self
    }

    pub fn pending_limits(mut self, max_msgs: usize, max_bytes: usize) -> Self {
        self.pending_msgs_limit = Some(max_msgs);
        self.pending_bytes_limit = Some(max_bytes);
        self
    }

    pub fn recovery_delay(mut self, delay: Duration) -> Self {
        self.recovery_delay = delay;
        self
    }
}

/// Builds the message manager installed on each underlying subscription.
///
/// `wrap` receives the sequence tracker and returns what the reader loop will call.
/// The default returns the tracker unchanged; a custom factory can put a decorator in
/// front of it.
pub trait MessageManagerFactory: Send + Sync + 'static {
    fn wrap(&self, tracker: Arc<dyn MessageManager>) -> Arc<dyn MessageManager>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMessageManagerFactory;

impl MessageManagerFactory for DefaultMessageManagerFactory {
    fn wrap(&self, tracker: Arc<dyn MessageManager>) -> Arc<dyn MessageManager> {
        tracker
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerPhase {
    /// Waiting for the first underlying subscription.
    Starting,
    Active,
    /// Loss suspected, a replacement subscription is being created.
    Recovering,
    Stopped,
}

impl ConsumerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerPhase::Starting => "starting",
            ConsumerPhase::Active => "active",
            ConsumerPhase::Recovering => "recovering",
            ConsumerPhase::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ConsumerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters of an ordered consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderedStats {
    /// Messages handed to the caller.
    pub delivered: u64,
    /// Stream sequence of the last message handed to the caller.
    pub last_stream_seq: u64,
    /// Underlying subscriptions replaced.
    pub recoveries: u64,
    /// Sequence gaps detected.
    pub gaps: u64,
    pub heartbeat_timeouts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Next,
    Fetch,
    Consume,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Next => f.write_str("next"),
            Mode::Fetch => f.write_str("fetch"),
            Mode::Consume => f.write_str("consume"),
        }
    }
}

struct Track {
    phase: ConsumerPhase,
    /// Bumped for every underlying subscription; trackers of older ones go quiet.
    generation: u64,
    route_sid: Option<u64>,
    /// Consumer sequence the next delivery must carry.
    expected_consumer: u64,
    /// Stream sequence of the last message admitted to the pending queue.
    last_admitted: u64,
    /// Stream sequence of the last message handed to the caller.
    last_delivered: u64,
    /// The pending gap was caused by a full queue.
    overflowed: bool,
    deadline: Option<Instant>,
    stats: OrderedStats,
}

struct OrderedInner {
    shared: Arc<Shared>,
    config: OrderedConsumerConfig,
    idle_heartbeat: Duration,
    /// Silence tolerated before the consumer is presumed lost. `None` disables the check.
    threshold: Option<Duration>,
    factory: Arc<dyn MessageManagerFactory>,
    delivery: Arc<Delivery>,
    track: Mutex<Track>,
    recover: Notify,
    /// Fired whenever the caller takes a message from the pending queue.
    drained: Notify,
    cancel: CancellationToken,
    mode: Mutex<Option<Mode>>,
    listener: Mutex<Option<ListenerId>>,
}

impl OrderedInner {
    fn next_deadline(&self) -> Option<Instant> {
        self.threshold.map(|threshold| Instant::now() + threshold)
    }

    /// Moves an active consumer to `Recovering` and wakes the control task.
    fn begin_recovery(&self, reason: &str) {
        {
            let mut track = self.track.lock();
            if track.phase != ConsumerPhase::Active {
                return;
            }
            track.phase = ConsumerPhase::Recovering;
        }
        warn!(
            "Ordered consumer on {} recovering: {reason}",
            self.config.stream
        );
        self.recover.notify_one();
    }

    /// Reader-path admission for the route of `generation`.
    fn admit(self: &Arc<Self>, generation: u64, msg: Message, sink: &dyn PendingSink) {
        let mut track = self.track.lock();
        if track.generation != generation || track.phase != ConsumerPhase::Active {
            // Leftover of a replaced subscription.
            return;
        }
        track.deadline = self.next_deadline();

        let gap = match msg.stream {
            Some(StreamMeta::Heartbeat { last }) => {
                // The server sent more than we received.
                (last.consumer >= track.expected_consumer).then(|| {
                    format!(
                        "heartbeat reports consumer sequence {}, expected {}",
                        last.consumer,
                        track.expected_consumer - 1
                    )
                })
            }
            Some(StreamMeta::Delivery(pair)) if pair.consumer != track.expected_consumer => {
                Some(format!(
                    "consumer sequence {} received, {} expected",
                    pair.consumer, track.expected_consumer
                ))
            }
            Some(StreamMeta::Delivery(pair)) => {
                track.expected_consumer += 1;
                if pair.stream <= track.last_admitted {
                    debug!("Skipping already admitted stream sequence {}", pair.stream);
                    None
                } else if sink.push(msg) {
                    track.last_admitted = pair.stream;
                    None
                } else {
                    track.overflowed = true;
                    Some(format!("stream sequence {} dropped by a full queue", pair.stream))
                }
            }
            None => {
                debug!("Ignoring message without stream metadata on {}", msg.subject);
                None
            }
        };

        if let Some(reason) = gap {
            track.stats.gaps += 1;
            drop(track);
            self.begin_recovery(&reason);
        }
    }

    /// Registers a message handed to the caller. False for anything not newer than the
    /// last one.
    fn accept(&self, msg: &Message) -> bool {
        self.drained.notify_one();
        let Some(pair) = msg.sequence() else {
            return false;
        };
        let mut track = self.track.lock();
        if pair.stream <= track.last_delivered {
            return false;
        }
        track.last_delivered = pair.stream;
        track.stats.delivered += 1;
        track.stats.last_stream_seq = pair.stream;
        true
    }

    /// Waits until the connection has a live session.
    async fn wait_connected(&self) -> Result<(), ClientError> {
        let mut state = self.shared.subscribe_state();
        loop {
            let current = *state.borrow_and_update();
            if current.is_closed() {
                return Err(ClientError::ConnectionClosed);
            }
            if current.is_connected() {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ClientError::Cancelled),
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(ClientError::ConnectionClosed);
                    }
                }
            }
        }
    }

    /// Waits until the pending queue is at most half full.
    async fn wait_drained(&self) -> Result<(), ClientError> {
        loop {
            if self.delivery.is_half_empty() {
                return Ok(());
            }
            if !self.delivery.is_valid() {
                return Err(ClientError::Cancelled);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = self.drained.notified() => {}
            }
        }
    }

    /// Replaces the underlying subscription with one resuming after the last admitted
    /// stream sequence.
    async fn resubscribe(self: &Arc<Self>) -> Result<(), ClientError> {
        self.wait_connected().await?;

        let (generation, old_sid, deliver) = {
            let mut track = self.track.lock();
            match track.phase {
                ConsumerPhase::Stopped => return Err(ClientError::Cancelled),
                ConsumerPhase::Recovering => track.stats.recoveries += 1,
                ConsumerPhase::Starting | ConsumerPhase::Active => {}
            }
            track.generation += 1;
            track.expected_consumer = 1;
            track.overflowed = false;
            track.phase = ConsumerPhase::Active;
            track.deadline = self.next_deadline();

            let deliver = if track.last_admitted > 0 {
                DeliverPolicy::ByStartSequence(track.last_admitted + 1)
            } else {
                self.config
                    .start_sequence
                    .map_or(DeliverPolicy::All, DeliverPolicy::ByStartSequence)
            };
            (track.generation, track.route_sid.take(), deliver)
        };

        if let Some(sid) = old_sid {
            self.shared.withdraw_route(sid).await;
        }

        let tracker: Arc<dyn MessageManager> = Arc::new(SequenceTracker {
            inner: Arc::downgrade(self),
            generation,
        });
        let (max_msgs, max_bytes) = self.delivery.limits();

        let result = self
            .shared
            .subscribe_route(RouteSpec {
                subject: self.config.filter_subject.clone(),
                queue_group: None,
                consumer: Some(ConsumerSpec {
                    stream: self.config.stream.clone(),
                    deliver,
                    idle_heartbeat: self.idle_heartbeat,
                }),
                manager: Some(self.factory.wrap(tracker)),
                delivery: Some(self.delivery.clone()),
                handler: None,
                pending_msgs_limit: max_msgs,
                pending_bytes_limit: max_bytes,
                resend: false,
            })
            .await;

        match result {
            Ok(route) => {
                let superseded = {
                    let mut track = self.track.lock();
                    if track.generation == generation {
                        track.route_sid = Some(route.sid);
                        false
                    } else {
                        true
                    }
                };
                if superseded {
                    self.shared.withdraw_route(route.sid).await;
                } else {
                    info!(
                        "Ordered consumer on {} subscribed as {} ({deliver:?})",
                        self.config.stream, route.sid
                    );
                }
                Ok(())
            }
            Err(e) => {
                let mut track = self.track.lock();
                if track.generation == generation && track.phase == ConsumerPhase::Active {
                    track.phase = ConsumerPhase::Recovering;
                }
                Err(e)
            }
        }
    }

    /// Control task: resubscribes when needed and watches the heartbeat deadline.
    async fn run(self: Arc<Self>) {
        loop {
            let (phase, deadline) = {
                let track = self.track.lock();
                (track.phase, track.deadline)
            };

            match phase {
                ConsumerPhase::Stopped => return,
                ConsumerPhase::Starting | ConsumerPhase::Recovering => {
                    if self.track.lock().overflowed {
                        debug!(
                            "Ordered consumer on {} waiting for the caller to drain its queue",
                            self.config.stream
                        );
                        if self.wait_drained().await.is_err() {
                            self.mark_stopped();
                            return;
                        }
                    }
                    match self.resubscribe().await {
                        Ok(()) => {}
                        Err(ClientError::ConnectionClosed | ClientError::Cancelled) => {
                            self.mark_stopped();
                            return;
                        }
                        Err(e) => {
                            warn!(
                                "Resubscribe of ordered consumer on {} failed: {e}",
                                self.config.stream
                            );
                            tokio::select! {
                                _ = self.cancel.cancelled() => {
                                    self.mark_stopped();
                                    return;
                                }
                                _ = tokio::time::sleep(self.config.recovery_delay) => {}
                            }
                        }
                    }
                }
                ConsumerPhase::Active => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.mark_stopped();
                            return;
                        }
                        _ = self.recover.notified() => {}
                        _ = sleep_until(deadline) => self.check_deadline(),
                    }
                }
            }
        }
    }

    fn check_deadline(&self) {
        let expired = {
            let mut track = self.track.lock();
            let expired = track.phase == ConsumerPhase::Active
                && track.deadline.is_some_and(|d| Instant::now() >= d);
            if expired {
                track.stats.heartbeat_timeouts += 1;
            }
            expired
        };
        if expired {
            self.begin_recovery("no message or heartbeat within the heartbeat threshold");
        }
    }

    fn mark_stopped(&self) {
        self.track.lock().phase = ConsumerPhase::Stopped;
        if self.shared.is_closed() {
            // Wakes pulls even when no route was registered at close time.
            self.delivery.invalidate(InvalidReason::ConnectionClosed);
        }
    }

    async fn shutdown(self: &Arc<Self>) {
        let sid = {
            let mut track = self.track.lock();
            if track.phase == ConsumerPhase::Stopped && track.route_sid.is_none() {
                return;
            }
            track.phase = ConsumerPhase::Stopped;
            track.generation += 1;
            track.route_sid.take()
        };

        self.cancel.cancel();
        self.delivery.set_handler(None);
        self.delivery.invalidate(InvalidReason::Unsubscribed);
        if let Some(sid) = sid {
            self.shared.withdraw_route(sid).await;
        }
        if let Some(id) = self.listener.lock().take() {
            self.shared.remove_listener(id);
        }
        info!("Ordered consumer on {} stopped", self.config.stream);
    }

    fn acquire(self: &Arc<Self>, mode: Mode) -> Result<ModeGuard, ClientError> {
        if self.track.lock().phase == ConsumerPhase::Stopped {
            return Err(if self.shared.is_closed() {
                ClientError::ConnectionClosed
            } else {
                ClientError::InvalidOperation("ordered consumer stopped".into())
            });
        }

        let mut current = self.mode.lock();
        if let Some(active) = *current {
            return Err(ClientError::InvalidOperation(format!(
                "{active} already attached to this ordered consumer"
            )));
        }
        *current = Some(mode);
        Ok(ModeGuard {
            inner: self.clone(),
        })
    }

    async fn next_inner(
        &self,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Message, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (msg, _) = self.delivery.next(remaining, cancel).await?;
            if self.accept(&msg) {
                return Ok(msg);
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Message manager checking sequence continuity for one underlying subscription.
struct SequenceTracker {
    inner: Weak<OrderedInner>,
    generation: u64,
}

impl MessageManager for SequenceTracker {
    fn process(&self, msg: Message, sink: &dyn PendingSink) {
        if let Some(inner) = self.inner.upgrade() {
            inner.admit(self.generation, msg, sink);
        }
    }
}

/// Releases the consumption mode when dropped.
struct ModeGuard {
    inner: Arc<OrderedInner>,
}

impl Drop for ModeGuard {
    fn drop(&mut self) {
        *self.inner.mode.lock() = None;
    }
}

/// Push handler filtering out anything already handed to the caller.
struct OrderedHandler {
    inner: Weak<OrderedInner>,
    user: Arc<dyn MessageHandler>,
}

#[async_trait]
impl MessageHandler for OrderedHandler {
    async fn handle(&self, msg: Message) {
        let accepted = self
            .inner
            .upgrade()
            .is_some_and(|inner| inner.accept(&msg));
        if accepted {
            self.user.handle(msg).await;
        }
    }
}

/// Builder for `OrderedConsumer`.
pub struct OrderedConsumerBuilder {
    conn: Connection,
    config: OrderedConsumerConfig,
    factory: Arc<dyn MessageManagerFactory>,
}

impl OrderedConsumerBuilder {
    pub(crate) fn new(conn: Connection, config: OrderedConsumerConfig) -> Self {
        OrderedConsumerBuilder {
            conn,
            config,
            factory: Arc::new(DefaultMessageManagerFactory),
        }
    }

    /// Injects the factory wrapping the sequence tracker of every underlying
    /// subscription.
    pub fn message_manager_factory<F: MessageManagerFactory>(mut self, factory: F) -> Self {
        self.factory = Arc::new(factory);
        self
    }

    pub fn message_manager_factory_arc(mut self, factory: Arc<dyn MessageManagerFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Creates the consumer and its first underlying subscription.
    ///
    /// When the connection is reconnecting the first subscription is created in the
    /// background once a session is up.
    ///
    /// # Errors
    /// - `InvalidOperation`: empty stream name or zero pending limits
    /// - `InvalidSubject`: bad filter subject
    /// - `BadSubscription` / `ConnectionClosed`: the connection is closed
    pub async fn start(self) -> Result<OrderedConsumer, ClientError> {
        let OrderedConsumerBuilder {
            conn,
            config,
            factory,
        } = self;

        if config.stream.is_empty() {
            return Err(ClientError::InvalidOperation("empty stream name".into()));
        }
        validate_subject(&config.filter_subject)?;

        let shared = conn.shared().clone();
        if shared.is_closed() {
            return Err(ClientError::BadSubscription);
        }

        let max_msgs = config
            .pending_msgs_limit
            .unwrap_or(shared.options.pending_msgs_limit);
        let max_bytes = config
            .pending_bytes_limit
            .unwrap_or(shared.options.pending_bytes_limit);
        if max_msgs == 0 || max_bytes == 0 {
            return Err(ClientError::InvalidOperation(
                "pending limits must be positive".into(),
            ));
        }

        let idle_heartbeat = config
            .idle_heartbeat
            .unwrap_or_else(|| shared.options.idle_heartbeat());
        let margin = config
            .heartbeat_margin
            .unwrap_or(shared.options.heartbeat_margin)
            .max(1.0);
        let threshold = (!idle_heartbeat.is_zero()).then(|| idle_heartbeat.mul_f64(margin));

        let inner = Arc::new(OrderedInner {
            delivery: Arc::new(Delivery::new(shared.next_id(), max_msgs, max_bytes, None)),
            cancel: shared.cancel.child_token(),
            shared,
            config,
            idle_heartbeat,
            threshold,
            factory,
            track: Mutex::new(Track {
                phase: ConsumerPhase::Starting,
                generation: 0,
                route_sid: None,
                expected_consumer: 1,
                last_admitted: 0,
                last_delivered: 0,
                overflowed: false,
                deadline: None,
                stats: OrderedStats::default(),
            }),
            recover: Notify::new(),
            drained: Notify::new(),
            mode: Mutex::new(None),
            listener: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let id = inner
            .shared
            .add_listener(EventKind::Reconnected, move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.begin_recovery("connection reconnected");
                }
            });
        *inner.listener.lock() = Some(id);

        if inner.shared.state().is_connected() {
            match inner.resubscribe().await {
                Ok(()) => {}
                Err(e @ (ClientError::ConnectionClosed | ClientError::BadSubscription)) => {
                    inner.shutdown().await;
                    return Err(e);
                }
                Err(e) => warn!("First subscription of ordered consumer failed, retrying: {e}"),
            }
        }

        tokio::spawn(inner.clone().run());
        info!(
            "Ordered consumer started on stream {} ({})",
            inner.config.stream, inner.config.filter_subject
        );

        Ok(OrderedConsumer { inner, conn })
    }
}

/// Handle to an ordered consumer. Dropping it stops the consumer.
pub struct OrderedConsumer {
    inner: Arc<OrderedInner>,
    conn: Connection,
}

impl OrderedConsumer {
    pub fn phase(&self) -> ConsumerPhase {
        self.inner.track.lock().phase
    }

    pub fn stats(&self) -> OrderedStats {
        self.inner.track.lock().stats
    }

    pub fn stream(&self) -> &str {
        &self.inner.config.stream
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Waits up to `timeout` for the next message in stream order.
    ///
    /// # Errors
    /// - `Timeout`
    /// - `InvalidOperation`: another consumption mode is attached, or the consumer
    ///   was stopped
    /// - `ConnectionClosed`
    pub async fn next(&self, timeout: Duration) -> Result<Message, ClientError> {
        let _guard = self.inner.acquire(Mode::Next)?;
        self.inner.next_inner(timeout, None).await
    }

    /// Like `next`, returning `Cancelled` as soon as `cancel` fires.
    pub async fn next_with_cancel(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Message, ClientError> {
        let _guard = self.inner.acquire(Mode::Next)?;
        self.inner.next_inner(timeout, Some(cancel)).await
    }

    /// Collects up to `max` messages, returning early when `max` is reached and with
    /// whatever arrived once `expires` elapses.
    ///
    /// Fails only when nothing was collected and the connection closed.
    pub async fn fetch(&self, max: usize, expires: Duration) -> Result<Vec<Message>, ClientError> {
        let _guard = self.inner.acquire(Mode::Fetch)?;
        let deadline = Instant::now() + expires;
        let mut batch = Vec::with_capacity(max.min(1024));

        while batch.len() < max {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.inner.next_inner(remaining, None).await {
                Ok(msg) => batch.push(msg),
                Err(ClientError::Timeout) => break,
                Err(e) if batch.is_empty() => return Err(e),
                Err(_) => break,
            }
        }

        Ok(batch)
    }

    /// Delivers every message to `handler` on a delivery worker until the returned
    /// handle is stopped or dropped.
    pub async fn consume<H: MessageHandler>(&self, handler: H) -> Result<ConsumeHandle, ClientError> {
        let guard = self.inner.acquire(Mode::Consume)?;

        let handler: Arc<dyn MessageHandler> = Arc::new(OrderedHandler {
            inner: Arc::downgrade(&self.inner),
            user: Arc::new(handler),
        });
        self.inner.delivery.set_handler(Some(handler));
        if self.inner.delivery.has_pending() {
            self.inner.shared.dispatcher.schedule(&self.inner.delivery);
        }

        debug!("Handler attached to ordered consumer on {}", self.stream());
        Ok(ConsumeHandle { guard: Some(guard) })
    }

    /// Stops the consumer and removes its underlying subscription.
    pub async fn stop(&self) {
        self.inner.shutdown().await;
    }
}

impl Drop for OrderedConsumer {
    fn drop(&mut self) {
        let finished = {
            let track = self.inner.track.lock();
            track.phase == ConsumerPhase::Stopped && track.route_sid.is_none()
        };
        if finished {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            runtime.spawn(async move { inner.shutdown().await });
        } else {
            self.inner.cancel.cancel();
        }
    }
}

impl fmt::Debug for OrderedConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedConsumer")
            .field("stream", &self.inner.config.stream)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Attachment of a push handler to an ordered consumer.
///
/// Stopping (or dropping) detaches the handler; messages keep queuing and can be
/// consumed again with another mode.
pub struct ConsumeHandle {
    guard: Option<ModeGuard>,
}

impl ConsumeHandle {
    pub fn stop(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.inner.delivery.set_handler(None);
        }
    }
}

impl Drop for ConsumeHandle {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Options, connection::ConnectionBuilder, message::SequencePair,
        transport::memory::MemoryNetwork,
    };

    struct VecSink(std::sync::Mutex<Vec<u64>>);

    impl PendingSink for VecSink {
        fn push(&self, msg: Message) -> bool {
            self.0
                .lock()
                .unwrap()
                .push(msg.sequence().map_or(0, |p| p.stream));
            true
        }
    }

    fn delivery(stream: u64, consumer: u64) -> Message {
        let mut msg = Message::new("s", "x");
        msg.stream = Some(StreamMeta::Delivery(SequencePair::new(stream, consumer)));
        msg
    }

    async fn consumer_on(network: &MemoryNetwork) -> (Connection, OrderedConsumer) {
        network.add_node("nats://a:4222").unwrap();
        network.add_stream("S", &["s.>"]);
        let conn = ConnectionBuilder::new(Options::with_servers(["nats://a:4222"]))
            .transport(network.clone())
            .connect()
            .await
            .unwrap();
        let consumer = conn
            .ordered_consumer(OrderedConsumerConfig::new("S").idle_heartbeat(Duration::ZERO))
            .start()
            .await
            .unwrap();
        (conn, consumer)
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(ConsumerPhase::Recovering.to_string(), "recovering");
        assert_eq!(ConsumerPhase::Active.as_str(), "active");
    }

    #[tokio::test]
    async fn test_tracker_detects_consumer_gap() {
        let network = MemoryNetwork::new();
        let (_conn, consumer) = consumer_on(&network).await;
        let inner = consumer.inner.clone();
        let generation = inner.track.lock().generation;
        let sink = VecSink(std::sync::Mutex::new(Vec::new()));

        inner.admit(generation, delivery(1, 1), &sink);
        inner.admit(generation, delivery(3, 3), &sink);

        assert_eq!(*sink.0.lock().unwrap(), vec![1]);
        let stats = consumer.stats();
        assert_eq!(stats.gaps, 1);
    }

    #[tokio::test]
    async fn test_tracker_ignores_stale_generation() {
        let network = MemoryNetwork::new();
        let (_conn, consumer) = consumer_on(&network).await;
        let inner = consumer.inner.clone();
        let generation = inner.track.lock().generation;
        let sink = VecSink(std::sync::Mutex::new(Vec::new()));

        inner.admit(generation - 1, delivery(1, 1), &sink);
        assert!(sink.0.lock().unwrap().is_empty());
        assert_eq!(consumer.stats().gaps, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_ahead_of_received_is_a_gap() {
        let network = MemoryNetwork::new();
        let (_conn, consumer) = consumer_on(&network).await;
        let inner = consumer.inner.clone();
        let generation = inner.track.lock().generation;
        let sink = VecSink(std::sync::Mutex::new(Vec::new()));

        let mut heartbeat = Message::new("s", "");
        heartbeat.stream = Some(StreamMeta::Heartbeat {
            last: SequencePair::new(0, 0),
        });
        inner.admit(generation, heartbeat.clone(), &sink);
        assert_eq!(consumer.stats().gaps, 0);

        heartbeat.stream = Some(StreamMeta::Heartbeat {
            last: SequencePair::new(5, 2),
        });
        inner.admit(generation, heartbeat, &sink);
        assert_eq!(consumer.stats().gaps, 1);
    }

    #[tokio::test]
    async fn test_second_mode_is_rejected() {
        let network = MemoryNetwork::new();
        let (_conn, consumer) = consumer_on(&network).await;

        let handle = consumer.consume(|_msg: Message| async {}).await.unwrap();
        let result = consumer.next(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(ClientError::InvalidOperation(_))));

        handle.stop();
        let result = consumer.next(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(ClientError::Timeout)));
    }

    #[tokio::test]
    async fn test_accept_is_strictly_increasing() {
        let network = MemoryNetwork::new();
        let (_conn, consumer) = consumer_on(&network).await;
        let inner = &consumer.inner;

        assert!(inner.accept(&delivery(1, 1)));
        assert!(inner.accept(&delivery(2, 2)));
        assert!(!inner.accept(&delivery(2, 1)));
        assert_eq!(consumer.stats().last_stream_seq, 2);
        assert_eq!(consumer.stats().delivered, 2);
    }

    #[tokio::test]
    async fn test_stop_rejects_further_pulls() {
        let network = MemoryNetwork::new();
        let (_conn, consumer) = consumer_on(&network).await;
        consumer.stop().await;
        assert_eq!(consumer.phase(), ConsumerPhase::Stopped);
        assert!(consumer.next(Duration::from_millis(10)).await.is_err());
    }
}
