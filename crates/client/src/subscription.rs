//! Subscriptions, their bounded pending queues and delivery modes.
//!
//! A subscription is split in two layers:
//!
//! - `SubscriptionInner` is the *route*: the server-side interest identified by a
//!   subscription id (sid). The registry maps sids to routes and the reader loop
//!   uses it to find where an inbound message goes.
//! - `Delivery` is the *endpoint*: the bounded pending queue, its counters and the
//!   optional callback handler. For ordinary subscriptions route and endpoint are
//!   one-to-one. An ordered consumer keeps one endpoint while its routes come and go.
//!
//! # Backpressure
//!
//! A message that would push the queue over either limit (message count or payload
//! bytes) is dropped, `dropped` increments and the first drop of an overflow episode
//! is reported as a `SlowConsumer` async error. The episode ends when a message is
//! accepted again, so a stuck consumer produces exactly one report.
//!
//! # Delivery modes
//!
//! - Pull: `Subscription::next_msg` waits on the endpoint's `Notify` with a timeout
//!   and optional cancellation token. Dropping the future leaves nothing registered.
//! - Push: the handler is driven by the delivery worker the endpoint hashes to.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    connection::Connection,
    error::ClientError,
    message::Message,
    transport::{ConsumerSpec, Frame},
};

/// Callback invoked for every message of a push subscription.
///
/// Handlers of one subscription run strictly one after another in arrival order.
/// A handler that takes long only delays the subscriptions sharing its worker.
///
/// Any `Fn(Message) -> impl Future<Output = ()>` closure is a handler:
///
/// ```ignore
/// conn.subscribe_with("orders.>", |msg: Message| async move {
///     println!("{}", msg.subject);
/// }).await?;
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, msg: Message);
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, msg: Message) {
        (self)(msg).await
    }
}

/// Admission step between the reader loop and a subscription's pending queue.
///
/// Ordinary subscriptions have none: messages go straight to the queue. Ordered
/// consumers install a sequence tracker here so loss is detected before a message
/// is admitted.
pub trait MessageManager: Send + Sync + 'static {
    /// Called on the reader path for every message routed to the subscription.
    fn process(&self, msg: Message, sink: &dyn PendingSink);
}

/// Target a `MessageManager` admits messages into.
pub trait PendingSink {
    /// Enqueues `msg`. Returns false when the message was dropped.
    fn push(&self, msg: Message) -> bool;
}

/// Why an endpoint stopped accepting and delivering messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InvalidReason {
    Unsubscribed,
    ConnectionClosed,
}

impl InvalidReason {
    fn into_error(self) -> ClientError {
        match self {
            InvalidReason::Unsubscribed => ClientError::BadSubscription,
            InvalidReason::ConnectionClosed => ClientError::ConnectionClosed,
        }
    }
}

pub(crate) enum Enqueued {
    Queued,
    /// `first` is true for the first drop of an overflow episode.
    Dropped { first: bool },
    Invalid,
}

pub(crate) enum Popped {
    /// `exhausted` is true when this message reached the auto-unsubscribe limit.
    Message { msg: Message, exhausted: bool },
    Empty,
    Invalid(InvalidReason),
}

struct PendingState {
    msgs: VecDeque<Message>,
    bytes: usize,
    max_msgs: usize,
    max_bytes: usize,
    slow: bool,
    delivered: u64,
    dropped: u64,
    max_delivered: Option<u64>,
    invalid: Option<InvalidReason>,
}

/// Delivery endpoint: bounded FIFO, counters and optional push handler.
pub(crate) struct Delivery {
    id: u64,
    state: Mutex<PendingState>,
    notify: Notify,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    scheduled: AtomicBool,
}

impl Delivery {
    pub(crate) fn new(
        id: u64,
        max_msgs: usize,
        max_bytes: usize,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> Self {
        Delivery {
            id,
            state: Mutex::new(PendingState {
                msgs: VecDeque::new(),
                bytes: 0,
                max_msgs,
                max_bytes,
                slow: false,
                delivered: 0,
                dropped: 0,
                max_delivered: None,
                invalid: None,
            }),
            notify: Notify::new(),
            handler: RwLock::new(handler),
            scheduled: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn push(&self, msg: Message) -> Enqueued {
        {
            let mut state = self.state.lock();
            if state.invalid.is_some() {
                return Enqueued::Invalid;
            }

            let size = msg.size();
            if state.msgs.len() >= state.max_msgs || state.bytes + size > state.max_bytes {
                state.dropped += 1;
                let first = !state.slow;
                state.slow = true;
                return Enqueued::Dropped { first };
            }

            state.slow = false;
            state.bytes += size;
            state.msgs.push_back(msg);
        }

        self.notify.notify_waiters();
        Enqueued::Queued
    }

    pub(crate) fn pop(&self) -> Popped {
        let popped = {
            let mut state = self.state.lock();
            if let Some(reason) = state.invalid {
                return Popped::Invalid(reason);
            }

            let Some(msg) = state.msgs.pop_front() else {
                return Popped::Empty;
            };

            state.bytes = state.bytes.saturating_sub(msg.size());
            state.delivered += 1;

            let exhausted = state
                .max_delivered
                .is_some_and(|max| state.delivered >= max);
            if exhausted {
                state.invalid = Some(InvalidReason::Unsubscribed);
                state.msgs.clear();
                state.bytes = 0;
            }

            Popped::Message { msg, exhausted }
        };

        if matches!(popped, Popped::Message { exhausted: true, .. }) {
            self.notify.notify_waiters();
        }
        popped
    }

    /// Waits for the next message.
    ///
    /// # Returns
    /// - `Ok((msg, exhausted))`: the oldest pending message; `exhausted` means it was
    ///   the last one allowed by auto-unsubscribe
    /// - `Err(Timeout | Cancelled)`: nothing arrived in time
    /// - `Err(BadSubscription | ConnectionClosed)`: the endpoint was invalidated
    pub(crate) async fn next(
        &self,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<(Message, bool), ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.pop() {
                Popped::Message { msg, exhausted } => return Ok((msg, exhausted)),
                Popped::Invalid(reason) => return Err(reason.into_error()),
                Popped::Empty => {}
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Err(ClientError::Timeout),
                _ = cancelled(cancel) => return Err(ClientError::Cancelled),
            }
        }
    }

    /// Marks the endpoint invalid, discards pending messages and wakes waiters.
    ///
    /// The first reason sticks.
    pub(crate) fn invalidate(&self, reason: InvalidReason) {
        {
            let mut state = self.state.lock();
            state.invalid.get_or_insert(reason);
            state.msgs.clear();
            state.bytes = 0;
        }
        self.notify.notify_waiters();
    }

    /// Sets the auto-unsubscribe limit.
    ///
    /// # Returns
    /// `true` when the limit is already reached and the endpoint was invalidated.
    pub(crate) fn set_max_delivered(&self, max: u64) -> bool {
        let reached = {
            let mut state = self.state.lock();
            state.max_delivered = Some(max);
            state.delivered >= max
        };
        if reached {
            self.invalidate(InvalidReason::Unsubscribed);
        }
        reached
    }

    pub(crate) fn remaining(&self) -> Option<u64> {
        let state = self.state.lock();
        state
            .max_delivered
            .map(|max| max.saturating_sub(state.delivered))
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.state.lock().invalid.is_none()
    }

    pub(crate) fn pending(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.msgs.len(), state.bytes)
    }

    /// True when the queue holds at most half of either limit.
    pub(crate) fn is_half_empty(&self) -> bool {
        let state = self.state.lock();
        state.msgs.len() <= state.max_msgs / 2 && state.bytes <= state.max_bytes / 2
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.state.lock().msgs.is_empty()
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.state.lock().delivered
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    pub(crate) fn limits(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.max_msgs, state.max_bytes)
    }

    pub(crate) fn set_limits(&self, max_msgs: usize, max_bytes: usize) {
        let mut state = self.state.lock();
        state.max_msgs = max_msgs;
        state.max_bytes = max_bytes;
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler.read().clone()
    }

    pub(crate) fn set_handler(&self, handler: Option<Arc<dyn MessageHandler>>) {
        *self.handler.write() = handler;
    }

    pub(crate) fn is_push(&self) -> bool {
        self.handler.read().is_some()
    }

    /// Claims the endpoint for a delivery worker. False when already claimed.
    pub(crate) fn try_schedule(&self) -> bool {
        !self.scheduled.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn unschedule(&self) {
        self.scheduled.store(false, Ordering::Release);
    }
}

async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// A registered server-side interest.
pub(crate) struct SubscriptionInner {
    pub(crate) sid: u64,
    pub(crate) subject: String,
    pub(crate) queue_group: Option<String>,
    pub(crate) consumer: Option<ConsumerSpec>,

    /// Whether the registry re-registers the interest after a reconnect.
    pub(crate) resend: bool,

    pub(crate) manager: Option<Arc<dyn MessageManager>>,
    pub(crate) delivery: Arc<Delivery>,
}

impl SubscriptionInner {
    pub(crate) fn sub_frame(&self) -> Frame {
        Frame::Sub {
            sid: self.sid,
            subject: self.subject.clone(),
            queue_group: self.queue_group.clone(),
            consumer: self.consumer.clone(),
        }
    }

    /// Frames that re-establish this interest on a fresh session.
    ///
    /// The auto-unsubscribe limit is resent as the number of messages still allowed,
    /// since the new server counts from zero.
    pub(crate) fn resend_frames(&self) -> Vec<Frame> {
        let mut frames = vec![self.sub_frame()];
        if let Some(remaining) = self.delivery.remaining() {
            frames.push(Frame::Unsub {
                sid: self.sid,
                max: Some(remaining),
            });
        }
        frames
    }
}

/// Options for `Connection::subscribe_with_options`.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub subject: String,
    pub queue_group: Option<String>,

    /// Push handler. Without one the subscription is pulled with `next_msg`.
    pub handler: Option<Arc<dyn MessageHandler>>,

    /// Overrides `Options::pending_msgs_limit`.
    pub pending_msgs_limit: Option<usize>,

    /// Overrides `Options::pending_bytes_limit`.
    pub pending_bytes_limit: Option<usize>,
}

impl SubscribeOptions {
    pub fn new(subject: impl Into<String>) -> Self {
        SubscribeOptions {
            subject: subject.into(),
            ..Default::default()
        }
    }

    pub fn queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }

    pub fn handler<H: MessageHandler>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn pending_limits(mut self, max_msgs: usize, max_bytes: usize) -> Self {
        self.pending_msgs_limit = Some(max_msgs);
        self.pending_bytes_limit = Some(max_bytes);
        self
    }
}

impl std::fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("subject", &self.subject)
            .field("queue_group", &self.queue_group)
            .field("push", &self.handler.is_some())
            .field("pending_msgs_limit", &self.pending_msgs_limit)
            .field("pending_bytes_limit", &self.pending_bytes_limit)
            .finish()
    }
}

/// Handle to a subscription.
///
/// Cloning the handle does not create a new subscription. Dropping every handle
/// does not unsubscribe; call `unsubscribe` or close the connection.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
    conn: Connection,
}

impl Subscription {
    pub(crate) fn new(inner: Arc<SubscriptionInner>, conn: Connection) -> Self {
        Subscription { inner, conn }
    }

    /// Subscription id, unique for the lifetime of the connection.
    pub fn sid(&self) -> u64 {
        self.inner.sid
    }

    pub fn subject(&self) -> &str {
        &self.inner.subject
    }

    pub fn queue_group(&self) -> Option<&str> {
        self.inner.queue_group.as_deref()
    }

    /// False after unsubscribe, auto-unsubscribe completion or connection close.
    pub fn is_valid(&self) -> bool {
        self.inner.delivery.is_valid()
    }

    /// Waits up to `timeout` for the next message of a pull subscription.
    ///
    /// # Errors
    /// - `Timeout`: nothing arrived in time
    /// - `BadSubscription`: unsubscribed before or while waiting
    /// - `ConnectionClosed`: the connection closed before or while waiting
    /// - `InvalidOperation`: the subscription has a push handler
    pub async fn next_msg(&self, timeout: Duration) -> Result<Message, ClientError> {
        self.next_inner(timeout, None).await
    }

    /// Like `next_msg`, returning `Cancelled` as soon as `cancel` fires.
    pub async fn next_msg_with_cancel(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Message, ClientError> {
        self.next_inner(timeout, Some(cancel)).await
    }

    async fn next_inner(
        &self,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Message, ClientError> {
        if self.inner.delivery.is_push() {
            return Err(ClientError::InvalidOperation(
                "next_msg on a callback subscription".into(),
            ));
        }

        let (msg, exhausted) = self.inner.delivery.next(timeout, cancel).await?;
        if exhausted {
            self.conn.shared().remove_route(self.inner.sid);
        }
        Ok(msg)
    }

    /// Removes the subscription. Pending messages are discarded.
    pub async fn unsubscribe(&self) -> Result<(), ClientError> {
        self.conn.shared().unsubscribe(self.inner.sid).await
    }

    /// Delivers at most `max` messages in total, then invalidates the subscription.
    ///
    /// The server is told the limit as well so it stops sending. Messages already
    /// pending are still delivered up to the limit.
    pub async fn auto_unsubscribe(&self, max: u64) -> Result<(), ClientError> {
        self.conn.shared().auto_unsubscribe(&self.inner, max).await
    }

    /// Pending messages and payload bytes.
    pub fn pending(&self) -> (usize, usize) {
        self.inner.delivery.pending()
    }

    pub fn delivered(&self) -> u64 {
        self.inner.delivery.delivered()
    }

    pub fn dropped(&self) -> u64 {
        self.inner.delivery.dropped()
    }

    /// Current (message, byte) pending limits.
    pub fn pending_limits(&self) -> (usize, usize) {
        self.inner.delivery.limits()
    }

    pub fn set_pending_limits(&self, max_msgs: usize, max_bytes: usize) -> Result<(), ClientError> {
        if !self.is_valid() {
            return Err(ClientError::BadSubscription);
        }
        if max_msgs == 0 || max_bytes == 0 {
            return Err(ClientError::InvalidOperation(
                "pending limits must be positive".into(),
            ));
        }
        self.inner.delivery.set_limits(max_msgs, max_bytes);
        Ok(())
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("sid", &self.inner.sid)
            .field("subject", &self.inner.subject)
            .field("queue_group", &self.inner.queue_group)
            .finish()
    }
}
