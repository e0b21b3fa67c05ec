//! Connection lifecycle, failover and the public client API.
//!
//! This module provides two key types:
//! - `ConnectionBuilder`: validates options, registers listeners and performs the
//!   first connect pass
//! - `Connection`: the cloneable client handle (publish, subscribe, request, flush,
//!   close)
//!
//! Behind the handle, `Shared` owns everything one connection needs: the server
//! pool, the subscription registry, the outbound path, the delivery workers and
//! the event queue.
//!
//! # Architecture
//!
//! ```text
//! Application ── publish/subscribe ──> Connection ──> Outbound ──> FrameWriter
//!                                          │
//!                                  reader loop <── EventReader
//!                                          │
//!                      registry ─> pending queues ─> delivery workers ─> handlers
//!                                          │
//!                        reconnection engine ── ServerPool ── Transport::open
//! ```
//!
//! # State machine
//!
//! `Connecting -> Connected -> Reconnecting -> Connected ... -> Closed`
//!
//! Every transition happens under the connection lock, and the matching event is
//! queued while the lock is held, so listeners observe transitions in the order
//! they happened. Each session gets a generation number; a disconnect reported by
//! a stale reader or writer (older generation) is ignored, which makes the
//! disconnect notification fire exactly once per lost session.
//!
//! # Usage
//!
//! ```ignore
//! let conn = ConnectionBuilder::new(options)
//!     .transport(transport)
//!     .on_disconnected(|e| warn!("{e:?}"))
//!     .connect()
//!     .await?;
//!
//! let sub = conn.subscribe("orders.>").await?;
//! conn.publish("orders.eu", "hello").await?;
//! let msg = sub.next_msg(Duration::from_secs(1)).await?;
//! conn.close().await;
//! ```

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    sync::{oneshot, watch},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    backoff::Backoff,
    config::Options,
    dispatcher::DeliveryDispatcher,
    error::{root_cause, ClientError},
    events::{ConnectionEvent, EventKind, EventQueue, ListenerId, Listeners},
    message::{Headers, Message},
    ordered::{OrderedConsumerBuilder, OrderedConsumerConfig},
    outbound::{Outbound, SendOutcome},
    pool::{ServerAddr, ServerEntry, ServerPool},
    registry::{IdGenerator, SubscriptionRegistry},
    state::ConnectionState,
    subject::{validate_publish_subject, validate_queue_group, validate_subject},
    subscription::{
        Delivery, Enqueued, InvalidReason, MessageHandler, MessageManager, PendingSink,
        SubscribeOptions, Subscription, SubscriptionInner,
    },
    transport::{
        ConnectInfo, ConsumerSpec, EventReader, Frame, ProtocolEvent, ServerInfo, Session,
        Transport, TransportError,
    },
};

/// Prefix of reply subjects created by `new_inbox`.
pub const INBOX_PREFIX: &str = "_INBOX";

/// Builder performing the first connect pass.
pub struct ConnectionBuilder {
    options: Options,
    transport: Option<Arc<dyn Transport>>,
    listeners: Arc<Listeners>,
}

impl ConnectionBuilder {
    pub fn new(options: Options) -> Self {
        ConnectionBuilder {
            options,
            transport: None,
            listeners: Arc::new(Listeners::new()),
        }
    }

    /// Sets the frame transport used to open sessions.
    pub fn transport<T: Transport>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Sets a shared frame transport.
    pub fn transport_arc(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Registers a listener before connecting, so no event of the first connect
    /// pass is missed.
    pub fn on_event<F>(self, kind: EventKind, listener: F) -> Self
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.listeners.add(kind, listener);
        self
    }

    pub fn on_connected<F>(self, listener: F) -> Self
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.on_event(EventKind::Connected, listener)
    }

    pub fn on_disconnected<F>(self, listener: F) -> Self
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.on_event(EventKind::Disconnected, listener)
    }

    pub fn on_reconnected<F>(self, listener: F) -> Self
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.on_event(EventKind::Reconnected, listener)
    }

    pub fn on_closed<F>(self, listener: F) -> Self
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.on_event(EventKind::Closed, listener)
    }

    pub fn on_async_error<F>(self, listener: F) -> Self
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.on_event(EventKind::AsyncError, listener)
    }

    pub fn on_servers_discovered<F>(self, listener: F) -> Self
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.on_event(EventKind::ServersDiscovered, listener)
    }

    /// Validates the options and connects.
    ///
    /// Tries every pool entry once, in selection order.
    ///
    /// # Returns
    /// - `Ok(Connection)`: a session is live, or `reconnect_on_connect` is set and the
    ///   connection keeps trying in the background (`Reconnecting`)
    /// - `Err(NoServers)`: no server accepted the connection
    /// - `Err(Config | InvalidUrl)`: the options are invalid
    pub async fn connect(self) -> Result<Connection, ClientError> {
        self.options.validate()?;
        let transport = self.transport.ok_or_else(|| {
            ClientError::InvalidOperation("no transport configured".into())
        })?;
        let pool = ServerPool::new(&self.options.servers, self.options.randomize)?;

        let shared = Shared::start(self.options, transport, self.listeners, pool);
        let conn = Connection {
            handle: Arc::new(ConnectionHandle {
                shared: shared.clone(),
            }),
        };

        match shared.initial_connect().await {
            Ok(()) => Ok(conn),
            Err(e)
                if shared.options.reconnect_on_connect
                    && !matches!(e, ClientError::ConnectionClosed) =>
            {
                warn!("Initial connect failed ({e}), retrying in the background");
                shared.enter_reconnecting();
                Ok(conn)
            }
            Err(e) => {
                shared.close_with(None).await;
                Err(e)
            }
        }
    }
}

/// Snapshot of the connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub in_msgs: u64,
    pub in_bytes: u64,
    pub out_msgs: u64,
    pub out_bytes: u64,
    pub reconnects: u64,
}

#[derive(Debug, Default)]
struct Statistics {
    in_msgs: AtomicU64,
    in_bytes: AtomicU64,
    out_msgs: AtomicU64,
    out_bytes: AtomicU64,
    reconnects: AtomicU64,
}

impl Statistics {
    fn snapshot(&self) -> Stats {
        Stats {
            in_msgs: self.in_msgs.load(Ordering::Relaxed),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            out_msgs: self.out_msgs.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Outstanding PINGs in send order. `None` marks a keepalive ping nobody waits on.
#[derive(Default)]
struct PongQueue {
    next_id: u64,
    waiters: VecDeque<(u64, Option<oneshot::Sender<()>>)>,
}

impl PongQueue {
    fn register(&mut self) -> (u64, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        self.next_id += 1;
        self.waiters.push_back((self.next_id, Some(tx)));
        (self.next_id, rx)
    }

    fn push_keepalive(&mut self) {
        self.next_id += 1;
        self.waiters.push_back((self.next_id, None));
    }

    /// Stops waiting on `id` without breaking the order of later pongs.
    fn forget(&mut self, id: u64) {
        if let Some((_, tx)) = self.waiters.iter_mut().find(|(wid, _)| *wid == id) {
            tx.take();
        }
    }

    fn resolve(&mut self) {
        if let Some((_, Some(tx))) = self.waiters.pop_front() {
            let _ = tx.send(());
        }
    }

    fn clear(&mut self) {
        self.waiters.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Report through the async-error listener, then try the next candidate.
    ReportAndAdvance,
    /// Try the next candidate.
    Advance,
}

fn classify_connect_error(err: &TransportError) -> Disposition {
    match err {
        // The server is up but refuses us; the operator needs to know.
        TransportError::Authorization(_) | TransportError::AuthorizationTimeout => {
            Disposition::ReportAndAdvance
        }
        TransportError::Io(_)
        | TransportError::ConnectionRefused(_)
        | TransportError::ConnectionReset
        | TransportError::Timeout
        | TransportError::Closed => Disposition::Advance,
    }
}

/// Everything the connection lock protects.
struct Core {
    state: ConnectionState,
    /// Incremented for every established session.
    generation: u64,
    pool: ServerPool,
    registry: SubscriptionRegistry,
    server_info: Option<ServerInfo>,
    ever_connected: bool,
}

/// Parameters of a new route.
pub(crate) struct RouteSpec {
    pub(crate) subject: String,
    pub(crate) queue_group: Option<String>,
    pub(crate) consumer: Option<ConsumerSpec>,
    pub(crate) manager: Option<Arc<dyn MessageManager>>,
    /// Existing endpoint to deliver into. A new one is created when `None`.
    pub(crate) delivery: Option<Arc<Delivery>>,
    pub(crate) handler: Option<Arc<dyn MessageHandler>>,
    pub(crate) pending_msgs_limit: usize,
    pub(crate) pending_bytes_limit: usize,
    pub(crate) resend: bool,
}

pub(crate) struct Shared {
    pub(crate) options: Options,
    transport: Arc<dyn Transport>,
    connect_info: ConnectInfo,
    core: Mutex<Core>,
    outbound: Outbound,
    listeners: Arc<Listeners>,
    events: EventQueue,
    pub(crate) dispatcher: DeliveryDispatcher,
    ids: IdGenerator,
    stats: Statistics,
    state_tx: watch::Sender<ConnectionState>,
    pub(crate) cancel: CancellationToken,
    pongs: Mutex<PongQueue>,
    pings_out: AtomicU32,
    backoff: Mutex<Backoff>,
}

impl Shared {
    fn start(
        options: Options,
        transport: Arc<dyn Transport>,
        listeners: Arc<Listeners>,
        pool: ServerPool,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let (events, _events_task) = EventQueue::start(listeners.clone());
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);

        let shared = Arc::new_cyclic(|weak: &std::sync::Weak<Shared>| {
            let owner = weak.clone();
            let (dispatcher, _workers) = DeliveryDispatcher::start(
                options.delivery_workers,
                cancel.child_token(),
                move |sid| {
                    if let Some(shared) = owner.upgrade() {
                        shared.remove_route(sid);
                    }
                },
            );

            Shared {
                connect_info: ConnectInfo {
                    name: options.name.clone(),
                    echo: options.echo,
                    lang: "rust",
                    version: env!("CARGO_PKG_VERSION"),
                },
                backoff: Mutex::new(Backoff::new(
                    options.reconnect_wait(),
                    options.reconnect_wait_max(),
                    options.reconnect_backoff_multiplier,
                )),
                outbound: Outbound::new(options.reconnect_buffer_size),
                core: Mutex::new(Core {
                    state: ConnectionState::Connecting,
                    generation: 0,
                    pool,
                    registry: SubscriptionRegistry::default(),
                    server_info: None,
                    ever_connected: false,
                }),
                options,
                transport,
                listeners,
                events,
                dispatcher,
                ids: IdGenerator::new(),
                stats: Statistics::default(),
                state_tx,
                cancel,
                pongs: Mutex::new(PongQueue::default()),
                pings_out: AtomicU32::new(0),
            }
        });

        if let Some(interval) = shared.options.ping_interval() {
            tokio::spawn(shared.clone().run_keepalive(interval));
        }

        shared
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn add_listener<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.listeners.add(kind, listener)
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Mirrors a state change into the watch channel. Called with the lock held.
    fn set_state(&self, core: &mut Core, state: ConnectionState) {
        core.state = state;
        let changed = self.state_tx.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
        if changed {
            info!("Connection state changed to: {state}");
        }
    }

    /// Queues an event. Called with the lock held; nothing is queued after `Closed`.
    fn emit(&self, core: &Core, event: ConnectionEvent) {
        if core.state.is_closed() && !matches!(event, ConnectionEvent::Closed) {
            trace!("Dropping {:?} event after close", event.kind());
            return;
        }
        self.events.push(event);
    }

    pub(crate) fn emit_async_error(&self, sid: Option<u64>, error: ClientError) {
        let core = self.core.lock();
        self.emit(&core, ConnectionEvent::AsyncError { sid, error });
    }

    async fn open_session(&self, addr: &ServerAddr) -> Result<Session, TransportError> {
        debug!("Connecting to {addr}");
        match tokio::time::timeout(
            self.options.connect_timeout(),
            self.transport.open(addr, &self.connect_info),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    fn report_connect_failure(&self, addr: &ServerAddr, err: &TransportError) {
        warn!("Connection to {addr} failed: {}", root_cause(err));
        if classify_connect_error(err) == Disposition::ReportAndAdvance {
            self.emit_async_error(None, ClientError::Authorization(err.to_string()));
        }
    }

    /// One pass over the pool in selection order.
    async fn initial_connect(self: &Arc<Self>) -> Result<(), ClientError> {
        let candidates = self.core.lock().pool.initial_order();

        for addr in candidates {
            if self.is_closed() {
                return Err(ClientError::ConnectionClosed);
            }
            self.core.lock().pool.record_attempt(&addr);

            match self.open_session(&addr).await {
                Ok(session) => match self.install(session, &addr).await {
                    Ok(()) => return Ok(()),
                    Err(e) => warn!("Session setup with {addr} failed: {e}"),
                },
                Err(e) => self.report_connect_failure(&addr, &e),
            }
        }

        error!("No server accepted the connection");
        Err(ClientError::NoServers)
    }

    fn enter_reconnecting(self: &Arc<Self>) {
        {
            let mut core = self.core.lock();
            if core.state.is_closed() {
                return;
            }
            self.set_state(&mut core, ConnectionState::Reconnecting);
        }
        tokio::spawn(self.clone().reconnect_loop());
    }

    /// Makes `session` the live session.
    ///
    /// Re-registers every resendable subscription, flushes buffered frames, then
    /// commits the new state and starts the reader.
    async fn install(self: &Arc<Self>, session: Session, addr: &ServerAddr) -> Result<(), ClientError> {
        let Session {
            info,
            reader,
            writer,
        } = session;

        let preamble = self.core.lock().registry.resend_frames();
        let resent = preamble.len();
        self.outbound.resume(writer, preamble).await?;

        let generation = {
            let mut core = self.core.lock();
            if core.state.is_closed() {
                return Err(ClientError::ConnectionClosed);
            }

            core.generation += 1;
            core.pool.mark_connected(addr);
            let discovered = core.pool.update_discovered(&info.connect_urls);
            core.server_info = Some(info);
            let reconnected = core.ever_connected;
            core.ever_connected = true;
            self.set_state(&mut core, ConnectionState::Connected);

            let server = addr.to_string();
            if reconnected {
                self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                info!("Reconnected to {server}, resent {resent} subscription frames");
                self.emit(&core, ConnectionEvent::Reconnected { server });
            } else {
                info!("Connected to {server}");
                self.emit(&core, ConnectionEvent::Connected { server });
            }

            if !discovered.is_empty() {
                let servers: Vec<String> = discovered.iter().map(ToString::to_string).collect();
                info!("Discovered servers: {}", servers.join(", "));
                self.emit(&core, ConnectionEvent::ServersDiscovered { servers });
            }

            core.generation
        };

        self.pings_out.store(0, Ordering::Relaxed);
        self.backoff.lock().reset();
        tokio::spawn(self.clone().run_reader(reader, generation));
        Ok(())
    }

    /// Reacts to the loss of session `generation`. Stale reports are ignored.
    pub(crate) fn handle_disconnect(self: &Arc<Self>, generation: u64, reason: String) {
        let allow_reconnect = {
            let mut core = self.core.lock();
            if core.generation != generation || !core.state.is_connected() {
                return;
            }

            warn!("Disconnected: {reason}");
            self.set_state(&mut core, ConnectionState::Reconnecting);
            self.emit(&core, ConnectionEvent::Disconnected { reason });
            self.options.allow_reconnect
        };

        self.pongs.lock().clear();
        self.pings_out.store(0, Ordering::Relaxed);

        let shared = self.clone();
        if allow_reconnect {
            tokio::spawn(shared.reconnect_loop());
        } else {
            tokio::spawn(async move {
                shared.close_with(None).await;
            });
        }
    }

    /// The reconnection engine. Runs until a session is installed or the pool is
    /// exhausted.
    async fn reconnect_loop(self: Arc<Self>) {
        if let Some(mut writer) = self.outbound.suspend().await {
            writer.close().await;
        }
        info!("Reconnection engine started");

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let next = {
                let mut core = self.core.lock();
                if core.state.is_closed() {
                    return;
                }
                core.pool
                    .next_candidate(self.options.max_reconnect_attempts)
                    .map(|addr| {
                        let delay = self.backoff.lock().current_delay();
                        let wait = core.pool.wait_before(&addr, delay);
                        (addr, wait)
                    })
            };

            let Some((candidate, wait)) = next else {
                error!("Server pool exhausted, closing connection");
                self.close_with(Some(ClientError::NoServers)).await;
                return;
            };

            if !wait.is_zero() {
                debug!(
                    "Waiting {:.3} seconds before reconnecting to {candidate}",
                    wait.as_secs_f64()
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
                self.backoff.lock().next_sleep();
            }

            self.core.lock().pool.record_attempt(&candidate);
            let result = match self.open_session(&candidate).await {
                Ok(session) => self.install(session, &candidate).await,
                Err(e) => {
                    self.report_connect_failure(&candidate, &e);
                    Err(e.into())
                }
            };

            match result {
                Ok(()) => return,
                Err(ClientError::ConnectionClosed) => return,
                Err(e) => {
                    debug!("Reconnect attempt to {candidate} failed: {e}");
                    self.core.lock().pool.record_failure(&candidate);
                }
            }
        }
    }

    /// Moves to `Closed`. Returns false when already closed.
    ///
    /// `reason` is reported as an async error right before the closed event.
    pub(crate) async fn close_with(self: &Arc<Self>, reason: Option<ClientError>) -> bool {
        let routes = {
            let mut core = self.core.lock();
            if core.state.is_closed() {
                return false;
            }

            if let Some(error) = reason {
                self.emit(&core, ConnectionEvent::AsyncError { sid: None, error });
            }
            self.set_state(&mut core, ConnectionState::Closed);
            let routes = core.registry.drain();
            self.emit(&core, ConnectionEvent::Closed);
            routes
        };

        for route in routes {
            route.delivery.invalidate(InvalidReason::ConnectionClosed);
        }
        self.pongs.lock().clear();
        self.cancel.cancel();

        if let Some(mut writer) = self.outbound.close().await {
            writer.close().await;
        }

        info!("Connection closed");
        true
    }

    async fn run_reader(self: Arc<Self>, mut reader: Box<dyn EventReader>, generation: u64) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = reader.read_event() => event,
            };

            match event {
                Ok(event) => {
                    if let Err(reason) = self.process_event(event).await {
                        self.handle_disconnect(generation, reason);
                        return;
                    }
                }
                Err(e) => {
                    self.handle_disconnect(generation, root_cause(&e));
                    return;
                }
            }
        }
    }

    /// Handles one inbound event. An `Err` ends the session.
    async fn process_event(self: &Arc<Self>, event: ProtocolEvent) -> Result<(), String> {
        match event {
            ProtocolEvent::Msg(msg) => {
                self.stats.in_msgs.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .in_bytes
                    .fetch_add(msg.size() as u64, Ordering::Relaxed);
                self.route_inbound(msg);
            }
            ProtocolEvent::Ping => {
                if let Err(e) = self.send(Frame::Pong).await {
                    debug!("Failed to answer ping: {e}");
                }
            }
            ProtocolEvent::Pong => {
                self.pings_out.store(0, Ordering::Relaxed);
                self.pongs.lock().resolve();
            }
            ProtocolEvent::Info(info) => self.apply_info(info),
            ProtocolEvent::Err(err) => {
                warn!("Server error: {err}");
                let error = if err.is_auth() {
                    ClientError::Authorization(err.to_string())
                } else {
                    ClientError::Server(err.to_string())
                };
                self.emit_async_error(None, error);
                if err.is_session_fatal() {
                    return Err(err.to_string());
                }
            }
            ProtocolEvent::Ok => trace!("Received +OK"),
            ProtocolEvent::SubAck { sid } => trace!("Server acknowledged subscription {sid}"),
        }
        Ok(())
    }

    fn apply_info(&self, info: ServerInfo) {
        let mut core = self.core.lock();
        let added = core.pool.update_discovered(&info.connect_urls);
        core.server_info = Some(info);
        if !added.is_empty() {
            let servers: Vec<String> = added.iter().map(ToString::to_string).collect();
            info!("Discovered servers: {}", servers.join(", "));
            self.emit(&core, ConnectionEvent::ServersDiscovered { servers });
        }
    }

    fn route_inbound(&self, msg: Message) {
        let route = self.core.lock().registry.get(msg.sid);
        let Some(route) = route else {
            trace!("Dropping message for unknown subscription {}", msg.sid);
            return;
        };

        match &route.manager {
            Some(manager) => manager.process(
                msg,
                &RouteSink {
                    shared: self,
                    route: &route,
                },
            ),
            None => {
                self.enqueue(&route, msg);
            }
        }
    }

    /// Puts `msg` into the route's endpoint. Returns false when it was dropped.
    fn enqueue(&self, route: &SubscriptionInner, msg: Message) -> bool {
        match route.delivery.push(msg) {
            Enqueued::Queued => {
                if route.delivery.is_push() {
                    self.dispatcher.schedule(&route.delivery);
                }
                true
            }
            Enqueued::Dropped { first } => {
                // Routes with a manager recover from overflow on their own.
                if first && route.manager.is_none() {
                    let sid = route.sid;
                    warn!("Slow consumer on subscription {sid}, dropping messages");
                    self.emit_async_error(Some(sid), ClientError::SlowConsumer { sid });
                }
                false
            }
            Enqueued::Invalid => false,
        }
    }

    pub(crate) async fn send(self: &Arc<Self>, frame: Frame) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }

        match self.outbound.send(frame).await? {
            SendOutcome::Written | SendOutcome::Buffered => Ok(()),
            SendOutcome::Broken => {
                let generation = self.core.lock().generation;
                self.handle_disconnect(generation, "write failed".into());
                Ok(())
            }
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.ids.next()
    }

    /// Registers a route and tells the server about it.
    pub(crate) async fn subscribe_route(
        self: &Arc<Self>,
        spec: RouteSpec,
    ) -> Result<Arc<SubscriptionInner>, ClientError> {
        let sid = self.ids.next();
        let owns_delivery = spec.delivery.is_none();
        let delivery = spec.delivery.unwrap_or_else(|| {
            Arc::new(Delivery::new(
                sid,
                spec.pending_msgs_limit,
                spec.pending_bytes_limit,
                spec.handler,
            ))
        });

        let route = Arc::new(SubscriptionInner {
            sid,
            subject: spec.subject,
            queue_group: spec.queue_group,
            consumer: spec.consumer,
            resend: spec.resend,
            manager: spec.manager,
            delivery,
        });

        {
            let mut core = self.core.lock();
            if core.state.is_closed() {
                return Err(ClientError::BadSubscription);
            }
            core.registry.insert(route.clone());
        }

        match self.send(route.sub_frame()).await {
            Ok(()) => {}
            // Still registered: the interest is re-established after reconnecting.
            Err(ClientError::ReconnectBufferExceeded) if route.resend => {
                debug!("Reconnect buffer full, subscription {sid} deferred to resend");
            }
            Err(e) => {
                self.core.lock().registry.remove(sid);
                if owns_delivery {
                    route.delivery.invalidate(InvalidReason::Unsubscribed);
                }
                return Err(match e {
                    ClientError::ConnectionClosed => ClientError::BadSubscription,
                    other => other,
                });
            }
        }

        debug!("Subscribed {sid} to {}", route.subject);
        Ok(route)
    }

    /// Drops a route locally without telling the server.
    pub(crate) fn remove_route(&self, sid: u64) -> Option<Arc<SubscriptionInner>> {
        self.core.lock().registry.remove(sid)
    }

    /// Drops a route and withdraws the server-side interest, leaving the endpoint
    /// untouched.
    pub(crate) async fn withdraw_route(self: &Arc<Self>, sid: u64) {
        if self.remove_route(sid).is_some() {
            if let Err(e) = self.send(Frame::Unsub { sid, max: None }).await {
                debug!("Failed to withdraw subscription {sid}: {e}");
            }
        }
    }

    pub(crate) async fn unsubscribe(self: &Arc<Self>, sid: u64) -> Result<(), ClientError> {
        let Some(route) = self.remove_route(sid) else {
            return Err(ClientError::BadSubscription);
        };
        route.delivery.invalidate(InvalidReason::Unsubscribed);

        // The local interest is gone either way; messages for unknown ids are dropped.
        if let Err(e) = self.send(Frame::Unsub { sid, max: None }).await {
            debug!("Unsubscribe of {sid} not sent: {e}");
        }
        debug!("Unsubscribed {sid}");
        Ok(())
    }

    pub(crate) async fn auto_unsubscribe(
        self: &Arc<Self>,
        route: &Arc<SubscriptionInner>,
        max: u64,
    ) -> Result<(), ClientError> {
        if !route.delivery.is_valid() || self.core.lock().registry.get(route.sid).is_none() {
            return Err(ClientError::BadSubscription);
        }

        if route.delivery.set_max_delivered(max) {
            return self.unsubscribe(route.sid).await.or(Ok(()));
        }

        self.send(Frame::Unsub {
            sid: route.sid,
            max: Some(max),
        })
        .await
    }

    fn max_payload(&self) -> usize {
        self.core
            .lock()
            .server_info
            .as_ref()
            .map_or(0, |info| info.max_payload)
    }

    async fn run_keepalive(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let generation = {
                let core = self.core.lock();
                if !core.state.is_connected() {
                    continue;
                }
                core.generation
            };

            let outstanding = self.pings_out.fetch_add(1, Ordering::Relaxed);
            if outstanding >= self.options.max_pings_outstanding {
                warn!("{outstanding} pings unanswered, connection is stale");
                self.handle_disconnect(generation, "stale connection".into());
                continue;
            }

            self.pongs.lock().push_keepalive();
            if let Err(e) = self.send(Frame::Ping).await {
                debug!("Keepalive ping not sent: {e}");
            }
        }
    }
}

/// Sink handed to message managers: admission into a route's endpoint.
struct RouteSink<'a> {
    shared: &'a Shared,
    route: &'a SubscriptionInner,
}

impl PendingSink for RouteSink<'_> {
    fn push(&self, msg: Message) -> bool {
        self.shared.enqueue(self.route, msg)
    }
}

struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl Drop for ConnectionHandle {
    /// Closes the connection once the last handle is gone.
    fn drop(&mut self) {
        if self.shared.is_closed() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let shared = self.shared.clone();
                runtime.spawn(async move {
                    shared.close_with(None).await;
                });
            }
            Err(_) => self.shared.cancel.cancel(),
        }
    }
}

/// Client handle. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Connection {
    handle: Arc<ConnectionHandle>,
}

impl Connection {
    /// Starts building a connection.
    pub fn builder(options: Options) -> ConnectionBuilder {
        ConnectionBuilder::new(options)
    }

    /// Connects with default listeners.
    pub async fn connect<T: Transport>(options: Options, transport: T) -> Result<Self, ClientError> {
        ConnectionBuilder::new(options).transport(transport).connect().await
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.handle.shared
    }

    pub fn options(&self) -> &Options {
        &self.shared().options
    }

    pub fn state(&self) -> ConnectionState {
        self.shared().state()
    }

    /// Watch channel following every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared().subscribe_state()
    }

    pub fn is_closed(&self) -> bool {
        self.shared().is_closed()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn stats(&self) -> Stats {
        self.shared().stats.snapshot()
    }

    /// Information sent by the server of the current (or last) session.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.shared().core.lock().server_info.clone()
    }

    /// URL of the server of the current (or last) session.
    pub fn connected_url(&self) -> Option<String> {
        self.shared()
            .core
            .lock()
            .pool
            .current()
            .map(|entry| entry.addr.to_string())
    }

    /// Snapshot of the server pool.
    pub fn servers(&self) -> Vec<ServerEntry> {
        self.shared().core.lock().pool.entries().to_vec()
    }

    /// Number of live subscription routes.
    pub fn num_subscriptions(&self) -> usize {
        self.shared().core.lock().registry.len()
    }

    /// Bytes of outbound frames waiting for the next session.
    pub async fn buffered(&self) -> usize {
        self.shared().outbound.buffered().await
    }

    pub fn add_listener<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.shared().add_listener(kind, listener)
    }

    pub fn on_disconnected<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.add_listener(EventKind::Disconnected, listener)
    }

    pub fn on_reconnected<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.add_listener(EventKind::Reconnected, listener)
    }

    pub fn on_closed<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.add_listener(EventKind::Closed, listener)
    }

    pub fn on_async_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.add_listener(EventKind::AsyncError, listener)
    }

    pub fn on_servers_discovered<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.add_listener(EventKind::ServersDiscovered, listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared().remove_listener(id)
    }

    /// Publishes `payload` on `subject`.
    ///
    /// While reconnecting the frame is buffered.
    ///
    /// # Errors
    /// - `InvalidSubject`: empty subject or wildcards
    /// - `MaxPayloadExceeded`: payload larger than the server allows
    /// - `ReconnectBufferExceeded`: reconnect buffer full
    /// - `ConnectionClosed`
    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<(), ClientError> {
        self.publish_frame(subject, None, None, payload.into()).await
    }

    /// Publishes with a reply subject for responders.
    pub async fn publish_with_reply(
        &self,
        subject: &str,
        reply_to: &str,
        payload: impl Into<Bytes>,
    ) -> Result<(), ClientError> {
        validate_publish_subject(reply_to)?;
        self.publish_frame(subject, Some(reply_to.to_string()), None, payload.into())
            .await
    }

    pub async fn publish_with_headers(
        &self,
        subject: &str,
        headers: Headers,
        payload: impl Into<Bytes>,
    ) -> Result<(), ClientError> {
        self.publish_frame(subject, None, Some(headers), payload.into())
            .await
    }

    async fn publish_frame(
        &self,
        subject: &str,
        reply_to: Option<String>,
        headers: Option<Headers>,
        payload: Bytes,
    ) -> Result<(), ClientError> {
        validate_publish_subject(subject)?;
        let shared = self.shared();

        let max = shared.max_payload();
        if max > 0 && payload.len() > max {
            return Err(ClientError::MaxPayloadExceeded {
                size: payload.len(),
                max,
            });
        }

        let size = payload.len() as u64;
        shared
            .send(Frame::Pub {
                subject: subject.to_string(),
                reply_to,
                headers,
                payload,
            })
            .await?;

        shared.stats.out_msgs.fetch_add(1, Ordering::Relaxed);
        shared.stats.out_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    /// Subscribes for pull delivery with `next_msg`.
    pub async fn subscribe(&self, subject: &str) -> Result<Subscription, ClientError> {
        self.subscribe_with_options(SubscribeOptions::new(subject))
            .await
    }

    /// Pull subscription that shares messages with the other members of `group`.
    pub async fn queue_subscribe(&self, subject: &str, group: &str) -> Result<Subscription, ClientError> {
        self.subscribe_with_options(SubscribeOptions::new(subject).queue_group(group))
            .await
    }

    /// Subscribes with a push handler run by the delivery workers.
    pub async fn subscribe_with<H: MessageHandler>(
        &self,
        subject: &str,
        handler: H,
    ) -> Result<Subscription, ClientError> {
        self.subscribe_with_options(SubscribeOptions::new(subject).handler(handler))
            .await
    }

    pub async fn queue_subscribe_with<H: MessageHandler>(
        &self,
        subject: &str,
        group: &str,
        handler: H,
    ) -> Result<Subscription, ClientError> {
        self.subscribe_with_options(
            SubscribeOptions::new(subject)
                .queue_group(group)
                .handler(handler),
        )
        .await
    }

    /// Subscribes with explicit options.
    ///
    /// # Errors
    /// - `InvalidSubject` / `InvalidQueueGroup`: rejected syntax
    /// - `BadSubscription`: the connection is closed
    pub async fn subscribe_with_options(
        &self,
        options: SubscribeOptions,
    ) -> Result<Subscription, ClientError> {
        validate_subject(&options.subject)?;
        if let Some(group) = &options.queue_group {
            validate_queue_group(group)?;
        }

        let shared = self.shared();
        if shared.is_closed() {
            return Err(ClientError::BadSubscription);
        }

        let pending_msgs_limit = options
            .pending_msgs_limit
            .unwrap_or(shared.options.pending_msgs_limit);
        let pending_bytes_limit = options
            .pending_bytes_limit
            .unwrap_or(shared.options.pending_bytes_limit);
        if pending_msgs_limit == 0 || pending_bytes_limit == 0 {
            return Err(ClientError::InvalidOperation(
                "pending limits must be positive".into(),
            ));
        }

        let route = shared
            .subscribe_route(RouteSpec {
                subject: options.subject,
                queue_group: options.queue_group,
                consumer: None,
                manager: None,
                delivery: None,
                handler: options.handler,
                pending_msgs_limit,
                pending_bytes_limit,
                resend: true,
            })
            .await?;

        Ok(Subscription::new(route, self.clone()))
    }

    /// Starts building an ordered consumer on `config.stream`.
    pub fn ordered_consumer(&self, config: OrderedConsumerConfig) -> OrderedConsumerBuilder {
        OrderedConsumerBuilder::new(self.clone(), config)
    }

    /// A unique reply subject.
    pub fn new_inbox(&self) -> String {
        format!("{INBOX_PREFIX}.{}", Uuid::new_v4().simple())
    }

    /// Sends a request and waits for the first reply.
    ///
    /// # Errors
    /// - `Timeout`: no reply in time; the reply subscription is removed
    /// - `ConnectionClosed`
    pub async fn request(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        self.request_inner(subject, payload.into(), timeout, None)
            .await
    }

    /// Like `request`, returning `Cancelled` as soon as `cancel` fires.
    pub async fn request_with_cancel(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Message, ClientError> {
        self.request_inner(subject, payload.into(), timeout, Some(cancel))
            .await
    }

    async fn request_inner(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Message, ClientError> {
        validate_publish_subject(subject)?;
        let inbox = self.new_inbox();
        let sub = self.subscribe(&inbox).await.map_err(|e| match e {
            ClientError::BadSubscription => ClientError::ConnectionClosed,
            other => other,
        })?;
        sub.auto_unsubscribe(1).await?;

        if let Err(e) = self.publish_with_reply(subject, &inbox, payload).await {
            let _ = sub.unsubscribe().await;
            return Err(e);
        }

        let result = match cancel {
            Some(cancel) => sub.next_msg_with_cancel(timeout, cancel).await,
            None => sub.next_msg(timeout).await,
        };

        if result.is_err() && sub.is_valid() {
            let _ = sub.unsubscribe().await;
        }
        result
    }

    /// Round trip to the server: returns once every frame sent before the call
    /// has been processed.
    ///
    /// # Errors
    /// - `Timeout`
    /// - `Disconnected`: the session was lost before the answer arrived
    /// - `ConnectionClosed`
    pub async fn flush(&self, timeout: Duration) -> Result<(), ClientError> {
        let shared = self.shared();
        if shared.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }

        let (id, rx) = shared.pongs.lock().register();
        if let Err(e) = shared.send(Frame::Ping).await {
            shared.pongs.lock().forget(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) if shared.is_closed() => Err(ClientError::ConnectionClosed),
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                shared.pongs.lock().forget(id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Closes the connection.
    ///
    /// Idempotent: closing twice is not an error and fires the closed event once.
    pub async fn close(&self) {
        self.shared().close_with(None).await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("server", &self.connected_url())
            .finish()
    }
}
