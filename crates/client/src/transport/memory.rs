//! In-process broker fabric.
//!
//! `MemoryNetwork` simulates a small cluster of brokers sharing replicated streams.
//! Every node is addressed by the `host:port` of a server URL. The network implements
//! [`Transport`], so a `Connection` built on it goes through exactly the same
//! lifecycle as one talking to real servers.
//!
//! Supported broker behavior:
//! - subject routing with `*` / `>` wildcards, queue groups (round robin) and echo
//! - server-side auto-unsubscribe (`Unsub` with a maximum)
//! - streams capturing published messages, and ephemeral ordered consumers bound to
//!   a subscription, with sequence pairs and idle heartbeats
//! - `Ping` / `Pong`
//!
//! Chaos controls let tests and the soak agent break things on purpose: dropping
//! sessions, making nodes unreachable or stalled, rejecting credentials, forgetting
//! consumer state and announcing peers.
//!
//! # Examples
//!
//! ```ignore
//! let network = MemoryNetwork::new();
//! network.add_node("nats://a:4222")?;
//! network.add_node("nats://b:4222")?;
//!
//! let conn = ConnectionBuilder::new(Options::with_servers(["nats://a:4222", "nats://b:4222"]))
//!     .transport(network.clone())
//!     .connect()
//!     .await?;
//!
//! network.disconnect("nats://a:4222");
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{
    ConnectInfo, ConsumerSpec, DeliverPolicy, EventReader, Frame, FrameWriter, ProtocolEvent,
    ServerError, ServerInfo, Session, Transport, TransportError,
};
use crate::{
    error::ClientError,
    message::{Headers, Message, SequencePair, StreamMeta},
    pool::ServerAddr,
    subject::subject_matches,
};

/// Largest payload a memory node accepts.
pub const MEMORY_MAX_PAYLOAD: usize = 1024 * 1024;

fn node_key(url: &str) -> String {
    ServerAddr::parse(url)
        .map(|addr| addr.host_port())
        .unwrap_or_else(|_| url.to_string())
}

struct Node {
    reachable: bool,
    reject_auth: bool,
    stalled: bool,
    attempts: u32,
    connect_urls: Vec<String>,
}

impl Node {
    fn new() -> Self {
        Node {
            reachable: true,
            reject_auth: false,
            stalled: false,
            attempts: 0,
            connect_urls: Vec::new(),
        }
    }
}

struct ConsumerState {
    stream: String,
    /// First stream sequence the consumer delivers.
    start: u64,
    /// Consumer sequence of the last delivery.
    consumer_seq: u64,
    /// Stream sequence of the last delivery.
    last_stream: u64,
    heartbeat: CancellationToken,
}

struct ServerSub {
    subject: String,
    queue_group: Option<String>,
    max: Option<u64>,
    sent: u64,
    consumer: Option<ConsumerState>,
}

impl ServerSub {
    fn stop(&self) {
        if let Some(consumer) = &self.consumer {
            consumer.heartbeat.cancel();
        }
    }
}

struct SessionEntry {
    node: String,
    echo: bool,
    tx: mpsc::UnboundedSender<ProtocolEvent>,
    subs: HashMap<u64, ServerSub>,
}

impl SessionEntry {
    fn stop(&self) {
        for sub in self.subs.values() {
            sub.stop();
        }
    }
}

#[derive(Clone)]
struct StoredMessage {
    seq: u64,
    subject: String,
    headers: Option<Headers>,
    payload: Bytes,
}

struct Stream {
    subjects: Vec<String>,
    messages: Vec<StoredMessage>,
}

impl Stream {
    fn last_seq(&self) -> u64 {
        self.messages.last().map_or(0, |m| m.seq)
    }
}

#[derive(Default)]
struct FabricState {
    nodes: HashMap<String, Node>,
    sessions: HashMap<u64, SessionEntry>,
    streams: BTreeMap<String, Stream>,
    queue_cursors: HashMap<String, usize>,
}

impl FabricState {
    fn is_stalled(&self, node: &str) -> bool {
        self.nodes.get(node).is_some_and(|n| n.stalled)
    }

    fn remove_session(&mut self, id: u64) {
        if let Some(entry) = self.sessions.remove(&id) {
            entry.stop();
        }
    }

    fn subscribe(
        &mut self,
        fabric: &Arc<Fabric>,
        session: u64,
        sid: u64,
        subject: String,
        queue_group: Option<String>,
        consumer: Option<ConsumerSpec>,
    ) {
        let Some(entry) = self.sessions.get_mut(&session) else {
            return;
        };
        // Re-subscribing the same id replaces the interest.
        if let Some(old) = entry.subs.remove(&sid) {
            old.stop();
        }

        let consumer = consumer.map(|spec| {
            let heartbeat = CancellationToken::new();
            if !spec.idle_heartbeat.is_zero() {
                fabric.spawn_heartbeat(session, sid, spec.idle_heartbeat, heartbeat.clone());
            }
            ConsumerState {
                stream: spec.stream,
                start: match spec.deliver {
                    DeliverPolicy::All => 1,
                    DeliverPolicy::ByStartSequence(seq) => seq.max(1),
                },
                consumer_seq: 0,
                last_stream: 0,
                heartbeat,
            }
        });

        let backlog: Vec<StoredMessage> = match &consumer {
            Some(state) => self
                .streams
                .get(&state.stream)
                .map(|stream| {
                    stream
                        .messages
                        .iter()
                        .filter(|m| m.seq >= state.start && subject_matches(&subject, &m.subject))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
            None => Vec::new(),
        };

        entry.subs.insert(
            sid,
            ServerSub {
                subject,
                queue_group,
                max: None,
                sent: 0,
                consumer,
            },
        );

        for stored in &backlog {
            self.deliver_stream(session, sid, stored);
        }
    }

    fn unsubscribe(&mut self, session: u64, sid: u64, max: Option<u64>) {
        let Some(entry) = self.sessions.get_mut(&session) else {
            return;
        };

        let done = match (max, entry.subs.get_mut(&sid)) {
            (None, _) => true,
            (Some(max), Some(sub)) if sub.sent >= max => true,
            (Some(max), Some(sub)) => {
                sub.max = Some(max);
                false
            }
            (Some(_), None) => false,
        };

        if done {
            if let Some(sub) = entry.subs.remove(&sid) {
                sub.stop();
            }
        }
    }

    fn publish(
        &mut self,
        from: u64,
        subject: String,
        reply_to: Option<String>,
        headers: Option<Headers>,
        payload: Bytes,
    ) {
        let mut stored_msgs = Vec::new();
        for (name, stream) in self.streams.iter_mut() {
            if stream.subjects.iter().any(|p| subject_matches(p, &subject)) {
                let stored = StoredMessage {
                    seq: stream.last_seq() + 1,
                    subject: subject.clone(),
                    headers: headers.clone(),
                    payload: payload.clone(),
                };
                stream.messages.push(stored.clone());
                stored_msgs.push((name.clone(), stored));
            }
        }

        for (stream_name, stored) in &stored_msgs {
            let targets: Vec<(u64, u64)> = self
                .sessions
                .iter()
                .flat_map(|(session, entry)| {
                    entry
                        .subs
                        .iter()
                        .filter(|(_, sub)| {
                            sub.consumer
                                .as_ref()
                                .is_some_and(|c| &c.stream == stream_name && stored.seq >= c.start)
                                && subject_matches(&sub.subject, &stored.subject)
                        })
                        .map(move |(sid, _)| (*session, *sid))
                })
                .collect();

            for (session, sid) in targets {
                self.deliver_stream(session, sid, stored);
            }
        }

        let echo = self.sessions.get(&from).map_or(true, |e| e.echo);
        let mut targets = Vec::new();
        let mut groups: BTreeMap<String, Vec<(u64, u64)>> = BTreeMap::new();

        for (session, entry) in &self.sessions {
            if (!echo && *session == from) || self.is_stalled(&entry.node) {
                continue;
            }
            for (sid, sub) in &entry.subs {
                if sub.consumer.is_some() || !subject_matches(&sub.subject, &subject) {
                    continue;
                }
                match &sub.queue_group {
                    Some(group) => groups.entry(group.clone()).or_default().push((*session, *sid)),
                    None => targets.push((*session, *sid)),
                }
            }
        }

        for (group, mut members) in groups {
            members.sort_unstable();
            let cursor = self.queue_cursors.entry(group).or_insert(0);
            targets.push(members[*cursor % members.len()]);
            *cursor += 1;
        }

        for (session, sid) in targets {
            self.deliver(
                session,
                sid,
                Message {
                    subject: subject.clone(),
                    reply_to: reply_to.clone(),
                    headers: headers.clone(),
                    payload: payload.clone(),
                    sid,
                    stream: None,
                },
            );
        }
    }

    fn deliver(&mut self, session: u64, sid: u64, msg: Message) {
        let Some(entry) = self.sessions.get_mut(&session) else {
            return;
        };
        let Some(sub) = entry.subs.get_mut(&sid) else {
            return;
        };

        sub.sent += 1;
        let _ = entry.tx.send(ProtocolEvent::Msg(msg));

        if sub.max.is_some_and(|max| sub.sent >= max) {
            trace!("Subscription {sid} reached its limit");
            if let Some(sub) = entry.subs.remove(&sid) {
                sub.stop();
            }
        }
    }

    /// Sends one stored message through a consumer. A stalled node loses it, but
    /// the consumer sequence still advances.
    fn deliver_stream(&mut self, session: u64, sid: u64, stored: &StoredMessage) {
        let stalled = match self.sessions.get(&session) {
            Some(entry) => self.is_stalled(&entry.node),
            None => return,
        };
        let Some(entry) = self.sessions.get_mut(&session) else {
            return;
        };
        let Some(consumer) = entry.subs.get_mut(&sid).and_then(|s| s.consumer.as_mut()) else {
            return;
        };

        consumer.consumer_seq += 1;
        consumer.last_stream = stored.seq;
        if stalled {
            return;
        }

        let msg = Message {
            subject: stored.subject.clone(),
            reply_to: None,
            headers: stored.headers.clone(),
            payload: stored.payload.clone(),
            sid,
            stream: Some(StreamMeta::Delivery(SequencePair::new(
                stored.seq,
                consumer.consumer_seq,
            ))),
        };
        let _ = entry.tx.send(ProtocolEvent::Msg(msg));
    }

    /// Returns false once the consumer is gone.
    fn heartbeat(&mut self, session: u64, sid: u64) -> bool {
        let stalled = match self.sessions.get(&session) {
            Some(entry) => self.is_stalled(&entry.node),
            None => return false,
        };
        let Some(entry) = self.sessions.get(&session) else {
            return false;
        };
        let Some(sub) = entry.subs.get(&sid) else {
            return false;
        };
        let Some(consumer) = &sub.consumer else {
            return false;
        };

        if !stalled {
            let msg = Message {
                subject: sub.subject.clone(),
                reply_to: None,
                headers: None,
                payload: Bytes::new(),
                sid,
                stream: Some(StreamMeta::Heartbeat {
                    last: SequencePair::new(consumer.last_stream, consumer.consumer_seq),
                }),
            };
            let _ = entry.tx.send(ProtocolEvent::Msg(msg));
        }
        true
    }

    fn sessions_of(&self, node: &str) -> Vec<u64> {
        self.sessions
            .iter()
            .filter(|(_, entry)| entry.node == node)
            .map(|(id, _)| *id)
            .collect()
    }
}

struct Fabric {
    state: Mutex<FabricState>,
    next_session: AtomicU64,
}

impl Fabric {
    fn handle(self: &Arc<Self>, session: u64, frame: Frame) -> Result<(), TransportError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(entry) = state.sessions.get(&session) else {
            return Err(TransportError::ConnectionReset);
        };
        if state.is_stalled(&entry.node) {
            trace!("Node {} stalled, frame swallowed", entry.node);
            return Ok(());
        }

        match frame {
            Frame::Sub {
                sid,
                subject,
                queue_group,
                consumer,
            } => state.subscribe(self, session, sid, subject, queue_group, consumer),
            Frame::Unsub { sid, max } => state.unsubscribe(session, sid, max),
            Frame::Pub {
                subject,
                reply_to,
                headers,
                payload,
            } => state.publish(session, subject, reply_to, headers, payload),
            Frame::Ping => {
                let _ = entry.tx.send(ProtocolEvent::Pong);
            }
            Frame::Pong => {}
        }
        Ok(())
    }

    fn spawn_heartbeat(
        self: &Arc<Self>,
        session: u64,
        sid: u64,
        interval: Duration,
        token: CancellationToken,
    ) {
        let fabric: Weak<Fabric> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let Some(fabric) = fabric.upgrade() else {
                    return;
                };
                if !fabric.state.lock().heartbeat(session, sid) {
                    return;
                }
            }
        });
    }
}

/// An in-process cluster of brokers. Clones share the same cluster.
#[derive(Clone)]
pub struct MemoryNetwork {
    fabric: Arc<Fabric>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        MemoryNetwork {
            fabric: Arc::new(Fabric {
                state: Mutex::new(FabricState::default()),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Adds a reachable node listening on `url`.
    pub fn add_node(&self, url: &str) -> Result<ServerAddr, ClientError> {
        let addr = ServerAddr::parse(url)?;
        self.fabric
            .state
            .lock()
            .nodes
            .entry(addr.host_port())
            .or_insert_with(Node::new);
        Ok(addr)
    }

    /// Creates a stream capturing every message published on a matching subject.
    pub fn add_stream(&self, name: &str, subjects: &[&str]) {
        self.fabric.state.lock().streams.insert(
            name.to_string(),
            Stream {
                subjects: subjects.iter().map(ToString::to_string).collect(),
                messages: Vec::new(),
            },
        );
    }

    /// Sequence of the last message stored in `stream`, `0` when empty or unknown.
    pub fn stream_last_seq(&self, stream: &str) -> u64 {
        self.fabric
            .state
            .lock()
            .streams
            .get(stream)
            .map_or(0, Stream::last_seq)
    }

    /// Whether new connections to the node succeed. Live sessions are unaffected.
    pub fn set_reachable(&self, url: &str, reachable: bool) {
        if let Some(node) = self.fabric.state.lock().nodes.get_mut(&node_key(url)) {
            node.reachable = reachable;
        }
    }

    /// Makes the node refuse the handshake with an authorization violation.
    pub fn reject_auth(&self, url: &str, reject: bool) {
        if let Some(node) = self.fabric.state.lock().nodes.get_mut(&node_key(url)) {
            node.reject_auth = reject;
        }
    }

    /// A stalled node keeps its sessions open but neither reads nor writes: frames
    /// are swallowed, pings go unanswered and deliveries are lost.
    pub fn stall(&self, url: &str, stalled: bool) {
        if let Some(node) = self.fabric.state.lock().nodes.get_mut(&node_key(url)) {
            node.stalled = stalled;
        }
    }

    /// Drops every session on the node. Returns how many were dropped.
    pub fn disconnect(&self, url: &str) -> usize {
        let key = node_key(url);
        let mut state = self.fabric.state.lock();
        let ids = state.sessions_of(&key);
        for id in &ids {
            state.remove_session(*id);
        }
        debug!("Dropped {} sessions on {key}", ids.len());
        ids.len()
    }

    /// Takes the node down: unreachable, every session dropped.
    pub fn stop_node(&self, url: &str) -> usize {
        self.set_reachable(url, false);
        self.disconnect(url)
    }

    /// Loses every consumer's state, as after a server restart. The subscriptions
    /// stay open but nothing arrives on them anymore, heartbeats included.
    pub fn forget_consumers(&self) -> usize {
        let mut state = self.fabric.state.lock();
        let mut forgotten = 0;
        for entry in state.sessions.values_mut() {
            entry.subs.retain(|_, sub| {
                if sub.consumer.is_some() {
                    sub.stop();
                    forgotten += 1;
                    false
                } else {
                    true
                }
            });
        }
        forgotten
    }

    /// Sets the peers the node advertises and pushes them to its live sessions.
    pub fn announce(&self, url: &str, peers: &[&str]) {
        let key = node_key(url);
        let mut state = self.fabric.state.lock();
        let Some(node) = state.nodes.get_mut(&key) else {
            return;
        };
        node.connect_urls = peers.iter().map(ToString::to_string).collect();
        let info = server_info(&key, node);

        for entry in state.sessions.values().filter(|e| e.node == key) {
            let _ = entry.tx.send(ProtocolEvent::Info(info.clone()));
        }
    }

    /// Sends a server error to every session on the node.
    pub fn send_error(&self, url: &str, error: ServerError) {
        let key = node_key(url);
        let state = self.fabric.state.lock();
        for entry in state.sessions.values().filter(|e| e.node == key) {
            let _ = entry.tx.send(ProtocolEvent::Err(error.clone()));
        }
    }

    /// Number of times a connection to the node was attempted.
    pub fn open_attempts(&self, url: &str) -> u32 {
        self.fabric
            .state
            .lock()
            .nodes
            .get(&node_key(url))
            .map_or(0, |n| n.attempts)
    }

    pub fn reset_attempts(&self) {
        for node in self.fabric.state.lock().nodes.values_mut() {
            node.attempts = 0;
        }
    }

    /// Number of live sessions across the cluster.
    pub fn session_count(&self) -> usize {
        self.fabric.state.lock().sessions.len()
    }

    /// Number of live sessions on one node.
    pub fn sessions_on(&self, url: &str) -> usize {
        self.fabric.state.lock().sessions_of(&node_key(url)).len()
    }

    /// Number of registered interests across every session.
    pub fn interest_count(&self) -> usize {
        self.fabric
            .state
            .lock()
            .sessions
            .values()
            .map(|e| e.subs.len())
            .sum()
    }
}

fn server_info(key: &str, node: &Node) -> ServerInfo {
    ServerInfo {
        server_id: format!("memory-{key}"),
        server_name: key.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        max_payload: MEMORY_MAX_PAYLOAD,
        connect_urls: node.connect_urls.clone(),
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn open(
        &self,
        server: &ServerAddr,
        connect: &ConnectInfo,
    ) -> Result<Session, TransportError> {
        let key = server.host_port();
        let mut state = self.fabric.state.lock();

        let Some(node) = state.nodes.get_mut(&key) else {
            return Err(TransportError::ConnectionRefused(key));
        };
        node.attempts += 1;
        if !node.reachable {
            return Err(TransportError::ConnectionRefused(key));
        }
        if node.reject_auth {
            return Err(TransportError::Authorization(
                ServerError::AuthorizationViolation.to_string(),
            ));
        }
        let info = server_info(&key, node);

        let id = self.fabric.next_session.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        state.sessions.insert(
            id,
            SessionEntry {
                node: key.clone(),
                echo: connect.echo,
                tx,
                subs: HashMap::new(),
            },
        );
        debug!(
            "Session {id} opened on {key} for {}",
            connect.name.as_deref().unwrap_or("anonymous client")
        );

        Ok(Session {
            info,
            reader: Box::new(MemoryReader { rx }),
            writer: Box::new(MemoryWriter {
                fabric: self.fabric.clone(),
                session: id,
                closed: false,
            }),
        })
    }
}

struct MemoryReader {
    rx: mpsc::UnboundedReceiver<ProtocolEvent>,
}

#[async_trait]
impl EventReader for MemoryReader {
    async fn read_event(&mut self) -> Result<ProtocolEvent, TransportError> {
        self.rx.recv().await.ok_or(TransportError::ConnectionReset)
    }
}

struct MemoryWriter {
    fabric: Arc<Fabric>,
    session: u64,
    closed: bool,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn write(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.fabric.handle(self.session, frame)
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.fabric.state.lock().remove_session(self.session);
        }
    }
}
