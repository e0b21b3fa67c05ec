#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use relaybee_client::{
    transport::memory::MemoryNetwork, ClientError, Connection, ConnectionBuilder, ConnectionEvent,
    EventKind, Options,
};

pub const A: &str = "nats://a:4222";
pub const B: &str = "nats://b:4222";
pub const C: &str = "nats://c:4222";

/// Options tuned for fast tests: fixed order, short waits, no keepalive.
pub fn options(servers: &[&str]) -> Options {
    Options {
        servers: servers.iter().map(|s| s.to_string()).collect(),
        randomize: false,
        connect_timeout_ms: 500,
        reconnect_wait_ms: 20,
        reconnect_wait_max_ms: 20,
        ping_interval_ms: 0,
        idle_heartbeat_ms: 50,
        ..Default::default()
    }
}

pub fn network(nodes: &[&str]) -> MemoryNetwork {
    let network = MemoryNetwork::new();
    for node in nodes {
        network.add_node(node).unwrap();
    }
    network
}

/// Ordered record of every connection event.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<EventKind>>>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn attach(&self, mut builder: ConnectionBuilder) -> ConnectionBuilder {
        for kind in [
            EventKind::Connected,
            EventKind::Disconnected,
            EventKind::Reconnected,
            EventKind::Closed,
            EventKind::AsyncError,
            EventKind::ServersDiscovered,
        ] {
            let log = self.clone();
            builder = builder.on_event(kind, move |event| log.record(event));
        }
        builder
    }

    fn record(&self, event: &ConnectionEvent) {
        if let ConnectionEvent::AsyncError { error, .. } = event {
            self.errors.lock().unwrap().push(error.to_string());
        }
        self.events.lock().unwrap().push(event.kind());
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    /// Kinds without async errors and discoveries, for lifecycle assertions.
    pub fn lifecycle(&self) -> Vec<EventKind> {
        self.kinds()
            .into_iter()
            .filter(|k| !matches!(k, EventKind::AsyncError | EventKind::ServersDiscovered))
            .collect()
    }
}

pub async fn connect(network: &MemoryNetwork, options: Options, log: &EventLog) -> Connection {
    try_connect(network, options, log).await.unwrap()
}

pub async fn try_connect(
    network: &MemoryNetwork,
    options: Options,
    log: &EventLog,
) -> Result<Connection, ClientError> {
    log.attach(ConnectionBuilder::new(options).transport(network.clone()))
        .connect()
        .await
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub fn payload_of(msg: &relaybee_client::Message) -> String {
    String::from_utf8_lossy(&msg.payload).into_owned()
}
