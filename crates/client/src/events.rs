//! Connection event notifications.
//!
//! Applications register listeners per event kind. Listeners run on a dedicated
//! event task, one event at a time, in registration order, so a slow listener never
//! blocks the reader loop or the reconnection engine. Events are queued in the order
//! the connection produced them, which gives the ordering guarantees:
//!
//! - `Disconnected` always precedes the matching `Reconnected`
//! - `Closed` is the last event of a connection
//!
//! Adding or removing listeners from inside a listener is allowed: dispatch works on
//! a snapshot of the listener list taken before the first listener runs.
//!
//! # Examples
//!
//! ```ignore
//! let id = connection.on_reconnected(|event| info!("back online: {event:?}"));
//! connection.remove_listener(id);
//! ```

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::RwLock;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::trace;

use crate::error::ClientError;

/// Kinds of connection events a listener can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Reconnected,
    Closed,
    AsyncError,
    ServersDiscovered,
}

/// A connection event.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The first session of the connection was established.
    Connected { server: String },

    /// The live session was lost.
    Disconnected { reason: String },

    /// A new session was established after a disconnect.
    Reconnected { server: String },

    /// The connection is closed for good.
    Closed,

    /// An error that no caller is waiting for.
    ///
    /// `sid` names the subscription the error belongs to, if any.
    AsyncError {
        sid: Option<u64>,
        error: ClientError,
    },

    /// Gossip added servers to the pool.
    ServersDiscovered { servers: Vec<String> },
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::Connected { .. } => EventKind::Connected,
            ConnectionEvent::Disconnected { .. } => EventKind::Disconnected,
            ConnectionEvent::Reconnected { .. } => EventKind::Reconnected,
            ConnectionEvent::Closed => EventKind::Closed,
            ConnectionEvent::AsyncError { .. } => EventKind::AsyncError,
            ConnectionEvent::ServersDiscovered { .. } => EventKind::ServersDiscovered,
        }
    }
}

/// Callback invoked for matching events.
pub type Listener = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Handle returned on registration, used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Registered listeners of one connection.
#[derive(Default)]
pub struct Listeners {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ListenerId, EventKind, Listener)>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` for events of `kind`.
    pub fn add<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, kind, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns false when it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry_id, _, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Invokes every listener registered for the event's kind.
    pub(crate) fn dispatch(&self, event: &ConnectionEvent) {
        let kind = event.kind();
        let snapshot: Vec<Listener> = self
            .entries
            .read()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, listener)| listener.clone())
            .collect();

        for listener in snapshot {
            listener(event);
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners").field("len", &self.len()).finish()
    }
}

/// Queue feeding the event task.
pub(crate) struct EventQueue {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl EventQueue {
    /// Spawns the event task. It exits after dispatching `Closed`.
    pub(crate) fn start(listeners: Arc<Listeners>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<ConnectionEvent>();

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                trace!("Dispatching connection event {:?}", event.kind());
                let closed = matches!(event, ConnectionEvent::Closed);
                listeners.dispatch(&event);
                if closed {
                    break;
                }
            }
        });

        (EventQueue { tx }, handle)
    }

    pub(crate) fn push(&self, event: ConnectionEvent) {
        // The task only stops after Closed, and nothing is queued after Closed.
        let _ = self.tx.send(event);
    }
}
