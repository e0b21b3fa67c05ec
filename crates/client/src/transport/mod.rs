//! Frame transport: the boundary between the runtime and the wire.
//!
//! The runtime never touches sockets or bytes. A `Transport` opens a `Session` to a
//! server address, performing whatever handshake the wire needs, and the session
//! is split into two halves:
//!
//! - an `EventReader`, owned by the connection's reader loop, yielding typed
//!   `ProtocolEvent`s
//! - a `FrameWriter`, owned by the outbound path, accepting typed `Frame`s
//!
//! Any error from either half is treated as the loss of the session and handed to
//! the reconnection engine.
//!
//! The crate ships one implementation, the in-process broker fabric in
//! [`memory`], used by the tests and the soak agent.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::{
    message::{Headers, Message},
    pool::ServerAddr,
};

/// Parameters sent in the connect handshake.
#[derive(Debug, Clone, Default)]
pub struct ConnectInfo {
    pub name: Option<String>,
    pub echo: bool,
    pub lang: &'static str,
    pub version: &'static str,
}

/// Server information received in the handshake or pushed later as gossip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    pub server_id: String,
    pub server_name: String,
    pub version: String,

    /// Largest payload the server accepts. `0` means no advertised limit.
    pub max_payload: usize,

    /// Cluster peers the client may fail over to (`host:port`).
    pub connect_urls: Vec<String>,
}

/// Error frames a server may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    AuthorizationViolation,
    AuthorizationTimeout,
    PermissionsViolation(String),
    StaleConnection,
    Other(String),
}

impl ServerError {
    /// Authorization problems make the server unusable for this client.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            ServerError::AuthorizationViolation | ServerError::AuthorizationTimeout
        )
    }

    /// Errors after which the server will drop the session.
    pub fn is_session_fatal(&self) -> bool {
        self.is_auth() || matches!(self, ServerError::StaleConnection)
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::AuthorizationViolation => f.write_str("Authorization Violation"),
            ServerError::AuthorizationTimeout => f.write_str("Authorization Timeout"),
            ServerError::PermissionsViolation(detail) => {
                write!(f, "Permissions Violation: {detail}")
            }
            ServerError::StaleConnection => f.write_str("Stale Connection"),
            ServerError::Other(detail) => f.write_str(detail),
        }
    }
}

/// Typed events decoded by the transport.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    /// Updated server information (triggers a pool update).
    Info(ServerInfo),

    /// A message routed to one of this connection's subscription ids.
    Msg(Message),

    Ping,
    Pong,

    /// Acknowledgement of a verbose-mode frame.
    Ok,

    Err(ServerError),

    /// The server registered interest for `sid`.
    SubAck { sid: u64 },
}

/// Where a new server-side consumer starts delivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverPolicy {
    All,
    ByStartSequence(u64),
}

/// Request for an ephemeral, ordered server-side consumer bound to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub stream: String,
    pub deliver: DeliverPolicy,
    pub idle_heartbeat: Duration,
}

/// Outbound frames.
#[derive(Debug, Clone)]
pub enum Frame {
    Sub {
        sid: u64,
        subject: String,
        queue_group: Option<String>,
        consumer: Option<ConsumerSpec>,
    },
    Unsub {
        sid: u64,
        /// Total number of messages after which the server drops the interest.
        max: Option<u64>,
    },
    Pub {
        subject: String,
        reply_to: Option<String>,
        headers: Option<Headers>,
        payload: Bytes,
    },
    Ping,
    Pong,
}

impl Frame {
    /// Approximate encoded size, used to bound the reconnect buffer.
    pub fn size(&self) -> usize {
        match self {
            Frame::Sub {
                subject,
                queue_group,
                ..
            } => 16 + subject.len() + queue_group.as_ref().map_or(0, String::len),
            Frame::Unsub { .. } => 16,
            Frame::Pub {
                subject,
                reply_to,
                headers,
                payload,
            } => {
                16 + subject.len()
                    + reply_to.as_ref().map_or(0, String::len)
                    + headers.as_ref().map_or(0, Headers::encoded_len)
                    + payload.len()
            }
            Frame::Ping | Frame::Pong => 6,
        }
    }
}

/// Transport failures. Every one of them ends the session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection refused by {0}")]
    ConnectionRefused(String),

    #[error("Connection reset")]
    ConnectionReset,

    #[error("Connect timed out")]
    Timeout,

    #[error("Authorization violation: {0}")]
    Authorization(String),

    #[error("Authorization timeout")]
    AuthorizationTimeout,

    #[error("Session closed")]
    Closed,
}

impl TransportError {
    /// Authorization failures are reported as async errors before moving on.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            TransportError::Authorization(_) | TransportError::AuthorizationTimeout
        )
    }
}

/// An established session split into its read and write halves.
pub struct Session {
    /// Server information from the handshake.
    pub info: ServerInfo,
    pub reader: Box<dyn EventReader>,
    pub writer: Box<dyn FrameWriter>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("info", &self.info).finish()
    }
}

/// Opens sessions to servers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connects and performs the handshake.
    async fn open(&self, server: &ServerAddr, connect: &ConnectInfo)
        -> Result<Session, TransportError>;
}

/// Read half of a session.
#[async_trait]
pub trait EventReader: Send + 'static {
    /// Waits for the next event. An error means the session is gone.
    async fn read_event(&mut self) -> Result<ProtocolEvent, TransportError>;
}

/// Write half of a session.
#[async_trait]
pub trait FrameWriter: Send + 'static {
    async fn write(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Closes the session. Must be safe to call more than once.
    async fn close(&mut self);
}
