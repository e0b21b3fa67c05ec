//! Error types for the client runtime.
//!
//! `ClientError` is the single error type returned by every public operation of the
//! crate. Its variants follow the failure taxonomy of the runtime:
//!
//! **Usage errors** (returned synchronously to the offending call):
//! - `ConnectionClosed`: the connection reached its terminal state
//! - `BadSubscription`: the subscription was unsubscribed or never existed
//! - `InvalidSubject` / `InvalidQueueGroup`: syntax rejected before anything is sent
//! - `InvalidOperation`: the call conflicts with the object's current mode
//! - `MaxPayloadExceeded`: the server advertised a smaller payload limit
//!
//! **Timeout and cancellation** (only the blocked caller sees these):
//! - `Timeout`, `Cancelled`, `Disconnected`
//!
//! **Asynchronous errors** (delivered through the async-error listener, never thrown
//! at unrelated callers):
//! - `SlowConsumer`, `Authorization`, `Server`
//!
//! **Fatal errors**:
//! - `NoServers`: every server pool candidate is exhausted
//!
//! # Usage
//!
//! ```ignore
//! match sub.next_msg(Duration::from_secs(1)).await {
//!     Ok(msg) => handle(msg),
//!     Err(ClientError::Timeout) => continue,
//!     Err(ClientError::BadSubscription | ClientError::ConnectionClosed) => break,
//!     Err(e) => return Err(e),
//! }
//! ```

use thiserror::Error;

use crate::transport::TransportError;

/// The unified error type for client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The connection is closed; nothing further can be sent or received.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No server in the pool accepted a connection.
    ///
    /// Returned by the initial connect when every candidate failed and
    /// `reconnect_on_connect` is disabled.
    #[error("No servers available for connection")]
    NoServers,

    /// The subscription is no longer valid.
    ///
    /// Subscribing on a closed connection also reports this error.
    #[error("Invalid subscription")]
    BadSubscription,

    /// Subject syntax was rejected.
    #[error("Invalid subject: {0:?}")]
    InvalidSubject(String),

    /// Queue group name was rejected.
    #[error("Invalid queue group: {0:?}")]
    InvalidQueueGroup(String),

    /// A server URL from the options could not be parsed.
    #[error("Invalid server url: {0}")]
    InvalidUrl(String),

    /// The blocking call did not complete within its timeout.
    #[error("Timeout")]
    Timeout,

    /// The blocking call was cancelled by its caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// The connection dropped while a round trip (flush) was in flight.
    #[error("Connection lost while waiting for the server")]
    Disconnected,

    /// Messages were dropped because the subscription's pending limits were hit.
    ///
    /// Raised once per overflow episode through the async-error listener.
    #[error("Slow consumer, messages dropped on subscription {sid}")]
    SlowConsumer {
        /// Id of the overflowing subscription.
        sid: u64,
    },

    /// The call is not allowed in the object's current mode.
    ///
    /// Examples: pulling from a callback subscription, or starting a second
    /// consumption mode on an ordered consumer.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Outbound data queued during reconnection exceeded `reconnect_buffer_size`.
    #[error("Outbound buffer limit exceeded while reconnecting")]
    ReconnectBufferExceeded,

    /// The payload is bigger than the server's advertised maximum.
    #[error("Payload of {size} bytes exceeds the server maximum of {max} bytes")]
    MaxPayloadExceeded {
        /// Size of the rejected payload.
        size: usize,
        /// Limit advertised by the server.
        max: usize,
    },

    /// The server rejected the client's credentials.
    #[error("Authorization violation: {0}")]
    Authorization(String),

    /// The server reported a non-fatal protocol error.
    #[error("Server error: {0}")]
    Server(String),

    /// The frame transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Options failed validation.
    #[error("Configuration error: {0}")]
    Config(#[from] validator::ValidationErrors),
}

impl ClientError {
    /// Returns true for errors that mean the connection can no longer be used.
    pub fn is_closed(&self) -> bool {
        matches!(self, ClientError::ConnectionClosed | ClientError::NoServers)
    }
}

/// Extracts the innermost error message from an error chain.
pub(crate) fn root_cause(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_display() {
        assert_eq!(ClientError::ConnectionClosed.to_string(), "Connection closed");
        assert_eq!(
            ClientError::InvalidSubject("a..b".into()).to_string(),
            "Invalid subject: \"a..b\""
        );
        assert_eq!(
            ClientError::SlowConsumer { sid: 7 }.to_string(),
            "Slow consumer, messages dropped on subscription 7"
        );
    }

    #[test]
    fn test_client_error_from_transport() {
        let err: ClientError = TransportError::ConnectionReset.into();
        assert!(matches!(err, ClientError::Transport(TransportError::ConnectionReset)));
    }

    #[test]
    fn test_root_cause_walks_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = ClientError::Transport(TransportError::Io(io));
        assert_eq!(root_cause(&err), "refused");
    }

    #[test]
    fn test_is_closed() {
        assert!(ClientError::ConnectionClosed.is_closed());
        assert!(ClientError::NoServers.is_closed());
        assert!(!ClientError::Timeout.is_closed());
    }
}
