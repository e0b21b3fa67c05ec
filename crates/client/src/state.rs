//! Connection state tracking.
//!
//! The connection publishes its state through a `tokio::sync::watch` channel so that
//! application code (readiness probes, dashboards, ordered consumers waiting to
//! resubscribe) can react to transitions without polling.
//!
//! # Examples
//!
//! ```ignore
//! let mut state_rx = connection.subscribe_state();
//! while state_rx.changed().await.is_ok() {
//!     println!("Status: {}", *state_rx.borrow());
//! }
//! ```

use std::fmt;

/// Represents the lifecycle state of a connection.
///
/// The lifecycle flows through these states:
/// - `Connecting` -> `Connected` (first session established)
/// - `Connected` -> `Reconnecting` (transport lost, failover in progress)
/// - `Reconnecting` -> `Connected` (a pool candidate accepted the session)
/// - any state -> `Closed` (explicit close, or every candidate exhausted)
///
/// `Closed` is terminal: a closed connection never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// The factory is performing the first connect pass.
    Connecting,

    /// A session is live; subscriptions and publishes go straight to the server.
    Connected,

    /// The session was lost. Outbound frames are buffered while the
    /// reconnection engine walks the server pool.
    Reconnecting,

    /// The connection is permanently closed.
    Closed,
}

impl ConnectionState {
    /// Returns a short static identifier for the state.
    ///
    /// # Examples
    /// ```ignore
    /// assert_eq!(ConnectionState::Reconnecting.as_str(), "Reconnecting");
    /// ```
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::Closed => "Closed",
        }
    }

    /// Returns true only when a session is live.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Returns true while a session is being (re)established.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }

    /// Returns true once the connection reached its terminal state.
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_as_str() {
        assert_eq!(ConnectionState::Connecting.as_str(), "Connecting");
        assert_eq!(ConnectionState::Connected.as_str(), "Connected");
        assert_eq!(ConnectionState::Reconnecting.as_str(), "Reconnecting");
        assert_eq!(ConnectionState::Closed.as_str(), "Closed");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "Reconnecting");
    }

    #[test]
    fn test_state_predicates() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Reconnecting.is_connected());
        assert!(ConnectionState::Connecting.is_connecting());
        assert!(ConnectionState::Reconnecting.is_connecting());
        assert!(!ConnectionState::Closed.is_connecting());
        assert!(ConnectionState::Closed.is_closed());
    }
}
