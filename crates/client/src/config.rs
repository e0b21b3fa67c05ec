//! Connection options.
//!
//! `Options` is read-only to the runtime once a connection is built. It deserializes
//! from any serde format (the soak agent embeds it in its TOML file) and is validated
//! with the `validator` crate before the first connect attempt, so a bad value fails
//! at startup rather than in the middle of a failover.
//!
//! Durations are expressed in milliseconds (`*_ms` fields) and exposed as
//! `std::time::Duration` through accessor methods.
//!
//! # Examples
//!
//! ```toml
//! servers = ["nats://node-a:4222", "nats://node-b:4222"]
//! randomize = false
//! max_reconnect_attempts = 10
//! reconnect_wait_ms = 500
//! pending_msgs_limit = 1024
//! delivery_workers = 8
//! ```
//!
//! ```ignore
//! let options = Options {
//!     servers: vec!["nats://localhost:4222".into()],
//!     reconnect_on_connect: true,
//!     ..Default::default()
//! };
//! options.validate()?;
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::pool::ServerAddr;

/// Default maximum number of pending messages per subscription.
pub const DEFAULT_PENDING_MSGS_LIMIT: usize = 512 * 1024;

/// Default maximum number of pending payload bytes per subscription.
pub const DEFAULT_PENDING_BYTES_LIMIT: usize = 64 * 1024 * 1024;

/// Client connection options.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Options {
    /// Seed server URLs.
    ///
    /// Accepted forms: `nats://host:port`, `host:port` or `host` (default port 4222).
    ///
    /// # Validation
    /// - At least one entry
    /// - Every entry must parse as a server URL
    #[validate(custom(function = "validate_servers"))]
    pub servers: Vec<String>,

    /// Shuffle the seed servers once when the pool is built.
    ///
    /// Spreads clients across a cluster. Disable to get a deterministic order.
    pub randomize: bool,

    /// Optional client name announced in the handshake.
    #[validate(length(max = 255, message = "Client name must not exceed 255 characters"))]
    pub name: Option<String>,

    /// How long a single transport open (including handshake) may take.
    ///
    /// # Validation
    /// - Range: 1ms - 10 minutes
    #[validate(range(
        min = 1,
        max = 600000,
        message = "Connect timeout must be between 1ms and 10 minutes"
    ))]
    pub connect_timeout_ms: u64,

    /// Whether a lost session is recovered at all.
    ///
    /// With `false` the first disconnect closes the connection.
    pub allow_reconnect: bool,

    /// Enter the reconnection engine instead of failing when no server accepts the
    /// first connect pass.
    pub reconnect_on_connect: bool,

    /// Reconnect attempts allowed per pool entry before the entry is skipped.
    ///
    /// `None` means unlimited. The initial connect pass does not count.
    pub max_reconnect_attempts: Option<u32>,

    /// Minimum wait before a pool entry is tried again.
    ///
    /// # Validation
    /// - Range: 0 - 10 minutes
    #[validate(range(max = 600000, message = "Reconnect wait must not exceed 10 minutes"))]
    pub reconnect_wait_ms: u64,

    /// Upper bound for the grown reconnect wait.
    #[validate(range(max = 3600000, message = "Reconnect wait max must not exceed 1 hour"))]
    pub reconnect_wait_max_ms: u64,

    /// Growth factor of the reconnect wait. `1.0` keeps it constant.
    ///
    /// # Validation
    /// - Range: 1.0 - 10.0
    #[validate(range(
        min = 1.0,
        max = 10.0,
        message = "Reconnect backoff multiplier must be between 1.0 and 10.0"
    ))]
    pub reconnect_backoff_multiplier: f64,

    /// Bytes of outbound frames buffered while reconnecting.
    ///
    /// Writes beyond the limit fail with `ReconnectBufferExceeded`.
    pub reconnect_buffer_size: usize,

    /// Default pending message limit for new subscriptions.
    #[validate(range(min = 1, message = "Pending message limit must be positive"))]
    pub pending_msgs_limit: usize,

    /// Default pending byte limit for new subscriptions.
    #[validate(range(min = 1, message = "Pending byte limit must be positive"))]
    pub pending_bytes_limit: usize,

    /// Number of callback delivery workers.
    ///
    /// Subscriptions are assigned to workers by hashing their id. The count is
    /// independent of how many subscriptions exist.
    ///
    /// # Validation
    /// - Range: 1 - 256
    #[validate(range(
        min = 1,
        max = 256,
        message = "Delivery workers must be between 1 and 256"
    ))]
    pub delivery_workers: usize,

    /// Idle heartbeat period requested for ordered consumers.
    #[validate(range(
        min = 1,
        max = 3600000,
        message = "Idle heartbeat must be between 1ms and 1 hour"
    ))]
    pub idle_heartbeat_ms: u64,

    /// Multiple of the idle heartbeat after which silence counts as heartbeat loss.
    ///
    /// # Validation
    /// - Range: 1.0 - 100.0
    #[validate(range(
        min = 1.0,
        max = 100.0,
        message = "Heartbeat margin must be between 1.0 and 100.0"
    ))]
    pub heartbeat_margin: f64,

    /// Interval of keepalive pings. `0` disables them.
    pub ping_interval_ms: u64,

    /// Unanswered pings tolerated before the session is considered stale.
    #[validate(range(min = 1, message = "Max pings outstanding must be positive"))]
    pub max_pings_outstanding: u32,

    /// Default timeout of `request` and `flush`.
    #[validate(range(min = 1, message = "Request timeout must be positive"))]
    pub request_timeout_ms: u64,

    /// Whether the server should deliver this connection's own publishes back to it.
    pub echo: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            servers: vec!["nats://127.0.0.1:4222".into()],
            randomize: true,
            name: None,
            connect_timeout_ms: 2000,
            allow_reconnect: true,
            reconnect_on_connect: false,
            max_reconnect_attempts: Some(60),
            reconnect_wait_ms: 2000,
            reconnect_wait_max_ms: 2000,
            reconnect_backoff_multiplier: 1.0,
            reconnect_buffer_size: 8 * 1024 * 1024,
            pending_msgs_limit: DEFAULT_PENDING_MSGS_LIMIT,
            pending_bytes_limit: DEFAULT_PENDING_BYTES_LIMIT,
            delivery_workers: 4,
            idle_heartbeat_ms: 5000,
            heartbeat_margin: 2.0,
            ping_interval_ms: 120000,
            max_pings_outstanding: 2,
            request_timeout_ms: 2000,
            echo: true,
        }
    }
}

impl Options {
    /// Convenience constructor for a list of seed servers with default settings.
    pub fn with_servers<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Options {
            servers: servers.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }

    pub fn reconnect_wait_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_max_ms)
    }

    pub fn idle_heartbeat(&self) -> Duration {
        Duration::from_millis(self.idle_heartbeat_ms)
    }

    /// Silence after which an ordered consumer assumes its server-side consumer is gone.
    pub fn heartbeat_threshold(&self) -> Duration {
        self.idle_heartbeat().mul_f64(self.heartbeat_margin)
    }

    /// `None` when keepalive pings are disabled.
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Validates the seed server list.
fn validate_servers(servers: &[String]) -> Result<(), ValidationError> {
    if servers.is_empty() {
        return Err(ValidationError::new("empty_servers")
            .with_message("At least one server URL is required".into()));
    }

    for server in servers {
        if ServerAddr::parse(server).is_err() {
            return Err(ValidationError::new("invalid_server_url")
                .with_message(format!("Invalid server URL: {server}").into()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        let options = Options::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.delivery_workers, 4);
        assert_eq!(options.heartbeat_threshold(), Duration::from_secs(10));
    }

    #[test]
    fn test_empty_servers_rejected() {
        let options = Options {
            servers: vec![],
            ..Default::default()
        };
        let err = options.validate().unwrap_err();
        assert!(err.field_errors().contains_key("servers"));
    }

    #[test]
    fn test_bad_server_url_rejected() {
        let options = Options::with_servers(["nats://has space:4222"]);
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let options = Options {
            delivery_workers: 0,
            ..Default::default()
        };
        let err = options.validate().unwrap_err();
        assert!(err.field_errors().contains_key("delivery_workers"));
    }

    #[test]
    fn test_options_from_toml() {
        let options: Options = toml::from_str(
            r#"
            servers = ["nats://node-a:4222", "node-b:4223"]
            randomize = false
            max_reconnect_attempts = 3
            reconnect_wait_ms = 50
            delivery_workers = 2
            "#,
        )
        .unwrap();

        assert_eq!(options.servers.len(), 2);
        assert!(!options.randomize);
        assert_eq!(options.max_reconnect_attempts, Some(3));
        assert_eq!(options.reconnect_wait(), Duration::from_millis(50));
        assert_eq!(options.pending_msgs_limit, DEFAULT_PENDING_MSGS_LIMIT);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_ping_interval_disabled() {
        let options = Options {
            ping_interval_ms: 0,
            ..Default::default()
        };
        assert!(options.ping_interval().is_none());
    }
}
