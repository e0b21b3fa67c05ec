//! Configuration of the soak workload.
//!
//! The soak agent runs an in-process broker cluster built from the client's seed
//! servers (plus optional gossip-only peers), then drives a probe publisher, a counting
//! subscription and an ordered consumer against it while chaos tasks take nodes down.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Soak workload settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SoakConfig {
    /// Nodes that exist in the cluster but are only learned through gossip.
    ///
    /// The first seed server announces them after startup.
    #[validate(custom(function = "validate_peers"))]
    pub gossip_peers: Vec<String>,

    /// Subject the probe publisher sends on. Must not contain wildcards.
    #[validate(length(min = 1, message = "Probe subject must not be empty"))]
    pub probe_subject: String,

    /// Stream captured by the ordered consumer.
    #[validate(length(min = 1, message = "Stream name must not be empty"))]
    pub stream: String,

    /// Subject patterns captured by the stream.
    #[validate(length(min = 1, message = "At least one stream subject is required"))]
    pub stream_subjects: Vec<String>,

    /// Interval between probe publishes, in milliseconds.
    #[validate(range(min = 1, message = "Publish interval must be at least 1ms"))]
    pub publish_interval_ms: u64,

    /// Interval between chaos actions, in seconds. `0` disables chaos.
    pub chaos_interval_secs: u64,

    /// Interval between progress reports, in seconds.
    #[validate(range(min = 1, message = "Report interval must be at least 1 second"))]
    pub report_interval_secs: u64,

    /// Pending message limit of the counting subscription.
    #[validate(range(min = 1, message = "Pending limit must be positive"))]
    pub pending_msgs_limit: usize,
}

impl Default for SoakConfig {
    fn default() -> Self {
        Self {
            gossip_peers: Vec::new(),
            probe_subject: "soak.probe".into(),
            stream: "SOAK".into(),
            stream_subjects: vec!["soak.>".into()],
            publish_interval_ms: 100,
            chaos_interval_secs: 30,
            report_interval_secs: 10,
            pending_msgs_limit: 4096,
        }
    }
}

fn validate_peers(peers: &[String]) -> Result<(), ValidationError> {
    for peer in peers {
        if relaybee_client::ServerAddr::parse(peer).is_err() {
            let mut err = ValidationError::new("invalid_peer");
            err.message = Some(format!("Invalid gossip peer: {}", peer).into());
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SoakConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        let config = SoakConfig {
            gossip_peers: vec!["".into()],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SoakConfig {
            report_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
