//! Application configuration loading and validation.
//!
//! The top-level `Config` aggregates the logger settings, the client connection
//! options and the soak workload. It is read from a TOML file once at startup,
//! validated as a whole, and stays immutable afterwards.
//!
//! ```toml
//! [logger]
//! level = "info"
//!
//! [client]
//! servers = ["nats://node-a:4222", "nats://node-b:4222"]
//! max_reconnect_attempts = 5
//!
//! [soak]
//! stream = "SOAK"
//! chaos_interval_secs = 20
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use validator::Validate;

use relaybee_client::Options;

use self::{logger::LoggerConfig, soak::SoakConfig};

pub mod logger;
pub mod soak;

/// UTC timestamp used by the `print_*` macros.
pub fn print_timestamp() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// Timestamped console output for the time before the tracing subscriber exists,
/// i.e. while the configuration itself is being loaded.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::print_timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::print_timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::print_timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

/// Errors that can occur during configuration loading, parsing or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Generic configuration-related error with a descriptive message.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error while accessing configuration files.
    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    /// Failure to parse the TOML configuration file.
    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    /// Validation failure after successful parsing.
    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Top-level application configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Logging subsystem configuration.
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Connection options of the client under test.
    #[validate(nested)]
    pub client: Options,

    /// Soak workload.
    #[validate(nested)]
    pub soak: SoakConfig,
}

impl Config {
    /// Constructs a new configuration by locating and loading the config file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the configuration file cannot be found,
    /// read, parsed, or validated.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::load(&config_path)
    }

    /// Determines the configuration file path.
    ///
    /// Priority:
    /// 1. `RELAYBEE_CONFIG` environment variable
    /// 2. `/etc/relaybee/config.toml`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Config` if no suitable file is found.
    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var("RELAYBEE_CONFIG") {
            let path = PathBuf::from(config_path);
            print_info!("Using config from RELAYBEE_CONFIG: {}", path.display());
            return Ok(path);
        }

        let fallback = Path::new("/etc/relaybee/config.toml");
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(
            "No configuration file found.".to_string(),
        ))
    }

    /// Loads and validates configuration from the specified path.
    ///
    /// # Errors
    ///
    /// Propagates IO, parsing, and validation errors as `ConfigError`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(path.to_string_lossy().to_string()));
        }

        let config = Self::from_toml(&fs::read_to_string(path)?)?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml(input: &str) -> Result<Config, ConfigError> {
        let config: Config =
            toml::from_str(input).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.logger.level, "info");
        assert_eq!(config.client.servers, vec!["nats://127.0.0.1:4222"]);
        assert_eq!(config.soak.stream, "SOAK");
    }

    #[test]
    fn test_sections_are_parsed() {
        let config = Config::from_toml(
            r#"
            [client]
            servers = ["a:4222", "b:4222"]
            randomize = false
            max_reconnect_attempts = 3

            [soak]
            probe_subject = "probe.x"
            chaos_interval_secs = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.client.servers.len(), 2);
        assert!(!config.client.randomize);
        assert_eq!(config.client.max_reconnect_attempts, Some(3));
        assert_eq!(config.soak.probe_subject, "probe.x");
        assert_eq!(config.soak.chaos_interval_secs, 0);
    }

    #[test]
    fn test_nested_validation_errors() {
        let err = Config::from_toml("[client]\nservers = []\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let err = Config::from_toml("[logger]\nlevel = \"loud\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let err = Config::from_toml("[client\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[soak]\nstream = \"FILE\"").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.soak.stream, "FILE");

        let missing = Config::load(Path::new("/nonexistent/relaybee.toml"));
        assert!(matches!(missing, Err(ConfigError::Config(_))));
    }
}
