//! Logging.
use std::fmt;

use serde::{Deserialize, Deserializer};
use strand_config::GenericConfiguration;
use strand_error::{generic_error, ErrorContext as _, GenericError};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter, Layer};

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Logging configuration.
///
/// Read from the `log_level` and `log_format_json` keys, which map to the `STRAND_LOG_LEVEL` and
/// `STRAND_LOG_FORMAT_JSON` environment variables when the configuration is loaded with the `STRAND` prefix.
#[derive(Debug, Deserialize)]
pub struct LoggingConfiguration {
    #[serde(default)]
    log_level: Option<LogLevel>,

    #[serde(default, deserialize_with = "deserialize_permissive_bool")]
    log_format_json: bool,
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` from the given configuration.
    ///
    /// When `log_level` is not set, the level falls back to `default_level`, or `INFO`.
    ///
    /// # Errors
    ///
    /// If the log level is not a valid set of filtering directives, an error is returned.
    pub fn from_configuration(
        config: &GenericConfiguration, default_level: Option<LevelFilter>,
    ) -> Result<Self, GenericError> {
        let mut logging_config: Self = config.as_typed()?;
        logging_config
            .log_level
            .get_or_insert_with(|| default_level.unwrap_or(LevelFilter::INFO).into());
        Ok(logging_config)
    }

    /// Returns `true` if logs are written as JSON.
    pub fn log_format_json(&self) -> bool {
        self.log_format_json
    }
}

/// Initializes the logging subsystem for `tracing` from the given configuration.
///
/// See [`LoggingConfiguration::from_configuration`]. Logs are written to standard error, either as JSON or in a
/// human-readable format.
///
/// # Errors
///
/// If the configuration is invalid, or the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging_from_configuration(
    config: &GenericConfiguration, default_level: Option<LevelFilter>,
) -> Result<(), GenericError> {
    initialize_logging_with(LoggingConfiguration::from_configuration(config, default_level)?)
}

fn initialize_logging_with(config: LoggingConfiguration) -> Result<(), GenericError> {
    let log_level = config.log_level.unwrap_or_else(default_log_level);
    let layer = if config.log_format_json {
        tracing_subscriber::fmt::Layer::new()
            .with_writer(std::io::stderr)
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_thread_names(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::Layer::new()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_names(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(log_level.0))
        .try_init()
        .error_context("Failed to initialize logging.")
}

fn default_log_level() -> LogLevel {
    LevelFilter::INFO.into()
}

#[derive(Deserialize)]
#[serde(try_from = "String")]
struct LogLevel(EnvFilter);

impl From<LevelFilter> for LogLevel {
    fn from(level: LevelFilter) -> Self {
        Self(EnvFilter::default().add_directive(level.into()))
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(generic_error!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(value)
            .map(Self)
            .error_context("Failed to parse valid log level.")
    }
}

impl fmt::Debug for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogLevel({})", self.0)
    }
}

fn parse_permissive_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1")
}

// Environment variables arrive as strings or integers, depending on how they parse.
fn deserialize_permissive_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PermissiveBool {
        Bool(bool),
        Int(i64),
        String(String),
    }

    Ok(match PermissiveBool::deserialize(deserializer)? {
        PermissiveBool::Bool(value) => value,
        PermissiveBool::Int(value) => value == 1,
        PermissiveBool::String(value) => parse_permissive_bool(&value),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use strand_config::ConfigurationLoader;

    use super::*;

    fn load_with_default(
        values: serde_json::Value, default_level: Option<LevelFilter>,
    ) -> Result<LoggingConfiguration, GenericError> {
        let config = ConfigurationLoader::default().from_serialized(values).into_generic();
        LoggingConfiguration::from_configuration(&config, default_level)
    }

    fn load(values: serde_json::Value) -> Result<LoggingConfiguration, GenericError> {
        load_with_default(values, None)
    }

    fn level_of(config: &LoggingConfiguration) -> String {
        config.log_level.as_ref().map(|level| level.0.to_string()).unwrap_or_default()
    }

    #[test]
    fn defaults() {
        let config = load(serde_json::json!({})).unwrap();
        assert!(!config.log_format_json());
        assert_eq!(level_of(&config), "info");
    }

    #[test]
    fn default_level_applies_only_when_unset() {
        let config = load_with_default(serde_json::json!({}), Some(LevelFilter::DEBUG)).unwrap();
        assert_eq!(level_of(&config), "debug");

        let config = load_with_default(
            serde_json::json!({ "log_level": "warn", "log_format_json": true }),
            Some(LevelFilter::DEBUG),
        )
        .unwrap();
        assert_eq!(level_of(&config), "warn");
        assert!(config.log_format_json());
    }

    #[test]
    fn settings_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(b"log_level: strand_io=trace,error\nlog_format_json: true\n").unwrap();

        let config = ConfigurationLoader::default().from_yaml(file.path()).unwrap().into_generic();
        let config = LoggingConfiguration::from_configuration(&config, Some(LevelFilter::DEBUG)).unwrap();
        assert!(level_of(&config).contains("strand_io=trace"));
        assert!(config.log_format_json());
    }

    #[test]
    fn level_directives() {
        let config = load(serde_json::json!({ "log_level": "strand_core=debug,warn" })).unwrap();
        assert!(level_of(&config).contains("strand_core=debug"));

        assert!(load(serde_json::json!({ "log_level": "" })).is_err());
        assert!(load(serde_json::json!({ "log_level": "strand_core=notalevel" })).is_err());
    }

    #[test]
    fn permissive_json_flag() {
        for (value, expected) in [
            (serde_json::json!(true), true),
            (serde_json::json!(1), true),
            (serde_json::json!("TRUE"), true),
            (serde_json::json!("0"), false),
            (serde_json::json!("no"), false),
        ] {
            let config = load(serde_json::json!({ "log_format_json": value.clone() })).unwrap();
            assert_eq!(config.log_format_json(), expected, "{}", value);
        }
    }
}
