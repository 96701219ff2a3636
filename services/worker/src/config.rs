use crate::ws::backoff::BackoffPolicy;
use crate::ws::connection::ConnectionSettings;
use crate::ws::protocol::Mode;
use crate::ws::session::{DecisionDefault, SessionSettings};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// Fixed generation id. When unset, a saved session or a fresh UUID is used.
    pub generation_id: Option<String>,
    pub mode: Mode,
    pub prompt: String,
    pub workspace_path: PathBuf,
    pub generator_command: Option<String>,
    pub log_buffer: usize,
    pub log_level: Level,
    pub connection: ConnectionSettings,
    pub session: SessionSettings,
}

impl Config {
    /// Builds a configuration with every optional setting at its default.
    pub fn new(server_url: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            generation_id: None,
            mode: Mode::Autonomous,
            prompt: prompt.into(),
            workspace_path: PathBuf::from("."),
            generator_command: None,
            log_buffer: 1000,
            log_level: Level::INFO,
            connection: ConnectionSettings {
                url: server_url.into(),
                auth_token: None,
                connect_timeout: Duration::from_secs(10),
                send_timeout: Duration::from_secs(10),
                backoff: BackoffPolicy::default(),
            },
            session: SessionSettings::default(),
        }
    }

    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let server_url = std::env::var("GENLOOP_SERVER_URL")
            .map_err(|_| ConfigError::MissingVar("GENLOOP_SERVER_URL".to_string()))?;
        if !(server_url.starts_with("ws://") || server_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(
                "GENLOOP_SERVER_URL".to_string(),
                format!("'{}' is not a ws:// or wss:// URL", server_url),
            ));
        }
        let prompt = std::env::var("GENLOOP_PROMPT")
            .map_err(|_| ConfigError::MissingVar("GENLOOP_PROMPT".to_string()))?;

        let mut config = Self::new(server_url, prompt);

        if let Ok(id) = std::env::var("GENLOOP_GENERATION_ID") {
            config.set_generation_id(id)?;
        }
        if let Ok(mode) = std::env::var("GENLOOP_MODE") {
            config.mode = mode
                .parse::<Mode>()
                .map_err(|e| ConfigError::InvalidValue("GENLOOP_MODE".to_string(), e))?;
        }
        if let Ok(path) = std::env::var("GENLOOP_WORKSPACE") {
            config.workspace_path = PathBuf::from(path);
        }
        config.generator_command = std::env::var("GENLOOP_GENERATOR_COMMAND").ok();
        config.connection.auth_token = std::env::var("GENLOOP_AUTH_TOKEN").ok();

        config.log_buffer = parse_var("GENLOOP_LOG_BUFFER", config.log_buffer)?;
        if config.log_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "GENLOOP_LOG_BUFFER".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let session = &mut config.session;
        session.max_iterations = parse_var("GENLOOP_MAX_ITERATIONS", session.max_iterations)?;
        if session.max_iterations == 0 {
            return Err(ConfigError::InvalidValue(
                "GENLOOP_MAX_ITERATIONS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        session.generation_timeout = secs_var("GENLOOP_GENERATION_TIMEOUT_SECS", session.generation_timeout)?;
        session.decision_timeout = secs_var("GENLOOP_DECISION_TIMEOUT_SECS", session.decision_timeout)?;
        session.decision_default =
            parse_var::<DecisionDefault>("GENLOOP_DECISION_DEFAULT", session.decision_default)?;

        let connection = &mut config.connection;
        connection.connect_timeout = secs_var("GENLOOP_CONNECT_TIMEOUT_SECS", connection.connect_timeout)?;
        connection.send_timeout = secs_var("GENLOOP_SEND_TIMEOUT_SECS", connection.send_timeout)?;
        let backoff = &mut connection.backoff;
        backoff.max_retries = parse_var("GENLOOP_MAX_RETRIES", backoff.max_retries)?;
        backoff.base_delay = millis_var("GENLOOP_BACKOFF_BASE_MS", backoff.base_delay)?;
        backoff.max_delay = millis_var("GENLOOP_BACKOFF_MAX_MS", backoff.max_delay)?;
        backoff.max_jitter = millis_var("GENLOOP_BACKOFF_JITTER_MS", backoff.max_jitter)?;
        if backoff.max_delay < backoff.base_delay {
            return Err(ConfigError::InvalidValue(
                "GENLOOP_BACKOFF_MAX_MS".to_string(),
                "must not be smaller than GENLOOP_BACKOFF_BASE_MS".to_string(),
            ));
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        config.log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(config)
    }

    /// Sets the generation id after checking it is usable on the wire.
    pub fn set_generation_id(&mut self, id: impl Into<String>) -> Result<(), ConfigError> {
        let id = id.into();
        validate_generation_id(&id)
            .map_err(|reason| ConfigError::InvalidValue("GENLOOP_GENERATION_ID".to_string(), reason))?;
        self.generation_id = Some(id);
        Ok(())
    }
}

/// Generation ids are 1 to 128 characters of `[A-Za-z0-9_-]`.
pub fn validate_generation_id(id: &str) -> Result<(), String> {
    if id.is_empty() || id.len() > 128 {
        return Err(format!("'{}' must be 1 to 128 characters long", id));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(format!("'{}' contains the invalid character '{}'", id, bad));
    }
    Ok(())
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("'{}': {}", raw, e))),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_var(name, default.as_secs()).map(Duration::from_secs)
}

fn millis_var(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_var(name, default_ms).map(Duration::from_millis)
}
