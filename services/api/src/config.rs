//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use doc_chat_core::CoordinatorSettings;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub log_level: Level,
    pub openai_api_key: Option<String>,
    pub qa_model: String,
    pub answer_timeout: Duration,
    pub max_upload_bytes: usize,
    pub upload_dir: PathBuf,
    pub upload_chunk_bytes: usize,
    pub cors_origin: String,
    /// How long a session with no attached client survives before it is ended.
    pub session_idle_ttl: Duration,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        // --- Server Settings ---
        let bind_address = parse_or(&lookup, "BIND_ADDRESS", "0.0.0.0:3000")?;

        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let cors_origin =
            lookup("CORS_ORIGIN").unwrap_or_else(|| "http://localhost:5173".to_string());

        // --- Answering Service ---
        let openai_api_key = lookup("OPENAI_API_KEY");
        let qa_model = lookup("QA_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());
        let answer_timeout_secs: u64 = parse_or(&lookup, "ANSWER_TIMEOUT_SECS", "30")?;
        if answer_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "ANSWER_TIMEOUT_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        // --- Uploads ---
        let max_upload_bytes = parse_or(&lookup, "MAX_UPLOAD_BYTES", "26214400")?;
        let upload_dir = lookup("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./uploads"));
        let upload_chunk_bytes: usize = parse_or(&lookup, "UPLOAD_CHUNK_BYTES", "65536")?;
        if upload_chunk_bytes == 0 {
            return Err(ConfigError::InvalidValue(
                "UPLOAD_CHUNK_BYTES".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        // --- Sessions ---
        let session_idle_ttl_secs: u64 = parse_or(&lookup, "SESSION_IDLE_TTL_SECS", "1800")?;
        if session_idle_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "SESSION_IDLE_TTL_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            bind_address,
            log_level,
            openai_api_key,
            qa_model,
            answer_timeout: Duration::from_secs(answer_timeout_secs),
            max_upload_bytes,
            upload_dir,
            upload_chunk_bytes,
            cors_origin,
            session_idle_ttl: Duration::from_secs(session_idle_ttl_secs),
        })
    }

    /// Settings for each session coordinator created by the service.
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            answer_timeout: self.answer_timeout,
            ..CoordinatorSettings::default()
        }
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: &str,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key).unwrap_or_else(|| default.to_string());
    raw.parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.bind_address.port(), 3000);
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.answer_timeout, Duration::from_secs(30));
        assert_eq!(config.max_upload_bytes, 25 * 1024 * 1024);
        assert_eq!(config.upload_chunk_bytes, 64 * 1024);
        assert!(config.openai_api_key.is_none());
        assert_eq!(config.session_idle_ttl, Duration::from_secs(1800));
    }

    #[test]
    fn invalid_values_are_reported_by_name() {
        let err = from_pairs(&[("BIND_ADDRESS", "nowhere")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref key, _) if key == "BIND_ADDRESS"));

        let err = from_pairs(&[("ANSWER_TIMEOUT_SECS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref key, _) if key == "ANSWER_TIMEOUT_SECS"));

        let err = from_pairs(&[("SESSION_IDLE_TTL_SECS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref key, _) if key == "SESSION_IDLE_TTL_SECS"));

        let err = from_pairs(&[("RUST_LOG", "chatty")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref key, _) if key == "RUST_LOG"));
    }

    #[test]
    fn coordinator_settings_carry_timeout() {
        let config = from_pairs(&[("ANSWER_TIMEOUT_SECS", "7")]).unwrap();
        assert_eq!(
            config.coordinator_settings().answer_timeout,
            Duration::from_secs(7)
        );
    }
}
