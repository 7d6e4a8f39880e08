//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The database URL is wrapped in `secrecy::SecretString` so it never lands
//! in a log line.

pub mod queue;

pub use queue::QueueConfig;

use std::path::PathBuf;

use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// TOML file describing the queue to serve, if not the defaults.
    pub queue_config_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            queue_config_path: std::env::var_os("ORDQ_QUEUE_CONFIG").map(PathBuf::from),
        })
    }

    /// The queue config named by `ORDQ_QUEUE_CONFIG`, or defaults for `name`.
    pub fn queue_config(&self, name: &str) -> Result<QueueConfig> {
        match &self.queue_config_path {
            Some(path) => QueueConfig::load(path),
            None => {
                let config = QueueConfig::new(name);
                config.validate()?;
                Ok(config)
            }
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
