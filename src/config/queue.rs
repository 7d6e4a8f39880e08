//! Per-queue settings.
//!
//! ```toml
//! name = "emails"
//! visibility_timeout_ms = 60000
//! max_retries = 5
//! dead_letter_queue_name = "emails-dlq"
//! ```
//!
//! Omitted fields take their defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_visibility_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_claim_retry_limit() -> u32 {
    16
}

fn default_sweep_on_dequeue() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,

    /// How long a claim stays invisible to other workers without an ack.
    #[serde(default = "default_visibility_timeout_ms")]
    pub visibility_timeout_ms: u64,

    /// Requeues allowed before a task is dead-lettered.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Also enqueue dead-lettered tasks here.
    #[serde(default)]
    pub dead_letter_queue_name: Option<String>,

    /// Attempts per operation when transactions keep conflicting.
    #[serde(default = "default_claim_retry_limit")]
    pub claim_retry_limit: u32,

    /// Sweep expired leases before every dequeue.
    #[serde(default = "default_sweep_on_dequeue")]
    pub sweep_on_dequeue: bool,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visibility_timeout_ms: default_visibility_timeout_ms(),
            max_retries: default_max_retries(),
            dead_letter_queue_name: None,
            claim_retry_limit: default_claim_retry_limit(),
            sweep_on_dequeue: default_sweep_on_dequeue(),
        }
    }

    pub fn with_visibility_timeout(mut self, ms: u64) -> Self {
        self.visibility_timeout_ms = ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_dead_letter_queue(mut self, name: impl Into<String>) -> Self {
        self.dead_letter_queue_name = Some(name.into());
        self
    }

    pub fn with_claim_retry_limit(mut self, limit: u32) -> Self {
        self.claim_retry_limit = limit;
        self
    }

    pub fn with_sweep_on_dequeue(mut self, enabled: bool) -> Self {
        self.sweep_on_dequeue = enabled;
        self
    }

    /// Settings for this queue's dead-letter queue, if it has one.
    ///
    /// The dead-letter queue keeps this queue's timeouts but never forwards
    /// further.
    pub fn dead_letter_config(&self) -> Option<QueueConfig> {
        self.dead_letter_queue_name.as_ref().map(|name| QueueConfig {
            name: name.clone(),
            dead_letter_queue_name: None,
            ..self.clone()
        })
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: QueueConfig =
            toml::from_str(s).map_err(|e| Error::Config(format!("invalid queue config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("queue name must not be empty".to_string()));
        }
        if self.visibility_timeout_ms == 0 {
            return Err(Error::Config("visibility_timeout_ms must be positive".to_string()));
        }
        if self.claim_retry_limit == 0 {
            return Err(Error::Config("claim_retry_limit must be at least 1".to_string()));
        }
        match self.dead_letter_queue_name.as_deref() {
            Some("") => Err(Error::Config("dead_letter_queue_name must not be empty".to_string())),
            Some(dlq) if dlq == self.name => Err(Error::Config(format!(
                "queue {:?} cannot be its own dead-letter queue",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}
