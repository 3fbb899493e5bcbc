//! Configuration management

use db_pool::DbConfig;
use resilience::RetryConfig;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::info;

use crate::error::{ReplicatorError, Result};
use crate::services::cdc::Identifier;

const SERVICE_NAME: &str = "cdc-replication-service";

/// Process configuration, read from the environment (`KAFKA_BOOTSTRAP`, `BATCH_SIZE`, ...)
#[derive(Clone, Deserialize)]
pub struct ReplicatorConfig {
    // Event source
    #[serde(default = "default_kafka_bootstrap")]
    pub kafka_bootstrap: String,
    #[serde(default = "default_kafka_group_id")]
    pub kafka_group_id: String,
    #[serde(default = "default_kafka_topic_pattern")]
    pub kafka_topic_pattern: String,
    /// Seconds to wait for a batch
    #[serde(default = "default_consumer_poll_timeout")]
    pub consumer_poll_timeout: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_kafka_session_timeout_ms")]
    pub kafka_session_timeout_ms: u32,
    #[serde(default = "default_kafka_heartbeat_interval_ms")]
    pub kafka_heartbeat_interval_ms: u32,

    // Target store
    #[serde(default = "default_target_db_host")]
    pub target_db_host: String,
    #[serde(default = "default_target_db_port")]
    pub target_db_port: u16,
    #[serde(default = "default_target_db_name")]
    pub target_db_name: String,
    #[serde(default = "default_target_db_user")]
    pub target_db_user: String,
    #[serde(default = "default_target_db_password")]
    pub target_db_password: String,
    #[serde(default)]
    pub target_db_schema: Option<String>,
    #[serde(default = "default_primary_key_column")]
    pub primary_key_column: String,

    // Connection management
    /// Seconds allowed for one connection attempt
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Connection attempts before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_base")]
    pub retry_backoff_base: f64,
    #[serde(default = "default_retry_backoff_max")]
    pub retry_backoff_max: f64,
    /// Seconds to pause after a failed cycle
    #[serde(default = "default_failure_pause")]
    pub failure_pause: f64,

    #[serde(default)]
    pub metrics_port: Option<u16>,
}

fn default_kafka_bootstrap() -> String {
    "localhost:9092".to_string()
}
fn default_kafka_group_id() -> String {
    "cdc-consumer-group".to_string()
}
fn default_kafka_topic_pattern() -> String {
    r"^cdc\.public\..*".to_string()
}
fn default_consumer_poll_timeout() -> f64 {
    1.0
}
fn default_batch_size() -> usize {
    100
}
fn default_kafka_session_timeout_ms() -> u32 {
    30_000
}
fn default_kafka_heartbeat_interval_ms() -> u32 {
    10_000
}
fn default_target_db_host() -> String {
    "localhost".to_string()
}
fn default_target_db_port() -> u16 {
    5433
}
fn default_target_db_name() -> String {
    "targetdb".to_string()
}
fn default_target_db_user() -> String {
    "migration".to_string()
}
fn default_target_db_password() -> String {
    "migration_secret".to_string()
}
fn default_primary_key_column() -> String {
    "id".to_string()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_backoff_base() -> f64 {
    2.0
}
fn default_retry_backoff_max() -> f64 {
    60.0
}
fn default_failure_pause() -> f64 {
    1.0
}

impl fmt::Debug for ReplicatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatorConfig")
            .field("kafka_bootstrap", &self.kafka_bootstrap)
            .field("kafka_group_id", &self.kafka_group_id)
            .field("kafka_topic_pattern", &self.kafka_topic_pattern)
            .field("consumer_poll_timeout", &self.consumer_poll_timeout)
            .field("batch_size", &self.batch_size)
            .field("kafka_session_timeout_ms", &self.kafka_session_timeout_ms)
            .field("kafka_heartbeat_interval_ms", &self.kafka_heartbeat_interval_ms)
            .field("target_db_host", &self.target_db_host)
            .field("target_db_port", &self.target_db_port)
            .field("target_db_name", &self.target_db_name)
            .field("target_db_user", &self.target_db_user)
            .field("target_db_password", &"[REDACTED]")
            .field("target_db_schema", &self.target_db_schema)
            .field("primary_key_column", &self.primary_key_column)
            .field("connect_timeout", &self.connect_timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_base", &self.retry_backoff_base)
            .field("retry_backoff_max", &self.retry_backoff_max)
            .field("failure_pause", &self.failure_pause)
            .field("metrics_port", &self.metrics_port)
            .finish()
    }
}

impl ReplicatorConfig {
    /// Load from the process environment and validate
    pub fn from_env() -> Result<Self> {
        let config: Self =
            envy::from_env().map_err(|e| ReplicatorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kafka_bootstrap.trim().is_empty() {
            return Err(ReplicatorError::Config(
                "KAFKA_BOOTSTRAP cannot be empty".to_string(),
            ));
        }
        if self.kafka_topic_pattern.trim().is_empty() {
            return Err(ReplicatorError::Config(
                "KAFKA_TOPIC_PATTERN cannot be empty".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ReplicatorError::Config(
                "BATCH_SIZE must be at least 1".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(ReplicatorError::Config(
                "MAX_RETRIES must be at least 1".to_string(),
            ));
        }
        if !(self.consumer_poll_timeout > 0.0 && self.consumer_poll_timeout.is_finite()) {
            return Err(ReplicatorError::Config(format!(
                "CONSUMER_POLL_TIMEOUT must be positive, got {}",
                self.consumer_poll_timeout
            )));
        }
        if !(self.retry_backoff_base > 0.0 && self.retry_backoff_base.is_finite()) {
            return Err(ReplicatorError::Config(format!(
                "RETRY_BACKOFF_BASE must be positive, got {}",
                self.retry_backoff_base
            )));
        }
        if !(self.retry_backoff_max >= self.retry_backoff_base && self.retry_backoff_max.is_finite())
        {
            return Err(ReplicatorError::Config(format!(
                "RETRY_BACKOFF_MAX ({}) must be at least RETRY_BACKOFF_BASE ({})",
                self.retry_backoff_max, self.retry_backoff_base
            )));
        }
        if !(self.failure_pause >= 0.0 && self.failure_pause.is_finite()) {
            return Err(ReplicatorError::Config(format!(
                "FAILURE_PAUSE cannot be negative, got {}",
                self.failure_pause
            )));
        }
        if self.connect_timeout == 0 {
            return Err(ReplicatorError::Config(
                "CONNECT_TIMEOUT must be at least 1 second".to_string(),
            ));
        }

        self.primary_key()?;
        self.schema()?;
        Ok(())
    }

    pub fn primary_key(&self) -> Result<Identifier> {
        Identifier::parse(&self.primary_key_column)
    }

    pub fn schema(&self) -> Result<Option<Identifier>> {
        self.target_db_schema
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(Identifier::parse)
            .transpose()
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.consumer_poll_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn failure_pause(&self) -> Duration {
        Duration::from_secs_f64(self.failure_pause)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retries,
            base_delay: Duration::from_secs_f64(self.retry_backoff_base),
            max_delay: Duration::from_secs_f64(self.retry_backoff_max),
            jitter: false,
        }
    }

    pub fn db_config(&self) -> DbConfig {
        DbConfig {
            service_name: SERVICE_NAME.to_string(),
            host: self.target_db_host.clone(),
            port: self.target_db_port,
            database: self.target_db_name.clone(),
            user: self.target_db_user.clone(),
            password: self.target_db_password.clone(),
            connect_timeout_secs: self.connect_timeout,
            acquire_timeout_secs: self.connect_timeout,
            ..Default::default()
        }
    }

    /// Startup summary; the password never appears
    pub fn log_config(&self) {
        info!(
            kafka_bootstrap = %self.kafka_bootstrap,
            group_id = %self.kafka_group_id,
            topic_pattern = %self.kafka_topic_pattern,
            batch_size = self.batch_size,
            poll_timeout_secs = self.consumer_poll_timeout,
            target_db = %self.db_config().display_target(),
            target_user = %self.target_db_user,
            schema = ?self.target_db_schema,
            primary_key = %self.primary_key_column,
            max_retries = self.max_retries,
            backoff_base_secs = self.retry_backoff_base,
            "Configuration loaded"
        );
    }
}
