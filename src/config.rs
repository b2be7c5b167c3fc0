//! Listener configuration.
//!
//! [`ConsumerConfig`] is what the engine runs on. [`ConsumerSettings`] is the
//! serialized option surface (camelCase, millisecond durations) that host
//! applications load from JSON and convert into a config.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProcessorError, Result};
use crate::monitoring::MonitoringConfig;

/// Where a shard without a committed cursor starts reading
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitialPosition {
    /// Start from the oldest available record
    #[default]
    TrimHorizon,
    /// Start from the newest record
    Latest,
    /// Start from the first record at or after the timestamp
    AtTimestamp(DateTime<Utc>),
}

/// When the dispatch engine advances the cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommitMode {
    /// Once per polled batch, after every record in it has been handled
    #[default]
    PerBatch,
    /// After each record
    PerRecord,
}

/// What happens to a record whose handler fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailurePolicy {
    /// Log and move on, no retries
    Skip,
    /// Retry soft failures `max_retries` times, then log and move on
    Retry,
    /// Send straight to the dead-letter sink, no retries
    DeadLetter,
    /// Retry soft failures `max_retries` times, then dead-letter
    #[default]
    RetryThenDeadLetter,
}

impl FailurePolicy {
    pub fn retries(&self) -> bool {
        matches!(self, FailurePolicy::Retry | FailurePolicy::RetryThenDeadLetter)
    }

    pub fn dead_letters(&self) -> bool {
        matches!(
            self,
            FailurePolicy::DeadLetter | FailurePolicy::RetryThenDeadLetter
        )
    }
}

/// Configuration for a listener instance
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Instances sharing a group share one cursor per shard
    pub consumer_group: String,
    /// Identity written into leases and membership rows
    pub instance_id: String,
    /// Maximum number of records to request per GetRecords call
    pub batch_size: i32,
    /// Upper bound on one `poll` waiting for records
    pub poll_timeout: Duration,
    pub idle_time_between_polls: Duration,
    /// Retries after the first failed attempt of a record
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub lease_duration: Duration,
    pub heartbeat_interval: Duration,
    /// How often the shard list and lease table are rescanned
    pub rescan_interval: Duration,
    /// How long an in-flight batch may run after a release is requested
    pub shutdown_grace_period: Duration,
    pub commit_mode: CommitMode,
    pub failure_policy: FailurePolicy,
    pub initial_position: InitialPosition,
    /// Create missing streams on startup
    pub create_streams: bool,
    pub stream_creation_timeout: Duration,
    pub stream_shard_count: i32,
    pub monitoring: MonitoringConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        let lease_duration = Duration::from_secs(10);
        Self {
            consumer_group: "default".to_string(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            batch_size: 100,
            poll_timeout: Duration::from_secs(1),
            idle_time_between_polls: Duration::from_millis(200),
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
            lease_duration,
            heartbeat_interval: lease_duration / 3,
            rescan_interval: Duration::from_secs(5),
            shutdown_grace_period: Duration::from_secs(5),
            commit_mode: CommitMode::default(),
            failure_policy: FailurePolicy::default(),
            initial_position: InitialPosition::default(),
            create_streams: false,
            stream_creation_timeout: Duration::from_secs(30),
            stream_shard_count: 1,
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.consumer_group.trim().is_empty() {
            return Err(ProcessorError::ConfigError(
                "consumer group must not be empty".to_string(),
            ));
        }
        if self.instance_id.trim().is_empty() {
            return Err(ProcessorError::ConfigError(
                "instance id must not be empty".to_string(),
            ));
        }
        if self.batch_size <= 0 || self.batch_size > 10_000 {
            return Err(ProcessorError::ConfigError(format!(
                "batch size must be between 1 and 10000, got {}",
                self.batch_size
            )));
        }
        if self.lease_duration.is_zero() {
            return Err(ProcessorError::ConfigError(
                "lease duration must be positive".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.lease_duration {
            return Err(ProcessorError::ConfigError(format!(
                "heartbeat interval {:?} must be shorter than the lease duration {:?}",
                self.heartbeat_interval, self.lease_duration
            )));
        }
        if self.poll_timeout.is_zero() {
            return Err(ProcessorError::ConfigError(
                "poll timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serialized option surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsumerSettings {
    pub batch_size: i32,
    pub poll_timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub lease_duration_ms: u64,
    pub consumer_group: String,
    pub initial_position: InitialPosition,
    pub commit_mode: CommitMode,
    pub failure_policy: FailurePolicy,
    pub create_streams: bool,
    pub stream_creation_timeout_ms: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        let config = ConsumerConfig::default();
        Self {
            batch_size: config.batch_size,
            poll_timeout_ms: config.poll_timeout.as_millis() as u64,
            max_retries: config.max_retries,
            backoff_base_ms: config.backoff_base.as_millis() as u64,
            lease_duration_ms: config.lease_duration.as_millis() as u64,
            consumer_group: config.consumer_group,
            initial_position: config.initial_position,
            commit_mode: config.commit_mode,
            failure_policy: config.failure_policy,
            create_streams: config.create_streams,
            stream_creation_timeout_ms: config.stream_creation_timeout.as_millis() as u64,
        }
    }
}

impl ConsumerSettings {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ProcessorError::ConfigError(format!("invalid consumer settings: {}", e)))
    }

    /// Builds a validated config. Options without a serialized form keep
    /// their defaults; the heartbeat follows the lease at a third of it.
    pub fn into_config(self) -> Result<ConsumerConfig> {
        let lease_duration = Duration::from_millis(self.lease_duration_ms);
        let config = ConsumerConfig {
            consumer_group: self.consumer_group,
            batch_size: self.batch_size,
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            max_retries: self.max_retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            lease_duration,
            heartbeat_interval: lease_duration / 3,
            initial_position: self.initial_position,
            commit_mode: self.commit_mode,
            failure_policy: self.failure_policy,
            create_streams: self.create_streams,
            stream_creation_timeout: Duration::from_millis(self.stream_creation_timeout_ms),
            ..ConsumerConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}
