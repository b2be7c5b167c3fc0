//! Error types for the listener engine and the outbound gateway

use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;

use crate::client::KinesisClientError;

/// Main error type for processor operations
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("AWS Kinesis error: {0}")]
    KinesisError(String),

    #[error("Checkpoint error: {0}")]
    CheckpointError(String),

    #[error("Lease lost for shard {0}")]
    LeaseLost(String),

    #[error("Shard {0} not found, records may have expired from retention")]
    ShardNotFound(String),

    #[error("Throttled by Kinesis: {0}")]
    ThrottlingError(String),

    #[error("Stream {stream} did not become active within {timeout:?}")]
    StreamNotActive { stream: String, timeout: Duration },

    #[error("Dead-letter sink rejected record {sequence}: {reason}")]
    DeadLetterFailed { sequence: String, reason: String },

    #[error("No handler registered for stream {0}")]
    NoHandler(String),

    #[error("Shutdown requested")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<KinesisClientError> for ProcessorError {
    fn from(err: KinesisClientError) -> Self {
        match err {
            KinesisClientError::ThroughputExceeded(msg) => ProcessorError::ThrottlingError(msg),
            KinesisClientError::ResourceNotFound(msg) => ProcessorError::ShardNotFound(msg),
            other => ProcessorError::KinesisError(other.to_string()),
        }
    }
}

impl From<StoreError> for ProcessorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::StaleCommit { key, .. } => ProcessorError::LeaseLost(key),
            StoreError::LeaseLost { key } => ProcessorError::LeaseLost(key),
            other => ProcessorError::CheckpointError(other.to_string()),
        }
    }
}

impl From<ReaderError> for ProcessorError {
    fn from(err: ReaderError) -> Self {
        match err {
            ReaderError::ShardNotFound(shard) => ProcessorError::ShardNotFound(shard),
            ReaderError::Throttling(msg) => ProcessorError::ThrottlingError(msg),
            ReaderError::Kinesis(msg) | ReaderError::Rejected(msg) => {
                ProcessorError::KinesisError(msg)
            }
            ReaderError::Shutdown => ProcessorError::Shutdown,
        }
    }
}

impl From<JoinError> for ProcessorError {
    fn from(err: JoinError) -> Self {
        ProcessorError::Other(err.into())
    }
}

/// Result type for processor operations
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Error type for cursor and lease store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// A conditional write lost against a concurrent writer, or the writer
    /// no longer owns the shard.
    #[error("Stale commit for {key} at {attempted}: {reason}")]
    StaleCommit {
        key: String,
        attempted: String,
        reason: String,
    },

    #[error("Lease for {key} is held by {owner} until {expires_at}")]
    LeaseUnavailable {
        key: String,
        owner: String,
        expires_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("Lease for {key} is no longer held by this instance")]
    LeaseLost { key: String },

    #[error("Invalid lease record: {0}")]
    InvalidData(String),

    #[error("Store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// True when the failure means another writer owns the key now
    pub fn is_ownership_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::StaleCommit { .. }
                | StoreError::LeaseLost { .. }
                | StoreError::LeaseUnavailable { .. }
        )
    }
}

/// Error type for shard reads
#[derive(Debug, Error)]
pub enum ReaderError {
    /// The shard (or the checkpointed position) is gone from the stream's
    /// retention window. Fatal for the shard.
    #[error("Shard {0} not found")]
    ShardNotFound(String),

    #[error("Throttled while reading: {0}")]
    Throttling(String),

    #[error("Kinesis read failed: {0}")]
    Kinesis(String),

    /// Kinesis refused the request itself (bad cursor, missing permission,
    /// KMS key). Retrying the same read cannot succeed.
    #[error("Kinesis rejected the read: {0}")]
    Rejected(String),

    #[error("Shutdown requested")]
    Shutdown,
}

impl ReaderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReaderError::Throttling(_) | ReaderError::Kinesis(_))
    }
}

/// Failure returned by a record handler
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Soft failure (retriable): {0}")]
    SoftFailure(#[source] anyhow::Error),

    #[error("Hard failure (non-retriable): {0}")]
    HardFailure(#[source] anyhow::Error),

    #[error("Could not deserialize record: {0}")]
    Deserialize(#[from] serde_json::Error),
}

impl HandlerError {
    pub fn soft(err: impl Into<anyhow::Error>) -> Self {
        HandlerError::SoftFailure(err.into())
    }

    pub fn hard(err: impl Into<anyhow::Error>) -> Self {
        HandlerError::HardFailure(err.into())
    }

    /// Whether the dispatch engine may retry the record
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::SoftFailure(_))
    }
}

/// Error type for the outbound gateway
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Publishing to {stream} failed after {attempts} attempts: {last_error}")]
    PublishFailed {
        stream: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Failed to serialize record for {stream}: {source}")]
    Serialization {
        stream: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Publish to {stream} rejected: {message}")]
    Rejected { stream: String, message: String },
}
