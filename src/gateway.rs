//! Outbound gateway: publishes records to a named stream.
//!
//! Payload and metadata are wrapped in the same `{"data":..,"metadata":..}`
//! envelope that [`JsonHandler`](crate::handler::JsonHandler) decodes.
//! Throttled and network-failed puts are retried with exponential backoff;
//! anything else is rejected straight away. Each `send` returns once the put
//! is acknowledged, and there is no internal buffering, so sequential sends
//! with one partition key land in submission order.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::client::{KinesisClientError, KinesisClientTrait, PutRecordOutput};
use crate::error::PublishError;
use crate::record::RecordEnvelope;
use crate::retry::{RetryConfig, RetryError, RetryHandle};
use crate::shutdown::never_shutdown;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Attempts per record, including the first
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
        }
    }
}

impl GatewayConfig {
    fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: Some(self.max_attempts.max(1)),
            initial_backoff: self.backoff_base,
            max_backoff: self.backoff_max,
            jitter_factor: 0.1,
        }
    }
}

/// A record to publish: payload, metadata and an optional partition key
#[derive(Debug, Clone)]
pub struct OutboundRecord<D, M> {
    pub payload: D,
    pub metadata: M,
    /// Hashed from the serialized record when absent
    pub partition_key: Option<String>,
}

impl<D, M> OutboundRecord<D, M> {
    pub fn new(payload: D, metadata: M) -> Self {
        Self {
            payload,
            metadata,
            partition_key: None,
        }
    }

    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }
}

/// Hex SHA-256 of the serialized record, used when no key is supplied
pub fn hashed_partition_key(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

pub struct OutboundGateway<C: KinesisClientTrait + ?Sized> {
    client: Arc<C>,
    config: GatewayConfig,
}

impl<C: KinesisClientTrait + ?Sized> Clone for OutboundGateway<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            config: self.config.clone(),
        }
    }
}

impl<C: KinesisClientTrait + ?Sized> OutboundGateway<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self::with_config(client, GatewayConfig::default())
    }

    pub fn with_config(client: Arc<C>, config: GatewayConfig) -> Self {
        Self { client, config }
    }

    /// Serializes `record` into the envelope and publishes it to `stream_name`
    pub async fn send<D, M>(
        &self,
        stream_name: &str,
        record: &OutboundRecord<D, M>,
    ) -> Result<PutRecordOutput, PublishError>
    where
        D: Serialize,
        M: Serialize,
    {
        let envelope = RecordEnvelope::new(&record.payload, &record.metadata);
        self.send_json(stream_name, &envelope, record.partition_key.as_deref())
            .await
    }

    /// Publishes any serializable value as JSON
    pub async fn send_json<T: Serialize + ?Sized>(
        &self,
        stream_name: &str,
        value: &T,
        partition_key: Option<&str>,
    ) -> Result<PutRecordOutput, PublishError> {
        let data = serde_json::to_vec(value).map_err(|source| PublishError::Serialization {
            stream: stream_name.to_string(),
            source,
        })?;
        self.send_raw(stream_name, Bytes::from(data), partition_key)
            .await
    }

    /// Publishes pre-serialized bytes
    #[instrument(skip(self, data), fields(stream = %stream_name, size = data.len()))]
    pub async fn send_raw(
        &self,
        stream_name: &str,
        data: Bytes,
        partition_key: Option<&str>,
    ) -> Result<PutRecordOutput, PublishError> {
        let partition_key = match partition_key {
            Some(key) => key.to_string(),
            None => hashed_partition_key(&data),
        };

        let mut retry = RetryHandle::from_config(self.config.retry_config());
        let mut no_stop = never_shutdown();

        let result = retry
            .retry_if(
                || self.client.put_record(stream_name, &partition_key, data.clone()),
                KinesisClientError::is_retryable,
                &mut no_stop,
            )
            .await;

        match result {
            Ok(output) => {
                debug!(
                    shard_id = %output.shard_id,
                    sequence = %output.sequence_number,
                    partition_key = %partition_key,
                    "Record published"
                );
                Ok(output)
            }
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => {
                warn!(attempts, error = %last_error, "Giving up on publish");
                Err(PublishError::PublishFailed {
                    stream: stream_name.to_string(),
                    attempts,
                    last_error: last_error.to_string(),
                })
            }
            Err(RetryError::Permanent(e)) => Err(PublishError::Rejected {
                stream: stream_name.to_string(),
                message: e.to_string(),
            }),
            Err(other) => Err(PublishError::PublishFailed {
                stream: stream_name.to_string(),
                attempts: self.config.max_attempts,
                last_error: other.to_string(),
            }),
        }
    }
}
