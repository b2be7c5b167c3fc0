//! Thin seam over the Kinesis API.
//!
//! The engine only talks to Kinesis through [`KinesisClientTrait`], which is
//! implemented for the AWS SDK client and, behind `test-utils`, for the
//! in-memory fake in [`crate::test`].

use std::time::SystemTime;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_kinesis::{
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    types::{Record, ShardIteratorType},
    Client,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

/// Classified Kinesis failure
#[derive(Debug, Clone, Error)]
pub enum KinesisClientError {
    #[error("Iterator expired")]
    ExpiredIterator,

    #[error("Throughput exceeded: {0}")]
    ThroughputExceeded(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Resource in use: {0}")]
    ResourceInUse(String),

    #[error("KMS error: {0}")]
    KmsError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("{0}")]
    Other(String),
}

impl KinesisClientError {
    /// Throttling and network failures are retried with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KinesisClientError::ThroughputExceeded(_)
                | KinesisClientError::Timeout(_)
                | KinesisClientError::ConnectionError(_)
        )
    }

    pub fn is_throttling(&self) -> bool {
        matches!(self, KinesisClientError::ThroughputExceeded(_))
    }
}

/// Maps an SDK failure of any Kinesis operation onto [`KinesisClientError`]
pub fn classify_sdk_error<E, R>(err: &SdkError<E, R>) -> KinesisClientError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(err).to_string();

    match err {
        SdkError::TimeoutError(_) => return KinesisClientError::Timeout(message),
        SdkError::DispatchFailure(_) => return KinesisClientError::ConnectionError(message),
        _ => {}
    }

    match err.code() {
        Some("ExpiredIteratorException") => KinesisClientError::ExpiredIterator,
        Some("ProvisionedThroughputExceededException")
        | Some("ThrottlingException")
        | Some("LimitExceededException") => KinesisClientError::ThroughputExceeded(message),
        Some("AccessDeniedException") => KinesisClientError::AccessDenied(message),
        Some("InvalidArgumentException") => KinesisClientError::InvalidArgument(message),
        Some("ResourceNotFoundException") => KinesisClientError::ResourceNotFound(message),
        Some("ResourceInUseException") => KinesisClientError::ResourceInUse(message),
        Some(code) if code.starts_with("KMS") => KinesisClientError::KmsError(message),
        _ => KinesisClientError::Other(message),
    }
}

/// Shard as listed by the stream, with its lineage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    pub shard_id: String,
    pub parent_shard_id: Option<String>,
    pub adjacent_parent_shard_id: Option<String>,
    /// The shard has an ending sequence number and accepts no more writes
    pub closed: bool,
}

impl ShardDescriptor {
    pub fn open(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            parent_shard_id: None,
            adjacent_parent_shard_id: None,
            closed: false,
        }
    }

    pub fn parents(&self) -> impl Iterator<Item = &str> {
        self.parent_shard_id
            .as_deref()
            .into_iter()
            .chain(self.adjacent_parent_shard_id.as_deref())
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetRecordsOutput {
    pub records: Vec<Record>,
    /// `None` once the shard is closed and fully read
    pub next_iterator: Option<String>,
    pub millis_behind_latest: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRecordOutput {
    pub shard_id: String,
    pub sequence_number: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Creating,
    Active,
    Updating,
    Deleting,
    Unknown,
}

#[async_trait]
pub trait KinesisClientTrait: Send + Sync {
    async fn list_shards(
        &self,
        stream_name: &str,
    ) -> Result<Vec<ShardDescriptor>, KinesisClientError>;

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        iterator_type: ShardIteratorType,
        sequence_number: Option<&str>,
        timestamp: Option<&DateTime<Utc>>,
    ) -> Result<String, KinesisClientError>;

    async fn get_records(
        &self,
        iterator: &str,
        limit: i32,
    ) -> Result<GetRecordsOutput, KinesisClientError>;

    async fn put_record(
        &self,
        stream_name: &str,
        partition_key: &str,
        data: Bytes,
    ) -> Result<PutRecordOutput, KinesisClientError>;

    async fn describe_stream_status(
        &self,
        stream_name: &str,
    ) -> Result<StreamStatus, KinesisClientError>;

    async fn create_stream(
        &self,
        stream_name: &str,
        shard_count: i32,
    ) -> Result<(), KinesisClientError>;
}

#[async_trait]
impl KinesisClientTrait for Client {
    async fn list_shards(
        &self,
        stream_name: &str,
    ) -> Result<Vec<ShardDescriptor>, KinesisClientError> {
        let mut shards = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            // ListShards rejects the stream name once a pagination token is supplied
            let request = match &next_token {
                Some(token) => self.list_shards().next_token(token),
                None => self.list_shards().stream_name(stream_name),
            };

            let response = request.send().await.map_err(|e| classify_sdk_error(&e))?;

            shards.extend(response.shards().iter().map(|shard| ShardDescriptor {
                shard_id: shard.shard_id().to_string(),
                parent_shard_id: shard.parent_shard_id().map(String::from),
                adjacent_parent_shard_id: shard.adjacent_parent_shard_id().map(String::from),
                closed: shard
                    .sequence_number_range()
                    .and_then(|range| range.ending_sequence_number())
                    .is_some(),
            }));

            match response.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        debug!(stream = %stream_name, count = shards.len(), "Listed shards");
        Ok(shards)
    }

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        iterator_type: ShardIteratorType,
        sequence_number: Option<&str>,
        timestamp: Option<&DateTime<Utc>>,
    ) -> Result<String, KinesisClientError> {
        let mut req = self
            .get_shard_iterator()
            .stream_name(stream_name)
            .shard_id(shard_id)
            .shard_iterator_type(iterator_type);

        if let Some(seq) = sequence_number {
            req = req.starting_sequence_number(seq);
        }

        if let Some(ts) = timestamp {
            let system_time: SystemTime = (*ts).into();
            req = req.timestamp(aws_smithy_types::DateTime::from(system_time));
        }

        let response = req.send().await.map_err(|e| classify_sdk_error(&e))?;
        response
            .shard_iterator()
            .map(String::from)
            .ok_or_else(|| KinesisClientError::Other("No shard iterator returned".to_string()))
    }

    async fn get_records(
        &self,
        iterator: &str,
        limit: i32,
    ) -> Result<GetRecordsOutput, KinesisClientError> {
        let response = self
            .get_records()
            .shard_iterator(iterator)
            .limit(limit)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e))?;

        Ok(GetRecordsOutput {
            records: response.records().to_vec(),
            next_iterator: response.next_shard_iterator().map(String::from),
            millis_behind_latest: response.millis_behind_latest(),
        })
    }

    async fn put_record(
        &self,
        stream_name: &str,
        partition_key: &str,
        data: Bytes,
    ) -> Result<PutRecordOutput, KinesisClientError> {
        let response = self
            .put_record()
            .stream_name(stream_name)
            .partition_key(partition_key)
            .data(aws_smithy_types::Blob::new(data.to_vec()))
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e))?;

        Ok(PutRecordOutput {
            shard_id: response.shard_id().to_string(),
            sequence_number: response.sequence_number().to_string(),
        })
    }

    async fn describe_stream_status(
        &self,
        stream_name: &str,
    ) -> Result<StreamStatus, KinesisClientError> {
        use aws_sdk_kinesis::types::StreamStatus as SdkStreamStatus;

        let response = self
            .describe_stream_summary()
            .stream_name(stream_name)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e))?;

        let status = match response
            .stream_description_summary()
            .map(|summary| summary.stream_status())
        {
            Some(SdkStreamStatus::Active) => StreamStatus::Active,
            Some(SdkStreamStatus::Creating) => StreamStatus::Creating,
            Some(SdkStreamStatus::Updating) => StreamStatus::Updating,
            Some(SdkStreamStatus::Deleting) => StreamStatus::Deleting,
            _ => StreamStatus::Unknown,
        };
        Ok(status)
    }

    async fn create_stream(
        &self,
        stream_name: &str,
        shard_count: i32,
    ) -> Result<(), KinesisClientError> {
        self.create_stream()
            .stream_name(stream_name)
            .shard_count(shard_count)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e))?;
        Ok(())
    }
}

/// Connection settings for the Kinesis and DynamoDB clients.
///
/// Endpoint overrides and static credentials are meant for local emulators.
#[derive(Debug, Clone, Default)]
pub struct ClientSettings {
    pub region: String,
    pub kinesis_endpoint: Option<String>,
    pub dynamodb_endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl ClientSettings {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..Default::default()
        }
    }

    async fn sdk_config(&self, endpoint: Option<&str>) -> aws_config::SdkConfig {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(self.region.clone()));

        if let Some(url) = endpoint {
            loader = loader.endpoint_url(url);
        }

        if let (Some(key), Some(secret)) = (&self.access_key_id, &self.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                key.clone(),
                secret.clone(),
                None,
                None,
                "kinesis-listener-static",
            ));
        }

        loader.load().await
    }

    pub async fn kinesis_client(&self) -> Client {
        let config = self.sdk_config(self.kinesis_endpoint.as_deref()).await;
        Client::new(&config)
    }

    #[cfg(feature = "dynamodb-store")]
    pub async fn dynamodb_client(&self) -> aws_sdk_dynamodb::Client {
        let config = self.sdk_config(self.dynamodb_endpoint.as_deref()).await;
        aws_sdk_dynamodb::Client::new(&config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(KinesisClientError::ThroughputExceeded("x".into()).is_retryable());
        assert!(KinesisClientError::Timeout("x".into()).is_retryable());
        assert!(!KinesisClientError::ExpiredIterator.is_retryable());
        assert!(!KinesisClientError::ResourceNotFound("x".into()).is_retryable());
    }

    #[test]
    fn test_shard_parents() {
        let mut shard = ShardDescriptor::open("shardId-000000000002");
        assert_eq!(shard.parents().count(), 0);

        shard.parent_shard_id = Some("shardId-000000000000".to_string());
        shard.adjacent_parent_shard_id = Some("shardId-000000000001".to_string());
        let parents: Vec<_> = shard.parents().collect();
        assert_eq!(parents, vec!["shardId-000000000000", "shardId-000000000001"]);
    }
}
