//! DynamoDB-backed cursor and lease table.
//!
//! Table layout: a single string hash key `lease_key`. Shard rows use
//! `{prefix}{stream}#{group}#{shard}`, membership rows use
//! `{prefix}member#{stream}#{group}#{instance}`. Timestamps are stored as
//! epoch milliseconds.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_dynamodb::{
    error::{ProvideErrorMetadata, SdkError},
    types::AttributeValue,
    Client as DynamoClient,
};
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, trace, warn};

use crate::error::StoreError;
use crate::record::ShardKey;
use crate::retry::{ExponentialBackoff, RetryConfig, RetryError, RetryHandle};
use crate::shutdown::never_shutdown;
use crate::store::{
    validate_acquire, validate_commit, validate_renew, CheckpointStore, LeaseStore, ShardLease,
};

const KEY_ATTR: &str = "lease_key";
const RECORD_TYPE_SHARD: &str = "shard";
const RECORD_TYPE_MEMBER: &str = "member";

type Item = HashMap<String, AttributeValue>;

fn is_conditional_failure<E: ProvideErrorMetadata, R>(err: &SdkError<E, R>) -> bool {
    err.code() == Some("ConditionalCheckFailedException")
}

fn millis(ts: DateTime<Utc>) -> AttributeValue {
    AttributeValue::N(ts.timestamp_millis().to_string())
}

fn get_s<'a>(item: &'a Item, name: &str) -> Option<&'a str> {
    item.get(name).and_then(|v| v.as_s().ok()).map(String::as_str)
}

fn get_n(item: &Item, name: &str) -> Option<i64> {
    item.get(name)
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse().ok())
}

fn get_ts(item: &Item, name: &str) -> Option<DateTime<Utc>> {
    get_n(item, name).and_then(DateTime::<Utc>::from_timestamp_millis)
}

fn lease_from_item(item: &Item) -> Result<ShardLease, StoreError> {
    let field = |name: &str| {
        get_s(item, name)
            .map(String::from)
            .ok_or_else(|| StoreError::InvalidData(format!("missing attribute {}", name)))
    };

    Ok(ShardLease {
        key: ShardKey::new(
            field("stream_name")?,
            field("shard_id")?,
            field("consumer_group")?,
        ),
        position: get_s(item, "position").map(String::from),
        lease_owner: get_s(item, "lease_owner").map(String::from),
        lease_expiry: get_ts(item, "lease_expiry"),
        version: get_n(item, "version").unwrap_or(0).max(0) as u64,
        committed_at: get_ts(item, "committed_at"),
    })
}

#[derive(Debug, Clone)]
pub struct DynamoDbLeaseStore {
    client: DynamoClient,
    table_name: String,
    key_prefix: String,
    retry_config: RetryConfig,
    backoff: ExponentialBackoff,
}

impl DynamoDbLeaseStore {
    pub fn builder() -> DynamoDbLeaseStoreBuilder {
        DynamoDbLeaseStoreBuilder::new()
    }

    pub fn new(
        client: DynamoClient,
        table_name: impl Into<String>,
        key_prefix: impl Into<String>,
    ) -> anyhow::Result<Self> {
        Self::builder()
            .with_client(client)
            .with_table_name(table_name)
            .with_key_prefix(key_prefix)
            .build()
    }

    fn shard_key(&self, key: &ShardKey) -> String {
        format!("{}{}", self.key_prefix, key.storage_key())
    }

    fn member_key(&self, stream_name: &str, consumer_group: &str, instance_id: &str) -> String {
        format!(
            "{}member#{}#{}#{}",
            self.key_prefix, stream_name, consumer_group, instance_id
        )
    }

    fn retry_handle(&self) -> RetryHandle<ExponentialBackoff> {
        RetryHandle::new(self.retry_config.clone(), self.backoff.clone())
    }

    /// Strongly consistent read of one shard row, retried on backend errors
    async fn read_lease(&self, key: &ShardKey) -> Result<Option<ShardLease>, StoreError> {
        let lease_key = self.shard_key(key);
        let mut shutdown = never_shutdown();

        let item = self
            .retry_handle()
            .retry(
                || async {
                    let response = self
                        .client
                        .get_item()
                        .table_name(&self.table_name)
                        .key(KEY_ATTR, AttributeValue::S(lease_key.clone()))
                        .consistent_read(true)
                        .send()
                        .await
                        .context("Failed to get lease from DynamoDB")?;
                    Ok::<Option<Item>, anyhow::Error>(response.item)
                },
                &mut shutdown,
            )
            .await
            .map_err(backend_error)?;

        item.as_ref().map(lease_from_item).transpose()
    }

    async fn delete_row(&self, lease_key: &str) -> Result<(), RetryError<anyhow::Error>> {
        let mut shutdown = never_shutdown();
        self.retry_handle()
            .retry(
                || async {
                    self.client
                        .delete_item()
                        .table_name(&self.table_name)
                        .key(KEY_ATTR, AttributeValue::S(lease_key.to_string()))
                        .send()
                        .await
                        .context("Failed to delete lease row")?;
                    Ok::<(), anyhow::Error>(())
                },
                &mut shutdown,
            )
            .await
    }

    /// Scans every row of one type for the stream and group
    async fn scan_rows(
        &self,
        stream_name: &str,
        consumer_group: &str,
        record_type: Option<&str>,
    ) -> Result<Vec<Item>, StoreError> {
        let mut rows = Vec::new();
        let mut start_key: Option<Item> = None;

        let mut filter = "stream_name = :stream AND consumer_group = :group".to_string();
        if record_type.is_some() {
            filter.push_str(" AND record_type = :type");
        }

        loop {
            let mut request = self
                .client
                .scan()
                .table_name(&self.table_name)
                .consistent_read(true)
                .filter_expression(&filter)
                .expression_attribute_values(":stream", AttributeValue::S(stream_name.to_string()))
                .expression_attribute_values(
                    ":group",
                    AttributeValue::S(consumer_group.to_string()),
                )
                .set_exclusive_start_key(start_key.take());

            if let Some(record_type) = record_type {
                request = request
                    .expression_attribute_values(":type", AttributeValue::S(record_type.into()));
            }

            let response = request
                .send()
                .await
                .context("Failed to scan lease table")?;

            rows.extend(response.items.unwrap_or_default());

            match response.last_evaluated_key {
                Some(last) if !last.is_empty() => start_key = Some(last),
                _ => break,
            }
        }

        trace!(count = rows.len(), "Scanned lease table");
        Ok(rows)
    }
}

fn backend_error(err: RetryError<anyhow::Error>) -> StoreError {
    match err.into_inner() {
        Some(e) => StoreError::Backend(e),
        None => StoreError::Backend(anyhow::anyhow!("lease store operation interrupted")),
    }
}

#[async_trait]
impl CheckpointStore for DynamoDbLeaseStore {
    #[instrument(skip(self, key), fields(table = %self.table_name, key = %key))]
    async fn get_checkpoint(&self, key: &ShardKey) -> Result<Option<String>, StoreError> {
        let checkpoint = self.read_lease(key).await?.and_then(|lease| lease.position);
        debug!(checkpoint = ?checkpoint, "Retrieved checkpoint from DynamoDB");
        Ok(checkpoint)
    }

    #[instrument(skip(self, key), fields(table = %self.table_name, key = %key))]
    async fn commit(&self, key: &ShardKey, owner: &str, position: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let current = self.read_lease(key).await?;
        validate_commit(current.as_ref(), key, owner, position, now)?;

        let expected = current.map(|lease| lease.version).unwrap_or(0);

        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key(KEY_ATTR, AttributeValue::S(self.shard_key(key)))
            .update_expression("SET #pos = :pos, committed_at = :now, version = :next")
            .condition_expression("version = :expected AND lease_owner = :owner AND lease_expiry > :now")
            .expression_attribute_names("#pos", "position")
            .expression_attribute_values(":pos", AttributeValue::S(position.to_string()))
            .expression_attribute_values(":now", millis(now))
            .expression_attribute_values(":next", AttributeValue::N((expected + 1).to_string()))
            .expression_attribute_values(":expected", AttributeValue::N(expected.to_string()))
            .expression_attribute_values(":owner", AttributeValue::S(owner.to_string()))
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!(position = %position, version = expected + 1, "Checkpoint committed");
                Ok(())
            }
            Err(e) if is_conditional_failure(&e) => {
                warn!(position = %position, "Conditional checkpoint write lost");
                Err(StoreError::StaleCommit {
                    key: key.to_string(),
                    attempted: position.to_string(),
                    reason: "concurrent write changed the lease".to_string(),
                })
            }
            Err(e) => Err(StoreError::Backend(
                anyhow::Error::new(e).context("Failed to commit checkpoint"),
            )),
        }
    }
}

#[async_trait]
impl LeaseStore for DynamoDbLeaseStore {
    async fn get_lease(&self, key: &ShardKey) -> Result<Option<ShardLease>, StoreError> {
        self.read_lease(key).await
    }

    #[instrument(skip(self), fields(table = %self.table_name))]
    async fn list_leases(
        &self,
        stream_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<ShardLease>, StoreError> {
        let rows = self
            .scan_rows(stream_name, consumer_group, Some(RECORD_TYPE_SHARD))
            .await?;
        let mut leases = rows
            .iter()
            .map(lease_from_item)
            .collect::<Result<Vec<_>, _>>()?;
        leases.sort_by(|a, b| a.key.shard_id.cmp(&b.key.shard_id));
        Ok(leases)
    }

    #[instrument(skip(self, key, now, expires_at), fields(table = %self.table_name, key = %key))]
    async fn acquire_lease(
        &self,
        key: &ShardKey,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<ShardLease, StoreError> {
        let current = self.read_lease(key).await?;
        validate_acquire(current.as_ref(), key, owner, now)?;

        let mut lease = current.unwrap_or_else(|| ShardLease::new(key.clone()));
        let expected = lease.version;
        lease.lease_owner = Some(owner.to_string());
        lease.lease_expiry = Some(expires_at);
        lease.version = expected + 1;

        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key(KEY_ATTR, AttributeValue::S(self.shard_key(key)))
            .update_expression(
                "SET stream_name = :stream, shard_id = :shard, consumer_group = :group, \
                 record_type = :type, lease_owner = :owner, lease_expiry = :expiry, version = :next",
            )
            .condition_expression("attribute_not_exists(lease_key) OR version = :expected")
            .expression_attribute_values(":stream", AttributeValue::S(key.stream_name.clone()))
            .expression_attribute_values(":shard", AttributeValue::S(key.shard_id.clone()))
            .expression_attribute_values(":group", AttributeValue::S(key.consumer_group.clone()))
            .expression_attribute_values(":type", AttributeValue::S(RECORD_TYPE_SHARD.into()))
            .expression_attribute_values(":owner", AttributeValue::S(owner.to_string()))
            .expression_attribute_values(":expiry", millis(expires_at))
            .expression_attribute_values(":next", AttributeValue::N(lease.version.to_string()))
            .expression_attribute_values(":expected", AttributeValue::N(expected.to_string()))
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!(version = lease.version, %expires_at, "Lease acquired");
                Ok(lease)
            }
            Err(e) if is_conditional_failure(&e) => {
                // another instance won the race; report whoever holds it now
                let holder = self.read_lease(key).await?;
                let (owner, expires_at) = holder
                    .and_then(|l| l.lease_owner.zip(l.lease_expiry))
                    .unwrap_or_else(|| ("unknown".to_string(), expires_at));
                Err(StoreError::LeaseUnavailable {
                    key: key.to_string(),
                    owner,
                    expires_at,
                })
            }
            Err(e) => Err(StoreError::Backend(
                anyhow::Error::new(e).context("Failed to acquire lease"),
            )),
        }
    }

    #[instrument(skip(self, key, now, expires_at), fields(table = %self.table_name, key = %key))]
    async fn renew_lease(
        &self,
        key: &ShardKey,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<ShardLease, StoreError> {
        let current = self.read_lease(key).await?;
        validate_renew(current.as_ref(), key, owner, now)?;

        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key(KEY_ATTR, AttributeValue::S(self.shard_key(key)))
            .update_expression("SET lease_expiry = :expiry")
            .condition_expression("lease_owner = :owner AND lease_expiry > :now")
            .expression_attribute_values(":expiry", millis(expires_at))
            .expression_attribute_values(":owner", AttributeValue::S(owner.to_string()))
            .expression_attribute_values(":now", millis(now))
            .send()
            .await;

        match result {
            Ok(_) => {
                trace!(%expires_at, "Lease renewed");
                let mut lease = current.unwrap_or_else(|| ShardLease::new(key.clone()));
                lease.lease_expiry = Some(expires_at);
                Ok(lease)
            }
            Err(e) if is_conditional_failure(&e) => Err(StoreError::LeaseLost {
                key: key.to_string(),
            }),
            Err(e) => Err(StoreError::Backend(
                anyhow::Error::new(e).context("Failed to renew lease"),
            )),
        }
    }

    #[instrument(skip(self, key), fields(table = %self.table_name, key = %key))]
    async fn release_lease(&self, key: &ShardKey, owner: &str) -> Result<(), StoreError> {
        let Some(current) = self.read_lease(key).await? else {
            return Ok(());
        };
        if current.lease_owner.as_deref() != Some(owner) {
            trace!("Release skipped, lease not held");
            return Ok(());
        }

        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key(KEY_ATTR, AttributeValue::S(self.shard_key(key)))
            .update_expression("REMOVE lease_owner, lease_expiry SET version = :next")
            .condition_expression("lease_owner = :owner")
            .expression_attribute_values(":owner", AttributeValue::S(owner.to_string()))
            .expression_attribute_values(
                ":next",
                AttributeValue::N((current.version + 1).to_string()),
            )
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!("Lease released");
                Ok(())
            }
            Err(e) if is_conditional_failure(&e) => {
                trace!("Lease taken over before release");
                Ok(())
            }
            Err(e) => Err(StoreError::Backend(
                anyhow::Error::new(e).context("Failed to release lease"),
            )),
        }
    }

    async fn heartbeat_member(
        &self,
        stream_name: &str,
        consumer_group: &str,
        instance_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let member_key = self.member_key(stream_name, consumer_group, instance_id);
        let mut shutdown = never_shutdown();

        self.retry_handle()
            .retry(
                || async {
                    self.client
                        .put_item()
                        .table_name(&self.table_name)
                        .item(KEY_ATTR, AttributeValue::S(member_key.clone()))
                        .item("record_type", AttributeValue::S(RECORD_TYPE_MEMBER.into()))
                        .item("stream_name", AttributeValue::S(stream_name.to_string()))
                        .item("consumer_group", AttributeValue::S(consumer_group.to_string()))
                        .item("instance_id", AttributeValue::S(instance_id.to_string()))
                        .item("member_expiry", millis(expires_at))
                        .send()
                        .await
                        .context("Failed to write membership heartbeat")?;
                    Ok::<(), anyhow::Error>(())
                },
                &mut shutdown,
            )
            .await
            .map_err(backend_error)
    }

    async fn live_members(
        &self,
        stream_name: &str,
        consumer_group: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let rows = self
            .scan_rows(stream_name, consumer_group, Some(RECORD_TYPE_MEMBER))
            .await?;

        let mut live: Vec<String> = rows
            .iter()
            .filter(|row| get_ts(row, "member_expiry").is_some_and(|expiry| expiry > now))
            .filter_map(|row| get_s(row, "instance_id").map(String::from))
            .collect();
        live.sort();
        Ok(live)
    }

    async fn remove_member(
        &self,
        stream_name: &str,
        consumer_group: &str,
        instance_id: &str,
    ) -> Result<(), StoreError> {
        let member_key = self.member_key(stream_name, consumer_group, instance_id);
        self.delete_row(&member_key).await.map_err(backend_error)?;
        debug!(instance_id = %instance_id, "Membership row removed");
        Ok(())
    }

    /// Deletes every row of the group. A row that still fails after retries
    /// does not stop the others; the error lists every row left behind.
    #[instrument(skip(self), fields(table = %self.table_name))]
    async fn reset_group(
        &self,
        stream_name: &str,
        consumer_group: &str,
    ) -> Result<usize, StoreError> {
        let rows = self.scan_rows(stream_name, consumer_group, None).await?;
        let mut removed = 0;
        let mut remaining = Vec::new();

        for row in rows {
            let Some(lease_key) = get_s(&row, KEY_ATTR) else {
                continue;
            };
            match self.delete_row(lease_key).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(lease_key = %lease_key, error = %e, "Failed to delete row during reset");
                    remaining.push(lease_key.to_string());
                }
            }
        }

        if !remaining.is_empty() {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "reset of {}/{} removed {} rows but left {}: {}",
                stream_name,
                consumer_group,
                removed,
                remaining.len(),
                remaining.join(", ")
            )));
        }

        debug!(removed, "Consumer group reset");
        Ok(removed)
    }
}

#[derive(Debug)]
pub struct DynamoDbLeaseStoreBuilder {
    client: Option<DynamoClient>,
    table_name: Option<String>,
    key_prefix: Option<String>,
    retry_config: RetryConfig,
    backoff: ExponentialBackoff,
}

impl Default for DynamoDbLeaseStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamoDbLeaseStoreBuilder {
    pub fn new() -> Self {
        Self {
            client: None,
            table_name: None,
            key_prefix: None,
            retry_config: RetryConfig::default(),
            backoff: ExponentialBackoff::builder()
                .initial_delay(Duration::from_millis(100))
                .max_delay(Duration::from_secs(5))
                .build(),
        }
    }

    pub fn with_client(mut self, client: DynamoClient) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(key_prefix.into());
        self
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn build(self) -> anyhow::Result<DynamoDbLeaseStore> {
        Ok(DynamoDbLeaseStore {
            client: self
                .client
                .ok_or_else(|| anyhow::anyhow!("DynamoDB client is required"))?,
            table_name: self
                .table_name
                .ok_or_else(|| anyhow::anyhow!("Table name is required"))?,
            key_prefix: self.key_prefix.unwrap_or_default(),
            retry_config: self.retry_config,
            backoff: self.backoff,
        })
    }
}
