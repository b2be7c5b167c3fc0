use crate::error::StoreError;
use crate::record::ShardKey;
use crate::store::{
    validate_acquire, validate_commit, validate_renew, CheckpointStore, LeaseStore, ShardLease,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace, warn};

#[derive(Debug, Clone)]
struct Member {
    stream_name: String,
    consumer_group: String,
    instance_id: String,
    expires_at: DateTime<Utc>,
}

/// In-memory cursor and lease table.
///
/// Honors the same conditional-write contract as the DynamoDB store. Each
/// operation runs under the table's write lock, which stands in for the
/// backend's conditional check.
#[derive(Debug, Default, Clone)]
pub struct InMemoryLeaseStore {
    leases: Arc<RwLock<HashMap<String, ShardLease>>>,
    members: Arc<RwLock<HashMap<String, Member>>>,
    injected_failures: Arc<AtomicUsize>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        debug!("Initializing in-memory lease store");
        Self::default()
    }

    /// Makes the next `count` operations fail with a backend error
    pub fn fail_next_operations(&self, count: usize) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Every stored row, for assertions
    pub async fn snapshot(&self) -> Vec<ShardLease> {
        let mut leases: Vec<_> = self.leases.read().await.values().cloned().collect();
        leases.sort_by(|a, b| a.key.cmp(&b.key));
        leases
    }

    pub async fn clear(&self) {
        self.leases.write().await.clear();
        self.members.write().await.clear();
    }

    fn check_injected_failure(&self) -> Result<(), StoreError> {
        let consumed = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            warn!("Injected lease store failure");
            return Err(StoreError::Backend(anyhow::anyhow!(
                "injected lease store failure"
            )));
        }
        Ok(())
    }

    fn member_key(stream_name: &str, consumer_group: &str, instance_id: &str) -> String {
        format!("{}#{}#{}", stream_name, consumer_group, instance_id)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryLeaseStore {
    #[instrument(skip(self, key), fields(key = %key))]
    async fn get_checkpoint(&self, key: &ShardKey) -> Result<Option<String>, StoreError> {
        self.check_injected_failure()?;
        let leases = self.leases.read().await;
        let checkpoint = leases
            .get(&key.storage_key())
            .and_then(|lease| lease.position.clone());

        trace!(checkpoint = ?checkpoint, "Retrieved checkpoint from memory");
        Ok(checkpoint)
    }

    #[instrument(skip(self, key), fields(key = %key))]
    async fn commit(&self, key: &ShardKey, owner: &str, position: &str) -> Result<(), StoreError> {
        self.check_injected_failure()?;
        let now = Utc::now();
        let mut leases = self.leases.write().await;
        let storage_key = key.storage_key();

        validate_commit(leases.get(&storage_key), key, owner, position, now)?;

        if let Some(lease) = leases.get_mut(&storage_key) {
            lease.position = Some(position.to_string());
            lease.committed_at = Some(now);
            lease.version += 1;
            debug!(
                position = %position,
                version = lease.version,
                "Checkpoint committed to memory"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn get_lease(&self, key: &ShardKey) -> Result<Option<ShardLease>, StoreError> {
        self.check_injected_failure()?;
        Ok(self.leases.read().await.get(&key.storage_key()).cloned())
    }

    async fn list_leases(
        &self,
        stream_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<ShardLease>, StoreError> {
        self.check_injected_failure()?;
        let leases = self.leases.read().await;
        let mut matching: Vec<_> = leases
            .values()
            .filter(|l| l.key.stream_name == stream_name && l.key.consumer_group == consumer_group)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.key.shard_id.cmp(&b.key.shard_id));
        Ok(matching)
    }

    #[instrument(skip(self, key, now, expires_at), fields(key = %key))]
    async fn acquire_lease(
        &self,
        key: &ShardKey,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<ShardLease, StoreError> {
        self.check_injected_failure()?;
        let mut leases = self.leases.write().await;
        let storage_key = key.storage_key();

        validate_acquire(leases.get(&storage_key), key, owner, now)?;

        let lease = leases
            .entry(storage_key)
            .or_insert_with(|| ShardLease::new(key.clone()));
        lease.lease_owner = Some(owner.to_string());
        lease.lease_expiry = Some(expires_at);
        lease.version += 1;

        debug!(version = lease.version, %expires_at, "Lease acquired");
        Ok(lease.clone())
    }

    async fn renew_lease(
        &self,
        key: &ShardKey,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<ShardLease, StoreError> {
        self.check_injected_failure()?;
        let mut leases = self.leases.write().await;
        let storage_key = key.storage_key();

        validate_renew(leases.get(&storage_key), key, owner, now)?;

        let lease = leases
            .get_mut(&storage_key)
            .ok_or_else(|| StoreError::LeaseLost {
                key: key.to_string(),
            })?;
        lease.lease_expiry = Some(expires_at);
        trace!(key = %key, %expires_at, "Lease renewed");
        Ok(lease.clone())
    }

    #[instrument(skip(self, key), fields(key = %key))]
    async fn release_lease(&self, key: &ShardKey, owner: &str) -> Result<(), StoreError> {
        self.check_injected_failure()?;
        let mut leases = self.leases.write().await;

        match leases.get_mut(&key.storage_key()) {
            Some(lease) if lease.lease_owner.as_deref() == Some(owner) => {
                lease.lease_owner = None;
                lease.lease_expiry = None;
                lease.version += 1;
                debug!("Lease released");
            }
            _ => trace!("Release skipped, lease not held"),
        }
        Ok(())
    }

    async fn heartbeat_member(
        &self,
        stream_name: &str,
        consumer_group: &str,
        instance_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_injected_failure()?;
        self.members.write().await.insert(
            Self::member_key(stream_name, consumer_group, instance_id),
            Member {
                stream_name: stream_name.to_string(),
                consumer_group: consumer_group.to_string(),
                instance_id: instance_id.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn live_members(
        &self,
        stream_name: &str,
        consumer_group: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        self.check_injected_failure()?;
        let members = self.members.read().await;
        let mut live: Vec<_> = members
            .values()
            .filter(|m| {
                m.stream_name == stream_name
                    && m.consumer_group == consumer_group
                    && m.expires_at > now
            })
            .map(|m| m.instance_id.clone())
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
        self.check_injected_failure()?;
        self.members
            .write()
            .await
            .remove(&Self::member_key(stream_name, consumer_group, instance_id));
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reset_group(
        &self,
        stream_name: &str,
        consumer_group: &str,
    ) -> Result<usize, StoreError> {
        self.check_injected_failure()?;
        let mut leases = self.leases.write().await;
        let mut members = self.members.write().await;

        let before = leases.len() + members.len();
        leases.retain(|_, l| {
            !(l.key.stream_name == stream_name && l.key.consumer_group == consumer_group)
        });
        members.retain(|_, m| !(m.stream_name == stream_name && m.consumer_group == consumer_group));
        let removed = before - leases.len() - members.len();

        debug!(removed, "Consumer group reset");
        Ok(removed)
    }
}
