//! Shard cursor and lease storage.
//!
//! One persisted row per (stream, shard, consumer group) holds both the
//! committed cursor and the lease: `{position, lease_owner, lease_expiry,
//! version}`. Every write is conditional, so ownership and progress are
//! decided by the store alone and never by in-process locks.
//!
//! Version discipline shared by all implementations:
//!
//! - `acquire`, `release` and `commit` bump `version` and are conditional on
//!   the version they read
//! - `renew` only moves `lease_expiry` and is conditional on the owner, so a
//!   heartbeat never races a commit from the same owner

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::StoreError;
use crate::record::{compare_sequence_numbers, ShardKey};

#[cfg(feature = "dynamodb-store")]
pub mod dynamodb;
pub mod memory;

#[cfg(feature = "dynamodb-store")]
pub use dynamodb::DynamoDbLeaseStore;
pub use memory::InMemoryLeaseStore;

/// Persisted cursor + lease row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardLease {
    pub key: ShardKey,
    pub position: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub version: u64,
    pub committed_at: Option<DateTime<Utc>>,
}

impl ShardLease {
    pub fn new(key: ShardKey) -> Self {
        Self {
            key,
            position: None,
            lease_owner: None,
            lease_expiry: None,
            version: 0,
            committed_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expiry.map_or(true, |expiry| expiry <= now)
    }

    /// Owner of an unexpired lease
    pub fn live_owner(&self, now: DateTime<Utc>) -> Option<&str> {
        if self.is_expired(now) {
            None
        } else {
            self.lease_owner.as_deref()
        }
    }

    pub fn is_owned_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.live_owner(now) == Some(owner)
    }
}

/// Checks a cursor commit against the currently stored row
pub fn validate_commit(
    current: Option<&ShardLease>,
    key: &ShardKey,
    owner: &str,
    position: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let stale = |reason: String| StoreError::StaleCommit {
        key: key.to_string(),
        attempted: position.to_string(),
        reason,
    };

    let lease = current.ok_or_else(|| stale("no lease exists for this shard".to_string()))?;

    match lease.lease_owner.as_deref() {
        Some(current_owner) if current_owner == owner => {}
        Some(current_owner) => {
            return Err(stale(format!("lease is owned by {}", current_owner)));
        }
        None => return Err(stale("lease has been released".to_string())),
    }

    if lease.is_expired(now) {
        return Err(stale("lease has expired".to_string()));
    }

    if let Some(committed) = lease.position.as_deref() {
        if compare_sequence_numbers(position, committed) == Ordering::Less {
            return Err(stale(format!("position {} already committed", committed)));
        }
    }

    Ok(())
}

/// Checks whether `owner` may take the lease at `now`
pub fn validate_acquire(
    current: Option<&ShardLease>,
    key: &ShardKey,
    owner: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    if let Some(lease) = current {
        if let (Some(holder), Some(expires_at)) = (lease.live_owner(now), lease.lease_expiry) {
            if holder != owner {
                return Err(StoreError::LeaseUnavailable {
                    key: key.to_string(),
                    owner: holder.to_string(),
                    expires_at,
                });
            }
        }
    }
    Ok(())
}

/// Checks whether `owner` may extend its lease at `now`
pub fn validate_renew(
    current: Option<&ShardLease>,
    key: &ShardKey,
    owner: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    match current {
        Some(lease) if lease.is_owned_by(owner, now) => Ok(()),
        _ => Err(StoreError::LeaseLost {
            key: key.to_string(),
        }),
    }
}

/// Durable cursor storage
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last committed position for the key
    async fn get_checkpoint(&self, key: &ShardKey) -> Result<Option<String>, StoreError>;

    /// Advances the cursor. Fails with [`StoreError::StaleCommit`] when
    /// `owner` no longer holds a live lease or a higher position is already
    /// stored. Durable before returning.
    async fn commit(&self, key: &ShardKey, owner: &str, position: &str) -> Result<(), StoreError>;
}

/// Lease table and instance membership, in the same store as the cursors
#[async_trait]
pub trait LeaseStore: CheckpointStore {
    async fn get_lease(&self, key: &ShardKey) -> Result<Option<ShardLease>, StoreError>;

    async fn list_leases(
        &self,
        stream_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<ShardLease>, StoreError>;

    /// Takes an unowned or expired lease (or re-takes one's own)
    async fn acquire_lease(
        &self,
        key: &ShardKey,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<ShardLease, StoreError>;

    /// Extends a live lease held by `owner`, failing with
    /// [`StoreError::LeaseLost`] otherwise
    async fn renew_lease(
        &self,
        key: &ShardKey,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<ShardLease, StoreError>;

    /// Gives the lease up. A no-op when `owner` does not hold it.
    async fn release_lease(&self, key: &ShardKey, owner: &str) -> Result<(), StoreError>;

    /// Records that `instance_id` is alive until `expires_at`
    async fn heartbeat_member(
        &self,
        stream_name: &str,
        consumer_group: &str,
        instance_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Instances with an unexpired membership row
    async fn live_members(
        &self,
        stream_name: &str,
        consumer_group: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError>;

    /// Drops `instance_id` from the group right away instead of waiting
    /// for its membership row to expire
    async fn remove_member(
        &self,
        stream_name: &str,
        consumer_group: &str,
        instance_id: &str,
    ) -> Result<(), StoreError>;

    /// Deletes every cursor, lease and membership row of the group.
    /// Returns the number of rows removed.
    async fn reset_group(&self, stream_name: &str, consumer_group: &str)
        -> Result<usize, StoreError>;
}
