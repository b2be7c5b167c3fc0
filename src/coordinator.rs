//! Shard assignment coordinator.
//!
//! One coordinator runs per consumed stream in each instance. All shared
//! state lives in the lease store; in process the coordinator only keeps the
//! handles of the shard workers it started and a [`ShardState`] per shard.
//!
//! Every tick (one heartbeat interval) it:
//!
//! 1. reaps workers that exited and releases their leases
//! 2. refreshes this instance's membership row
//! 3. renews the leases it holds, stopping any worker whose lease is gone
//! 4. on rescan, releases shards above its fair share and acquires unowned
//!    or expired leases up to it
//!
//! On shutdown it releases every lease and deletes its membership row, so
//! the remaining instances rebalance on their next rescan.
//!
//! Child shards become eligible only once every listed parent carries the
//! `SHARD_END` cursor, so records of a partition key are never read from a
//! child before its parent is drained.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::client::{KinesisClientTrait, ShardDescriptor};
use crate::config::ConsumerConfig;
use crate::dispatch::{DeadLetter, DeadLetterSink};
use crate::error::{Result, StoreError};
use crate::handler::RecordHandler;
use crate::monitoring::{EventSink, LeaseEventType, ProcessingEvent};
use crate::processor::{ShardWorker, WorkerExit};
use crate::record::{ShardKey, SHARD_END};
use crate::shutdown::wait_for_shutdown;
use crate::store::{LeaseStore, ShardLease};

/// Ownership state of one shard, from this instance's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShardState {
    #[default]
    Unassigned,
    LeasePending,
    Owned,
    Releasing,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseTransition {
    AttemptAcquire,
    Acquired,
    AcquireFailed,
    Renewed,
    LeaseLost,
    BeginRelease,
    Released,
    /// The worker of an expired lease has exited
    Stopped,
}

impl ShardState {
    /// Next state, or `None` when the transition does not apply
    pub fn apply(self, transition: LeaseTransition) -> Option<ShardState> {
        use LeaseTransition::*;
        use ShardState::*;

        match (self, transition) {
            (Unassigned, AttemptAcquire) => Some(LeasePending),
            (LeasePending, Acquired) => Some(Owned),
            (LeasePending, AcquireFailed) => Some(Unassigned),
            (Owned, Renewed) => Some(Owned),
            (Owned, BeginRelease) => Some(Releasing),
            (Owned, LeaseLost) => Some(Expired),
            (Releasing, Renewed) => Some(Releasing),
            (Releasing, Released) => Some(Unassigned),
            (Releasing, LeaseLost) => Some(Expired),
            (Expired, Stopped) => Some(Unassigned),
            _ => None,
        }
    }

    /// States in which this instance may still be processing the shard
    pub fn holds_lease(self) -> bool {
        matches!(self, ShardState::Owned | ShardState::Releasing)
    }
}

/// Shards per live instance, rounded up
pub fn fair_share(eligible_shards: usize, live_members: usize) -> usize {
    if live_members == 0 {
        return eligible_shards;
    }
    eligible_shards.div_ceil(live_members)
}

fn has_ended(leases: &HashMap<String, ShardLease>, shard_id: &str) -> bool {
    leases
        .get(shard_id)
        .and_then(|lease| lease.position.as_deref())
        == Some(SHARD_END)
}

/// Shards that still need reading and whose parents are done, sorted by id.
///
/// `leases` is keyed by shard id. A parent that is no longer listed by the
/// stream counts as done.
pub fn eligible_shards(
    shards: &[ShardDescriptor],
    leases: &HashMap<String, ShardLease>,
) -> Vec<String> {
    let listed: HashSet<&str> = shards.iter().map(|s| s.shard_id.as_str()).collect();

    let mut eligible: Vec<String> = shards
        .iter()
        .filter(|shard| !has_ended(leases, &shard.shard_id))
        .filter(|shard| {
            shard
                .parents()
                .all(|parent| !listed.contains(parent) || has_ended(leases, parent))
        })
        .map(|shard| shard.shard_id.clone())
        .collect();
    eligible.sort();
    eligible
}

struct OwnedShard {
    key: ShardKey,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<WorkerExit>,
    lease_expiry: DateTime<Utc>,
    release_deadline: Option<Instant>,
}

pub struct ShardCoordinator<C, S>
where
    C: KinesisClientTrait + 'static,
    S: LeaseStore + 'static,
{
    stream_name: String,
    config: ConsumerConfig,
    client: Arc<C>,
    store: Arc<S>,
    handler: Arc<dyn RecordHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    events: EventSink,
    states: HashMap<String, ShardState>,
    owned: HashMap<String, OwnedShard>,
    /// Shards lost to retention; never acquired again by this instance
    failed: HashSet<String>,
    last_rescan: Option<Instant>,
    rescan_needed: bool,
}

impl<C, S> ShardCoordinator<C, S>
where
    C: KinesisClientTrait + 'static,
    S: LeaseStore + 'static,
{
    pub fn new(
        stream_name: impl Into<String>,
        config: ConsumerConfig,
        client: Arc<C>,
        store: Arc<S>,
        handler: Arc<dyn RecordHandler>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            stream_name: stream_name.into(),
            config,
            client,
            store,
            handler,
            dead_letters,
            events: EventSink::disabled(),
            states: HashMap::new(),
            owned: HashMap::new(),
            failed: HashSet::new(),
            last_rescan: None,
            rescan_needed: true,
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn shard_state(&self, shard_id: &str) -> ShardState {
        self.states.get(shard_id).copied().unwrap_or_default()
    }

    /// Shards with a running worker, sorted
    pub fn owned_shards(&self) -> Vec<String> {
        let mut shards: Vec<String> = self.owned.keys().cloned().collect();
        shards.sort();
        shards
    }

    /// Runs ticks until `shutdown` fires, then releases every owned shard
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            stream = %self.stream_name,
            instance_id = %self.config.instance_id,
            "Starting shard coordinator"
        );

        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
            self.tick().await;
        }

        self.shutdown().await;
        info!(stream = %self.stream_name, "Shard coordinator stopped");
        Ok(())
    }

    /// One round of reaping, heartbeating, renewing and rebalancing
    pub async fn tick(&mut self) {
        self.reap_workers().await;
        self.heartbeat().await;
        self.renew_leases().await;

        let rescan_due = self
            .last_rescan
            .map_or(true, |at| at.elapsed() >= self.config.rescan_interval);
        if self.rescan_needed || rescan_due {
            self.rebalance().await;
        }
    }

    fn transition(&mut self, shard_id: &str, transition: LeaseTransition) {
        let current = self.shard_state(shard_id);
        match current.apply(transition) {
            Some(next) => {
                trace!(shard_id = %shard_id, from = ?current, to = ?next, "Shard state change");
                if next == ShardState::Unassigned {
                    self.states.remove(shard_id);
                } else {
                    self.states.insert(shard_id.to_string(), next);
                }
            }
            None => {
                warn!(
                    shard_id = %shard_id,
                    state = ?current,
                    transition = ?transition,
                    "Ignoring invalid shard state transition"
                );
            }
        }
    }

    fn key(&self, shard_id: &str) -> ShardKey {
        ShardKey::new(&self.stream_name, shard_id, &self.config.consumer_group)
    }

    fn lease_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.config.lease_duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(10))
    }

    async fn heartbeat(&self) {
        let expires_at = self.lease_deadline(Utc::now());
        if let Err(e) = self
            .store
            .heartbeat_member(
                &self.stream_name,
                &self.config.consumer_group,
                &self.config.instance_id,
                expires_at,
            )
            .await
        {
            warn!(stream = %self.stream_name, error = %e, "Membership heartbeat failed");
        }
    }

    async fn reap_workers(&mut self) {
        let now = Instant::now();
        let mut done = Vec::new();

        for (shard_id, owned) in &self.owned {
            if owned.handle.is_finished() {
                done.push(shard_id.clone());
            } else if owned.release_deadline.is_some_and(|deadline| now >= deadline) {
                warn!(
                    shard_id = %shard_id,
                    grace_period = ?self.config.shutdown_grace_period,
                    "Grace period exceeded, releasing shard anyway"
                );
                owned.handle.abort();
                done.push(shard_id.clone());
            }
        }

        for shard_id in done {
            if let Some(owned) = self.owned.remove(&shard_id) {
                let exit = match owned.handle.await {
                    Ok(exit) => exit,
                    Err(e) if e.is_cancelled() => WorkerExit::Stopped,
                    Err(e) => WorkerExit::Failed(format!("shard worker panicked: {}", e)),
                };
                self.finish_worker(owned.key, exit).await;
            }
        }
    }

    async fn finish_worker(&mut self, key: ShardKey, exit: WorkerExit) {
        let shard_id = key.shard_id.clone();
        self.rescan_needed = true;

        if self.shard_state(&shard_id) == ShardState::Expired {
            debug!(shard_id = %shard_id, exit = ?exit, "Worker for lost lease exited");
            self.transition(&shard_id, LeaseTransition::Stopped);
            return;
        }

        match &exit {
            WorkerExit::ShardEnded => {
                info!(shard_id = %shard_id, "Shard ended, releasing lease");
            }
            WorkerExit::Stopped => {
                debug!(shard_id = %shard_id, "Worker stopped");
            }
            WorkerExit::LeaseLost => {
                self.lease_lost(&key, "commit rejected").await;
                self.transition(&shard_id, LeaseTransition::LeaseLost);
                self.transition(&shard_id, LeaseTransition::Stopped);
                return;
            }
            WorkerExit::ShardNotFound => {
                error!(
                    shard_id = %shard_id,
                    stream = %self.stream_name,
                    "Shard expired from retention, alerting and giving it up"
                );
                let alert = DeadLetter::shard_expired(
                    &key,
                    "shard not found, unread records may have expired from retention",
                );
                if let Err(e) = self.dead_letters.send(alert).await {
                    error!(shard_id = %shard_id, error = %e, "Failed to send shard expiry alert");
                }
                self.failed.insert(shard_id.clone());
            }
            WorkerExit::Failed(reason) => {
                error!(shard_id = %shard_id, reason = %reason, "Shard worker failed, releasing lease");
            }
        }

        if self.shard_state(&shard_id) == ShardState::Owned {
            self.transition(&shard_id, LeaseTransition::BeginRelease);
        }
        self.release(&key).await;
    }

    async fn release(&mut self, key: &ShardKey) {
        if let Err(e) = self.store.release_lease(key, &self.config.instance_id).await {
            warn!(shard_id = %key.shard_id, error = %e, "Failed to release lease");
        } else {
            debug!(shard_id = %key.shard_id, "Lease released");
            self.events
                .send(ProcessingEvent::lease(
                    &key.stream_name,
                    &key.shard_id,
                    LeaseEventType::Released,
                    None,
                ))
                .await;
        }
        self.transition(&key.shard_id, LeaseTransition::Released);
    }

    async fn lease_lost(&self, key: &ShardKey, details: &str) {
        warn!(shard_id = %key.shard_id, details = %details, "Lease lost, stopping shard");
        self.events
            .send(ProcessingEvent::lease(
                &key.stream_name,
                &key.shard_id,
                LeaseEventType::Lost,
                Some(details.to_string()),
            ))
            .await;
    }

    async fn renew_leases(&mut self) {
        let now = Utc::now();
        let expires_at = self.lease_deadline(now);
        let held: Vec<String> = self
            .owned
            .keys()
            .filter(|shard_id| self.shard_state(shard_id).holds_lease())
            .cloned()
            .collect();

        for shard_id in held {
            let Some(owned) = self.owned.get(&shard_id) else {
                continue;
            };
            let key = owned.key.clone();
            let previous_expiry = owned.lease_expiry;

            match self
                .store
                .renew_lease(&key, &self.config.instance_id, now, expires_at)
                .await
            {
                Ok(lease) => {
                    if let Some(owned) = self.owned.get_mut(&shard_id) {
                        owned.lease_expiry = lease.lease_expiry.unwrap_or(expires_at);
                    }
                    self.transition(&shard_id, LeaseTransition::Renewed);
                    self.events
                        .send(ProcessingEvent::lease(
                            &key.stream_name,
                            &key.shard_id,
                            LeaseEventType::Renewed,
                            None,
                        ))
                        .await;
                }
                Err(e) if e.is_ownership_conflict() || now >= previous_expiry => {
                    self.lease_lost(&key, &e.to_string()).await;
                    if let Some(owned) = self.owned.get(&shard_id) {
                        let _ = owned.stop_tx.send(true);
                    }
                    self.transition(&shard_id, LeaseTransition::LeaseLost);
                }
                Err(e) => {
                    warn!(
                        shard_id = %shard_id,
                        error = %e,
                        expires_at = %previous_expiry,
                        "Lease renewal failed, will retry before expiry"
                    );
                }
            }
        }
    }

    async fn rebalance(&mut self) {
        self.last_rescan = Some(Instant::now());
        self.rescan_needed = false;
        let now = Utc::now();

        let shards = match self.client.list_shards(&self.stream_name).await {
            Ok(shards) => shards,
            Err(e) => {
                warn!(stream = %self.stream_name, error = %e, "Failed to list shards");
                return;
            }
        };

        let leases: HashMap<String, ShardLease> = match self
            .store
            .list_leases(&self.stream_name, &self.config.consumer_group)
            .await
        {
            Ok(leases) => leases
                .into_iter()
                .map(|lease| (lease.key.shard_id.clone(), lease))
                .collect(),
            Err(e) => {
                warn!(stream = %self.stream_name, error = %e, "Failed to list leases");
                return;
            }
        };

        let members = match self
            .store
            .live_members(&self.stream_name, &self.config.consumer_group, now)
            .await
        {
            Ok(members) => members,
            Err(e) => {
                warn!(stream = %self.stream_name, error = %e, "Failed to list members");
                return;
            }
        };
        let member_count = if members.contains(&self.config.instance_id) {
            members.len()
        } else {
            members.len() + 1
        };

        let eligible: Vec<String> = eligible_shards(&shards, &leases)
            .into_iter()
            .filter(|shard_id| !self.failed.contains(shard_id))
            .collect();
        let target = fair_share(eligible.len(), member_count);

        let mut active: Vec<String> = self
            .owned
            .keys()
            .filter(|shard_id| self.shard_state(shard_id) == ShardState::Owned)
            .cloned()
            .collect();
        active.sort();

        debug!(
            stream = %self.stream_name,
            shards = shards.len(),
            eligible = eligible.len(),
            members = member_count,
            target,
            owned = active.len(),
            "Rebalancing"
        );

        if active.len() > target {
            let excess = active.split_off(target);
            for shard_id in excess {
                info!(shard_id = %shard_id, target, "Releasing shard above fair share");
                self.begin_release(&shard_id);
            }
            return;
        }

        let mut candidates: Vec<String> = eligible
            .into_iter()
            .filter(|shard_id| !self.owned.contains_key(shard_id))
            .filter(|shard_id| {
                leases.get(shard_id).map_or(true, |lease| {
                    lease
                        .live_owner(now)
                        .map_or(true, |owner| owner == self.config.instance_id)
                })
            })
            .collect();
        candidates.shuffle(&mut rand::thread_rng());

        let mut owned_count = self.owned.len();
        for shard_id in candidates {
            if owned_count >= target {
                break;
            }
            if self.acquire(&shard_id).await {
                owned_count += 1;
            }
        }
    }

    async fn acquire(&mut self, shard_id: &str) -> bool {
        let key = self.key(shard_id);
        let now = Utc::now();
        let expires_at = self.lease_deadline(now);

        self.transition(shard_id, LeaseTransition::AttemptAcquire);
        let lease = match self
            .store
            .acquire_lease(&key, &self.config.instance_id, now, expires_at)
            .await
        {
            Ok(lease) => lease,
            Err(StoreError::LeaseUnavailable { owner, .. }) => {
                debug!(shard_id = %shard_id, owner = %owner, "Lease taken by another instance");
                self.transition(shard_id, LeaseTransition::AcquireFailed);
                return false;
            }
            Err(e) => {
                warn!(shard_id = %shard_id, error = %e, "Lease acquisition failed");
                self.transition(shard_id, LeaseTransition::AcquireFailed);
                return false;
            }
        };

        self.transition(shard_id, LeaseTransition::Acquired);

        // finished by another instance after the lease list was read
        if lease.position.as_deref() == Some(SHARD_END) {
            debug!(shard_id = %shard_id, "Acquired shard already ended, releasing it");
            self.transition(shard_id, LeaseTransition::BeginRelease);
            self.release(&key).await;
            self.rescan_needed = true;
            return false;
        }

        info!(
            shard_id = %shard_id,
            position = ?lease.position,
            version = lease.version,
            "Lease acquired"
        );
        self.events
            .send(ProcessingEvent::lease(
                &self.stream_name,
                shard_id,
                LeaseEventType::Acquired,
                None,
            ))
            .await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = ShardWorker::new(
            key.clone(),
            self.client.clone(),
            self.store.clone(),
            self.handler.clone(),
            self.dead_letters.clone(),
            &self.config,
            self.events.clone(),
        );
        let handle = tokio::spawn(worker.run(lease.position.clone(), stop_rx));

        self.owned.insert(
            shard_id.to_string(),
            OwnedShard {
                key,
                stop_tx,
                handle,
                lease_expiry: lease.lease_expiry.unwrap_or(expires_at),
                release_deadline: None,
            },
        );
        true
    }

    /// Stops the worker and lets the next ticks release the lease once it
    /// exits, or once the grace period runs out
    fn begin_release(&mut self, shard_id: &str) {
        let grace = self.config.shutdown_grace_period;
        if let Some(owned) = self.owned.get_mut(shard_id) {
            let _ = owned.stop_tx.send(true);
            owned.release_deadline = Some(Instant::now() + grace);
        }
        self.transition(shard_id, LeaseTransition::BeginRelease);
    }

    async fn shutdown(&mut self) {
        let shard_ids = self.owned_shards();
        info!(
            stream = %self.stream_name,
            shards = shard_ids.len(),
            "Releasing owned shards"
        );

        for shard_id in &shard_ids {
            if self.shard_state(shard_id) == ShardState::Owned {
                self.begin_release(shard_id);
            }
        }

        let deadline = Instant::now() + self.config.shutdown_grace_period;
        for shard_id in shard_ids {
            let Some(mut owned) = self.owned.remove(&shard_id) else {
                continue;
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            let exit = match tokio::time::timeout(remaining, &mut owned.handle).await {
                Ok(Ok(exit)) => exit,
                Ok(Err(e)) => WorkerExit::Failed(format!("shard worker panicked: {}", e)),
                Err(_) => {
                    warn!(
                        shard_id = %shard_id,
                        grace_period = ?self.config.shutdown_grace_period,
                        "Grace period exceeded, releasing shard anyway"
                    );
                    owned.handle.abort();
                    WorkerExit::Stopped
                }
            };
            self.finish_worker(owned.key, exit).await;
        }

        self.leave_group().await;
    }

    async fn leave_group(&self) {
        match self
            .store
            .remove_member(
                &self.stream_name,
                &self.config.consumer_group,
                &self.config.instance_id,
            )
            .await
        {
            Ok(()) => debug!(stream = %self.stream_name, "Left consumer group"),
            Err(e) => warn!(
                stream = %self.stream_name,
                error = %e,
                "Failed to remove membership row, it will expire on its own"
            ),
        }
    }
}
