//! Dispatch engine: hands records to their handler in sequence order,
//! applies the failure policy and advances the cursor.
//!
//! The cursor is committed only after the batch (or record, in
//! [`CommitMode::PerRecord`]) is fully handled, so a crash between handler
//! success and commit replays those records on restart. A
//! [`StoreError::StaleCommit`](crate::error::StoreError::StaleCommit) means
//! another instance owns the shard now; it surfaces as
//! [`ProcessorError::LeaseLost`] and the caller stops the shard.
//!
//! A record is only moved past once it was handled or accepted by the
//! dead-letter sink. When the sink keeps failing, the records before it are
//! committed and dispatch fails with [`ProcessorError::DeadLetterFailed`],
//! so the record is delivered again by whoever reads the shard next.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::client::KinesisClientTrait;
use crate::config::{CommitMode, ConsumerConfig, FailurePolicy};
use crate::error::{HandlerError, ProcessorError, Result, StoreError};
use crate::gateway::OutboundGateway;
use crate::handler::RecordHandler;
use crate::monitoring::{EventSink, ProcessingEvent};
use crate::record::{compare_sequence_numbers, KinesisRecord, ShardKey};
use crate::retry::{Backoff, ExponentialBackoff, RetryConfig, RetryHandle};
use crate::shutdown::{is_shutdown, never_shutdown, wait_for_shutdown};
use crate::store::CheckpointStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeadLetterReason {
    /// The handler failed and the failure policy gave up on the record
    HandlerFailed,
    /// The shard expired from the stream's retention before it was drained
    ShardExpired,
}

/// A record (or shard) given up on, with enough context to inspect it later
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub stream_name: String,
    pub shard_id: String,
    pub consumer_group: String,
    pub sequence_number: Option<String>,
    pub partition_key: Option<String>,
    /// Record payload, lossily decoded as UTF-8
    pub payload: Option<String>,
    pub reason: DeadLetterReason,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn handler_failed(
        key: &ShardKey,
        record: &KinesisRecord,
        error: &HandlerError,
        attempts: u32,
    ) -> Self {
        Self {
            stream_name: key.stream_name.clone(),
            shard_id: key.shard_id.clone(),
            consumer_group: key.consumer_group.clone(),
            sequence_number: Some(record.sequence_number.clone()),
            partition_key: Some(record.partition_key.clone()),
            payload: Some(String::from_utf8_lossy(&record.data).into_owned()),
            reason: DeadLetterReason::HandlerFailed,
            error: error.to_string(),
            attempts,
            failed_at: Utc::now(),
        }
    }

    pub fn shard_expired(key: &ShardKey, detail: impl Into<String>) -> Self {
        Self {
            stream_name: key.stream_name.clone(),
            shard_id: key.shard_id.clone(),
            consumer_group: key.consumer_group.clone(),
            sequence_number: None,
            partition_key: None,
            payload: None,
            reason: DeadLetterReason::ShardExpired,
            error: detail.into(),
            attempts: 0,
            failed_at: Utc::now(),
        }
    }
}

/// Destination for records that exhausted the failure policy, and for
/// operator alerts about shards lost to retention
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, letter: DeadLetter) -> anyhow::Result<()>;
}

/// Writes dead letters to the log at error level
#[derive(Debug, Default, Clone)]
pub struct LoggingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LoggingDeadLetterSink {
    async fn send(&self, letter: DeadLetter) -> anyhow::Result<()> {
        let body = serde_json::to_string(&letter)?;
        error!(
            stream = %letter.stream_name,
            shard_id = %letter.shard_id,
            sequence = ?letter.sequence_number,
            reason = ?letter.reason,
            dead_letter = %body,
            "Dead letter"
        );
        Ok(())
    }
}

/// Keeps dead letters in memory
#[derive(Debug, Default, Clone)]
pub struct InMemoryDeadLetterSink {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.letters.lock().is_empty()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn send(&self, letter: DeadLetter) -> anyhow::Result<()> {
        self.letters.lock().push(letter);
        Ok(())
    }
}

/// Publishes dead letters as JSON to a dead-letter stream
pub struct StreamDeadLetterSink<C: KinesisClientTrait + ?Sized> {
    gateway: OutboundGateway<C>,
    stream_name: String,
}

impl<C: KinesisClientTrait + ?Sized> StreamDeadLetterSink<C> {
    pub fn new(gateway: OutboundGateway<C>, stream_name: impl Into<String>) -> Self {
        Self {
            gateway,
            stream_name: stream_name.into(),
        }
    }
}

#[async_trait]
impl<C: KinesisClientTrait + ?Sized + 'static> DeadLetterSink for StreamDeadLetterSink<C> {
    async fn send(&self, letter: DeadLetter) -> anyhow::Result<()> {
        let partition_key = letter
            .sequence_number
            .clone()
            .unwrap_or_else(|| letter.shard_id.clone());
        self.gateway
            .send_json(&self.stream_name, &letter, Some(&partition_key))
            .await?;
        Ok(())
    }
}

/// Counts for one dispatched batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub processed: usize,
    pub skipped: usize,
    pub dead_lettered: usize,
    /// Last record handled, successfully or not
    pub last_handled: Option<String>,
    pub committed: Option<String>,
    /// Stopped before every record was handled
    pub interrupted: bool,
}

enum RecordResult {
    Processed,
    Skipped,
    DeadLettered,
    Interrupted,
    SinkFailed(String),
}

pub struct Dispatcher<S: CheckpointStore + ?Sized> {
    store: Arc<S>,
    dead_letters: Arc<dyn DeadLetterSink>,
    owner: String,
    policy: FailurePolicy,
    commit_mode: CommitMode,
    max_retries: u32,
    backoff: ExponentialBackoff,
    commit_retry: RetryConfig,
    events: EventSink,
}

impl<S: CheckpointStore + ?Sized> Dispatcher<S> {
    pub fn new(store: Arc<S>, dead_letters: Arc<dyn DeadLetterSink>, config: &ConsumerConfig) -> Self {
        Self {
            store,
            dead_letters,
            owner: config.instance_id.clone(),
            policy: config.failure_policy,
            commit_mode: config.commit_mode,
            max_retries: config.max_retries,
            backoff: ExponentialBackoff::builder()
                .initial_delay(config.backoff_base)
                .max_delay(config.backoff_max)
                .build(),
            commit_retry: RetryConfig {
                max_attempts: Some(config.max_retries + 1),
                initial_backoff: config.backoff_base,
                max_backoff: config.backoff_max,
                jitter_factor: 0.1,
            },
            events: EventSink::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Hands every record to `handler` in sequence-number order and commits
    /// the cursor.
    ///
    /// Stops between records once `stop` fires; the in-flight handler call
    /// always runs to completion. Records handled before the stop are still
    /// committed.
    #[instrument(skip(self, records, handler, stop), fields(key = %key, count = records.len()))]
    pub async fn dispatch(
        &self,
        key: &ShardKey,
        records: &[KinesisRecord],
        handler: &dyn RecordHandler,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<DispatchOutcome> {
        let mut ordered: Vec<&KinesisRecord> = records.iter().collect();
        ordered.sort_by(|a, b| compare_sequence_numbers(&a.sequence_number, &b.sequence_number));

        let batch_start = Instant::now();
        let mut outcome = DispatchOutcome::default();
        let mut failed = None;

        for record in ordered {
            if is_shutdown(stop) {
                debug!("Stop requested, leaving the rest of the batch");
                outcome.interrupted = true;
                break;
            }

            match self.handle_record(key, record, handler, stop).await {
                RecordResult::Processed => outcome.processed += 1,
                RecordResult::Skipped => outcome.skipped += 1,
                RecordResult::DeadLettered => outcome.dead_lettered += 1,
                RecordResult::Interrupted => {
                    outcome.interrupted = true;
                    break;
                }
                RecordResult::SinkFailed(reason) => {
                    failed = Some((record.sequence_number.clone(), reason));
                    break;
                }
            }
            outcome.last_handled = Some(record.sequence_number.clone());

            if self.commit_mode == CommitMode::PerRecord {
                self.commit(key, &record.sequence_number).await?;
                outcome.committed = Some(record.sequence_number.clone());
            }
        }

        if self.commit_mode == CommitMode::PerBatch {
            if let Some(last) = &outcome.last_handled {
                self.commit(key, last).await?;
                outcome.committed = Some(last.clone());
            }
        }

        if let Some((sequence, reason)) = failed {
            return Err(ProcessorError::DeadLetterFailed { sequence, reason });
        }

        self.events
            .send(ProcessingEvent::batch_complete(
                &key.stream_name,
                &key.shard_id,
                outcome.processed,
                outcome.skipped + outcome.dead_lettered,
                batch_start.elapsed(),
            ))
            .await;

        Ok(outcome)
    }

    /// Commits `position` for `key`, retrying transient store failures.
    /// Ownership conflicts come back as [`ProcessorError::LeaseLost`].
    pub async fn commit(&self, key: &ShardKey, position: &str) -> Result<()> {
        let mut retry = RetryHandle::from_config(self.commit_retry.clone());
        let mut no_stop = never_shutdown();

        let result = retry
            .retry_if(
                || self.store.commit(key, &self.owner, position),
                |e: &StoreError| matches!(e, StoreError::Backend(_)),
                &mut no_stop,
            )
            .await;

        match result {
            Ok(()) => {
                debug!(key = %key, position = %position, "Checkpoint committed");
                self.events
                    .send(ProcessingEvent::checkpoint(
                        &key.stream_name,
                        &key.shard_id,
                        position,
                        true,
                        None,
                    ))
                    .await;
                Ok(())
            }
            Err(e) => {
                self.events
                    .send(ProcessingEvent::checkpoint(
                        &key.stream_name,
                        &key.shard_id,
                        position,
                        false,
                        Some(e.to_string()),
                    ))
                    .await;

                match e.into_inner() {
                    Some(store_err) if store_err.is_ownership_conflict() => {
                        warn!(key = %key, error = %store_err, "Commit rejected, lease lost");
                        Err(ProcessorError::LeaseLost(key.to_string()))
                    }
                    Some(store_err) => {
                        error!(key = %key, error = %store_err, "Commit failed");
                        Err(store_err.into())
                    }
                    None => Err(ProcessorError::Shutdown),
                }
            }
        }
    }

    async fn handle_record(
        &self,
        key: &ShardKey,
        record: &KinesisRecord,
        handler: &dyn RecordHandler,
        stop: &mut watch::Receiver<bool>,
    ) -> RecordResult {
        let sequence = record.sequence_number.as_str();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let started = Instant::now();
            let result = handler.handle(record).await;

            let error = match result {
                Ok(()) => {
                    self.events
                        .send(ProcessingEvent::record_attempt(
                            &key.stream_name,
                            &key.shard_id,
                            sequence,
                            true,
                            attempt,
                            started.elapsed(),
                            None,
                            false,
                        ))
                        .await;
                    debug!(shard_id = %key.shard_id, sequence = %sequence, attempt, "Record processed");
                    return RecordResult::Processed;
                }
                Err(e) => e,
            };

            let will_retry =
                self.policy.retries() && error.is_retryable() && attempt <= self.max_retries;

            self.events
                .send(ProcessingEvent::record_attempt(
                    &key.stream_name,
                    &key.shard_id,
                    sequence,
                    false,
                    attempt,
                    started.elapsed(),
                    Some(error.to_string()),
                    !will_retry,
                ))
                .await;

            if !will_retry {
                return self.give_up(key, record, error, attempt, stop).await;
            }

            let delay = self.backoff.next_delay(attempt - 1);
            warn!(
                shard_id = %key.shard_id,
                sequence = %sequence,
                attempt,
                delay_ms = ?delay.as_millis(),
                error = %error,
                "Handler failed, will retry"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(stop) => {
                    info!(
                        shard_id = %key.shard_id,
                        sequence = %sequence,
                        "Stop requested while waiting to retry"
                    );
                    return RecordResult::Interrupted;
                }
            }
        }
    }

    /// Sends `letter` with the commit retry settings. `None` means a stop was
    /// requested before the sink accepted it.
    async fn send_dead_letter(
        &self,
        letter: DeadLetter,
        stop: &mut watch::Receiver<bool>,
    ) -> Option<std::result::Result<(), String>> {
        let mut retry = RetryHandle::from_config(self.commit_retry.clone());
        let result = retry
            .retry(|| self.dead_letters.send(letter.clone()), stop)
            .await;
        match result {
            Ok(()) => Some(Ok(())),
            Err(e) => e.into_inner().map(|sink_err| Err(sink_err.to_string())),
        }
    }

    async fn give_up(
        &self,
        key: &ShardKey,
        record: &KinesisRecord,
        error: HandlerError,
        attempts: u32,
        stop: &mut watch::Receiver<bool>,
    ) -> RecordResult {
        let sequence = record.sequence_number.as_str();

        if !self.policy.dead_letters() {
            warn!(
                shard_id = %key.shard_id,
                sequence = %sequence,
                attempts,
                error = %error,
                "Skipping record after handler failure"
            );
            self.events
                .send(ProcessingEvent::record_failure(
                    &key.stream_name,
                    &key.shard_id,
                    sequence,
                    error.to_string(),
                    false,
                ))
                .await;
            return RecordResult::Skipped;
        }

        let letter = DeadLetter::handler_failed(key, record, &error, attempts);
        match self.send_dead_letter(letter, stop).await {
            Some(Ok(())) => {
                error!(
                    shard_id = %key.shard_id,
                    sequence = %sequence,
                    attempts,
                    error = %error,
                    "Record sent to dead letter"
                );
                self.events
                    .send(ProcessingEvent::record_failure(
                        &key.stream_name,
                        &key.shard_id,
                        sequence,
                        error.to_string(),
                        true,
                    ))
                    .await;
                RecordResult::DeadLettered
            }
            Some(Err(sink_err)) => {
                error!(
                    shard_id = %key.shard_id,
                    sequence = %sequence,
                    error = %error,
                    sink_error = %sink_err,
                    "Dead-letter sink failed, record will be redelivered"
                );
                RecordResult::SinkFailed(sink_err)
            }
            None => RecordResult::Interrupted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryLeaseStore, LeaseStore};
    use crate::test::{RecordingHandler, TestUtils};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryLeaseStore>,
        dead_letters: InMemoryDeadLetterSink,
        config: ConsumerConfig,
        key: ShardKey,
    }

    impl Fixture {
        async fn new(configure: impl FnOnce(&mut ConsumerConfig)) -> anyhow::Result<Self> {
            let mut config = ConsumerConfig {
                instance_id: "instance-a".to_string(),
                backoff_base: Duration::from_millis(1),
                backoff_max: Duration::from_millis(5),
                ..Default::default()
            };
            configure(&mut config);

            let store = Arc::new(InMemoryLeaseStore::new());
            let key = ShardKey::new("foo-event-stream", "shardId-000000000000", "default");
            let now = Utc::now();
            store
                .acquire_lease(&key, &config.instance_id, now, now + chrono::Duration::seconds(30))
                .await?;

            Ok(Self {
                store,
                dead_letters: InMemoryDeadLetterSink::new(),
                config,
                key,
            })
        }

        fn dispatcher(&self) -> Dispatcher<InMemoryLeaseStore> {
            self.dispatcher_with_sink(Arc::new(self.dead_letters.clone()))
        }

        fn dispatcher_with_sink(&self, sink: Arc<dyn DeadLetterSink>) -> Dispatcher<InMemoryLeaseStore> {
            Dispatcher::new(self.store.clone(), sink, &self.config)
        }
    }

    /// Rejects the first `failures` letters, then keeps the rest
    #[derive(Default)]
    struct FlakySink {
        failures: u32,
        calls: Mutex<u32>,
        accepted: InMemoryDeadLetterSink,
    }

    impl FlakySink {
        fn failing(failures: u32) -> Self {
            Self {
                failures,
                ..Default::default()
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl DeadLetterSink for FlakySink {
        async fn send(&self, letter: DeadLetter) -> anyhow::Result<()> {
            let call = {
                let mut calls = self.calls.lock();
                *calls += 1;
                *calls
            };
            if call <= self.failures {
                anyhow::bail!("dead-letter stream unavailable");
            }
            self.accepted.send(letter).await
        }
    }

    fn records(sequences: &[&str]) -> Vec<KinesisRecord> {
        sequences
            .iter()
            .map(|seq| TestUtils::create_test_record(seq, format!("payload-{}", seq).as_bytes()))
            .collect()
    }

    #[tokio::test]
    async fn test_records_handled_in_sequence_order() -> anyhow::Result<()> {
        let fixture = Fixture::new(|_| {}).await?;
        let handler = RecordingHandler::new();

        let outcome = fixture
            .dispatcher()
            .dispatch(
                &fixture.key,
                &records(&["30", "4", "100", "21"]),
                &handler,
                &mut never_shutdown(),
            )
            .await?;

        assert_eq!(handler.invocation_order(), vec!["4", "21", "30", "100"]);
        assert_eq!(outcome.processed, 4);
        assert_eq!(outcome.committed.as_deref(), Some("100"));
        assert_eq!(
            fixture.store.get_checkpoint(&fixture.key).await?,
            Some("100".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_soft_failures_retried_then_succeed() -> anyhow::Result<()> {
        let fixture = Fixture::new(|c| c.max_retries = 3).await?;
        let handler = RecordingHandler::new().fail_first_attempts(2);

        let outcome = fixture
            .dispatcher()
            .dispatch(&fixture.key, &records(&["1"]), &handler, &mut never_shutdown())
            .await?;

        assert_eq!(handler.total_invocations(), 3);
        assert_eq!(handler.successful_invocations(), 1);
        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.dead_lettered, 0);
        assert!(fixture.dead_letters.is_empty());
        assert_eq!(
            fixture.store.get_checkpoint(&fixture.key).await?,
            Some("1".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_exhausted_retries_go_to_dead_letter() -> anyhow::Result<()> {
        let fixture = Fixture::new(|c| c.max_retries = 2).await?;
        let handler = RecordingHandler::new().always_fail_sequence("2");

        let outcome = fixture
            .dispatcher()
            .dispatch(&fixture.key, &records(&["1", "2", "3"]), &handler, &mut never_shutdown())
            .await?;

        // one attempt plus two retries
        assert_eq!(handler.invocations_of("2"), 3);
        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.dead_lettered, 1);

        let letters = fixture.dead_letters.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].sequence_number.as_deref(), Some("2"));
        assert_eq!(letters[0].reason, DeadLetterReason::HandlerFailed);
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(letters[0].payload.as_deref(), Some("payload-2"));
        assert!(letters[0].error.contains("always fails"));

        assert_eq!(
            fixture.store.get_checkpoint(&fixture.key).await?,
            Some("3".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_failing_sink_keeps_record_uncommitted() -> anyhow::Result<()> {
        let fixture = Fixture::new(|c| c.max_retries = 1).await?;
        let handler = RecordingHandler::new().always_fail_sequence("2");
        let sink = Arc::new(FlakySink::failing(u32::MAX));

        let err = fixture
            .dispatcher_with_sink(sink.clone())
            .dispatch(&fixture.key, &records(&["1", "2", "3"]), &handler, &mut never_shutdown())
            .await
            .err()
            .ok_or_else(|| anyhow::anyhow!("dispatch moved past a record the sink rejected"))?;

        match err {
            ProcessorError::DeadLetterFailed { sequence, reason } => {
                assert_eq!(sequence, "2");
                assert!(reason.contains("unavailable"));
            }
            other => anyhow::bail!("expected DeadLetterFailed, got {:?}", other),
        }
        // the sink is retried like a commit: one attempt plus max_retries
        assert_eq!(sink.calls(), 2);
        assert_eq!(handler.invocation_order(), vec!["1", "2", "2"]);
        assert_eq!(
            fixture.store.get_checkpoint(&fixture.key).await?,
            Some("1".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_sink_recovers_within_retries() -> anyhow::Result<()> {
        let fixture = Fixture::new(|c| c.max_retries = 2).await?;
        let handler = RecordingHandler::new().always_fail_sequence("1");
        let sink = Arc::new(FlakySink::failing(1));

        let outcome = fixture
            .dispatcher_with_sink(sink.clone())
            .dispatch(&fixture.key, &records(&["1", "2"]), &handler, &mut never_shutdown())
            .await?;

        assert_eq!(outcome.dead_lettered, 1);
        assert_eq!(outcome.processed, 1);
        assert_eq!(sink.calls(), 2);
        assert_eq!(sink.accepted.len(), 1);
        assert_eq!(
            fixture.store.get_checkpoint(&fixture.key).await?,
            Some("2".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_hard_failure_is_not_retried() -> anyhow::Result<()> {
        let fixture = Fixture::new(|_| {}).await?;
        let handler = RecordingHandler::new().hard_fail_sequence("1");

        let outcome = fixture
            .dispatcher()
            .dispatch(&fixture.key, &records(&["1"]), &handler, &mut never_shutdown())
            .await?;

        assert_eq!(handler.invocations_of("1"), 1);
        assert_eq!(outcome.dead_lettered, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_skip_policy() -> anyhow::Result<()> {
        let fixture = Fixture::new(|c| c.failure_policy = FailurePolicy::Skip).await?;
        let handler = RecordingHandler::new().always_fail_sequence("1");

        let outcome = fixture
            .dispatcher()
            .dispatch(&fixture.key, &records(&["1", "2"]), &handler, &mut never_shutdown())
            .await?;

        assert_eq!(handler.invocations_of("1"), 1);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.processed, 1);
        assert!(fixture.dead_letters.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_policy_skips_after_retries() -> anyhow::Result<()> {
        let fixture = Fixture::new(|c| {
            c.failure_policy = FailurePolicy::Retry;
            c.max_retries = 1;
        })
        .await?;
        let handler = RecordingHandler::new().always_fail_sequence("1");

        let outcome = fixture
            .dispatcher()
            .dispatch(&fixture.key, &records(&["1"]), &handler, &mut never_shutdown())
            .await?;

        assert_eq!(handler.invocations_of("1"), 2);
        assert_eq!(outcome.skipped, 1);
        assert!(fixture.dead_letters.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_per_record_commits() -> anyhow::Result<()> {
        let fixture = Fixture::new(|c| c.commit_mode = CommitMode::PerRecord).await?;
        let handler = RecordingHandler::new();

        fixture
            .dispatcher()
            .dispatch(&fixture.key, &records(&["1", "2"]), &handler, &mut never_shutdown())
            .await?;

        let lease = fixture
            .store
            .get_lease(&fixture.key)
            .await?
            .ok_or_else(|| anyhow::anyhow!("lease missing"))?;
        // acquire plus two commits
        assert_eq!(lease.version, 3);
        assert_eq!(lease.position.as_deref(), Some("2"));
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_commit_reports_lease_lost() -> anyhow::Result<()> {
        let fixture = Fixture::new(|_| {}).await?;
        let later = Utc::now() + chrono::Duration::seconds(60);
        fixture
            .store
            .acquire_lease(&fixture.key, "instance-b", later, later + chrono::Duration::seconds(30))
            .await?;

        let handler = RecordingHandler::new();
        let err = fixture
            .dispatcher()
            .dispatch(&fixture.key, &records(&["1"]), &handler, &mut never_shutdown())
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessorError::LeaseLost(_)));
        assert_eq!(fixture.store.get_checkpoint(&fixture.key).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_transient_commit_failures_are_retried() -> anyhow::Result<()> {
        let fixture = Fixture::new(|_| {}).await?;
        fixture.store.fail_next_operations(2);

        fixture
            .dispatcher()
            .dispatch(
                &fixture.key,
                &records(&["7"]),
                &RecordingHandler::new(),
                &mut never_shutdown(),
            )
            .await?;

        assert_eq!(
            fixture.store.get_checkpoint(&fixture.key).await?,
            Some("7".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_between_records_commits_progress() -> anyhow::Result<()> {
        let fixture = Fixture::new(|_| {}).await?;
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handler = RecordingHandler::new().on_sequence("2", move || {
            let _ = stop_tx.send(true);
        });

        let outcome = fixture
            .dispatcher()
            .dispatch(&fixture.key, &records(&["1", "2", "3"]), &handler, &mut stop_rx)
            .await?;

        assert!(outcome.interrupted);
        assert_eq!(handler.invocation_order(), vec!["1", "2"]);
        assert_eq!(
            fixture.store.get_checkpoint(&fixture.key).await?,
            Some("2".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_logging_sink_accepts_letters() -> anyhow::Result<()> {
        let key = ShardKey::new("s", "shard-0", "g");
        LoggingDeadLetterSink
            .send(DeadLetter::shard_expired(&key, "trimmed"))
            .await?;
        Ok(())
    }
}
