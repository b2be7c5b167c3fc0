use super::types::{
    IteratorEventType, LeaseEventType, ProcessingEvent, ProcessingEventType, ShardEventType,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::time::interval;
use tracing::{debug, info, trace, warn};

use crate::shutdown::wait_for_shutdown;

/// Holds aggregated metrics for a single shard
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    pub records_processed: u64,
    pub records_failed: u64,
    pub records_dead_lettered: u64,
    pub retry_attempts: u64,
    pub processing_time: Duration,
    pub max_processing_time: Duration,

    pub checkpoints_succeeded: u64,
    pub checkpoints_failed: u64,

    pub iterator_renewals: u64,
    pub iterator_failures: u64,
    pub throttle_events: u64,

    pub leases_acquired: u64,
    pub leases_lost: u64,

    pub window_start: Instant,
    pub last_updated: Instant,
}

impl Default for ShardMetrics {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            records_processed: 0,
            records_failed: 0,
            records_dead_lettered: 0,
            retry_attempts: 0,
            processing_time: Duration::default(),
            max_processing_time: Duration::default(),
            checkpoints_succeeded: 0,
            checkpoints_failed: 0,
            iterator_renewals: 0,
            iterator_failures: 0,
            throttle_events: 0,
            leases_acquired: 0,
            leases_lost: 0,
            window_start: now,
            last_updated: now,
        }
    }
}

impl ShardMetrics {
    pub fn avg_processing_time(&self) -> Duration {
        let count = self.records_processed + self.records_failed;
        if count == 0 {
            Duration::ZERO
        } else {
            self.processing_time.div_f64(count as f64)
        }
    }
}

/// Aggregates monitoring events into per-shard metrics, keyed by
/// `stream/shard`
pub struct MetricsAggregator {
    metrics: Arc<RwLock<HashMap<String, ShardMetrics>>>,
    window_duration: Duration,
    monitoring_rx: tokio::sync::mpsc::Receiver<ProcessingEvent>,
}

impl MetricsAggregator {
    pub fn new(
        window_duration: Duration,
        monitoring_rx: tokio::sync::mpsc::Receiver<ProcessingEvent>,
    ) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
            window_duration,
            monitoring_rx,
        }
    }

    /// Processes events and emits metrics every window until the channel
    /// closes or shutdown is signalled
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.window_duration);

        loop {
            tokio::select! {
                event = self.monitoring_rx.recv() => match event {
                    Some(event) => self.process_event(event).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    self.emit_metrics().await;
                }
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        self.emit_metrics().await;
        debug!("Metrics aggregator stopped");
    }

    pub async fn process_event(&self, event: ProcessingEvent) {
        let key = format!("{}/{}", event.stream_name, event.shard_id);
        let mut metrics = self.metrics.write().await;
        let shard_metrics = metrics.entry(key).or_default();

        match event.event_type {
            ProcessingEventType::RecordAttempt {
                success,
                attempt_number,
                duration,
                ..
            } => {
                if success {
                    shard_metrics.records_processed += 1;
                }
                if attempt_number > 1 {
                    shard_metrics.retry_attempts += 1;
                }
                shard_metrics.processing_time += duration;
                if duration > shard_metrics.max_processing_time {
                    shard_metrics.max_processing_time = duration;
                }
            }
            ProcessingEventType::BatchComplete {
                successful_count,
                failed_count,
                duration,
            } => {
                trace!(
                    shard_id = %event.shard_id,
                    successful = successful_count,
                    failed = failed_count,
                    duration_ms = ?duration.as_millis(),
                    "Batch processing completed"
                );
            }
            ProcessingEventType::RecordFailure {
                sequence_number,
                error,
                dead_lettered,
            } => {
                shard_metrics.records_failed += 1;
                if dead_lettered {
                    shard_metrics.records_dead_lettered += 1;
                }
                warn!(
                    shard_id = %event.shard_id,
                    sequence = %sequence_number,
                    error = %error,
                    dead_lettered,
                    "Record processing failed"
                );
            }
            ProcessingEventType::Checkpoint {
                sequence_number,
                success,
                error,
            } => {
                if success {
                    shard_metrics.checkpoints_succeeded += 1;
                } else {
                    shard_metrics.checkpoints_failed += 1;
                    warn!(
                        shard_id = %event.shard_id,
                        sequence = %sequence_number,
                        error = ?error,
                        "Checkpoint failed"
                    );
                }
            }
            ProcessingEventType::Iterator { event_type, error } => match event_type {
                IteratorEventType::Renewed => shard_metrics.iterator_renewals += 1,
                IteratorEventType::Failed => {
                    shard_metrics.iterator_failures += 1;
                    warn!(shard_id = %event.shard_id, error = ?error, "Iterator operation failed");
                }
                IteratorEventType::Initial | IteratorEventType::Expired => {}
            },
            ProcessingEventType::Lease { event_type, details } => match event_type {
                LeaseEventType::Acquired => shard_metrics.leases_acquired += 1,
                LeaseEventType::Lost => {
                    shard_metrics.leases_lost += 1;
                    warn!(shard_id = %event.shard_id, details = ?details, "Lease lost");
                }
                LeaseEventType::Renewed | LeaseEventType::Released => {}
            },
            ProcessingEventType::Throttled { .. } => shard_metrics.throttle_events += 1,
            ProcessingEventType::ShardEvent {
                event_type,
                details,
            } => match event_type {
                ShardEventType::Error | ShardEventType::NotFound => {
                    warn!(
                        shard_id = %event.shard_id,
                        event = ?event_type,
                        details = ?details,
                        "Shard processing error"
                    );
                }
                _ => {
                    trace!(shard_id = %event.shard_id, event = ?event_type, "Shard event");
                }
            },
        }

        shard_metrics.last_updated = Instant::now();
    }

    async fn emit_metrics(&self) {
        let mut metrics = self.metrics.write().await;

        for (shard, metrics) in metrics.iter() {
            // skip shards with no recent activity
            if metrics.last_updated.elapsed() > self.window_duration * 2 {
                continue;
            }

            info!(
                shard = %shard,
                records_processed = metrics.records_processed,
                records_failed = metrics.records_failed,
                records_dead_lettered = metrics.records_dead_lettered,
                retry_attempts = metrics.retry_attempts,
                avg_processing_time_ms = %metrics.avg_processing_time().as_millis(),
                max_processing_time_ms = %metrics.max_processing_time.as_millis(),
                checkpoints_succeeded = metrics.checkpoints_succeeded,
                checkpoints_failed = metrics.checkpoints_failed,
                iterator_renewals = metrics.iterator_renewals,
                throttle_events = metrics.throttle_events,
                leases_acquired = metrics.leases_acquired,
                leases_lost = metrics.leases_lost,
                "Metrics for window"
            );

            if metrics.checkpoints_failed > 0 {
                warn!(
                    shard = %shard,
                    failures = metrics.checkpoints_failed,
                    "Checkpoint failures detected"
                );
            }
        }

        metrics.retain(|_, m| m.last_updated.elapsed() <= self.window_duration * 2);
    }

    /// Get current metrics for all shards
    pub async fn get_metrics(&self) -> HashMap<String, ShardMetrics> {
        self.metrics.read().await.clone()
    }

    pub async fn get_shard_metrics(&self, stream_name: &str, shard_id: &str) -> Option<ShardMetrics> {
        self.metrics
            .read()
            .await
            .get(&format!("{}/{}", stream_name, shard_id))
            .cloned()
    }
}
