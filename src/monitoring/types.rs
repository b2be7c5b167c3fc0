use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{trace, warn};

#[cfg(any(test, feature = "test-utils"))]
use {
    std::collections::HashSet,
    std::sync::Arc,
    tokio::sync::Mutex,
    tracing::debug,
};

/// Configuration for the monitoring system
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Whether monitoring is enabled
    pub enabled: bool,
    /// Size of the monitoring channel buffer
    pub channel_size: usize,
    /// How often to emit aggregated metrics
    pub metrics_interval: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_size: 1000,
            metrics_interval: Duration::from_secs(60),
        }
    }
}

/// Represents a monitoring event from a listener
#[derive(Debug, Clone)]
pub struct ProcessingEvent {
    /// When the event occurred
    pub timestamp: SystemTime,
    pub stream_name: String,
    /// ID of the shard this event relates to
    pub shard_id: String,
    /// The type of event and its details
    pub event_type: ProcessingEventType,
}

/// The different types of events that can occur during processing
#[derive(Debug, Clone)]
pub enum ProcessingEventType {
    RecordAttempt {
        sequence_number: String,
        success: bool,
        attempt_number: u32,
        duration: Duration,
        error: Option<String>,
        is_final_attempt: bool,
    },
    BatchComplete {
        successful_count: usize,
        failed_count: usize,
        duration: Duration,
    },
    /// A record exhausted its failure policy and was skipped or dead-lettered
    RecordFailure {
        sequence_number: String,
        error: String,
        dead_lettered: bool,
    },
    ShardEvent {
        event_type: ShardEventType,
        details: Option<String>,
    },
    Iterator {
        event_type: IteratorEventType,
        error: Option<String>,
    },
    Checkpoint {
        sequence_number: String,
        success: bool,
        error: Option<String>,
    },
    Lease {
        event_type: LeaseEventType,
        details: Option<String>,
    },
    Throttled {
        attempt: u32,
        delay: Duration,
    },
}

/// Types of shard-level events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardEventType {
    Started,
    /// Drained to the end of a closed shard
    Completed,
    Error,
    /// Stopped by shutdown, rebalance or lease loss
    Interrupted,
    /// Expired from the stream's retention
    NotFound,
}

/// Types of iterator events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IteratorEventType {
    Initial,
    Expired,
    Renewed,
    Failed,
}

/// Types of lease events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseEventType {
    Acquired,
    Renewed,
    Lost,
    Released,
}

impl ProcessingEvent {
    fn new(stream_name: &str, shard_id: &str, event_type: ProcessingEventType) -> Self {
        Self {
            timestamp: SystemTime::now(),
            stream_name: stream_name.to_string(),
            shard_id: shard_id.to_string(),
            event_type,
        }
    }

    pub fn batch_complete(
        stream_name: &str,
        shard_id: &str,
        successful_count: usize,
        failed_count: usize,
        duration: Duration,
    ) -> Self {
        Self::new(
            stream_name,
            shard_id,
            ProcessingEventType::BatchComplete {
                successful_count,
                failed_count,
                duration,
            },
        )
    }

    pub fn record_failure(
        stream_name: &str,
        shard_id: &str,
        sequence_number: &str,
        error: String,
        dead_lettered: bool,
    ) -> Self {
        Self::new(
            stream_name,
            shard_id,
            ProcessingEventType::RecordFailure {
                sequence_number: sequence_number.to_string(),
                error,
                dead_lettered,
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_attempt(
        stream_name: &str,
        shard_id: &str,
        sequence_number: &str,
        success: bool,
        attempt_number: u32,
        duration: Duration,
        error: Option<String>,
        is_final_attempt: bool,
    ) -> Self {
        Self::new(
            stream_name,
            shard_id,
            ProcessingEventType::RecordAttempt {
                sequence_number: sequence_number.to_string(),
                success,
                attempt_number,
                duration,
                error,
                is_final_attempt,
            },
        )
    }

    pub fn shard_event(
        stream_name: &str,
        shard_id: &str,
        event_type: ShardEventType,
        details: Option<String>,
    ) -> Self {
        Self::new(
            stream_name,
            shard_id,
            ProcessingEventType::ShardEvent {
                event_type,
                details,
            },
        )
    }

    pub fn checkpoint(
        stream_name: &str,
        shard_id: &str,
        sequence_number: &str,
        success: bool,
        error: Option<String>,
    ) -> Self {
        Self::new(
            stream_name,
            shard_id,
            ProcessingEventType::Checkpoint {
                sequence_number: sequence_number.to_string(),
                success,
                error,
            },
        )
    }

    pub fn iterator(
        stream_name: &str,
        shard_id: &str,
        event_type: IteratorEventType,
        error: Option<String>,
    ) -> Self {
        Self::new(
            stream_name,
            shard_id,
            ProcessingEventType::Iterator { event_type, error },
        )
    }

    pub fn lease(
        stream_name: &str,
        shard_id: &str,
        event_type: LeaseEventType,
        details: Option<String>,
    ) -> Self {
        Self::new(
            stream_name,
            shard_id,
            ProcessingEventType::Lease {
                event_type,
                details,
            },
        )
    }

    pub fn throttled(stream_name: &str, shard_id: &str, attempt: u32, delay: Duration) -> Self {
        Self::new(
            stream_name,
            shard_id,
            ProcessingEventType::Throttled { attempt, delay },
        )
    }
}

/// Sending half of the optional monitoring channel
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<ProcessingEvent>>,
}

impl EventSink {
    pub fn new(tx: Option<mpsc::Sender<ProcessingEvent>>) -> Self {
        Self { tx }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Channel sized from `config`, or a disabled sink
    pub fn from_config(config: &MonitoringConfig) -> (Self, Option<mpsc::Receiver<ProcessingEvent>>) {
        if config.enabled {
            let (tx, rx) = mpsc::channel(config.channel_size);
            (Self::new(Some(tx)), Some(rx))
        } else {
            (Self::disabled(), None)
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Sends an event if monitoring is enabled
    pub async fn send(&self, event: ProcessingEvent) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.send(event).await {
                warn!(error = %e, "Failed to send monitoring event");
            } else {
                trace!("Sent monitoring event successfully");
            }
        }
    }
}

/// Collects events and exposes them as string keys for assertions
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug)]
pub struct TestMonitoringHarness {
    pub monitoring_rx: mpsc::Receiver<ProcessingEvent>,
    events_seen: Arc<Mutex<HashSet<String>>>,
    event_history: Arc<Mutex<Vec<ProcessingEvent>>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl TestMonitoringHarness {
    pub fn new(monitoring_rx: mpsc::Receiver<ProcessingEvent>) -> Self {
        Self {
            monitoring_rx,
            events_seen: Arc::new(Mutex::new(HashSet::new())),
            event_history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Wait until every key in `expected_events` has been seen
    pub async fn wait_for_events(
        &mut self,
        expected_events: &[&str],
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            {
                let events = self.events_seen.lock().await;
                if expected_events.iter().all(|e| events.contains(*e)) {
                    debug!("All expected events seen: {:?}", expected_events);
                    return Ok(());
                }
            }

            let event = match tokio::time::timeout_at(deadline, self.monitoring_rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    let events = self.events_seen.lock().await;
                    return Err(anyhow::anyhow!(
                        "Channel closed before seeing all events. Expected: {:?}, Seen: {:?}",
                        expected_events,
                        events
                    ));
                }
                Err(_) => {
                    let events = self.events_seen.lock().await;
                    return Err(anyhow::anyhow!(
                        "Timeout waiting for events. Expected: {:?}, Seen: {:?}",
                        expected_events,
                        events
                    ));
                }
            };

            self.process_event(&event).await;
        }
    }

    async fn process_event(&self, event: &ProcessingEvent) {
        let mut events = self.events_seen.lock().await;
        self.event_history.lock().await.push(event.clone());

        let shard = &event.shard_id;
        match &event.event_type {
            ProcessingEventType::RecordAttempt {
                sequence_number,
                success,
                attempt_number,
                is_final_attempt,
                ..
            } => {
                let status = if *success { "success" } else { "failure" };
                events.insert(format!("record_attempt_{}_{}", sequence_number, status));
                events.insert(format!(
                    "record_attempt_{}_try_{}",
                    sequence_number, attempt_number
                ));
                if *is_final_attempt {
                    events.insert(format!("record_final_attempt_{}", sequence_number));
                }
            }
            ProcessingEventType::RecordFailure {
                sequence_number,
                dead_lettered,
                ..
            } => {
                events.insert(format!("record_failure_{}", sequence_number));
                if *dead_lettered {
                    events.insert(format!("dead_letter_{}", sequence_number));
                }
            }
            ProcessingEventType::BatchComplete {
                successful_count,
                failed_count,
                ..
            } => {
                events.insert(format!(
                    "batch_complete_{}_{}",
                    successful_count, failed_count
                ));
            }
            ProcessingEventType::ShardEvent { event_type, .. } => {
                let name = match event_type {
                    ShardEventType::Started => "started",
                    ShardEventType::Completed => "completed",
                    ShardEventType::Error => "error",
                    ShardEventType::Interrupted => "interrupted",
                    ShardEventType::NotFound => "not_found",
                };
                events.insert(format!("shard_{}", name));
                events.insert(format!("shard_{}_{}", name, shard));
            }
            ProcessingEventType::Iterator { event_type, .. } => {
                let name = match event_type {
                    IteratorEventType::Initial => "initial",
                    IteratorEventType::Expired => "expired",
                    IteratorEventType::Renewed => "renewed",
                    IteratorEventType::Failed => "failed",
                };
                events.insert(format!("iterator_{}", name));
            }
            ProcessingEventType::Checkpoint {
                sequence_number,
                success,
                ..
            } => {
                let status = if *success { "success" } else { "failure" };
                events.insert(format!("checkpoint_{}_{}", sequence_number, status));
            }
            ProcessingEventType::Lease { event_type, .. } => {
                let name = match event_type {
                    LeaseEventType::Acquired => "acquired",
                    LeaseEventType::Renewed => "renewed",
                    LeaseEventType::Lost => "lost",
                    LeaseEventType::Released => "released",
                };
                events.insert(format!("lease_{}", name));
                events.insert(format!("lease_{}_{}", name, shard));
            }
            ProcessingEventType::Throttled { .. } => {
                events.insert("throttled".to_string());
            }
        }
    }

    /// Get all events seen so far
    pub async fn get_events_seen(&self) -> HashSet<String> {
        self.events_seen.lock().await.clone()
    }

    /// Get full event history
    pub async fn get_event_history(&self) -> Vec<ProcessingEvent> {
        self.event_history.lock().await.clone()
    }

    pub async fn has_seen_event(&self, event: &str) -> bool {
        self.events_seen.lock().await.contains(event)
    }

    /// Dump event history for debugging
    pub async fn dump_history(&self) {
        let history = self.event_history.lock().await;
        debug!("=== Event History ===");
        for (i, event) in history.iter().enumerate() {
            debug!("[{}] {:?}", i, event);
        }
        debug!("=== End History ===");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_sink_drops_events() {
        let (sink, rx) = EventSink::from_config(&MonitoringConfig::default());
        assert!(rx.is_none());
        assert!(!sink.is_enabled());
        sink.send(ProcessingEvent::throttled("s", "shard-0", 1, Duration::ZERO))
            .await;
    }

    #[tokio::test]
    async fn test_enabled_sink_delivers() -> anyhow::Result<()> {
        let config = MonitoringConfig {
            enabled: true,
            channel_size: 4,
            ..Default::default()
        };
        let (sink, rx) = EventSink::from_config(&config);
        let mut rx = rx.ok_or_else(|| anyhow::anyhow!("monitoring channel missing"))?;

        sink.send(ProcessingEvent::lease(
            "s",
            "shard-0",
            LeaseEventType::Acquired,
            None,
        ))
        .await;

        let event = rx.recv().await.ok_or_else(|| anyhow::anyhow!("no event"))?;
        assert_eq!(event.shard_id, "shard-0");
        assert!(matches!(
            event.event_type,
            ProcessingEventType::Lease {
                event_type: LeaseEventType::Acquired,
                ..
            }
        ));
        Ok(())
    }
}
