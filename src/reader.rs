//! Shard reader: pulls record batches from one shard starting at a cursor.

use std::sync::Arc;
use std::time::Duration;

use aws_sdk_kinesis::types::ShardIteratorType;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::client::{KinesisClientError, KinesisClientTrait};
use crate::config::InitialPosition;
use crate::error::ReaderError;
use crate::monitoring::{EventSink, IteratorEventType, ProcessingEvent};
use crate::record::{sort_by_sequence, KinesisRecord};
use crate::shutdown::wait_for_shutdown;

/// Where a reader starts in a shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPosition {
    /// Resume right after a committed sequence number
    AfterSequence(String),
    TrimHorizon,
    Latest,
    AtTimestamp(DateTime<Utc>),
}

impl StartPosition {
    /// Resume after `checkpoint` when one exists, otherwise use `initial`
    pub fn resolve(checkpoint: Option<&str>, initial: &InitialPosition) -> Self {
        match (checkpoint, initial) {
            (Some(seq), _) => StartPosition::AfterSequence(seq.to_string()),
            (None, InitialPosition::TrimHorizon) => StartPosition::TrimHorizon,
            (None, InitialPosition::Latest) => StartPosition::Latest,
            (None, InitialPosition::AtTimestamp(ts)) => StartPosition::AtTimestamp(*ts),
        }
    }
}

/// An open read position in one shard
#[derive(Debug, Clone)]
pub struct ShardHandle {
    pub stream_name: String,
    pub shard_id: String,
    start: StartPosition,
    iterator: Option<String>,
    last_sequence: Option<String>,
}

impl ShardHandle {
    /// Sequence number of the last record handed out by `poll`
    pub fn last_sequence(&self) -> Option<&str> {
        self.last_sequence.as_deref()
    }

    pub fn iterator(&self) -> Option<&str> {
        self.iterator.as_deref()
    }

    /// The shard is closed and every record up to its end has been read
    pub fn is_drained(&self) -> bool {
        self.iterator.is_none()
    }

    /// Position to restart from when the iterator expires
    fn resume_position(&self) -> StartPosition {
        match &self.last_sequence {
            Some(seq) => StartPosition::AfterSequence(seq.clone()),
            None => self.start.clone(),
        }
    }
}

/// Result of one poll
#[derive(Debug, Clone, Default)]
pub struct ShardBatch {
    /// Records in sequence-number order. Empty when the wait timed out.
    pub records: Vec<KinesisRecord>,
    pub next_iterator: Option<String>,
    /// Every record up to the end of the shard has now been returned
    pub shard_closed: bool,
    pub millis_behind_latest: Option<i64>,
}

pub struct ShardReader<C: KinesisClientTrait + ?Sized> {
    client: Arc<C>,
    poll_timeout: Duration,
    idle_time_between_polls: Duration,
    events: EventSink,
}

impl<C: KinesisClientTrait + ?Sized> ShardReader<C> {
    pub fn new(client: Arc<C>, poll_timeout: Duration, idle_time_between_polls: Duration) -> Self {
        Self {
            client,
            poll_timeout,
            idle_time_between_polls,
            events: EventSink::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Opens the shard at `start`
    pub async fn open(
        &self,
        stream_name: &str,
        shard_id: &str,
        start: StartPosition,
    ) -> Result<ShardHandle, ReaderError> {
        let iterator = self.iterator_at(stream_name, shard_id, &start).await?;

        debug!(
            stream = %stream_name,
            shard_id = %shard_id,
            start = ?start,
            "Opened shard"
        );
        self.events
            .send(ProcessingEvent::iterator(
                stream_name,
                shard_id,
                IteratorEventType::Initial,
                None,
            ))
            .await;

        Ok(ShardHandle {
            stream_name: stream_name.to_string(),
            shard_id: shard_id.to_string(),
            start,
            iterator: Some(iterator),
            last_sequence: None,
        })
    }

    /// Reads up to `max_batch` records.
    ///
    /// Waits up to the poll timeout for records to appear, returning an
    /// empty batch when none did. Returns early with an empty batch when
    /// `stop` fires during an idle wait.
    pub async fn poll(
        &self,
        handle: &mut ShardHandle,
        max_batch: i32,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<ShardBatch, ReaderError> {
        let deadline = Instant::now() + self.poll_timeout;

        loop {
            let Some(iterator) = handle.iterator.clone() else {
                return Ok(ShardBatch {
                    shard_closed: true,
                    ..Default::default()
                });
            };

            let output = match self.client.get_records(&iterator, max_batch).await {
                Ok(output) => output,
                Err(KinesisClientError::ExpiredIterator) => {
                    self.renew_iterator(handle).await?;
                    if Instant::now() >= deadline {
                        return Ok(ShardBatch {
                            next_iterator: handle.iterator.clone(),
                            ..Default::default()
                        });
                    }
                    continue;
                }
                Err(e) => return Err(self.classify(handle, e).await),
            };

            handle.iterator = output.next_iterator.clone();

            let mut records: Vec<KinesisRecord> = output
                .records
                .iter()
                .map(|r| KinesisRecord::from_sdk(&handle.stream_name, &handle.shard_id, r))
                .collect();
            sort_by_sequence(&mut records);

            if let Some(last) = records.last() {
                handle.last_sequence = Some(last.sequence_number.clone());
            }

            let shard_closed = handle.iterator.is_none();
            if !records.is_empty() || shard_closed {
                trace!(
                    shard_id = %handle.shard_id,
                    count = records.len(),
                    shard_closed,
                    "Polled records"
                );
                return Ok(ShardBatch {
                    records,
                    next_iterator: handle.iterator.clone(),
                    shard_closed,
                    millis_behind_latest: output.millis_behind_latest,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(ShardBatch {
                    next_iterator: handle.iterator.clone(),
                    millis_behind_latest: output.millis_behind_latest,
                    ..Default::default()
                });
            }

            let idle = self.idle_time_between_polls.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                _ = wait_for_shutdown(stop) => {
                    return Ok(ShardBatch {
                        next_iterator: handle.iterator.clone(),
                        ..Default::default()
                    });
                }
            }
        }
    }

    async fn renew_iterator(&self, handle: &mut ShardHandle) -> Result<(), ReaderError> {
        let position = handle.resume_position();
        warn!(
            shard_id = %handle.shard_id,
            position = ?position,
            "Iterator expired, renewing"
        );
        self.events
            .send(ProcessingEvent::iterator(
                &handle.stream_name,
                &handle.shard_id,
                IteratorEventType::Expired,
                None,
            ))
            .await;

        let iterator = self
            .iterator_at(&handle.stream_name, &handle.shard_id, &position)
            .await?;
        handle.iterator = Some(iterator);

        self.events
            .send(ProcessingEvent::iterator(
                &handle.stream_name,
                &handle.shard_id,
                IteratorEventType::Renewed,
                None,
            ))
            .await;
        Ok(())
    }

    async fn iterator_at(
        &self,
        stream_name: &str,
        shard_id: &str,
        position: &StartPosition,
    ) -> Result<String, ReaderError> {
        let (iterator_type, sequence, timestamp) = match position {
            StartPosition::AfterSequence(seq) => {
                (ShardIteratorType::AfterSequenceNumber, Some(seq.as_str()), None)
            }
            StartPosition::TrimHorizon => (ShardIteratorType::TrimHorizon, None, None),
            StartPosition::Latest => (ShardIteratorType::Latest, None, None),
            StartPosition::AtTimestamp(ts) => (ShardIteratorType::AtTimestamp, None, Some(ts)),
        };

        self.client
            .get_shard_iterator(stream_name, shard_id, iterator_type, sequence, timestamp)
            .await
            .map_err(|e| reader_error(shard_id, e))
    }

    async fn classify(&self, handle: &ShardHandle, err: KinesisClientError) -> ReaderError {
        let reader_err = reader_error(&handle.shard_id, err);

        if !matches!(reader_err, ReaderError::Throttling(_)) {
            self.events
                .send(ProcessingEvent::iterator(
                    &handle.stream_name,
                    &handle.shard_id,
                    IteratorEventType::Failed,
                    Some(reader_err.to_string()),
                ))
                .await;
        }
        reader_err
    }
}

fn reader_error(shard_id: &str, err: KinesisClientError) -> ReaderError {
    match err {
        KinesisClientError::ResourceNotFound(_) => ReaderError::ShardNotFound(shard_id.to_string()),
        KinesisClientError::ThroughputExceeded(msg) => ReaderError::Throttling(msg),
        e @ (KinesisClientError::InvalidArgument(_)
        | KinesisClientError::AccessDenied(_)
        | KinesisClientError::KmsError(_)) => ReaderError::Rejected(e.to_string()),
        other => ReaderError::Kinesis(other.to_string()),
    }
}
