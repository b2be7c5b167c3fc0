//! In-memory fakes for the stream service and record handlers

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use aws_sdk_kinesis::types::{Record, ShardIteratorType};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::client::{
    GetRecordsOutput, KinesisClientError, KinesisClientTrait, PutRecordOutput, ShardDescriptor,
    StreamStatus,
};
use crate::error::HandlerError;
use crate::handler::RecordHandler;
use crate::record::KinesisRecord;

const FIRST_SEQUENCE: u64 = 49_000_000_000;

#[derive(Debug, Clone)]
struct StoredRecord {
    sequence: u64,
    partition_key: String,
    data: Bytes,
    arrival: DateTime<Utc>,
}

#[derive(Debug)]
struct FakeShard {
    shard_id: String,
    parent_shard_id: Option<String>,
    closed: bool,
    /// Trimmed from retention
    expired: bool,
    records: Vec<StoredRecord>,
}

impl FakeShard {
    fn new(shard_id: String, parent_shard_id: Option<String>) -> Self {
        Self {
            shard_id,
            parent_shard_id,
            closed: false,
            expired: false,
            records: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct FakeStream {
    shards: Vec<FakeShard>,
    status: StreamStatus,
    describes_until_active: u32,
}

impl FakeStream {
    fn with_shards(count: usize) -> Self {
        let mut stream = Self {
            shards: Vec::new(),
            status: StreamStatus::Active,
            describes_until_active: 0,
        };
        for _ in 0..count {
            stream.add_shard(None);
        }
        stream
    }

    fn add_shard(&mut self, parent: Option<String>) -> String {
        let shard_id = format!("shardId-{:012}", self.shards.len());
        self.shards.push(FakeShard::new(shard_id.clone(), parent));
        shard_id
    }

    fn shard(&self, shard_id: &str) -> Option<&FakeShard> {
        self.shards
            .iter()
            .find(|s| s.shard_id == shard_id && !s.expired)
    }

    fn shard_mut(&mut self, shard_id: &str) -> Option<&mut FakeShard> {
        self.shards
            .iter_mut()
            .find(|s| s.shard_id == shard_id && !s.expired)
    }
}

#[derive(Debug)]
struct FakeIterator {
    stream_name: String,
    shard_id: String,
    position: usize,
    expired: bool,
}

#[derive(Debug)]
struct State {
    streams: HashMap<String, FakeStream>,
    iterators: HashMap<String, FakeIterator>,
    next_sequence: u64,
    next_iterator: u64,
    throttled_reads: usize,
    expired_reads: usize,
    throttled_puts: usize,
    put_attempts: usize,
    activation_delay: u32,
}

impl Default for State {
    fn default() -> Self {
        Self {
            streams: HashMap::new(),
            iterators: HashMap::new(),
            next_sequence: FIRST_SEQUENCE,
            next_iterator: 0,
            throttled_reads: 0,
            expired_reads: 0,
            throttled_puts: 0,
            put_attempts: 0,
            activation_delay: 0,
        }
    }
}

impl State {
    fn stream(&self, stream_name: &str) -> Result<&FakeStream, KinesisClientError> {
        self.streams
            .get(stream_name)
            .ok_or_else(|| KinesisClientError::ResourceNotFound(format!("stream {}", stream_name)))
    }

    fn stream_mut(&mut self, stream_name: &str) -> Result<&mut FakeStream, KinesisClientError> {
        self.streams
            .get_mut(stream_name)
            .ok_or_else(|| KinesisClientError::ResourceNotFound(format!("stream {}", stream_name)))
    }

    fn append(&mut self, stream_name: &str, shard_id: &str, partition_key: &str, data: Bytes) -> Result<String, KinesisClientError> {
        self.next_sequence += 1;
        let sequence = self.next_sequence;

        let shard = self
            .stream_mut(stream_name)?
            .shard_mut(shard_id)
            .ok_or_else(|| KinesisClientError::ResourceNotFound(format!("shard {}", shard_id)))?;
        if shard.closed {
            return Err(KinesisClientError::InvalidArgument(format!(
                "shard {} is closed",
                shard_id
            )));
        }

        shard.records.push(StoredRecord {
            sequence,
            partition_key: partition_key.to_string(),
            data,
            arrival: Utc::now(),
        });
        Ok(sequence.to_string())
    }

    fn new_iterator(&mut self, stream_name: &str, shard_id: &str, position: usize) -> String {
        self.next_iterator += 1;
        let id = format!("iterator-{}", self.next_iterator);
        self.iterators.insert(
            id.clone(),
            FakeIterator {
                stream_name: stream_name.to_string(),
                shard_id: shard_id.to_string(),
                position,
                expired: false,
            },
        );
        id
    }
}

/// In-memory stream service.
///
/// Sequence numbers are increasing decimals shared across every shard.
/// Shards can be split (closing the parent), trimmed from retention, and
/// reads and puts can be throttled on demand. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKinesis {
    state: Arc<Mutex<State>>,
}

impl InMemoryKinesis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an active stream and returns its shard ids
    pub fn create_stream_with_shards(&self, stream_name: &str, shard_count: usize) -> Vec<String> {
        let stream = FakeStream::with_shards(shard_count);
        let ids = stream.shards.iter().map(|s| s.shard_id.clone()).collect();
        self.state
            .lock()
            .streams
            .insert(stream_name.to_string(), stream);
        ids
    }

    /// Appends a record to a specific shard and returns its sequence number
    pub fn put(&self, stream_name: &str, shard_id: &str, data: Bytes) -> Result<String> {
        let mut state = self.state.lock();
        let sequence = state.append(stream_name, shard_id, "test-partition-key", data)?;
        trace!(stream = %stream_name, shard_id = %shard_id, sequence = %sequence, "Fake put");
        Ok(sequence)
    }

    /// Records stored in a shard, oldest first
    pub fn records(&self, stream_name: &str, shard_id: &str) -> Vec<KinesisRecord> {
        let state = self.state.lock();
        let Some(shard) = state
            .streams
            .get(stream_name)
            .and_then(|stream| stream.shard(shard_id))
        else {
            return Vec::new();
        };

        shard
            .records
            .iter()
            .map(|r| KinesisRecord {
                stream_name: stream_name.to_string(),
                shard_id: shard_id.to_string(),
                sequence_number: r.sequence.to_string(),
                partition_key: r.partition_key.clone(),
                data: r.data.clone(),
                approximate_arrival: Some(r.arrival),
            })
            .collect()
    }

    /// Closes `shard_id` and adds two children. Returns the children's ids.
    pub fn split_shard(&self, stream_name: &str, shard_id: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        let stream = state.stream_mut(stream_name)?;
        let parent = stream
            .shard_mut(shard_id)
            .ok_or_else(|| anyhow!("shard {} not found", shard_id))?;
        parent.closed = true;

        let children = vec![
            stream.add_shard(Some(shard_id.to_string())),
            stream.add_shard(Some(shard_id.to_string())),
        ];
        debug!(stream = %stream_name, parent = %shard_id, children = ?children, "Fake shard split");
        Ok(children)
    }

    /// Drops a shard as if its records aged out of retention
    pub fn expire_shard(&self, stream_name: &str, shard_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let shard = state
            .stream_mut(stream_name)?
            .shard_mut(shard_id)
            .ok_or_else(|| anyhow!("shard {} not found", shard_id))?;
        shard.expired = true;
        Ok(())
    }

    /// Makes every outstanding iterator fail with `ExpiredIterator`
    pub fn expire_iterators(&self) {
        for iterator in self.state.lock().iterators.values_mut() {
            iterator.expired = true;
        }
    }

    /// Fails the next `count` reads with `ExpiredIterator`, however fresh
    /// the iterator
    pub fn expire_next_reads(&self, count: usize) {
        self.state.lock().expired_reads = count;
    }

    pub fn throttle_next_reads(&self, count: usize) {
        self.state.lock().throttled_reads = count;
    }

    pub fn throttle_next_puts(&self, count: usize) {
        self.state.lock().throttled_puts = count;
    }

    /// Every `put_record` call so far, throttled ones included
    pub fn put_attempts(&self) -> usize {
        self.state.lock().put_attempts
    }

    /// Streams created through `create_stream` report `Creating` for this
    /// many describe calls
    pub fn set_activation_delay(&self, describes: u32) {
        self.state.lock().activation_delay = describes;
    }
}

fn not_found(shard_id: &str) -> KinesisClientError {
    KinesisClientError::ResourceNotFound(format!("shard {}", shard_id))
}

fn parse_sequence(sequence: Option<&str>) -> Result<u64, KinesisClientError> {
    sequence
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| KinesisClientError::InvalidArgument(format!("bad sequence number {:?}", sequence)))
}

#[async_trait]
impl KinesisClientTrait for InMemoryKinesis {
    async fn list_shards(&self, stream_name: &str) -> Result<Vec<ShardDescriptor>, KinesisClientError> {
        let state = self.state.lock();
        Ok(state
            .stream(stream_name)?
            .shards
            .iter()
            .filter(|s| !s.expired)
            .map(|s| ShardDescriptor {
                shard_id: s.shard_id.clone(),
                parent_shard_id: s.parent_shard_id.clone(),
                adjacent_parent_shard_id: None,
                closed: s.closed,
            })
            .collect())
    }

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        iterator_type: ShardIteratorType,
        sequence_number: Option<&str>,
        timestamp: Option<&DateTime<Utc>>,
    ) -> Result<String, KinesisClientError> {
        let mut state = self.state.lock();
        let shard = state
            .stream(stream_name)?
            .shard(shard_id)
            .ok_or_else(|| not_found(shard_id))?;

        let records = &shard.records;
        let position = match iterator_type {
            ShardIteratorType::TrimHorizon => 0,
            ShardIteratorType::Latest => records.len(),
            ShardIteratorType::AfterSequenceNumber => {
                let after = parse_sequence(sequence_number)?;
                records.iter().take_while(|r| r.sequence <= after).count()
            }
            ShardIteratorType::AtSequenceNumber => {
                let at = parse_sequence(sequence_number)?;
                records.iter().take_while(|r| r.sequence < at).count()
            }
            ShardIteratorType::AtTimestamp => {
                let ts = timestamp.ok_or_else(|| {
                    KinesisClientError::InvalidArgument("timestamp required".to_string())
                })?;
                records.iter().take_while(|r| r.arrival < *ts).count()
            }
            other => {
                return Err(KinesisClientError::InvalidArgument(format!(
                    "unsupported iterator type {:?}",
                    other
                )))
            }
        };

        Ok(state.new_iterator(stream_name, shard_id, position))
    }

    async fn get_records(&self, iterator: &str, limit: i32) -> Result<GetRecordsOutput, KinesisClientError> {
        let mut state = self.state.lock();

        if state.throttled_reads > 0 {
            state.throttled_reads -= 1;
            return Err(KinesisClientError::ThroughputExceeded(
                "Rate exceeded for shard".to_string(),
            ));
        }

        if state.expired_reads > 0 {
            state.expired_reads -= 1;
            return Err(KinesisClientError::ExpiredIterator);
        }

        let (stream_name, shard_id, position) = match state.iterators.get(iterator) {
            Some(it) if it.expired => return Err(KinesisClientError::ExpiredIterator),
            Some(it) => (it.stream_name.clone(), it.shard_id.clone(), it.position),
            None => {
                return Err(KinesisClientError::InvalidArgument(format!(
                    "unknown iterator {}",
                    iterator
                )))
            }
        };

        let shard = state
            .stream(&stream_name)?
            .shard(&shard_id)
            .ok_or_else(|| not_found(&shard_id))?;

        let end = (position + limit.max(1) as usize).min(shard.records.len());
        let records = shard.records[position..end]
            .iter()
            .map(|r| {
                Record::builder()
                    .sequence_number(r.sequence.to_string())
                    .partition_key(r.partition_key.clone())
                    .data(aws_smithy_types::Blob::new(r.data.to_vec()))
                    .approximate_arrival_timestamp(aws_smithy_types::DateTime::from_millis(
                        r.arrival.timestamp_millis(),
                    ))
                    .build()
                    .map_err(|e| KinesisClientError::Other(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let drained = shard.closed && end == shard.records.len();

        state.iterators.remove(iterator);
        let next_iterator = if drained {
            None
        } else {
            Some(state.new_iterator(&stream_name, &shard_id, end))
        };

        Ok(GetRecordsOutput {
            records,
            next_iterator,
            millis_behind_latest: Some(0),
        })
    }

    async fn put_record(
        &self,
        stream_name: &str,
        partition_key: &str,
        data: Bytes,
    ) -> Result<PutRecordOutput, KinesisClientError> {
        let mut state = self.state.lock();
        state.put_attempts += 1;

        if state.throttled_puts > 0 {
            state.throttled_puts -= 1;
            return Err(KinesisClientError::ThroughputExceeded(
                "Rate exceeded for stream".to_string(),
            ));
        }

        let open: Vec<String> = state
            .stream(stream_name)?
            .shards
            .iter()
            .filter(|s| !s.closed && !s.expired)
            .map(|s| s.shard_id.clone())
            .collect();
        if open.is_empty() {
            return Err(KinesisClientError::InvalidArgument(format!(
                "stream {} has no open shards",
                stream_name
            )));
        }

        let hash = partition_key
            .bytes()
            .fold(0u64, |h, b| h.wrapping_mul(31).wrapping_add(b as u64));
        let shard_id = open[(hash % open.len() as u64) as usize].clone();
        let sequence_number = state.append(stream_name, &shard_id, partition_key, data)?;

        Ok(PutRecordOutput {
            shard_id,
            sequence_number,
        })
    }

    async fn describe_stream_status(&self, stream_name: &str) -> Result<StreamStatus, KinesisClientError> {
        let mut state = self.state.lock();
        let stream = state.stream_mut(stream_name)?;

        if stream.status == StreamStatus::Creating {
            if stream.describes_until_active == 0 {
                stream.status = StreamStatus::Active;
            } else {
                stream.describes_until_active -= 1;
            }
        }
        Ok(stream.status)
    }

    async fn create_stream(&self, stream_name: &str, shard_count: i32) -> Result<(), KinesisClientError> {
        let mut state = self.state.lock();
        if state.streams.contains_key(stream_name) {
            return Err(KinesisClientError::ResourceInUse(format!(
                "stream {} already exists",
                stream_name
            )));
        }

        let mut stream = FakeStream::with_shards(shard_count.max(1) as usize);
        if state.activation_delay > 0 {
            stream.status = StreamStatus::Creating;
            stream.describes_until_active = state.activation_delay;
        }
        state.streams.insert(stream_name.to_string(), stream);
        Ok(())
    }
}

type Hook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Default)]
struct HandlerLog {
    /// Sequence number of every invocation, retries included
    invocations: Vec<String>,
    /// Records that were handled successfully, in order
    handled: Vec<KinesisRecord>,
    attempts: HashMap<String, u32>,
}

/// Handler that records every invocation and fails on demand.
///
/// Clones share the log, so a clone can be registered while the original is
/// kept for assertions.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    log: Arc<Mutex<HandlerLog>>,
    fail_first: u32,
    always_fail: HashSet<String>,
    hard_fail: HashSet<String>,
    delay: Option<Duration>,
    hooks: HashMap<String, Hook>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the first `attempts` attempts of every record softly
    pub fn fail_first_attempts(mut self, attempts: u32) -> Self {
        self.fail_first = attempts;
        self
    }

    pub fn always_fail_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.always_fail.insert(sequence.into());
        self
    }

    pub fn hard_fail_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.hard_fail.insert(sequence.into());
        self
    }

    /// Sleeps this long inside every invocation
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Runs `hook` whenever the record with `sequence` is handled
    pub fn on_sequence(mut self, sequence: impl Into<String>, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.insert(sequence.into(), Arc::new(hook));
        self
    }

    pub fn total_invocations(&self) -> usize {
        self.log.lock().invocations.len()
    }

    pub fn successful_invocations(&self) -> usize {
        self.log.lock().handled.len()
    }

    /// Distinct records handled successfully
    pub fn distinct_records(&self) -> usize {
        self.log
            .lock()
            .handled
            .iter()
            .map(|r| (r.shard_id.clone(), r.sequence_number.clone()))
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn invocations_of(&self, sequence: &str) -> u32 {
        self.log.lock().attempts.get(sequence).copied().unwrap_or(0)
    }

    pub fn invocation_order(&self) -> Vec<String> {
        self.log.lock().invocations.clone()
    }

    pub fn handled_records(&self) -> Vec<KinesisRecord> {
        self.log.lock().handled.clone()
    }

    /// Payloads of successfully handled records, lossily decoded
    pub fn payloads(&self) -> Vec<String> {
        self.log
            .lock()
            .handled
            .iter()
            .map(|r| String::from_utf8_lossy(&r.data).into_owned())
            .collect()
    }
}

#[async_trait]
impl RecordHandler for RecordingHandler {
    async fn handle(&self, record: &KinesisRecord) -> std::result::Result<(), HandlerError> {
        let sequence = record.sequence_number.as_str();
        let attempt = {
            let mut log = self.log.lock();
            log.invocations.push(sequence.to_string());
            let attempt = log.attempts.entry(sequence.to_string()).or_insert(0);
            *attempt += 1;
            *attempt
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(hook) = self.hooks.get(sequence) {
            hook();
        }

        if self.hard_fail.contains(sequence) {
            return Err(HandlerError::hard(anyhow!("record {} is poison", sequence)));
        }
        if self.always_fail.contains(sequence) {
            return Err(HandlerError::soft(anyhow!("record {} always fails", sequence)));
        }
        if attempt <= self.fail_first {
            return Err(HandlerError::soft(anyhow!(
                "attempt {} of record {} failed",
                attempt,
                sequence
            )));
        }

        self.log.lock().handled.push(record.clone());
        Ok(())
    }
}
