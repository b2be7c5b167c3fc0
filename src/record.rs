//! Record, shard key and sequence number types shared by the reader, the
//! dispatch engine and the stores.

use std::cmp::Ordering;
use std::fmt;

use aws_smithy_types_convert::date_time::DateTimeExt;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cursor value committed once a shard has been drained to its end.
///
/// Child shards produced by a split or merge only become assignable once
/// every parent carries this cursor.
pub const SHARD_END: &str = "SHARD_END";

/// Identifies one progress cursor: (stream, shard, consumer group)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey {
    pub stream_name: String,
    pub shard_id: String,
    pub consumer_group: String,
}

impl ShardKey {
    pub fn new(
        stream_name: impl Into<String>,
        shard_id: impl Into<String>,
        consumer_group: impl Into<String>,
    ) -> Self {
        Self {
            stream_name: stream_name.into(),
            shard_id: shard_id.into(),
            consumer_group: consumer_group.into(),
        }
    }

    /// Flattened form used as the primary key in the lease table
    pub fn storage_key(&self) -> String {
        format!(
            "{}#{}#{}",
            self.stream_name, self.consumer_group, self.shard_id
        )
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.stream_name, self.shard_id, self.consumer_group
        )
    }
}

/// A record read from a shard. Immutable once read.
#[derive(Debug, Clone, PartialEq)]
pub struct KinesisRecord {
    pub stream_name: String,
    pub shard_id: String,
    pub sequence_number: String,
    pub partition_key: String,
    pub data: Bytes,
    pub approximate_arrival: Option<DateTime<Utc>>,
}

impl KinesisRecord {
    /// Converts an SDK record read from `stream_name`/`shard_id`
    pub fn from_sdk(
        stream_name: &str,
        shard_id: &str,
        record: &aws_sdk_kinesis::types::Record,
    ) -> Self {
        Self {
            stream_name: stream_name.to_string(),
            shard_id: shard_id.to_string(),
            sequence_number: record.sequence_number().to_string(),
            partition_key: record.partition_key().to_string(),
            data: Bytes::copy_from_slice(record.data().as_ref()),
            approximate_arrival: record
                .approximate_arrival_timestamp()
                .and_then(|ts| ts.to_chrono_utc().ok()),
        }
    }

    pub fn data_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

/// Compares two Kinesis sequence numbers.
///
/// Sequence numbers are unbounded decimal strings, so they are compared by
/// significant length first and then lexically. `SHARD_END` sorts after
/// every real sequence number. Non-numeric values fall back to plain string
/// ordering.
pub fn compare_sequence_numbers(a: &str, b: &str) -> Ordering {
    match (a == SHARD_END, b == SHARD_END) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        (false, false) => {}
    }

    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|c| c.is_ascii_digit());
    if !(numeric(a) && numeric(b)) {
        return a.cmp(b);
    }

    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Sorts records of one shard into sequence-number order
pub fn sort_by_sequence(records: &mut [KinesisRecord]) {
    records.sort_by(|a, b| compare_sequence_numbers(&a.sequence_number, &b.sequence_number));
}

/// Wire format shared by the outbound gateway and typed handlers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEnvelope<D, M> {
    pub data: D,
    pub metadata: M,
}

impl<D, M> RecordEnvelope<D, M> {
    pub fn new(data: D, metadata: M) -> Self {
        Self { data, metadata }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_sequence_numbers_compare_numerically() {
        assert_eq!(compare_sequence_numbers("9", "10"), Ordering::Less);
        assert_eq!(
            compare_sequence_numbers(
                "49590338271490256608559692538361571095921575989136588898",
                "49590338271490256608559692538361571095921575989136588899"
            ),
            Ordering::Less
        );
        assert_eq!(compare_sequence_numbers("007", "7"), Ordering::Equal);
        assert_eq!(compare_sequence_numbers("100", "99"), Ordering::Greater);
    }

    #[test]
    fn test_shard_end_sorts_last() {
        assert_eq!(compare_sequence_numbers(SHARD_END, "999999"), Ordering::Greater);
        assert_eq!(compare_sequence_numbers("1", SHARD_END), Ordering::Less);
        assert_eq!(compare_sequence_numbers(SHARD_END, SHARD_END), Ordering::Equal);
    }

    #[test]
    fn test_sort_by_sequence() {
        let record = |seq: &str| KinesisRecord {
            stream_name: "s".to_string(),
            shard_id: "shard-0".to_string(),
            sequence_number: seq.to_string(),
            partition_key: "pk".to_string(),
            data: Bytes::new(),
            approximate_arrival: None,
        };

        let mut records = vec![record("12"), record("3"), record("100")];
        sort_by_sequence(&mut records);

        let order: Vec<_> = records.iter().map(|r| r.sequence_number.as_str()).collect();
        assert_eq!(order, vec!["3", "12", "100"]);
    }

    #[test]
    fn test_storage_key_layout() {
        let key = ShardKey::new("foo-event-stream", "shardId-000000000000", "default");
        assert_eq!(
            key.storage_key(),
            "foo-event-stream#default#shardId-000000000000"
        );
        assert_eq!(
            key.to_string(),
            "foo-event-stream/shardId-000000000000/default"
        );
    }
}
