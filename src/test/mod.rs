//! Test utilities and in-memory fakes for exercising the listener engine

pub mod mocks;

pub use mocks::{InMemoryKinesis, RecordingHandler};

use std::time::Duration;

use bytes::Bytes;

use crate::config::ConsumerConfig;
use crate::record::KinesisRecord;

/// Helper functions for creating test data
pub struct TestUtils;

impl TestUtils {
    /// Create a test record with given sequence number and data
    pub fn create_test_record(sequence_number: &str, data: &[u8]) -> KinesisRecord {
        KinesisRecord {
            stream_name: "test-stream".to_string(),
            shard_id: "shardId-000000000000".to_string(),
            sequence_number: sequence_number.to_string(),
            partition_key: "test-partition-key".to_string(),
            data: Bytes::copy_from_slice(data),
            approximate_arrival: None,
        }
    }

    /// Create a vector of test records with sequence numbers 1..=count
    pub fn create_test_records(count: usize) -> Vec<KinesisRecord> {
        (1..=count)
            .map(|i| Self::create_test_record(&i.to_string(), format!("data-{}", i).as_bytes()))
            .collect()
    }

    /// Config with every interval shortened to tens of milliseconds
    pub fn fast_config(instance_id: &str) -> ConsumerConfig {
        ConsumerConfig {
            instance_id: instance_id.to_string(),
            poll_timeout: Duration::from_millis(50),
            idle_time_between_polls: Duration::from_millis(10),
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(20),
            lease_duration: Duration::from_secs(1),
            heartbeat_interval: Duration::from_millis(100),
            rescan_interval: Duration::from_millis(100),
            shutdown_grace_period: Duration::from_millis(500),
            ..ConsumerConfig::default()
        }
    }

    /// Initialise tracing once for unit tests
    #[cfg(test)]
    pub fn init_logging() {
        use std::sync::Once;
        use tracing_subscriber::EnvFilter;

        static INIT: Once = Once::new();
        INIT.call_once(|| {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new("kinesis_listener=debug")),
                )
                .with_test_writer()
                .init();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::KinesisClientTrait;
    use aws_sdk_kinesis::types::ShardIteratorType;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_create_test_records() {
        let records = TestUtils::create_test_records(3);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].sequence_number, "1");
        assert_eq!(records[2].data, Bytes::from("data-3"));
        assert_eq!(records[0].partition_key, "test-partition-key");
    }

    #[test]
    fn test_fast_config_is_valid() {
        assert!(TestUtils::fast_config("instance-a").validate().is_ok());
    }

    #[tokio::test]
    async fn test_fake_split_lists_lineage() -> anyhow::Result<()> {
        let kinesis = InMemoryKinesis::new();
        let parent = kinesis.create_stream_with_shards("s", 1)[0].clone();
        let children = kinesis.split_shard("s", &parent)?;

        let shards = kinesis.list_shards("s").await?;
        assert_eq!(shards.len(), 3);
        assert!(shards[0].closed);
        for child in &shards[1..] {
            assert!(children.contains(&child.shard_id));
            assert_eq!(child.parent_shard_id.as_deref(), Some(parent.as_str()));
        }

        assert!(kinesis.put("s", &parent, Bytes::from("late")).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_fake_sequence_numbers_increase() -> anyhow::Result<()> {
        let kinesis = InMemoryKinesis::new();
        let shard = kinesis.create_stream_with_shards("s", 1)[0].clone();
        let a: u64 = kinesis.put("s", &shard, Bytes::from("a"))?.parse()?;
        let b: u64 = kinesis.put("s", &shard, Bytes::from("b"))?.parse()?;
        assert!(b > a);

        let iterator = kinesis
            .get_shard_iterator("s", &shard, ShardIteratorType::AfterSequenceNumber, Some(&a.to_string()), None)
            .await?;
        let output = kinesis.get_records(&iterator, 10).await?;
        assert_eq!(output.records.len(), 1);
        assert_eq!(output.records[0].sequence_number(), b.to_string());
        Ok(())
    }
}
