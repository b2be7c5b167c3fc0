//! Kinesis Listener - consume Kinesis streams as a consumer group
//!
//! Handlers are registered per stream name. Instances of one consumer group
//! share each shard through leases in a lease table, hand records to the
//! handlers in sequence-number order and commit a per-shard cursor after
//! each batch, so a restart resumes where the group left off. Delivery is
//! at-least-once; handlers must be idempotent.
//!
//! The [`gateway`] module publishes records to streams in the envelope the
//! typed handlers decode.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod initializer;
pub mod monitoring;
pub mod processor;
pub mod reader;
pub mod record;
pub mod retry;
pub mod shutdown;
pub mod store;

// Make test utilities available for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test;

pub use client::{ClientSettings, KinesisClientError, KinesisClientTrait};
pub use config::{CommitMode, ConsumerConfig, ConsumerSettings, FailurePolicy, InitialPosition};
pub use dispatch::{
    DeadLetter, DeadLetterReason, DeadLetterSink, InMemoryDeadLetterSink, LoggingDeadLetterSink,
    StreamDeadLetterSink,
};
pub use error::{HandlerError, ProcessorError, PublishError, Result, StoreError};
pub use gateway::{GatewayConfig, OutboundGateway, OutboundRecord};
pub use handler::{HandlerRegistry, JsonHandler, RecordHandler};
pub use processor::KinesisProcessor;
pub use record::{KinesisRecord, RecordEnvelope, ShardKey, SHARD_END};
pub use retry::{Backoff, ExponentialBackoff};

// Re-export main traits
pub use crate::store::{CheckpointStore, LeaseStore};

// Re-export implementations
pub use crate::store::InMemoryLeaseStore;

#[cfg(feature = "dynamodb-store")]
pub use crate::store::DynamoDbLeaseStore;
