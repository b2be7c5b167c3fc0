//! Optional event stream describing listener activity, and an aggregator
//! that turns it into periodic per-shard metrics logs.

mod metrics;
mod types;

pub use metrics::{MetricsAggregator, ShardMetrics};
#[cfg(any(test, feature = "test-utils"))]
pub use types::TestMonitoringHarness;
pub use types::{
    EventSink, IteratorEventType, LeaseEventType, MonitoringConfig, ProcessingEvent,
    ProcessingEventType, ShardEventType,
};
