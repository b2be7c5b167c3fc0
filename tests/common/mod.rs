// tests/common/mod.rs
#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::Result;
use kinesis_listener::test::{InMemoryKinesis, TestUtils};
use kinesis_listener::{
    CheckpointStore, ConsumerConfig, HandlerRegistry, InMemoryDeadLetterSink, InMemoryLeaseStore,
    KinesisProcessor, ProcessorError, ShardKey,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("kinesis_listener=debug")),
            )
            .with_test_writer()
            .with_thread_ids(true)
            .try_init()
            .ok();
    });
}

pub fn test_config(instance_id: &str) -> ConsumerConfig {
    TestUtils::fast_config(instance_id)
}

/// Shared fake stream service, lease table and dead-letter sink. Every
/// processor spawned from one context sees the same state, like instances
/// of a fleet sharing real backends.
#[derive(Clone, Default)]
pub struct TestContext {
    pub kinesis: InMemoryKinesis,
    pub store: InMemoryLeaseStore,
    pub dead_letters: InMemoryDeadLetterSink,
}

impl TestContext {
    pub fn new() -> Self {
        init_logging();
        Self::default()
    }

    pub fn spawn_processor(&self, config: ConsumerConfig, registry: HandlerRegistry) -> RunningProcessor {
        let (processor, _monitoring_rx) = KinesisProcessor::new(
            config,
            registry,
            self.kinesis.clone(),
            self.store.clone(),
        );
        let processor = processor.with_dead_letter_sink(self.dead_letters.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { processor.run(shutdown_rx).await });
        RunningProcessor {
            shutdown_tx,
            handle,
        }
    }

    pub async fn checkpoint(&self, stream: &str, shard_id: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .get_checkpoint(&ShardKey::new(stream, shard_id, "default"))
            .await?)
    }
}

pub struct RunningProcessor {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<(), ProcessorError>>,
}

impl RunningProcessor {
    /// Signals shutdown and waits for every shard to be released
    pub async fn stop(self) -> Result<()> {
        self.shutdown_tx.send(true)?;
        tokio::time::timeout(Duration::from_secs(5), self.handle).await???;
        Ok(())
    }
}

/// Polls `check` until it holds or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while !check().await {
        if start.elapsed() > timeout {
            anyhow::bail!("Condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

pub fn shared<T: Default>() -> Arc<parking_lot::Mutex<T>> {
    Arc::new(parking_lot::Mutex::new(T::default()))
}
