//! Top-level listener engine and the per-shard worker loop.
//!
//! [`KinesisProcessor`] runs one [`ShardCoordinator`] per registered stream.
//! The coordinator leases shards and spawns a [`ShardWorker`] for each one
//! it owns; the worker reads batches and hands them to the dispatch engine
//! until the shard ends, the lease is lost or it is told to stop.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::client::KinesisClientTrait;
use crate::config::{ConsumerConfig, InitialPosition};
use crate::coordinator::ShardCoordinator;
use crate::dispatch::{DeadLetterSink, Dispatcher, LoggingDeadLetterSink};
use crate::error::{ProcessorError, ReaderError, Result};
use crate::handler::{HandlerRegistry, RecordHandler};
use crate::initializer::StreamInitializer;
use crate::monitoring::{EventSink, ProcessingEvent, ShardEventType};
use crate::reader::{ShardReader, StartPosition};
use crate::record::{ShardKey, SHARD_END};
use crate::retry::{Backoff, ExponentialBackoff};
use crate::shutdown::{is_shutdown, wait_for_shutdown};
use crate::store::{CheckpointStore, LeaseStore};

/// Why a shard worker returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Drained to the end of a closed shard and committed `SHARD_END`
    ShardEnded,
    /// A commit was rejected because another instance owns the shard
    LeaseLost,
    /// Told to stop
    Stopped,
    /// The shard is gone from the stream's retention window
    ShardNotFound,
    Failed(String),
}

/// Reads one leased shard and dispatches its records
pub struct ShardWorker<C, S>
where
    C: KinesisClientTrait + ?Sized,
    S: CheckpointStore + ?Sized,
{
    key: ShardKey,
    reader: ShardReader<C>,
    dispatcher: Dispatcher<S>,
    handler: Arc<dyn RecordHandler>,
    batch_size: i32,
    initial_position: InitialPosition,
    backoff: ExponentialBackoff,
    events: EventSink,
}

impl<C, S> ShardWorker<C, S>
where
    C: KinesisClientTrait + ?Sized,
    S: CheckpointStore + ?Sized,
{
    pub fn new(
        key: ShardKey,
        client: Arc<C>,
        store: Arc<S>,
        handler: Arc<dyn RecordHandler>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: &ConsumerConfig,
        events: EventSink,
    ) -> Self {
        Self {
            key,
            reader: ShardReader::new(client, config.poll_timeout, config.idle_time_between_polls)
                .with_events(events.clone()),
            dispatcher: Dispatcher::new(store, dead_letters, config).with_events(events.clone()),
            handler,
            batch_size: config.batch_size,
            initial_position: config.initial_position.clone(),
            backoff: ExponentialBackoff::builder()
                .initial_delay(config.backoff_base)
                .max_delay(config.backoff_max)
                .build(),
            events,
        }
    }

    /// Processes the shard from `checkpoint` until it ends or `stop` fires.
    ///
    /// Throttling and transient read failures are retried with backoff and
    /// never reach the handler.
    pub async fn run(self, checkpoint: Option<String>, mut stop: watch::Receiver<bool>) -> WorkerExit {
        let key = &self.key;
        let start = StartPosition::resolve(checkpoint.as_deref(), &self.initial_position);
        info!(shard_id = %key.shard_id, stream = %key.stream_name, start = ?start, "Starting shard worker");

        self.events
            .send(ProcessingEvent::shard_event(
                &key.stream_name,
                &key.shard_id,
                ShardEventType::Started,
                None,
            ))
            .await;

        let mut failures = 0u32;
        let mut handle = loop {
            match self
                .reader
                .open(&key.stream_name, &key.shard_id, start.clone())
                .await
            {
                Ok(handle) => break handle,
                Err(e) => match self.on_read_error(e, &mut failures, &mut stop).await {
                    Some(exit) => return exit,
                    None => continue,
                },
            }
        };

        loop {
            if is_shutdown(&stop) {
                return self.stopped().await;
            }

            let batch = match self.reader.poll(&mut handle, self.batch_size, &mut stop).await {
                Ok(batch) => {
                    failures = 0;
                    batch
                }
                Err(e) => match self.on_read_error(e, &mut failures, &mut stop).await {
                    Some(exit) => return exit,
                    None => continue,
                },
            };

            if !batch.records.is_empty() {
                match self
                    .dispatcher
                    .dispatch(key, &batch.records, self.handler.as_ref(), &mut stop)
                    .await
                {
                    Ok(outcome) if outcome.interrupted => return self.stopped().await,
                    Ok(_) => {}
                    Err(e) => return self.dispatch_failed(e).await,
                }
            }

            if batch.shard_closed {
                return match self.dispatcher.commit(key, SHARD_END).await {
                    Ok(()) => {
                        info!(shard_id = %key.shard_id, "Shard drained to its end");
                        self.events
                            .send(ProcessingEvent::shard_event(
                                &key.stream_name,
                                &key.shard_id,
                                ShardEventType::Completed,
                                None,
                            ))
                            .await;
                        WorkerExit::ShardEnded
                    }
                    Err(e) => self.dispatch_failed(e).await,
                };
            }
        }
    }

    /// Decides what a read failure means for the worker. `None` means the
    /// read should be retried.
    async fn on_read_error(
        &self,
        err: ReaderError,
        failures: &mut u32,
        stop: &mut watch::Receiver<bool>,
    ) -> Option<WorkerExit> {
        let key = &self.key;
        match err {
            ReaderError::ShardNotFound(_) => {
                error!(
                    shard_id = %key.shard_id,
                    stream = %key.stream_name,
                    "Shard not found, records may have expired from retention"
                );
                self.events
                    .send(ProcessingEvent::shard_event(
                        &key.stream_name,
                        &key.shard_id,
                        ShardEventType::NotFound,
                        Some(err.to_string()),
                    ))
                    .await;
                Some(WorkerExit::ShardNotFound)
            }
            ReaderError::Rejected(_) => {
                error!(
                    shard_id = %key.shard_id,
                    stream = %key.stream_name,
                    error = %err,
                    "Read rejected, giving up the shard"
                );
                self.events
                    .send(ProcessingEvent::shard_event(
                        &key.stream_name,
                        &key.shard_id,
                        ShardEventType::Error,
                        Some(err.to_string()),
                    ))
                    .await;
                Some(WorkerExit::Failed(err.to_string()))
            }
            ReaderError::Shutdown => Some(self.stopped().await),
            e => {
                *failures += 1;
                let delay = self.backoff.next_delay(*failures - 1);
                if matches!(e, ReaderError::Throttling(_)) {
                    self.events
                        .send(ProcessingEvent::throttled(
                            &key.stream_name,
                            &key.shard_id,
                            *failures,
                            delay,
                        ))
                        .await;
                }
                warn!(
                    shard_id = %key.shard_id,
                    attempt = *failures,
                    delay_ms = ?delay.as_millis(),
                    error = %e,
                    "Read failed, backing off"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => None,
                    _ = wait_for_shutdown(stop) => Some(self.stopped().await),
                }
            }
        }
    }

    async fn dispatch_failed(&self, err: ProcessorError) -> WorkerExit {
        let key = &self.key;
        match err {
            ProcessorError::LeaseLost(_) => {
                warn!(shard_id = %key.shard_id, "Lease lost, stopping shard");
                WorkerExit::LeaseLost
            }
            ProcessorError::Shutdown => self.stopped().await,
            e => {
                error!(shard_id = %key.shard_id, error = %e, "Shard processing failed");
                self.events
                    .send(ProcessingEvent::shard_event(
                        &key.stream_name,
                        &key.shard_id,
                        ShardEventType::Error,
                        Some(e.to_string()),
                    ))
                    .await;
                WorkerExit::Failed(e.to_string())
            }
        }
    }

    async fn stopped(&self) -> WorkerExit {
        debug!(shard_id = %self.key.shard_id, "Shard worker stopping");
        self.events
            .send(ProcessingEvent::shard_event(
                &self.key.stream_name,
                &self.key.shard_id,
                ShardEventType::Interrupted,
                None,
            ))
            .await;
        WorkerExit::Stopped
    }
}

/// Consumes every registered stream as one member of a consumer group.
///
/// # Example
///
/// ```rust,no_run
/// use kinesis_listener::{
///     ClientSettings, ConsumerConfig, DynamoDbLeaseStore, HandlerError, HandlerRegistry,
///     KinesisProcessor,
/// };
///
/// #[derive(serde::Deserialize)]
/// struct FooCreatedEvent {
///     foo: String,
/// }
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let settings = ClientSettings::new("us-east-1");
///     let client = settings.kinesis_client().await;
///     let store = DynamoDbLeaseStore::new(
///         settings.dynamodb_client().await,
///         "kinesis-leases".to_string(),
///         String::new(),
///     )?;
///
///     let mut registry = HandlerRegistry::new();
///     registry.register_json(
///         "foo-event-stream",
///         |event: FooCreatedEvent, _metadata: serde_json::Value| async move {
///             println!("foo = {}", event.foo);
///             Ok::<(), HandlerError>(())
///         },
///     )?;
///
///     let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
///     let (processor, _monitoring) =
///         KinesisProcessor::new(ConsumerConfig::default(), registry, client, store);
///
///     tokio::spawn(async move {
///         let _ = tokio::signal::ctrl_c().await;
///         let _ = shutdown_tx.send(true);
///     });
///
///     processor.run(shutdown_rx).await?;
///     Ok(())
/// }
/// ```
pub struct KinesisProcessor<C, S>
where
    C: KinesisClientTrait + 'static,
    S: LeaseStore + 'static,
{
    config: ConsumerConfig,
    registry: HandlerRegistry,
    client: Arc<C>,
    store: Arc<S>,
    dead_letters: Arc<dyn DeadLetterSink>,
    events: EventSink,
}

impl<C, S> KinesisProcessor<C, S>
where
    C: KinesisClientTrait + 'static,
    S: LeaseStore + 'static,
{
    /// Returns the processor and, when monitoring is enabled, the receiving
    /// end of the event channel
    pub fn new(
        config: ConsumerConfig,
        registry: HandlerRegistry,
        client: C,
        store: S,
    ) -> (Self, Option<mpsc::Receiver<ProcessingEvent>>) {
        let (events, monitoring_rx) = EventSink::from_config(&config.monitoring);

        let processor = Self {
            config,
            registry,
            client: Arc::new(client),
            store: Arc::new(store),
            dead_letters: Arc::new(LoggingDeadLetterSink),
            events,
        };
        (processor, monitoring_rx)
    }

    /// Replaces the default logging dead-letter sink
    pub fn with_dead_letter_sink(mut self, sink: impl DeadLetterSink + 'static) -> Self {
        self.dead_letters = Arc::new(sink);
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Runs until `shutdown` fires, then releases every owned shard.
    ///
    /// Creates missing streams first when `create_streams` is set.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.config.validate()?;
        if self.registry.is_empty() {
            return Err(ProcessorError::ConfigError(
                "no stream handlers registered".to_string(),
            ));
        }

        let streams = self.registry.streams();
        info!(
            streams = ?streams,
            consumer_group = %self.config.consumer_group,
            instance_id = %self.config.instance_id,
            "Starting Kinesis processor"
        );

        if self.config.create_streams {
            let initializer = StreamInitializer::new(
                self.client.clone(),
                self.config.stream_shard_count,
                self.config.stream_creation_timeout,
            );
            for stream in &streams {
                initializer.ensure_stream(stream).await?;
            }
        }

        let mut handles = Vec::with_capacity(streams.len());
        for stream in streams {
            let handler = self
                .registry
                .handler_for(&stream)
                .ok_or_else(|| ProcessorError::NoHandler(stream.clone()))?;

            let coordinator = ShardCoordinator::new(
                stream,
                self.config.clone(),
                self.client.clone(),
                self.store.clone(),
                handler,
                self.dead_letters.clone(),
            )
            .with_events(self.events.clone());

            let shutdown_rx = shutdown.clone();
            handles.push(tokio::spawn(coordinator.run(shutdown_rx)));
        }

        for result in join_all(handles).await {
            result??;
        }

        info!("Processor shutdown complete");
        Ok(())
    }

    /// Deletes the cursors and leases this consumer group holds for
    /// `stream_name`, so the next run starts from the initial position.
    /// Meant for when no member of the group is running.
    pub async fn reset_group(&self, stream_name: &str) -> Result<usize> {
        let removed = self
            .store
            .reset_group(stream_name, &self.config.consumer_group)
            .await?;
        info!(
            stream = %stream_name,
            consumer_group = %self.config.consumer_group,
            removed,
            "Consumer group reset"
        );
        Ok(removed)
    }
}
