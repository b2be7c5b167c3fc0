//! Creates listened-to streams on startup when they are missing.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{KinesisClientError, KinesisClientTrait, StreamStatus};
use crate::error::{ProcessorError, Result};

pub struct StreamInitializer<C: KinesisClientTrait + ?Sized> {
    client: Arc<C>,
    shard_count: i32,
    timeout: Duration,
    poll_interval: Duration,
}

impl<C: KinesisClientTrait + ?Sized> StreamInitializer<C> {
    pub fn new(client: Arc<C>, shard_count: i32, timeout: Duration) -> Self {
        Self {
            client,
            shard_count,
            timeout,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Creates `stream_name` if it does not exist and waits until it is
    /// active. Fails with [`ProcessorError::StreamNotActive`] once the
    /// timeout passes.
    pub async fn ensure_stream(&self, stream_name: &str) -> Result<()> {
        let deadline = Instant::now() + self.timeout;

        match self.client.describe_stream_status(stream_name).await {
            Ok(StreamStatus::Active) => {
                debug!(stream = %stream_name, "Stream already active");
                return Ok(());
            }
            Ok(status) => {
                debug!(stream = %stream_name, ?status, "Stream exists, waiting for it to become active");
            }
            Err(KinesisClientError::ResourceNotFound(_)) => {
                info!(stream = %stream_name, shards = self.shard_count, "Creating stream");
                match self.client.create_stream(stream_name, self.shard_count).await {
                    Ok(()) | Err(KinesisClientError::ResourceInUse(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }

        loop {
            match self.client.describe_stream_status(stream_name).await {
                Ok(StreamStatus::Active) => {
                    info!(stream = %stream_name, "Stream is active");
                    return Ok(());
                }
                Ok(status) => {
                    debug!(stream = %stream_name, ?status, "Stream not active yet");
                }
                Err(e) if e.is_retryable() || matches!(e, KinesisClientError::ResourceNotFound(_)) => {
                    warn!(stream = %stream_name, error = %e, "Describe failed while waiting for stream");
                }
                Err(e) => return Err(e.into()),
            }

            if Instant::now() + self.poll_interval > deadline {
                return Err(ProcessorError::StreamNotActive {
                    stream: stream_name.to_string(),
                    timeout: self.timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
