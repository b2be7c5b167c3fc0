//! Listener registration: one handler per stream name.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::{HandlerError, ProcessorError, Result};
use crate::record::{KinesisRecord, RecordEnvelope};

/// Handles records read from one stream.
///
/// Delivery is at-least-once: the same record may be handed over again after
/// a crash, a lease handover or a retry, so implementations must be
/// idempotent.
///
/// # Examples
///
/// ```rust
/// use kinesis_listener::{HandlerError, KinesisRecord, RecordHandler};
///
/// struct Printer;
///
/// #[async_trait::async_trait]
/// impl RecordHandler for Printer {
///     async fn handle(&self, record: &KinesisRecord) -> Result<(), HandlerError> {
///         match record.data_as_str() {
///             Some(text) => {
///                 println!("{}", text);
///                 Ok(())
///             }
///             None => Err(HandlerError::hard(anyhow::anyhow!("not utf-8"))),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait RecordHandler: Send + Sync {
    /// * `Ok(())` when the record is done
    /// * `Err(HandlerError::SoftFailure)` for failures worth retrying
    /// * `Err(HandlerError::HardFailure)` for failures that never succeed
    async fn handle(&self, record: &KinesisRecord) -> std::result::Result<(), HandlerError>;
}

#[async_trait]
impl<H: RecordHandler + ?Sized> RecordHandler for Arc<H> {
    async fn handle(&self, record: &KinesisRecord) -> std::result::Result<(), HandlerError> {
        (**self).handle(record).await
    }
}

/// Decodes the `{"data": .., "metadata": ..}` envelope and hands the typed
/// parts to a function. Undecodable records fail hard.
pub struct JsonHandler<D, M, F> {
    f: F,
    _types: PhantomData<fn() -> (D, M)>,
}

impl<D, M, F, Fut> JsonHandler<D, M, F>
where
    D: DeserializeOwned + Send + 'static,
    M: DeserializeOwned + Send + 'static,
    F: Fn(D, M) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _types: PhantomData,
        }
    }
}

#[async_trait]
impl<D, M, F, Fut> RecordHandler for JsonHandler<D, M, F>
where
    D: DeserializeOwned + Send + 'static,
    M: DeserializeOwned + Send + 'static,
    F: Fn(D, M) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    async fn handle(&self, record: &KinesisRecord) -> std::result::Result<(), HandlerError> {
        let envelope: RecordEnvelope<D, M> = serde_json::from_slice(&record.data)?;
        (self.f)(envelope.data, envelope.metadata).await
    }
}

/// Stream name to handler map, built by the host application at startup
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn RecordHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `stream_name`. A stream takes one handler.
    pub fn register(
        &mut self,
        stream_name: impl Into<String>,
        handler: impl RecordHandler + 'static,
    ) -> Result<()> {
        let stream_name = stream_name.into();
        if stream_name.is_empty() {
            return Err(ProcessorError::ConfigError(
                "stream name must not be empty".to_string(),
            ));
        }
        if self.handlers.contains_key(&stream_name) {
            return Err(ProcessorError::ConfigError(format!(
                "a handler is already registered for stream {}",
                stream_name
            )));
        }
        self.handlers.insert(stream_name, Arc::new(handler));
        Ok(())
    }

    /// Registers a typed envelope handler
    pub fn register_json<D, M, F, Fut>(
        &mut self,
        stream_name: impl Into<String>,
        f: F,
    ) -> Result<()>
    where
        D: DeserializeOwned + Send + 'static,
        M: DeserializeOwned + Send + 'static,
        F: Fn(D, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.register(stream_name, JsonHandler::new(f))
    }

    pub fn with_handler(
        mut self,
        stream_name: impl Into<String>,
        handler: impl RecordHandler + 'static,
    ) -> Result<Self> {
        self.register(stream_name, handler)?;
        Ok(self)
    }

    pub fn handler_for(&self, stream_name: &str) -> Option<Arc<dyn RecordHandler>> {
        self.handlers.get(stream_name).cloned()
    }

    /// Registered stream names, sorted
    pub fn streams(&self) -> Vec<String> {
        let mut streams: Vec<_> = self.handlers.keys().cloned().collect();
        streams.sort();
        streams
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("streams", &self.streams())
            .finish()
    }
}
