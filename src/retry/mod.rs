//! Retry and backoff helpers shared by the stores, the shard reader and the
//! outbound gateway

mod backoff;
mod error;

pub use backoff::{Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
pub use error::RetryError;

use std::time::Duration;
use tokio::select;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::shutdown::wait_for_shutdown;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (None for unbounded)
    pub max_attempts: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(3),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::builder()
            .initial_delay(self.initial_backoff)
            .max_delay(self.max_backoff)
            .jitter_factor(self.jitter_factor)
            .build()
    }
}

/// Helper for retrying operations with backoff
pub struct RetryHandle<B: Backoff> {
    config: RetryConfig,
    backoff: B,
    attempts: u32,
}

impl RetryHandle<ExponentialBackoff> {
    pub fn from_config(config: RetryConfig) -> Self {
        let backoff = config.backoff();
        Self::new(config, backoff)
    }
}

impl<B: Backoff> RetryHandle<B> {
    pub fn new(config: RetryConfig, backoff: B) -> Self {
        Self {
            config,
            backoff,
            attempts: 0,
        }
    }

    /// Retry an operation on every error
    pub async fn retry<F, Fut, T, E>(
        &mut self,
        operation: F,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.retry_if(operation, |_| true, shutdown).await
    }

    /// Retry an operation while `is_retryable` accepts its error.
    ///
    /// Errors rejected by `is_retryable` are returned immediately as
    /// [`RetryError::Permanent`].
    pub async fn retry_if<F, Fut, T, E, P>(
        &mut self,
        mut operation: F,
        is_retryable: P,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        loop {
            if *shutdown.borrow() {
                return Err(RetryError::Interrupted);
            }

            self.attempts += 1;
            trace!(attempt = self.attempts, "Executing operation");

            let error = select! {
                result = operation() => match result {
                    Ok(value) => {
                        debug!(attempts = self.attempts, "Operation succeeded");
                        return Ok(value);
                    }
                    Err(e) => e,
                },
                _ = wait_for_shutdown(shutdown) => {
                    debug!("Operation interrupted by shutdown signal");
                    return Err(RetryError::Interrupted);
                }
            };

            if !is_retryable(&error) {
                return Err(RetryError::Permanent(error));
            }

            if let Some(max) = self.config.max_attempts {
                if self.attempts >= max {
                    warn!(
                        attempts = self.attempts,
                        error = %error,
                        "Maximum retry attempts exceeded"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: self.attempts,
                        last_error: error,
                    });
                }
            }

            let delay = self.backoff.next_delay(self.attempts - 1);
            warn!(
                attempt = self.attempts,
                delay_ms = ?delay.as_millis(),
                error = %error,
                "Operation failed, retrying after delay"
            );

            select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(shutdown) => {
                    debug!("Retry interrupted by shutdown signal");
                    return Err(RetryError::Interrupted);
                }
            }
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
