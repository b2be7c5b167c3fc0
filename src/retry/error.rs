use crate::ProcessorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetryError<E: std::fmt::Display> {
    #[error("Maximum attempts ({attempts}) exhausted: {last_error}")]
    Exhausted { attempts: u32, last_error: E },

    /// The operation failed with an error the caller marked as not retryable
    #[error("{0}")]
    Permanent(E),

    #[error("Retry interrupted by shutdown signal")]
    Interrupted,
}

impl<E: std::fmt::Display> RetryError<E> {
    /// The last error returned by the operation, if any
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last_error, .. } | RetryError::Permanent(last_error) => {
                Some(last_error)
            }
            RetryError::Interrupted => None,
        }
    }
}

impl<E> From<RetryError<E>> for ProcessorError
where
    E: std::fmt::Display + Into<ProcessorError>,
{
    fn from(err: RetryError<E>) -> Self {
        match err {
            RetryError::Exhausted { last_error, .. } | RetryError::Permanent(last_error) => {
                last_error.into()
            }
            RetryError::Interrupted => ProcessorError::Shutdown,
        }
    }
}
