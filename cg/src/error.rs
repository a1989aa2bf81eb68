//! Call settlement errors and the typed backend error
//!
//! `CallError` is what a scheduled call settles with when it does not produce
//! a value. `BackendError` is the error transports hand back to the scheduler;
//! it carries an explicit `retryable` tag so classification never depends on
//! message text.

use thiserror::Error;

/// Errors a scheduled call can settle with
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The work failed with an error the classifier did not consider throttling
    #[error("Call failed: {0}")]
    Terminal(E),

    /// The backend kept throttling after the retry budget was spent
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: E },

    /// The task was still waiting when the queue was cleared or the scheduler reset
    #[error("Queue cleared")]
    QueueCleared,

    /// The caller cancelled the task
    #[error("Call cancelled")]
    Cancelled,

    /// The task was dropped without settling (its work panicked)
    #[error("Call abandoned before settlement")]
    Abandoned,
}

impl<E> CallError<E> {
    /// The underlying backend error, if this failure carries one
    pub fn inner(&self) -> Option<&E> {
        match self {
            CallError::Terminal(e) => Some(e),
            CallError::RetriesExhausted { last, .. } => Some(last),
            _ => None,
        }
    }

    /// Consume and return the underlying backend error, if any
    pub fn into_inner(self) -> Option<E> {
        match self {
            CallError::Terminal(e) => Some(e),
            CallError::RetriesExhausted { last, .. } => Some(last),
            _ => None,
        }
    }

    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, CallError::RetriesExhausted { .. })
    }

    pub fn is_queue_cleared(&self) -> bool {
        matches!(self, CallError::QueueCleared)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CallError::Cancelled)
    }
}

/// Errors that know whether they represent backend throttling
///
/// This is the default retry classifier used by `Scheduler::execute`. Error
/// types without a natural tag can be classified with `Scheduler::execute_with`.
pub trait Throttle {
    fn is_throttled(&self) -> bool;
}

/// Error returned by a backend transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Backend error {status}: {message}")]
pub struct BackendError {
    /// Status code reported by the backend
    pub status: u16,

    /// Human-readable message from the backend or transport
    pub message: String,

    /// Set by the transport when the backend signalled throttling
    pub retryable: bool,
}

impl BackendError {
    /// Build an error from a backend status; only 429 is tagged retryable
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retryable: status == 429,
        }
    }

    /// A throttling response (HTTP 429)
    pub fn throttled(message: impl Into<String>) -> Self {
        Self::from_status(429, message)
    }

    /// Override the retryable tag, for backends that signal throttling in the payload
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl Throttle for BackendError {
    fn is_throttled(&self) -> bool {
        self.retryable
    }
}
