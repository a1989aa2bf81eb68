//! Batch runner
//!
//! Submits a sequence of independent calls to a [`Scheduler`] one at a time,
//! in order, waiting for each to settle before submitting the next. Failures
//! are reported per item through [`BatchHooks`]; the batch only fails as a
//! whole when every call failed.

use std::future::Future;

use thiserror::Error;
use tracing::{debug, info};

use crate::error::{CallError, Throttle};
use crate::scheduler::{CallHandle, Scheduler};

/// Error raised when every call in a batch failed
#[derive(Debug, Error)]
pub enum BatchError<E> {
    #[error("All {failed} batch tasks failed")]
    AllFailed { failed: usize, errors: Vec<CallError<E>> },
}

type ProgressFn<'a> = Box<dyn FnMut(usize, usize) + Send + 'a>;
type ErrorFn<'a, E> = Box<dyn FnMut(&CallError<E>, usize) + Send + 'a>;

/// Optional per-item callbacks for a batch
pub struct BatchHooks<'a, E> {
    on_progress: Option<ProgressFn<'a>>,
    on_error: Option<ErrorFn<'a, E>>,
}

impl<E> Default for BatchHooks<'_, E> {
    fn default() -> Self {
        Self {
            on_progress: None,
            on_error: None,
        }
    }
}

impl<'a, E> BatchHooks<'a, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called after each success with `(settled, total)`
    pub fn on_progress(mut self, f: impl FnMut(usize, usize) + Send + 'a) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    /// Called after each failure with the error and the item's index
    pub fn on_error(mut self, f: impl FnMut(&CallError<E>, usize) + Send + 'a) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

/// Drives batches of calls through a shared scheduler
#[derive(Debug, Clone)]
pub struct BatchRunner {
    scheduler: Scheduler,
}

impl BatchRunner {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    /// Run every call in order; returns the successful results in submission order
    pub async fn run<T, E, F, Fut, I>(&self, works: I, hooks: BatchHooks<'_, E>) -> Result<Vec<T>, BatchError<E>>
    where
        I: IntoIterator<Item = F>,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Throttle + Send + 'static,
    {
        let works: Vec<F> = works.into_iter().collect();
        self.drive(works, hooks, |work| self.scheduler.submit(work)).await
    }

    /// Like [`BatchRunner::run`] with a caller-supplied retry classifier
    pub async fn run_with<T, E, F, Fut, I, C>(
        &self,
        works: I,
        classify: C,
        hooks: BatchHooks<'_, E>,
    ) -> Result<Vec<T>, BatchError<E>>
    where
        I: IntoIterator<Item = F>,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        C: Fn(&E) -> bool + Clone + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let works: Vec<F> = works.into_iter().collect();
        self.drive(works, hooks, |work| self.scheduler.submit_with(work, classify.clone()))
            .await
    }

    async fn drive<T, E, F>(
        &self,
        works: Vec<F>,
        mut hooks: BatchHooks<'_, E>,
        mut submit: impl FnMut(F) -> CallHandle<T, E>,
    ) -> Result<Vec<T>, BatchError<E>> {
        let total = works.len();
        debug!(total, "BatchRunner::drive: called");

        let mut results = Vec::with_capacity(total);
        let mut errors = Vec::new();

        for (index, work) in works.into_iter().enumerate() {
            match submit(work).await {
                Ok(value) => {
                    results.push(value);
                    if let Some(on_progress) = hooks.on_progress.as_mut() {
                        on_progress(index + 1, total);
                    }
                }
                Err(error) => {
                    debug!(index, "BatchRunner::drive: item failed");
                    if let Some(on_error) = hooks.on_error.as_mut() {
                        on_error(&error, index);
                    }
                    errors.push(error);
                }
            }
        }

        if total > 0 && errors.len() == total {
            info!(total, "Batch failed: every task failed");
            return Err(BatchError::AllFailed {
                failed: errors.len(),
                errors,
            });
        }

        info!(total, succeeded = results.len(), failed = errors.len(), "Batch finished");
        Ok(results)
    }
}

impl Scheduler {
    /// Run a batch on this scheduler; see [`BatchRunner::run`]
    pub async fn run_batch<T, E, F, Fut, I>(&self, works: I, hooks: BatchHooks<'_, E>) -> Result<Vec<T>, BatchError<E>>
    where
        I: IntoIterator<Item = F>,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Throttle + Send + 'static,
    {
        BatchRunner::new(self.clone()).run(works, hooks).await
    }
}
