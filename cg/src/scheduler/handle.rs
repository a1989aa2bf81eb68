//! Typed calls and the handle callers await

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::core::Scheduler;
use super::queue::{AbortReason, Attempt, Job};
use crate::error::CallError;

type Reply<T, E> = oneshot::Sender<Result<T, CallError<E>>>;

/// Caller-supplied work plus the classifier and reply channel for it
pub(crate) struct Call<F, C, T, E> {
    work: F,
    classify: C,
    reply: Reply<T, E>,
    last_error: Option<E>,
}

impl<F, C, T, E> Call<F, C, T, E> {
    pub fn new(work: F, classify: C, reply: Reply<T, E>) -> Self {
        Self {
            work,
            classify,
            reply,
            last_error: None,
        }
    }

    fn settle(self, result: Result<T, CallError<E>>) {
        if self.reply.send(result).is_err() {
            debug!("Call::settle: caller dropped its handle");
        }
    }
}

impl<F, Fut, C, T, E> Job for Call<F, C, T, E>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    C: Fn(&E) -> bool + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    fn run(mut self: Box<Self>) -> BoxFuture<'static, Attempt> {
        Box::pin(async move {
            match (self.work)().await {
                Ok(value) => Attempt::Succeeded(Box::new(move || self.settle(Ok(value)))),
                Err(e) if (self.classify)(&e) => {
                    self.last_error = Some(e);
                    Attempt::Throttled(self)
                }
                Err(e) => Attempt::Failed(Box::new(move || self.settle(Err(CallError::Terminal(e))))),
            }
        })
    }

    fn exhaust(self: Box<Self>, attempts: u32) {
        let mut call = *self;
        let error = match call.last_error.take() {
            Some(last) => CallError::RetriesExhausted { attempts, last },
            None => CallError::Abandoned,
        };
        call.settle(Err(error));
    }

    fn abort(self: Box<Self>, reason: AbortReason) {
        let error = match reason {
            AbortReason::QueueCleared => CallError::QueueCleared,
            AbortReason::Cancelled => CallError::Cancelled,
        };
        self.settle(Err(error));
    }
}

/// Pending result of a submitted call
///
/// Resolves exactly once. Dropping the handle does not cancel the call; use
/// [`CallHandle::cancel`] for that.
pub struct CallHandle<T, E> {
    id: u64,
    rx: oneshot::Receiver<Result<T, CallError<E>>>,
    cancel: CancellationToken,
    scheduler: Scheduler,
}

impl<T, E> CallHandle<T, E> {
    pub(crate) fn new(
        id: u64,
        rx: oneshot::Receiver<Result<T, CallError<E>>>,
        cancel: CancellationToken,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            id,
            rx,
            cancel,
            scheduler,
        }
    }

    /// Scheduler-assigned task id, as shown in `Scheduler::queue_details`
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancel the call
    ///
    /// A queued or backing-off task settles with `Cancelled` immediately. An
    /// executing task has its work dropped and its concurrency slot released;
    /// its rate-window entry stays. No effect once the call has settled.
    pub fn cancel(&self) {
        debug!(id = self.id, "CallHandle::cancel: called");
        self.scheduler.cancel_task(self.id, &self.cancel);
    }

    /// The task's cancellation token
    ///
    /// Cancelling the token directly stops an executing task at once, but a
    /// waiting task only settles when it next reaches admission or its retry
    /// delay ends. [`CallHandle::cancel`] settles waiting tasks immediately.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<T, E> Future for CallHandle<T, E> {
    type Output = Result<T, CallError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.rx).poll(cx)) {
            Ok(result) => Poll::Ready(result),
            // The job was dropped without a reply: either cancelled mid-flight or its work panicked
            Err(_) if this.cancel.is_cancelled() => Poll::Ready(Err(CallError::Cancelled)),
            Err(_) => Poll::Ready(Err(CallError::Abandoned)),
        }
    }
}
