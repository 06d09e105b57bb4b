//! Defines the core trait for task handling logic.

use crate::error::WorkerError;
use crate::task::Task;
use async_trait::async_trait;
use std::future::Future;

/// A trait for executing tasks consumed from the worker's queue.
///
/// The worker awaits `handle` on its consume loop: no further message is pulled
/// until it returns, so one worker runs one task at a time. Run several workers
/// (see [`WorkerPool`](crate::pool::WorkerPool)) for parallelism.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Executes a single task.
    ///
    /// Results go back to the producer through [`Task::complete`],
    /// [`Task::fail`] or [`Task::respond`]. An `Err` (or a panic) is logged by
    /// the worker and the delivery is still acknowledged.
    async fn handle(&self, task: Task) -> Result<(), WorkerError>;

    /// A name for the handler, used for logging and identification.
    fn handler_name(&self) -> &str {
        "task-handler"
    }
}

/// A [`TaskHandler`] backed by a closure. Build one with [`handler_fn`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

/// Wraps an async closure into a [`TaskHandler`].
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), WorkerError>> + Send,
{
    FnHandler { name: name.into(), f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), WorkerError>> + Send,
{
    async fn handle(&self, task: Task) -> Result<(), WorkerError> {
        (self.f)(task).await
    }

    fn handler_name(&self) -> &str {
        &self.name
    }
}
