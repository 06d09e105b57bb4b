//! A fixed set of independent workers consuming the same queue.

use crate::error::WorkerError;
use crate::worker::Worker;

/// Runs `size` workers side by side.
///
/// Every worker has its own connection, channel and consumer; nothing is
/// shared between them except what their providers share. This is how tasks
/// from one queue get handled in parallel.
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Builds the pool by calling `factory` with each worker's index.
    pub fn new(size: usize, factory: impl FnMut(usize) -> Worker) -> Self {
        Self {
            workers: (0..size).map(factory).collect(),
        }
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Starts every worker. Fails on the first one that cannot be started;
    /// the ones started before it keep running.
    pub fn start(&self) -> Result<&Self, WorkerError> {
        for worker in &self.workers {
            worker.start()?;
        }
        log::info!("Started a pool of {} workers", self.workers.len());
        Ok(self)
    }

    pub async fn wait_until_consuming(&self) -> &Self {
        for worker in &self.workers {
            worker.wait_until_consuming().await;
        }
        self
    }

    pub fn stop(&self) -> &Self {
        for worker in &self.workers {
            worker.stop();
        }
        self
    }

    pub async fn wait_until_terminated(&self) -> &Self {
        for worker in &self.workers {
            worker.wait_until_terminated().await;
        }
        self
    }

    /// Closes every worker's channel and connection.
    pub async fn close(&self) {
        for worker in &self.workers {
            worker.close().await;
        }
    }
}
