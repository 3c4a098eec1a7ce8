use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

/// Runs network calls in the background while limiting how many run at the same time.
///
/// A caller first has to [reserve](TaskPool::reserve) a slot, which waits until one is free,
/// and then [spawns](TaskPool::spawn) the task into it. The slot is released once the task
/// completes.
pub struct TaskPool {
    name: &'static str,
    size: usize,
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
}

impl TaskPool {
    /// Creates a pool which runs up to **size** tasks concurrently.
    pub fn new(name: &'static str, size: usize) -> Self {
        let size = size.max(1);
        TaskPool {
            name,
            size,
            permits: Arc::new(Semaphore::new(size)),
            tasks: JoinSet::new(),
        }
    }

    /// Determines if all slots are currently in use.
    pub fn is_saturated(&self) -> bool {
        self.permits.available_permits() == 0
    }

    /// Returns the number of tasks which are currently running.
    pub fn active(&self) -> usize {
        self.size - self.permits.available_permits()
    }

    /// Waits until a slot is free and reserves it.
    pub async fn reserve(&self) -> anyhow::Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow::anyhow!("The {} pool has been closed.", self.name))
    }

    /// Runs the given task in the previously reserved slot.
    pub fn spawn<F>(&mut self, permit: OwnedSemaphorePermit, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.reap();
        let _ = self.tasks.spawn(async move {
            task.await;
            std::mem::drop(permit);
        });
    }

    /// Waits until all spawned tasks have completed.
    pub async fn shutdown(&mut self) {
        if !self.tasks.is_empty() {
            log::info!(
                "Waiting for {} {} task(s) to complete...",
                self.tasks.len(),
                self.name
            );
        }

        while let Some(result) = self.tasks.join_next().await {
            self.log_failure(result);
        }
    }

    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            self.log_failure(result);
        }
    }

    fn log_failure(&self, result: Result<(), tokio::task::JoinError>) {
        if let Err(error) = result {
            log::error!("A {} task crashed: {}", self.name, error);
        }
    }
}
