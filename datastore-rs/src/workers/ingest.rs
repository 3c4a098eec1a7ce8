use std::time::Instant;

use async_trait::async_trait;

use crate::metrics::{ADMISSION_WAITS, INGESTED_VALUE_SETS};
use crate::store::max_data_exceeded;
use crate::workers::{Worker, WorkerContext};

/// Moves value sets from the raw value set queue into the cache.
///
/// While the cache is over its memory limit, nothing is taken from the queue so that the
/// eviction worker can catch up.
pub struct IngestWorker {
    context: WorkerContext,
}

impl IngestWorker {
    /// Creates a new worker.
    pub fn new(context: WorkerContext) -> Self {
        IngestWorker { context }
    }

    /// Performs a single cycle: either waits for free capacity or transfers at most one entry.
    ///
    /// Returns **true** if an entry was stored.
    pub async fn step(&mut self) -> anyhow::Result<bool> {
        let settings = self.context.settings();
        let store = &self.context.store;

        if max_data_exceeded(store.value_sets.as_ref(), settings.max_memory).await {
            log::debug!("The cache is full. Pausing ingest...");
            let started = Instant::now();
            let _ = self.context.pause(settings.capacity_delay).await;
            self.context
                .metrics
                .add_duration(ADMISSION_WAITS, started.elapsed());
            return Ok(false);
        }

        let entry = tokio::select! {
            _ = self.context.shutdown.cancelled() => return Ok(false),
            entry = store.raw_value_sets.poll(settings.poll_timeout) => entry?,
        };

        match entry {
            Some(entry) => {
                store.value_sets.put(entry.key(), entry).await?;
                self.context.metrics.add(INGESTED_VALUE_SETS, 1.);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl Worker for IngestWorker {
    fn name(&self) -> &'static str {
        "Ingest worker"
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        while self.context.is_running() {
            let _ = self.step().await?;
        }

        Ok(())
    }

    async fn finish(&mut self) -> anyhow::Result<()> {
        let remaining = self.context.store.raw_value_sets.len().await?;
        if remaining > 0 {
            log::warn!(
                "The ingest worker stops with {} value set(s) left in its queue.",
                remaining
            );
        }

        Ok(())
    }
}
