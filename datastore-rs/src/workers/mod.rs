//! Contains the four workers which drive the lifecycle of cached value sets.
//!
//! * [IngestWorker] moves value sets from the raw value set queue into the cache.
//! * [FetchWorker] turns requests into cached value sets, either by assembling them from cached
//!   ones or by calling a web service.
//! * [EvictionWorker] keeps the cache below its memory limit by removing old entries which have
//!   already been delivered and read.
//! * [DeliveryWorker] hands freshly produced value sets to the collector in batches.
//!
//! Each worker runs as its own task under a supervisor. If a worker fails (e.g. as the shared
//! store is unreachable), the error is logged and the worker is restarted after a delay which
//! doubles on every consecutive failure (from 1s up to 60s). Failures of a single item (missing
//! metadata or a failing web service) are logged by the worker itself and only drop that item.
//!
//! Once the platform terminates, each worker leaves its loop and performs its shutdown work:
//! the fetch worker waits for running web service calls and stops its adapters, the delivery
//! worker dispatches everything it has buffered. Note that the ingest and fetch worker leave
//! queued items behind, which is logged.
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use datastore::builder::Builder;
//! # use datastore::adapter::{ServiceAdapters, SimpleRestCollector};
//! # #[tokio::main]
//! # async fn main() {
//! let platform = Builder::new().enable_all().build().await;
//! let workers = datastore::workers::install(
//!     platform.clone(),
//!     Arc::new(ServiceAdapters::default()),
//!     Arc::new(SimpleRestCollector::new()),
//! );
//!
//! // Resolves once the platform has been terminated and all workers are done...
//! workers.join().await;
//! # }
//! ```
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapter::{AdapterFactory, CollectorAdapter};
use crate::metrics::Metrics;
use crate::platform::Platform;
use crate::settings::{Settings, SettingsHandle};
use crate::store::SharedStore;

mod assembly;
mod backoff;
mod delivery;
mod eviction;
mod fetch;
mod history;
mod ingest;
mod pool;

pub use assembly::{assemble, plan, try_assemble, Source};
pub use backoff::Backoff;
pub use delivery::{Buffered, DeliveryBuffer, DeliveryWorker};
pub use eviction::{select_victims, Candidate, EvictionWorker, Sweep};
pub use fetch::{FetchOutcome, FetchWorker};
pub use history::RequestHistory;
pub use ingest::IngestWorker;
pub use pool::TaskPool;

const MIN_RESTART_DELAY: Duration = Duration::from_secs(1);
const MAX_RESTART_DELAY: Duration = Duration::from_secs(60);

/// Bundles everything a worker needs to access.
#[derive(Clone)]
pub struct WorkerContext {
    /// The shared maps and queues.
    pub store: Arc<SharedStore>,
    /// The current settings.
    pub settings: Arc<SettingsHandle>,
    /// The registry to report statistics to.
    pub metrics: Arc<Metrics>,
    /// Cancelled once the node shuts down.
    pub shutdown: CancellationToken,
}

impl WorkerContext {
    /// Creates a new context.
    pub fn new(
        store: Arc<SharedStore>,
        settings: Arc<SettingsHandle>,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> Self {
        WorkerContext {
            store,
            settings,
            metrics,
            shutdown,
        }
    }

    /// Creates a context from the services registered in the given platform.
    ///
    /// The [SharedStore] has to be present. If no settings or metrics are registered, the
    /// defaults or a private registry are used.
    pub fn from_platform(platform: &Platform) -> Self {
        WorkerContext {
            store: platform.require::<SharedStore>(),
            settings: platform
                .find::<SettingsHandle>()
                .unwrap_or_else(|| Arc::new(SettingsHandle::new(Settings::default()))),
            metrics: platform
                .find::<Metrics>()
                .unwrap_or_else(|| Arc::new(Metrics::new())),
            shutdown: platform.shutdown_token(),
        }
    }

    /// Returns the current settings.
    pub fn settings(&self) -> Arc<Settings> {
        self.settings.current()
    }

    /// Determines if the node is still running.
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Sleeps for the given duration unless the node shuts down in the meantime.
    ///
    /// Returns **false** if the sleep was interrupted by a shutdown.
    pub async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// Describes a long running worker.
#[async_trait]
pub trait Worker: Send + 'static {
    /// Returns the name used in log messages.
    fn name(&self) -> &'static str;

    /// Performs the work until the node shuts down.
    ///
    /// An error terminates this run and makes the supervisor restart the worker.
    async fn run(&mut self) -> anyhow::Result<()>;

    /// Performs the shutdown work once [Worker::run] has returned for good.
    async fn finish(&mut self) -> anyhow::Result<()>;
}

/// Runs the given worker until the node shuts down, restarting it after failures.
pub async fn supervise<W: Worker>(mut worker: W, shutdown: CancellationToken) {
    let mut restart_delay = Backoff::new(MIN_RESTART_DELAY, MAX_RESTART_DELAY);

    log::info!("{} started.", worker.name());
    loop {
        match worker.run().await {
            Ok(()) => break,
            Err(error) => {
                log::error!("{} failed: {:#}", worker.name(), error);
                if shutdown.is_cancelled() {
                    break;
                }

                let delay = restart_delay.next_delay();
                log::info!(
                    "Restarting {} in {}...",
                    worker.name(),
                    crate::fmt::format_duration(delay)
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => (),
                }
            }
        }
    }

    if let Err(error) = worker.finish().await {
        log::error!("{} failed to shut down properly: {:#}", worker.name(), error);
    }
    log::info!("{} stopped.", worker.name());
}

/// Provides a handle to the running workers.
pub struct Workers {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Workers {
    /// Waits until all workers have stopped.
    ///
    /// Note that workers only stop once the platform has been terminated.
    pub async fn join(self) {
        for (name, handle) in self.handles {
            if let Err(error) = handle.await {
                log::error!("{} crashed: {}", name, error);
            }
        }
    }
}

fn spawn_worker<W: Worker>(
    worker: W,
    shutdown: CancellationToken,
) -> (&'static str, JoinHandle<()>) {
    (worker.name(), tokio::spawn(supervise(worker, shutdown)))
}

/// Starts all four workers for the given platform.
///
/// The platform has to provide a [SharedStore]. The given factory is used to create the adapters
/// for fetching value sets and the collector is used to deliver them.
pub fn install(
    platform: Arc<Platform>,
    adapter_factory: Arc<dyn AdapterFactory>,
    collector: Arc<dyn CollectorAdapter>,
) -> Workers {
    let context = WorkerContext::from_platform(&platform);

    Workers {
        handles: vec![
            spawn_worker(IngestWorker::new(context.clone()), context.shutdown.clone()),
            spawn_worker(
                FetchWorker::new(context.clone(), adapter_factory),
                context.shutdown.clone(),
            ),
            spawn_worker(EvictionWorker::new(context.clone()), context.shutdown.clone()),
            spawn_worker(
                DeliveryWorker::new(context.clone(), collector),
                context.shutdown.clone(),
            ),
        ],
    }
}
