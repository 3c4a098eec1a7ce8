//! Records the performance statistics of a node.
//!
//! Every worker reports what it did (e.g. the number of fetched values or the duration of a
//! delivery) into a shared [Metrics] registry. For each statistic, the sum and the number of
//! recorded values is kept, so that the mean can be derived.
//!
//! The registry is periodically logged by a reporter task and written as CSV file when the node
//! shuts down. Each row contains the node id, the name of the statistic, its sum, mean and count.
//!
//! # Examples
//!
//! ```
//! # use datastore::metrics::Metrics;
//! let metrics = Metrics::new();
//! metrics.add("fetch.values", 10.);
//! metrics.add("fetch.values", 30.);
//!
//! let statistic = metrics.get("fetch.values");
//! assert_eq!(statistic.sum(), 40.);
//! assert_eq!(statistic.mean(), 20.);
//! assert_eq!(statistic.count(), 2);
//!
//! assert_eq!(
//!     metrics.to_csv(3).unwrap(),
//!     "node,name,sum,mean,count\n3,fetch.values,40,20,2\n"
//! );
//! ```
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use fnv::FnvHashMap;

use crate::platform::Platform;
use crate::settings::SettingsHandle;

/// Counts the value sets put into the cache by the ingest worker.
pub const INGESTED_VALUE_SETS: &str = "ingest.value_sets";
/// Records how long the ingest or fetch worker paused as the cache was full (in ms).
pub const ADMISSION_WAITS: &str = "admission.wait_ms";
/// Counts requests which were dropped as they were recently handled.
pub const DEDUP_DROPS: &str = "fetch.dedup_drops";
/// Counts value sets which were assembled from cached ones.
pub const ASSEMBLED_VALUE_SETS: &str = "fetch.assembled_value_sets";
/// Records the duration of each call to a fetch adapter (in ms).
pub const FETCH_CALLS: &str = "fetch.call_ms";
/// Counts value sets which were obtained by a fetch adapter.
pub const FETCH_VALUE_SETS: &str = "fetch.value_sets";
/// Counts the values which were obtained by a fetch adapter.
pub const FETCH_VALUES: &str = "fetch.values";
/// Counts requests which failed (missing metadata, adapter errors).
pub const FETCH_FAILURES: &str = "fetch.failures";
/// Records the duration of each gather cycle of the delivery worker (in ms).
pub const GATHER_DURATION: &str = "delivery.gather_ms";
/// Records how long a value set waited in the delivery buffer (in ms).
pub const BUFFER_RESIDENCE: &str = "delivery.buffer_ms";
/// Records the time from creating a value set until it was handed to the collector (in ms).
pub const END_TO_END: &str = "delivery.end_to_end_ms";
/// Records the duration of each call to the collector (in ms).
pub const DELIVERY_CALLS: &str = "delivery.call_ms";
/// Counts delivered value sets.
pub const DELIVERY_VALUE_SETS: &str = "delivery.value_sets";
/// Counts delivered values.
pub const DELIVERY_VALUES: &str = "delivery.values";
/// Counts batches which could not be delivered.
pub const DELIVERY_FAILURES: &str = "delivery.failures";
/// Counts the value sets removed by the eviction worker.
pub const EVICTED_VALUE_SETS: &str = "eviction.value_sets";
/// Records the number of bytes reclaimed by each eviction sweep.
pub const EVICTED_BYTES: &str = "eviction.bytes";

/// Represents the accumulated values of a single statistic.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Statistic {
    sum: f64,
    count: u64,
}

impl Statistic {
    /// Returns the sum of all recorded values.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Returns the number of recorded values.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Returns the mean of all recorded values or 0 if none were recorded.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Provides a thread-safe registry of statistics.
#[derive(Default)]
pub struct Metrics {
    statistics: Mutex<FnvHashMap<String, Statistic>>,
}

impl Metrics {
    /// Creates a new and empty registry.
    pub fn new() -> Self {
        Metrics::default()
    }

    /// Records a value for the given statistic.
    pub fn add(&self, name: &str, value: f64) {
        let mut statistics = self.statistics.lock().unwrap();
        if let Some(statistic) = statistics.get_mut(name) {
            statistic.sum += value;
            statistic.count += 1;
        } else {
            let _ = statistics.insert(name.to_owned(), Statistic { sum: value, count: 1 });
        }
    }

    /// Records the given duration in milliseconds.
    pub fn add_duration(&self, name: &str, duration: Duration) {
        self.add(name, duration.as_secs_f64() * 1000.);
    }

    /// Returns the current state of the given statistic.
    pub fn get(&self, name: &str) -> Statistic {
        self.statistics
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    /// Returns all statistics sorted by name.
    pub fn snapshot(&self) -> Vec<(String, Statistic)> {
        let mut result: Vec<(String, Statistic)> = self
            .statistics
            .lock()
            .unwrap()
            .iter()
            .map(|(name, statistic)| (name.clone(), *statistic))
            .collect();
        result.sort_by(|(left, _), (right, _)| left.cmp(right));

        result
    }

    /// Renders all statistics as CSV.
    pub fn to_csv(&self, node_id: i64) -> anyhow::Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        self.write_records(node_id, &mut writer)?;
        let data = writer
            .into_inner()
            .map_err(|error| anyhow::anyhow!("Failed to render statistics: {}", error))?;

        Ok(String::from_utf8(data)?)
    }

    /// Writes all statistics as CSV into the given file.
    pub fn write_csv(&self, node_id: i64, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_path(path.as_ref()).with_context(|| {
            format!(
                "Failed to create statistics file {}",
                path.as_ref().to_string_lossy()
            )
        })?;
        self.write_records(node_id, &mut writer)?;
        writer.flush().context("Failed to write statistics file")?;

        Ok(())
    }

    fn write_records<W: std::io::Write>(
        &self,
        node_id: i64,
        writer: &mut csv::Writer<W>,
    ) -> anyhow::Result<()> {
        writer.write_record(["node", "name", "sum", "mean", "count"])?;
        let node_id = node_id.to_string();
        for (name, statistic) in self.snapshot() {
            writer.write_record(&[
                node_id.clone(),
                name,
                statistic.sum().to_string(),
                statistic.mean().to_string(),
                statistic.count().to_string(),
            ])?;
        }

        Ok(())
    }

    fn report(&self) {
        for (name, statistic) in self.snapshot() {
            log::info!(
                "{}: sum={:.2} mean={:.2} count={}",
                name,
                statistic.sum(),
                statistic.mean(),
                statistic.count()
            );
        }
    }
}

/// Creates and installs a [Metrics] registry along with a task which logs it periodically.
pub fn install(platform: Arc<Platform>) -> Arc<Metrics> {
    let metrics = Arc::new(Metrics::new());
    platform.register::<Metrics>(metrics.clone());

    let settings = platform.find::<SettingsHandle>();
    let shutdown = platform.shutdown_token();
    let reporter = metrics.clone();
    let _ = tokio::spawn(async move {
        loop {
            let interval = settings
                .as_ref()
                .map(|settings| settings.current().metrics_report_interval)
                .unwrap_or_else(|| Duration::from_secs(60));

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => reporter.report(),
            }
        }
    });

    metrics
}
