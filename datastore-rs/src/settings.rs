//! Provides a typed view of the config which is used by all workers.
//!
//! Reading the YAML config in an inner loop would be both, slow and error prone. Therefore the
//! relevant keys are parsed into [Settings] whenever the config file is loaded (see
//! [config](crate::config)). Workers obtain the current settings via [SettingsHandle::current]
//! at the start of each cycle, so that e.g. a changed memory limit or eviction threshold is
//! picked up without a restart.
//!
//! Note that some settings (the pool sizes, queue capacities and the metadata cache policy) are
//! only read when a worker starts. Changing these requires a restart.
//!
//! # Examples
//!
//! ```
//! # use datastore::settings::Settings;
//! let settings = Settings::parse("
//! store:
//!     max_memory: 512m
//! fetch:
//!     enable_assembly: true
//! ").unwrap();
//!
//! assert_eq!(settings.max_memory, 512 * 1024 * 1024);
//! assert_eq!(settings.enable_assembly, true);
//!
//! // Everything else is filled with defaults...
//! assert_eq!(settings.client_count, 16);
//! assert_eq!(settings.collector, "TestWebService");
//! ```
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use tokio::sync::broadcast::error::RecvError;
use yaml_rust::{Yaml, YamlLoader};

use crate::config::Config;
use crate::fmt::{parse_duration, parse_ratio, parse_size};
use crate::platform::Platform;

/// Contains the parsed settings of a node.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// The id of this node as reported in the statistics.
    pub node_id: i64,

    /// The maximal memory cost (in bytes) of the local part of the value set cache.
    pub max_memory: usize,
    /// The capacity of the in-process raw value set queue.
    pub raw_queue_capacity: usize,
    /// The capacity of the in-process request queue.
    pub request_queue_capacity: usize,

    /// The number of concurrent fetch and delivery tasks (also the depth of the request history).
    pub client_count: usize,
    /// The maximal time to wait for a queue item before re-checking the shutdown flag.
    pub poll_timeout: Duration,

    /// Determines if requested value sets may be assembled from cached ones.
    pub enable_assembly: bool,
    /// The time to pause the ingest or fetch worker if the cache is over its memory limit.
    pub capacity_delay: Duration,
    /// The time to pause the fetch worker if all fetch tasks are busy.
    pub saturation_delay: Duration,

    /// The period between two eviction sweeps.
    pub eviction_interval: Duration,
    /// The fill ratio (relative to **max_memory**) above which a sweep evicts entries.
    pub eviction_threshold: f64,
    /// The share of the current memory cost which is reclaimed by a sweep.
    pub reclaim_ratio: f64,

    /// The estimated encoded size (in bytes) at which a delivery batch is dispatched.
    pub packet_size: usize,
    /// The estimated encoded size of a single value.
    pub bytes_per_value: usize,
    /// The id of the web service which collects delivered value sets.
    pub collector: String,
    /// The initial pause of the delivery worker if no batch is ready.
    pub min_backoff: Duration,
    /// The maximal pause of the delivery worker if no batch is ready.
    pub max_backoff: Duration,
    /// The time to wait between two checks if all delivery tasks are busy.
    pub delivery_saturation_delay: Duration,

    /// The optional time to live of locally cached metadata.
    pub metadata_ttl: Option<Duration>,
    /// The optional maximal number of locally cached metadata entries per kind.
    pub metadata_max_entries: Option<usize>,

    /// The period in which the statistics are logged.
    pub metrics_report_interval: Duration,
    /// The file to which the statistics are written on shutdown.
    pub metrics_csv_file: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            node_id: 0,
            max_memory: 3 * 1024 * 1024 * 1024,
            raw_queue_capacity: 1024,
            request_queue_capacity: 1024,
            client_count: 16,
            poll_timeout: Duration::from_secs(60),
            enable_assembly: false,
            capacity_delay: Duration::from_secs(1),
            saturation_delay: Duration::from_millis(100),
            eviction_interval: Duration::from_secs(60),
            eviction_threshold: 0.90,
            reclaim_ratio: 0.10,
            packet_size: 11 * 1024 * 1024,
            bytes_per_value: 49,
            collector: "TestWebService".to_owned(),
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            delivery_saturation_delay: Duration::from_secs(2),
            metadata_ttl: None,
            metadata_max_entries: None,
            metrics_report_interval: Duration::from_secs(60),
            metrics_csv_file: "statistics.csv".to_owned(),
        }
    }
}

impl Settings {
    /// Parses the settings from the given YAML document.
    ///
    /// Missing keys are filled with their defaults. An invalid value results in an error.
    pub fn parse(data: &str) -> anyhow::Result<Settings> {
        let mut documents =
            YamlLoader::load_from_str(data).context("Cannot parse the YAML data")?;
        let document = if documents.is_empty() {
            Yaml::Null
        } else {
            documents.swap_remove(0)
        };

        match document {
            Yaml::Hash(_) | Yaml::Null => Settings::from_yaml(&document),
            _ => Err(anyhow::anyhow!("The settings must be a map of keys and values.")),
        }
    }

    fn from_yaml(doc: &Yaml) -> anyhow::Result<Settings> {
        let defaults = Settings::default();

        let settings = Settings {
            node_id: read_int(doc, "node.id", defaults.node_id)?,
            max_memory: read_size(doc, "store.max_memory", defaults.max_memory)?,
            raw_queue_capacity: read_count(
                doc,
                "store.raw_queue_capacity",
                defaults.raw_queue_capacity,
            )?,
            request_queue_capacity: read_count(
                doc,
                "store.request_queue_capacity",
                defaults.request_queue_capacity,
            )?,
            client_count: read_count(doc, "workers.client_count", defaults.client_count)?,
            poll_timeout: read_duration(doc, "workers.poll_timeout", defaults.poll_timeout)?,
            enable_assembly: read_bool(
                doc,
                "fetch.enable_assembly",
                defaults.enable_assembly,
            )?,
            capacity_delay: read_duration(
                doc,
                "fetch.capacity_delay",
                defaults.capacity_delay,
            )?,
            saturation_delay: read_duration(
                doc,
                "fetch.saturation_delay",
                defaults.saturation_delay,
            )?,
            eviction_interval: read_duration(
                doc,
                "eviction.interval",
                defaults.eviction_interval,
            )?,
            eviction_threshold: read_ratio(
                doc,
                "eviction.threshold",
                defaults.eviction_threshold,
            )?,
            reclaim_ratio: read_ratio(doc, "eviction.reclaim_ratio", defaults.reclaim_ratio)?,
            packet_size: read_size(doc, "delivery.packet_size", defaults.packet_size)?,
            bytes_per_value: read_size(
                doc,
                "delivery.bytes_per_value",
                defaults.bytes_per_value,
            )?,
            collector: read_string(doc, "delivery.collector", &defaults.collector)?,
            min_backoff: read_duration(doc, "delivery.min_backoff", defaults.min_backoff)?,
            max_backoff: read_duration(doc, "delivery.max_backoff", defaults.max_backoff)?,
            delivery_saturation_delay: read_duration(
                doc,
                "delivery.saturation_delay",
                defaults.delivery_saturation_delay,
            )?,
            metadata_ttl: read_optional(doc, "metadata.ttl", |value| {
                read_duration_value(value, "metadata.ttl")
            })?,
            metadata_max_entries: read_optional(doc, "metadata.max_entries", |value| {
                read_count_value(value, "metadata.max_entries")
            })?,
            metrics_report_interval: read_duration(
                doc,
                "metrics.report_interval",
                defaults.metrics_report_interval,
            )?,
            metrics_csv_file: read_string(
                doc,
                "metrics.csv_file",
                &defaults.metrics_csv_file,
            )?,
        };

        settings.verify()?;

        Ok(settings)
    }

    fn verify(&self) -> anyhow::Result<()> {
        if self.client_count == 0 {
            return Err(anyhow::anyhow!("workers.client_count must be at least 1."));
        }
        if self.bytes_per_value == 0 {
            return Err(anyhow::anyhow!(
                "delivery.bytes_per_value must be at least 1."
            ));
        }
        if self.min_backoff > self.max_backoff {
            return Err(anyhow::anyhow!(
                "delivery.min_backoff must not be larger than delivery.max_backoff."
            ));
        }

        Ok(())
    }
}

fn query<'a>(doc: &'a Yaml, path: &str) -> &'a Yaml {
    path.split('.').fold(doc, |node, key| &node[key])
}

fn read_optional<T>(
    doc: &Yaml,
    key: &str,
    parser: impl FnOnce(&Yaml) -> anyhow::Result<T>,
) -> anyhow::Result<Option<T>> {
    match query(doc, key) {
        Yaml::BadValue | Yaml::Null => Ok(None),
        value => parser(value).map(Some),
    }
}

fn read_int(doc: &Yaml, key: &str, default: i64) -> anyhow::Result<i64> {
    Ok(read_optional(doc, key, |value| {
        value
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("{} must be an integer.", key))
    })?
    .unwrap_or(default))
}

fn read_bool(doc: &Yaml, key: &str, default: bool) -> anyhow::Result<bool> {
    Ok(read_optional(doc, key, |value| {
        value
            .as_bool()
            .ok_or_else(|| anyhow::anyhow!("{} must be either true or false.", key))
    })?
    .unwrap_or(default))
}

fn read_string(doc: &Yaml, key: &str, default: &str) -> anyhow::Result<String> {
    Ok(read_optional(doc, key, |value| match value {
        Yaml::String(string) => Ok(string.clone()),
        Yaml::Integer(number) => Ok(number.to_string()),
        _ => Err(anyhow::anyhow!("{} must be a string.", key)),
    })?
    .unwrap_or_else(|| default.to_owned()))
}

fn read_count(doc: &Yaml, key: &str, default: usize) -> anyhow::Result<usize> {
    Ok(read_optional(doc, key, |value| read_count_value(value, key))?.unwrap_or(default))
}

fn read_count_value(value: &Yaml, key: &str) -> anyhow::Result<usize> {
    value
        .as_i64()
        .and_then(|number| usize::try_from(number).ok())
        .ok_or_else(|| anyhow::anyhow!("{} must be a positive integer.", key))
}

fn read_size(doc: &Yaml, key: &str, default: usize) -> anyhow::Result<usize> {
    Ok(read_optional(doc, key, |value| match value {
        Yaml::String(size) => parse_size(size).with_context(|| format!("Invalid {}", key)),
        _ => read_count_value(value, key),
    })?
    .unwrap_or(default))
}

fn read_duration(doc: &Yaml, key: &str, default: Duration) -> anyhow::Result<Duration> {
    Ok(read_optional(doc, key, |value| read_duration_value(value, key))?.unwrap_or(default))
}

fn read_duration_value(value: &Yaml, key: &str) -> anyhow::Result<Duration> {
    match value {
        Yaml::String(duration) => {
            parse_duration(duration).with_context(|| format!("Invalid {}", key))
        }
        _ => read_count_value(value, key).map(|millis| Duration::from_millis(millis as u64)),
    }
}

fn read_ratio(doc: &Yaml, key: &str, default: f64) -> anyhow::Result<f64> {
    Ok(read_optional(doc, key, |value| {
        let ratio = match value {
            Yaml::Real(ratio) | Yaml::String(ratio) => ratio.clone(),
            Yaml::Integer(ratio) => ratio.to_string(),
            _ => return Err(anyhow::anyhow!("{} must be a ratio like 0.9 or 90%.", key)),
        };
        parse_ratio(ratio).with_context(|| format!("Invalid {}", key))
    })?
    .unwrap_or(default))
}

/// Provides access to the current [Settings] of a node.
///
/// This is registered in the [Platform] by [install] and updated whenever the config changes.
pub struct SettingsHandle {
    current: ArcSwap<Settings>,
}

impl SettingsHandle {
    /// Creates a handle which serves the given settings.
    pub fn new(settings: impl Into<Arc<Settings>>) -> Self {
        SettingsHandle {
            current: ArcSwap::new(settings.into()),
        }
    }

    /// Returns the currently active settings.
    ///
    /// The returned settings are a snapshot and will not reflect later config changes.
    pub fn current(&self) -> Arc<Settings> {
        self.current.load_full()
    }

    /// Replaces the active settings.
    pub fn update(&self, settings: impl Into<Arc<Settings>>) {
        self.current.store(settings.into());
    }
}

/// Creates and installs a [SettingsHandle] for the given platform.
///
/// If a [Config] is present, the handle starts with its settings and follows every change.
/// Otherwise the defaults are used.
pub fn install(platform: Arc<Platform>) -> Arc<SettingsHandle> {
    let config = platform.find::<Config>();
    let handle = Arc::new(match &config {
        Some(config) => SettingsHandle::new(config.settings()),
        None => SettingsHandle::new(Settings::default()),
    });
    platform.register::<SettingsHandle>(handle.clone());

    if let Some(config) = config {
        let settings = handle.clone();
        let mut changes = config.subscribe();
        let shutdown = platform.shutdown_token();
        let _ = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    change = changes.recv() => match change {
                        Ok(changed) => settings.update(changed),
                        Err(RecvError::Lagged(_)) => settings.update(config.settings()),
                        Err(RecvError::Closed) => return,
                    }
                }
            }
        });
    }

    handle
}
