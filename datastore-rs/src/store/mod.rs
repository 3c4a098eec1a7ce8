//! Provides the shared maps and queues through which the workers of a node cooperate.
//!
//! In a cluster these structures are partitioned across all nodes. A worker never cares about
//! this, as it only talks to the [SharedMap] and [SharedQueue] traits. What it does care about is
//! which entries are held **locally**, as both the eviction and the delivery only process the
//! entries owned by their own node (see [SharedMap::local_keys] and
//! [SharedMap::local_memory_cost]).
//!
//! This crate ships with a [LocalMap] and a [LocalQueue] which keep everything in the memory of
//! the current process. These are used by a standalone node and within all tests. Another
//! backend can be plugged in by implementing the traits and populating a [SharedStore].
//!
//! All operations are fallible, as a real grid backend might fail to reach its peers. The local
//! implementations never fail.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::data::{ElementSetEntry, ValueSetEntry, ValueSetRequestEntry, WebServiceEntry};
use crate::platform::Platform;

mod local_map;
mod local_queue;

pub use local_map::LocalMap;
pub use local_queue::LocalQueue;

/// Determines the effective memory footprint of a value.
///
/// The memory cost of a map entry is computed as length of its key plus the allocated size of
/// its value.
pub trait ByteSize {
    /// Returns the number of bytes allocated on the heap for this value.
    fn allocated_size(&self) -> usize;
}

/// Reports whether a stored value still has to be handed to a collector.
///
/// This is part of the bookkeeping data of an entry (see [EntryStats]), so that scans over a
/// map don't need to copy the values themselves.
pub trait UploadState {
    /// Determines if the value still needs to be uploaded.
    fn needs_upload(&self) -> bool {
        false
    }
}

/// Describes the bookkeeping data of a single map entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EntryStats {
    /// Changes with every write of the entry.
    ///
    /// This is used to only replace or remove an entry which hasn't been written in the
    /// meantime (see [SharedMap::replace] and [SharedMap::remove_if_unchanged]).
    pub version: u64,
    /// Assigned once when the entry is created and strictly increasing within a map. This
    /// orders entries which have been created within the same millisecond.
    pub sequence: u64,
    /// Determines if the stored value still needs to be uploaded (see [UploadState]).
    pub needs_upload: bool,
    /// The number of successful reads of this entry.
    pub hits: u64,
    /// The time this entry was first stored, in milliseconds on the store clock.
    pub creation_time: u64,
    /// The time which has elapsed since this entry was first stored.
    pub age: Duration,
    /// The memory cost of this entry in bytes.
    pub cost: usize,
}

/// Describes the bookkeeping data of a single map entry along with a copy of its value.
#[derive(Clone, Debug, PartialEq)]
pub struct EntryView<V> {
    /// A copy of the stored value.
    pub value: V,
    /// The bookkeeping data of the entry at the time the copy was made.
    pub stats: EntryStats,
}

/// Describes a string keyed map which is shared across all nodes of a cluster.
#[async_trait]
pub trait SharedMap<V>: Send + Sync
where
    V: Send + Sync + 'static,
{
    /// Reads the value stored for the given key.
    ///
    /// A successful read increments the hit counter of the entry.
    async fn get(&self, key: &str) -> anyhow::Result<Option<V>>;

    /// Determines if a value is stored for the given key without counting a hit.
    async fn contains_key(&self, key: &str) -> anyhow::Result<bool>;

    /// Stores the given value.
    ///
    /// Overwriting an entry retains its creation time, sequence and hit counter but assigns a
    /// new version.
    async fn put(&self, key: String, value: V) -> anyhow::Result<()>;

    /// Atomically replaces the value for the given key, if the entry still has the expected
    /// version.
    ///
    /// Returns **true** if the value was replaced or **false** if the entry was missing or has
    /// been written in the meantime.
    async fn replace(&self, key: &str, expected_version: u64, value: V) -> anyhow::Result<bool>;

    /// Removes the entry for the given key and returns its value, if present.
    async fn remove(&self, key: &str) -> anyhow::Result<Option<V>>;

    /// Atomically removes the entry for the given key, if it still has the expected version.
    ///
    /// Returns **true** if the entry was removed.
    async fn remove_if_unchanged(
        &self,
        key: &str,
        expected_version: u64,
    ) -> anyhow::Result<bool>;

    /// Returns a snapshot of the keys owned by this node.
    async fn local_keys(&self) -> anyhow::Result<Vec<String>>;

    /// Returns the bookkeeping data of the entry for the given key.
    ///
    /// Neither counts a hit nor copies the value.
    async fn entry_stats(&self, key: &str) -> anyhow::Result<Option<EntryStats>>;

    /// Returns a copy of the entry for the given key along with its bookkeeping data without
    /// counting a hit.
    async fn entry_view(&self, key: &str) -> anyhow::Result<Option<EntryView<V>>>;

    /// Returns the total memory cost (in bytes) of all entries owned by this node.
    async fn local_memory_cost(&self) -> anyhow::Result<usize>;
}

/// Describes a FIFO queue which is shared across all nodes of a cluster.
#[async_trait]
pub trait SharedQueue<T>: Send + Sync
where
    T: Send + 'static,
{
    /// Takes the next item from the queue, waiting up to the given timeout.
    ///
    /// Returns **None** if the queue remained empty for the whole timeout.
    async fn poll(&self, timeout: Duration) -> anyhow::Result<Option<T>>;

    /// Appends an item to the queue.
    ///
    /// Returns **false** if the queue is full and the item was rejected.
    async fn offer(&self, item: T) -> anyhow::Result<bool>;

    /// Returns the number of items currently in the queue.
    async fn len(&self) -> anyhow::Result<usize>;
}

/// Bundles all shared structures a node operates on.
///
/// This is registered in the [Platform] so that all workers can access the same instances.
#[derive(Clone)]
pub struct SharedStore {
    /// The cache of value sets, keyed by [ValueSetRequestEntry::key].
    pub value_sets: Arc<dyn SharedMap<ValueSetEntry>>,
    /// The element set metadata, keyed by element set id.
    pub element_sets: Arc<dyn SharedMap<ElementSetEntry>>,
    /// The web service metadata, keyed by web service id.
    pub web_services: Arc<dyn SharedMap<WebServiceEntry>>,
    /// Value sets which have been produced elsewhere and only need to be cached.
    pub raw_value_sets: Arc<dyn SharedQueue<ValueSetEntry>>,
    /// Value sets which have been requested and need to be obtained.
    pub value_set_requests: Arc<dyn SharedQueue<ValueSetRequestEntry>>,
}

impl SharedStore {
    /// Creates a store which keeps all data in the memory of this process.
    pub fn local(raw_queue_capacity: usize, request_queue_capacity: usize) -> Self {
        SharedStore {
            value_sets: Arc::new(LocalMap::new()),
            element_sets: Arc::new(LocalMap::new()),
            web_services: Arc::new(LocalMap::new()),
            raw_value_sets: Arc::new(LocalQueue::new(raw_queue_capacity)),
            value_set_requests: Arc::new(LocalQueue::new(request_queue_capacity)),
        }
    }
}

/// Creates a local store sized according to the current settings and registers it.
///
/// Note that the capacity of the queues is only read once. Changing it requires a restart.
pub fn install(platform: Arc<Platform>) -> Arc<SharedStore> {
    let (raw_queue_capacity, request_queue_capacity) =
        match platform.find::<crate::settings::SettingsHandle>() {
            Some(settings) => {
                let settings = settings.current();
                (
                    settings.raw_queue_capacity,
                    settings.request_queue_capacity,
                )
            }
            None => {
                let defaults = crate::settings::Settings::default();
                (
                    defaults.raw_queue_capacity,
                    defaults.request_queue_capacity,
                )
            }
        };

    let store = Arc::new(SharedStore::local(
        raw_queue_capacity,
        request_queue_capacity,
    ));
    platform.register::<SharedStore>(store.clone());

    store
}

/// Determines if the local part of the given map exceeds the given number of bytes.
///
/// This is used as admission gate by the ingest and fetch worker. A failure to determine the
/// cost is treated as "not exceeded" and logged, so that a flaky backend cannot stall a worker
/// forever.
pub async fn max_data_exceeded<V>(map: &dyn SharedMap<V>, max_memory: usize) -> bool
where
    V: Send + Sync + 'static,
{
    match map.local_memory_cost().await {
        Ok(cost) => cost > max_memory,
        Err(error) => {
            log::error!("Failed to determine the local memory cost: {:?}", error);
            false
        }
    }
}
