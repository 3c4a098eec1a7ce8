#[cfg(test)]
use mock_instant::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::store::{ByteSize, EntryStats, EntryView, SharedMap, UploadState};

struct Slot<V> {
    value: V,
    version: u64,
    sequence: u64,
    hits: u64,
    created: Instant,
    cost: usize,
}

struct Entries<V> {
    slots: HashMap<String, Slot<V>>,
    memory_cost: usize,
    next_version: u64,
    next_sequence: u64,
}

/// Provides a [SharedMap] which keeps all entries in the memory of the current process.
///
/// As there is only a single node, all keys are local keys. Each entry records its memory cost
/// (the length of its key plus [ByteSize::allocated_size] of its value), its creation time and
/// the number of reads. Versions and sequences are drawn from counters of the map, so each write
/// yields a version which has never been used for any entry of this map.
///
/// # Examples
///
/// ```
/// # use datastore::store::{LocalMap, SharedMap};
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let map = LocalMap::<datastore::data::ElementSetEntry>::new();
/// let gauges = datastore::data::ElementSetEntry::new("gauges", vec!["a".to_owned()]);
/// map.put("gauges".to_owned(), gauges.clone()).await?;
///
/// assert_eq!(map.get("gauges").await?, Some(gauges));
/// assert_eq!(map.entry_stats("gauges").await?.unwrap().hits, 1);
/// assert_eq!(map.local_keys().await?, vec!["gauges".to_owned()]);
/// # Ok(())
/// # }
/// ```
pub struct LocalMap<V> {
    epoch: Instant,
    entries: Mutex<Entries<V>>,
}

impl<V> Default for LocalMap<V> {
    fn default() -> Self {
        LocalMap {
            epoch: Instant::now(),
            entries: Mutex::new(Entries {
                slots: HashMap::new(),
                memory_cost: 0,
                next_version: 0,
                next_sequence: 0,
            }),
        }
    }
}

impl<V> LocalMap<V> {
    /// Creates a new and empty map.
    pub fn new() -> Self {
        LocalMap::default()
    }

    /// Returns the number of entries in the map.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().slots.len()
    }

    /// Determines if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: UploadState> LocalMap<V> {
    fn stats_of(&self, slot: &Slot<V>) -> EntryStats {
        EntryStats {
            version: slot.version,
            sequence: slot.sequence,
            needs_upload: slot.value.needs_upload(),
            hits: slot.hits,
            creation_time: slot
                .created
                .checked_duration_since(self.epoch)
                .unwrap_or_default()
                .as_millis() as u64,
            age: age_of(slot.created),
            cost: slot.cost,
        }
    }
}

fn age_of(created: Instant) -> Duration {
    Instant::now()
        .checked_duration_since(created)
        .unwrap_or_default()
}

#[async_trait]
impl<V> SharedMap<V> for LocalMap<V>
where
    V: ByteSize + UploadState + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> anyhow::Result<Option<V>> {
        let mut entries = self.entries.lock().unwrap();
        Ok(entries.slots.get_mut(key).map(|slot| {
            slot.hits += 1;
            slot.value.clone()
        }))
    }

    async fn contains_key(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.entries.lock().unwrap().slots.contains_key(key))
    }

    async fn put(&self, key: String, value: V) -> anyhow::Result<()> {
        let cost = key.len() + value.allocated_size();
        let mut guard = self.entries.lock().unwrap();
        let entries = &mut *guard;
        entries.next_version += 1;

        match entries.slots.get_mut(&key) {
            Some(slot) => {
                entries.memory_cost = entries.memory_cost - slot.cost + cost;
                slot.value = value;
                slot.version = entries.next_version;
                slot.cost = cost;
            }
            None => {
                entries.next_sequence += 1;
                entries.memory_cost += cost;
                let _ = entries.slots.insert(
                    key,
                    Slot {
                        value,
                        version: entries.next_version,
                        sequence: entries.next_sequence,
                        hits: 0,
                        created: Instant::now(),
                        cost,
                    },
                );
            }
        }

        Ok(())
    }

    async fn replace(&self, key: &str, expected_version: u64, value: V) -> anyhow::Result<bool> {
        let cost = key.len() + value.allocated_size();
        let mut guard = self.entries.lock().unwrap();
        let entries = &mut *guard;

        match entries.slots.get_mut(key) {
            Some(slot) if slot.version == expected_version => {
                entries.next_version += 1;
                entries.memory_cost = entries.memory_cost - slot.cost + cost;
                slot.value = value;
                slot.version = entries.next_version;
                slot.cost = cost;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, key: &str) -> anyhow::Result<Option<V>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.slots.remove(key) {
            Some(slot) => {
                entries.memory_cost -= slot.cost;
                Ok(Some(slot.value))
            }
            None => Ok(None),
        }
    }

    async fn remove_if_unchanged(
        &self,
        key: &str,
        expected_version: u64,
    ) -> anyhow::Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        match entries.slots.get(key) {
            Some(slot) if slot.version == expected_version => (),
            _ => return Ok(false),
        }

        if let Some(slot) = entries.slots.remove(key) {
            entries.memory_cost -= slot.cost;
        }

        Ok(true)
    }

    async fn local_keys(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.entries.lock().unwrap().slots.keys().cloned().collect())
    }

    async fn entry_stats(&self, key: &str) -> anyhow::Result<Option<EntryStats>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.slots.get(key).map(|slot| self.stats_of(slot)))
    }

    async fn entry_view(&self, key: &str) -> anyhow::Result<Option<EntryView<V>>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.slots.get(key).map(|slot| EntryView {
            value: slot.value.clone(),
            stats: self.stats_of(slot),
        }))
    }

    async fn local_memory_cost(&self) -> anyhow::Result<usize> {
        Ok(self.entries.lock().unwrap().memory_cost)
    }
}
