//! Provides a worker-local read-through cache for reference data.
//!
//! Element sets and web service descriptors are read very often but change rarely. Therefore
//! each worker keeps local copies which are loaded from the shared store on the first miss.
//!
//! There is no invalidation channel, so a copy might become stale. How long a copy is trusted
//! is a policy of the cache: an optional **ttl** expires entries after a while and an optional
//! **max_entries** bounds the cache by dropping the oldest copies. If neither is set, a copy is
//! kept for the lifetime of the worker.
//!
//! Misses are not remembered, so that metadata which appears later is picked up.
#[cfg(test)]
use mock_instant::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::sync::Arc;
use std::time::Duration;

use linked_hash_map::LinkedHashMap;

use crate::store::SharedMap;

/// Caches copies of the entries of a shared metadata map.
pub struct MetadataCache<T> {
    source: Arc<dyn SharedMap<T>>,
    entries: LinkedHashMap<String, (Arc<T>, Instant)>,
    ttl: Option<Duration>,
    max_entries: Option<usize>,
}

impl<T> MetadataCache<T>
where
    T: Send + Sync + 'static,
{
    /// Creates a cache which never invalidates its copies.
    pub fn new(source: Arc<dyn SharedMap<T>>) -> Self {
        MetadataCache::with_policy(source, None, None)
    }

    /// Creates a cache with the given eviction policy.
    pub fn with_policy(
        source: Arc<dyn SharedMap<T>>,
        ttl: Option<Duration>,
        max_entries: Option<usize>,
    ) -> Self {
        MetadataCache {
            source,
            entries: LinkedHashMap::new(),
            ttl,
            max_entries,
        }
    }

    /// Returns the entry with the given id, loading it from the shared map if required.
    ///
    /// Returns **None** if the shared map has no such entry and an error if the shared map
    /// couldn't be queried.
    pub async fn lookup(&mut self, id: &str) -> anyhow::Result<Option<Arc<T>>> {
        if let Some((entry, loaded)) = self.entries.get(id) {
            if !self.is_expired(loaded) {
                return Ok(Some(entry.clone()));
            }

            let _ = self.entries.remove(id);
        }

        match self.source.get(id).await? {
            Some(entry) => {
                let entry = Arc::new(entry);
                let _ = self
                    .entries
                    .insert(id.to_owned(), (entry.clone(), Instant::now()));
                self.enforce_max_entries();

                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Iterates over all cached copies which haven't expired yet, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<T>)> {
        self.entries
            .iter()
            .filter(move |(_, (_, loaded))| !self.is_expired(loaded))
            .map(|(id, (entry, _))| (id.as_str(), entry))
    }

    /// Returns the number of cached copies (including expired ones which haven't been purged).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Determines if no copies are cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_expired(&self, loaded: &Instant) -> bool {
        match self.ttl {
            Some(ttl) => loaded.elapsed() > ttl,
            None => false,
        }
    }

    fn enforce_max_entries(&mut self) {
        if let Some(max_entries) = self.max_entries {
            while self.entries.len() > max_entries {
                let _ = self.entries.pop_front();
            }
        }
    }
}
