use linked_hash_map::LinkedHashMap;

/// Remembers the keys of the most recently handled requests.
///
/// This is used by the fetch worker to drop requests which are either in flight or have just
/// been served. Once more than **capacity** keys have been remembered, the oldest one is
/// forgotten and the respective request becomes eligible again.
pub struct RequestHistory {
    capacity: usize,
    keys: LinkedHashMap<String, ()>,
}

impl RequestHistory {
    /// Creates a new history which remembers up to **capacity** keys.
    pub fn new(capacity: usize) -> Self {
        RequestHistory {
            capacity: capacity.max(1),
            keys: LinkedHashMap::with_capacity(capacity.max(1) + 1),
        }
    }

    /// Determines if the given key is among the most recent ones.
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    /// Remembers the given key as most recent one.
    pub fn remember(&mut self, key: String) {
        let _ = self.keys.remove(&key);
        let _ = self.keys.insert(key, ());
        while self.keys.len() > self.capacity {
            let _ = self.keys.pop_front();
        }
    }

    /// Returns the remembered keys, most recent first.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().rev().map(String::as_str)
    }

    /// Returns the number of remembered keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Determines if no keys are remembered.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
