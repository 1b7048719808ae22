//! Owning registries keyed by id.
//!
//! Sessions are kept by remote peer id and transferers by transfer id.
//! Components hand each other ids, never direct references, so nothing
//! forms an ownership cycle.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};
use tracing::warn;

pub struct Registry<K, V> {
    entries: RwLock<HashMap<K, Arc<V>>>,
}

impl<K, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value`, returning whatever was registered under `key` before.
    pub fn insert(&self, key: K, value: Arc<V>) -> Option<Arc<V>> {
        match self.entries.write() {
            Ok(mut map) => map.insert(key, value),
            Err(_) => {
                warn!(event = "registry_poisoned", op = "insert");
                None
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.entries.read().ok()?.get(key).cloned()
    }

    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.entries.write().ok()?.remove(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries
            .read()
            .map(|map| map.contains_key(key))
            .unwrap_or(false)
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the entry for `key`, creating it with `make` when absent.
    pub fn get_or_insert_with<F>(&self, key: K, make: F) -> Option<Arc<V>>
    where
        F: FnOnce() -> V,
    {
        let mut map = self.entries.write().ok()?;
        Some(map.entry(key).or_insert_with(|| Arc::new(make())).clone())
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<(K, Arc<V>)> {
        self.entries
            .write()
            .map(|mut map| map.drain().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let reg: Registry<String, u32> = Registry::new();
        assert!(reg.insert("a".into(), Arc::new(1)).is_none());
        assert_eq!(reg.insert("a".into(), Arc::new(2)).as_deref(), Some(&1));
        assert_eq!(reg.get(&"a".into()).as_deref(), Some(&2));
        assert!(reg.contains(&"a".into()));
        assert_eq!(reg.remove(&"a".into()).as_deref(), Some(&2));
        assert!(reg.is_empty());
    }

    #[test]
    fn get_or_insert_reuses_existing() {
        let reg: Registry<u32, String> = Registry::new();
        let first = reg.get_or_insert_with(7, || "x".into()).unwrap();
        let second = reg.get_or_insert_with(7, || "y".into()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(reg.drain().len(), 1);
        assert_eq!(reg.len(), 0);
    }
}
