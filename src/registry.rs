//! String-keyed plugin registries.
//!
//! Components that are wired up by name at startup — transports,
//! serializers, database drivers, applications, actions — all share the
//! same registration discipline: first write wins, a duplicate key is a
//! configuration error, and lookups after startup are read-only and
//! thread-safe. The process-wide instances live next to their users;
//! tests build their own `Registry` and wire it explicitly.

use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::RwLock;

/// A write-once-per-key table.
#[derive(Debug)]
pub struct Registry<T: Clone> {
    entries: RwLock<HashMap<String, T>>,
}

impl<T: Clone> Default for Registry<T> {
    fn default() -> Self {
        Registry::new()
    }
}

impl<T: Clone> Registry<T> {
    pub fn new() -> Self {
        Registry {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register `value` under `key`. The first registration wins;
    /// re-registering an existing key is an error.
    pub fn register(&self, key: impl Into<String>, value: T) -> Result<()> {
        let key = key.into();
        let mut entries = self.entries.write().unwrap();
        if entries.contains_key(&key) {
            return Err(Error::Config(format!(
                "`{key}` is already registered"
            )));
        }
        entries.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.entries.read().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().unwrap().contains_key(key)
    }

    /// Remove an entry, returning it. Registries are write-once per
    /// key, so removal is reserved for teardown paths.
    pub fn remove(&self, key: &str) -> Option<T> {
        self.entries.write().unwrap().remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.entries.read().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Visit every entry, key-ordered.
    pub fn for_each(&self, mut visit: impl FnMut(&str, &T)) {
        let entries = self.entries.read().unwrap();
        let mut keys: Vec<_> = entries.keys().collect();
        keys.sort();
        for key in keys {
            visit(key, &entries[key]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_write_wins() {
        let registry: Registry<u32> = Registry::new();
        registry.register("a", 1).unwrap();
        assert!(registry.register("a", 2).is_err());
        assert_eq!(registry.get("a"), Some(1));
    }

    #[test]
    fn test_lookup_missing() {
        let registry: Registry<u32> = Registry::new();
        assert_eq!(registry.get("nope"), None);
        assert!(!registry.contains("nope"));
    }

    #[test]
    fn test_for_each_ordered() {
        let registry: Registry<&'static str> = Registry::new();
        registry.register("b", "two").unwrap();
        registry.register("a", "one").unwrap();
        let mut seen = Vec::new();
        registry.for_each(|k, v| seen.push((k.to_string(), *v)));
        assert_eq!(seen, [("a".into(), "one"), ("b".into(), "two")]);
    }
}
