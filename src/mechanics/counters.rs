//! Monotonic per-session counters.

use super::Id;
use crate::registry::Registry;
use crate::{Error, Result, SObj, SVal};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

/// Immutable definition of a counter.
#[derive(Debug)]
pub struct CounterConfig {
    pub id: Id,
}

/// Write-once table of counter definitions.
#[derive(Debug, Default)]
pub struct CounterManager {
    configs: Registry<Arc<CounterConfig>>,
}

impl CounterManager {
    pub fn new() -> Self {
        CounterManager::default()
    }

    pub fn define(&self, id: impl Into<Id>) -> Result<()> {
        let id = id.into();
        self.configs
            .register(id.clone(), Arc::new(CounterConfig { id }))
    }

    pub fn get(&self, id: &str) -> Option<Arc<CounterConfig>> {
        self.configs.get(id)
    }
}

static GLOBAL: LazyLock<CounterManager> = LazyLock::new(CounterManager::new);

pub fn counter_manager() -> &'static CounterManager {
    &GLOBAL
}

/// A live counter instance.
#[derive(Debug)]
pub struct Counter {
    pub id: Id,
    _config: Arc<CounterConfig>,
    value: u64,
    changed: bool,
}

impl Counter {
    fn new(manager: &CounterManager, id: &str, value: u64) -> Result<Counter> {
        let config = manager
            .get(id)
            .ok_or_else(|| Error::Config(format!("not found config for counter `{id}`")))?;
        Ok(Counter {
            id: id.to_string(),
            _config: config,
            value,
            changed: false,
        })
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Add `delta`; zero deltas change nothing.
    pub fn increase(&mut self, delta: u64) -> bool {
        if delta == 0 {
            return false;
        }
        self.value += delta;
        self.changed = true;
        true
    }

    /// Raise the counter to `value` if it is below it.
    pub fn increase_upto(&mut self, value: u64) -> bool {
        if value <= self.value {
            return false;
        }
        self.increase(value - self.value)
    }

    pub fn in_default_state(&self) -> bool {
        self.value == 0
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn set_changed(&mut self, changed: bool) {
        self.changed = changed;
    }

    pub fn serialize(&self) -> SObj {
        let mut data = SObj::new();
        data.emplace("id", self.id.as_str());
        data.emplace("value", self.value);
        data
    }
}

/// Per-session set of counters.
#[derive(Debug)]
pub struct CounterContainer {
    manager: &'static CounterManager,
    counters: HashMap<Id, Counter>,
    changed: bool,
}

impl Default for CounterContainer {
    fn default() -> Self {
        CounterContainer::new()
    }
}

impl CounterContainer {
    pub fn new() -> Self {
        CounterContainer::with_manager(counter_manager())
    }

    pub fn with_manager(manager: &'static CounterManager) -> Self {
        CounterContainer {
            manager,
            counters: HashMap::new(),
            changed: false,
        }
    }

    fn ensure(&mut self, id: &str) -> Result<&mut Counter> {
        match self.counters.entry(id.to_string()) {
            std::collections::hash_map::Entry::Occupied(entry) => Ok(entry.into_mut()),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let counter = Counter::new(self.manager, id, 0)?;
                Ok(entry.insert(counter))
            }
        }
    }

    pub fn value(&self, id: &str) -> u64 {
        self.counters.get(id).map(Counter::value).unwrap_or(0)
    }

    pub fn increase(&mut self, id: &str, delta: u64) -> Result<bool> {
        let changed = self.ensure(id)?.increase(delta);
        self.changed |= changed;
        Ok(changed)
    }

    pub fn increase_upto(&mut self, id: &str, value: u64) -> Result<bool> {
        let changed = self.ensure(id)?.increase_upto(value);
        self.changed |= changed;
        Ok(changed)
    }

    /// Restore a stored value without marking anything dirty.
    pub fn load(&mut self, id: &str, value: u64) -> Result<()> {
        let counter = Counter::new(self.manager, id, value)?;
        self.counters.insert(id.to_string(), counter);
        Ok(())
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Clear the dirty flags after a successful save.
    pub fn mark_saved(&mut self) {
        self.changed = false;
        for counter in self.counters.values_mut() {
            counter.set_changed(false);
        }
    }

    /// Serialize every non-default counter.
    pub fn serialize(&self) -> SVal {
        let items: Vec<SVal> = self
            .counters
            .values()
            .filter(|counter| !counter.in_default_state())
            .map(|counter| SVal::Object(counter.serialize()))
            .collect();
        SVal::Array(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> &'static CounterManager {
        static M: LazyLock<CounterManager> = LazyLock::new(|| {
            let manager = CounterManager::new();
            manager.define("games_played").unwrap();
            manager.define("gold_earned").unwrap();
            manager
        });
        &M
    }

    #[test]
    fn test_increase_and_dirty_tracking() {
        let mut container = CounterContainer::with_manager(manager());
        assert!(!container.is_changed());

        assert!(container.increase("games_played", 1).unwrap());
        assert_eq!(container.value("games_played"), 1);
        assert!(container.is_changed());

        // Zero delta does nothing.
        assert!(!container.increase("gold_earned", 0).unwrap());
        assert_eq!(container.value("gold_earned"), 0);

        container.mark_saved();
        assert!(!container.is_changed());
    }

    #[test]
    fn test_increase_upto() {
        let mut container = CounterContainer::with_manager(manager());
        container.increase("gold_earned", 10).unwrap();
        assert!(!container.increase_upto("gold_earned", 5).unwrap());
        assert!(container.increase_upto("gold_earned", 25).unwrap());
        assert_eq!(container.value("gold_earned"), 25);
    }

    #[test]
    fn test_unknown_counter_is_config_error() {
        let mut container = CounterContainer::with_manager(manager());
        assert!(container.increase("nope", 1).is_err());
    }

    #[test]
    fn test_serialize_skips_defaults() {
        let mut container = CounterContainer::with_manager(manager());
        container.increase("games_played", 2).unwrap();
        container.increase("gold_earned", 0).unwrap();

        let SVal::Array(items) = container.serialize() else {
            panic!("expected array");
        };
        assert_eq!(items.len(), 1);
        let obj = items[0].as_object().unwrap();
        assert_eq!(obj.get_str("id"), Some("games_played"));
        assert_eq!(obj.get_int("value"), Some(2));
    }

    #[test]
    fn test_load_does_not_dirty() {
        let mut container = CounterContainer::with_manager(manager());
        container.load("games_played", 7).unwrap();
        assert_eq!(container.value("games_played"), 7);
        assert!(!container.is_changed());
    }
}
