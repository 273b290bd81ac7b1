//! Periodic per-session generators.

use super::{now_ts, Id, Timestamp};
use crate::registry::Registry;
use crate::{Error, Result, SObj, SVal};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

/// Immutable definition of a generator.
#[derive(Debug)]
pub struct GeneratorConfig {
    pub id: Id,
    /// Seconds between ticks; zero disables the generator.
    pub period: i64,
}

/// Write-once table of generator definitions.
#[derive(Debug, Default)]
pub struct GeneratorManager {
    configs: Registry<Arc<GeneratorConfig>>,
}

impl GeneratorManager {
    pub fn new() -> Self {
        GeneratorManager::default()
    }

    pub fn define(&self, config: GeneratorConfig) -> Result<()> {
        self.configs.register(config.id.clone(), Arc::new(config))
    }

    pub fn get(&self, id: &str) -> Option<Arc<GeneratorConfig>> {
        self.configs.get(id)
    }
}

static GLOBAL: LazyLock<GeneratorManager> = LazyLock::new(GeneratorManager::new);

pub fn generator_manager() -> &'static GeneratorManager {
    &GLOBAL
}

/// A live generator instance.
#[derive(Debug)]
pub struct Generator {
    pub id: Id,
    config: Arc<GeneratorConfig>,
    next_tick: Timestamp,
    changed: bool,
}

impl Generator {
    fn new(manager: &GeneratorManager, id: &str) -> Result<Generator> {
        let config = manager
            .get(id)
            .ok_or_else(|| Error::Config(format!("not found config for generator `{id}`")))?;
        Ok(Generator {
            id: id.to_string(),
            config,
            next_tick: 0,
            changed: false,
        })
    }

    pub fn next_tick(&self) -> Timestamp {
        self.next_tick
    }

    pub fn is_running(&self) -> bool {
        self.next_tick != 0
    }

    /// Arm the first tick one period from now.
    pub fn start(&mut self) -> bool {
        if self.next_tick != 0 || self.config.period == 0 {
            return false;
        }
        self.next_tick = now_ts() + self.config.period;
        self.changed = true;
        true
    }

    pub fn stop(&mut self) -> bool {
        if self.next_tick == 0 {
            return false;
        }
        self.next_tick = 0;
        self.changed = true;
        true
    }

    /// Advance past due ticks, returning how many fired.
    pub fn tick(&mut self) -> u64 {
        if self.config.period == 0 || self.next_tick == 0 {
            return 0;
        }
        let now = now_ts();
        if now < self.next_tick {
            return 0;
        }

        let mut ticks = 0;
        while self.next_tick <= now {
            self.next_tick += self.config.period;
            ticks += 1;
        }
        self.changed = true;
        ticks
    }

    pub fn in_default_state(&self) -> bool {
        self.next_tick == 0
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
        data.emplace("nextTick", self.next_tick);
        data.emplace("period", self.config.period);
        data
    }
}

/// Per-session set of generators.
#[derive(Debug)]
pub struct GeneratorContainer {
    manager: &'static GeneratorManager,
    generators: HashMap<Id, Generator>,
    changed: bool,
}

impl Default for GeneratorContainer {
    fn default() -> Self {
        GeneratorContainer::new()
    }
}

impl GeneratorContainer {
    pub fn new() -> Self {
        GeneratorContainer::with_manager(generator_manager())
    }

    pub fn with_manager(manager: &'static GeneratorManager) -> Self {
        GeneratorContainer {
            manager,
            generators: HashMap::new(),
            changed: false,
        }
    }

    fn ensure(&mut self, id: &str) -> Result<&mut Generator> {
        match self.generators.entry(id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let generator = Generator::new(self.manager, id)?;
                Ok(entry.insert(generator))
            }
        }
    }

    pub fn start(&mut self, id: &str) -> Result<bool> {
        let changed = self.ensure(id)?.start();
        self.changed |= changed;
        Ok(changed)
    }

    pub fn stop(&mut self, id: &str) -> Result<bool> {
        let changed = self.ensure(id)?.stop();
        self.changed |= changed;
        Ok(changed)
    }

    pub fn tick(&mut self, id: &str) -> Result<u64> {
        let ticks = self.ensure(id)?.tick();
        self.changed |= ticks > 0;
        Ok(ticks)
    }

    pub fn get(&self, id: &str) -> Option<&Generator> {
        self.generators.get(id)
    }

    /// Restore a stored generator without marking anything dirty.
    pub fn load(&mut self, id: &str, next_tick: Timestamp) -> Result<()> {
        let mut generator = Generator::new(self.manager, id)?;
        generator.next_tick = next_tick;
        self.generators.insert(id.to_string(), generator);
        Ok(())
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn mark_saved(&mut self) {
        self.changed = false;
        for generator in self.generators.values_mut() {
            generator.set_changed(false);
        }
    }

    /// Serialize every running generator.
    pub fn serialize(&self) -> SVal {
        let items: Vec<SVal> = self
            .generators
            .values()
            .filter(|generator| !generator.in_default_state())
            .map(|generator| SVal::Object(generator.serialize()))
            .collect();
        SVal::Array(items)
    }
}
