//! Pool factory and process-wide pool registry.

use super::pool::DbConnectionPool;
use super::{null::NullDbConnection, DbPoolConfig};
use crate::registry::Registry;
use crate::{Error, Result};
use std::sync::{Arc, LazyLock};

type PoolCreator = Arc<dyn Fn(&DbPoolConfig) -> Result<Arc<DbConnectionPool>> + Send + Sync>;

/// Holds every opened pool by name, plus the `type`-keyed factory that
/// constructs them.
pub struct DbManager {
    factory: Registry<PoolCreator>,
    pools: Registry<Arc<DbConnectionPool>>,
}

impl Default for DbManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DbManager {
    /// A manager with the built-in `null` driver registered.
    pub fn new() -> Self {
        let manager = DbManager {
            factory: Registry::new(),
            pools: Registry::new(),
        };
        let _ = manager.factory.register(
            "null",
            Arc::new(|config: &DbPoolConfig| {
                Ok(DbConnectionPool::new(config.clone(), |_config| {
                    Ok(NullDbConnection::create())
                }))
            }) as PoolCreator,
        );
        manager
    }

    /// Register a pool type constructor (first write wins).
    pub fn register_type(&self, kind: &str, creator: PoolCreator) -> Result<()> {
        self.factory.register(kind, creator)
    }

    /// Build a pool from `config` via the factory and register it
    /// under its name.
    pub fn open_pool(&self, config: &DbPoolConfig) -> Result<Arc<DbConnectionPool>> {
        let creator = self.factory.get(&config.kind).ok_or_else(|| {
            Error::Config(format!("unknown database type `{}`", config.kind))
        })?;
        let pool = creator(config)?;
        self.pools.register(pool.name().to_string(), pool.clone())?;
        Ok(pool)
    }

    pub fn get_pool(&self, name: &str) -> Option<Arc<DbConnectionPool>> {
        self.pools.get(name)
    }

    /// Visit every pool, name-ordered; used by the status page.
    pub fn for_each(&self, mut visit: impl FnMut(&Arc<DbConnectionPool>)) {
        self.pools.for_each(|_, pool| visit(pool));
    }
}

static GLOBAL: LazyLock<DbManager> = LazyLock::new(DbManager::new);

/// The process-wide pool registry.
pub fn db_manager() -> &'static DbManager {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_lookup() {
        let manager = DbManager::new();
        let config = DbPoolConfig::new("main", "null");
        let pool = manager.open_pool(&config).unwrap();
        assert_eq!(pool.name(), "main");
        assert!(manager.get_pool("main").is_some());
        assert!(manager.get_pool("other").is_none());

        // Duplicate pool name rejected.
        assert!(manager.open_pool(&config).is_err());
        // Unknown driver rejected.
        assert!(manager
            .open_pool(&DbPoolConfig::new("x", "mysql"))
            .is_err());
    }

    #[test]
    fn test_for_each_ordered() {
        let manager = DbManager::new();
        manager.open_pool(&DbPoolConfig::new("b", "null")).unwrap();
        manager.open_pool(&DbPoolConfig::new("a", "null")).unwrap();
        let mut names = Vec::new();
        manager.for_each(|pool| names.push(pool.name().to_string()));
        assert_eq!(names, ["a", "b"]);
    }
}
