//! Hot-pluggable applications.
//!
//! An application is an opaque named unit constructed from a config
//! with a `type` discriminator; the server core only routes to and
//! introspects them.

use crate::registry::Registry;
use crate::{Error, Result, SObj};
use std::sync::{Arc, LazyLock};

/// Contract an application implements towards the core.
pub trait Application: Send + Sync {
    /// The `type` it was constructed from.
    fn kind(&self) -> &str;
    /// Unique instance id.
    fn id(&self) -> &str;
}

type ApplicationCreator = Arc<dyn Fn(&SObj) -> Result<Arc<dyn Application>> + Send + Sync>;

/// Application factory plus the table of constructed instances.
pub struct Applications {
    factory: Registry<ApplicationCreator>,
    registry: Registry<Arc<dyn Application>>,
}

impl Default for Applications {
    fn default() -> Self {
        Self::new()
    }
}

impl Applications {
    pub fn new() -> Self {
        Applications {
            factory: Registry::new(),
            registry: Registry::new(),
        }
    }

    /// Register an application type constructor (first write wins).
    pub fn register_type(&self, kind: &str, creator: ApplicationCreator) -> Result<()> {
        self.factory.register(kind, creator)
    }

    /// Construct an application from `config` and register it by id.
    ///
    /// `config` must carry a `type` member naming a registered
    /// constructor.
    pub fn add(&self, config: &SObj) -> Result<Arc<dyn Application>> {
        let kind = config
            .get_str("type")
            .ok_or_else(|| Error::Config("application type undefined".into()))?;
        let creator = self
            .factory
            .get(kind)
            .ok_or_else(|| Error::Config(format!("unknown application type `{kind}`")))?;
        let application = creator(config)?;
        self.registry
            .register(application.id().to_string(), application.clone())?;
        Ok(application)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Application>> {
        self.registry.get(id)
    }

    pub fn del(&self, id: &str) {
        self.registry.remove(id);
    }

    /// Visit every application, id-ordered.
    pub fn for_each(&self, mut visit: impl FnMut(&Arc<dyn Application>)) {
        self.registry.for_each(|_, application| visit(application));
    }
}

static GLOBAL: LazyLock<Applications> = LazyLock::new(Applications::new);

/// The process-wide application table.
pub fn applications() -> &'static Applications {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Game {
        id: String,
    }

    impl Application for Game {
        fn kind(&self) -> &str {
            "game"
        }
        fn id(&self) -> &str {
            &self.id
        }
    }

    fn game_type(apps: &Applications) {
        apps.register_type(
            "game",
            Arc::new(|config: &SObj| {
                let id = config
                    .get_str("id")
                    .ok_or_else(|| Error::Config("application id undefined".into()))?;
                Ok(Arc::new(Game { id: id.to_string() }) as Arc<dyn Application>)
            }),
        )
        .unwrap();
    }

    #[test]
    fn test_add_and_lookup() {
        let apps = Applications::new();
        game_type(&apps);

        let mut config = SObj::new();
        config.emplace("type", "game");
        config.emplace("id", "tetris");
        let application = apps.add(&config).unwrap();
        assert_eq!(application.kind(), "game");
        assert!(apps.get("tetris").is_some());

        // Same id twice is a config error.
        assert!(apps.add(&config).is_err());

        apps.del("tetris");
        assert!(apps.get("tetris").is_none());
    }

    #[test]
    fn test_bad_configs() {
        let apps = Applications::new();
        game_type(&apps);

        let empty = SObj::new();
        assert!(apps.add(&empty).is_err());

        let mut unknown = SObj::new();
        unknown.emplace("type", "chat");
        assert!(apps.add(&unknown).is_err());

        let mut missing_id = SObj::new();
        missing_id.emplace("type", "game");
        assert!(apps.add(&missing_id).is_err());
    }
}
