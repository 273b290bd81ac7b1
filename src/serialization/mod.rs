//! Serializers over the [`SVal`](crate::SVal) value tree.
//!
//! Serializers are stateless transformers registered by name; the
//! process-wide table ships with `json` and `uri` built in.

use crate::registry::Registry;
use crate::{Error, Result, SVal};
use std::sync::{Arc, LazyLock};

pub mod json;
pub mod url;

pub use json::JsonSerializer;
pub use url::UrlSerializer;

/// A stateless value-tree codec.
pub trait Serializer: Send + Sync {
    fn name(&self) -> &'static str;
    fn encode(&self, value: &SVal) -> Result<String>;
    fn decode(&self, input: &str) -> Result<SVal>;
}

static SERIALIZERS: LazyLock<Registry<Arc<dyn Serializer>>> = LazyLock::new(|| {
    let registry = Registry::new();
    register_builtin(&registry);
    registry
});

/// Register the built-in codecs on `registry`.
///
/// The process-wide table already contains them; this is for test
/// harnesses wiring their own registry.
pub fn register_builtin(registry: &Registry<Arc<dyn Serializer>>) {
    // Fresh registry: these cannot already be present.
    let _ = registry.register("json", Arc::new(JsonSerializer) as Arc<dyn Serializer>);
    let _ = registry.register("uri", Arc::new(UrlSerializer) as Arc<dyn Serializer>);
}

/// Register a serializer in the process-wide table (first write wins).
pub fn register(name: &str, serializer: Arc<dyn Serializer>) -> Result<()> {
    SERIALIZERS.register(name, serializer)
}

/// Look up a serializer by name.
pub fn create(name: &str) -> Result<Arc<dyn Serializer>> {
    SERIALIZERS
        .get(name)
        .ok_or_else(|| Error::Config(format!("unknown serializer `{name}`")))
}
