//! Backend registry
//!
//! Maps a configured backend kind to a constructor and hands back a
//! ready-to-use backend. Construction has no side effects beyond
//! building the pool descriptor; no connection is opened until first
//! use. Custom kinds can be registered at runtime.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use tracing::debug;

use cofre_common::{CofreError, Result};

use crate::backend::HaBackend;
use crate::memory::MemoryBackend;
use crate::redis::RedisBackend;

/// Constructor for one backend kind.
pub trait BackendFactory: Send + Sync {
    fn build(&self, conf: &HashMap<String, String>) -> Result<Arc<dyn HaBackend>>;
}

/// Registry of backend constructors, with the built-in kinds registered
/// at construction.
pub struct BackendRegistry {
    factories: DashMap<String, Arc<dyn BackendFactory>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        let registry = Self {
            factories: DashMap::new(),
        };

        // Built-in kinds
        registry.register("redis", Arc::new(RedisFactory));
        registry.register("inmem", Arc::new(MemoryFactory));

        registry
    }

    /// Register a custom backend constructor.
    pub fn register(&self, kind: &str, factory: Arc<dyn BackendFactory>) {
        self.factories.insert(kind.to_string(), factory);
        debug!("registered physical backend kind: {}", kind);
    }

    pub fn has_kind(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// All registered kind names.
    pub fn kinds(&self) -> Vec<String> {
        self.factories.iter().map(|e| e.key().clone()).collect()
    }

    /// Construct a backend of the named kind from the configuration map.
    pub fn build(&self, kind: &str, conf: &HashMap<String, String>) -> Result<Arc<dyn HaBackend>> {
        let factory = self
            .factories
            .get(kind)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CofreError::UnknownBackend(kind.to_string()))?;
        factory.build(conf)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct RedisFactory;

impl BackendFactory for RedisFactory {
    fn build(&self, conf: &HashMap<String, String>) -> Result<Arc<dyn HaBackend>> {
        Ok(Arc::new(RedisBackend::from_conf(conf)?))
    }
}

struct MemoryFactory;

impl BackendFactory for MemoryFactory {
    fn build(&self, conf: &HashMap<String, String>) -> Result<Arc<dyn HaBackend>> {
        Ok(Arc::new(MemoryBackend::new(conf)?))
    }
}

static DEFAULT_REGISTRY: LazyLock<BackendRegistry> = LazyLock::new(BackendRegistry::new);

/// Construct a backend through the shared default registry.
pub fn new_backend(kind: &str, conf: &HashMap<String, String>) -> Result<Arc<dyn HaBackend>> {
    DEFAULT_REGISTRY.build(kind, conf)
}
