//! Factory resolution through nested registries.
//!
//! A package path such as `["Comp", "Sub"]` is resolved one registry level
//! per element: `"Comp"` must name a sub-registry, inside which `"Sub"` must
//! name a channel factory.

use crate::channel::ChannelFactory;
use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use weft_core::attributes::PackagePath;

/// What a registry name resolves to.
#[derive(Clone)]
pub enum RegistryEntry {
    Factory(Arc<dyn ChannelFactory>),
    Registry(Arc<dyn FactoryRegistry>),
}

/// Resolves package path segments. May load code, hence async.
#[async_trait]
pub trait FactoryRegistry: Send + Sync {
    async fn resolve(&self, name: &str) -> Option<RegistryEntry>;
}

/// Registry backed by a map.
#[derive(Default)]
pub struct MemoryRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its own channel type.
    pub fn with_factory(self, factory: Arc<dyn ChannelFactory>) -> Self {
        self.register_factory(factory);
        self
    }

    pub fn with_registry(self, name: impl Into<String>, registry: Arc<dyn FactoryRegistry>) -> Self {
        self.register_registry(name, registry);
        self
    }

    pub fn register_factory(&self, factory: Arc<dyn ChannelFactory>) {
        let name = factory.channel_type().to_string();
        self.entries
            .write()
            .insert(name, RegistryEntry::Factory(factory));
    }

    pub fn register_registry(&self, name: impl Into<String>, registry: Arc<dyn FactoryRegistry>) {
        self.entries
            .write()
            .insert(name.into(), RegistryEntry::Registry(registry));
    }
}

#[async_trait]
impl FactoryRegistry for MemoryRegistry {
    async fn resolve(&self, name: &str) -> Option<RegistryEntry> {
        self.entries.read().get(name).cloned()
    }
}

/// Walk `package` from `root` down to a channel factory.
pub async fn resolve_package(
    root: Arc<dyn FactoryRegistry>,
    package: &PackagePath,
) -> Result<Arc<dyn ChannelFactory>> {
    let segments = package.segments();
    let mut registry = root;

    for (index, segment) in segments.iter().enumerate() {
        let last = index + 1 == segments.len();
        let entry = registry.resolve(segment).await;
        match (entry, last) {
            (Some(RegistryEntry::Factory(factory)), true) => {
                debug!(package = %package, "Resolved channel factory");
                return Ok(factory);
            }
            (Some(RegistryEntry::Registry(nested)), false) => registry = nested,
            (Some(RegistryEntry::Registry(_)), true) => {
                return Err(RuntimeError::UnresolvedType(format!(
                    "{package}: {segment} names a registry, not a channel type"
                )));
            }
            (Some(RegistryEntry::Factory(_)), false) | (None, false) => {
                return Err(RuntimeError::MalformedPackagePath(format!(
                    "{package}: {segment} does not resolve to a sub-registry"
                )));
            }
            (None, true) => return Err(RuntimeError::UnresolvedType(package.to_string())),
        }
    }

    Err(RuntimeError::MalformedPackagePath(package.to_string()))
}
