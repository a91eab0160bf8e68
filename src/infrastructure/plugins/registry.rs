//! Builtin plugin source - compiled-in factories registered by name

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use async_trait::async_trait;

use crate::application::errors::PluginError;
use crate::plugins::context::PluginContext;
use crate::plugins::trait_def::{construct_guarded, Instantiated, Plugin, PluginFactory, PluginSource, SourceUnit};

pub const BUILTIN_ORIGIN: &str = "builtin";

struct Entry {
    factory: Arc<dyn PluginFactory>,
    revision: u64,
    dependencies: Vec<String>,
}

/// Source for plugins linked into the binary.
///
/// Each entry carries a revision; `bump` stands in for a code change and
/// makes the next update check reload the plugin.
pub struct BuiltinSource {
    origin: String,
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl BuiltinSource {
    pub fn new() -> Self {
        Self::named(BUILTIN_ORIGIN)
    }

    /// A second builtin source needs a distinct origin
    pub fn named(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a plugin constructor. Re-registering a name replaces the
    /// constructor and counts as an update.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(PluginContext) -> Result<Box<dyn Plugin>, PluginError> + Send + Sync + 'static,
    {
        self.register_with_dependencies(name, Vec::new(), factory);
    }

    pub fn register_with_dependencies<F>(&self, name: impl Into<String>, dependencies: Vec<String>, factory: F)
    where
        F: Fn(PluginContext) -> Result<Box<dyn Plugin>, PluginError> + Send + Sync + 'static,
    {
        let mut entries = self.write();
        let name = name.into();
        let revision = entries.get(&name).map(|e| e.revision + 1).unwrap_or(1);
        entries.insert(
            name,
            Entry {
                factory: Arc::new(factory),
                revision,
                dependencies,
            },
        );
    }

    /// Mark a plugin as changed without replacing its constructor
    pub fn bump(&self, name: &str) -> bool {
        match self.write().get_mut(name) {
            Some(entry) => {
                entry.revision += 1;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for BuiltinSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PluginSource for BuiltinSource {
    fn origin(&self) -> &str {
        &self.origin
    }

    async fn discover(&self) -> Result<Vec<SourceUnit>, PluginError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .iter()
            .map(|(name, entry)| {
                SourceUnit::new(name.clone(), self.origin.clone(), format!("rev-{}", entry.revision))
                    .with_dependencies(entry.dependencies.clone())
            })
            .collect())
    }

    async fn instantiate(&self, unit: &SourceUnit, ctx: PluginContext) -> Result<Instantiated, PluginError> {
        let factory = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&unit.name)
            .map(|entry| entry.factory.clone())
            .ok_or_else(|| PluginError::NotFound(unit.name.clone()))?;

        let plugin = construct_guarded(factory.as_ref(), ctx)?;
        Ok(Instantiated { plugin, keepalive: None })
    }
}
