//! Plugin manager - handles plugin lifecycle: load, hot reload, unload

use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::application::errors::PluginError;
use crate::application::messaging::DedupCache;
use crate::application::services::OutboundGateway;
use crate::application::state::{GlobalStatePublisher, RuntimeStats, SharedStateRegistry};
use crate::domain::entities::{LoadState, PluginInfo, StateCounts};
use crate::domain::traits::PluginCensus;
use super::context::{ContextParts, PluginContext};
use super::trait_def::{DependencyResolver, Instantiated, Plugin, PluginSource, SourceUnit};

/// Identical failures are logged at `error` once per this window
const FAILURE_LOG_WINDOW: Duration = Duration::from_secs(3600);

/// Lifecycle timings
#[derive(Debug, Clone, Copy)]
pub struct ManagerSettings {
    /// Bound on an outgoing instance's cleanup hook
    pub cleanup_grace: Duration,
    /// Bound on draining an outgoing instance's background tasks
    pub cancel_wait: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            cleanup_grace: Duration::from_secs(1),
            cancel_wait: Duration::from_secs(1),
        }
    }
}

/// One constructed plugin instance, bound to a single generation
pub struct LiveInstance {
    name: String,
    generation: u64,
    plugin: Box<dyn Plugin>,
    context: PluginContext,
    // Declared last: must drop after `plugin` (it may own the code).
    _keepalive: Option<Arc<dyn Any + Send + Sync>>,
}

impl LiveInstance {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn plugin(&self) -> &dyn Plugin {
        self.plugin.as_ref()
    }

    pub fn context(&self) -> &PluginContext {
        &self.context
    }
}

/// A plugin slot. Only the manager mutates these.
#[derive(Clone)]
pub struct PluginDescriptor {
    pub name: String,
    pub origin: String,
    /// Generation of the current (or last) live instance; 0 before the
    /// first successful load
    pub generation: u64,
    pub state: LoadState,
    pub instance: Option<Arc<LiveInstance>>,
    pub fingerprint: Option<String>,
    pub last_error: Option<String>,
    pub loaded_at: Option<DateTime<Utc>>,
}

impl PluginDescriptor {
    fn loading(unit: &SourceUnit) -> Self {
        Self {
            name: unit.name.clone(),
            origin: unit.origin.clone(),
            generation: 0,
            state: LoadState::Loading,
            instance: None,
            fingerprint: Some(unit.fingerprint.clone()),
            last_error: None,
            loaded_at: None,
        }
    }

    pub fn info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name.clone(),
            origin: self.origin.clone(),
            generation: self.generation,
            state: self.state,
            fingerprint: self.fingerprint.clone(),
            last_error: self.last_error.clone(),
            loaded_at: self.loaded_at,
        }
    }
}

/// All plugin slots, keyed by name.
///
/// Readers (dispatch, status) take short read locks and clone `Arc`s out;
/// an instance swap happens under a single write lock so a reader sees
/// either the old instance or the new one.
#[derive(Default)]
pub struct PluginTable {
    slots: RwLock<BTreeMap<String, PluginDescriptor>>,
}

impl PluginTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every `active` instance, in name order
    pub fn active_instances(&self) -> Vec<Arc<LiveInstance>> {
        self.read()
            .values()
            .filter(|slot| slot.state == LoadState::Active)
            .filter_map(|slot| slot.instance.clone())
            .collect()
    }

    pub fn descriptor(&self, name: &str) -> Option<PluginDescriptor> {
        self.read().get(name).cloned()
    }

    pub fn info(&self, name: &str) -> Option<PluginInfo> {
        self.read().get(name).map(PluginDescriptor::info)
    }

    pub fn state(&self, name: &str) -> Option<LoadState> {
        self.read().get(name).map(|slot| slot.state)
    }

    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, PluginDescriptor>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, PluginDescriptor>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PluginCensus for PluginTable {
    fn counts_by_state(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for slot in self.read().values() {
            counts.record(slot.state);
        }
        counts
    }

    fn plugins(&self) -> Vec<PluginInfo> {
        self.read().values().map(PluginDescriptor::info).collect()
    }
}

/// Result of loading every discovered plugin
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadSummary {
    pub loaded: Vec<String>,
    pub rejected: Vec<(String, String)>,
    pub discovery_errors: usize,
}

/// What one hot-reload check did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateSummary {
    pub loaded: Vec<String>,
    pub reloaded: Vec<String>,
    pub unloaded: Vec<String>,
    pub failed: Vec<String>,
}

impl UpdateSummary {
    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty() && self.reloaded.is_empty() && self.unloaded.is_empty() && self.failed.is_empty()
    }
}

/// Manages all plugins for the bot.
///
/// Lifecycle operations are serialized by an async mutex; dispatch never
/// takes it.
pub struct PluginManager {
    table: Arc<PluginTable>,
    sources: Vec<Arc<dyn PluginSource>>,
    resolver: Option<Arc<dyn DependencyResolver>>,
    registry: Arc<SharedStateRegistry>,
    publisher: Arc<GlobalStatePublisher>,
    stats: Arc<RuntimeStats>,
    api: Option<Arc<OutboundGateway>>,
    settings: ManagerSettings,
    ops: tokio::sync::Mutex<()>,
    failures: DedupCache,
}

impl PluginManager {
    pub fn new(
        table: Arc<PluginTable>,
        registry: Arc<SharedStateRegistry>,
        publisher: Arc<GlobalStatePublisher>,
        stats: Arc<RuntimeStats>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            table,
            sources: Vec::new(),
            resolver: None,
            registry,
            publisher,
            stats,
            api: None,
            settings,
            ops: tokio::sync::Mutex::new(()),
            failures: DedupCache::new(FAILURE_LOG_WINDOW),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn PluginSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DependencyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_api(mut self, api: Arc<OutboundGateway>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn table(&self) -> &Arc<PluginTable> {
        &self.table
    }

    pub fn list_plugins(&self) -> Vec<PluginInfo> {
        self.table.plugins()
    }

    /// Discover and load everything every source offers
    pub async fn load_all(&self) -> LoadSummary {
        let mut summary = LoadSummary::default();
        for source in &self.sources {
            let units = match source.discover().await {
                Ok(units) => units,
                Err(e) => {
                    error!(origin = source.origin(), error = %e, "plugin discovery failed");
                    summary.discovery_errors += 1;
                    continue;
                }
            };
            for unit in units {
                match self.load(&unit).await {
                    Ok(_) => summary.loaded.push(unit.name),
                    Err(e) => summary.rejected.push((unit.name, e.to_string())),
                }
            }
        }
        info!(
            "Loaded {} plugin(s), {} rejected",
            summary.loaded.len(),
            summary.rejected.len()
        );
        summary
    }

    /// Construct and activate a plugin. Returns its new generation.
    pub async fn load(&self, unit: &SourceUnit) -> Result<u64, PluginError> {
        let _ops = self.ops.lock().await;
        self.load_locked(unit).await
    }

    /// Replace a plugin's instance with a freshly constructed one
    pub async fn reload(&self, name: &str) -> Result<u64, PluginError> {
        let _ops = self.ops.lock().await;
        let origin = self
            .table
            .descriptor(name)
            .map(|slot| slot.origin)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        let source = self.source_for(&origin)?;
        let unit = source
            .discover()
            .await?
            .into_iter()
            .find(|unit| unit.name == name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        self.reload_locked(&source, &unit).await
    }

    /// Retire a plugin: cleanup, remove its slot, purge its shared state
    pub async fn unload(&self, name: &str) -> Result<(), PluginError> {
        let _ops = self.ops.lock().await;
        self.unload_locked(name).await
    }

    /// Diff every source against the table: load new units, reload
    /// changed ones, unload vanished ones.
    pub async fn check_for_updates(&self) -> Result<UpdateSummary, PluginError> {
        let _ops = self.ops.lock().await;
        self.stats.mark_reload_check();

        let mut summary = UpdateSummary::default();
        for source in &self.sources {
            let units = source.discover().await?;
            let discovered: HashSet<&str> = units.iter().map(|u| u.name.as_str()).collect();

            for unit in &units {
                match self.table.descriptor(&unit.name) {
                    None => match self.load_locked(unit).await {
                        Ok(_) => summary.loaded.push(unit.name.clone()),
                        Err(_) => summary.failed.push(unit.name.clone()),
                    },
                    Some(slot) if slot.fingerprint.as_deref() != Some(unit.fingerprint.as_str()) => {
                        debug!(plugin = %unit.name, "plugin source changed");
                        match self.reload_locked(source, unit).await {
                            Ok(_) => summary.reloaded.push(unit.name.clone()),
                            Err(_) => summary.failed.push(unit.name.clone()),
                        }
                    }
                    Some(_) => {}
                }
            }

            let vanished: Vec<String> = self
                .table
                .plugins()
                .into_iter()
                .filter(|info| info.origin == source.origin() && !discovered.contains(info.name.as_str()))
                .map(|info| info.name)
                .collect();
            for name in vanished {
                info!(plugin = %name, "plugin source removed");
                match self.unload_locked(&name).await {
                    Ok(()) => summary.unloaded.push(name),
                    Err(_) => summary.failed.push(name),
                }
            }
        }

        if !summary.is_empty() {
            info!(
                loaded = summary.loaded.len(),
                reloaded = summary.reloaded.len(),
                unloaded = summary.unloaded.len(),
                failed = summary.failed.len(),
                "hot reload check applied changes"
            );
        }
        Ok(summary)
    }

    /// Unload every plugin; used at shutdown
    pub async fn shutdown_all(&self) {
        let _ops = self.ops.lock().await;
        for name in self.table.names() {
            if let Err(e) = self.unload_locked(&name).await {
                warn!(plugin = %name, error = %e, "unload during shutdown failed");
            }
        }
    }

    async fn load_locked(&self, unit: &SourceUnit) -> Result<u64, PluginError> {
        let source = self.source_for(&unit.origin)?;
        let generation = {
            let mut slots = self.table.write();
            match slots.get_mut(&unit.name) {
                Some(slot) if matches!(slot.state, LoadState::Active | LoadState::Loading) => {
                    return Err(PluginError::AlreadyLoaded(unit.name.clone()));
                }
                Some(slot) => {
                    slot.state = LoadState::Loading;
                    slot.origin = unit.origin.clone();
                    slot.fingerprint = Some(unit.fingerprint.clone());
                    slot.generation + 1
                }
                None => {
                    slots.insert(unit.name.clone(), PluginDescriptor::loading(unit));
                    1
                }
            }
        };

        let constructed = match self.resolve_dependencies(unit).await {
            Ok(()) => self.instantiate(&source, unit, generation).await,
            Err(e) => Err(e),
        };
        match constructed {
            Ok(instance) => {
                self.activate(unit, instance);
                self.stats.record_plugin_loaded();
                info!("Loaded plugin: {} (generation {})", unit.name, generation);
                Ok(generation)
            }
            Err(e) => {
                self.mark_failed(&unit.name, &e);
                Err(e)
            }
        }
    }

    async fn reload_locked(&self, source: &Arc<dyn PluginSource>, unit: &SourceUnit) -> Result<u64, PluginError> {
        // Nothing is torn down until dependencies are known to be present.
        if let Err(e) = self.resolve_dependencies(unit).await {
            let mut slots = self.table.write();
            if let Some(slot) = slots.get_mut(&unit.name) {
                slot.last_error = Some(e.to_string());
            }
            drop(slots);
            self.log_failure(&unit.name, "reload skipped, keeping current instance", &e);
            return Err(e);
        }

        let (outgoing, generation) = {
            let mut slots = self.table.write();
            let slot = slots
                .get_mut(&unit.name)
                .ok_or_else(|| PluginError::NotFound(unit.name.clone()))?;
            slot.state = LoadState::Loading;
            // a failed attempt is not retried until the source moves again
            slot.fingerprint = Some(unit.fingerprint.clone());
            (slot.instance.take(), slot.generation + 1)
        };

        if let Some(outgoing) = outgoing {
            let report = outgoing
                .context()
                .teardown(self.settings.cleanup_grace, self.settings.cancel_wait)
                .await;
            debug!(
                plugin = %unit.name,
                generation = outgoing.generation(),
                hook_completed = ?report.hook_completed,
                tasks_drained = report.tasks_drained,
                "retired instance"
            );
        }

        match self.instantiate(source, unit, generation).await {
            Ok(instance) => {
                self.activate(unit, instance);
                self.stats.record_plugin_reload();
                info!("Reloaded plugin: {} (generation {})", unit.name, generation);
                Ok(generation)
            }
            Err(e) => {
                self.mark_failed(&unit.name, &e);
                Err(e)
            }
        }
    }

    async fn unload_locked(&self, name: &str) -> Result<(), PluginError> {
        let slot = self
            .table
            .write()
            .remove(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;

        if let Some(instance) = slot.instance {
            instance
                .context()
                .teardown(self.settings.cleanup_grace, self.settings.cancel_wait)
                .await;
        }
        self.registry.purge(name);
        self.stats.record_plugin_unloaded();
        info!("Unloaded plugin: {}", name);
        Ok(())
    }

    async fn resolve_dependencies(&self, unit: &SourceUnit) -> Result<(), PluginError> {
        match &self.resolver {
            Some(resolver) if !unit.dependencies.is_empty() => {
                resolver.resolve(&unit.name, &unit.dependencies).await
            }
            _ => Ok(()),
        }
    }

    async fn instantiate(
        &self,
        source: &Arc<dyn PluginSource>,
        unit: &SourceUnit,
        generation: u64,
    ) -> Result<LiveInstance, PluginError> {
        self.registry.ensure_namespace(&unit.name);
        let context = PluginContext::new(ContextParts {
            plugin_name: unit.name.clone(),
            generation,
            registry: self.registry.clone(),
            global_state: self.publisher.clone(),
            stats: self.stats.clone(),
            api: self.api.clone(),
        });

        match source.instantiate(unit, context.clone()).await {
            Ok(Instantiated { plugin, keepalive }) => Ok(LiveInstance {
                name: unit.name.clone(),
                generation,
                plugin,
                context,
                _keepalive: keepalive,
            }),
            Err(e) => {
                // The constructor may have registered hooks or tasks before failing.
                context
                    .teardown(self.settings.cleanup_grace, self.settings.cancel_wait)
                    .await;
                Err(e)
            }
        }
    }

    fn activate(&self, unit: &SourceUnit, instance: LiveInstance) {
        let mut slots = self.table.write();
        let slot = slots
            .entry(unit.name.clone())
            .or_insert_with(|| PluginDescriptor::loading(unit));
        slot.generation = instance.generation;
        slot.instance = Some(Arc::new(instance));
        slot.state = LoadState::Active;
        slot.origin = unit.origin.clone();
        slot.fingerprint = Some(unit.fingerprint.clone());
        slot.last_error = None;
        slot.loaded_at = Some(Utc::now());
    }

    fn mark_failed(&self, name: &str, err: &PluginError) {
        if let Some(slot) = self.table.write().get_mut(name) {
            slot.state = LoadState::Failed;
            slot.instance = None;
            slot.last_error = Some(err.to_string());
        }
        self.stats.record_plugin_rejected(name, &err.to_string());
        self.log_failure(name, "plugin rejected", err);
    }

    fn log_failure(&self, name: &str, what: &str, err: &PluginError) {
        if self.failures.seen(&format!("{}:{}", name, err)) {
            error!(plugin = %name, error = %err, "{}", what);
        } else {
            debug!(plugin = %name, error = %err, "{} (repeat)", what);
        }
    }

    fn source_for(&self, origin: &str) -> Result<Arc<dyn PluginSource>, PluginError> {
        self.sources
            .iter()
            .find(|source| source.origin() == origin)
            .cloned()
            .ok_or_else(|| PluginError::Internal(format!("no plugin source named '{}'", origin)))
    }
}
