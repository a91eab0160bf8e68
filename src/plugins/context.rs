//! Per-instance handle given to a plugin at construction

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::application::errors::PluginError;
use crate::application::services::OutboundGateway;
use crate::application::state::{GlobalStatePublisher, RuntimeStats, SharedStateRegistry};

/// Runs once when the instance is retired
pub type CleanupHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// What happened while retiring an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Teardown {
    /// `None` when no hook was registered
    pub hook_completed: Option<bool>,
    pub tasks_drained: bool,
}

/// Everything needed to build a context; assembled by the plugin manager
pub struct ContextParts {
    pub plugin_name: String,
    pub generation: u64,
    pub registry: Arc<SharedStateRegistry>,
    pub global_state: Arc<GlobalStatePublisher>,
    pub stats: Arc<RuntimeStats>,
    pub api: Option<Arc<OutboundGateway>>,
}

/// Capability handle for one plugin instance.
///
/// Cheap to clone; all clones refer to the same instance. Background
/// tasks started through [`PluginContext::spawn`] are cancelled when the
/// instance is reloaded or unloaded.
#[derive(Clone)]
pub struct PluginContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    plugin_name: String,
    generation: u64,
    logger: PluginLogger,
    shared: SharedHandle,
    global_state: Arc<GlobalStatePublisher>,
    stats: Arc<RuntimeStats>,
    api: Option<Arc<OutboundGateway>>,
    cleanup: Mutex<Option<CleanupHook>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl PluginContext {
    pub fn new(parts: ContextParts) -> Self {
        let logger = PluginLogger::new(&parts.plugin_name, parts.generation);
        let cancel = CancellationToken::new();
        let shared = SharedHandle::new(&parts.plugin_name, parts.registry).retired_by(cancel.clone());
        Self {
            inner: Arc::new(ContextInner {
                plugin_name: parts.plugin_name,
                generation: parts.generation,
                logger,
                shared,
                global_state: parts.global_state,
                stats: parts.stats,
                api: parts.api,
                cleanup: Mutex::new(None),
                cancel,
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn plugin_name(&self) -> &str {
        &self.inner.plugin_name
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    pub fn logger(&self) -> &PluginLogger {
        &self.inner.logger
    }

    /// This plugin's shared-variable namespace
    pub fn shared(&self) -> &SharedHandle {
        &self.inner.shared
    }

    pub fn global_state(&self) -> &GlobalStatePublisher {
        &self.inner.global_state
    }

    /// Outbound API, if a backend client is configured
    pub fn api(&self) -> Option<Arc<OutboundGateway>> {
        self.inner.api.clone()
    }

    /// Register the hook run on reload/unload. A second registration
    /// replaces the first.
    pub fn register_cleanup<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: CleanupHook = Box::new(move || Box::pin(hook()));
        let mut slot = self.inner.cleanup.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.replace(hook).is_some() {
            self.inner.logger.debug("cleanup hook replaced");
        }
    }

    /// Start a background task owned by this instance. It is dropped at
    /// its next await point once the instance is retired.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.inner.cancel.is_cancelled() {
            self.inner.logger.warn("spawn after retirement ignored");
            return;
        }
        let token = self.inner.cancel.clone();
        let gauge = self.inner.stats.track_background_task();
        let span = self.inner.logger.span().clone();
        self.inner.tasks.spawn(
            async move {
                let _gauge = gauge;
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = task => {}
                }
            }
            .instrument(span),
        );
    }

    /// Token cancelled when this instance is retired
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.child_token()
    }

    /// Completes once this instance is retired
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    pub fn is_retired(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn background_tasks(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Run the cleanup hook (bounded by `grace`), then cancel background
    /// tasks and wait up to `cancel_wait` for them. Whatever overruns is
    /// abandoned.
    pub async fn teardown(&self, grace: Duration, cancel_wait: Duration) -> Teardown {
        let hook = self
            .inner
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let hook_completed = match hook {
            Some(hook) => {
                let mut handle = tokio::spawn(hook().instrument(self.inner.logger.span().clone()));
                match tokio::time::timeout(grace, &mut handle).await {
                    Ok(Ok(())) => Some(true),
                    Ok(Err(e)) => {
                        self.inner.logger.error(format_args!("cleanup hook failed: {}", e));
                        Some(false)
                    }
                    Err(_) => {
                        handle.abort();
                        self.inner
                            .logger
                            .warn(format_args!("cleanup hook exceeded {:?}, abandoned", grace));
                        Some(false)
                    }
                }
            }
            None => None,
        };

        self.inner.cancel.cancel();
        self.inner.tasks.close();
        let tasks_drained = tokio::time::timeout(cancel_wait, self.inner.tasks.wait()).await.is_ok();
        if !tasks_drained {
            self.inner.logger.warn(format_args!(
                "{} background task(s) still running after {:?}",
                self.inner.tasks.len(),
                cancel_wait
            ));
        }

        Teardown { hook_completed, tasks_drained }
    }
}

/// Structured logger carrying the plugin's identity
#[derive(Clone)]
pub struct PluginLogger {
    plugin: Arc<str>,
    span: tracing::Span,
}

impl PluginLogger {
    fn new(plugin: &str, generation: u64) -> Self {
        Self {
            plugin: Arc::from(plugin),
            span: tracing::info_span!("plugin", name = %plugin, generation),
        }
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn debug(&self, msg: impl Display) {
        let _e = self.span.enter();
        tracing::debug!(plugin = %self.plugin, "{}", msg);
    }

    pub fn info(&self, msg: impl Display) {
        let _e = self.span.enter();
        tracing::info!(plugin = %self.plugin, "{}", msg);
    }

    pub fn warn(&self, msg: impl Display) {
        let _e = self.span.enter();
        tracing::warn!(plugin = %self.plugin, "{}", msg);
    }

    pub fn error(&self, msg: impl Display) {
        let _e = self.span.enter();
        tracing::error!(plugin = %self.plugin, "{}", msg);
    }
}

/// The shared-state registry seen from one plugin's namespace.
///
/// Once the owning instance is retired the handle is read-only: writes
/// fail with [`PluginError::Retired`], and deletes and grants do nothing.
#[derive(Clone)]
pub struct SharedHandle {
    plugin: String,
    registry: Arc<SharedStateRegistry>,
    retired: CancellationToken,
}

impl SharedHandle {
    pub fn new(plugin: impl Into<String>, registry: Arc<SharedStateRegistry>) -> Self {
        Self {
            plugin: plugin.into(),
            registry,
            retired: CancellationToken::new(),
        }
    }

    /// Tie the handle to an instance's retirement token
    pub fn retired_by(mut self, token: CancellationToken) -> Self {
        self.retired = token;
        self
    }

    /// Declare a variable readable by granted plugins. Returns false if
    /// it was already registered; the stored value is left alone.
    pub fn register_var<T: Serialize>(&self, key: &str, default: T) -> Result<bool, PluginError> {
        self.writable()?;
        let value = to_value(key, default)?;
        Ok(self.registry.register(&self.plugin, key, value))
    }

    pub fn set_var<T: Serialize>(&self, key: &str, value: T) -> Result<(), PluginError> {
        self.writable()?;
        let value = to_value(key, value)?;
        if self.registry.set(&self.plugin, key, value) {
            Ok(())
        } else {
            Err(PluginError::Retired(self.plugin.clone()))
        }
    }

    /// Typed read; falls back to `default` when absent or of another shape
    pub fn get_var<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.registry
            .get(&self.plugin, key)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(default)
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.registry.get(&self.plugin, key)
    }

    pub fn delete_var(&self, key: &str) -> bool {
        self.writable().is_ok() && self.registry.delete(&self.plugin, key)
    }

    pub fn clear_vars(&self) -> usize {
        match self.writable() {
            Ok(()) => self.registry.clear(&self.plugin),
            Err(_) => 0,
        }
    }

    pub fn get_all_vars(&self) -> BTreeMap<String, Value> {
        self.registry.get_all(&self.plugin)
    }

    pub fn grant_access_to(&self, plugin: &str) -> bool {
        self.writable().is_ok() && self.registry.grant(&self.plugin, plugin)
    }

    pub fn revoke_access_from(&self, plugin: &str) -> bool {
        self.registry.revoke(&self.plugin, plugin)
    }

    /// Read another plugin's registered variable. Denied or missing
    /// reads yield `default`.
    pub fn get_other_plugin_var<T: DeserializeOwned>(&self, owner: &str, key: &str, default: T) -> T {
        match self.registry.get_foreign(&self.plugin, owner, key) {
            Ok(Some(v)) => serde_json::from_value(v).unwrap_or(default),
            Ok(None) => default,
            Err(e) => {
                tracing::debug!(plugin = %self.plugin, owner, key, "{}", e);
                default
            }
        }
    }

    /// Like [`get_other_plugin_var`](Self::get_other_plugin_var) but
    /// reports denial as `PluginError::AccessDenied`
    pub fn try_get_other_plugin_var(&self, owner: &str, key: &str) -> Result<Option<Value>, PluginError> {
        self.registry.get_foreign(&self.plugin, owner, key)
    }

    fn writable(&self) -> Result<(), PluginError> {
        if self.retired.is_cancelled() {
            tracing::warn!(plugin = %self.plugin, "shared-state write after retirement ignored");
            return Err(PluginError::Retired(self.plugin.clone()));
        }
        Ok(())
    }
}

fn to_value<T: Serialize>(key: &str, value: T) -> Result<Value, PluginError> {
    serde_json::to_value(value).map_err(|e| PluginError::Runtime(format!("cannot store '{}': {}", key, e)))
}
