//! Plugin trait definitions

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::application::errors::PluginError;
use crate::domain::entities::Event;
use super::context::PluginContext;

/// Bumped whenever the dynamic plugin interface changes
pub const PLUGIN_ABI_VERSION: u32 = 1;

/// Core plugin trait that all plugins must implement.
///
/// One instance is constructed per generation; it receives every event
/// while it is the active instance of its slot.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Handle one inbound event. Must not block the scheduler: do
    /// blocking work with `tokio::task::spawn_blocking`.
    ///
    /// The call is abandoned at the deadline, so any state it must leave
    /// consistent should be written before the last `.await`.
    async fn handle_event(&self, event: Arc<Event>) -> Result<(), PluginError>;

    /// Optional: Human-readable description
    fn description(&self) -> &str {
        ""
    }
}

/// Builds a plugin instance from its context
pub trait PluginFactory: Send + Sync {
    fn construct(&self, ctx: PluginContext) -> Result<Box<dyn Plugin>, PluginError>;
}

impl<F> PluginFactory for F
where
    F: Fn(PluginContext) -> Result<Box<dyn Plugin>, PluginError> + Send + Sync,
{
    fn construct(&self, ctx: PluginContext) -> Result<Box<dyn Plugin>, PluginError> {
        self(ctx)
    }
}

/// Signature exported by dynamic plugin libraries
pub type PluginConstructor = fn(PluginContext) -> Result<Box<dyn Plugin>, PluginError>;

/// A loadable plugin as reported by a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    /// Plugin name, unique across all sources
    pub name: String,
    /// Which source produced this unit
    pub origin: String,
    /// Changes whenever the plugin's code changes
    pub fingerprint: String,
    /// External requirements handed to the dependency resolver
    pub dependencies: Vec<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub location: Option<PathBuf>,
}

impl SourceUnit {
    pub fn new(name: impl Into<String>, origin: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origin: origin.into(),
            fingerprint: fingerprint.into(),
            dependencies: Vec::new(),
            version: None,
            description: None,
            location: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// A freshly constructed instance plus whatever must outlive it
pub struct Instantiated {
    pub plugin: Box<dyn Plugin>,
    /// Dropped only after the plugin itself (e.g. its shared library)
    pub keepalive: Option<Arc<dyn Any + Send + Sync>>,
}

/// Where plugins come from: discovery plus construction
#[async_trait]
pub trait PluginSource: Send + Sync {
    /// Stable identifier, copied into every unit's `origin`
    fn origin(&self) -> &str;

    /// Current set of loadable units
    async fn discover(&self) -> Result<Vec<SourceUnit>, PluginError>;

    /// Construct a new instance of `unit` bound to `ctx`
    async fn instantiate(&self, unit: &SourceUnit, ctx: PluginContext) -> Result<Instantiated, PluginError>;
}

/// Makes a plugin's declared external requirements available
#[async_trait]
pub trait DependencyResolver: Send + Sync {
    /// `Err(MissingDependency)` if anything is still missing afterwards
    async fn resolve(&self, plugin: &str, dependencies: &[String]) -> Result<(), PluginError>;
}

/// Runs a constructor, turning a panic into a load failure
pub fn construct_guarded(factory: &dyn PluginFactory, ctx: PluginContext) -> Result<Box<dyn Plugin>, PluginError> {
    match catch_unwind(AssertUnwindSafe(|| factory.construct(ctx))) {
        Ok(result) => result.map_err(|e| match e {
            PluginError::Load(_) | PluginError::MissingDependency { .. } => e,
            other => PluginError::Load(other.to_string()),
        }),
        Err(payload) => Err(PluginError::Load(format!(
            "constructor panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Exports a constructor from a `cdylib` plugin crate.
///
/// ```ignore
/// struct Echo;
///
/// fn build(_ctx: PluginContext) -> Result<Box<dyn Plugin>, PluginError> {
///     Ok(Box::new(Echo))
/// }
///
/// nebula_bot::declare_plugin!(build);
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($constructor:path) => {
        #[no_mangle]
        pub extern "C" fn nebula_plugin_abi_version() -> u32 {
            $crate::plugins::PLUGIN_ABI_VERSION
        }

        #[no_mangle]
        pub fn nebula_plugin_construct(
            ctx: $crate::plugins::PluginContext,
        ) -> ::std::result::Result<
            ::std::boxed::Box<dyn $crate::plugins::Plugin>,
            $crate::application::errors::PluginError,
        > {
            $constructor(ctx)
        }
    };
}
