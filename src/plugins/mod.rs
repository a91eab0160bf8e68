//! Plugin system for nebula-bot
//!
//! Plugin trait, per-instance context, and the lifecycle manager that
//! loads, hot-reloads and retires instances.

pub mod context;
pub mod manager;
pub mod trait_def;

pub use context::{PluginContext, PluginLogger, SharedHandle, Teardown};
pub use manager::{LiveInstance, LoadSummary, ManagerSettings, PluginDescriptor, PluginManager, PluginTable, UpdateSummary};
pub use trait_def::{
    DependencyResolver, Instantiated, Plugin, PluginConstructor, PluginFactory, PluginSource, SourceUnit,
    PLUGIN_ABI_VERSION,
};
