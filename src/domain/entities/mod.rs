//! Domain entities - Core records with no runtime dependencies

pub mod event;
pub mod plugin;

pub use event::{ChatScope, Event, EventKind};
pub use plugin::{LoadState, PluginInfo, StateCounts};
