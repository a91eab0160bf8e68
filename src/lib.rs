//! nebula-bot - plugin runtime for chat bots
//!
//! Inbound backend events are parsed, filtered (startup window, dedup)
//! and fanned out to every active plugin under a per-event deadline.
//! Plugins are hot-reloaded from their sources, share state through an
//! access-controlled registry, and call back into the backend through a
//! deduplicating outbound gateway.

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod plugins;

pub use application::errors::{BotError, ConfigError, PluginError};
pub use application::services::{BotRuntime, RuntimeBuilder, RuntimeSettings};
pub use domain::entities::Event;
pub use infrastructure::config::Config;
pub use plugins::{Plugin, PluginContext};
