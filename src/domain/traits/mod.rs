//! Domain traits - Abstractions for infrastructure implementations

pub mod backend;
pub mod census;

pub use backend::{ApiClient, ApiResponse, ApiStatus};
pub use census::PluginCensus;
