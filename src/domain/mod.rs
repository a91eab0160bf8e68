//! Domain layer - Core records and abstractions
//!
//! This layer contains:
//! - Entities: Inbound events, plugin slot snapshots
//! - Traits: Abstractions for infrastructure (ApiClient, PluginCensus)

pub mod entities;
pub mod traits;
