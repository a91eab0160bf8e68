//! Infrastructure layer - External concerns
//!
//! This layer contains:
//! - Config: YAML + environment configuration
//! - Adapters: Console ingress and the backend HTTP client
//! - Plugins: Builtin and on-disk plugin sources, dependency resolvers

pub mod adapters;
pub mod config;
pub mod plugins;
