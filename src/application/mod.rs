//! Application layer - Use cases and runtime logic
//!
//! This layer contains:
//! - Errors: Runtime, plugin and configuration errors
//! - Messaging: Event parsing, dedup, startup guard, dispatching
//! - Services: Outbound gateway, periodic workers, the runtime facade
//! - State: Shared-variable registry, statistics, global state view

pub mod errors;
pub mod messaging;
pub mod services;
pub mod state;
