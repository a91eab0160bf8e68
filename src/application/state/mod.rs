//! Cross-plugin state: shared variables, runtime statistics, and the
//! read-only global view built from them

pub mod global;
pub mod shared;
pub mod stats;

pub use global::{FrameworkInfo, FrameworkSummary, GlobalStatePublisher};
pub use shared::{AccessRecord, SharedStateRegistry, SharedVariable};
pub use stats::{FrameworkStatus, RuntimeStats, StatsSnapshot};
