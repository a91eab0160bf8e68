//! Application services - runtime orchestration

pub mod outbound;
pub mod runtime;
pub mod workers;

pub use outbound::{Admission, OutboundGateway, OutboundSettings};
pub use runtime::{BotRuntime, RuntimeBuilder, RuntimeSettings};
pub use workers::{spawn_periodic, Backoff};
