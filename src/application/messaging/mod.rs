//! Event handling - parsing, admission and dispatch

pub mod dedup;
pub mod dispatcher;
pub mod parser;
pub mod startup;

pub use dedup::{fingerprint, DedupCache};
pub use dispatcher::{
    Dispatch, DispatchHandle, DispatchReport, DispatchSettings, EventDispatcher, InvocationOutcome, InvocationReport,
};
pub use parser::EventParser;
pub use startup::{StartupGuard, StartupStatus};
