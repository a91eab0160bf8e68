use crate::domain::entities::{PluginInfo, StateCounts};

/// Read access to the set of plugin slots, for status reporting
pub trait PluginCensus: Send + Sync {
    /// Slot count per load state
    fn counts_by_state(&self) -> StateCounts;

    /// Snapshot of every slot, sorted by name
    fn plugins(&self) -> Vec<PluginInfo>;
}
