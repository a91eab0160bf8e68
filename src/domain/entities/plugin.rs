use chrono::{DateTime, Utc};
use serde::Serialize;

/// Load state of a plugin slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Loading,
    Active,
    Failed,
    Unloaded,
}

impl LoadState {
    pub fn as_str(&self) -> &str {
        match self {
            LoadState::Loading => "loading",
            LoadState::Active => "active",
            LoadState::Failed => "failed",
            LoadState::Unloaded => "unloaded",
        }
    }
}

/// Read-only snapshot of a plugin slot, for listing and status output
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub origin: String,
    pub generation: u64,
    pub state: LoadState,
    pub fingerprint: Option<String>,
    pub last_error: Option<String>,
    pub loaded_at: Option<DateTime<Utc>>,
}

/// Number of slots per load state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub loading: usize,
    pub active: usize,
    pub failed: usize,
    pub unloaded: usize,
}

impl StateCounts {
    pub fn record(&mut self, state: LoadState) {
        match state {
            LoadState::Loading => self.loading += 1,
            LoadState::Active => self.active += 1,
            LoadState::Failed => self.failed += 1,
            LoadState::Unloaded => self.unloaded += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.loading + self.active + self.failed + self.unloaded
    }
}
