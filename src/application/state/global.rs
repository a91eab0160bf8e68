//! Read-only view of framework state handed to plugins

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use crate::domain::entities::{PluginInfo, StateCounts};
use crate::domain::traits::PluginCensus;
use super::stats::{FrameworkStatus, RuntimeStats, StatsSnapshot};

/// Invocations needed before the timeout rate counts against health
const HEALTH_MIN_INVOCATIONS: u64 = 20;
const MAX_TIMEOUT_RATE: f64 = 0.25;
/// Load attempts needed before the rejection rate counts against health
const HEALTH_MIN_LOAD_ATTEMPTS: u64 = 4;
const MAX_REJECTION_RATE: f64 = 0.5;

/// Static identity of the running framework
#[derive(Debug, Clone, Serialize)]
pub struct FrameworkInfo {
    pub name: String,
    pub version: String,
    /// Non-secret configuration snapshot
    pub config: Value,
}

impl Default for FrameworkInfo {
    fn default() -> Self {
        Self {
            name: "nebula-bot".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            config: Value::Null,
        }
    }
}

/// What `get_framework_summary` returns
#[derive(Debug, Clone, Serialize)]
pub struct FrameworkSummary {
    pub name: String,
    pub version: String,
    pub status: FrameworkStatus,
    pub start_time: String,
    pub uptime_seconds: f64,
    pub plugins: StateCounts,
    pub plugins_rejected: u64,
    pub plugin_timeouts: u64,
    pub active_invocations: usize,
    pub active_background_tasks: usize,
    pub total_events_processed: u64,
    pub api_requests_total: u64,
    pub api_requests_failed: u64,
    pub is_healthy: bool,
}

/// Assembles status snapshots on demand from `RuntimeStats` and the
/// plugin census. Exposes no mutation at all, so handing it to plugins
/// is safe.
pub struct GlobalStatePublisher {
    info: FrameworkInfo,
    stats: Arc<RuntimeStats>,
    census: Arc<dyn PluginCensus>,
}

impl GlobalStatePublisher {
    pub fn new(info: FrameworkInfo, stats: Arc<RuntimeStats>, census: Arc<dyn PluginCensus>) -> Self {
        Self { info, stats, census }
    }

    pub fn get_framework_summary(&self) -> FrameworkSummary {
        let snapshot = self.stats.snapshot();
        let counts = self.census.counts_by_state();
        FrameworkSummary {
            name: self.info.name.clone(),
            version: self.info.version.clone(),
            status: snapshot.status,
            start_time: snapshot.started_at.to_rfc3339(),
            uptime_seconds: snapshot.uptime_seconds,
            plugins: counts,
            plugins_rejected: snapshot.plugins_rejected,
            plugin_timeouts: snapshot.plugin_timeouts,
            active_invocations: snapshot.active_invocations,
            active_background_tasks: snapshot.background_tasks,
            total_events_processed: snapshot.events_processed,
            api_requests_total: snapshot.outbound_requests,
            api_requests_failed: snapshot.outbound_failures,
            is_healthy: Self::healthy(&snapshot),
        }
    }

    /// Looks up one dotted variable, e.g. `framework.plugins.timeout_count`
    pub fn get_global_var(&self, path: &str, default: Value) -> Value {
        self.get_all_global_vars().remove(path).unwrap_or(default)
    }

    pub fn get_all_global_vars(&self) -> BTreeMap<String, Value> {
        let s = self.stats.snapshot();
        let counts = self.census.counts_by_state();
        let ts = |t: Option<chrono::DateTime<chrono::Utc>>| t.map(|t| json!(t.to_rfc3339())).unwrap_or(Value::Null);

        let mut vars = BTreeMap::new();
        let mut put = |key: &str, value: Value| {
            vars.insert(key.to_string(), value);
        };

        put("framework.name", json!(self.info.name));
        put("framework.version", json!(self.info.version));
        put("framework.status", json!(s.status.as_str()));
        put("framework.start_time", json!(s.started_at.to_rfc3339()));
        put("framework.config", self.info.config.clone());

        put("framework.plugins.loaded_count", json!(counts.active));
        put("framework.plugins.active_count", json!(counts.active));
        put("framework.plugins.failed_count", json!(counts.failed));
        put("framework.plugins.rejected_count", json!(s.plugins_rejected));
        put("framework.plugins.timeout_count", json!(s.plugin_timeouts));
        put("framework.plugins.reload_count", json!(s.plugin_reloads));

        put("framework.runtime.active_background_tasks", json!(s.background_tasks));
        put("framework.runtime.active_invocations", json!(s.active_invocations));
        put("framework.runtime.total_events_processed", json!(s.events_processed));
        put("framework.runtime.events_suppressed", json!(s.events_suppressed));
        put("framework.runtime.events_rejected", json!(s.events_rejected));
        put("framework.runtime.last_event_time", ts(s.last_event_at));
        put("framework.runtime.uptime_seconds", json!(s.uptime_seconds));

        put("framework.performance.api_requests_total", json!(s.outbound_requests));
        put("framework.performance.api_requests_failed", json!(s.outbound_failures));
        put("framework.performance.plugin_timeouts", json!(s.plugin_timeouts));
        put("framework.performance.plugin_errors", json!(s.plugin_errors));

        put("framework.system.last_cleanup_time", ts(s.last_cleanup_at));
        put("framework.system.last_reload_check", ts(s.last_reload_check_at));
        put("framework.system.is_healthy", json!(Self::healthy(&s)));

        vars
    }

    pub fn is_healthy(&self) -> bool {
        Self::healthy(&self.stats.snapshot())
    }

    pub fn plugins(&self) -> Vec<PluginInfo> {
        self.census.plugins()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn healthy(s: &StatsSnapshot) -> bool {
        if s.status == FrameworkStatus::ShuttingDown {
            return false;
        }
        if s.plugin_invocations >= HEALTH_MIN_INVOCATIONS {
            let rate = s.plugin_timeouts as f64 / s.plugin_invocations as f64;
            if rate > MAX_TIMEOUT_RATE {
                return false;
            }
        }
        let attempts = s.plugins_loaded + s.plugins_rejected;
        if attempts >= HEALTH_MIN_LOAD_ATTEMPTS {
            let rate = s.plugins_rejected as f64 / attempts as f64;
            if rate > MAX_REJECTION_RATE {
                return false;
            }
        }
        true
    }
}
