//! Runtime counters and gauges
//!
//! Mutated by the dispatcher, the lifecycle manager and the outbound
//! gateway; read through `GlobalStatePublisher`. Counters are grouped
//! and lock-free so recording never serializes plugin activity.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

/// Recent load failures kept for status output
pub const REJECTION_HISTORY: usize = 100;

/// Framework lifecycle as reported to plugins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameworkStatus {
    Initializing,
    Running,
    ShuttingDown,
}

impl FrameworkStatus {
    pub fn as_str(&self) -> &str {
        match self {
            FrameworkStatus::Initializing => "initializing",
            FrameworkStatus::Running => "running",
            FrameworkStatus::ShuttingDown => "shutting_down",
        }
    }
}

/// A plugin that failed to load, and why
#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub plugin: String,
    pub cause: String,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct EventCounters {
    received: AtomicU64,
    processed: AtomicU64,
    suppressed: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Default)]
struct PluginCounters {
    loaded: AtomicU64,
    rejected: AtomicU64,
    reloads: AtomicU64,
    unloads: AtomicU64,
    invocations: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
}

#[derive(Default)]
struct ApiCounters {
    requests: AtomicU64,
    failures: AtomicU64,
    suppressed: AtomicU64,
}

#[derive(Default)]
struct Marks {
    last_event_at: Option<DateTime<Utc>>,
    last_cleanup_at: Option<DateTime<Utc>>,
    last_reload_check_at: Option<DateTime<Utc>>,
}

pub struct RuntimeStats {
    started_at: Instant,
    started_wall: DateTime<Utc>,
    status: RwLock<FrameworkStatus>,
    events: EventCounters,
    plugins: PluginCounters,
    api: ApiCounters,
    active_invocations: AtomicUsize,
    background_tasks: AtomicUsize,
    marks: Mutex<Marks>,
    rejections: Mutex<VecDeque<Rejection>>,
}

/// Plain copy of every counter at one instant
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub status: FrameworkStatus,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: f64,
    pub events_received: u64,
    pub events_processed: u64,
    pub events_suppressed: u64,
    pub events_rejected: u64,
    pub plugins_loaded: u64,
    pub plugins_rejected: u64,
    pub plugin_reloads: u64,
    pub plugin_unloads: u64,
    pub plugin_invocations: u64,
    pub plugin_timeouts: u64,
    pub plugin_errors: u64,
    pub outbound_requests: u64,
    pub outbound_failures: u64,
    pub outbound_suppressed: u64,
    pub active_invocations: usize,
    pub background_tasks: usize,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_cleanup_at: Option<DateTime<Utc>>,
    pub last_reload_check_at: Option<DateTime<Utc>>,
}

impl Default for RuntimeStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            started_wall: Utc::now(),
            status: RwLock::new(FrameworkStatus::Initializing),
            events: EventCounters::default(),
            plugins: PluginCounters::default(),
            api: ApiCounters::default(),
            active_invocations: AtomicUsize::new(0),
            background_tasks: AtomicUsize::new(0),
            marks: Mutex::new(Marks::default()),
            rejections: Mutex::new(VecDeque::new()),
        }
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn uptime(&self) -> Duration {
        Instant::now().duration_since(self.started_at)
    }

    pub fn status(&self) -> FrameworkStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_status(&self, status: FrameworkStatus) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    // events

    pub fn record_event_received(&self) {
        self.events.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_processed(&self) {
        self.events.processed.fetch_add(1, Ordering::Relaxed);
        self.marks().last_event_at = Some(Utc::now());
    }

    pub fn record_event_suppressed(&self) {
        self.events.suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_rejected(&self) {
        self.events.rejected.fetch_add(1, Ordering::Relaxed);
    }

    // plugins

    pub fn record_plugin_loaded(&self) {
        self.plugins.loaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_plugin_rejected(&self, plugin: &str, cause: &str) {
        self.plugins.rejected.fetch_add(1, Ordering::Relaxed);
        let mut rejections = self.rejections.lock().unwrap_or_else(PoisonError::into_inner);
        if rejections.len() >= REJECTION_HISTORY {
            rejections.pop_front();
        }
        rejections.push_back(Rejection {
            plugin: plugin.to_string(),
            cause: cause.to_string(),
            at: Utc::now(),
        });
    }

    pub fn record_plugin_reload(&self) {
        self.plugins.reloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_plugin_unloaded(&self) {
        self.plugins.unloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.plugins.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_plugin_error(&self) {
        self.plugins.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one invocation and keeps it in the active gauge until the
    /// returned guard drops.
    pub fn track_invocation(self: &Arc<Self>) -> GaugeGuard {
        self.plugins.invocations.fetch_add(1, Ordering::Relaxed);
        GaugeGuard::new(self.clone(), Gauge::Invocations)
    }

    /// Keeps a plugin background task in the gauge until the guard drops
    pub fn track_background_task(self: &Arc<Self>) -> GaugeGuard {
        GaugeGuard::new(self.clone(), Gauge::BackgroundTasks)
    }

    // outbound

    pub fn record_outbound(&self, success: bool) {
        self.api.requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.api.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_outbound_suppressed(&self) {
        self.api.suppressed.fetch_add(1, Ordering::Relaxed);
    }

    // system marks

    pub fn mark_cleanup(&self) {
        self.marks().last_cleanup_at = Some(Utc::now());
    }

    pub fn mark_reload_check(&self) {
        self.marks().last_reload_check_at = Some(Utc::now());
    }

    pub fn plugin_timeouts(&self) -> u64 {
        self.plugins.timeouts.load(Ordering::Relaxed)
    }

    pub fn events_processed(&self) -> u64 {
        self.events.processed.load(Ordering::Relaxed)
    }

    pub fn active_invocations(&self) -> usize {
        self.active_invocations.load(Ordering::Relaxed)
    }

    pub fn rejections(&self) -> Vec<Rejection> {
        self.rejections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let marks = self.marks();
        StatsSnapshot {
            status: self.status(),
            started_at: self.started_wall,
            uptime_seconds: self.uptime().as_secs_f64(),
            events_received: self.events.received.load(Ordering::Relaxed),
            events_processed: self.events.processed.load(Ordering::Relaxed),
            events_suppressed: self.events.suppressed.load(Ordering::Relaxed),
            events_rejected: self.events.rejected.load(Ordering::Relaxed),
            plugins_loaded: self.plugins.loaded.load(Ordering::Relaxed),
            plugins_rejected: self.plugins.rejected.load(Ordering::Relaxed),
            plugin_reloads: self.plugins.reloads.load(Ordering::Relaxed),
            plugin_unloads: self.plugins.unloads.load(Ordering::Relaxed),
            plugin_invocations: self.plugins.invocations.load(Ordering::Relaxed),
            plugin_timeouts: self.plugins.timeouts.load(Ordering::Relaxed),
            plugin_errors: self.plugins.errors.load(Ordering::Relaxed),
            outbound_requests: self.api.requests.load(Ordering::Relaxed),
            outbound_failures: self.api.failures.load(Ordering::Relaxed),
            outbound_suppressed: self.api.suppressed.load(Ordering::Relaxed),
            active_invocations: self.active_invocations.load(Ordering::Relaxed),
            background_tasks: self.background_tasks.load(Ordering::Relaxed),
            last_event_at: marks.last_event_at,
            last_cleanup_at: marks.last_cleanup_at,
            last_reload_check_at: marks.last_reload_check_at,
        }
    }

    fn marks(&self) -> MutexGuard<'_, Marks> {
        self.marks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn gauge(&self, gauge: Gauge) -> &AtomicUsize {
        match gauge {
            Gauge::Invocations => &self.active_invocations,
            Gauge::BackgroundTasks => &self.background_tasks,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Gauge {
    Invocations,
    BackgroundTasks,
}

/// Decrements its gauge on drop, including when the owning task is
/// aborted mid-flight.
pub struct GaugeGuard {
    stats: Arc<RuntimeStats>,
    gauge: Gauge,
}

impl GaugeGuard {
    fn new(stats: Arc<RuntimeStats>, gauge: Gauge) -> Self {
        stats.gauge(gauge).fetch_add(1, Ordering::Relaxed);
        Self { stats, gauge }
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.stats.gauge(self.gauge).fetch_sub(1, Ordering::Relaxed);
    }
}
