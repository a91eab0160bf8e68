//! Startup protection window

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use serde::Serialize;
use tokio::time::Instant;

/// Shortest window accepted; shorter configured values are raised to it
pub const MIN_REJECT_DURATION: Duration = Duration::from_secs(10);

/// Drops inbound events for a fixed period after the runtime starts,
/// so a backlog replayed by the backend on reconnect never reaches plugins.
pub struct StartupGuard {
    enabled: bool,
    started_at: Instant,
    duration: Duration,
    rejected: AtomicU64,
}

/// Snapshot for status output
#[derive(Debug, Clone, Serialize)]
pub struct StartupStatus {
    pub enabled: bool,
    pub duration_secs: f64,
    pub remaining_secs: f64,
    pub rejected_count: u64,
    pub is_active: bool,
}

impl StartupGuard {
    pub fn new(enabled: bool, duration: Duration) -> Self {
        Self::starting_at(enabled, duration, Instant::now())
    }

    pub fn starting_at(enabled: bool, duration: Duration, started_at: Instant) -> Self {
        Self {
            enabled,
            started_at,
            duration: duration.max(MIN_REJECT_DURATION),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn is_startup_period(&self, now: Instant) -> bool {
        now.duration_since(self.started_at) < self.duration
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.duration.saturating_sub(now.duration_since(self.started_at))
    }

    /// True when the event must be dropped; counts the rejection.
    pub fn should_reject(&self, now: Instant) -> bool {
        if !self.enabled || !self.is_startup_period(now) {
            return false;
        }
        self.rejected.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn status(&self, now: Instant) -> StartupStatus {
        StartupStatus {
            enabled: self.enabled,
            duration_secs: self.duration.as_secs_f64(),
            remaining_secs: self.remaining(now).as_secs_f64(),
            rejected_count: self.rejected_count(),
            is_active: self.enabled && self.is_startup_period(now),
        }
    }
}

impl std::fmt::Display for StartupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "startup rejection: {} | {} | remaining {:.1}s | rejected {}",
            if self.enabled { "enabled" } else { "disabled" },
            if self.is_active { "active" } else { "over" },
            self.remaining_secs,
            self.rejected_count,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_only_inside_window() {
        let t0 = Instant::now();
        let guard = StartupGuard::starting_at(true, Duration::from_secs(20), t0);

        assert!(guard.should_reject(t0 + Duration::from_secs(1)));
        assert!(guard.should_reject(t0 + Duration::from_secs(19)));
        assert!(!guard.should_reject(t0 + Duration::from_secs(21)));
        assert_eq!(guard.rejected_count(), 2);
    }

    #[test]
    fn disabled_guard_never_rejects() {
        let t0 = Instant::now();
        let guard = StartupGuard::starting_at(false, Duration::from_secs(20), t0);
        assert!(!guard.should_reject(t0));
        assert_eq!(guard.rejected_count(), 0);
        assert!(!guard.status(t0).is_active);
    }

    #[test]
    fn short_durations_are_raised_to_minimum() {
        let t0 = Instant::now();
        let guard = StartupGuard::starting_at(true, Duration::from_secs(2), t0);
        assert!(guard.should_reject(t0 + Duration::from_secs(5)));
        assert_eq!(guard.status(t0).duration_secs, 10.0);
    }
}
