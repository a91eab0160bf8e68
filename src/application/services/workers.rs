//! Periodic background workers

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::application::errors::BotError;

/// Failing iterations stretch the delay up to this multiple of the interval
pub const MAX_BACKOFF_FACTOR: u32 = 16;

/// Doubling delay, reset on success
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self { base, current: base }
    }

    /// Delay before the next iteration after a failure
    pub fn fail(&mut self) -> Duration {
        let cap = self.base * MAX_BACKOFF_FACTOR;
        self.current = (self.current * 2).min(cap);
        self.current
    }

    pub fn succeed(&mut self) -> Duration {
        self.current = self.base;
        self.current
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Runs `tick` now and then every `interval` until `token` is cancelled.
/// An `Err` is logged and backs the schedule off.
pub fn spawn_periodic<F, Fut>(
    tracker: &TaskTracker,
    token: CancellationToken,
    name: &'static str,
    interval: Duration,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), BotError>> + Send + 'static,
{
    tracker.spawn(async move {
        let mut backoff = Backoff::new(interval);
        tracing::debug!(worker = name, interval_ms = interval.as_millis() as u64, "worker started");
        loop {
            let delay = match tick().await {
                Ok(()) => backoff.succeed(),
                Err(e) => {
                    let delay = backoff.fail();
                    tracing::warn!(worker = name, error = %e, retry_in_ms = delay.as_millis() as u64, "worker iteration failed");
                    delay
                }
            };
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::debug!(worker = name, "worker stopped");
    })
}
