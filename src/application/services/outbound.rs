//! Outbound API gateway - request dedup in front of the backend client

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::application::messaging::dedup::fingerprint;
use crate::application::state::RuntimeStats;
use crate::domain::traits::{ApiClient, ApiResponse};

#[derive(Debug, Clone, Copy)]
pub struct OutboundSettings {
    pub dedup: bool,
    /// How long a fingerprint stays tracked
    pub expire: Duration,
    /// How long a duplicate waits on the first call's result
    pub wait_timeout: Duration,
}

impl Default for OutboundSettings {
    fn default() -> Self {
        Self {
            dedup: false,
            expire: Duration::from_secs(360),
            wait_timeout: Duration::from_secs(10),
        }
    }
}

/// Whether a request with a given fingerprint would go out now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Suppress,
}

enum Tracked {
    Pending {
        since: Instant,
        result: watch::Receiver<Option<ApiResponse>>,
    },
    Completed {
        at: Instant,
        response: ApiResponse,
    },
}

impl Tracked {
    fn started(&self) -> Instant {
        match self {
            Tracked::Pending { since, .. } => *since,
            Tracked::Completed { at, .. } => *at,
        }
    }
}

enum Admit {
    Issue(watch::Sender<Option<ApiResponse>>),
    Replay(ApiResponse),
    Await(watch::Receiver<Option<ApiResponse>>),
}

/// Sends plugin API calls to the backend.
///
/// With dedup on, identical requests (same action and parameters) inside
/// the expiry window are collapsed: a duplicate of an in-flight call
/// waits for its result, a duplicate of a successful call gets the
/// stored result. Failed calls are forgotten so they can be retried.
pub struct OutboundGateway {
    client: Arc<dyn ApiClient>,
    stats: Arc<RuntimeStats>,
    settings: OutboundSettings,
    tracked: Mutex<HashMap<String, Tracked>>,
}

impl OutboundGateway {
    pub fn new(client: Arc<dyn ApiClient>, stats: Arc<RuntimeStats>, settings: OutboundSettings) -> Self {
        Self {
            client,
            stats,
            settings,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Would a request with this fingerprint be sent right now?
    pub fn dedupe(&self, fingerprint: &str) -> Admission {
        if !self.settings.dedup {
            return Admission::Allow;
        }
        let now = Instant::now();
        match self.lock().get(fingerprint) {
            Some(entry) if now.duration_since(entry.started()) < self.settings.expire => Admission::Suppress,
            _ => Admission::Allow,
        }
    }

    /// Call a backend action, collapsing duplicates when enabled
    pub async fn call(&self, action: &str, params: Value) -> ApiResponse {
        if !self.settings.dedup {
            return self.send(action, params).await;
        }

        let key = fingerprint(action, &params);
        match self.admit(&key) {
            Admit::Issue(tx) => {
                let mut pending = PendingGuard {
                    gateway: self,
                    key: &key,
                    armed: true,
                };
                let response = self.send(action, params).await;
                pending.armed = false;
                self.complete(&key, &response);
                let _ = tx.send(Some(response.clone()));
                response
            }
            Admit::Replay(response) => {
                self.stats.record_outbound_suppressed();
                debug!(action, "replaying stored response for duplicate request");
                response
            }
            Admit::Await(mut rx) => {
                self.stats.record_outbound_suppressed();
                debug!(action, "duplicate request waiting on in-flight call");
                let waited = tokio::time::timeout(self.settings.wait_timeout, rx.wait_for(Option::is_some)).await;
                match waited {
                    Ok(Ok(result)) => (*result).clone().unwrap_or_else(ApiResponse::duplicate_suppressed),
                    _ => ApiResponse::duplicate_suppressed(),
                }
            }
        }
    }

    /// Forget entries older than the expiry; returns how many went
    pub fn sweep(&self, now: Instant) -> usize {
        let expire = self.settings.expire;
        let mut tracked = self.lock();
        let before = tracked.len();
        tracked.retain(|_, entry| now.duration_since(entry.started()) < expire);
        before - tracked.len()
    }

    pub fn tracked(&self) -> usize {
        self.lock().len()
    }

    async fn send(&self, action: &str, params: Value) -> ApiResponse {
        let response = self.client.call(action, params).await;
        self.stats.record_outbound(response.is_ok());
        response
    }

    fn admit(&self, key: &str) -> Admit {
        let now = Instant::now();
        let mut tracked = self.lock();
        match tracked.get(key) {
            Some(entry) if now.duration_since(entry.started()) < self.settings.expire => match entry {
                Tracked::Pending { result, .. } => return Admit::Await(result.clone()),
                Tracked::Completed { response, .. } => return Admit::Replay(response.clone()),
            },
            _ => {}
        }
        let (tx, rx) = watch::channel(None);
        tracked.insert(key.to_string(), Tracked::Pending { since: now, result: rx });
        Admit::Issue(tx)
    }

    fn complete(&self, key: &str, response: &ApiResponse) {
        let mut tracked = self.lock();
        if response.is_ok() {
            tracked.insert(
                key.to_string(),
                Tracked::Completed {
                    at: Instant::now(),
                    response: response.clone(),
                },
            );
        } else {
            tracked.remove(key);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Tracked>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears a pending entry if the issuing call is dropped mid-flight
struct PendingGuard<'a> {
    gateway: &'a OutboundGateway,
    key: &'a str,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.gateway.lock().remove(self.key);
        }
    }
}
