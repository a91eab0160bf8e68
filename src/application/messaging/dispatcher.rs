//! Event dispatcher - fans each event out to every active plugin under a
//! shared deadline

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn, Instrument};

use crate::application::errors::PluginError;
use crate::application::state::RuntimeStats;
use crate::domain::entities::Event;
use crate::plugins::manager::{LiveInstance, PluginTable};
use crate::plugins::trait_def::panic_message;
use super::dedup::DedupCache;
use super::startup::{StartupGuard, StartupStatus};

/// Identical handler failures are logged at `error` once per this window
const FAILURE_LOG_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    /// Deadline for every invocation of one event, measured from dispatch
    pub event_timeout: Duration,
    /// How long an aborted invocation may take to unwind
    pub cancel_wait: Duration,
    pub event_dedup: bool,
    pub event_window: Duration,
    pub startup_reject: bool,
    pub startup_duration: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            event_timeout: Duration::from_secs(20),
            cancel_wait: Duration::from_secs(1),
            event_dedup: false,
            event_window: Duration::from_secs(5),
            startup_reject: false,
            startup_duration: Duration::from_secs(20),
        }
    }
}

/// How one plugin's invocation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    Completed,
    Failed(PluginError),
    /// `abandoned` is set when the task had not unwound within the
    /// cancel wait
    TimedOut { abandoned: bool },
}

#[derive(Debug, Clone)]
pub struct InvocationReport {
    pub plugin: String,
    pub generation: u64,
    pub outcome: InvocationOutcome,
}

/// Outcome of one event across every plugin it reached
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub event_id: String,
    pub invocations: Vec<InvocationReport>,
}

impl DispatchReport {
    pub fn outcome_for(&self, plugin: &str) -> Option<&InvocationOutcome> {
        self.invocations
            .iter()
            .find(|inv| inv.plugin == plugin)
            .map(|inv| &inv.outcome)
    }

    pub fn completed(&self) -> usize {
        self.count(|o| matches!(o, InvocationOutcome::Completed))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, InvocationOutcome::Failed(_)))
    }

    pub fn timed_out(&self) -> usize {
        self.count(|o| matches!(o, InvocationOutcome::TimedOut { .. }))
    }

    fn count(&self, pred: impl Fn(&InvocationOutcome) -> bool) -> usize {
        self.invocations.iter().filter(|inv| pred(&inv.outcome)).count()
    }
}

/// Handle on an event's in-flight supervision
pub struct DispatchHandle {
    event_id: String,
    handle: JoinHandle<DispatchReport>,
}

impl DispatchHandle {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Waits for every invocation to finish or hit the deadline
    pub async fn report(self) -> Option<DispatchReport> {
        self.handle.await.ok()
    }
}

/// What `dispatch` did with an event
pub enum Dispatch {
    /// Dropped by the startup guard
    Rejected,
    /// Dropped as a duplicate inside the dedup window
    Suppressed,
    Dispatched(DispatchHandle),
}

impl Dispatch {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, Dispatch::Dispatched(_))
    }

    pub async fn report(self) -> Option<DispatchReport> {
        match self {
            Dispatch::Dispatched(handle) => handle.report().await,
            _ => None,
        }
    }
}

struct Invocation {
    plugin: String,
    generation: u64,
    handle: JoinHandle<Result<(), PluginError>>,
}

struct Supervision {
    stats: Arc<RuntimeStats>,
    failures: DedupCache,
    event_timeout: Duration,
    cancel_wait: Duration,
}

impl Supervision {
    async fn watch(&self, event_id: &str, mut inv: Invocation, deadline: Instant) -> InvocationReport {
        let outcome = match tokio::time::timeout_at(deadline, &mut inv.handle).await {
            Ok(Ok(Ok(()))) => InvocationOutcome::Completed,
            Ok(Ok(Err(err))) => {
                self.record_failure(event_id, &inv.plugin, &err);
                InvocationOutcome::Failed(err)
            }
            Ok(Err(join_err)) => {
                let err = if join_err.is_panic() {
                    PluginError::Runtime(format!(
                        "handler panicked: {}",
                        panic_message(join_err.into_panic().as_ref())
                    ))
                } else {
                    PluginError::Runtime("handler cancelled".to_string())
                };
                self.record_failure(event_id, &inv.plugin, &err);
                InvocationOutcome::Failed(err)
            }
            Err(_) => {
                self.stats.record_timeout();
                let err = PluginError::Timeout {
                    plugin: inv.plugin.clone(),
                    timeout_ms: self.event_timeout.as_millis() as u64,
                };
                warn!(plugin = %inv.plugin, event_id, generation = inv.generation, "{}", err);

                inv.handle.abort();
                let abandoned = tokio::time::timeout(self.cancel_wait, &mut inv.handle).await.is_err();
                if abandoned {
                    error!(
                        plugin = %inv.plugin,
                        event_id,
                        "handler refused to terminate within {:?}, abandoning it",
                        self.cancel_wait
                    );
                }
                InvocationOutcome::TimedOut { abandoned }
            }
        };

        InvocationReport {
            plugin: inv.plugin,
            generation: inv.generation,
            outcome,
        }
    }

    fn record_failure(&self, event_id: &str, plugin: &str, err: &PluginError) {
        self.stats.record_plugin_error();
        if self.failures.seen(&format!("{}:{}", plugin, err)) {
            error!(plugin, event_id, error = %err, "plugin failed handling event");
        } else {
            debug!(plugin, event_id, error = %err, "plugin failed handling event (repeat)");
        }
    }
}

/// Event dispatcher.
///
/// `dispatch` is synchronous: it admits the event, snapshots the active
/// plugins and spawns their invocations, then returns. Supervision of
/// the deadline happens on a separate task, so a slow plugin never holds
/// up the next event.
pub struct EventDispatcher {
    table: Arc<PluginTable>,
    startup: StartupGuard,
    dedup: Option<DedupCache>,
    supervision: Arc<Supervision>,
    supervisors: TaskTracker,
}

impl EventDispatcher {
    pub fn new(table: Arc<PluginTable>, stats: Arc<RuntimeStats>, settings: DispatchSettings) -> Self {
        Self {
            table,
            startup: StartupGuard::new(settings.startup_reject, settings.startup_duration),
            dedup: settings.event_dedup.then(|| DedupCache::new(settings.event_window)),
            supervision: Arc::new(Supervision {
                stats,
                failures: DedupCache::new(FAILURE_LOG_WINDOW),
                event_timeout: settings.event_timeout,
                cancel_wait: settings.cancel_wait,
            }),
            supervisors: TaskTracker::new(),
        }
    }

    /// Admit and fan out one event. Must be called from within a tokio
    /// runtime, in arrival order.
    pub fn dispatch(&self, event: Event) -> Dispatch {
        let now = Instant::now();
        let stats = &self.supervision.stats;
        stats.record_event_received();

        if self.startup.should_reject(now) {
            stats.record_event_rejected();
            debug!(event_id = %event.id, "event rejected during startup window");
            return Dispatch::Rejected;
        }

        if let Some(dedup) = &self.dedup {
            if !dedup.seen_at(&event.id, now) {
                stats.record_event_suppressed();
                debug!(event_id = %event.id, "duplicate event suppressed");
                return Dispatch::Suppressed;
            }
        }

        stats.record_event_processed();
        let event = Arc::new(event);
        let deadline = now + self.supervision.event_timeout;
        let invocations: Vec<Invocation> = self
            .table
            .active_instances()
            .into_iter()
            .map(|instance| self.spawn_invocation(instance, event.clone()))
            .collect();

        let event_id = event.id.clone();
        let supervision = self.supervision.clone();
        let id = event_id.clone();
        let handle = self.supervisors.spawn(async move {
            let reports = join_all(
                invocations
                    .into_iter()
                    .map(|inv| supervision.watch(&id, inv, deadline)),
            )
            .await;
            DispatchReport {
                event_id: id,
                invocations: reports,
            }
        });

        Dispatch::Dispatched(DispatchHandle { event_id, handle })
    }

    fn spawn_invocation(&self, instance: Arc<LiveInstance>, event: Arc<Event>) -> Invocation {
        let gauge = self.supervision.stats.track_invocation();
        let span = tracing::info_span!(
            parent: instance.context().logger().span(),
            "event",
            event_id = %event.id,
            kind = event.kind.as_str()
        );
        let plugin = instance.name().to_string();
        let generation = instance.generation();

        let handle = tokio::spawn(
            async move {
                let _gauge = gauge;
                instance.plugin().handle_event(event).await
            }
            .instrument(span),
        );

        Invocation {
            plugin,
            generation,
            handle,
        }
    }

    /// Drop expired dedup entries; returns how many went
    pub fn sweep(&self, now: Instant) -> usize {
        self.dedup.as_ref().map(|d| d.sweep(now)).unwrap_or(0)
    }

    pub fn startup_status(&self) -> StartupStatus {
        self.startup.status(Instant::now())
    }

    /// Events whose supervision is still running
    pub fn in_flight(&self) -> usize {
        self.supervisors.len()
    }

    /// Wait up to `limit` for in-flight events to finish. Returns false
    /// if some were still running.
    pub async fn drain(&self, limit: Duration) -> bool {
        self.supervisors.close();
        let drained = tokio::time::timeout(limit, self.supervisors.wait()).await.is_ok();
        self.supervisors.reopen();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::state::{FrameworkInfo, GlobalStatePublisher, SharedStateRegistry};
    use crate::domain::entities::{ChatScope, EventKind};
    use crate::infrastructure::plugins::BuiltinSource;
    use crate::plugins::{ManagerSettings, Plugin, PluginContext, PluginManager};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Recorder(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Plugin for Recorder {
        async fn handle_event(&self, event: Arc<Event>) -> Result<(), PluginError> {
            self.0.lock().unwrap().push(event.id.clone());
            Ok(())
        }
    }

    struct Sleeper(Duration);

    #[async_trait]
    impl Plugin for Sleeper {
        async fn handle_event(&self, _event: Arc<Event>) -> Result<(), PluginError> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    struct Faulty;

    #[async_trait]
    impl Plugin for Faulty {
        async fn handle_event(&self, event: Arc<Event>) -> Result<(), PluginError> {
            if event.raw_text.as_deref() == Some("panic") {
                panic!("handler blew up");
            }
            Err(PluginError::runtime("bad input"))
        }
    }

    async fn setup(source: Arc<BuiltinSource>, settings: DispatchSettings) -> (EventDispatcher, Arc<RuntimeStats>) {
        let table = Arc::new(PluginTable::new());
        let stats = Arc::new(RuntimeStats::new());
        let publisher = Arc::new(GlobalStatePublisher::new(FrameworkInfo::default(), stats.clone(), table.clone()));
        let manager = PluginManager::new(
            table.clone(),
            Arc::new(SharedStateRegistry::new()),
            publisher,
            stats.clone(),
            ManagerSettings::default(),
        )
        .with_source(source);
        manager.load_all().await;
        (EventDispatcher::new(table, stats.clone(), settings), stats)
    }

    fn event(id: &str) -> Event {
        Event::message(ChatScope::Private, 42, "hi").with_id(id)
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_plugin_does_not_delay_others() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let source = Arc::new(BuiltinSource::new());
        let log = seen.clone();
        source.register("fast", move |_ctx: PluginContext| Ok(Box::new(Recorder(log.clone())) as Box<dyn Plugin>));
        source.register("slow", |_ctx: PluginContext| {
            Ok(Box::new(Sleeper(Duration::from_secs(3600))) as Box<dyn Plugin>)
        });
        let settings = DispatchSettings {
            event_timeout: Duration::from_secs(2),
            ..DispatchSettings::default()
        };
        let (dispatcher, stats) = setup(source, settings).await;

        let started = Instant::now();
        let report = dispatcher.dispatch(event("e1")).report().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["e1".to_string()]);
        assert_eq!(report.outcome_for("fast"), Some(&InvocationOutcome::Completed));
        assert_eq!(
            report.outcome_for("slow"),
            Some(&InvocationOutcome::TimedOut { abandoned: false })
        );
        assert!(started.elapsed() <= Duration::from_secs(2) + Duration::from_millis(50));
        assert_eq!(stats.plugin_timeouts(), 1);
        assert_eq!(stats.active_invocations(), 0);
    }

    #[tokio::test]
    async fn errors_and_panics_are_isolated() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let source = Arc::new(BuiltinSource::new());
        let log = seen.clone();
        source.register("faulty", |_ctx: PluginContext| Ok(Box::new(Faulty) as Box<dyn Plugin>));
        source.register("recorder", move |_ctx: PluginContext| Ok(Box::new(Recorder(log.clone())) as Box<dyn Plugin>));
        let (dispatcher, stats) = setup(source, DispatchSettings::default()).await;

        let first = dispatcher.dispatch(event("e1")).report().await.unwrap();
        assert!(matches!(first.outcome_for("faulty"), Some(InvocationOutcome::Failed(PluginError::Runtime(_)))));

        let panicking = Event::message(ChatScope::Group, 1, "panic").with_id("e2");
        let second = dispatcher.dispatch(panicking).report().await.unwrap();
        match second.outcome_for("faulty") {
            Some(InvocationOutcome::Failed(PluginError::Runtime(msg))) => assert!(msg.contains("blew up")),
            other => panic!("unexpected outcome: {:?}", other),
        }

        assert_eq!(*seen.lock().unwrap(), vec!["e1".to_string(), "e2".to_string()]);
        assert_eq!(stats.snapshot().plugin_errors, 2);
        assert_eq!(stats.events_processed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicates_inside_window_are_suppressed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let source = Arc::new(BuiltinSource::new());
        let log = seen.clone();
        source.register("recorder", move |_ctx: PluginContext| Ok(Box::new(Recorder(log.clone())) as Box<dyn Plugin>));
        let settings = DispatchSettings {
            event_dedup: true,
            event_window: Duration::from_secs(5),
            ..DispatchSettings::default()
        };
        let (dispatcher, stats) = setup(source, settings).await;

        assert!(dispatcher.dispatch(event("same")).report().await.is_some());
        assert!(matches!(dispatcher.dispatch(event("same")), Dispatch::Suppressed));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(dispatcher.dispatch(event("same")).report().await.is_some());

        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(stats.snapshot().events_suppressed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn startup_window_rejects_then_admits() {
        let source = Arc::new(BuiltinSource::new());
        source.register("quiet", |_ctx: PluginContext| Ok(Box::new(Sleeper(Duration::ZERO)) as Box<dyn Plugin>));
        let settings = DispatchSettings {
            startup_reject: true,
            startup_duration: Duration::from_secs(10),
            ..DispatchSettings::default()
        };
        let (dispatcher, stats) = setup(source, settings).await;

        assert!(matches!(dispatcher.dispatch(Event::new(EventKind::Notice)), Dispatch::Rejected));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(dispatcher.dispatch(Event::new(EventKind::Notice)).is_dispatched());
        assert_eq!(stats.snapshot().events_rejected, 1);
    }
}
