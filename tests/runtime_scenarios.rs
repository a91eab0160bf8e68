//! End-to-end runtime behaviour
//! Run with: cargo test --test runtime_scenarios

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use nebula_bot::application::messaging::{Dispatch, InvocationOutcome};
use nebula_bot::domain::entities::{ChatScope, Event, LoadState};
use nebula_bot::domain::traits::{ApiClient, ApiResponse};
use nebula_bot::infrastructure::plugins::BuiltinSource;
use nebula_bot::{BotRuntime, Plugin, PluginContext, PluginError, RuntimeSettings};

static INIT: Once = Once::new();

fn ensure_init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn settings() -> RuntimeSettings {
    RuntimeSettings {
        hot_reload: false,
        ..RuntimeSettings::default()
    }
}

type Log = Arc<Mutex<Vec<String>>>;

/// Records the id of every event it sees
struct Recorder(Log);

#[async_trait]
impl Plugin for Recorder {
    async fn handle_event(&self, event: Arc<Event>) -> Result<(), PluginError> {
        self.0.lock().unwrap().push(event.id.clone());
        Ok(())
    }
}

/// Never returns from events whose text is "hang"
struct Sleeper;

#[async_trait]
impl Plugin for Sleeper {
    async fn handle_event(&self, event: Arc<Event>) -> Result<(), PluginError> {
        if event.raw_text.as_deref() == Some("hang") {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

struct Grumpy;

#[async_trait]
impl Plugin for Grumpy {
    async fn handle_event(&self, _event: Arc<Event>) -> Result<(), PluginError> {
        Err(PluginError::runtime("cannot handle this"))
    }
}

fn with_recorder(source: &BuiltinSource, name: &str) -> Log {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let shared = log.clone();
    source.register(name, move |_ctx: PluginContext| {
        Ok(Box::new(Recorder(shared.clone())) as Box<dyn Plugin>)
    });
    log
}

fn message(id: &str, text: &str) -> Event {
    Event::message(ChatScope::Group, 42, text).with_group(7).with_id(id)
}

#[tokio::test(start_paused = true)]
async fn hanging_plugin_is_cut_off_at_the_deadline() {
    ensure_init();
    let source = Arc::new(BuiltinSource::new());
    source.register("sleeper", |_ctx: PluginContext| Ok(Box::new(Sleeper) as Box<dyn Plugin>));
    let log = with_recorder(&source, "recorder");

    let runtime = BotRuntime::builder(settings()).with_source(source).build();
    runtime.start().await.unwrap();

    let started = tokio::time::Instant::now();
    let stuck = runtime.dispatch(message("m1", "hang"));
    let next = runtime.dispatch(message("m2", "hello"));

    let next = next.report().await.unwrap();
    assert_eq!(next.completed(), 2);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(*log.lock().unwrap(), vec!["m1".to_string(), "m2".to_string()]);

    let stuck = stuck.report().await.unwrap();
    assert_eq!(
        stuck.outcome_for("sleeper"),
        Some(&InvocationOutcome::TimedOut { abandoned: false })
    );
    assert_eq!(stuck.outcome_for("recorder"), Some(&InvocationOutcome::Completed));
    assert!(started.elapsed() >= Duration::from_secs(20));
    assert!(started.elapsed() < Duration::from_secs(22));

    let stats = runtime.publisher().stats();
    assert_eq!(stats.plugin_timeouts, 1);
    assert_eq!(stats.active_invocations, 0);
    assert_eq!(runtime.manager().table().state("sleeper"), Some(LoadState::Active));

    runtime.shutdown().await;
}

#[tokio::test]
async fn handler_errors_stay_with_their_plugin() {
    ensure_init();
    let source = Arc::new(BuiltinSource::new());
    source.register("grumpy", |_ctx: PluginContext| Ok(Box::new(Grumpy) as Box<dyn Plugin>));
    let log = with_recorder(&source, "recorder");

    let runtime = BotRuntime::builder(settings()).with_source(source).build();
    runtime.start().await.unwrap();

    for id in ["a", "b"] {
        let report = runtime.dispatch(message(id, "hi")).report().await.unwrap();
        assert_eq!(report.failed(), 1);
        assert_eq!(report.completed(), 1);
    }

    assert_eq!(log.lock().unwrap().len(), 2);
    assert_eq!(runtime.publisher().stats().plugin_errors, 2);
    assert_eq!(runtime.manager().table().state("grumpy"), Some(LoadState::Active));
    runtime.shutdown().await;
}

#[tokio::test]
async fn broken_constructors_are_rejected_not_fatal() {
    ensure_init();
    let source = Arc::new(BuiltinSource::new());
    source.register("needs-key", |_ctx: PluginContext| -> Result<Box<dyn Plugin>, PluginError> {
        Err(PluginError::Load("API key missing".to_string()))
    });
    source.register("explodes", |_ctx: PluginContext| -> Result<Box<dyn Plugin>, PluginError> {
        panic!("constructor blew up")
    });
    let log = with_recorder(&source, "recorder");

    let runtime = BotRuntime::builder(settings()).with_source(source).build();
    let summary = runtime.start().await.unwrap();

    assert_eq!(summary.loaded, vec!["recorder".to_string()]);
    assert_eq!(summary.rejected.len(), 2);
    assert_eq!(runtime.manager().table().state("explodes"), Some(LoadState::Failed));
    assert_eq!(runtime.publisher().get_framework_summary().plugins_rejected, 2);

    let report = runtime.dispatch(message("x", "hi")).report().await.unwrap();
    assert_eq!(report.invocations.len(), 1);
    assert_eq!(*log.lock().unwrap(), vec!["x".to_string()]);
    runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_event_inside_window_is_delivered_once() {
    ensure_init();
    let source = Arc::new(BuiltinSource::new());
    let log = with_recorder(&source, "recorder");

    let runtime = BotRuntime::builder(RuntimeSettings {
        event_dedup: true,
        event_dedup_window: Duration::from_secs(5),
        ..settings()
    })
    .with_source(source)
    .build();
    runtime.start().await.unwrap();

    let arrivals = ["E1", "E2", "E1", "E4", "E5"];
    let mut suppressed = 0;
    for id in arrivals {
        match runtime.dispatch(message(id, "hello")) {
            Dispatch::Suppressed => suppressed += 1,
            dispatch => {
                dispatch.report().await.unwrap();
            }
        }
    }

    assert_eq!(suppressed, 1);
    assert_eq!(*log.lock().unwrap(), vec!["E1", "E2", "E4", "E5"]);

    // outside the window the same id goes through again
    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(runtime.dispatch(message("E1", "hello")).is_dispatched());

    assert_eq!(runtime.publisher().stats().events_suppressed, 1);
    runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn events_are_refused_during_startup_window() {
    ensure_init();
    let source = Arc::new(BuiltinSource::new());
    let log = with_recorder(&source, "recorder");

    let runtime = BotRuntime::builder(RuntimeSettings {
        startup_reject_events: true,
        startup_reject_duration: Duration::from_secs(20),
        ..settings()
    })
    .with_source(source)
    .build();
    runtime.start().await.unwrap();

    assert!(matches!(runtime.dispatch(message("m", "early")), Dispatch::Rejected));
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(runtime.publisher().stats().events_rejected, 1);

    tokio::time::advance(Duration::from_secs(21)).await;
    let report = runtime.dispatch(message("m", "early")).report().await.unwrap();
    assert_eq!(report.completed(), 1);
    assert_eq!(*log.lock().unwrap(), vec!["m".to_string()]);
    runtime.shutdown().await;
}

struct Tally(PluginContext);

#[async_trait]
impl Plugin for Tally {
    async fn handle_event(&self, _event: Arc<Event>) -> Result<(), PluginError> {
        let shared = self.0.shared();
        let count: u64 = shared.get_var("message_count", 0);
        shared.set_var("message_count", count + 1)
    }
}

#[tokio::test]
async fn reload_keeps_state_and_bumps_generation() {
    ensure_init();
    let cleanups = Arc::new(AtomicUsize::new(0));
    let source = Arc::new(BuiltinSource::new());
    let counter = cleanups.clone();
    source.register("tally", move |ctx: PluginContext| {
        ctx.shared().register_var("message_count", 0_u64)?;
        let counter = counter.clone();
        ctx.register_cleanup(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        Ok(Box::new(Tally(ctx)) as Box<dyn Plugin>)
    });

    let runtime = BotRuntime::builder(settings()).with_source(source.clone()).build();
    runtime.start().await.unwrap();
    runtime.registry().set("tally", "message_count", json!(5));

    source.bump("tally");
    let update = runtime.manager().check_for_updates().await.unwrap();
    assert_eq!(update.reloaded, vec!["tally".to_string()]);

    let info = runtime.manager().table().info("tally").unwrap();
    assert_eq!(info.generation, 2);
    assert_eq!(info.state, LoadState::Active);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.registry().get("tally", "message_count"), Some(json!(5)));

    let report = runtime.dispatch(message("after", "hi")).report().await.unwrap();
    assert_eq!(report.invocations[0].generation, 2);
    assert_eq!(runtime.registry().get("tally", "message_count"), Some(json!(6)));
    assert_eq!(runtime.publisher().stats().plugin_reloads, 1);

    runtime.shutdown().await;
    assert_eq!(cleanups.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn hot_reload_worker_picks_up_new_plugins() {
    ensure_init();
    let source = Arc::new(BuiltinSource::new());
    with_recorder(&source, "first");

    let runtime = BotRuntime::builder(RuntimeSettings {
        hot_reload: true,
        hot_reload_interval: Duration::from_secs(5),
        ..RuntimeSettings::default()
    })
    .with_source(source.clone())
    .build();
    runtime.start().await.unwrap();

    let late = with_recorder(&source, "late");
    source.remove("first");
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(runtime.manager().table().state("late"), Some(LoadState::Active));
    assert_eq!(runtime.manager().table().state("first"), None);

    runtime.dispatch(message("n", "hi")).report().await.unwrap();
    assert_eq!(*late.lock().unwrap(), vec!["n".to_string()]);
    assert!(runtime.publisher().stats().last_reload_check_at.is_some());
    runtime.shutdown().await;
}

struct Idle;

#[async_trait]
impl Plugin for Idle {
    async fn handle_event(&self, _event: Arc<Event>) -> Result<(), PluginError> {
        Ok(())
    }
}

#[tokio::test]
async fn grants_are_checked_on_every_read_and_purged_on_unload() {
    ensure_init();
    let source = Arc::new(BuiltinSource::new());
    source.register("owner", |ctx: PluginContext| {
        ctx.shared().register_var("secret", "swordfish")?;
        ctx.shared().set_var("scratch", 1)?;
        Ok(Box::new(Idle) as Box<dyn Plugin>)
    });
    source.register("reader", |_ctx: PluginContext| Ok(Box::new(Idle) as Box<dyn Plugin>));
    source.register("outsider", |_ctx: PluginContext| Ok(Box::new(Idle) as Box<dyn Plugin>));

    let runtime = BotRuntime::builder(settings()).with_source(source).build();
    runtime.start().await.unwrap();

    let context = |name: &str| -> PluginContext {
        runtime
            .manager()
            .table()
            .active_instances()
            .into_iter()
            .find(|i| i.name() == name)
            .map(|i| i.context().clone())
            .unwrap()
    };
    let owner = context("owner");
    let reader = context("reader");
    let outsider = context("outsider");

    let read = |ctx: &PluginContext| ctx.shared().get_other_plugin_var("owner", "secret", String::from("default"));
    assert_eq!(read(&reader), "default");

    assert!(owner.shared().grant_access_to("reader"));
    assert_eq!(read(&reader), "swordfish");
    assert_eq!(read(&outsider), "default");
    // unregistered writes stay private even to grantees
    assert_eq!(reader.shared().get_other_plugin_var("owner", "scratch", 0), 0);

    owner.shared().revoke_access_from("reader");
    assert_eq!(read(&reader), "default");
    assert!(matches!(
        reader.shared().try_get_other_plugin_var("owner", "secret"),
        Err(PluginError::AccessDenied { .. })
    ));

    owner.shared().grant_access_to("reader");
    runtime.manager().unload("owner").await.unwrap();
    assert!(!runtime.registry().has_namespace("owner"));
    assert!(!runtime.registry().is_granted("owner", "reader"));
    assert_eq!(read(&reader), "default");
    assert!(owner.is_retired());

    let audit = runtime.registry().access_log(100);
    assert!(audit.iter().any(|r| r.reader == "outsider" && !r.allowed));
    runtime.shutdown().await;
}

/// Parks on `gate` for events whose text is "park", recording
/// `(event id, generation)` once it runs
struct Gated {
    generation: u64,
    entered: Arc<Notify>,
    gate: Arc<Notify>,
    seen: Arc<Mutex<Vec<(String, u64)>>>,
}

#[async_trait]
impl Plugin for Gated {
    async fn handle_event(&self, event: Arc<Event>) -> Result<(), PluginError> {
        if event.raw_text.as_deref() == Some("park") {
            self.entered.notify_one();
            self.gate.notified().await;
        }
        self.seen.lock().unwrap().push((event.id.clone(), self.generation));
        Ok(())
    }
}

#[tokio::test]
async fn in_flight_event_finishes_on_the_generation_it_started_on() {
    ensure_init();
    let entered = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let seen: Arc<Mutex<Vec<(String, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let source = Arc::new(BuiltinSource::new());
    {
        let (entered, gate, seen) = (entered.clone(), gate.clone(), seen.clone());
        source.register("gated", move |ctx: PluginContext| {
            Ok(Box::new(Gated {
                generation: ctx.generation(),
                entered: entered.clone(),
                gate: gate.clone(),
                seen: seen.clone(),
            }) as Box<dyn Plugin>)
        });
    }

    let runtime = BotRuntime::builder(settings()).with_source(source.clone()).build();
    runtime.start().await.unwrap();

    let parked = runtime.dispatch(message("first", "park"));
    entered.notified().await;

    source.bump("gated");
    assert_eq!(runtime.manager().reload("gated").await, Ok(2));
    assert!(seen.lock().unwrap().is_empty());

    gate.notify_one();
    let first = parked.report().await.unwrap();
    assert_eq!(first.invocations.len(), 1);
    assert_eq!(first.invocations[0].generation, 1);
    assert_eq!(first.outcome_for("gated"), Some(&InvocationOutcome::Completed));

    let second = runtime.dispatch(message("second", "hi")).report().await.unwrap();
    assert_eq!(second.invocations.len(), 1);
    assert_eq!(second.invocations[0].generation, 2);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![("first".to_string(), 1), ("second".to_string(), 2)]
    );
    runtime.shutdown().await;
}

/// Parks until released, then tries to write and grant
struct Lingering {
    ctx: PluginContext,
    entered: Arc<Notify>,
    gate: Arc<Notify>,
    granted: Arc<Mutex<Option<bool>>>,
}

#[async_trait]
impl Plugin for Lingering {
    async fn handle_event(&self, _event: Arc<Event>) -> Result<(), PluginError> {
        self.entered.notify_one();
        self.gate.notified().await;
        *self.granted.lock().unwrap() = Some(self.ctx.shared().grant_access_to("spy"));
        self.ctx.shared().set_var("secret", 99)
    }
}

#[tokio::test]
async fn handler_outliving_unload_cannot_restore_its_namespace() {
    ensure_init();
    let entered = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let granted = Arc::new(Mutex::new(None));
    let source = Arc::new(BuiltinSource::new());
    {
        let (entered, gate, granted) = (entered.clone(), gate.clone(), granted.clone());
        source.register("late", move |ctx: PluginContext| {
            ctx.shared().register_var("secret", 1)?;
            Ok(Box::new(Lingering {
                ctx,
                entered: entered.clone(),
                gate: gate.clone(),
                granted: granted.clone(),
            }) as Box<dyn Plugin>)
        });
    }

    let runtime = BotRuntime::builder(settings()).with_source(source.clone()).build();
    runtime.start().await.unwrap();

    let in_flight = runtime.dispatch(message("m", "hi"));
    entered.notified().await;
    runtime.manager().unload("late").await.unwrap();
    assert!(!runtime.registry().has_namespace("late"));

    gate.notify_one();
    let report = in_flight.report().await.unwrap();
    assert!(matches!(
        report.outcome_for("late"),
        Some(InvocationOutcome::Failed(PluginError::Retired(_)))
    ));
    assert_eq!(*granted.lock().unwrap(), Some(false));
    assert!(!runtime.registry().has_namespace("late"));
    assert_eq!(runtime.registry().get("late", "secret"), None);
    assert!(runtime.registry().grantees("late").is_empty());
    assert!(!runtime.registry().is_granted("late", "spy"));

    // a fresh load starts clean and may write again
    runtime.manager().load_all().await;
    assert_eq!(runtime.manager().table().state("late"), Some(LoadState::Active));
    assert_eq!(runtime.registry().get("late", "secret"), Some(json!(1)));
    runtime.shutdown().await;
}

struct Backend {
    calls: AtomicUsize,
}

#[async_trait]
impl ApiClient for Backend {
    async fn call(&self, _action: &str, params: Value) -> ApiResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        ApiResponse::ok(json!({ "echo": params }))
    }
}

struct Greeter(PluginContext);

#[async_trait]
impl Plugin for Greeter {
    async fn handle_event(&self, event: Arc<Event>) -> Result<(), PluginError> {
        let Some(api) = self.0.api() else {
            return Err(PluginError::runtime("no backend"));
        };
        let response = api
            .call("send_group_msg", json!({ "group_id": event.group_id, "message": "welcome" }))
            .await;
        self.0.shared().set_var("last_ok", response.is_ok())
    }
}

#[tokio::test(start_paused = true)]
async fn identical_replies_from_two_plugins_reach_backend_once() {
    ensure_init();
    let backend = Arc::new(Backend {
        calls: AtomicUsize::new(0),
    });
    let source = Arc::new(BuiltinSource::new());
    for name in ["greeter-a", "greeter-b"] {
        source.register(name, |ctx: PluginContext| Ok(Box::new(Greeter(ctx)) as Box<dyn Plugin>));
    }

    let runtime = BotRuntime::builder(RuntimeSettings {
        request_dedup: true,
        ..settings()
    })
    .with_source(source)
    .with_api_client(backend.clone())
    .build();
    runtime.start().await.unwrap();

    let report = runtime.dispatch(message("join", "hi")).report().await.unwrap();
    assert_eq!(report.completed(), 2);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.registry().get("greeter-a", "last_ok"), Some(json!(true)));
    assert_eq!(runtime.registry().get("greeter-b", "last_ok"), Some(json!(true)));

    let stats = runtime.publisher().stats();
    assert_eq!(stats.outbound_requests, 1);
    assert_eq!(stats.outbound_suppressed, 1);
    runtime.shutdown().await;
}

#[tokio::test]
async fn global_state_is_visible_to_plugins() {
    ensure_init();
    let seen = Arc::new(Mutex::new(Value::Null));
    let slot = seen.clone();
    let source = Arc::new(BuiltinSource::new());
    source.register("watcher", move |ctx: PluginContext| {
        *slot.lock().unwrap() = ctx.global_state().get_global_var("framework.name", Value::Null);
        Ok(Box::new(Idle) as Box<dyn Plugin>)
    });

    let runtime = BotRuntime::builder(settings()).with_source(source).build();
    runtime.start().await.unwrap();
    assert_eq!(*seen.lock().unwrap(), json!("nebula-bot"));

    runtime.dispatch(message("g", "hi")).report().await.unwrap();
    let vars = runtime.publisher().get_all_global_vars();
    assert_eq!(vars["framework.status"], json!("running"));
    assert_eq!(vars["framework.plugins.loaded_count"], json!(1));
    assert_eq!(vars["framework.runtime.total_events_processed"], json!(1));
    runtime.shutdown().await;
}
