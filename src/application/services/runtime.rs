//! Runtime facade - wires ingress, dispatch, plugin lifecycle and the
//! background workers together

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::application::errors::BotError;
use crate::application::messaging::{Dispatch, DispatchSettings, EventDispatcher, EventParser};
use crate::application::state::{
    FrameworkInfo, FrameworkStatus, GlobalStatePublisher, RuntimeStats, SharedStateRegistry,
};
use crate::domain::entities::Event;
use crate::domain::traits::ApiClient;
use crate::plugins::{DependencyResolver, LoadSummary, ManagerSettings, PluginManager, PluginSource, PluginTable};
use super::outbound::{OutboundGateway, OutboundSettings};
use super::workers::spawn_periodic;

/// Queued events waiting for dispatch
const INGRESS_CAPACITY: usize = 1024;

/// Duration-typed runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub hot_reload: bool,
    pub hot_reload_interval: Duration,
    pub event_timeout: Duration,
    pub cancel_wait_timeout: Duration,
    pub cleanup_grace: Duration,
    pub startup_reject_events: bool,
    pub startup_reject_duration: Duration,
    pub event_dedup: bool,
    pub event_dedup_window: Duration,
    pub request_dedup: bool,
    pub request_expire: Duration,
    pub request_wait_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            hot_reload: true,
            hot_reload_interval: Duration::from_secs(5),
            event_timeout: Duration::from_secs(20),
            cancel_wait_timeout: Duration::from_secs(1),
            cleanup_grace: Duration::from_secs(1),
            startup_reject_events: false,
            startup_reject_duration: Duration::from_secs(20),
            event_dedup: false,
            event_dedup_window: Duration::from_secs(5),
            request_dedup: false,
            request_expire: Duration::from_secs(360),
            request_wait_timeout: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl RuntimeSettings {
    pub fn dispatch(&self) -> DispatchSettings {
        DispatchSettings {
            event_timeout: self.event_timeout,
            cancel_wait: self.cancel_wait_timeout,
            event_dedup: self.event_dedup,
            event_window: self.event_dedup_window,
            startup_reject: self.startup_reject_events,
            startup_duration: self.startup_reject_duration,
        }
    }

    pub fn manager(&self) -> ManagerSettings {
        ManagerSettings {
            cleanup_grace: self.cleanup_grace,
            cancel_wait: self.cancel_wait_timeout,
        }
    }

    pub fn outbound(&self) -> OutboundSettings {
        OutboundSettings {
            dedup: self.request_dedup,
            expire: self.request_expire,
            wait_timeout: self.request_wait_timeout,
        }
    }
}

/// Assembles a [`BotRuntime`]
pub struct RuntimeBuilder {
    settings: RuntimeSettings,
    info: FrameworkInfo,
    sources: Vec<Arc<dyn PluginSource>>,
    resolver: Option<Arc<dyn DependencyResolver>>,
    client: Option<Arc<dyn ApiClient>>,
}

impl RuntimeBuilder {
    pub fn new(settings: RuntimeSettings) -> Self {
        Self {
            settings,
            info: FrameworkInfo::default(),
            sources: Vec::new(),
            resolver: None,
            client: None,
        }
    }

    pub fn with_framework_info(mut self, info: FrameworkInfo) -> Self {
        self.info = info;
        self
    }

    pub fn with_source(mut self, source: Arc<dyn PluginSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DependencyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_api_client(mut self, client: Arc<dyn ApiClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> BotRuntime {
        let stats = Arc::new(RuntimeStats::new());
        let registry = Arc::new(SharedStateRegistry::new());
        let table = Arc::new(PluginTable::new());
        let publisher = Arc::new(GlobalStatePublisher::new(self.info, stats.clone(), table.clone()));
        let gateway = self
            .client
            .map(|client| Arc::new(OutboundGateway::new(client, stats.clone(), self.settings.outbound())));

        let mut manager = PluginManager::new(
            table.clone(),
            registry.clone(),
            publisher.clone(),
            stats.clone(),
            self.settings.manager(),
        );
        for source in self.sources {
            manager = manager.with_source(source);
        }
        if let Some(resolver) = self.resolver {
            manager = manager.with_resolver(resolver);
        }
        if let Some(gateway) = &gateway {
            manager = manager.with_api(gateway.clone());
        }

        let dispatcher = Arc::new(EventDispatcher::new(table, stats.clone(), self.settings.dispatch()));
        let (tx, rx) = mpsc::channel(INGRESS_CAPACITY);

        BotRuntime {
            settings: self.settings,
            stats,
            registry,
            publisher,
            manager: Arc::new(manager),
            dispatcher,
            gateway,
            parser: EventParser::new(),
            ingress: Mutex::new(Some(tx)),
            queue: Mutex::new(Some(rx)),
            shutdown: CancellationToken::new(),
            workers: TaskTracker::new(),
        }
    }
}

/// The running bot: one instance per process.
///
/// Events go in through [`submit`](Self::submit) (queued, dispatched in
/// arrival order by a single ingress task) or [`dispatch`](Self::dispatch)
/// (immediate).
pub struct BotRuntime {
    settings: RuntimeSettings,
    stats: Arc<RuntimeStats>,
    registry: Arc<SharedStateRegistry>,
    publisher: Arc<GlobalStatePublisher>,
    manager: Arc<PluginManager>,
    dispatcher: Arc<EventDispatcher>,
    gateway: Option<Arc<OutboundGateway>>,
    parser: EventParser,
    ingress: Mutex<Option<mpsc::Sender<Event>>>,
    queue: Mutex<Option<mpsc::Receiver<Event>>>,
    shutdown: CancellationToken,
    workers: TaskTracker,
}

impl BotRuntime {
    pub fn builder(settings: RuntimeSettings) -> RuntimeBuilder {
        RuntimeBuilder::new(settings)
    }

    /// Load plugins and start the ingress loop plus background workers
    pub async fn start(&self) -> Result<LoadSummary, BotError> {
        let queue = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| BotError::Internal("runtime already started".to_string()))?;

        let summary = self.manager.load_all().await;
        self.spawn_ingress(queue);
        self.spawn_workers();

        self.stats.set_status(FrameworkStatus::Running);
        info!("Startup guard: {}", self.dispatcher.startup_status());
        info!(
            plugins = summary.loaded.len(),
            rejected = summary.rejected.len(),
            "Runtime started"
        );
        Ok(summary)
    }

    fn spawn_ingress(&self, mut queue: mpsc::Receiver<Event>) {
        let dispatcher = self.dispatcher.clone();
        let token = self.shutdown.clone();
        self.workers.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = queue.recv() => event,
                };
                match event {
                    Some(event) => {
                        dispatcher.dispatch(event);
                    }
                    None => break,
                }
            }
            tracing::debug!("ingress stopped");
        });
    }

    fn spawn_workers(&self) {
        if self.settings.hot_reload {
            let manager = self.manager.clone();
            spawn_periodic(
                &self.workers,
                self.shutdown.clone(),
                "hot-reload",
                self.settings.hot_reload_interval,
                move || {
                    let manager = manager.clone();
                    async move {
                        manager.check_for_updates().await?;
                        Ok(())
                    }
                },
            );
        }

        let dispatcher = self.dispatcher.clone();
        let gateway = self.gateway.clone();
        let stats = self.stats.clone();
        spawn_periodic(
            &self.workers,
            self.shutdown.clone(),
            "dedup-sweep",
            self.settings.cleanup_interval,
            move || {
                let now = Instant::now();
                let events = dispatcher.sweep(now);
                let requests = gateway.as_ref().map(|g| g.sweep(now)).unwrap_or(0);
                stats.mark_cleanup();
                if events + requests > 0 {
                    tracing::debug!(events, requests, "expired dedup entries dropped");
                }
                async { Ok(()) }
            },
        );
    }

    /// Parse a raw backend payload and queue it
    pub async fn submit(&self, raw: Value) -> Result<(), BotError> {
        let event = self.parser.parse(raw)?;
        self.submit_event(event).await
    }

    pub async fn submit_event(&self, event: Event) -> Result<(), BotError> {
        let sender = self
            .ingress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BotError::ShuttingDown)?;
        sender.send(event).await.map_err(|_| BotError::ShuttingDown)
    }

    /// Dispatch immediately, bypassing the ingress queue
    pub fn dispatch(&self, event: Event) -> Dispatch {
        self.dispatcher.dispatch(event)
    }

    /// Stop ingress and workers, wait for in-flight events, then retire
    /// every plugin
    pub async fn shutdown(&self) {
        if self.stats.status() == FrameworkStatus::ShuttingDown {
            return;
        }
        self.stats.set_status(FrameworkStatus::ShuttingDown);
        info!("Shutting down");

        self.ingress.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.shutdown.cancel();
        self.workers.close();
        self.workers.wait().await;

        let limit = self.settings.event_timeout + self.settings.cancel_wait_timeout;
        if !self.dispatcher.drain(limit).await {
            warn!(in_flight = self.dispatcher.in_flight(), "events still in flight at shutdown");
        }

        self.manager.shutdown_all().await;
        info!("Shutdown complete");
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn stats(&self) -> &Arc<RuntimeStats> {
        &self.stats
    }

    pub fn registry(&self) -> &Arc<SharedStateRegistry> {
        &self.registry
    }

    pub fn publisher(&self) -> &Arc<GlobalStatePublisher> {
        &self.publisher
    }

    pub fn manager(&self) -> &Arc<PluginManager> {
        &self.manager
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn gateway(&self) -> Option<&Arc<OutboundGateway>> {
        self.gateway.as_ref()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
