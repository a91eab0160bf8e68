use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use nebula_bot::application::services::spawn_periodic;
use nebula_bot::application::state::FrameworkInfo;
use nebula_bot::infrastructure::adapters::{ConsoleAdapter, HttpApiClient};
use nebula_bot::infrastructure::config::{Config, ConfigWatcher, CONFIG_WATCH_INTERVAL};
use nebula_bot::infrastructure::plugins::{CommandResolver, DirectorySource};
use nebula_bot::{BotError, BotRuntime, RuntimeSettings};

#[derive(Parser)]
#[command(name = "nebula-bot")]
#[command(about = "Plugin runtime for chat bots", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Backend token (overrides config and BOT_TOKEN)
    #[arg(short, long, global = true)]
    token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the runtime, reading events from stdin
    Run,
    /// Show version
    Version,
    /// Print the default config
    InitConfig,
    /// Load and validate the config
    CheckConfig,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("nebula-bot v{}", env!("CARGO_PKG_VERSION"));
        }
        Commands::InitConfig => init_config(),
        Commands::CheckConfig => {
            let _ = init_logging(None);
            match load_config(&cli.config, cli.token) {
                Ok(config) => print_summary(&config),
                Err(e) => {
                    tracing::error!("{}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Run => {
            let config = load_config(&cli.config, cli.token);
            let log_filter = init_logging(config.as_ref().ok());
            let config = match config {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!("Refusing to start: {}", e);
                    std::process::exit(1);
                }
            };
            // RUST_LOG wins over the file, so there is nothing to watch for
            let watcher = log_filter.map(|handle| (ConfigWatcher::new(&cli.config, &config), handle));
            if let Err(e) = run_bot(config, watcher) {
                tracing::error!("{}", e);
                std::process::exit(1);
            }
        }
    }
}

type LogFilter = reload::Handle<EnvFilter, Registry>;

/// Returns the filter handle when the level came from the config rather
/// than `RUST_LOG`.
fn init_logging(config: Option<&Config>) -> Option<LogFilter> {
    let directive = config.map(Config::log_directive).unwrap_or_else(|| "info".to_string());
    let (filter, from_config) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, false),
        Err(_) => (EnvFilter::new(directive), true),
    };
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
    from_config.then_some(handle)
}

/// Re-apply the log level whenever the config file's logging section changes
fn watch_config(tracker: &TaskTracker, stop: CancellationToken, mut watcher: ConfigWatcher, filter: LogFilter) {
    tracing::debug!("Watching {} for log level changes", watcher.path().display());
    spawn_periodic(tracker, stop, "config-watch", CONFIG_WATCH_INTERVAL, move || {
        let applied = watcher.poll().map_err(BotError::from).and_then(|changed| match changed {
            Some(directive) => {
                filter
                    .reload(EnvFilter::new(&directive))
                    .map_err(|e| BotError::Internal(format!("log filter reload failed: {}", e)))?;
                tracing::info!("Log level is now '{}'", directive);
                Ok(())
            }
            None => Ok(()),
        });
        std::future::ready(applied)
    });
}

/// File (when present) then environment, then the CLI token, then validation
fn load_config(path: &Path, token_override: Option<String>) -> Result<Config, BotError> {
    let mut config = if path.exists() {
        let mut config = Config::load(path)?;
        config.apply_env()?;
        config
    } else {
        Config::load_env()?
    };
    if let Some(token) = token_override {
        config.backend.token = Some(token);
    }
    config.validate()?;
    Ok(config)
}

fn run_bot(config: Config, watcher: Option<(ConfigWatcher, LogFilter)>) -> Result<(), BotError> {
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    rt.block_on(serve(config, watcher))
}

async fn serve(config: Config, watcher: Option<(ConfigWatcher, LogFilter)>) -> Result<(), BotError> {
    tracing::info!("Starting {}", config.bot.name);

    let mut resolver = CommandResolver::new();
    if config.plugins.auto_install_modules {
        match &config.plugins.install_command {
            Some(command) => {
                resolver = resolver.with_install_command(
                    command,
                    Duration::from_secs(config.plugins.module_install_timeout),
                );
            }
            None => tracing::warn!("auto-install-modules is on but no install-command is configured"),
        }
    }

    let info = FrameworkInfo {
        name: config.bot.name.clone(),
        config: config.public_snapshot(),
        ..FrameworkInfo::default()
    };

    let runtime = BotRuntime::builder(RuntimeSettings::from(&config))
        .with_framework_info(info)
        .with_source(Arc::new(DirectorySource::new(&config.plugins.directory)))
        .with_resolver(Arc::new(resolver))
        .with_api_client(Arc::new(HttpApiClient::from_config(&config)))
        .build();

    let summary = runtime.start().await?;
    for (name, reason) in &summary.rejected {
        tracing::warn!(plugin = %name, "Plugin rejected: {}", reason);
    }

    let stop = CancellationToken::new();
    let workers = TaskTracker::new();
    if let Some((watcher, filter)) = watcher {
        watch_config(&workers, stop.clone(), watcher, filter);
    }
    let ctrl_c = {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received");
                stop.cancel();
            }
        })
    };

    let outcome = ConsoleAdapter::stdin().run(&runtime, stop.clone()).await;
    ctrl_c.abort();
    stop.cancel();
    workers.close();
    workers.wait().await;
    runtime.shutdown().await;

    let console = outcome?;
    tracing::info!(submitted = console.submitted, skipped = console.skipped, "Console closed");
    Ok(())
}

fn print_summary(config: &Config) {
    println!("Config OK");
    println!("  backend:        {}", config.backend.api_base_url);
    println!("  plugins:        {}", config.plugins.directory.display());
    println!(
        "  hot reload:     {} (every {}s)",
        config.plugins.hot_reload, config.plugins.hot_reload_interval
    );
    println!("  event timeout:  {}s", config.plugins.event_timeout);
    println!(
        "  startup guard:  {} ({}s)",
        config.startup.reject_events, config.startup.reject_duration
    );
    println!(
        "  dedup:          events {} / requests {}",
        config.dedup.enable_event, config.dedup.enable_request
    );
}

fn init_config() {
    match Config::default().to_yaml() {
        Ok(yaml) => {
            println!("{}", yaml);
            println!("\nSave this to config.yaml and adjust as needed.");
        }
        Err(e) => eprintln!("{}", e),
    }
}
