//! Configuration management

use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::application::errors::ConfigError;
use crate::application::messaging::startup::MIN_REJECT_DURATION;
use crate::application::services::RuntimeSettings;

mod watch;

pub use watch::{ConfigWatcher, CONFIG_WATCH_INTERVAL};

const MIN_TOKEN_LEN: usize = 16;
const MIN_TOKEN_CLASSES: usize = 3;

const MIN_REQUEST_CLEANUP_SECS: u64 = 60;
const MIN_REQUEST_EXPIRE_SECS: u64 = 300;
const MIN_REQUEST_WAIT_SECS: u64 = 10;

static TOKEN_CLASSES: Lazy<[Regex; 4]> = Lazy::new(|| {
    [r"[A-Z]", r"[a-z]", r"[0-9]", r"[^A-Za-z0-9]"].map(|p| Regex::new(p).expect("static character class"))
});

/// Bot configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub bot: BotConfig,
    pub backend: BackendConfig,
    pub plugins: PluginConfig,
    pub startup: StartupConfig,
    pub dedup: DedupConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BotConfig {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BackendConfig {
    pub api_base_url: String,
    /// Bearer token shared with the backend; must be strong
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PluginConfig {
    pub directory: PathBuf,
    pub hot_reload: bool,
    /// Seconds between change checks
    pub hot_reload_interval: u64,
    /// Seconds each plugin gets per event
    pub event_timeout: u64,
    pub cancel_wait_timeout: u64,
    pub cleanup_grace: u64,
    pub auto_install_modules: bool,
    pub module_install_timeout: u64,
    /// `{}` is replaced by the dependency name
    pub install_command: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StartupConfig {
    pub reject_events: bool,
    pub reject_duration: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DedupConfig {
    pub enable_event: bool,
    pub event_window: u64,
    pub enable_request: bool,
    pub request_expire: u64,
    pub request_cleanup_interval: u64,
    pub request_wait_timeout: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ApiConfig {
    pub timeout_normal: u64,
    pub timeout_long: u64,
    pub max_retries: u32,
    /// Actions that get the long timeout (uploads and the like)
    pub long_actions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LoggingConfig {
    pub level: String,
    pub debug: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: "nebula-bot".to_string(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000".to_string(),
            token: None,
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./plugins"),
            hot_reload: true,
            hot_reload_interval: 5,
            event_timeout: 20,
            cancel_wait_timeout: 1,
            cleanup_grace: 1,
            auto_install_modules: false,
            module_install_timeout: 300,
            install_command: None,
        }
    }
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            reject_events: false,
            reject_duration: 20,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enable_event: false,
            event_window: 5,
            enable_request: false,
            request_expire: 360,
            request_cleanup_interval: 60,
            request_wait_timeout: 10,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            timeout_normal: 10,
            timeout_long: 60,
            max_retries: 3,
            long_actions: vec![
                "upload_group_file".to_string(),
                "upload_private_file".to_string(),
                "download_file".to_string(),
                "get_record".to_string(),
                "get_image".to_string(),
            ],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            debug: false,
        }
    }
}

impl Config {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Parse(format!("Failed to read config: {}", e)))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(format!("Failed to parse config: {}", e)))
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::Parse(format!("Failed to render config: {}", e)))
    }

    /// Defaults plus environment overrides
    pub fn load_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply recognised environment variables on top of the current values
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(token) = var("BOT_TOKEN") {
            self.backend.token = Some(token);
        }
        if let Some(url) = var("API_BASE_URL") {
            self.backend.api_base_url = url;
        }
        if let Some(v) = var("HOT_RELOAD") {
            self.plugins.hot_reload = parse_flag("HOT_RELOAD", &v)?;
        }
        if let Some(v) = var("PLUGIN_EVENT_TIMEOUT") {
            self.plugins.event_timeout = parse_secs("PLUGIN_EVENT_TIMEOUT", &v)?;
        }
        if let Some(v) = var("AUTO_INSTALL_MODULES") {
            self.plugins.auto_install_modules = parse_flag("AUTO_INSTALL_MODULES", &v)?;
        }
        if let Some(v) = var("STARTUP_REJECT_EVENTS") {
            self.startup.reject_events = parse_flag("STARTUP_REJECT_EVENTS", &v)?;
        }
        if let Some(v) = var("STARTUP_REJECT_DURATION") {
            self.startup.reject_duration = parse_secs("STARTUP_REJECT_DURATION", &v)?;
        }
        if let Some(v) = var("ENABLE_EVENT_DEDUPLICATION") {
            self.dedup.enable_event = parse_flag("ENABLE_EVENT_DEDUPLICATION", &v)?;
        }
        if let Some(v) = var("ENABLE_REQUEST_DEDUPLICATION") {
            self.dedup.enable_request = parse_flag("ENABLE_REQUEST_DEDUPLICATION", &v)?;
        }
        Ok(())
    }

    /// Clamp out-of-range values and check the token. A weak or missing
    /// token is the one condition that refuses startup.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let min_reject = MIN_REJECT_DURATION.as_secs();
        if self.startup.reject_duration < min_reject {
            tracing::warn!(
                "startup.reject-duration {}s below minimum, using {}s",
                self.startup.reject_duration,
                min_reject
            );
            self.startup.reject_duration = min_reject;
        }
        clamp_min(&mut self.dedup.request_cleanup_interval, MIN_REQUEST_CLEANUP_SECS, "dedup.request-cleanup-interval");
        clamp_min(&mut self.dedup.request_expire, MIN_REQUEST_EXPIRE_SECS, "dedup.request-expire");
        clamp_min(&mut self.dedup.request_wait_timeout, MIN_REQUEST_WAIT_SECS, "dedup.request-wait-timeout");

        if self.plugins.event_timeout == 0 {
            return Err(ConfigError::InvalidValue("plugins.event-timeout must be positive".to_string()));
        }
        if self.plugins.hot_reload && self.plugins.hot_reload_interval == 0 {
            return Err(ConfigError::InvalidValue("plugins.hot-reload-interval must be positive".to_string()));
        }

        validate_token(self.backend.token.as_deref())
    }

    /// Non-secret view published to plugins as `framework.config`
    pub fn public_snapshot(&self) -> serde_json::Value {
        let mut redacted = self.clone();
        redacted.backend.token = redacted.backend.token.map(|_| "***".to_string());
        serde_json::to_value(&redacted).unwrap_or(serde_json::Value::Null)
    }

    /// Filter directive for `tracing_subscriber::EnvFilter`
    pub fn log_directive(&self) -> String {
        if self.logging.debug {
            "debug".to_string()
        } else {
            self.logging.level.clone()
        }
    }
}

impl From<&Config> for RuntimeSettings {
    fn from(config: &Config) -> Self {
        let secs = Duration::from_secs;
        Self {
            hot_reload: config.plugins.hot_reload,
            hot_reload_interval: secs(config.plugins.hot_reload_interval),
            event_timeout: secs(config.plugins.event_timeout),
            cancel_wait_timeout: secs(config.plugins.cancel_wait_timeout),
            cleanup_grace: secs(config.plugins.cleanup_grace),
            startup_reject_events: config.startup.reject_events,
            startup_reject_duration: secs(config.startup.reject_duration),
            event_dedup: config.dedup.enable_event,
            event_dedup_window: secs(config.dedup.event_window),
            request_dedup: config.dedup.enable_request,
            request_expire: secs(config.dedup.request_expire),
            request_wait_timeout: secs(config.dedup.request_wait_timeout),
            cleanup_interval: secs(config.dedup.request_cleanup_interval),
        }
    }
}

/// At least 16 characters from at least three of: upper, lower, digit,
/// other
pub fn validate_token(token: Option<&str>) -> Result<(), ConfigError> {
    let token = match token {
        Some(t) if !t.is_empty() => t,
        _ => return Err(ConfigError::WeakToken("token is not set".to_string())),
    };
    if token.chars().count() < MIN_TOKEN_LEN {
        return Err(ConfigError::WeakToken(format!(
            "token must be at least {} characters",
            MIN_TOKEN_LEN
        )));
    }
    let classes = TOKEN_CLASSES.iter().filter(|re| re.is_match(token)).count();
    if classes < MIN_TOKEN_CLASSES {
        return Err(ConfigError::WeakToken(
            "token must mix upper case, lower case, digits and symbols".to_string(),
        ));
    }
    Ok(())
}

fn clamp_min(value: &mut u64, min: u64, key: &str) {
    if *value < min {
        tracing::warn!("{} {}s below minimum, using {}s", key, value, min);
        *value = min;
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue(format!("{}: expected a boolean, got '{}'", name, other))),
    }
}

fn parse_secs(name: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(format!("{}: expected seconds, got '{}'", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const STRONG: &str = "369258asasASAS?!";

    #[test]
    fn defaults_match_documented_values() {
        let settings = RuntimeSettings::from(&Config::default());
        assert_eq!(settings.event_timeout, Duration::from_secs(20));
        assert_eq!(settings.hot_reload_interval, Duration::from_secs(5));
        assert!(settings.hot_reload);
        assert!(!settings.event_dedup);
        assert_eq!(settings.request_expire, Duration::from_secs(360));
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = Config::from_yaml("plugins:\n  event-timeout: 3\ndedup:\n  enable-event: true\n").unwrap();
        assert_eq!(config.plugins.event_timeout, 3);
        assert!(config.dedup.enable_event);
        assert_eq!(config.dedup.event_window, 5);
        assert_eq!(config.bot.name, "nebula-bot");
    }

    #[test]
    fn validate_clamps_minimums() {
        let mut config = Config::default();
        config.backend.token = Some(STRONG.to_string());
        config.startup.reject_duration = 3;
        config.dedup.request_expire = 10;
        config.dedup.request_cleanup_interval = 1;
        config.dedup.request_wait_timeout = 0;
        config.validate().unwrap();

        assert_eq!(config.startup.reject_duration, 10);
        assert_eq!(config.dedup.request_expire, 300);
        assert_eq!(config.dedup.request_cleanup_interval, 60);
        assert_eq!(config.dedup.request_wait_timeout, 10);
    }

    #[test]
    fn token_strength() {
        assert!(validate_token(Some(STRONG)).is_ok());
        assert!(matches!(validate_token(None), Err(ConfigError::WeakToken(_))));
        assert!(matches!(validate_token(Some("Short1!")), Err(ConfigError::WeakToken(_))));
        assert!(matches!(
            validate_token(Some("alllowercaseletters")),
            Err(ConfigError::WeakToken(_))
        ));
        assert!(validate_token(Some("lowercase-and-digits-123")).is_ok());
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("HOT_RELOAD", "false"),
            ("PLUGIN_EVENT_TIMEOUT", "7"),
            ("ENABLE_EVENT_DEDUPLICATION", "1"),
            ("BOT_TOKEN", STRONG),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config
            .apply_vars(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert!(!config.plugins.hot_reload);
        assert_eq!(config.plugins.event_timeout, 7);
        assert!(config.dedup.enable_event);
        assert_eq!(config.backend.token.as_deref(), Some(STRONG));

        let mut config = Config::default();
        assert!(config.apply_vars(|_| Some("maybe".to_string())).is_err());
    }

    #[test]
    fn snapshot_hides_token() {
        let mut config = Config::default();
        config.backend.token = Some(STRONG.to_string());
        let snapshot = config.public_snapshot();
        assert_eq!(snapshot["backend"]["token"], "***");
    }
}
