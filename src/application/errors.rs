//! Application layer errors

use thiserror::Error;

/// General runtime errors
#[derive(Error, Debug)]
pub enum BotError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Runtime is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised while loading, running or querying plugins.
///
/// None of these are fatal to the runtime: they are isolated to the
/// plugin (or invocation) that produced them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    /// Constructor failure, bad manifest, missing library symbol
    #[error("Failed to load plugin: {0}")]
    Load(String),

    /// Declared dependencies still unavailable after resolution
    #[error("Plugin '{plugin}' is missing dependencies: {}", missing.join(", "))]
    MissingDependency { plugin: String, missing: Vec<String> },

    /// Handler returned an error or panicked
    #[error("Plugin runtime error: {0}")]
    Runtime(String),

    #[error("Plugin '{plugin}' exceeded its {timeout_ms}ms deadline")]
    Timeout { plugin: String, timeout_ms: u64 },

    #[error("Plugin '{reader}' is not authorized to read '{owner}'")]
    AccessDenied { reader: String, owner: String },

    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin '{0}' already loaded")]
    AlreadyLoaded(String),

    /// Write through a handle whose instance was reloaded or unloaded
    #[error("Plugin '{0}' instance is retired")]
    Retired(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PluginError {
    /// Shorthand for handler failures: `Err(PluginError::runtime(e))?`
    pub fn runtime(err: impl std::fmt::Display) -> Self {
        PluginError::Runtime(err.to_string())
    }

    /// True for the failures that keep a plugin out of dispatch.
    pub fn is_load_failure(&self) -> bool {
        matches!(self, PluginError::Load(_) | PluginError::MissingDependency { .. })
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// The one startup-fatal condition: refuse to run with a weak token
    #[error("Token rejected: {0}")]
    WeakToken(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dependency_lists_all_names() {
        let err = PluginError::MissingDependency {
            plugin: "weather".to_string(),
            missing: vec!["curl".to_string(), "jq".to_string()],
        };
        assert_eq!(err.to_string(), "Plugin 'weather' is missing dependencies: curl, jq");
        assert!(err.is_load_failure());
        assert!(!PluginError::runtime("boom").is_load_failure());
    }

    #[test]
    fn plugin_errors_convert_into_bot_errors() {
        let err: BotError = PluginError::NotFound("echo".to_string()).into();
        assert!(matches!(err, BotError::Plugin(PluginError::NotFound(_))));
    }
}
