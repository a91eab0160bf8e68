//! Dependency resolvers for plugin manifests

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::application::errors::PluginError;
use crate::plugins::trait_def::DependencyResolver;

/// Placeholder replaced by the dependency name in an install command
pub const DEPENDENCY_PLACEHOLDER: &str = "{}";

/// Resolves dependencies as executables on `PATH`, optionally running an
/// install command for the ones that are missing.
#[derive(Debug, Clone)]
pub struct CommandResolver {
    search_path: Vec<PathBuf>,
    install_command: Option<Vec<String>>,
    install_timeout: Duration,
}

impl CommandResolver {
    /// Uses the process `PATH`
    pub fn new() -> Self {
        let search_path = std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).collect())
            .unwrap_or_default();
        Self::with_search_path(search_path)
    }

    pub fn with_search_path(search_path: Vec<PathBuf>) -> Self {
        Self {
            search_path,
            install_command: None,
            install_timeout: Duration::from_secs(300),
        }
    }

    /// `command` is split on whitespace; `{}` becomes the dependency name,
    /// e.g. `apt-get install -y {}`
    pub fn with_install_command(mut self, command: &str, timeout: Duration) -> Self {
        let parts: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        self.install_command = if parts.is_empty() { None } else { Some(parts) };
        self.install_timeout = timeout;
        self
    }

    pub fn is_available(&self, dependency: &str) -> bool {
        if dependency.contains(std::path::MAIN_SEPARATOR) {
            return Path::new(dependency).is_file();
        }
        self.search_path.iter().any(|dir| dir.join(dependency).is_file())
    }

    fn missing(&self, dependencies: &[String]) -> Vec<String> {
        dependencies
            .iter()
            .filter(|d| !self.is_available(d))
            .cloned()
            .collect()
    }

    async fn install(&self, plugin: &str, dependency: &str) {
        let Some(template) = &self.install_command else {
            return;
        };
        let args: Vec<String> = template
            .iter()
            .map(|part| part.replace(DEPENDENCY_PLACEHOLDER, dependency))
            .collect();
        let Some((program, rest)) = args.split_first() else {
            return;
        };

        tracing::info!(plugin, dependency, "installing missing dependency");
        let child = Command::new(program).args(rest).kill_on_drop(true).output();
        match tokio::time::timeout(self.install_timeout, child).await {
            Ok(Ok(output)) if output.status.success() => {
                tracing::info!(plugin, dependency, "dependency installed");
            }
            Ok(Ok(output)) => {
                tracing::warn!(
                    plugin,
                    dependency,
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "dependency install failed"
                );
            }
            Ok(Err(e)) => tracing::warn!(plugin, dependency, error = %e, "could not run install command"),
            Err(_) => tracing::warn!(
                plugin,
                dependency,
                timeout_secs = self.install_timeout.as_secs(),
                "dependency install timed out"
            ),
        }
    }
}

impl Default for CommandResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DependencyResolver for CommandResolver {
    async fn resolve(&self, plugin: &str, dependencies: &[String]) -> Result<(), PluginError> {
        let missing = self.missing(dependencies);
        if missing.is_empty() {
            return Ok(());
        }

        if self.install_command.is_some() {
            for dependency in &missing {
                self.install(plugin, dependency).await;
            }
        }

        let missing = self.missing(&missing);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PluginError::MissingDependency {
                plugin: plugin.to_string(),
                missing,
            })
        }
    }
}
