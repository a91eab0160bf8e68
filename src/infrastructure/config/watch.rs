//! Config file watching for the settings that may change at runtime.
//!
//! Only the logging section is re-applied; everything else takes effect
//! on the next start.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::application::errors::ConfigError;

use super::Config;

pub const CONFIG_WATCH_INTERVAL: Duration = Duration::from_secs(10);

/// mtime and size of the file when it was last read
type Stamp = (Option<SystemTime>, u64);

pub struct ConfigWatcher {
    path: PathBuf,
    stamp: Option<Stamp>,
    directive: String,
}

impl ConfigWatcher {
    /// `current` is the config the process started with
    pub fn new(path: impl Into<PathBuf>, current: &Config) -> Self {
        let path = path.into();
        let stamp = stamp_of(&path);
        Self {
            path,
            stamp,
            directive: current.log_directive(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Log directive currently in force
    pub fn directive(&self) -> &str {
        &self.directive
    }

    /// Re-read the file if it changed since the last look. Returns the
    /// new log directive when it differs from the one in force.
    ///
    /// A file that fails to parse is not read again until it changes.
    pub fn poll(&mut self) -> Result<Option<String>, ConfigError> {
        let Some(stamp) = stamp_of(&self.path) else {
            return Ok(None);
        };
        if self.stamp == Some(stamp) {
            return Ok(None);
        }
        self.stamp = Some(stamp);
        tracing::info!("Config file changed: {}", self.path.display());

        let mut config = Config::load(&self.path)?;
        config.apply_env()?;
        let directive = config.log_directive();
        if directive == self.directive {
            return Ok(None);
        }
        self.directive = directive.clone();
        Ok(Some(directive))
    }
}

fn stamp_of(path: &Path) -> Option<Stamp> {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.modified().ok(), meta.len()))
}
