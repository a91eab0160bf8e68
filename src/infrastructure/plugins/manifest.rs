//! Plugin manifest definition

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::application::errors::PluginError;

/// Name of the manifest file inside each plugin directory
pub const MANIFEST_FILE: &str = "plugin.yaml";

/// Plugin metadata
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PluginManifest {
    /// Plugin name (required)
    pub name: String,

    /// Plugin version
    #[serde(default)]
    pub version: Option<String>,

    /// Plugin description
    #[serde(default)]
    pub description: Option<String>,

    /// Plugin author
    #[serde(default)]
    pub author: Option<String>,

    /// Path to the shared library, relative to the plugin directory
    #[serde(default)]
    pub library: Option<PathBuf>,

    /// External executables the plugin needs on PATH
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl PluginManifest {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PluginError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| PluginError::Load(format!("Failed to read manifest: {}", e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, PluginError> {
        let manifest: Self = serde_yaml::from_str(content)
            .map_err(|e| PluginError::Load(format!("Failed to parse manifest: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Library path inside `dir`; defaults to the platform file name for
    /// `libnebula_<name>`
    pub fn library_path(&self, dir: &Path) -> PathBuf {
        match &self.library {
            Some(lib) => dir.join(lib),
            None => dir.join(libloading::library_filename(format!(
                "nebula_{}",
                self.name.replace('-', "_")
            ))),
        }
    }

    fn validate(&self) -> Result<(), PluginError> {
        let valid = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(PluginError::Load(format!("Invalid plugin name: '{}'", self.name)));
        }
        Ok(())
    }
}
