//! Plugin loader - Dynamically loads plugins from shared libraries

use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use libloading::{Library, Symbol};
use sha2::{Digest, Sha256};

use crate::application::errors::PluginError;
use crate::plugins::context::PluginContext;
use crate::plugins::trait_def::{
    construct_guarded, Instantiated, PluginConstructor, PluginSource, SourceUnit, PLUGIN_ABI_VERSION,
};
use super::manifest::{PluginManifest, MANIFEST_FILE};

pub const DIRECTORY_ORIGIN: &str = "directory";

const CONSTRUCT_SYMBOL: &[u8] = b"nebula_plugin_construct";
const ABI_SYMBOL: &[u8] = b"nebula_plugin_abi_version";

type AbiVersionFn = extern "C" fn() -> u32;

/// Modification stamp of the files a fingerprint was computed from
#[derive(Debug, Clone, PartialEq, Eq)]
struct Stamp {
    manifest: (Option<SystemTime>, u64),
    library: Option<(Option<SystemTime>, u64)>,
}

impl Stamp {
    fn of(manifest: &Path, library: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(manifest)?;
        let library = std::fs::metadata(library).ok().map(|m| (m.modified().ok(), m.len()));
        Ok(Self {
            manifest: (meta.modified().ok(), meta.len()),
            library,
        })
    }
}

struct ScanState {
    fingerprints: HashMap<PathBuf, (Stamp, String)>,
}

/// Plugin directory scanner.
///
/// Every non-hidden subdirectory holding a `plugin.yaml` is one plugin.
/// Fingerprints hash the manifest and library bytes, and are only
/// recomputed when a file's mtime or size moves.
pub struct DirectorySource {
    plugin_dir: PathBuf,
    state: Arc<Mutex<ScanState>>,
}

impl DirectorySource {
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            state: Arc::new(Mutex::new(ScanState {
                fingerprints: HashMap::new(),
            })),
        }
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    fn scan(plugin_dir: &Path, state: &Mutex<ScanState>) -> Result<Vec<SourceUnit>, PluginError> {
        let mut units = Vec::new();

        if !plugin_dir.exists() {
            tracing::warn!("Plugin directory does not exist: {}", plugin_dir.display());
            return Ok(units);
        }

        let entries = std::fs::read_dir(plugin_dir)
            .map_err(|e| PluginError::Load(format!("Failed to read plugin directory: {}", e)))?;

        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("Failed to read directory entry: {}", e);
                    continue;
                }
            };

            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            // Skip hidden directories
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with('.') {
                    continue;
                }
            }

            let manifest_path = path.join(MANIFEST_FILE);
            if !manifest_path.exists() {
                tracing::warn!("Skipping {}: no {}", path.display(), MANIFEST_FILE);
                continue;
            }

            let manifest = match PluginManifest::from_file(&manifest_path) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };

            let library_path = manifest.library_path(&path);
            let fingerprint = match Self::fingerprint(&mut state, &path, &manifest_path, &library_path) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!("Skipping {}: cannot fingerprint: {}", path.display(), e);
                    continue;
                }
            };

            let mut unit = SourceUnit::new(manifest.name.clone(), DIRECTORY_ORIGIN, fingerprint)
                .with_dependencies(manifest.dependencies.clone());
            unit.version = manifest.version.clone();
            unit.description = manifest.description.clone();
            unit.location = Some(path);
            units.push(unit);
        }

        units.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(units)
    }

    fn fingerprint(
        state: &mut ScanState,
        dir: &Path,
        manifest_path: &Path,
        library_path: &Path,
    ) -> std::io::Result<String> {
        let stamp = Stamp::of(manifest_path, library_path)?;
        if let Some((cached, fingerprint)) = state.fingerprints.get(dir) {
            if *cached == stamp {
                return Ok(fingerprint.clone());
            }
        }

        let mut hasher = Sha256::new();
        hasher.update(std::fs::read(manifest_path)?);
        if stamp.library.is_some() {
            hasher.update(std::fs::read(library_path)?);
        }
        let fingerprint = format!("{:x}", hasher.finalize());
        state
            .fingerprints
            .insert(dir.to_path_buf(), (stamp, fingerprint.clone()));
        Ok(fingerprint)
    }

    /// Open the library from a private copy, so a rebuilt file on disk is
    /// loaded fresh instead of reusing the already-mapped old image.
    fn open_library(unit_name: &str, fingerprint: &str, library_path: &Path) -> Result<Library, PluginError> {
        if !library_path.exists() {
            return Err(PluginError::Load(format!("Library not found: {}", library_path.display())));
        }

        let short = &fingerprint[..fingerprint.len().min(16)];
        let staged = std::env::temp_dir().join(libloading::library_filename(format!(
            "nebula-{}-{}",
            unit_name, short
        )));
        if !staged.exists() {
            std::fs::copy(library_path, &staged)
                .map_err(|e| PluginError::Load(format!("Failed to stage library: {}", e)))?;
        }

        let library = unsafe {
            Library::new(&staged).map_err(|e| PluginError::Load(format!("Failed to load library: {}", e)))?
        };

        let version = unsafe {
            let abi: Symbol<AbiVersionFn> = library
                .get(ABI_SYMBOL)
                .map_err(|e| PluginError::Load(format!("Failed to find ABI version: {}", e)))?;
            abi()
        };
        if version != PLUGIN_ABI_VERSION {
            return Err(PluginError::Load(format!(
                "ABI version mismatch: library has {}, runtime expects {}",
                version, PLUGIN_ABI_VERSION
            )));
        }

        Ok(library)
    }
}

#[async_trait]
impl PluginSource for DirectorySource {
    fn origin(&self) -> &str {
        DIRECTORY_ORIGIN
    }

    async fn discover(&self) -> Result<Vec<SourceUnit>, PluginError> {
        let plugin_dir = self.plugin_dir.clone();
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || Self::scan(&plugin_dir, &state))
            .await
            .map_err(|e| PluginError::Internal(format!("plugin scan aborted: {}", e)))?
    }

    async fn instantiate(&self, unit: &SourceUnit, ctx: PluginContext) -> Result<Instantiated, PluginError> {
        let dir = unit
            .location
            .clone()
            .ok_or_else(|| PluginError::Load(format!("No location recorded for '{}'", unit.name)))?;
        let manifest = PluginManifest::from_file(dir.join(MANIFEST_FILE))?;
        let library_path = manifest.library_path(&dir);

        let name = unit.name.clone();
        let fingerprint = unit.fingerprint.clone();
        let library = tokio::task::spawn_blocking(move || Self::open_library(&name, &fingerprint, &library_path))
            .await
            .map_err(|e| PluginError::Internal(format!("library load aborted: {}", e)))??;

        let constructor: PluginConstructor = unsafe {
            let symbol: Symbol<PluginConstructor> = library
                .get(CONSTRUCT_SYMBOL)
                .map_err(|e| PluginError::Load(format!("Failed to find constructor: {}", e)))?;
            *symbol
        };

        let library: Arc<dyn Any + Send + Sync> = Arc::new(library);
        let plugin = construct_guarded(&constructor, ctx)?;
        tracing::info!(
            "Constructed plugin: {} v{}",
            unit.name,
            unit.version.as_deref().unwrap_or("0.0.0")
        );

        Ok(Instantiated {
            plugin,
            keepalive: Some(library),
        })
    }
}
