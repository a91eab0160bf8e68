//! Plugin sources for nebula-bot
//!
//! Plugins come either from factories compiled into the binary
//! (`BuiltinSource`) or from shared libraries under the plugin directory,
//! each described by a `plugin.yaml` manifest (`DirectorySource`).

pub mod loader;
pub mod manifest;
pub mod registry;
pub mod resolver;

pub use loader::{DirectorySource, DIRECTORY_ORIGIN};
pub use manifest::{PluginManifest, MANIFEST_FILE};
pub use registry::{BuiltinSource, BUILTIN_ORIGIN};
pub use resolver::CommandResolver;
