//! Plugin discovery.
//!
//! Walks the plugins directory and parses the manifest of every immediate
//! subdirectory. Directories without a manifest are partially installed and
//! skipped quietly; unreadable manifests are logged and skipped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::descriptor::PluginDescriptor;
use super::error::PluginError;

/// A plugin found on disk.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredPlugin {
    pub descriptor: PluginDescriptor,
    /// Plugin directory.
    pub path: PathBuf,
}

impl DiscoveredPlugin {
    /// Absolute path of the plugin's entry point module.
    pub fn entry_point(&self) -> PathBuf {
        self.descriptor.entry_point_path(&self.path)
    }
}

/// Discovered plugins keyed by declared name. Keys always equal
/// `descriptor.name`.
pub type DiscoveryCatalog = BTreeMap<String, DiscoveredPlugin>;

/// Discover plugins on disk without loading any code.
///
/// Fails only when two directories declare the same plugin name.
pub fn discover_plugins(plugins_dir: &Path) -> Result<DiscoveryCatalog, PluginError> {
    let mut discovered = DiscoveryCatalog::new();

    if !plugins_dir.exists() {
        info!(
            ?plugins_dir,
            "plugins directory does not exist, nothing to discover"
        );
        return Ok(discovered);
    }

    let entries = match std::fs::read_dir(plugins_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %plugins_dir.display(), error = %e, "failed to read plugins directory");
            return Ok(discovered);
        }
    };

    // Dot-directories are installer staging areas
    let mut dirs: Vec<_> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .collect();

    // Sort so duplicate-name errors always name directories in the same order
    dirs.sort_by_key(|e| e.file_name());

    for entry in dirs {
        let plugin_dir = entry.path();

        let descriptor = match PluginDescriptor::load(&plugin_dir) {
            Ok(descriptor) => descriptor,
            Err(PluginError::DescriptorMissing { .. }) => {
                debug!(dir = %plugin_dir.display(), "no plugin.toml found, skipping");
                continue;
            }
            Err(e) => {
                warn!(dir = %plugin_dir.display(), error = %e, "failed to parse plugin manifest, skipping");
                continue;
            }
        };

        if let Some(existing) = discovered.get(&descriptor.name) {
            return Err(PluginError::DuplicatePluginName {
                plugin: descriptor.name,
                first: existing.path.display().to_string(),
                second: plugin_dir.display().to_string(),
            });
        }

        debug!(plugin = %descriptor.name, dir = %plugin_dir.display(), "discovered plugin");
        discovered.insert(
            descriptor.name.clone(),
            DiscoveredPlugin {
                descriptor,
                path: plugin_dir,
            },
        );
    }

    Ok(discovered)
}
