//! Boot-time module loading.
//!
//! The loader reads only the enabled flags of the registry, cross-checks a
//! fresh discovery, and loads every enabled plugin or none at all.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use vantage_sdk::types::{RouteDefinition, RouteRequest, RouteResponse, StorageDeclaration};
use wasmtime::Module;

use super::contract::{self, PluginExports};
use super::discovery::{DiscoveredPlugin, discover_plugins};
use super::error::PluginError;
use super::registry::{PluginRecord, PluginRegistry};
use super::runtime::PluginRuntime;

/// An enabled plugin that passed every load check.
#[derive(Debug)]
pub struct LoadedPlugin {
    pub name: String,
    pub version: String,
    pub schema_name: String,
    pub path: PathBuf,
    pub module: Module,
    pub storage: Vec<StorageDeclaration>,
    pub routes: Vec<RouteDefinition>,
}

/// Summary of a loaded plugin for status output.
#[derive(Debug, Clone, Serialize)]
pub struct LoadedSummary {
    pub name: String,
    pub version: String,
    pub schema_name: String,
    pub tables: Vec<String>,
    pub routes: Vec<String>,
}

impl LoadedPlugin {
    pub fn summary(&self) -> LoadedSummary {
        LoadedSummary {
            name: self.name.clone(),
            version: self.version.clone(),
            schema_name: self.schema_name.clone(),
            tables: self.storage.iter().map(|t| t.table.clone()).collect(),
            routes: self
                .routes
                .iter()
                .map(|r| format!("{} {}", r.method.as_str(), r.path))
                .collect(),
        }
    }
}

/// Every plugin loaded at boot, in name order.
#[derive(Debug, Default, Clone)]
pub struct LoadedPlugins {
    plugins: Vec<Arc<LoadedPlugin>>,
}

impl LoadedPlugins {
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<LoadedPlugin>> {
        self.plugins.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<LoadedPlugin>> {
        self.plugins.iter().find(|p| p.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name.clone()).collect()
    }
}

/// Loads and validates plugins through the runtime.
#[derive(Clone)]
pub struct ModuleLoader {
    runtime: Arc<PluginRuntime>,
    plugins_dir: PathBuf,
}

impl ModuleLoader {
    pub fn new(runtime: Arc<PluginRuntime>, plugins_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            plugins_dir: plugins_dir.into(),
        }
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    /// Load every plugin the registry marks enabled.
    pub async fn load_enabled(
        &self,
        registry: &dyn PluginRegistry,
    ) -> Result<LoadedPlugins, PluginError> {
        let enabled = registry.enabled().await?;
        self.load(&enabled).await
    }

    /// Load the given records. Any failure fails the whole set.
    pub async fn load(&self, records: &[PluginRecord]) -> Result<LoadedPlugins, PluginError> {
        if records.is_empty() {
            info!("no enabled plugins");
            return Ok(LoadedPlugins::default());
        }

        let discovered = discover_plugins(&self.plugins_dir)?;

        let mut sorted: Vec<&PluginRecord> = records.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        let mut plugins = Vec::with_capacity(sorted.len());
        for record in sorted {
            let Some(found) = discovered.get(&record.name) else {
                return Err(PluginError::PluginMissingOnDisk {
                    plugin: record.name.clone(),
                });
            };
            plugins.push(Arc::new(self.load_one(found).await?));
        }

        info!(count = plugins.len(), "loaded enabled plugins");
        Ok(LoadedPlugins { plugins })
    }

    /// Compile, instantiate and verify one discovered plugin.
    pub async fn load_one(&self, found: &DiscoveredPlugin) -> Result<LoadedPlugin, PluginError> {
        let name = &found.descriptor.name;

        let module = self.runtime.compile(name, &found.entry_point())?;
        let PluginExports { storage, routes } =
            contract::inspect(&self.runtime, name, &module).await?;

        debug!(
            plugin = %name,
            tables = storage.len(),
            routes = routes.len(),
            "plugin passed contract checks"
        );

        Ok(LoadedPlugin {
            name: name.clone(),
            version: found.descriptor.version.clone(),
            schema_name: found.descriptor.schema_name.clone(),
            path: found.path.clone(),
            module,
            storage,
            routes,
        })
    }

    /// Run a route handler in a fresh instance.
    pub async fn handle(
        &self,
        plugin: &LoadedPlugin,
        handler: &str,
        request: &RouteRequest,
    ) -> anyhow::Result<RouteResponse> {
        let input = serde_json::to_string(request)?;
        let output = self
            .runtime
            .invoke(&plugin.name, &plugin.module, handler, &input)
            .await?;
        let response: RouteResponse = serde_json::from_str(&output).map_err(|e| {
            anyhow::anyhow!("handler '{handler}' returned an invalid response: {e}")
        })?;
        Ok(response)
    }
}
