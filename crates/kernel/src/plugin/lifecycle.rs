//! Plugin lifecycle state machine.
//!
//! ```text
//! Unknown --sync--> Registered --activate--> Active
//!                   Registered <--deactivate-- Active
//!                   Registered --delete--> Deleted
//! ```
//!
//! Transitions on the same plugin are serialized; different plugins proceed
//! concurrently. Activation provisions storage and runs migrations before
//! the enabled flag flips, so a failure leaves the plugin `Registered`.
//! Nothing here loads code into the running process: the module loader
//! picks up the new state on the next start.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use super::discovery::{DiscoveredPlugin, DiscoveryCatalog, discover_plugins};
use super::error::PluginError;
use super::loader::{LoadedPlugins, ModuleLoader};
use super::migration::{MigrationOrchestrator, MigrationOutcome, MigrationRecord};
use super::registry::{PluginRecord, PluginRegistry};
use super::schema::SchemaProvisioner;
use super::sync::{SyncReport, plan_sync};

/// Result of a successful activation.
#[derive(Debug, Clone, Serialize)]
pub struct ActivationReport {
    pub plugin: PluginRecord,
    pub migrations: MigrationOutcome,
}

/// Coordinates registry, storage and migrations for lifecycle transitions.
pub struct LifecycleController {
    registry: Arc<dyn PluginRegistry>,
    provisioner: Arc<dyn SchemaProvisioner>,
    migrations: MigrationOrchestrator,
    loader: ModuleLoader,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LifecycleController {
    pub fn new(
        registry: Arc<dyn PluginRegistry>,
        provisioner: Arc<dyn SchemaProvisioner>,
        migrations: MigrationOrchestrator,
        loader: ModuleLoader,
    ) -> Self {
        Self {
            registry,
            provisioner,
            migrations,
            loader,
            locks: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<dyn PluginRegistry> {
        &self.registry
    }

    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    pub fn plugins_dir(&self) -> &Path {
        self.loader.plugins_dir()
    }

    async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Plugins currently on disk.
    pub fn discover(&self) -> Result<DiscoveryCatalog, PluginError> {
        discover_plugins(self.plugins_dir())
    }

    async fn record(&self, name: &str) -> Result<PluginRecord, PluginError> {
        self.registry
            .get_by_name(name)
            .await?
            .ok_or_else(|| PluginError::NotRegistered {
                plugin: name.to_string(),
            })
    }

    fn find_on_disk(&self, name: &str) -> Result<DiscoveredPlugin, PluginError> {
        self.discover()?
            .remove(name)
            .ok_or_else(|| PluginError::PluginMissingOnDisk {
                plugin: name.to_string(),
            })
    }

    /// Reconcile the registry with disk. Inserts new plugins disabled and
    /// refreshes metadata of known ones; never touches `enabled`.
    pub async fn sync(&self) -> Result<SyncReport, PluginError> {
        let discovered = self.discover()?;
        let records = self.registry.all().await?;
        let plan = plan_sync(&discovered, &records)?;

        for name in &plan.stale {
            warn!(plugin = %name, "registered plugin not found on disk");
        }

        let changed_names = plan.changed_names();
        let mut guards = Vec::with_capacity(changed_names.len());
        for name in &changed_names {
            guards.push(self.lock(name).await);
        }

        let changed = self.registry.apply_sync(&plan).await?;
        drop(guards);

        info!(
            changed,
            inserted = plan.inserts.len(),
            updated = plan.updates.len(),
            stale = plan.stale.len(),
            "plugin registry synchronized"
        );

        Ok(SyncReport {
            changed,
            inserted: plan.inserts.into_iter().map(|m| m.name).collect(),
            updated: plan.updates.into_iter().map(|u| u.metadata.name).collect(),
            stale: plan.stale,
        })
    }

    /// `Registered -> Active`: provision storage, migrate, then enable.
    pub async fn activate(&self, name: &str) -> Result<ActivationReport, PluginError> {
        let _guard = self.lock(name).await;

        let record = self.record(name).await?;
        if record.enabled {
            return Err(PluginError::AlreadyActive {
                plugin: name.to_string(),
            });
        }

        let found = self.find_on_disk(name)?;
        if found.descriptor.schema_name != record.schema_name {
            return Err(PluginError::OutOfSync {
                plugin: name.to_string(),
                registered: record.schema_name,
                declared: found.descriptor.schema_name,
            });
        }

        let loaded = self.loader.load_one(&found).await?;

        self.provisioner.provision(&record.schema_name).await?;
        let migrations = self
            .migrations
            .run(name, &record.schema_name, &loaded.storage)
            .await?;

        if !self.registry.set_enabled(name, true).await? {
            return Err(PluginError::AlreadyActive {
                plugin: name.to_string(),
            });
        }

        info!(plugin = %name, schema = %record.schema_name, "plugin activated");

        Ok(ActivationReport {
            plugin: self.record(name).await?,
            migrations,
        })
    }

    /// `Active -> Registered`. Storage is left as it is.
    pub async fn deactivate(&self, name: &str) -> Result<PluginRecord, PluginError> {
        let _guard = self.lock(name).await;

        let record = self.record(name).await?;
        if !record.enabled || !self.registry.set_enabled(name, false).await? {
            return Err(PluginError::AlreadyInactive {
                plugin: name.to_string(),
            });
        }

        info!(plugin = %name, "plugin deactivated");
        self.record(name).await
    }

    /// Same as [`activate`](Self::activate).
    pub async fn enable(&self, name: &str) -> Result<ActivationReport, PluginError> {
        self.activate(name).await
    }

    /// Same as [`deactivate`](Self::deactivate).
    pub async fn disable(&self, name: &str) -> Result<PluginRecord, PluginError> {
        self.deactivate(name).await
    }

    /// Remove a disabled plugin's record, optionally dropping its schema
    /// and migration history too.
    pub async fn delete(&self, name: &str, drop_schema: bool) -> Result<PluginRecord, PluginError> {
        let _guard = self.lock(name).await;

        let record = self.record(name).await?;
        if record.enabled {
            return Err(PluginError::PluginActive {
                plugin: name.to_string(),
            });
        }

        if drop_schema {
            self.provisioner.teardown(&record.schema_name).await?;
            self.migrations.forget(name).await?;
        }

        if !self.registry.delete(name).await? {
            return Err(PluginError::NotRegistered {
                plugin: name.to_string(),
            });
        }

        info!(plugin = %name, drop_schema, "plugin deleted");
        Ok(record)
    }

    /// Re-run migrations for an active plugin, e.g. after upgrading its
    /// files on disk and syncing.
    pub async fn migrate(&self, name: &str) -> Result<MigrationOutcome, PluginError> {
        let _guard = self.lock(name).await;

        let record = self.record(name).await?;
        if !record.enabled {
            return Err(PluginError::NotActive {
                plugin: name.to_string(),
            });
        }

        let found = self.find_on_disk(name)?;
        if found.descriptor.schema_name != record.schema_name {
            return Err(PluginError::OutOfSync {
                plugin: name.to_string(),
                registered: record.schema_name,
                declared: found.descriptor.schema_name,
            });
        }

        let loaded = self.loader.load_one(&found).await?;
        self.provisioner.provision(&record.schema_name).await?;
        self.migrations
            .run(name, &record.schema_name, &loaded.storage)
            .await
    }

    /// Migration history of a plugin.
    pub async fn history(&self, name: &str) -> Result<Vec<MigrationRecord>, PluginError> {
        self.migrations.history(name).await
    }

    /// Warn about loaded plugins whose storage drifted since activation.
    pub async fn report_drift(&self, loaded: &LoadedPlugins) {
        for plugin in loaded.iter() {
            match self
                .migrations
                .detect_drift(&plugin.name, &plugin.schema_name, &plugin.storage)
                .await
            {
                Ok(diff) if diff.has_drift() => warn!(
                    plugin = %plugin.name,
                    changes = diff.changes.len(),
                    "plugin storage has drifted; run `vantage plugin migrate {}`",
                    plugin.name
                ),
                Ok(_) => {}
                Err(e) => warn!(plugin = %plugin.name, error = %e, "drift check failed"),
            }
        }
    }
}
