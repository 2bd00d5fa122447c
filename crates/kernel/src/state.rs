//! Application state shared across all handlers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::PgPool;
use tracing::{error, info};

use crate::config::Config;
use crate::db;
use crate::plugin::{
    ArchiveInstaller, Catalog, LifecycleController, LoadedPlugins, MigrationOrchestrator,
    MigrationStore, ModuleLoader, PgMigrationStore, PgPluginRegistry, PgSchemaProvisioner,
    PluginRegistry, PluginRuntime, SchemaProvisioner,
};

/// Outcome of loading enabled plugins at boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BootStatus {
    /// Every enabled plugin loaded.
    Loaded { plugins: Vec<String> },
    /// Loading failed; only core routes are served.
    Degraded {
        plugin: Option<String>,
        reason: String,
    },
}

impl BootStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

/// Everything [`AppState`] is built from.
pub struct StateParts {
    /// `None` when running against in-process storage.
    pub db: Option<PgPool>,
    pub registry: Arc<dyn PluginRegistry>,
    pub provisioner: Arc<dyn SchemaProvisioner>,
    pub migrations: Arc<dyn MigrationStore>,
    pub runtime: Arc<PluginRuntime>,
    pub plugins_dir: PathBuf,
    pub api_prefix: String,
    pub catalog: Catalog,
    pub http: reqwest::Client,
}

impl StateParts {
    /// Postgres-backed services for `config`. Connects and runs the kernel
    /// migrations.
    pub async fn postgres(config: &Config) -> Result<Self> {
        let pool = db::create_pool(config).await?;
        db::run_migrations(&pool).await?;

        let runtime =
            Arc::new(PluginRuntime::new(&config.plugin).context("failed to create plugin runtime")?);

        let http = reqwest::Client::builder()
            .user_agent(concat!("vantage/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;

        let catalog = Catalog::from_settings(
            config.catalog_path.clone(),
            config.catalog_url.clone(),
            http.clone(),
        );

        Ok(Self {
            registry: Arc::new(PgPluginRegistry::new(pool.clone())),
            provisioner: Arc::new(PgSchemaProvisioner::new(
                pool.clone(),
                config.database_runtime_role.clone(),
            )),
            migrations: Arc::new(PgMigrationStore::new(pool.clone())),
            db: Some(pool),
            runtime,
            plugins_dir: config.plugins_dir.clone(),
            api_prefix: config.api_prefix.clone(),
            catalog,
            http,
        })
    }

    /// The lifecycle controller over these services.
    pub fn lifecycle(&self) -> Arc<LifecycleController> {
        Arc::new(LifecycleController::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.provisioner),
            MigrationOrchestrator::new(Arc::clone(&self.migrations)),
            ModuleLoader::new(Arc::clone(&self.runtime), self.plugins_dir.clone()),
        ))
    }
}

/// Shared application state.
///
/// Wrapped in Arc internally so Clone is cheap.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// PostgreSQL connection pool.
    db: Option<PgPool>,

    /// Prefix for API routes.
    api_prefix: String,

    /// Persisted plugin registry.
    registry: Arc<dyn PluginRegistry>,

    /// Lifecycle transitions.
    lifecycle: Arc<LifecycleController>,

    /// Installable plugins.
    catalog: Catalog,

    /// Background archive installs.
    installer: Arc<ArchiveInstaller>,

    /// Plugins loaded at boot. Never changes while the process runs.
    loaded: LoadedPlugins,

    boot: BootStatus,
}

impl AppState {
    /// Create state backed by PostgreSQL.
    pub async fn new(config: &Config) -> Result<Self> {
        let parts = StateParts::postgres(config).await?;
        Ok(Self::boot(parts).await)
    }

    /// Build state from `parts` and load the enabled plugins.
    ///
    /// A load failure does not fail the boot: the state comes up degraded
    /// with no plugin routes.
    pub async fn boot(parts: StateParts) -> Self {
        let lifecycle = parts.lifecycle();

        let (loaded, boot) = match lifecycle.loader().load_enabled(&*parts.registry).await {
            Ok(loaded) => {
                lifecycle.report_drift(&loaded).await;
                let status = BootStatus::Loaded {
                    plugins: loaded.names(),
                };
                (loaded, status)
            }
            Err(e) => {
                error!(
                    plugin = e.plugin().unwrap_or("-"),
                    error = %e,
                    "plugin load failed; serving core routes only"
                );
                let status = BootStatus::Degraded {
                    plugin: e.plugin().map(str::to_string),
                    reason: e.to_string(),
                };
                (LoadedPlugins::default(), status)
            }
        };

        info!(plugins = loaded.len(), degraded = boot.is_degraded(), "plugin boot complete");

        let installer = Arc::new(ArchiveInstaller::new(parts.http, Arc::clone(&lifecycle)));

        Self {
            inner: Arc::new(AppStateInner {
                db: parts.db,
                api_prefix: parts.api_prefix,
                registry: parts.registry,
                lifecycle,
                catalog: parts.catalog,
                installer,
                loaded,
                boot,
            }),
        }
    }

    pub fn api_prefix(&self) -> &str {
        &self.inner.api_prefix
    }

    pub fn registry(&self) -> &Arc<dyn PluginRegistry> {
        &self.inner.registry
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleController> {
        &self.inner.lifecycle
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn installer(&self) -> &Arc<ArchiveInstaller> {
        &self.inner.installer
    }

    pub fn loaded(&self) -> &LoadedPlugins {
        &self.inner.loaded
    }

    pub fn boot_status(&self) -> &BootStatus {
        &self.inner.boot
    }

    /// Check if PostgreSQL is healthy. In-process storage is always healthy.
    pub async fn postgres_healthy(&self) -> bool {
        match &self.inner.db {
            Some(pool) => db::check_health(pool).await,
            None => true,
        }
    }
}
