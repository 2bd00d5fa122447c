//! Plugin system for Vantage.
//!
//! This module handles:
//! - Parsing `plugin.toml` manifests and discovering plugin directories
//! - Reconciling discovered plugins with the persisted registry
//! - Provisioning per-plugin storage schemas and running their migrations
//! - The activate/deactivate/delete lifecycle
//! - Loading enabled WASM plugins at boot
//! - Installing plugins from a remote catalog

pub mod catalog;
pub mod cli;
pub mod contract;
pub mod descriptor;
pub mod discovery;
mod error;
pub mod installer;
pub mod lifecycle;
pub mod loader;
pub mod memory;
pub mod migration;
pub mod registry;
mod runtime;
pub mod schema;
pub mod sync;

pub use catalog::{ArchiveType, Catalog, CatalogEntry, CatalogSource};
pub use descriptor::PluginDescriptor;
pub use discovery::{DiscoveredPlugin, DiscoveryCatalog, discover_plugins};
pub use error::PluginError;
pub use installer::ArchiveInstaller;
pub use lifecycle::{ActivationReport, LifecycleController};
pub use loader::{LoadedPlugin, LoadedPlugins, LoadedSummary, ModuleLoader};
pub use migration::{
    MaterializedSchema, MigrationOrchestrator, MigrationOutcome, MigrationRecord, MigrationStore,
    NewMigration, PgMigrationStore, SchemaChange,
};
pub use registry::{PgPluginRegistry, PluginRecord, PluginRegistry};
pub use runtime::{PluginConfig, PluginRuntime, PluginState};
pub use schema::{PgSchemaProvisioner, SchemaProvisioner};
pub use sync::SyncReport;
