//! CLI command implementations for plugin management.
//!
//! These commands operate on the registry and storage directly, without
//! starting the HTTP server. Changes take effect on the next server start.

use anyhow::Result;

use super::catalog::Catalog;
use super::installer::ArchiveInstaller;
use super::lifecycle::LifecycleController;

const RESTART_NOTE: &str = "Note: if the server is running, restart it for CLI changes to take effect.";

/// List discovered and registered plugins.
pub async fn cmd_plugin_list(lifecycle: &LifecycleController) -> Result<()> {
    let discovered = lifecycle.discover()?;
    let records = lifecycle.registry().all().await?;

    if discovered.is_empty() && records.is_empty() {
        println!("No plugins found.");
        return Ok(());
    }

    println!(
        "{:<20} {:<12} {:<22} {:<16}",
        "PLUGIN", "VERSION", "SCHEMA", "STATUS"
    );
    println!("{}", "-".repeat(70));

    for (name, found) in &discovered {
        let status = match records.iter().find(|r| &r.name == name) {
            Some(r) if r.enabled => "active",
            Some(_) => "registered",
            None => "not synced",
        };
        println!(
            "{:<20} {:<12} {:<22} {:<16}",
            name, found.descriptor.version, found.descriptor.schema_name, status
        );
    }

    for record in records.iter().filter(|r| !discovered.contains_key(&r.name)) {
        let status = if record.enabled { "active" } else { "registered" };
        println!(
            "{:<20} {:<12} {:<22} {} (not on disk)",
            record.name, record.version, record.schema_name, status
        );
    }

    Ok(())
}

/// Reconcile the registry with the plugin directory.
pub async fn cmd_plugin_sync(lifecycle: &LifecycleController) -> Result<()> {
    let report = lifecycle.sync().await?;

    for name in &report.inserted {
        println!("  registered: {name}");
    }
    for name in &report.updated {
        println!("  updated:    {name}");
    }
    for name in &report.stale {
        println!("  not on disk: {name}");
    }
    println!("{} plugin record(s) changed.", report.changed);
    Ok(())
}

/// Provision, migrate and enable a plugin.
pub async fn cmd_plugin_activate(lifecycle: &LifecycleController, name: &str) -> Result<()> {
    let report = lifecycle.activate(name).await?;

    for revision in &report.migrations.applied {
        println!("  applied revision {revision}");
    }
    println!(
        "Plugin '{}' v{} activated (schema '{}').",
        report.plugin.name, report.plugin.version, report.plugin.schema_name
    );
    println!("{RESTART_NOTE}");
    Ok(())
}

/// Disable a plugin. Its storage is kept.
pub async fn cmd_plugin_deactivate(lifecycle: &LifecycleController, name: &str) -> Result<()> {
    lifecycle.deactivate(name).await?;
    println!("Plugin '{name}' deactivated. Its schema and data are kept.");
    println!("{RESTART_NOTE}");
    Ok(())
}

/// Remove a disabled plugin from the registry.
pub async fn cmd_plugin_delete(
    lifecycle: &LifecycleController,
    name: &str,
    drop_schema: bool,
) -> Result<()> {
    let record = lifecycle.delete(name, drop_schema).await?;
    if drop_schema {
        println!(
            "Plugin '{name}' deleted and schema '{}' dropped.",
            record.schema_name
        );
    } else {
        println!(
            "Plugin '{name}' deleted. Schema '{}' was kept.",
            record.schema_name
        );
    }
    Ok(())
}

/// Apply pending storage changes for an active plugin.
pub async fn cmd_plugin_migrate(lifecycle: &LifecycleController, name: &str) -> Result<()> {
    let outcome = lifecycle.migrate(name).await?;

    for table in &outcome.diff.undeclared_tables {
        println!("  undeclared table kept: {table}");
    }
    for column in &outcome.diff.undeclared_columns {
        println!("  undeclared column kept: {column}");
    }

    if outcome.applied.is_empty() {
        println!("No pending migrations for '{name}'.");
    } else {
        println!("Applied {} revision(s) for '{name}':", outcome.applied.len());
        for revision in &outcome.applied {
            println!("  {revision}");
        }
    }
    Ok(())
}

/// List installable catalog entries.
pub async fn cmd_plugin_catalog(catalog: &Catalog) -> Result<()> {
    let entries = catalog.entries().await?;
    if entries.is_empty() {
        println!("Catalog is empty.");
        return Ok(());
    }

    println!("{:<20} {:<12} {:<8} {}", "ID", "VERSION", "TYPE", "DESCRIPTION");
    println!("{}", "-".repeat(70));
    for entry in &entries {
        println!(
            "{:<20} {:<12} {:<8} {}",
            entry.id, entry.version, entry.archive_type, entry.description
        );
    }
    Ok(())
}

/// Download and unpack a catalog entry, then sync.
pub async fn cmd_plugin_install(
    catalog: &Catalog,
    installer: &ArchiveInstaller,
    id: &str,
) -> Result<()> {
    let entry = catalog.get(id).await?;
    let report = installer.install(&entry).await?;

    println!(
        "Plugin '{}' v{} installed; {} record(s) changed.",
        entry.name, entry.version, report.changed
    );
    println!("Run `vantage plugin activate {}` to enable it.", entry.name);
    Ok(())
}
