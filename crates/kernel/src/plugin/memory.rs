//! In-process registry and storage backends.
//!
//! Behaviour mirrors the Postgres implementations closely enough to
//! exercise the lifecycle without a database: the registry enforces unique names and schema names, and the
//! storage backend applies structural changes to an in-memory catalog of
//! tables that also holds rows, so data preservation can be observed.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Result, bail};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use sqlx::types::Json;
use uuid::Uuid;
use vantage_sdk::types::ColumnDeclaration;

use super::migration::{
    MaterializedColumn, MaterializedSchema, MigrationRecord, MigrationStore, NewMigration,
    SchemaChange, catalog_type,
};
use super::registry::{PluginRecord, PluginRegistry};
use super::schema::SchemaProvisioner;
use super::sync::SyncPlan;

/// Registry held in memory.
#[derive(Default)]
pub struct MemoryRegistry {
    records: RwLock<BTreeMap<String, PluginRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record directly, bypassing sync.
    pub fn insert(&self, record: PluginRecord) {
        self.records.write().insert(record.name.clone(), record);
    }
}

#[async_trait]
impl PluginRegistry for MemoryRegistry {
    async fn all(&self) -> Result<Vec<PluginRecord>> {
        Ok(self.records.read().values().cloned().collect())
    }

    async fn page(&self, offset: i64, limit: i64) -> Result<(Vec<PluginRecord>, i64)> {
        let records = self.records.read();
        let count = records.len() as i64;
        let page = records
            .values()
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect();
        Ok((page, count))
    }

    async fn get(&self, id: Uuid) -> Result<Option<PluginRecord>> {
        Ok(self.records.read().values().find(|r| r.id == id).cloned())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<PluginRecord>> {
        Ok(self.records.read().get(name).cloned())
    }

    async fn enabled(&self) -> Result<Vec<PluginRecord>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect())
    }

    async fn apply_sync(&self, plan: &SyncPlan) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let mut records = self.records.write();

        // Work on a copy so a failed plan leaves nothing behind
        let mut next = records.clone();
        let mut count = 0u64;

        for update in &plan.updates {
            let m = &update.metadata;
            let Some(record) = next.get_mut(&m.name) else {
                continue;
            };
            if record.version != m.version
                || record.description != m.description
                || record.schema_name != m.schema_name
            {
                record.version = m.version.clone();
                record.description = m.description.clone();
                record.schema_name = m.schema_name.clone();
                record.updated_at = now;
                count += 1;
            }
        }

        for m in &plan.inserts {
            if next.contains_key(&m.name) {
                continue;
            }
            next.insert(
                m.name.clone(),
                PluginRecord {
                    id: Uuid::now_v7(),
                    name: m.name.clone(),
                    description: m.description.clone(),
                    version: m.version.clone(),
                    schema_name: m.schema_name.clone(),
                    enabled: false,
                    created_at: now,
                    updated_at: now,
                },
            );
            count += 1;
        }

        let mut schemas = BTreeSet::new();
        for record in next.values() {
            if !schemas.insert(record.schema_name.as_str()) {
                bail!(
                    "duplicate key value violates unique constraint on schema_name '{}'",
                    record.schema_name
                );
            }
        }

        *records = next;
        Ok(count)
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        let mut records = self.records.write();
        match records.get_mut(name) {
            Some(record) if record.enabled != enabled => {
                record.enabled = enabled;
                record.updated_at = chrono::Utc::now().timestamp();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.records.write().remove(name).is_some())
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    columns: Vec<MaterializedColumn>,
    rows: Vec<Value>,
}

#[derive(Default)]
struct StorageInner {
    schemas: BTreeMap<String, BTreeMap<String, MemoryTable>>,
    migrations: BTreeMap<String, Vec<MigrationRecord>>,
}

/// Schema namespaces and migration history held in memory.
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<StorageInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a namespace currently exists.
    pub fn has_schema(&self, schema: &str) -> bool {
        self.inner.read().schemas.contains_key(schema)
    }

    /// Store a row in an existing table.
    pub fn insert_row(&self, schema: &str, table: &str, row: Value) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(t) = inner
            .schemas
            .get_mut(schema)
            .and_then(|tables| tables.get_mut(table))
        else {
            bail!("relation \"{schema}\".\"{table}\" does not exist");
        };
        t.rows.push(row);
        Ok(())
    }

    /// Rows of a table, empty when the table does not exist.
    pub fn rows(&self, schema: &str, table: &str) -> Vec<Value> {
        self.inner
            .read()
            .schemas
            .get(schema)
            .and_then(|tables| tables.get(table))
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }
}

fn materialize(column: &ColumnDeclaration) -> MaterializedColumn {
    MaterializedColumn {
        name: column.name.clone(),
        data_type: catalog_type(column.data_type).to_string(),
        nullable: column.nullable,
        primary_key: column.primary_key,
        unique: column.unique && !column.primary_key,
        references: column.references.clone(),
    }
}

fn find_column<'a>(
    tables: &'a mut BTreeMap<String, MemoryTable>,
    table: &str,
    column: &str,
) -> Result<&'a mut MaterializedColumn> {
    match tables
        .get_mut(table)
        .and_then(|t| t.columns.iter_mut().find(|c| c.name == column))
    {
        Some(c) => Ok(c),
        None => bail!("column \"{column}\" of relation \"{table}\" does not exist"),
    }
}

/// Whether two rows share a non-null value in every one of `columns`.
fn has_duplicates(rows: &[Value], columns: &[&str]) -> bool {
    let mut seen = BTreeSet::new();
    rows.iter().any(|row| {
        let key: Vec<&Value> = columns.iter().map(|c| &row[*c]).collect();
        !key.iter().any(|v| v.is_null())
            && !seen.insert(serde_json::to_string(&key).unwrap_or_default())
    })
}

fn apply_change(tables: &mut BTreeMap<String, MemoryTable>, change: &SchemaChange) -> Result<()> {
    match change {
        SchemaChange::CreateTable { table } => {
            tables.entry(table.table.clone()).or_insert_with(|| MemoryTable {
                columns: table.columns.iter().map(materialize).collect(),
                rows: Vec::new(),
            });
        }
        SchemaChange::AddColumn { table, column } => {
            let Some(t) = tables.get_mut(table) else {
                bail!("relation \"{table}\" does not exist");
            };
            if !t.columns.iter().any(|c| c.name == column.name) {
                if !column.nullable && !t.rows.is_empty() {
                    bail!("column \"{}\" contains null values", column.name);
                }
                t.columns.push(materialize(column));
            }
        }
        SchemaChange::AlterColumnType { table, column, to, .. } => {
            find_column(tables, table, column)?.data_type = catalog_type(*to).to_string();
        }
        SchemaChange::SetNullable {
            table,
            column,
            nullable,
        } => {
            find_column(tables, table, column)?.nullable = *nullable;
        }
        SchemaChange::SetPrimaryKey { table, columns } => {
            let Some(t) = tables.get_mut(table) else {
                bail!("relation \"{table}\" does not exist");
            };
            let keys: Vec<&str> = columns.iter().map(String::as_str).collect();
            if has_duplicates(&t.rows, &keys) {
                bail!("could not create unique index \"{table}_pkey\"");
            }
            for key in &keys {
                if !t.columns.iter().any(|c| c.name == *key) {
                    bail!("column \"{key}\" of relation \"{table}\" does not exist");
                }
            }
            for c in &mut t.columns {
                c.primary_key = keys.contains(&c.name.as_str());
            }
        }
        SchemaChange::AddUnique { table, column } => {
            let rows = tables.get(table).map(|t| t.rows.as_slice()).unwrap_or_default();
            if has_duplicates(rows, &[column.as_str()]) {
                bail!("could not create unique index \"{table}_{column}_key\"");
            }
            find_column(tables, table, column)?.unique = true;
        }
        SchemaChange::AddForeignKey {
            table,
            column,
            references,
        } => {
            let target_exists = references
                .split_once('.')
                .and_then(|(t, c)| tables.get(t).map(|t| t.columns.iter().any(|col| col.name == c)))
                .unwrap_or(false);
            if !target_exists {
                bail!("referenced column \"{references}\" does not exist");
            }
            find_column(tables, table, column)?.references = Some(references.clone());
        }
    }
    Ok(())
}

#[async_trait]
impl SchemaProvisioner for MemoryStorage {
    async fn provision(&self, schema: &str) -> Result<()> {
        self.inner
            .write()
            .schemas
            .entry(schema.to_string())
            .or_default();
        Ok(())
    }

    async fn teardown(&self, schema: &str) -> Result<()> {
        self.inner.write().schemas.remove(schema);
        Ok(())
    }
}

#[async_trait]
impl MigrationStore for MemoryStorage {
    async fn materialized(&self, schema: &str) -> Result<MaterializedSchema> {
        Ok(self
            .inner
            .read()
            .schemas
            .get(schema)
            .map(|tables| {
                tables
                    .iter()
                    .map(|(name, t)| (name.clone(), t.columns.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn apply(
        &self,
        plugin: &str,
        schema: &str,
        generated: Option<NewMigration>,
    ) -> Result<Vec<i32>> {
        let now = chrono::Utc::now().timestamp();
        let mut inner = self.inner.write();

        let Some(current) = inner.schemas.get(schema) else {
            bail!("schema \"{schema}\" does not exist");
        };

        // Stage everything and commit only when every revision applies
        let mut tables = current.clone();
        let mut history = inner.migrations.get(plugin).cloned().unwrap_or_default();

        if let Some(migration) = generated {
            let revision = history.last().map_or(1, |r| r.revision + 1);
            history.push(MigrationRecord {
                plugin: plugin.to_string(),
                revision,
                changes: Json(migration.changes),
                script: migration.script,
                created_at: now,
                applied_at: None,
            });
        }

        let mut applied = Vec::new();
        for record in history.iter_mut().filter(|r| r.applied_at.is_none()) {
            for change in record.changes.iter() {
                apply_change(&mut tables, change)?;
            }
            record.applied_at = Some(now);
            applied.push(record.revision);
        }

        inner.schemas.insert(schema.to_string(), tables);
        inner.migrations.insert(plugin.to_string(), history);
        Ok(applied)
    }

    async fn history(&self, plugin: &str) -> Result<Vec<MigrationRecord>> {
        Ok(self
            .inner
            .read()
            .migrations
            .get(plugin)
            .cloned()
            .unwrap_or_default())
    }

    async fn forget(&self, plugin: &str) -> Result<u64> {
        Ok(self
            .inner
            .write()
            .migrations
            .remove(plugin)
            .map_or(0, |h| h.len() as u64))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use vantage_sdk::types::{ColumnType, StorageDeclaration};

    use super::*;
    use crate::plugin::migration::MigrationOrchestrator;
    use crate::plugin::sync::PluginMetadata;
    use std::sync::Arc;

    fn metadata(name: &str, schema: &str) -> PluginMetadata {
        PluginMetadata {
            name: name.into(),
            version: "1.0.0".into(),
            description: String::new(),
            schema_name: schema.into(),
        }
    }

    #[tokio::test]
    async fn sync_rejects_schema_collisions_atomically() {
        let registry = MemoryRegistry::new();
        let plan = SyncPlan {
            inserts: vec![metadata("alpha", "shared"), metadata("beta", "shared")],
            ..Default::default()
        };
        assert!(registry.apply_sync(&plan).await.is_err());
        assert!(registry.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_enabled_is_conditional() {
        let registry = MemoryRegistry::new();
        let plan = SyncPlan {
            inserts: vec![metadata("vsphere", "vsphere")],
            ..Default::default()
        };
        assert_eq!(registry.apply_sync(&plan).await.unwrap(), 1);

        assert!(registry.set_enabled("vsphere", true).await.unwrap());
        assert!(!registry.set_enabled("vsphere", true).await.unwrap());
        assert!(!registry.set_enabled("ghost", true).await.unwrap());
    }

    #[tokio::test]
    async fn failed_revision_leaves_storage_untouched() {
        let storage = Arc::new(MemoryStorage::new());
        storage.provision("vsphere").await.unwrap();
        let orchestrator = MigrationOrchestrator::new(storage.clone());

        let v1 = vec![StorageDeclaration::new("vcenter").column(ColumnDeclaration::id("id"))];
        orchestrator.run("vsphere", "vsphere", &v1).await.unwrap();
        storage
            .insert_row("vsphere", "vcenter", serde_json::json!({"id": "a"}))
            .unwrap();

        // NOT NULL column on a populated table cannot be added
        let v2 = vec![
            StorageDeclaration::new("vcenter")
                .column(ColumnDeclaration::id("id"))
                .column(ColumnDeclaration::new("url", ColumnType::Text)),
        ];
        assert!(orchestrator.run("vsphere", "vsphere", &v2).await.is_err());

        let materialized = storage.materialized("vsphere").await.unwrap();
        assert_eq!(materialized["vcenter"].len(), 1);
        assert_eq!(orchestrator.history("vsphere").await.unwrap().len(), 1);
        assert_eq!(storage.rows("vsphere", "vcenter").len(), 1);
    }

    #[tokio::test]
    async fn constraints_added_later_are_materialized() {
        let storage = Arc::new(MemoryStorage::new());
        storage.provision("vsphere").await.unwrap();
        let orchestrator = MigrationOrchestrator::new(storage.clone());

        let v1 = vec![
            StorageDeclaration::new("host")
                .column(ColumnDeclaration::id("id"))
                .column(ColumnDeclaration::new("parent_id", ColumnType::Uuid).nullable())
                .column(ColumnDeclaration::new("name", ColumnType::Text)),
        ];
        orchestrator.run("vsphere", "vsphere", &v1).await.unwrap();

        let v2 = vec![
            StorageDeclaration::new("host")
                .column(ColumnDeclaration::id("id"))
                .column(
                    ColumnDeclaration::new("parent_id", ColumnType::Uuid)
                        .nullable()
                        .references("host.id"),
                )
                .column(ColumnDeclaration::new("name", ColumnType::Text).unique()),
        ];
        let outcome = orchestrator.run("vsphere", "vsphere", &v2).await.unwrap();
        assert_eq!(outcome.applied, vec![2]);

        let host = &storage.materialized("vsphere").await.unwrap()["host"];
        assert_eq!(host[1].references.as_deref(), Some("host.id"));
        assert!(host[2].unique);

        let outcome = orchestrator.run("vsphere", "vsphere", &v2).await.unwrap();
        assert!(!outcome.diff.has_drift());
    }

    #[tokio::test]
    async fn unique_over_duplicate_rows_is_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        storage.provision("vsphere").await.unwrap();
        let orchestrator = MigrationOrchestrator::new(storage.clone());

        let v1 = vec![
            StorageDeclaration::new("host")
                .column(ColumnDeclaration::id("id"))
                .column(ColumnDeclaration::new("name", ColumnType::Text)),
        ];
        orchestrator.run("vsphere", "vsphere", &v1).await.unwrap();
        for id in ["a", "b"] {
            storage
                .insert_row("vsphere", "host", serde_json::json!({"id": id, "name": "esx01"}))
                .unwrap();
        }

        let v2 = vec![
            StorageDeclaration::new("host")
                .column(ColumnDeclaration::id("id"))
                .column(ColumnDeclaration::new("name", ColumnType::Text).unique()),
        ];
        assert!(orchestrator.run("vsphere", "vsphere", &v2).await.is_err());
        assert!(!storage.materialized("vsphere").await.unwrap()["host"][1].unique);
    }
}
