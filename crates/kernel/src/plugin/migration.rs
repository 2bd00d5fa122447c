//! Plugin storage migrations.
//!
//! A plugin declares the tables it needs; the orchestrator compares those
//! declarations with what is materialized in the plugin's schema, records
//! the delta as a new revision in `plugin_migration`, and applies every
//! pending revision in one transaction.
//!
//! Migrations only ever add or reshape. Tables and columns that are no
//! longer declared are reported and left alone.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::{debug, info, warn};
use vantage_sdk::types::{ColumnDeclaration, ColumnType, StorageDeclaration};

use super::error::PluginError;
use super::schema::quote_ident;

/// A column as it exists in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializedColumn {
    pub name: String,
    /// `information_schema.columns.data_type`.
    pub data_type: String,
    pub nullable: bool,
    /// Part of the table's primary key.
    #[serde(default)]
    pub primary_key: bool,
    /// Covered by a single-column unique constraint.
    #[serde(default)]
    pub unique: bool,
    /// Single-column foreign key target as `table.column`.
    #[serde(default)]
    pub references: Option<String>,
}

impl MaterializedColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
            primary_key: false,
            unique: false,
            references: None,
        }
    }
}

/// Tables in one schema, keyed by table name.
pub type MaterializedSchema = BTreeMap<String, Vec<MaterializedColumn>>;

/// One structural change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaChange {
    CreateTable {
        table: StorageDeclaration,
    },
    AddColumn {
        table: String,
        column: ColumnDeclaration,
    },
    AlterColumnType {
        table: String,
        column: String,
        from: String,
        to: ColumnType,
    },
    SetNullable {
        table: String,
        column: String,
        nullable: bool,
    },
    /// Replace the primary key with one over `columns`.
    SetPrimaryKey {
        table: String,
        columns: Vec<String>,
    },
    AddUnique {
        table: String,
        column: String,
    },
    AddForeignKey {
        table: String,
        column: String,
        references: String,
    },
}

/// Difference between declared and materialized storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaDiff {
    pub changes: Vec<SchemaChange>,
    /// Tables present in storage but no longer declared.
    pub undeclared_tables: Vec<String>,
    /// `table.column` present in storage but no longer declared.
    pub undeclared_columns: Vec<String>,
}

impl SchemaDiff {
    /// Whether storage needs a migration.
    pub fn has_drift(&self) -> bool {
        !self.changes.is_empty()
    }
}

/// Postgres type used in DDL.
pub fn sql_type(t: ColumnType) -> &'static str {
    match t {
        ColumnType::Uuid => "uuid",
        ColumnType::Text => "text",
        ColumnType::Integer => "integer",
        ColumnType::BigInt => "bigint",
        ColumnType::Boolean => "boolean",
        ColumnType::Double => "double precision",
        ColumnType::Timestamp => "timestamptz",
        ColumnType::Json => "jsonb",
    }
}

/// Type name as reported by `information_schema.columns.data_type`.
pub fn catalog_type(t: ColumnType) -> &'static str {
    match t {
        ColumnType::Timestamp => "timestamp with time zone",
        other => sql_type(other),
    }
}

/// Compare declared storage with what is materialized.
pub fn diff(declared: &[StorageDeclaration], materialized: &MaterializedSchema) -> SchemaDiff {
    let mut result = SchemaDiff::default();

    for table in declared {
        let Some(existing) = materialized.get(&table.table) else {
            result.changes.push(SchemaChange::CreateTable {
                table: table.clone(),
            });
            continue;
        };

        let mut constraints = Vec::new();
        for column in &table.columns {
            match existing.iter().find(|c| c.name == column.name) {
                None => result.changes.push(SchemaChange::AddColumn {
                    table: table.table.clone(),
                    column: column.clone(),
                }),
                Some(current) => {
                    constraints.extend(constraint_changes(&table.table, column, current));
                    if current.data_type != catalog_type(column.data_type) {
                        result.changes.push(SchemaChange::AlterColumnType {
                            table: table.table.clone(),
                            column: column.name.clone(),
                            from: current.data_type.clone(),
                            to: column.data_type,
                        });
                    }
                    if current.nullable != column.nullable {
                        result.changes.push(SchemaChange::SetNullable {
                            table: table.table.clone(),
                            column: column.name.clone(),
                            nullable: column.nullable,
                        });
                    }
                }
            }
        }

        // Columns first, so keys can cover columns added above
        let declared_pk: Vec<&str> = table
            .columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect();
        let mut current_pk: Vec<&str> = existing
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect();
        let mut wanted_pk = declared_pk.clone();
        current_pk.sort_unstable();
        wanted_pk.sort_unstable();
        if !declared_pk.is_empty() && current_pk != wanted_pk {
            result.changes.push(SchemaChange::SetPrimaryKey {
                table: table.table.clone(),
                columns: declared_pk.iter().map(|c| c.to_string()).collect(),
            });
        }
        result.changes.extend(constraints);

        for current in existing {
            if table.get_column(&current.name).is_none() {
                result
                    .undeclared_columns
                    .push(format!("{}.{}", table.table, current.name));
            }
        }
    }

    for name in materialized.keys() {
        if !declared.iter().any(|t| &t.table == name) {
            result.undeclared_tables.push(name.clone());
        }
    }

    result
}

/// Unique and foreign key constraints a declared column has but the
/// materialized one lacks. Constraints are never removed.
fn constraint_changes(
    table: &str,
    column: &ColumnDeclaration,
    current: &MaterializedColumn,
) -> Vec<SchemaChange> {
    let mut changes = Vec::new();
    if column.unique && !column.primary_key && !current.unique && !current.primary_key {
        changes.push(SchemaChange::AddUnique {
            table: table.to_string(),
            column: column.name.clone(),
        });
    }
    if let Some(target) = column
        .references
        .as_ref()
        .filter(|t| current.references.as_ref() != Some(*t))
    {
        changes.push(SchemaChange::AddForeignKey {
            table: table.to_string(),
            column: column.name.clone(),
            references: target.clone(),
        });
    }
    changes
}

const MAX_IDENT_LEN: usize = 63;

/// Constraint name following Postgres' own `{table}_{column}_{suffix}`
/// convention. The server truncates explicit names past 63 bytes, so the
/// guard lookup has to use the truncated form.
pub fn constraint_name(table: &str, column: Option<&str>, suffix: &str) -> String {
    let mut name = match column {
        Some(column) => format!("{table}_{column}_{suffix}"),
        None => format!("{table}_{suffix}"),
    };
    if name.len() > MAX_IDENT_LEN {
        let mut end = MAX_IDENT_LEN;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

/// Add a named constraint unless the schema already has one by that name.
fn guarded_constraint(schema: &str, table: &str, name: &str, definition: &str) -> String {
    format!(
        "DO $$\nBEGIN\n    IF NOT EXISTS (\n        SELECT 1 FROM pg_constraint\n        \
         WHERE conname = {} AND connamespace = {}::regnamespace\n    ) THEN\n        \
         ALTER TABLE {}.{} ADD CONSTRAINT {} {definition};\n    END IF;\nEND\n$$;",
        quote_literal(name),
        quote_literal(&quote_ident(schema)),
        quote_ident(schema),
        quote_ident(table),
        quote_ident(name),
    )
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn references_sql(schema: &str, target: &str) -> Option<String> {
    let (table, column) = target.split_once('.')?;
    Some(format!(
        "REFERENCES {}.{} ({}) ON DELETE CASCADE",
        quote_ident(schema),
        quote_ident(table),
        quote_ident(column)
    ))
}

fn column_sql(schema: &str, column: &ColumnDeclaration, inline_pk: bool) -> String {
    let mut sql = format!(
        "{} {}",
        quote_ident(&column.name),
        sql_type(column.data_type)
    );
    if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    if inline_pk && column.primary_key {
        sql.push_str(" PRIMARY KEY");
    }
    if column.unique && !column.primary_key {
        sql.push_str(" UNIQUE");
    }
    if let Some(references) = column
        .references
        .as_deref()
        .and_then(|r| references_sql(schema, r))
    {
        sql.push(' ');
        sql.push_str(&references);
    }
    sql
}

/// Render changes as idempotent DDL for `schema`.
pub fn render_sql(schema: &str, changes: &[SchemaChange]) -> String {
    let s = quote_ident(schema);
    let mut statements = Vec::with_capacity(changes.len());

    for change in changes {
        let statement = match change {
            SchemaChange::CreateTable { table } => {
                let pk: Vec<&ColumnDeclaration> =
                    table.columns.iter().filter(|c| c.primary_key).collect();
                let inline_pk = pk.len() == 1;
                let mut lines: Vec<String> = table
                    .columns
                    .iter()
                    .map(|c| format!("    {}", column_sql(schema, c, inline_pk)))
                    .collect();
                if pk.len() > 1 {
                    let cols: Vec<String> = pk.iter().map(|c| quote_ident(&c.name)).collect();
                    lines.push(format!("    PRIMARY KEY ({})", cols.join(", ")));
                }
                format!(
                    "CREATE TABLE IF NOT EXISTS {s}.{} (\n{}\n);",
                    quote_ident(&table.table),
                    lines.join(",\n")
                )
            }
            SchemaChange::AddColumn { table, column } => format!(
                "ALTER TABLE {s}.{} ADD COLUMN IF NOT EXISTS {};",
                quote_ident(table),
                column_sql(schema, column, false)
            ),
            SchemaChange::SetPrimaryKey { table, columns } => {
                let relation = format!("{s}.{}", quote_ident(table));
                let name = constraint_name(table, None, "pkey");
                let cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
                format!(
                    "DO $$\nDECLARE\n    existing text;\nBEGIN\n    \
                     SELECT conname INTO existing FROM pg_constraint\n    \
                     WHERE conrelid = {}::regclass AND contype = 'p';\n    \
                     IF existing IS NOT NULL THEN\n        \
                     EXECUTE format({}, existing);\n    END IF;\n    \
                     ALTER TABLE {relation} ADD CONSTRAINT {} PRIMARY KEY ({});\nEND\n$$;",
                    quote_literal(&relation),
                    quote_literal(&format!("ALTER TABLE {relation} DROP CONSTRAINT %I")),
                    quote_ident(&name),
                    cols.join(", ")
                )
            }
            SchemaChange::AddUnique { table, column } => guarded_constraint(
                schema,
                table,
                &constraint_name(table, Some(column), "key"),
                &format!("UNIQUE ({})", quote_ident(column)),
            ),
            SchemaChange::AddForeignKey {
                table,
                column,
                references,
            } => {
                let Some(target) = references_sql(schema, references) else {
                    warn!(%table, %column, %references, "skipping malformed reference");
                    continue;
                };
                guarded_constraint(
                    schema,
                    table,
                    &constraint_name(table, Some(column), "fkey"),
                    &format!("FOREIGN KEY ({}) {target}", quote_ident(column)),
                )
            }
            SchemaChange::AlterColumnType {
                table, column, to, ..
            } => {
                let col = quote_ident(column);
                let ty = sql_type(*to);
                format!(
                    "ALTER TABLE {s}.{} ALTER COLUMN {col} TYPE {ty} USING {col}::{ty};",
                    quote_ident(table)
                )
            }
            SchemaChange::SetNullable {
                table,
                column,
                nullable,
            } => format!(
                "ALTER TABLE {s}.{} ALTER COLUMN {} {};",
                quote_ident(table),
                quote_ident(column),
                if *nullable { "DROP NOT NULL" } else { "SET NOT NULL" }
            ),
        };
        statements.push(statement);
    }

    statements.join("\n")
}

/// A row from `plugin_migration`.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct MigrationRecord {
    pub plugin: String,
    pub revision: i32,
    pub changes: Json<Vec<SchemaChange>>,
    pub script: String,
    pub created_at: i64,
    pub applied_at: Option<i64>,
}

/// A revision generated from a diff, not yet recorded.
#[derive(Debug, Clone)]
pub struct NewMigration {
    pub changes: Vec<SchemaChange>,
    pub script: String,
}

/// Storage for migration revisions and the schema they act on.
#[async_trait]
pub trait MigrationStore: Send + Sync {
    /// Tables and columns currently in `schema`.
    async fn materialized(&self, schema: &str) -> Result<MaterializedSchema>;

    /// Record `generated` as the next revision (if any), then apply every
    /// pending revision of `plugin`, all in one transaction. Returns the
    /// revisions applied.
    async fn apply(
        &self,
        plugin: &str,
        schema: &str,
        generated: Option<NewMigration>,
    ) -> Result<Vec<i32>>;

    /// Revision history, oldest first.
    async fn history(&self, plugin: &str) -> Result<Vec<MigrationRecord>>;

    /// Forget all revisions of a plugin.
    async fn forget(&self, plugin: &str) -> Result<u64>;
}

/// Postgres migration store.
#[derive(Clone)]
pub struct PgMigrationStore {
    pool: PgPool,
}

impl PgMigrationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MigrationStore for PgMigrationStore {
    async fn materialized(&self, schema: &str) -> Result<MaterializedSchema> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT c.table_name::text, c.column_name::text, c.data_type::text, c.is_nullable::text \
             FROM information_schema.columns c \
             JOIN information_schema.tables t \
               ON t.table_schema = c.table_schema AND t.table_name = c.table_name \
             WHERE c.table_schema = $1 AND t.table_type = 'BASE TABLE' \
             ORDER BY c.table_name, c.ordinal_position",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to read columns of schema '{schema}'"))?;

        let mut tables = MaterializedSchema::new();
        for (table, name, data_type, is_nullable) in rows {
            tables
                .entry(table)
                .or_default()
                .push(MaterializedColumn::new(name, data_type, is_nullable == "YES"));
        }

        // Primary keys of any width; unique and foreign keys over one column
        let constraints: Vec<(String, String, String, Option<String>, Option<String>)> =
            sqlx::query_as(
                "SELECT rel.relname::text, con.contype::text, att.attname::text, \
                        frel.relname::text, fatt.attname::text \
                 FROM pg_constraint con \
                 JOIN pg_class rel ON rel.oid = con.conrelid \
                 JOIN pg_namespace ns ON ns.oid = rel.relnamespace \
                 CROSS JOIN LATERAL unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord) \
                 JOIN pg_attribute att ON att.attrelid = con.conrelid AND att.attnum = k.attnum \
                 LEFT JOIN pg_class frel ON frel.oid = con.confrelid \
                 LEFT JOIN pg_attribute fatt \
                   ON fatt.attrelid = con.confrelid AND fatt.attnum = con.confkey[k.ord::int] \
                 WHERE ns.nspname = $1 \
                   AND (con.contype = 'p' \
                        OR (con.contype IN ('u', 'f') AND cardinality(con.conkey) = 1))",
            )
            .bind(schema)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to read constraints of schema '{schema}'"))?;

        for (table, kind, column, target_table, target_column) in constraints {
            let Some(c) = tables
                .get_mut(&table)
                .and_then(|cols| cols.iter_mut().find(|c| c.name == column))
            else {
                continue;
            };
            match kind.as_str() {
                "p" => c.primary_key = true,
                "u" => c.unique = true,
                "f" => {
                    c.references = target_table
                        .zip(target_column)
                        .map(|(t, col)| format!("{t}.{col}"));
                }
                _ => {}
            }
        }
        Ok(tables)
    }

    async fn apply(
        &self,
        plugin: &str,
        schema: &str,
        generated: Option<NewMigration>,
    ) -> Result<Vec<i32>> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        // Serialize revision numbering per plugin
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("plugin_migration:{plugin}"))
            .execute(&mut *tx)
            .await?;

        if let Some(migration) = generated {
            let revision: i32 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(revision), 0) + 1 FROM plugin_migration WHERE plugin = $1",
            )
            .bind(plugin)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO plugin_migration (plugin, revision, changes, script, created_at) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(plugin)
            .bind(revision)
            .bind(Json(migration.changes))
            .bind(&migration.script)
            .bind(now)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to record revision {revision}"))?;

            debug!(plugin, revision, "recorded migration revision");
        }

        let pending: Vec<(i32, String)> = sqlx::query_as(
            "SELECT revision, script FROM plugin_migration \
             WHERE plugin = $1 AND applied_at IS NULL ORDER BY revision",
        )
        .bind(plugin)
        .fetch_all(&mut *tx)
        .await?;

        let mut applied = Vec::with_capacity(pending.len());
        for (revision, script) in pending {
            debug!(plugin, schema, revision, "executing migration");

            // Scripts hold several statements, which prepared queries reject
            sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(&script))
                .await
                .with_context(|| format!("revision {revision} failed"))?;

            sqlx::query(
                "UPDATE plugin_migration SET applied_at = $3 WHERE plugin = $1 AND revision = $2",
            )
            .bind(plugin)
            .bind(revision)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            applied.push(revision);
        }

        tx.commit().await.context("failed to commit migrations")?;
        Ok(applied)
    }

    async fn history(&self, plugin: &str) -> Result<Vec<MigrationRecord>> {
        let rows = sqlx::query_as::<_, MigrationRecord>(
            "SELECT plugin, revision, changes, script, created_at, applied_at \
             FROM plugin_migration WHERE plugin = $1 ORDER BY revision",
        )
        .bind(plugin)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn forget(&self, plugin: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM plugin_migration WHERE plugin = $1")
            .bind(plugin)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

/// Result of a migration run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationOutcome {
    /// Changes found between declared and materialized storage.
    pub diff: SchemaDiff,
    /// Revisions applied by this run.
    pub applied: Vec<i32>,
}

/// Drives diffing, revision generation and application.
#[derive(Clone)]
pub struct MigrationOrchestrator {
    store: Arc<dyn MigrationStore>,
}

impl MigrationOrchestrator {
    pub fn new(store: Arc<dyn MigrationStore>) -> Self {
        Self { store }
    }

    /// Compare declared storage with the plugin's schema without changing it.
    pub async fn detect_drift(
        &self,
        plugin: &str,
        schema: &str,
        declared: &[StorageDeclaration],
    ) -> Result<SchemaDiff, PluginError> {
        let materialized = self
            .store
            .materialized(schema)
            .await
            .map_err(|e| migration_failed(plugin, &e))?;
        Ok(diff(declared, &materialized))
    }

    /// Generate a revision for any drift, then apply all pending revisions.
    pub async fn run(
        &self,
        plugin: &str,
        schema: &str,
        declared: &[StorageDeclaration],
    ) -> Result<MigrationOutcome, PluginError> {
        let diff = self.detect_drift(plugin, schema, declared).await?;

        for table in &diff.undeclared_tables {
            warn!(plugin, %table, "table is no longer declared, keeping it");
        }
        for column in &diff.undeclared_columns {
            warn!(plugin, %column, "column is no longer declared, keeping it");
        }

        let generated = diff.has_drift().then(|| NewMigration {
            changes: diff.changes.clone(),
            script: render_sql(schema, &diff.changes),
        });

        let applied = self
            .store
            .apply(plugin, schema, generated)
            .await
            .map_err(|e| migration_failed(plugin, &e))?;

        if applied.is_empty() {
            debug!(plugin, "storage is up to date");
        } else {
            info!(plugin, revisions = ?applied, "applied migrations");
        }

        Ok(MigrationOutcome { diff, applied })
    }

    pub async fn history(&self, plugin: &str) -> Result<Vec<MigrationRecord>, PluginError> {
        Ok(self.store.history(plugin).await?)
    }

    pub async fn forget(&self, plugin: &str) -> Result<u64, PluginError> {
        Ok(self.store.forget(plugin).await?)
    }
}

fn migration_failed(plugin: &str, e: &anyhow::Error) -> PluginError {
    PluginError::MigrationFailed {
        plugin: plugin.to_string(),
        details: format!("{e:#}"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vcenter() -> StorageDeclaration {
        StorageDeclaration::new("vcenter")
            .column(ColumnDeclaration::id("id"))
            .column(ColumnDeclaration::new("url", ColumnType::Text).nullable())
            .column(ColumnDeclaration::new("user", ColumnType::Text).unique())
    }

    fn materialized_vcenter() -> MaterializedSchema {
        let mut m = MaterializedSchema::new();
        m.insert(
            "vcenter".into(),
            vec![
                MaterializedColumn {
                    primary_key: true,
                    ..MaterializedColumn::new("id", "uuid", false)
                },
                MaterializedColumn::new("url", "text", true),
                MaterializedColumn {
                    unique: true,
                    ..MaterializedColumn::new("user", "text", false)
                },
            ],
        );
        m
    }

    #[test]
    fn empty_schema_creates_tables() {
        let d = diff(&[vcenter()], &MaterializedSchema::new());
        assert_eq!(d.changes.len(), 1);
        assert!(matches!(d.changes[0], SchemaChange::CreateTable { .. }));
    }

    #[test]
    fn matching_schema_has_no_drift() {
        let d = diff(&[vcenter()], &materialized_vcenter());
        assert!(!d.has_drift());
        assert!(d.undeclared_tables.is_empty());
    }

    #[test]
    fn new_column_and_type_change() {
        let declared = StorageDeclaration::new("vcenter")
            .column(ColumnDeclaration::id("id"))
            .column(ColumnDeclaration::new("url", ColumnType::Json).nullable())
            .column(ColumnDeclaration::new("user", ColumnType::Text).unique())
            .column(ColumnDeclaration::new("is_active", ColumnType::Boolean).nullable());

        let d = diff(&[declared], &materialized_vcenter());
        assert_eq!(d.changes.len(), 2);
        assert!(d.changes.iter().any(|c| matches!(
            c,
            SchemaChange::AlterColumnType { column, to: ColumnType::Json, .. } if column == "url"
        )));
        assert!(d.changes.iter().any(|c| matches!(
            c,
            SchemaChange::AddColumn { column, .. } if column.name == "is_active"
        )));
    }

    #[test]
    fn undeclared_storage_is_reported_not_dropped() {
        let mut materialized = materialized_vcenter();
        materialized.insert("legacy".into(), Vec::new());
        materialized
            .get_mut("vcenter")
            .unwrap()
            .push(MaterializedColumn::new("notes", "text", true));

        let d = diff(&[vcenter()], &materialized);
        assert!(!d.has_drift());
        assert_eq!(d.undeclared_tables, vec!["legacy".to_string()]);
        assert_eq!(d.undeclared_columns, vec!["vcenter.notes".to_string()]);
    }

    #[test]
    fn nullability_change_is_detected() {
        let mut materialized = materialized_vcenter();
        materialized.get_mut("vcenter").unwrap()[1].nullable = false;

        let d = diff(&[vcenter()], &materialized);
        assert_eq!(
            d.changes,
            vec![SchemaChange::SetNullable {
                table: "vcenter".into(),
                column: "url".into(),
                nullable: true,
            }]
        );
    }

    #[test]
    fn rendered_ddl_is_idempotent() {
        let vm = StorageDeclaration::new("vcenter_vm")
            .column(ColumnDeclaration::id("id"))
            .column(ColumnDeclaration::new("owner_id", ColumnType::Uuid).references("vcenter.id"))
            .column(ColumnDeclaration::new("powered_at", ColumnType::Timestamp).nullable());
        let sql = render_sql(
            "vsphere",
            &[
                SchemaChange::CreateTable { table: vm },
                SchemaChange::AddColumn {
                    table: "vcenter".into(),
                    column: ColumnDeclaration::new("is_active", ColumnType::Boolean).nullable(),
                },
            ],
        );

        assert!(sql.contains("CREATE TABLE IF NOT EXISTS \"vsphere\".\"vcenter_vm\""));
        assert!(sql.contains("\"id\" uuid NOT NULL PRIMARY KEY"));
        assert!(sql.contains(
            "REFERENCES \"vsphere\".\"vcenter\" (\"id\") ON DELETE CASCADE"
        ));
        assert!(sql.contains("\"powered_at\" timestamptz"));
        assert!(sql.contains("ADD COLUMN IF NOT EXISTS \"is_active\" boolean"));
    }

    #[test]
    fn composite_primary_key_is_a_table_constraint() {
        let table = StorageDeclaration::new("tag")
            .column(ColumnDeclaration::new("vm_id", ColumnType::Uuid).primary_key())
            .column(ColumnDeclaration::new("tag", ColumnType::Text).primary_key());
        let sql = render_sql("vsphere", &[SchemaChange::CreateTable { table }]);
        assert!(sql.contains("PRIMARY KEY (\"vm_id\", \"tag\")"));
        assert!(!sql.contains("NOT NULL PRIMARY KEY"));
    }

    fn materialized_host(id_is_key: bool) -> MaterializedSchema {
        let mut m = MaterializedSchema::new();
        m.insert(
            "host".into(),
            vec![
                MaterializedColumn {
                    primary_key: id_is_key,
                    ..MaterializedColumn::new("id", "uuid", false)
                },
                MaterializedColumn::new("vcenter_id", "uuid", false),
                MaterializedColumn::new("name", "text", false),
            ],
        );
        m
    }

    fn host() -> StorageDeclaration {
        StorageDeclaration::new("host")
            .column(ColumnDeclaration::id("id"))
            .column(ColumnDeclaration::new("vcenter_id", ColumnType::Uuid).references("host.id"))
            .column(ColumnDeclaration::new("name", ColumnType::Text).unique())
    }

    #[test]
    fn missing_unique_and_foreign_keys_are_drift() {
        let d = diff(&[host()], &materialized_host(true));
        assert!(d.has_drift());
        assert_eq!(
            d.changes,
            vec![
                SchemaChange::AddForeignKey {
                    table: "host".into(),
                    column: "vcenter_id".into(),
                    references: "host.id".into(),
                },
                SchemaChange::AddUnique {
                    table: "host".into(),
                    column: "name".into(),
                },
            ]
        );
    }

    #[test]
    fn missing_primary_key_comes_before_other_constraints() {
        let d = diff(&[host()], &materialized_host(false));
        assert_eq!(d.changes.len(), 3);
        assert_eq!(
            d.changes[0],
            SchemaChange::SetPrimaryKey {
                table: "host".into(),
                columns: vec!["id".into()],
            }
        );
    }

    #[test]
    fn present_constraints_are_not_redeclared() {
        let mut materialized = materialized_host(true);
        let columns = materialized.get_mut("host").unwrap();
        columns[1].references = Some("host.id".into());
        columns[2].unique = true;

        assert!(!diff(&[host()], &materialized).has_drift());
    }

    #[test]
    fn extra_constraints_in_storage_are_kept() {
        let mut materialized = materialized_vcenter();
        materialized.get_mut("vcenter").unwrap()[1].unique = true;

        assert!(!diff(&[vcenter()], &materialized).has_drift());
    }

    #[test]
    fn new_key_column_is_added_then_keyed() {
        let declared = StorageDeclaration::new("tag")
            .column(ColumnDeclaration::new("vm_id", ColumnType::Uuid).primary_key())
            .column(ColumnDeclaration::new("tag", ColumnType::Text).primary_key());
        let mut materialized = MaterializedSchema::new();
        materialized.insert(
            "tag".into(),
            vec![MaterializedColumn {
                primary_key: true,
                ..MaterializedColumn::new("vm_id", "uuid", false)
            }],
        );

        let d = diff(&[declared], &materialized);
        assert!(matches!(&d.changes[0], SchemaChange::AddColumn { column, .. } if column.name == "tag"));
        assert_eq!(
            d.changes[1],
            SchemaChange::SetPrimaryKey {
                table: "tag".into(),
                columns: vec!["vm_id".into(), "tag".into()],
            }
        );

        let sql = render_sql("vsphere", &d.changes);
        assert!(!sql.contains("\"tag\" text NOT NULL PRIMARY KEY"));
        assert!(sql.contains("ADD CONSTRAINT \"tag_pkey\" PRIMARY KEY (\"vm_id\", \"tag\")"));
        assert!(sql.contains("WHERE conrelid = '\"vsphere\".\"tag\"'::regclass AND contype = 'p'"));
    }

    #[test]
    fn constraint_ddl_is_guarded_by_name() {
        let sql = render_sql(
            "vsphere",
            &[
                SchemaChange::AddUnique {
                    table: "host".into(),
                    column: "name".into(),
                },
                SchemaChange::AddForeignKey {
                    table: "host".into(),
                    column: "vcenter_id".into(),
                    references: "vcenter.id".into(),
                },
            ],
        );

        assert!(sql.contains("WHERE conname = 'host_name_key' AND connamespace = '\"vsphere\"'::regnamespace"));
        assert!(sql.contains("ADD CONSTRAINT \"host_name_key\" UNIQUE (\"name\");"));
        assert!(sql.contains("WHERE conname = 'host_vcenter_id_fkey'"));
        assert!(sql.contains(
            "ADD CONSTRAINT \"host_vcenter_id_fkey\" FOREIGN KEY (\"vcenter_id\") \
             REFERENCES \"vsphere\".\"vcenter\" (\"id\") ON DELETE CASCADE;"
        ));
        assert_eq!(sql.matches("IF NOT EXISTS").count(), 2);
        assert_eq!(sql.matches("END IF;").count(), 2);
    }

    #[test]
    fn long_constraint_names_are_truncated_like_postgres() {
        let table = "t".repeat(40);
        let column = "c".repeat(40);
        let name = constraint_name(&table, Some(&column), "key");
        assert_eq!(name.len(), 63);
        assert!(name.starts_with(&table));
        assert_eq!(constraint_name("host", None, "pkey"), "host_pkey");
    }

    #[test]
    fn materialized_columns_without_constraint_fields_deserialize() {
        let column: MaterializedColumn =
            serde_json::from_str(r#"{"name":"id","data_type":"uuid","nullable":false}"#).unwrap();
        assert_eq!(column, MaterializedColumn::new("id", "uuid", false));
    }

    #[test]
    fn changes_serialize_with_op_tag() {
        let change = SchemaChange::SetNullable {
            table: "vcenter".into(),
            column: "url".into(),
            nullable: true,
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["op"], "set_nullable");
    }
}
