//! Persisted plugin registry.
//!
//! The `plugin` table records which plugins are known, the metadata last
//! synchronized from their manifests, and whether they are enabled. The
//! enabled flag is the only input the module loader reads at boot.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::sync::SyncPlan;

/// A row from the `plugin` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct PluginRecord {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub version: String,
    pub schema_name: String,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Storage for plugin records.
#[async_trait]
pub trait PluginRegistry: Send + Sync {
    /// All records, ordered by name.
    async fn all(&self) -> Result<Vec<PluginRecord>>;

    /// One page of records ordered by name, plus the total count.
    async fn page(&self, offset: i64, limit: i64) -> Result<(Vec<PluginRecord>, i64)>;

    async fn get(&self, id: Uuid) -> Result<Option<PluginRecord>>;

    async fn get_by_name(&self, name: &str) -> Result<Option<PluginRecord>>;

    /// Enabled records, ordered by name.
    async fn enabled(&self) -> Result<Vec<PluginRecord>>;

    /// Apply a sync plan atomically. Returns the number of records written.
    async fn apply_sync(&self, plan: &SyncPlan) -> Result<u64>;

    /// Flip the enabled flag. Returns false when the record is missing or
    /// already in the requested state.
    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool>;

    /// Remove a record. Returns false when it did not exist.
    async fn delete(&self, name: &str) -> Result<bool>;
}

const RECORD_COLUMNS: &str =
    "id, name, description, version, schema_name, enabled, created_at, updated_at";

/// Postgres-backed registry.
#[derive(Clone)]
pub struct PgPluginRegistry {
    pool: PgPool,
}

impl PgPluginRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PluginRegistry for PgPluginRegistry {
    async fn all(&self) -> Result<Vec<PluginRecord>> {
        let rows = sqlx::query_as::<_, PluginRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM plugin ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await
        .context("failed to list plugins")?;

        Ok(rows)
    }

    async fn page(&self, offset: i64, limit: i64) -> Result<(Vec<PluginRecord>, i64)> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM plugin")
            .fetch_one(&self.pool)
            .await
            .context("failed to count plugins")?;

        let rows = sqlx::query_as::<_, PluginRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM plugin ORDER BY name OFFSET $1 LIMIT $2"
        ))
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to list plugins")?;

        Ok((rows, count))
    }

    async fn get(&self, id: Uuid) -> Result<Option<PluginRecord>> {
        let row = sqlx::query_as::<_, PluginRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM plugin WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch plugin by id")?;

        Ok(row)
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<PluginRecord>> {
        let row = sqlx::query_as::<_, PluginRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM plugin WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch plugin by name")?;

        Ok(row)
    }

    async fn enabled(&self) -> Result<Vec<PluginRecord>> {
        let rows = sqlx::query_as::<_, PluginRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM plugin WHERE enabled ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await
        .context("failed to list enabled plugins")?;

        Ok(rows)
    }

    async fn apply_sync(&self, plan: &SyncPlan) -> Result<u64> {
        if plan.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let mut count = 0u64;

        for update in &plan.updates {
            let m = &update.metadata;
            let result = sqlx::query(
                "UPDATE plugin SET version = $2, description = $3, schema_name = $4, updated_at = $5 \
                 WHERE name = $1 \
                 AND (version, description, schema_name) IS DISTINCT FROM ($2, $3, $4)",
            )
            .bind(&m.name)
            .bind(&m.version)
            .bind(&m.description)
            .bind(&m.schema_name)
            .bind(now)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to update plugin '{}'", m.name))?;

            count += result.rows_affected();
        }

        for m in &plan.inserts {
            // A concurrent sync may have inserted the same name first
            let result = sqlx::query(
                "INSERT INTO plugin (id, name, description, version, schema_name, enabled, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, FALSE, $6, $6) \
                 ON CONFLICT (name) DO NOTHING",
            )
            .bind(Uuid::now_v7())
            .bind(&m.name)
            .bind(&m.description)
            .bind(&m.version)
            .bind(&m.schema_name)
            .bind(now)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to register plugin '{}'", m.name))?;

            count += result.rows_affected();
        }

        tx.commit().await.context("failed to commit plugin sync")?;
        Ok(count)
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            "UPDATE plugin SET enabled = $1, updated_at = $2 WHERE name = $3 AND enabled = $4",
        )
        .bind(enabled)
        .bind(now)
        .bind(name)
        .bind(!enabled)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update enabled flag for '{name}'"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM plugin WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete plugin '{name}'"))?;

        Ok(result.rows_affected() > 0)
    }
}
