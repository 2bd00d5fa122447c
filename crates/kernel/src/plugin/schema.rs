//! Per-plugin storage namespaces.
//!
//! Every plugin owns one Postgres schema. Provisioning is idempotent and
//! runs on every activation; teardown only happens on explicit deletion.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info};

use super::descriptor::is_valid_schema_name;

/// Creates and destroys plugin storage namespaces.
#[async_trait]
pub trait SchemaProvisioner: Send + Sync {
    /// Create the namespace if needed and grant the runtime principal full
    /// rights on it, including objects created later.
    async fn provision(&self, schema: &str) -> Result<()>;

    /// Drop the namespace and everything in it.
    async fn teardown(&self, schema: &str) -> Result<()>;
}

/// Quote a Postgres identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Postgres implementation.
#[derive(Clone)]
pub struct PgSchemaProvisioner {
    pool: PgPool,
    /// Role granted access. `None` grants to the connecting role.
    runtime_role: Option<String>,
}

impl PgSchemaProvisioner {
    pub fn new(pool: PgPool, runtime_role: Option<String>) -> Self {
        Self { pool, runtime_role }
    }

    fn grantee(&self) -> String {
        match &self.runtime_role {
            Some(role) => quote_ident(role),
            None => "CURRENT_USER".to_string(),
        }
    }
}

/// Statements that create and grant a schema. Every statement is safe to
/// repeat.
pub fn provision_statements(schema: &str, grantee: &str) -> Vec<String> {
    let s = quote_ident(schema);
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS {s}"),
        format!("GRANT ALL ON SCHEMA {s} TO {grantee}"),
        format!("GRANT ALL ON ALL TABLES IN SCHEMA {s} TO {grantee}"),
        format!("GRANT ALL ON ALL SEQUENCES IN SCHEMA {s} TO {grantee}"),
        format!("ALTER DEFAULT PRIVILEGES IN SCHEMA {s} GRANT ALL ON TABLES TO {grantee}"),
        format!("ALTER DEFAULT PRIVILEGES IN SCHEMA {s} GRANT ALL ON SEQUENCES TO {grantee}"),
        format!("ALTER DEFAULT PRIVILEGES IN SCHEMA {s} GRANT ALL ON FUNCTIONS TO {grantee}"),
    ]
}

fn ensure_valid(schema: &str) -> Result<()> {
    if !is_valid_schema_name(schema) {
        bail!("refusing to touch invalid schema name '{schema}'");
    }
    Ok(())
}

#[async_trait]
impl SchemaProvisioner for PgSchemaProvisioner {
    async fn provision(&self, schema: &str) -> Result<()> {
        ensure_valid(schema)?;

        let mut tx = self.pool.begin().await?;
        for statement in provision_statements(schema, &self.grantee()) {
            debug!(%schema, %statement, "provisioning");
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("failed to provision schema '{schema}'"))?;
        }
        tx.commit().await?;

        info!(%schema, "schema provisioned");
        Ok(())
    }

    async fn teardown(&self, schema: &str) -> Result<()> {
        ensure_valid(schema)?;

        sqlx::query(&format!(
            "DROP SCHEMA IF EXISTS {} CASCADE",
            quote_ident(schema)
        ))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to drop schema '{schema}'"))?;

        info!(%schema, "schema dropped");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("vsphere"), "\"vsphere\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn provisioning_is_repeatable() {
        let statements = provision_statements("vsphere", "CURRENT_USER");
        assert_eq!(statements[0], "CREATE SCHEMA IF NOT EXISTS \"vsphere\"");
        assert!(
            statements
                .iter()
                .any(|s| s.contains("DEFAULT PRIVILEGES") && s.ends_with("FUNCTIONS TO CURRENT_USER"))
        );
        // Nothing that fails on a second run
        assert!(statements.iter().all(|s| !s.starts_with("CREATE SCHEMA \"")));
    }

    #[test]
    fn rejects_system_schemas() {
        assert!(ensure_valid("public").is_err());
        assert!(ensure_valid("pg_catalog").is_err());
        assert!(ensure_valid("vsphere").is_ok());
    }
}
