//! Configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::plugin::PluginConfig;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port (default: 3000).
    pub port: u16,

    /// PostgreSQL connection URL.
    pub database_url: String,

    /// Maximum database connections in pool (default: 10).
    pub database_max_connections: u32,

    /// Role granted rights on plugin schemas. Defaults to the connecting user.
    pub database_runtime_role: Option<String>,

    /// Path to plugins directory (default: ./plugins).
    pub plugins_dir: PathBuf,

    /// Prefix for the API routes (default: /api/v1).
    pub api_prefix: String,

    /// Local catalog file. Takes precedence over `catalog_url`.
    pub catalog_path: Option<PathBuf>,

    /// Remote catalog URL.
    pub catalog_url: Option<String>,

    /// CORS allowed origins (comma-separated, default: "*").
    pub cors_allowed_origins: Vec<String>,

    /// Seconds before a request is aborted (default: 30).
    pub request_timeout_secs: u64,

    /// WASM runtime settings.
    pub plugin: PluginConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .context("PORT must be a valid u16")?;

        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL environment variable is required")?;

        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .context("DATABASE_MAX_CONNECTIONS must be a valid u32")?;

        let database_runtime_role = non_empty("DATABASE_RUNTIME_ROLE");

        let plugins_dir = env::var("PLUGINS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./plugins"));

        let api_prefix = normalize_prefix(
            &env::var("API_PREFIX").unwrap_or_else(|_| "/api/v1".to_string()),
        );

        let catalog_path = non_empty("CATALOG_PATH").map(PathBuf::from);
        let catalog_url = non_empty("CATALOG_URL");
        if let Some(url) = &catalog_url {
            url::Url::parse(url).context("CATALOG_URL must be a valid URL")?;
        }

        let cors_allowed_origins = env::var("CORS_ALLOWED_ORIGINS")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_else(|_| vec!["*".to_string()]);

        let request_timeout_secs = env::var("REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .context("REQUEST_TIMEOUT_SECS must be a valid u64")?;

        let defaults = PluginConfig::default();
        let plugin = PluginConfig {
            max_instances: env::var("PLUGIN_MAX_INSTANCES")
                .map(|v| v.parse())
                .unwrap_or(Ok(defaults.max_instances))
                .context("PLUGIN_MAX_INSTANCES must be a valid u32")?,
            max_memory_pages: env::var("PLUGIN_MAX_MEMORY_PAGES")
                .map(|v| v.parse())
                .unwrap_or(Ok(defaults.max_memory_pages))
                .context("PLUGIN_MAX_MEMORY_PAGES must be a valid u64")?,
            pooling: env::var("PLUGIN_POOLING")
                .map(|v| parse_bool(&v))
                .unwrap_or(Ok(defaults.pooling))
                .context("PLUGIN_POOLING must be true or false")?,
            ..defaults
        };

        Ok(Self {
            port,
            database_url,
            database_max_connections,
            database_runtime_role,
            plugins_dir,
            api_prefix,
            catalog_path,
            catalog_url,
            cors_allowed_origins,
            request_timeout_secs,
            plugin,
        })
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("invalid boolean '{other}'"),
    }
}

/// `api/v1/` and `/api/v1` both become `/api/v1`; an empty prefix stays empty.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_are_normalized() {
        assert_eq!(normalize_prefix("/api/v1"), "/api/v1");
        assert_eq!(normalize_prefix("api/v1/"), "/api/v1");
        assert_eq!(normalize_prefix("/"), "");
        assert_eq!(normalize_prefix(""), "");
    }

    #[test]
    fn booleans() {
        assert!(parse_bool("TRUE").unwrap());
        assert!(!parse_bool("off").unwrap());
        assert!(parse_bool("maybe").is_err());
    }
}
