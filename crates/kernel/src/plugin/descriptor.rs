//! Parser for plugin `plugin.toml` manifest files.
//!
//! Each plugin directory carries one manifest declaring:
//! - name, version, description
//! - schema (the storage namespace the plugin owns)
//! - entry_point (optional, defaults to `{name}.wasm`)

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::error::PluginError;

/// Manifest file name expected at the root of every plugin directory.
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Names that would collide with the plugin admin API paths.
pub const RESERVED_NAMES: &[&str] = &["discover", "sync", "catalog", "by-name"];

static PLUGIN_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[a-z][a-z0-9_]{1,63}$").expect("plugin name regex is valid")
});

static SCHEMA_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[a-z][a-z0-9_]{2,19}$").expect("schema name regex is valid")
});

/// Plugin metadata parsed from `plugin.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginDescriptor {
    /// Plugin machine name, the registry join key.
    pub name: String,

    /// Release version (e.g., "1.0.0").
    pub version: String,

    /// Human-readable description.
    pub description: String,

    /// Storage namespace owned by the plugin.
    pub schema_name: String,

    /// Entry point module, relative to the plugin directory.
    pub entry_point: PathBuf,
}

/// Manifest as written on disk. Required fields are optional here so a
/// missing key produces a targeted message instead of a serde error.
#[derive(Debug, Deserialize)]
struct RawManifest {
    name: Option<String>,
    version: Option<String>,
    #[serde(default)]
    description: String,
    schema: Option<String>,
    entry_point: Option<String>,
}

impl PluginDescriptor {
    /// Read the manifest from a plugin directory.
    pub fn load(plugin_dir: &Path) -> Result<Self, PluginError> {
        let path = plugin_dir.join(MANIFEST_FILE);
        if !path.is_file() {
            return Err(PluginError::DescriptorMissing {
                path: plugin_dir.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| PluginError::malformed(path.display().to_string(), e.to_string()))?;

        Self::parse_str(&content, &path)
    }

    /// Parse a manifest from a TOML string.
    pub fn parse_str(content: &str, path: &Path) -> Result<Self, PluginError> {
        let location = path.display().to_string();
        let raw: RawManifest = toml::from_str(content)
            .map_err(|e| PluginError::malformed(&location, format!("invalid TOML: {e}")))?;

        let name = required(raw.name, "name", &location)?;
        let version = required(raw.version, "version", &location)?;
        let schema_name = required(raw.schema, "schema", &location)?;

        if RESERVED_NAMES.contains(&name.as_str()) {
            return Err(PluginError::malformed(
                &location,
                format!("'name' = '{name}' is reserved"),
            ));
        }
        if !is_valid_plugin_name(&name) {
            return Err(PluginError::malformed(
                &location,
                format!("'name' = '{name}' must be lowercase alphanumeric/underscore, 2-64 chars"),
            ));
        }
        if !is_valid_schema_name(&schema_name) {
            return Err(PluginError::malformed(
                &location,
                format!(
                    "'schema' = '{schema_name}' must be lowercase alphanumeric/underscore, 3-20 chars, not a system schema"
                ),
            ));
        }

        let entry_point = match raw.entry_point {
            Some(p) => {
                let p = PathBuf::from(p);
                let escapes = p.is_absolute()
                    || p
                        .components()
                        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
                if escapes {
                    return Err(PluginError::malformed(
                        &location,
                        format!("'entry_point' = '{}' must stay inside the plugin directory", p.display()),
                    ));
                }
                p
            }
            None => PathBuf::from(format!("{name}.wasm")),
        };

        Ok(Self {
            name,
            version,
            description: raw.description,
            schema_name,
            entry_point,
        })
    }

    /// Absolute path of the entry point for a plugin rooted at `plugin_dir`.
    pub fn entry_point_path(&self, plugin_dir: &Path) -> PathBuf {
        plugin_dir.join(&self.entry_point)
    }
}

fn required(value: Option<String>, field: &str, location: &str) -> Result<String, PluginError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        Some(_) => Err(PluginError::malformed(location, format!("empty '{field}' field"))),
        None => Err(PluginError::malformed(
            location,
            format!("missing required field '{field}'"),
        )),
    }
}

/// Check a plugin machine name.
pub fn is_valid_plugin_name(name: &str) -> bool {
    PLUGIN_NAME_RE.is_match(name)
}

/// Check a storage namespace name: identifier-safe, 3-20 chars and not
/// one of the database's own schemas.
pub fn is_valid_schema_name(schema: &str) -> bool {
    SCHEMA_NAME_RE.is_match(schema)
        && schema != "public"
        && schema != "information_schema"
        && !schema.starts_with("pg_")
}
