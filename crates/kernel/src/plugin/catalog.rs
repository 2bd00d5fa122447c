//! Remote plugin catalog.
//!
//! The catalog lists plugins that can be installed but are not on disk
//! yet. It is read from a local JSON file or fetched over HTTP and never
//! persisted.

use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::error::PluginError;

static CATALOG_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]{0,127}$").expect("catalog id regex is valid")
});

/// An installable plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Also the directory name the archive is extracted into.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    /// Human-facing download page.
    #[serde(default)]
    pub download_url: String,
    pub archive_url: String,
    pub archive_type: String,
}

impl CatalogEntry {
    /// The archive format, if supported.
    pub fn archive(&self) -> Result<ArchiveType, PluginError> {
        ArchiveType::parse(&self.id, &self.archive_type)
    }
}

/// Archive formats the installer can extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveType {
    Zip,
    TarGz,
}

impl ArchiveType {
    pub const SUPPORTED: &'static str = "zip, tar.gz, tgz";

    pub fn parse(id: &str, value: &str) -> Result<Self, PluginError> {
        match value.to_ascii_lowercase().as_str() {
            "zip" => Ok(Self::Zip),
            "tar.gz" | "tgz" => Ok(Self::TarGz),
            _ => Err(PluginError::UnsupportedArchiveType {
                id: id.to_string(),
                archive_type: value.to_string(),
                supported: Self::SUPPORTED.to_string(),
            }),
        }
    }
}

impl fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zip => f.write_str("zip"),
            Self::TarGz => f.write_str("tar.gz"),
        }
    }
}

/// Whether `id` can be used as a single directory name.
pub fn is_safe_id(id: &str) -> bool {
    CATALOG_ID_RE.is_match(id) && !id.contains("..")
}

/// Where catalog entries come from.
#[derive(Debug, Clone)]
pub enum CatalogSource {
    /// No catalog configured.
    Empty,
    File(PathBuf),
    Url(String),
}

/// Read-only view of the catalog.
#[derive(Clone)]
pub struct Catalog {
    source: CatalogSource,
    client: reqwest::Client,
}

impl Catalog {
    pub fn new(source: CatalogSource, client: reqwest::Client) -> Self {
        Self { source, client }
    }

    /// Prefer a local file over a URL when both are set.
    pub fn from_settings(
        path: Option<PathBuf>,
        url: Option<String>,
        client: reqwest::Client,
    ) -> Self {
        let source = match (path, url) {
            (Some(path), _) => CatalogSource::File(path),
            (None, Some(url)) => CatalogSource::Url(url),
            (None, None) => CatalogSource::Empty,
        };
        Self::new(source, client)
    }

    /// All entries.
    pub async fn entries(&self) -> Result<Vec<CatalogEntry>, PluginError> {
        let body = match &self.source {
            CatalogSource::Empty => return Ok(Vec::new()),
            CatalogSource::File(path) => tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read catalog {}", path.display()))?,
            CatalogSource::Url(url) => self
                .client
                .get(url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .with_context(|| format!("failed to fetch catalog {url}"))?
                .text()
                .await
                .context("failed to read catalog body")?,
        };

        let entries: Vec<CatalogEntry> =
            serde_json::from_str(&body).context("catalog is not a JSON array of entries")?;
        Ok(entries)
    }

    /// One entry by id.
    pub async fn get(&self, id: &str) -> Result<CatalogEntry, PluginError> {
        self.entries()
            .await?
            .into_iter()
            .find(|e| e.id == id)
            .ok_or_else(|| PluginError::CatalogEntryNotFound { id: id.to_string() })
    }
}
