//! Catalog archive installer.
//!
//! Installs run off the request path. The archive is downloaded, extracted
//! into a dot-prefixed staging directory inside the plugin root, renamed
//! into place and followed by a registry sync. Discovery ignores staging
//! directories, so a crash mid-install never produces a half-read plugin.

use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::catalog::{ArchiveType, CatalogEntry, is_safe_id};
use super::descriptor::MANIFEST_FILE;
use super::error::PluginError;
use super::lifecycle::LifecycleController;
use super::sync::SyncReport;

/// Downloads catalog archives into the plugin root.
pub struct ArchiveInstaller {
    plugins_dir: PathBuf,
    client: reqwest::Client,
    lifecycle: Arc<LifecycleController>,
}

impl ArchiveInstaller {
    pub fn new(client: reqwest::Client, lifecycle: Arc<LifecycleController>) -> Self {
        Self {
            plugins_dir: lifecycle.plugins_dir().to_path_buf(),
            client,
            lifecycle,
        }
    }

    /// Validate `entry` and start installing it in the background.
    ///
    /// Only validation errors are returned. Download and extraction
    /// failures are logged by the task.
    pub fn spawn_install(
        self: &Arc<Self>,
        entry: CatalogEntry,
    ) -> Result<JoinHandle<()>, PluginError> {
        check_entry(&entry)?;

        let installer = Arc::clone(self);
        Ok(tokio::spawn(async move {
            match installer.install(&entry).await {
                Ok(report) => info!(
                    id = %entry.id,
                    version = %entry.version,
                    changed = report.changed,
                    "catalog plugin installed"
                ),
                Err(e) => error!(id = %entry.id, error = %format!("{e:#}"), "catalog install failed"),
            }
        }))
    }

    /// Install `entry` and sync the registry.
    pub async fn install(&self, entry: &CatalogEntry) -> Result<SyncReport> {
        let archive = check_entry(entry)?;
        let target = self.plugins_dir.join(&entry.id);

        if target.exists() {
            tokio::fs::remove_dir_all(&target)
                .await
                .with_context(|| format!("failed to remove {}", target.display()))?;
            debug!(path = %target.display(), "removed previous plugin directory");
        }

        info!(id = %entry.id, url = %entry.archive_url, "downloading plugin archive");
        let bytes = self
            .client
            .get(&entry.archive_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("failed to download {}", entry.archive_url))?
            .bytes()
            .await
            .context("failed to read archive body")?;

        let plugins_dir = self.plugins_dir.clone();
        let id = entry.id.clone();
        let installed = tokio::task::spawn_blocking(move || {
            unpack(&plugins_dir, &id, archive, &bytes)
        })
        .await
        .context("extraction task panicked")??;

        debug!(path = %installed.display(), "plugin archive extracted");

        Ok(self.lifecycle.sync().await?)
    }
}

fn check_entry(entry: &CatalogEntry) -> Result<ArchiveType, PluginError> {
    if !is_safe_id(&entry.id) {
        return Err(PluginError::InvalidCatalogId {
            id: entry.id.clone(),
        });
    }
    entry.archive()
}

/// Extract `bytes` into `plugins_dir/id`, replacing whatever is there.
pub fn unpack(plugins_dir: &Path, id: &str, archive: ArchiveType, bytes: &[u8]) -> Result<PathBuf> {
    std::fs::create_dir_all(plugins_dir)
        .with_context(|| format!("create {}", plugins_dir.display()))?;

    let mut download = tempfile::Builder::new()
        .prefix(".download-")
        .tempfile_in(plugins_dir)
        .context("create download file")?;
    download.write_all(bytes).context("write download file")?;
    download.flush().context("flush download file")?;

    let staging = tempfile::Builder::new()
        .prefix(".staging-")
        .tempdir_in(plugins_dir)
        .context("create staging directory")?;

    match archive {
        ArchiveType::Zip => extract_zip_to_dir(download.path(), staging.path())?,
        ArchiveType::TarGz => extract_tar_gz_to_dir(download.path(), staging.path())?,
    }
    download.close().context("remove download file")?;

    let root = content_root(staging.path())?;
    let target = plugins_dir.join(id);
    if target.exists() {
        std::fs::remove_dir_all(&target)
            .with_context(|| format!("remove {}", target.display()))?;
    }
    std::fs::rename(&root, &target)
        .with_context(|| format!("move {} to {}", root.display(), target.display()))?;

    Ok(target)
}

/// The directory holding the manifest: the staging root, or its only
/// subdirectory when the archive wraps everything in one folder.
fn content_root(staging: &Path) -> Result<PathBuf> {
    if staging.join(MANIFEST_FILE).is_file() {
        return Ok(staging.to_path_buf());
    }

    let entries = std::fs::read_dir(staging)
        .with_context(|| format!("read {}", staging.display()))?
        .collect::<std::io::Result<Vec<_>>>()?;

    match entries.as_slice() {
        [only] if only.path().is_dir() => Ok(only.path()),
        _ => Ok(staging.to_path_buf()),
    }
}

fn reject_unsafe(path: &Path, archive: &str) -> Result<()> {
    if path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        bail!("unsupported or malicious path in {archive}: {}", path.display());
    }
    Ok(())
}

fn extract_zip_to_dir(zip_path: &Path, out_dir: &Path) -> Result<()> {
    let buf = std::fs::read(zip_path).with_context(|| format!("read {}", zip_path.display()))?;
    let archive =
        rawzip::ZipArchive::from_slice(&buf).map_err(|e| anyhow!("invalid zip archive: {e:?}"))?;

    for entry in archive.entries() {
        let entry = entry.map_err(|e| anyhow!("zip entry error: {e:?}"))?;
        let filename = entry
            .file_path()
            .try_normalize()
            .map_err(|e| anyhow!("failed to normalize zip path: {e:?}"))?
            .as_ref()
            .to_string();
        reject_unsafe(Path::new(&filename), "zip")?;

        let out_path = out_dir.join(&filename);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)
                .with_context(|| format!("create {}", out_path.display()))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }

        let mut out = std::fs::File::create(&out_path)
            .with_context(|| format!("create {}", out_path.display()))?;
        let slice_entry = archive
            .get_entry(entry.wayfinder())
            .map_err(|e| anyhow!("failed to get entry data: {e:?}"))?;
        let data = slice_entry.data();
        match entry.compression_method() {
            rawzip::CompressionMethod::Store => {
                std::io::copy(&mut &*data, &mut out)
                    .with_context(|| format!("extract {} to {}", filename, out_path.display()))?;
            }
            rawzip::CompressionMethod::Deflate => {
                let mut decoder = flate2::read::DeflateDecoder::new(data);
                std::io::copy(&mut decoder, &mut out).with_context(|| {
                    format!("extract (deflate) {} to {}", filename, out_path.display())
                })?;
            }
            method => bail!("unsupported compression method: {method:?}"),
        }
    }

    Ok(())
}

fn extract_tar_gz_to_dir(tar_path: &Path, out_dir: &Path) -> Result<()> {
    let file =
        std::fs::File::open(tar_path).with_context(|| format!("read {}", tar_path.display()))?;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));

    for entry in archive.entries().context("invalid tar.gz archive")? {
        let mut entry = entry.context("tar entry error")?;
        let kind = entry.header().entry_type();
        let path = entry.path().context("invalid tar path")?.into_owned();

        // Links could point outside the plugin directory.
        if !kind.is_file() && !kind.is_dir() {
            debug!(path = %path.display(), "skipping non-regular tar entry");
            continue;
        }
        reject_unsafe(&path, "tar")?;

        entry
            .unpack_in(out_dir)
            .with_context(|| format!("extract {}", path.display()))?;
    }

    Ok(())
}
