//! Catalog installs end to end: archives are served over HTTP from a local
//! listener, downloaded, extracted into the plugin root and registered.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use common::{Harness, post, vsphere};
use serde_json::json;
use vantage_kernel::plugin::{ArchiveInstaller, CatalogEntry, discover_plugins};
use vantage_test_utils::{stored_zip, tar_gz};

type Archives = Arc<BTreeMap<String, Vec<u8>>>;

async fn archive(
    State(archives): State<Archives>,
    Path(file): Path<String>,
) -> Result<Vec<u8>, StatusCode> {
    archives.get(&file).cloned().ok_or(StatusCode::NOT_FOUND)
}

/// Serve `archives` under `/archives/{file}` and return the base URL.
async fn serve(archives: BTreeMap<String, Vec<u8>>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new()
        .route("/archives/{file}", get(archive))
        .with_state(Arc::new(archives));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/archives")
}

fn entry(id: &str, url: String, archive_type: &str) -> CatalogEntry {
    CatalogEntry {
        id: id.to_string(),
        name: id.to_string(),
        description: String::new(),
        version: "1.0.0".to_string(),
        download_url: String::new(),
        archive_url: url,
        archive_type: archive_type.to_string(),
    }
}

fn installer(harness: &Harness) -> ArchiveInstaller {
    ArchiveInstaller::new(reqwest::Client::new(), harness.lifecycle())
}

#[tokio::test]
async fn tar_gz_install_registers_plugin_disabled() {
    let harness = Harness::new();
    let bytes = tar_gz(&vsphere().archive_files("vsphere-1.0.0")).unwrap();
    let base = serve(BTreeMap::from([("vsphere.tar.gz".to_string(), bytes)])).await;

    let report = installer(&harness)
        .install(&entry("vsphere", format!("{base}/vsphere.tar.gz"), "tar.gz"))
        .await
        .unwrap();

    assert_eq!(report.inserted, vec!["vsphere".to_string()]);
    assert!(harness.plugins_dir().join("vsphere/plugin.toml").is_file());
    let record = harness.record("vsphere").await.unwrap();
    assert!(!record.enabled);
    assert_eq!(record.description, "vCenter inventory");
}

#[tokio::test]
async fn zip_install_replaces_previous_version() {
    let harness = Harness::new();
    harness.install(&vsphere());
    let lifecycle = harness.lifecycle();
    lifecycle.sync().await.unwrap();

    let upgraded = vsphere().version("2.0.0");
    let bytes = stored_zip(&upgraded.archive_files("")).unwrap();
    let base = serve(BTreeMap::from([("vsphere.zip".to_string(), bytes)])).await;

    let report = installer(&harness)
        .install(&entry("vsphere", format!("{base}/vsphere.zip"), "zip"))
        .await
        .unwrap();

    assert_eq!(report.updated, vec!["vsphere".to_string()]);
    let record = harness.record("vsphere").await.unwrap();
    assert_eq!(record.version, "2.0.0");
    assert!(!record.enabled);
}

#[tokio::test]
async fn failed_download_leaves_plugin_root_discoverable() {
    let harness = Harness::new();
    harness.install(&vantage_test_utils::PluginFixture::new("netbox"));
    let base = serve(BTreeMap::new()).await;

    let result = installer(&harness)
        .install(&entry("vsphere", format!("{base}/vsphere.zip"), "zip"))
        .await;

    let err = result.unwrap_err();
    assert!(format!("{err:#}").contains("404"));
    assert!(!harness.plugins_dir().join("vsphere").exists());
    assert!(harness.record("vsphere").await.is_none());

    let catalog = discover_plugins(harness.plugins_dir()).unwrap();
    assert_eq!(catalog.keys().cloned().collect::<Vec<_>>(), vec!["netbox"]);
}

#[tokio::test]
async fn catalog_install_endpoint_installs_in_background() {
    let bytes = tar_gz(&vsphere().archive_files("")).unwrap();
    let base = serve(BTreeMap::from([("vsphere.tar.gz".to_string(), bytes)])).await;
    let harness = Harness::new().with_catalog(json!([
        {
            "id": "vsphere",
            "name": "vSphere",
            "version": "1.0.0",
            "archive_url": format!("{base}/vsphere.tar.gz"),
            "archive_type": "tar.gz"
        }
    ]));
    let (_, app) = harness.boot().await;

    let (status, _) = post(&app, "/api/v1/plugins/catalog/vsphere/install").await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let mut record = None;
    for _ in 0..100 {
        record = harness.record("vsphere").await;
        if record.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!record.expect("plugin registered by background install").enabled);
}
