#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Common test utilities for integration tests.
//!
//! [`Harness`] wires the real lifecycle, loader and router to in-memory
//! registry and storage over a temporary plugin directory. The WASM runtime
//! runs without the pooling allocator so many harnesses can coexist in one
//! test binary.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use vantage_kernel::plugin::memory::{MemoryRegistry, MemoryStorage};
use vantage_kernel::plugin::{
    Catalog, CatalogSource, LifecycleController, MaterializedSchema, MigrationRecord,
    MigrationStore, NewMigration, PluginConfig, PluginRecord, PluginRuntime,
};
use vantage_kernel::routes;
use vantage_kernel::state::{AppState, StateParts};
use vantage_sdk::types::{ColumnDeclaration, ColumnType, RouteDefinition, RouteResponse, StorageDeclaration};
use vantage_test_utils::PluginFixture;

pub const API_PREFIX: &str = "/api/v1";

/// In-memory services over a temporary plugin directory.
pub struct Harness {
    pub dir: TempDir,
    pub registry: Arc<MemoryRegistry>,
    pub storage: Arc<MemoryStorage>,
    pub migrations: Arc<CountingMigrations>,
    pub runtime: Arc<PluginRuntime>,
    pub catalog: Option<std::path::PathBuf>,
}

impl Harness {
    pub fn new() -> Self {
        let config = PluginConfig {
            pooling: false,
            ..PluginConfig::default()
        };
        let storage = Arc::new(MemoryStorage::new());
        Self {
            dir: tempfile::tempdir().unwrap(),
            registry: Arc::new(MemoryRegistry::new()),
            migrations: Arc::new(CountingMigrations::new(storage.clone())),
            storage,
            runtime: Arc::new(PluginRuntime::new(&config).unwrap()),
            catalog: None,
        }
    }

    pub fn plugins_dir(&self) -> &Path {
        self.dir.path()
    }

    /// Write a fixture into the plugin directory.
    pub fn install(&self, fixture: &PluginFixture) {
        fixture.write(self.plugins_dir()).unwrap();
    }

    /// Serve the catalog from a JSON file.
    pub fn with_catalog(mut self, entries: Value) -> Self {
        let path = self.dir.path().join(".catalog.json");
        std::fs::write(&path, entries.to_string()).unwrap();
        self.catalog = Some(path);
        self
    }

    pub fn parts(&self) -> StateParts {
        let http = reqwest::Client::new();
        let source = match &self.catalog {
            Some(path) => CatalogSource::File(path.clone()),
            None => CatalogSource::Empty,
        };
        StateParts {
            db: None,
            registry: self.registry.clone(),
            provisioner: self.storage.clone(),
            migrations: self.migrations.clone(),
            runtime: self.runtime.clone(),
            plugins_dir: self.plugins_dir().to_path_buf(),
            api_prefix: API_PREFIX.to_string(),
            catalog: Catalog::new(source, http.clone()),
            http,
        }
    }

    pub fn lifecycle(&self) -> Arc<LifecycleController> {
        self.parts().lifecycle()
    }

    /// Simulate a process start: load enabled plugins and build the router.
    pub async fn boot(&self) -> (AppState, Router) {
        let state = AppState::boot(self.parts()).await;
        let app = routes::app(state.clone());
        (state, app)
    }

    pub async fn record(&self, name: &str) -> Option<PluginRecord> {
        use vantage_kernel::plugin::PluginRegistry;
        self.registry.get_by_name(name).await.unwrap()
    }
}

/// Migration store that counts apply runs and fails them on request.
pub struct CountingMigrations {
    inner: Arc<MemoryStorage>,
    calls: Mutex<BTreeMap<String, usize>>,
    failing: Mutex<BTreeSet<String>>,
}

impl CountingMigrations {
    pub fn new(inner: Arc<MemoryStorage>) -> Self {
        Self {
            inner,
            calls: Mutex::new(BTreeMap::new()),
            failing: Mutex::new(BTreeSet::new()),
        }
    }

    /// Number of apply runs for `plugin`, failed ones included.
    pub fn apply_calls(&self, plugin: &str) -> usize {
        self.calls.lock().get(plugin).copied().unwrap_or(0)
    }

    /// Make every following apply run for `plugin` fail.
    pub fn fail_for(&self, plugin: &str) {
        self.failing.lock().insert(plugin.to_string());
    }
}

#[async_trait::async_trait]
impl MigrationStore for CountingMigrations {
    async fn materialized(&self, schema: &str) -> anyhow::Result<MaterializedSchema> {
        self.inner.materialized(schema).await
    }

    async fn apply(
        &self,
        plugin: &str,
        schema: &str,
        generated: Option<NewMigration>,
    ) -> anyhow::Result<Vec<i32>> {
        *self.calls.lock().entry(plugin.to_string()).or_default() += 1;
        if self.failing.lock().contains(plugin) {
            anyhow::bail!("migration failure injected for '{plugin}'");
        }
        self.inner.apply(plugin, schema, generated).await
    }

    async fn history(&self, plugin: &str) -> anyhow::Result<Vec<MigrationRecord>> {
        self.inner.history(plugin).await
    }

    async fn forget(&self, plugin: &str) -> anyhow::Result<u64> {
        self.inner.forget(plugin).await
    }
}

/// The reference inventory plugin as a fixture.
pub fn vsphere() -> PluginFixture {
    PluginFixture::new("vsphere")
        .description("vCenter inventory")
        .table(
            StorageDeclaration::new("vcenter")
                .column(ColumnDeclaration::id("id"))
                .column(ColumnDeclaration::new("hostname", ColumnType::Text).unique()),
        )
        .table(
            StorageDeclaration::new("host")
                .column(ColumnDeclaration::id("id"))
                .column(ColumnDeclaration::new("vcenter_id", ColumnType::Uuid).references("vcenter.id"))
                .column(ColumnDeclaration::new("name", ColumnType::Text)),
        )
        .route(
            RouteDefinition::get("/status", "status"),
            RouteResponse::ok(serde_json::json!({ "plugin": "vsphere", "ok": true })),
        )
        .route(
            RouteDefinition::get("/vcenters/{id}", "vcenter"),
            RouteResponse::ok(serde_json::json!({ "kind": "vcenter" })),
        )
}

/// Send a request through the router and decode the JSON body.
pub async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, json)
}

pub async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    send(app, Method::GET, uri, None).await
}

pub async fn post(app: &Router, uri: &str) -> (StatusCode, Value) {
    send(app, Method::POST, uri, None).await
}
