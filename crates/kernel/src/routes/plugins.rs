//! Plugin registry and lifecycle API.
//!
//! Lifecycle changes are persisted immediately but only take effect in the
//! running process after a restart, so every mutating response carries
//! `restart_required: true`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::plugin::{CatalogEntry, PluginError, PluginRecord};
use crate::state::AppState;

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

// =============================================================================
// Request / response types
// =============================================================================

#[derive(Debug, Deserialize)]
struct Pagination {
    skip: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct DeleteParams {
    #[serde(default)]
    drop_schema: bool,
}

#[derive(Debug, Serialize)]
struct PluginList {
    data: Vec<PluginRecord>,
    count: i64,
}

#[derive(Debug, Serialize)]
struct DiscoveredRow {
    name: String,
    version: String,
    description: String,
    schema_name: String,
    path: String,
}

// =============================================================================
// Handlers
// =============================================================================

/// List plugins found on disk.
///
/// GET /plugins/discover
async fn discover(State(state): State<AppState>) -> AppResult<Json<Vec<DiscoveredRow>>> {
    let discovered = state.lifecycle().discover()?;
    let rows = discovered
        .into_values()
        .map(|found| DiscoveredRow {
            name: found.descriptor.name,
            version: found.descriptor.version,
            description: found.descriptor.description,
            schema_name: found.descriptor.schema_name,
            path: found.path.display().to_string(),
        })
        .collect();
    Ok(Json(rows))
}

/// Reconcile the registry with disk.
///
/// POST /plugins/sync
async fn sync(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let report = state.lifecycle().sync().await?;
    Ok(Json(json!({
        "count": report.changed,
        "status": "success",
        "inserted": report.inserted,
        "updated": report.updated,
        "stale": report.stale,
        "restart_required": true,
    })))
}

/// Paginated registry listing.
///
/// GET /plugins?skip=&limit=
async fn list(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
) -> AppResult<Json<PluginList>> {
    let skip = page.skip.unwrap_or(0);
    let limit = page.limit.unwrap_or(DEFAULT_LIMIT);
    if skip < 0 || !(1..=MAX_LIMIT).contains(&limit) {
        return Err(AppError::BadRequest(format!(
            "skip must be >= 0 and limit between 1 and {MAX_LIMIT}"
        )));
    }

    let (data, count) = state
        .registry()
        .page(skip, limit)
        .await
        .map_err(PluginError::from)?;
    Ok(Json(PluginList { data, count }))
}

/// GET /plugins/{id}
async fn get_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<PluginRecord>> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| AppError::BadRequest(format!("'{id}' is not a valid plugin id")))?;

    state
        .registry()
        .get(id)
        .await
        .map_err(PluginError::from)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("plugin {id} not found")))
}

/// GET /plugins/by-name/{name}
async fn get_by_name(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<PluginRecord>> {
    state
        .registry()
        .get_by_name(&name)
        .await
        .map_err(PluginError::from)?
        .map(Json)
        .ok_or_else(|| PluginError::NotRegistered { plugin: name }.into())
}

/// DELETE /plugins/{name}?drop_schema=
async fn delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<DeleteParams>,
) -> AppResult<Json<Value>> {
    let record = state
        .lifecycle()
        .delete(&name, params.drop_schema)
        .await?;
    Ok(Json(json!({
        "plugin": record,
        "schema_dropped": params.drop_schema,
        "restart_required": true,
    })))
}

/// POST /plugins/{name}/activate (and /enable)
async fn activate(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<Value>> {
    let report = state.lifecycle().activate(&name).await?;
    Ok(Json(json!({
        "plugin": report.plugin,
        "migrations": report.migrations,
        "restart_required": true,
    })))
}

/// POST /plugins/{name}/deactivate (and /disable)
async fn deactivate(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<Value>> {
    let record = state.lifecycle().deactivate(&name).await?;
    Ok(Json(json!({
        "plugin": record,
        "restart_required": true,
    })))
}

/// GET /plugins/catalog
async fn catalog(State(state): State<AppState>) -> AppResult<Json<Vec<CatalogEntry>>> {
    Ok(Json(state.catalog().entries().await?))
}

/// Start a background install. Callers poll the registry for the result.
///
/// POST /plugins/catalog/{id}/install
async fn install(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let entry = state.catalog().get(&id).await?;
    state.installer().spawn_install(entry)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "processing", "id": id })),
    ))
}

/// Create the plugin API router under `prefix`.
pub fn router(prefix: &str) -> Router<AppState> {
    let base = format!("{prefix}/plugins");

    Router::new()
        .route(&base, get(list))
        .route(&format!("{base}/discover"), get(discover))
        .route(&format!("{base}/sync"), post(sync))
        .route(&format!("{base}/catalog"), get(catalog))
        .route(&format!("{base}/catalog/{{id}}/install"), post(install))
        .route(&format!("{base}/by-name/{{name}}"), get(get_by_name))
        .route(&format!("{base}/{{name}}"), get(get_by_id).delete(delete))
        .route(&format!("{base}/{{name}}/activate"), post(activate))
        .route(&format!("{base}/{{name}}/enable"), post(activate))
        .route(&format!("{base}/{{name}}/deactivate"), post(deactivate))
        .route(&format!("{base}/{{name}}/disable"), post(deactivate))
}
