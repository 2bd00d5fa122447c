//! Health check endpoint.
//!
//! Returns 200 OK when PostgreSQL is reachable, 503 Service Unavailable
//! otherwise. A degraded plugin boot is reported but does not make the
//! host unhealthy.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::plugin::LoadedSummary;
use crate::state::{AppState, BootStatus};

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    postgres: bool,
    plugins: BootStatus,
    loaded: Vec<LoadedSummary>,
}

/// Health check handler.
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let postgres = state.postgres_healthy().await;
    let boot = state.boot_status().clone();

    let (status_code, status) = match (postgres, boot.is_degraded()) {
        (false, _) => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
        (true, true) => (StatusCode::OK, "degraded"),
        (true, false) => (StatusCode::OK, "healthy"),
    };

    (
        status_code,
        Json(HealthResponse {
            status,
            postgres,
            plugins: boot,
            loaded: state.loaded().iter().map(|p| p.summary()).collect(),
        }),
    )
}

/// Create the health check router.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
