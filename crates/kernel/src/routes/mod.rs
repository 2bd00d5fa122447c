//! HTTP route handlers.

pub mod health;
pub mod plugin_mount;
pub mod plugins;

use axum::Router;

use crate::state::AppState;

/// Core routes plus the routes of every plugin loaded at boot.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(plugins::router(state.api_prefix()))
        .merge(plugin_mount::router(&state))
        .with_state(state)
}
