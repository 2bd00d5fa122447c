//! Routes contributed by loaded plugins.
//!
//! Each route is mounted at `{prefix}/plugins/{name}{path}` and served by
//! calling the plugin's handler export in a fresh instance.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodFilter, MethodRouter};
use serde_json::json;
use tracing::{debug, error};
use vantage_sdk::types::{HttpMethod, RouteRequest};

use crate::plugin::LoadedPlugin;
use crate::state::AppState;

fn method_filter(method: HttpMethod) -> MethodFilter {
    match method {
        HttpMethod::Get => MethodFilter::GET,
        HttpMethod::Post => MethodFilter::POST,
        HttpMethod::Put => MethodFilter::PUT,
        HttpMethod::Patch => MethodFilter::PATCH,
        HttpMethod::Delete => MethodFilter::DELETE,
    }
}

/// Full mount path of a plugin route.
pub fn mount_path(prefix: &str, plugin: &str, path: &str) -> String {
    format!("{prefix}/plugins/{plugin}{path}")
}

/// Values of the `{param}` segments of `template` in `path`.
fn path_params(template: &str, path: &str) -> BTreeMap<String, String> {
    template
        .split('/')
        .zip(path.split('/'))
        .filter_map(|(t, p)| {
            t.strip_prefix('{')
                .and_then(|t| t.strip_suffix('}'))
                .map(|name| (name.to_string(), p.to_string()))
        })
        .collect()
}

async fn dispatch(
    state: AppState,
    plugin: Arc<LoadedPlugin>,
    handler: String,
    template: String,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let body = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => Some(value),
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    axum::Json(json!({ "detail": format!("request body is not JSON: {e}") })),
                )
                    .into_response();
            }
        }
    };

    let base = mount_path(state.api_prefix(), &plugin.name, "");
    let request = RouteRequest {
        method: method.as_str().to_string(),
        path: uri.path().strip_prefix(&base).unwrap_or(uri.path()).to_string(),
        params: path_params(&template, uri.path()),
        query: url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
            .into_owned()
            .collect(),
        body,
    };

    debug!(plugin = %plugin.name, handler = %handler, path = %request.path, "dispatching plugin route");

    match state
        .lifecycle()
        .loader()
        .handle(&plugin, &handler, &request)
        .await
    {
        Ok(response) => {
            let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, axum::Json(response.body)).into_response()
        }
        Err(e) => {
            error!(
                plugin = %plugin.name,
                handler = %handler,
                error = %format!("{e:#}"),
                "plugin handler failed"
            );
            (
                StatusCode::BAD_GATEWAY,
                axum::Json(json!({ "detail": format!("plugin '{}' handler failed", plugin.name) })),
            )
                .into_response()
        }
    }
}

/// Router with every route of every loaded plugin.
pub fn router(state: &AppState) -> Router<AppState> {
    let mut paths: BTreeMap<String, MethodRouter<AppState>> = BTreeMap::new();

    for plugin in state.loaded().iter() {
        for route in &plugin.routes {
            let template = mount_path(state.api_prefix(), &plugin.name, &route.path);

            let plugin = Arc::clone(plugin);
            let handler = route.handler.clone();
            let route_template = template.clone();
            let endpoint = move |State(state): State<AppState>, method: Method, uri: Uri, body: Bytes| {
                dispatch(
                    state,
                    Arc::clone(&plugin),
                    handler.clone(),
                    route_template.clone(),
                    method,
                    uri,
                    body,
                )
            };

            let methods = paths.remove(&template).unwrap_or_else(MethodRouter::new);
            paths.insert(template, methods.on(method_filter(route.method), endpoint));
        }
    }

    paths
        .into_iter()
        .fold(Router::new(), |router, (path, methods)| {
            router.route(&path, methods)
        })
}
