//! Plugin export contract.
//!
//! An entry point must export linear memory plus two capabilities,
//! `storage_declarations` and `route_handlers`. Each takes `(ptr, len)` and
//! returns `ptr << 32 | len` of a JSON array. Every route names a handler
//! export with the same signature.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use vantage_sdk::export::{ROUTES_EXPORT, STORAGE_EXPORT};
use vantage_sdk::types::{RouteDefinition, StorageDeclaration};
use wasmtime::{ExternType, FuncType, Module, ValType};

use super::error::PluginError;
use super::runtime::PluginRuntime;

/// Single-segment route paths that would shadow lifecycle endpoints.
const RESERVED_SEGMENTS: &[&str] = &["enable", "disable", "activate", "deactivate"];

static IDENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").expect("identifier regex is valid")
});

static SEGMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("segment regex is valid")
});

static PARAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^\{([A-Za-z_][A-Za-z0-9_]*)\}$").expect("param regex is valid")
});

/// What a plugin exposes once its contract has been verified.
#[derive(Debug, Clone, Default)]
pub struct PluginExports {
    pub storage: Vec<StorageDeclaration>,
    pub routes: Vec<RouteDefinition>,
}

fn is_capability(ty: &FuncType) -> bool {
    let params: Vec<ValType> = ty.params().collect();
    let results: Vec<ValType> = ty.results().collect();
    matches!(params.as_slice(), [ValType::I32, ValType::I32])
        && matches!(results.as_slice(), [ValType::I64])
}

/// Check that `name` is exported as a capability-shaped function.
fn require_function(plugin: &str, module: &Module, name: &str) -> Result<(), PluginError> {
    match module.get_export(name) {
        Some(ExternType::Func(ty)) if is_capability(&ty) => Ok(()),
        Some(ExternType::Func(_)) => Err(PluginError::contract(
            plugin,
            format!("export '{name}' must have signature (i32, i32) -> i64"),
        )),
        Some(_) => Err(PluginError::contract(
            plugin,
            format!("export '{name}' must be a function"),
        )),
        None => Err(PluginError::contract(
            plugin,
            format!("missing required export '{name}'"),
        )),
    }
}

/// Verify the static shape of the module's exports.
pub fn check_exports(plugin: &str, module: &Module) -> Result<(), PluginError> {
    if !matches!(module.get_export("memory"), Some(ExternType::Memory(_))) {
        return Err(PluginError::contract(
            plugin,
            "missing required export 'memory'",
        ));
    }
    require_function(plugin, module, STORAGE_EXPORT)?;
    require_function(plugin, module, ROUTES_EXPORT)?;
    Ok(())
}

/// Instantiate the module, call both capabilities and validate what they
/// return.
pub async fn inspect(
    runtime: &PluginRuntime,
    plugin: &str,
    module: &Module,
) -> Result<PluginExports, PluginError> {
    let (mut store, instance) = runtime.instantiate(plugin, module).await?;
    check_exports(plugin, module)?;

    let storage_json = runtime
        .call_export(&mut store, &instance, STORAGE_EXPORT, "")
        .await
        .map_err(|e| PluginError::contract(plugin, format!("{STORAGE_EXPORT}: {e:#}")))?;
    let storage: Vec<StorageDeclaration> = serde_json::from_str(&storage_json).map_err(|e| {
        PluginError::contract(
            plugin,
            format!("{STORAGE_EXPORT} must return a JSON array of table declarations: {e}"),
        )
    })?;

    let routes_json = runtime
        .call_export(&mut store, &instance, ROUTES_EXPORT, "")
        .await
        .map_err(|e| PluginError::contract(plugin, format!("{ROUTES_EXPORT}: {e:#}")))?;
    let routes: Vec<RouteDefinition> = serde_json::from_str(&routes_json).map_err(|e| {
        PluginError::contract(
            plugin,
            format!("{ROUTES_EXPORT} must return a JSON array of route definitions: {e}"),
        )
    })?;

    validate_storage(plugin, &storage)?;
    validate_routes(plugin, module, &routes)?;

    Ok(PluginExports { storage, routes })
}

/// Table and column names must be plain identifiers, unique, and foreign
/// keys must point at a column of a table declared earlier.
pub fn validate_storage(plugin: &str, storage: &[StorageDeclaration]) -> Result<(), PluginError> {
    let mut seen: BTreeMap<&str, &StorageDeclaration> = BTreeMap::new();

    for table in storage {
        if !IDENT_RE.is_match(&table.table) {
            return Err(PluginError::contract(
                plugin,
                format!("invalid table name '{}'", table.table),
            ));
        }
        if seen.contains_key(table.table.as_str()) {
            return Err(PluginError::contract(
                plugin,
                format!("table '{}' declared twice", table.table),
            ));
        }
        if table.columns.is_empty() {
            return Err(PluginError::contract(
                plugin,
                format!("table '{}' declares no columns", table.table),
            ));
        }

        let mut columns = BTreeSet::new();
        for column in &table.columns {
            if !IDENT_RE.is_match(&column.name) {
                return Err(PluginError::contract(
                    plugin,
                    format!("invalid column name '{}.{}'", table.table, column.name),
                ));
            }
            if !columns.insert(column.name.as_str()) {
                return Err(PluginError::contract(
                    plugin,
                    format!("column '{}.{}' declared twice", table.table, column.name),
                ));
            }
            if column.primary_key && column.nullable {
                return Err(PluginError::contract(
                    plugin,
                    format!("primary key '{}.{}' cannot be nullable", table.table, column.name),
                ));
            }

            if let Some(target) = &column.references {
                let resolved = target.split_once('.').and_then(|(t, c)| {
                    if t == table.table {
                        table.get_column(c)
                    } else {
                        seen.get(t).and_then(|decl| decl.get_column(c))
                    }
                });
                if resolved.is_none() {
                    return Err(PluginError::contract(
                        plugin,
                        format!(
                            "'{}.{}' references '{target}', which is not a column of a table declared before it",
                            table.table, column.name
                        ),
                    ));
                }
            }
        }

        seen.insert(&table.table, table);
    }

    Ok(())
}

/// Route paths are `/`-separated static segments or `{param}` captures.
/// Returns the path shape with captures blanked out.
fn route_shape(path: &str) -> Result<String, String> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(format!("route path '{path}' must start with '/'"));
    };
    if rest.is_empty() {
        return Err("route path '/' would shadow the plugin's registry endpoint".to_string());
    }

    let mut params = BTreeSet::new();
    let mut shape = String::new();
    let segments: Vec<&str> = rest.split('/').collect();

    for segment in &segments {
        shape.push('/');
        if let Some(caps) = PARAM_RE.captures(segment) {
            if !params.insert(caps[1].to_string()) {
                return Err(format!("route path '{path}' repeats parameter '{}'", &caps[1]));
            }
            shape.push_str("{}");
        } else if SEGMENT_RE.is_match(segment) {
            shape.push_str(segment);
        } else {
            return Err(format!("route path '{path}' has invalid segment '{segment}'"));
        }
    }

    if let [only] = segments.as_slice() {
        if PARAM_RE.is_match(only) || RESERVED_SEGMENTS.contains(only) {
            return Err(format!(
                "route path '{path}' would shadow a lifecycle endpoint"
            ));
        }
    }

    Ok(shape)
}

fn check_param_names(
    plugin: &str,
    path: &str,
    names: &mut BTreeMap<String, String>,
) -> Result<(), PluginError> {
    let mut prefix = String::new();
    for segment in path.trim_start_matches('/').split('/') {
        match PARAM_RE.captures(segment) {
            Some(caps) => {
                let name = &caps[1];
                match names.get(&prefix) {
                    Some(existing) if existing != name => {
                        return Err(PluginError::contract(
                            plugin,
                            format!(
                                "route path '{path}' names parameter '{name}' where another route uses '{existing}'"
                            ),
                        ));
                    }
                    Some(_) => {}
                    None => {
                        names.insert(prefix.clone(), name.to_string());
                    }
                }
                prefix.push_str("/{}");
            }
            None => {
                prefix.push('/');
                prefix.push_str(segment);
            }
        }
    }
    Ok(())
}

/// Validate paths and handler exports of a plugin's routes.
pub fn validate_routes(
    plugin: &str,
    module: &Module,
    routes: &[RouteDefinition],
) -> Result<(), PluginError> {
    let mut seen = BTreeSet::new();
    // Paths differing only in parameter names cannot be mounted together
    let mut shapes: BTreeMap<String, &str> = BTreeMap::new();
    // The router needs one parameter name per position of a path prefix
    let mut param_names: BTreeMap<String, String> = BTreeMap::new();

    for route in routes {
        let shape = route_shape(&route.path).map_err(|e| PluginError::contract(plugin, e))?;

        match shapes.insert(shape, route.path.as_str()) {
            Some(existing) if existing != route.path => {
                return Err(PluginError::contract(
                    plugin,
                    format!("route paths '{existing}' and '{}' overlap", route.path),
                ));
            }
            _ => {}
        }

        check_param_names(plugin, &route.path, &mut param_names)?;

        if !seen.insert((route.method, route.path.as_str())) {
            return Err(PluginError::contract(
                plugin,
                format!("duplicate route {} {}", route.method.as_str(), route.path),
            ));
        }

        if route.handler == STORAGE_EXPORT || route.handler == ROUTES_EXPORT {
            return Err(PluginError::contract(
                plugin,
                format!("route {} uses capability '{}' as a handler", route.path, route.handler),
            ));
        }
        require_function(plugin, module, &route.handler)?;
    }

    Ok(())
}
