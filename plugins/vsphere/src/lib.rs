//! vSphere inventory plugin for Vantage.
//!
//! Owns the `vsphere` schema with tables for vCenter servers, ESXi hosts and
//! virtual machines. Collection from vCenter runs elsewhere; the routes here
//! only describe the plugin and its storage.

use vantage_sdk::prelude::*;
use vantage_sdk::serde_json::json;

const TABLES: &[&str] = &["vcenter", "host", "virtual_machine"];

/// Tables in dependency order: referenced tables come first.
pub fn storage() -> Vec<StorageDeclaration> {
    vec![
        StorageDeclaration::new("vcenter")
            .column(ColumnDeclaration::id("id"))
            .column(ColumnDeclaration::new("hostname", ColumnType::Text).unique())
            .column(ColumnDeclaration::new("username", ColumnType::Text))
            .column(ColumnDeclaration::new("port", ColumnType::Integer))
            .column(ColumnDeclaration::new("verify_ssl", ColumnType::Boolean))
            .column(ColumnDeclaration::new("last_sync", ColumnType::Timestamp).nullable()),
        StorageDeclaration::new("host")
            .column(ColumnDeclaration::id("id"))
            .column(ColumnDeclaration::new("vcenter_id", ColumnType::Uuid).references("vcenter.id"))
            .column(ColumnDeclaration::new("moref", ColumnType::Text))
            .column(ColumnDeclaration::new("name", ColumnType::Text))
            .column(ColumnDeclaration::new("cpu_cores", ColumnType::Integer).nullable())
            .column(ColumnDeclaration::new("memory_bytes", ColumnType::BigInt).nullable())
            .column(ColumnDeclaration::new("attributes", ColumnType::Json).nullable()),
        StorageDeclaration::new("virtual_machine")
            .column(ColumnDeclaration::id("id"))
            .column(ColumnDeclaration::new("host_id", ColumnType::Uuid).references("host.id"))
            .column(ColumnDeclaration::new("moref", ColumnType::Text))
            .column(ColumnDeclaration::new("name", ColumnType::Text))
            .column(ColumnDeclaration::new("power_state", ColumnType::Text))
            .column(ColumnDeclaration::new("cpu_usage", ColumnType::Double).nullable())
            .column(ColumnDeclaration::new("attributes", ColumnType::Json).nullable()),
    ]
}

pub fn routes() -> Vec<RouteDefinition> {
    vec![
        RouteDefinition::get("/status", "status"),
        RouteDefinition::get("/tables", "tables"),
        RouteDefinition::get("/tables/{table}", "table_detail"),
    ]
}

pub fn status(_req: RouteRequest) -> RouteResponse {
    RouteResponse::ok(json!({
        "plugin": "vsphere",
        "version": env!("CARGO_PKG_VERSION"),
        "tables": TABLES,
    }))
}

pub fn tables(_req: RouteRequest) -> RouteResponse {
    let tables: Vec<_> = storage()
        .into_iter()
        .map(|t| json!({ "table": t.table, "columns": t.columns.len() }))
        .collect();
    RouteResponse::ok(json!(tables))
}

pub fn table_detail(req: RouteRequest) -> RouteResponse {
    let Some(name) = req.param("table") else {
        return RouteResponse::not_found("missing table parameter");
    };
    match storage().into_iter().find(|t| t.table == name) {
        Some(table) => RouteResponse::ok(json!(table)),
        None => RouteResponse::not_found(&format!("no table named '{name}'")),
    }
}

export_plugin! {
    storage: storage,
    routes: routes,
    handlers: [status, tables, table_detail],
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn references_point_at_earlier_tables() {
        let tables = storage();
        for (i, table) in tables.iter().enumerate() {
            for column in &table.columns {
                if let Some(target) = &column.references {
                    let (target_table, _) = target.split_once('.').unwrap();
                    assert!(tables[..i].iter().any(|t| t.table == target_table));
                }
            }
        }
    }

    #[test]
    fn table_detail_looks_up_declarations() {
        let mut params = BTreeMap::new();
        params.insert("table".to_string(), "host".to_string());
        let found = table_detail(RouteRequest {
            params,
            ..RouteRequest::default()
        });
        assert_eq!(found.status, 200);
        assert_eq!(found.body["table"], "host");

        let mut params = BTreeMap::new();
        params.insert("table".to_string(), "datastore".to_string());
        let missing = table_detail(RouteRequest {
            params,
            ..RouteRequest::default()
        });
        assert_eq!(missing.status, 404);
    }

    #[test]
    fn every_route_handler_is_exported() {
        let exported = ["status", "tables", "table_detail"];
        for route in routes() {
            assert!(exported.contains(&route.handler.as_str()));
        }
    }
}
