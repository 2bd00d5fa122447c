//! Core types shared between plugins and the kernel.
//!
//! Every value crossing the WASM boundary is JSON. The kernel deserializes
//! these types from plugin exports and rejects anything that does not fit.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A table the plugin expects to exist in its storage namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDeclaration {
    /// Table name, unqualified. The kernel places it in the plugin's schema.
    pub table: String,

    /// Columns in declaration order.
    pub columns: Vec<ColumnDeclaration>,
}

impl StorageDeclaration {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
        }
    }

    /// Append a column.
    pub fn column(mut self, column: ColumnDeclaration) -> Self {
        self.columns.push(column);
        self
    }

    /// Look up a column by name.
    pub fn get_column(&self, name: &str) -> Option<&ColumnDeclaration> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// A single column of a declared table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDeclaration {
    pub name: String,

    pub data_type: ColumnType,

    #[serde(default)]
    pub nullable: bool,

    #[serde(default)]
    pub primary_key: bool,

    #[serde(default)]
    pub unique: bool,

    /// Foreign key target as `table.column` within the same namespace.
    /// Rows are deleted with their parent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<String>,
}

impl ColumnDeclaration {
    /// A NOT NULL column of the given type.
    pub fn new(name: impl Into<String>, data_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: false,
            primary_key: false,
            unique: false,
            references: None,
        }
    }

    /// A UUID primary key column.
    pub fn id(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Uuid).primary_key()
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Reference `table.column` in the same namespace.
    pub fn references(mut self, target: impl Into<String>) -> Self {
        self.references = Some(target.into());
        self
    }
}

/// Storage types a plugin may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Uuid,
    Text,
    Integer,
    #[serde(rename = "bigint")]
    BigInt,
    Boolean,
    Double,
    Timestamp,
    Json,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uuid => "uuid",
            Self::Text => "text",
            Self::Integer => "integer",
            Self::BigInt => "bigint",
            Self::Boolean => "boolean",
            Self::Double => "double",
            Self::Timestamp => "timestamp",
            Self::Json => "json",
        };
        f.write_str(s)
    }
}

/// HTTP methods a plugin route may answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

/// A route the plugin wants mounted under its namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub method: HttpMethod,

    /// Path relative to the plugin prefix, starting with `/`.
    /// Segments written as `{name}` capture path parameters.
    pub path: String,

    /// Name of the exported function that handles the route.
    pub handler: String,
}

impl RouteDefinition {
    pub fn new(method: HttpMethod, path: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            handler: handler.into(),
        }
    }

    pub fn get(path: impl Into<String>, handler: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path, handler)
    }

    pub fn post(path: impl Into<String>, handler: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, path, handler)
    }
}

/// Request passed to a route handler export.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteRequest {
    pub method: String,

    /// Path relative to the plugin prefix.
    pub path: String,

    #[serde(default)]
    pub params: BTreeMap<String, String>,

    #[serde(default)]
    pub query: BTreeMap<String, String>,

    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

impl RouteRequest {
    /// Get a captured path parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// Response returned from a route handler export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteResponse {
    pub status: u16,

    #[serde(default)]
    pub body: serde_json::Value,
}

impl RouteResponse {
    pub fn ok(body: serde_json::Value) -> Self {
        Self { status: 200, body }
    }

    pub fn not_found(message: &str) -> Self {
        Self {
            status: 404,
            body: serde_json::json!({ "detail": message }),
        }
    }
}
