//! Vantage test utilities.
//!
//! Builders that write plugin directories (manifest plus a WAT entry
//! point) for discovery, lifecycle and loader tests, archive builders for
//! installer tests, and helpers for optional PostgreSQL-backed tests.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;
use vantage_sdk::types::{RouteDefinition, RouteResponse, StorageDeclaration};

/// Guest data lives from the second page on, leaving page 0 for input.
const DATA_BASE: usize = 65536;
const PAGE: usize = 65536;

/// What to write as the plugin's entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    /// A module honouring the export contract.
    Valid,
    /// Text that does not parse as a module.
    BrokenSyntax,
    /// Valid module importing a function the host does not provide.
    MissingImport,
    /// Valid module without the `route_handlers` export.
    MissingRoutesExport,
    /// `storage_declarations` with the wrong signature.
    WrongSignature,
    /// `route_handlers` returns a JSON object instead of an array.
    NotAnArray,
    /// No entry point file at all.
    Absent,
}

/// Builder for an on-disk plugin directory.
#[derive(Debug, Clone)]
pub struct PluginFixture {
    name: String,
    version: String,
    description: String,
    schema: String,
    storage: Vec<StorageDeclaration>,
    routes: Vec<RouteDefinition>,
    responses: BTreeMap<String, RouteResponse>,
    entry_point: EntryPoint,
    log_on_request: bool,
}

impl PluginFixture {
    /// A valid plugin whose schema is its name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            description: format!("{name} test plugin"),
            schema: name.to_string(),
            storage: Vec::new(),
            routes: Vec::new(),
            responses: BTreeMap::new(),
            entry_point: EntryPoint::Valid,
            log_on_request: false,
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn schema(mut self, schema: &str) -> Self {
        self.schema = schema.to_string();
        self
    }

    pub fn table(mut self, table: StorageDeclaration) -> Self {
        self.storage.push(table);
        self
    }

    /// Add a route whose handler always answers `response`.
    pub fn route(mut self, route: RouteDefinition, response: RouteResponse) -> Self {
        self.responses
            .entry(route.handler.clone())
            .or_insert(response);
        self.routes.push(route);
        self
    }

    pub fn entry_point(mut self, entry_point: EntryPoint) -> Self {
        self.entry_point = entry_point;
        self
    }

    /// Make every handler call the host `log` function before answering.
    pub fn logging(mut self) -> Self {
        self.log_on_request = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `plugin.toml` contents.
    pub fn manifest(&self) -> String {
        format!(
            "name = {:?}\nversion = {:?}\ndescription = {:?}\nschema = {:?}\n",
            self.name, self.version, self.description, self.schema
        )
    }

    /// Write the plugin into `plugins_dir/<name>`.
    pub fn write(&self, plugins_dir: &Path) -> io::Result<PathBuf> {
        self.write_as(plugins_dir, &self.name)
    }

    /// Write the plugin into `plugins_dir/<dir_name>`.
    pub fn write_as(&self, plugins_dir: &Path, dir_name: &str) -> io::Result<PathBuf> {
        let dir = plugins_dir.join(dir_name);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("plugin.toml"), self.manifest())?;

        let wasm = dir.join(format!("{}.wasm", self.name));
        match self.entry_point {
            EntryPoint::Absent => {
                if wasm.exists() {
                    std::fs::remove_file(&wasm)?;
                }
            }
            EntryPoint::BrokenSyntax => std::fs::write(&wasm, "(module (func")?,
            _ => std::fs::write(&wasm, self.wat())?,
        }
        Ok(dir)
    }

    /// The plugin's files keyed by archive path, nested under `root` unless
    /// it is empty.
    pub fn archive_files(&self, root: &str) -> Vec<(String, Vec<u8>)> {
        let path = |file: &str| {
            if root.is_empty() {
                file.to_string()
            } else {
                format!("{root}/{file}")
            }
        };
        vec![
            (path("plugin.toml"), self.manifest().into_bytes()),
            (path(&format!("{}.wasm", self.name)), self.wat().into_bytes()),
        ]
    }

    /// The entry point in WebAssembly text format.
    pub fn wat(&self) -> String {
        let storage = serde_json::to_string(&self.storage).unwrap_or_else(|_| "[]".into());
        let routes = match self.entry_point {
            EntryPoint::NotAnArray => r#"{"routes":"none"}"#.to_string(),
            _ => serde_json::to_string(&self.routes).unwrap_or_else(|_| "[]".into()),
        };

        let mut segments = Segments::default();
        let storage_at = segments.push(storage.as_bytes());
        let routes_at = segments.push(routes.as_bytes());
        let level_at = segments.push(b"info");
        let message = format!("{} handled a request", self.name);
        let message_at = segments.push(message.as_bytes());

        let mut handlers = String::new();
        for (export, response) in &self.responses {
            let body = serde_json::to_string(response).unwrap_or_else(|_| "{}".into());
            let at = segments.push(body.as_bytes());
            let log_call = if self.log_on_request {
                format!(
                    "(call $log (i32.const {}) (i32.const {}) (i32.const {}) (i32.const {}))",
                    level_at.0, level_at.1, message_at.0, message_at.1
                )
            } else {
                String::new()
            };
            let _ = writeln!(
                handlers,
                "  (func (export {:?}) (param i32 i32) (result i64) {log_call} (i64.const {}))",
                export,
                packed(at)
            );
        }

        let mut wat = String::from("(module\n");
        if self.log_on_request {
            wat.push_str(
                "  (import \"vantage:host/logging\" \"log\" (func $log (param i32 i32 i32 i32)))\n",
            );
        }
        if self.entry_point == EntryPoint::MissingImport {
            wat.push_str("  (import \"env\" \"missing\" (func))\n");
        }

        let _ = writeln!(wat, "  (memory (export \"memory\") {})", segments.pages());
        wat.push_str(&segments.data);

        match self.entry_point {
            EntryPoint::WrongSignature => wat.push_str(
                "  (func (export \"storage_declarations\") (param i32) (result i32) (i32.const 0))\n",
            ),
            _ => {
                let _ = writeln!(
                    wat,
                    "  (func (export \"storage_declarations\") (param i32 i32) (result i64) (i64.const {}))",
                    packed(storage_at)
                );
            }
        }
        if self.entry_point != EntryPoint::MissingRoutesExport {
            let _ = writeln!(
                wat,
                "  (func (export \"route_handlers\") (param i32 i32) (result i64) (i64.const {}))",
                packed(routes_at)
            );
        }

        wat.push_str(&handlers);
        wat.push_str(")\n");
        wat
    }
}

/// Data segments laid out back to back from [`DATA_BASE`].
#[derive(Default)]
struct Segments {
    data: String,
    len: usize,
}

impl Segments {
    /// Append `bytes`, returning `(offset, len)`.
    fn push(&mut self, bytes: &[u8]) -> (usize, usize) {
        let offset = DATA_BASE + self.len;
        let _ = writeln!(self.data, "  (data (i32.const {offset}) \"{}\")", escape(bytes));
        self.len += bytes.len();
        (offset, bytes.len())
    }

    fn pages(&self) -> usize {
        (DATA_BASE + self.len).div_ceil(PAGE) + 1
    }
}

fn packed((offset, len): (usize, usize)) -> i64 {
    ((offset as i64) << 32) | len as i64
}

fn escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        if (b.is_ascii_graphic() && b != b'"' && b != b'\\') || b == b' ' {
            out.push(b as char);
        } else {
            let _ = write!(out, "\\{b:02x}");
        }
    }
    out
}

/// Gzip-compressed tarball holding `files`.
pub fn tar_gz<P: AsRef<str>, D: AsRef<[u8]>>(files: &[(P, D)]) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, data) in files {
        let data = data.as_ref();
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path.as_ref(), data)?;
    }
    builder.into_inner()?.finish()
}

/// Zip archive holding `files`, every entry stored uncompressed.
pub fn stored_zip<P: AsRef<str>, D: AsRef<[u8]>>(files: &[(P, D)]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut central = Vec::new();

    for (name, data) in files {
        let (name, data) = (name.as_ref().as_bytes(), data.as_ref());
        let mut crc = flate2::Crc::new();
        crc.update(data);
        let crc = crc.sum().to_le_bytes();
        let size = (data.len() as u32).to_le_bytes();
        let name_len = (name.len() as u16).to_le_bytes();
        let offset = (out.len() as u32).to_le_bytes();

        out.write_all(&0x0403_4b50u32.to_le_bytes())?;
        out.write_all(&20u16.to_le_bytes())?;
        out.write_all(&[0; 8])?; // flags, method, time, date
        out.write_all(&crc)?;
        out.write_all(&size)?;
        out.write_all(&size)?;
        out.write_all(&name_len)?;
        out.write_all(&0u16.to_le_bytes())?;
        out.write_all(name)?;
        out.write_all(data)?;

        central.write_all(&0x0201_4b50u32.to_le_bytes())?;
        central.write_all(&20u16.to_le_bytes())?;
        central.write_all(&20u16.to_le_bytes())?;
        central.write_all(&[0; 8])?;
        central.write_all(&crc)?;
        central.write_all(&size)?;
        central.write_all(&size)?;
        central.write_all(&name_len)?;
        central.write_all(&[0; 12])?; // extra, comment, disk, attrs
        central.write_all(&offset)?;
        central.write_all(name)?;
    }

    let central_offset = (out.len() as u32).to_le_bytes();
    let count = (files.len() as u16).to_le_bytes();
    out.write_all(&0x0605_4b50u32.to_le_bytes())?;
    out.write_all(&[0; 4])?;
    out.write_all(&count)?;
    out.write_all(&count)?;
    out.write_all(&(central.len() as u32).to_le_bytes())?;
    out.write_all(&central_offset)?;
    out.write_all(&0u16.to_le_bytes())?;
    Ok(out)
}

/// A name unique to this test run, usable as plugin and schema name
/// (at most 20 characters).
pub fn unique_name(prefix: &str) -> String {
    let suffix = Uuid::now_v7().simple().to_string();
    let prefix: String = prefix.chars().take(7).collect();
    format!("{prefix}_{}", &suffix[suffix.len() - 12..])
}

/// Connect to `DATABASE_URL`, or `None` when it is unset so database tests
/// can skip themselves.
pub async fn database_from_env() -> Option<PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .ok()
}
