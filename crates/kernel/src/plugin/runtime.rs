//! WASM plugin runtime.
//!
//! Owns the Wasmtime engine and linker. Modules are compiled once at load
//! time and instantiated in a fresh store for every call, so no guest state
//! survives between requests. The pooling allocator keeps per-call
//! instantiation cheap.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;
use vantage_sdk::export::ALLOC_EXPORT;
use wasmtime::{
    Config, Engine, InstanceAllocationStrategy, Instance, Linker, Module,
    PoolingAllocationConfig, Store, TypedFunc,
};

use super::error::PluginError;

/// Data attached to every store.
#[derive(Debug)]
pub struct PluginState {
    /// Plugin the store was created for.
    pub plugin: String,
}

impl PluginState {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
        }
    }
}

/// Configuration for the plugin runtime.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// Maximum number of concurrent plugin instances (for pooling allocator).
    pub max_instances: u32,
    /// Maximum memory pages per instance (64KB per page).
    pub max_memory_pages: u64,
    /// Run guest code on the async executor.
    pub async_support: bool,
    /// Use the pooling allocator. Disabled in tests to avoid large
    /// virtual memory reservations.
    pub pooling: bool,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            max_instances: 1000,
            max_memory_pages: 1024, // 64MB max per instance
            async_support: true,
            pooling: true,
        }
    }
}

/// Wasmtime engine and linker shared by every loaded plugin.
pub struct PluginRuntime {
    engine: Engine,
    linker: Linker<PluginState>,
    async_support: bool,
}

impl PluginRuntime {
    pub fn new(config: &PluginConfig) -> Result<Self> {
        let engine = create_engine(config)?;
        let linker = create_linker(&engine)?;

        Ok(Self {
            engine,
            linker,
            async_support: config.async_support,
        })
    }

    /// Read and compile an entry point. Compilation validates the module
    /// without running any of it.
    pub fn compile(&self, plugin: &str, path: &Path) -> Result<Module, PluginError> {
        if !path.is_file() {
            return Err(PluginError::EntryPointMissing {
                plugin: plugin.to_string(),
                path: path.display().to_string(),
            });
        }

        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read entry point {}", path.display()))?;

        let module =
            Module::new(&self.engine, &bytes).map_err(|e| PluginError::PluginSyntaxError {
                plugin: plugin.to_string(),
                details: format!("{e:#}"),
            })?;

        debug!(plugin, path = %path.display(), "compiled plugin");
        Ok(module)
    }

    /// Instantiate a module in a new store. Unresolved imports and traps in
    /// a start function surface here.
    pub async fn instantiate(
        &self,
        plugin: &str,
        module: &Module,
    ) -> Result<(Store<PluginState>, Instance), PluginError> {
        let mut store = Store::new(&self.engine, PluginState::new(plugin));

        let instance = if self.async_support {
            self.linker.instantiate_async(&mut store, module).await
        } else {
            self.linker.instantiate(&mut store, module)
        }
        .map_err(|e| PluginError::PluginImportError {
            plugin: plugin.to_string(),
            details: format!("{e:#}"),
        })?;

        Ok((store, instance))
    }

    /// Call a `(ptr, len) -> ptr << 32 | len` export with a string input and
    /// return its string output.
    ///
    /// Input goes into memory returned by the guest's `alloc` export when it
    /// has one, otherwise at offset 0.
    pub async fn call_export(
        &self,
        store: &mut Store<PluginState>,
        instance: &Instance,
        export: &str,
        input: &str,
    ) -> Result<String> {
        let func = instance
            .get_typed_func::<(i32, i32), i64>(&mut *store, export)
            .map_err(anyhow::Error::from)
            .with_context(|| format!("export '{export}' not found or has the wrong signature"))?;

        let memory = instance
            .get_memory(&mut *store, "memory")
            .context("plugin missing memory export")?;

        let input_bytes = input.as_bytes();
        let input_len = i32::try_from(input_bytes.len()).context("input too large")?;

        let input_offset = match instance.get_typed_func::<i32, i32>(&mut *store, ALLOC_EXPORT) {
            Ok(alloc) if input_len > 0 => self.call(store, alloc, input_len).await?,
            _ => 0,
        };

        memory
            .write(
                &mut *store,
                usize::try_from(input_offset).context("alloc returned a negative pointer")?,
                input_bytes,
            )
            .with_context(|| format!("input of {input_len} bytes does not fit in plugin memory"))?;

        let result = self
            .call(store, func, (input_offset, input_len))
            .await
            .with_context(|| format!("call to '{export}' failed"))?;

        // Decode result: high 32 bits = ptr, low 32 bits = len
        let output_ptr = (result >> 32) as u32 as usize;
        let output_len = (result & 0xFFFF_FFFF) as i32;

        if output_len < 0 {
            anyhow::bail!("'{export}' returned error code: {output_len}");
        }

        let data = memory.data(&*store);
        let end = output_ptr + output_len as usize;
        let Some(bytes) = data.get(output_ptr..end) else {
            anyhow::bail!("output out of bounds: {output_ptr}..{end}");
        };

        String::from_utf8(bytes.to_vec()).context("invalid UTF-8 in plugin output")
    }

    /// Instantiate a fresh copy of `module` and call one export.
    pub async fn invoke(
        &self,
        plugin: &str,
        module: &Module,
        export: &str,
        input: &str,
    ) -> Result<String> {
        let (mut store, instance) = self.instantiate(plugin, module).await?;
        self.call_export(&mut store, &instance, export, input).await
    }

    async fn call<P, R>(
        &self,
        store: &mut Store<PluginState>,
        func: TypedFunc<P, R>,
        params: P,
    ) -> Result<R>
    where
        P: wasmtime::WasmParams + Send + Sync,
        R: wasmtime::WasmResults + Send + Sync,
    {
        if self.async_support {
            func.call_async(&mut *store, params).await.map_err(anyhow::Error::from)
        } else {
            func.call(&mut *store, params).map_err(anyhow::Error::from)
        }
    }
}

/// Creates a Wasmtime engine, with the pooling allocator when enabled.
fn create_engine(config: &PluginConfig) -> Result<Engine> {
    let mut wasmtime_config = Config::new();

    wasmtime_config.async_support(config.async_support);

    if config.pooling {
        let mut pooling_config = PoolingAllocationConfig::default();
        pooling_config.total_core_instances(config.max_instances);
        pooling_config.total_memories(config.max_instances);
        pooling_config.total_tables(config.max_instances);
        pooling_config.max_memory_size(config.max_memory_pages as usize * 65536);

        wasmtime_config.allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));
    }

    // Optimize for speed
    wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

    Engine::new(&wasmtime_config)
        .map_err(anyhow::Error::from)
        .context("failed to create wasmtime engine")
}

/// Creates a Linker with host function bindings and WASI stubs.
fn create_linker(engine: &Engine) -> Result<Linker<PluginState>> {
    let mut linker = Linker::new(engine);

    add_wasi_stubs(&mut linker)?;
    crate::host::register_all(&mut linker)?;

    Ok(linker)
}

/// Minimal `wasi_snapshot_preview1` imports so plugins built for
/// `wasm32-wasip1` link. Plugins get no files, clock or environment.
fn add_wasi_stubs(linker: &mut Linker<PluginState>) -> Result<()> {
    const WASI: &str = "wasi_snapshot_preview1";
    const ENOSYS: i32 = 52;

    linker.func_wrap(
        WASI,
        "fd_write",
        |_fd: i32, _iovs: i32, _iovs_len: i32, _nwritten: i32| -> i32 { ENOSYS },
    )?;

    linker.func_wrap(
        WASI,
        "random_get",
        |mut caller: wasmtime::Caller<'_, PluginState>, buf: i32, buf_len: i32| -> i32 {
            let Some(wasmtime::Extern::Memory(memory)) = caller.get_export("memory") else {
                return 8; // EBADF
            };
            let data = memory.data_mut(&mut caller);
            let (start, len) = (buf as u32 as usize, buf_len as u32 as usize);
            let Some(target) = data.get_mut(start..start.saturating_add(len)) else {
                return 21; // EFAULT
            };
            for (i, byte) in target.iter_mut().enumerate() {
                *byte = ((start + i) as u8).wrapping_mul(31);
            }
            0
        },
    )?;

    linker.func_wrap(WASI, "environ_get", |_environ: i32, _environ_buf: i32| -> i32 {
        0
    })?;

    linker.func_wrap(
        WASI,
        "environ_sizes_get",
        |mut caller: wasmtime::Caller<'_, PluginState>, count_ptr: i32, size_ptr: i32| -> i32 {
            let Some(wasmtime::Extern::Memory(memory)) = caller.get_export("memory") else {
                return 8; // EBADF
            };
            let zero = 0u32.to_le_bytes();
            for ptr in [count_ptr, size_ptr] {
                if memory
                    .write(&mut caller, ptr as u32 as usize, &zero)
                    .is_err()
                {
                    return 21; // EFAULT
                }
            }
            0
        },
    )?;

    linker.func_wrap(WASI, "proc_exit", |_code: i32| {})?;

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn test_config() -> PluginConfig {
        PluginConfig {
            pooling: false,
            ..PluginConfig::default()
        }
    }

    const ECHO: &str = r#"(module
        (memory (export "memory") 1)
        (func (export "echo") (param i32 i32) (result i64)
            (i64.or
                (i64.shl (i64.extend_i32_u (local.get 0)) (i64.const 32))
                (i64.extend_i32_u (local.get 1)))))"#;

    #[test]
    fn create_runtime_with_custom_config() {
        let config = PluginConfig {
            max_instances: 16,
            max_memory_pages: 512,
            async_support: false,
            pooling: false,
        };
        assert!(PluginRuntime::new(&config).is_ok());
    }

    #[tokio::test]
    async fn echo_round_trips_through_guest_memory() {
        let runtime = PluginRuntime::new(&test_config()).unwrap();
        let module = Module::new(&runtime.engine, ECHO).unwrap();

        let output = runtime
            .invoke("echo", &module, "echo", r#"{"hello":"world"}"#)
            .await
            .unwrap();
        assert_eq!(output, r#"{"hello":"world"}"#);
    }

    #[tokio::test]
    async fn missing_export_is_an_error() {
        let runtime = PluginRuntime::new(&test_config()).unwrap();
        let module = Module::new(&runtime.engine, ECHO).unwrap();

        let err = runtime
            .invoke("echo", &module, "nope", "")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn compile_reports_missing_and_broken_files() {
        let runtime = PluginRuntime::new(&test_config()).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let missing = runtime.compile("ghost", &dir.path().join("ghost.wasm"));
        assert!(matches!(missing, Err(PluginError::EntryPointMissing { .. })));

        let broken = dir.path().join("broken.wasm");
        std::fs::write(&broken, "(module (func").unwrap();
        let err = runtime.compile("broken", &broken).unwrap_err();
        assert!(matches!(err, PluginError::PluginSyntaxError { .. }));
    }

    #[tokio::test]
    async fn unresolved_import_fails_instantiation() {
        let runtime = PluginRuntime::new(&test_config()).unwrap();
        let module = Module::new(
            &runtime.engine,
            r#"(module (import "env" "missing" (func)))"#,
        )
        .unwrap();

        let err = runtime.instantiate("needy", &module).await.unwrap_err();
        assert!(matches!(err, PluginError::PluginImportError { .. }));
    }
}
