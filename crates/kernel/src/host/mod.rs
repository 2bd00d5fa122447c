//! Host functions for WASM plugins.
//!
//! Functions plugins may import from the kernel. String parameters are
//! ptr+len pairs into the guest's linear memory.

mod logging;

use anyhow::Result;
use wasmtime::Linker;

use crate::plugin::PluginState;

pub use logging::register_logging_functions;

/// Import module name for logging.
pub const LOGGING_MODULE: &str = "vantage:host/logging";

/// Register all host functions with the linker.
pub fn register_all(linker: &mut Linker<PluginState>) -> Result<()> {
    register_logging_functions(linker)?;
    Ok(())
}

/// Read a UTF-8 string out of guest memory.
pub fn read_string_from_memory(
    memory: &wasmtime::Memory,
    store: &impl wasmtime::AsContext,
    ptr: i32,
    len: i32,
) -> Result<String> {
    let (Ok(ptr), Ok(len)) = (usize::try_from(ptr), usize::try_from(len)) else {
        anyhow::bail!("negative string bounds: ptr={ptr}, len={len}");
    };

    let data = memory.data(store);
    let Some(bytes) = ptr.checked_add(len).and_then(|end| data.get(ptr..end)) else {
        anyhow::bail!(
            "string read out of bounds: ptr={ptr}, len={len}, mem_size={}",
            data.len()
        );
    };

    String::from_utf8(bytes.to_vec())
        .map_err(|e| anyhow::anyhow!("invalid UTF-8 in WASM string: {e}"))
}
