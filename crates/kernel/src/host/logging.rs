//! Logging host functions for WASM plugins.
//!
//! Forwards guest log lines into the kernel's tracing output, tagged with
//! the plugin the store belongs to.

use anyhow::Result;
use tracing::{debug, error, info, trace, warn};
use wasmtime::Linker;

use super::{LOGGING_MODULE, read_string_from_memory};
use crate::plugin::PluginState;

/// Register `log(level_ptr, level_len, msg_ptr, msg_len)`.
pub fn register_logging_functions(linker: &mut Linker<PluginState>) -> Result<()> {
    linker.func_wrap(
        LOGGING_MODULE,
        "log",
        |mut caller: wasmtime::Caller<'_, PluginState>,
         level_ptr: i32,
         level_len: i32,
         message_ptr: i32,
         message_len: i32| {
            let plugin = caller.data().plugin.clone();
            let Some(wasmtime::Extern::Memory(memory)) = caller.get_export("memory") else {
                error!(%plugin, "plugin missing memory export");
                return;
            };

            let level = read_string_from_memory(&memory, &caller, level_ptr, level_len)
                .unwrap_or_else(|_| "info".to_string());
            let message = read_string_from_memory(&memory, &caller, message_ptr, message_len)
                .unwrap_or_else(|_| "<invalid message>".to_string());

            match level.as_str() {
                "trace" => trace!(%plugin, "{}", message),
                "debug" => debug!(%plugin, "{}", message),
                "info" => info!(%plugin, "{}", message),
                "warn" => warn!(%plugin, "{}", message),
                "error" => error!(%plugin, "{}", message),
                _ => info!(%plugin, %level, "{}", message),
            }
        },
    )?;

    Ok(())
}
