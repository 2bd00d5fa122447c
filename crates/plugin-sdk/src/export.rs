//! Guest-side glue for the kernel's export contract.
//!
//! The kernel calls every export with `(ptr, len)` pointing at a JSON input
//! and expects an `i64` back holding `ptr << 32 | len` of the JSON output.
//! Plugins normally use [`export_plugin!`](crate::export_plugin) instead of
//! calling these helpers directly.

use serde::Serialize;

use crate::types::{RouteRequest, RouteResponse};

/// Export returning the plugin's storage declarations.
pub const STORAGE_EXPORT: &str = "storage_declarations";

/// Export returning the plugin's route definitions.
pub const ROUTES_EXPORT: &str = "route_handlers";

/// Optional export the kernel uses to place input inside guest memory.
pub const ALLOC_EXPORT: &str = "alloc";

/// Allocate `len` bytes that live until the instance is dropped.
///
/// The kernel instantiates a fresh store per call, so leaking is the
/// intended lifetime.
pub fn alloc(len: i32) -> i32 {
    let size = usize::try_from(len).unwrap_or(0);
    let buf = vec![0u8; size].into_boxed_slice();
    Box::leak(buf).as_mut_ptr() as usize as i32
}

/// Encode a string as `ptr << 32 | len`.
pub fn encode_output(s: &str) -> i64 {
    let bytes = s.as_bytes().to_vec().into_boxed_slice();
    let len = bytes.len() as i64;
    let ptr = Box::leak(bytes).as_ptr() as usize as i64;
    (ptr << 32) | (len & 0xFFFF_FFFF)
}

/// Serialize a value and encode it for the kernel.
pub fn respond<T: Serialize>(value: &T) -> i64 {
    match serde_json::to_string(value) {
        Ok(json) => encode_output(&json),
        Err(e) => encode_output(&format!("{{\"error\": \"serialize: {e}\"}}")),
    }
}

/// Read the JSON input the kernel wrote for this call.
///
/// # Safety
/// `ptr` and `len` must describe initialized memory inside this instance,
/// which holds for the values the kernel passes to an export.
pub unsafe fn read_input<'a>(ptr: i32, len: i32) -> &'a str {
    if len <= 0 {
        return "";
    }
    // SAFETY: the caller guarantees the range is valid for reads.
    let slice = unsafe { core::slice::from_raw_parts(ptr as usize as *const u8, len as usize) };
    core::str::from_utf8(slice).unwrap_or("")
}

/// Run a route handler against the kernel's request JSON.
pub fn dispatch(ptr: i32, len: i32, handler: fn(RouteRequest) -> RouteResponse) -> i64 {
    // SAFETY: called only from generated exports with kernel-provided input.
    let input = unsafe { read_input(ptr, len) };
    let response = match serde_json::from_str::<RouteRequest>(input) {
        Ok(request) => handler(request),
        Err(e) => RouteResponse {
            status: 400,
            body: serde_json::json!({ "detail": format!("invalid request: {e}") }),
        },
    };
    respond(&response)
}

/// Generate the WASM exports the kernel expects.
///
/// ```ignore
/// vantage_sdk::export_plugin! {
///     storage: storage,
///     routes: routes,
///     handlers: [list_tables, status],
/// }
/// ```
///
/// `storage` and `routes` name functions returning
/// `Vec<StorageDeclaration>` and `Vec<RouteDefinition>`. Each handler names a
/// `fn(RouteRequest) -> RouteResponse` and is exported under the same name.
#[macro_export]
macro_rules! export_plugin {
    (
        storage: $storage:ident,
        routes: $routes:ident
        $(, handlers: [$($handler:ident),* $(,)?])?
        $(,)?
    ) => {
        #[doc(hidden)]
        pub mod __vantage_exports {
            #[unsafe(no_mangle)]
            pub extern "C" fn alloc(len: i32) -> i32 {
                $crate::export::alloc(len)
            }

            #[unsafe(no_mangle)]
            pub extern "C" fn storage_declarations(_ptr: i32, _len: i32) -> i64 {
                $crate::export::respond(&super::$storage())
            }

            #[unsafe(no_mangle)]
            pub extern "C" fn route_handlers(_ptr: i32, _len: i32) -> i64 {
                $crate::export::respond(&super::$routes())
            }

            $($(
                #[unsafe(no_mangle)]
                pub extern "C" fn $handler(ptr: i32, len: i32) -> i64 {
                    $crate::export::dispatch(ptr, len, super::$handler)
                }
            )*)?
        }
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn encoded_length_is_low_half() {
        let encoded = encode_output("[]");
        assert_eq!(encoded & 0xFFFF_FFFF, 2);
    }

    #[test]
    fn read_input_rejects_empty() {
        // SAFETY: a zero length never dereferences the pointer.
        let input = unsafe { read_input(0, 0) };
        assert_eq!(input, "");
    }
}
