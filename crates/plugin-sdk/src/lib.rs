//! Vantage Plugin SDK
//!
//! Wire types shared by the kernel and WASM plugins, plus the guest-side
//! export helpers. Plugins depend on this crate, describe their storage and
//! routes with the builder APIs, and expose them with [`export_plugin!`].

pub mod export;
pub mod types;

// Re-export serde_json for use in plugin code
#[doc(hidden)]
pub use serde_json;

pub mod prelude {
    pub use crate::export_plugin;
    pub use crate::types::*;
}
