//! Vantage Kernel Library
//!
//! Plugin lifecycle, schema orchestration and the HTTP surface. The main
//! entry point for running the server is the `vantage` binary; the library
//! is exposed for integration testing.

pub mod config;
pub mod db;
pub mod error;
pub mod host;
pub mod plugin;
pub mod routes;
pub mod state;
