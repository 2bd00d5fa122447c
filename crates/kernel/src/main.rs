//! Vantage Kernel
//!
//! HTTP server, plugin runtime, and plugin lifecycle commands.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{HeaderValue, Method, StatusCode};
use clap::{Parser, Subcommand};
use tower_http::cors::{AllowHeaders, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use vantage_kernel::config::Config;
use vantage_kernel::plugin::{ArchiveInstaller, cli};
use vantage_kernel::routes;
use vantage_kernel::state::{AppState, StateParts};

/// Vantage monitoring and inventory backend.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default).
    Serve,

    /// Manage plugins.
    #[command(subcommand)]
    Plugin(PluginCommand),
}

#[derive(Subcommand, Debug)]
enum PluginCommand {
    /// List discovered and registered plugins.
    List,
    /// Register new plugins and refresh metadata from disk.
    Sync,
    /// Provision storage, migrate and enable a plugin.
    Activate { name: String },
    /// Disable a plugin, keeping its data.
    Deactivate { name: String },
    /// Remove a disabled plugin from the registry.
    Delete {
        name: String,
        /// Also drop the plugin's schema and migration history.
        #[arg(long)]
        drop_schema: bool,
    },
    /// Apply pending storage changes for an active plugin.
    Migrate { name: String },
    /// List installable catalog entries.
    Catalog,
    /// Download a catalog entry into the plugins directory.
    Install { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    let args = Args::parse();

    let config = Config::from_env().context("failed to load configuration")?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config).await,
        Command::Plugin(command) => run_plugin_command(&config, command).await,
    }
}

async fn serve(config: &Config) -> Result<()> {
    info!("Starting Vantage kernel");
    info!(port = config.port, plugins_dir = %config.plugins_dir.display(), "Configuration loaded");

    // Connects, migrates and loads enabled plugins
    let state = AppState::new(config)
        .await
        .context("failed to initialize application state")?;

    info!(
        plugins = state.loaded().len(),
        degraded = state.boot_status().is_degraded(),
        "Plugins loaded"
    );

    let cors = build_cors_layer(config);

    let app = routes::app(state)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(config.request_timeout_secs),
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind to address")?;

    info!(%addr, "Server listening");

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}

async fn run_plugin_command(config: &Config, command: PluginCommand) -> Result<()> {
    let parts = StateParts::postgres(config).await?;
    let lifecycle = parts.lifecycle();

    match command {
        PluginCommand::List => cli::cmd_plugin_list(&lifecycle).await,
        PluginCommand::Sync => cli::cmd_plugin_sync(&lifecycle).await,
        PluginCommand::Activate { name } => cli::cmd_plugin_activate(&lifecycle, &name).await,
        PluginCommand::Deactivate { name } => cli::cmd_plugin_deactivate(&lifecycle, &name).await,
        PluginCommand::Delete { name, drop_schema } => {
            cli::cmd_plugin_delete(&lifecycle, &name, drop_schema).await
        }
        PluginCommand::Migrate { name } => cli::cmd_plugin_migrate(&lifecycle, &name).await,
        PluginCommand::Catalog => cli::cmd_plugin_catalog(&parts.catalog).await,
        PluginCommand::Install { id } => {
            let installer = ArchiveInstaller::new(parts.http.clone(), Arc::clone(&lifecycle));
            cli::cmd_plugin_install(&parts.catalog, &installer, &id).await
        }
    }
}

fn build_cors_layer(config: &Config) -> CorsLayer {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::PATCH,
        Method::DELETE,
        Method::OPTIONS,
    ];

    if config.cors_allowed_origins.len() == 1 && config.cors_allowed_origins[0] == "*" {
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(methods)
            .allow_headers(tower_http::cors::Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_allowed_origins
            .iter()
            .filter_map(|o| match o.parse::<HeaderValue>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(origin = %o, "ignoring unparseable CORS origin");
                    None
                }
            })
            .collect();

        // Credentials cannot be combined with wildcard headers
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(AllowHeaders::mirror_request())
            .allow_credentials(true)
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
