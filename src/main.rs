#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # modemwatch
//!
//! Modem health watchdog for Asterisk `chan_quectel` gateways.
//!
//! modemwatch polls every configured modem through the engine CLI, detects
//! problems (missing device, stuck initialization, lost signal or
//! registration, inactive VoLTE), and recovers with progressively more
//! disruptive actions, from diagnostic AT commands up to a host reboot.
//! A small authenticated JSON API exposes status and manual control.
//!
//! ## Usage
//!
//! - `modemwatch serve` (default) — run the watchdog and its HTTP API
//! - `modemwatch serve --config /etc/modemwatch.toml`

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use axum::{
    middleware,
    routing::{get, post, put},
    Extension, Router,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use modemwatch::actionlog::ActionLog;
use modemwatch::asterisk::AsteriskCli;
use modemwatch::clock::SystemClock;
use modemwatch::state::AppState;
use modemwatch::volte::VolteController;
use modemwatch::watchdog::HealthSupervisor;
use modemwatch::{routes, ApiKey, Config};

/// Modem health watchdog for Asterisk chan_quectel gateways.
#[derive(Parser)]
#[command(name = "modemwatch", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the watchdog and HTTP API (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    // Validate config before proceeding
    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            tracing::error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("modemwatch v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Supervising {} modem(s), engine CLI '{}'",
        config.modems.len(),
        config.asterisk.cli
    );

    if config.auth.api_key == "change-me" {
        warn!("Using default API key — set MODEMWATCH_API_KEY or update config");
    }
    if config.modems.is_empty() {
        warn!("No modems configured; the watchdog has nothing to supervise");
    }

    let config = Arc::new(config);
    let clock = Arc::new(SystemClock);
    let asterisk = Arc::new(AsteriskCli::new(&config.asterisk));
    let volte = Arc::new(VolteController::new(
        &config.modems,
        Arc::clone(&asterisk),
        Arc::clone(&clock),
    ));
    let action_log = Arc::new(ActionLog::new(
        Path::new(&config.server.data_dir).join("watchdog.log"),
        config.watchdog.log_max_size_bytes,
        config.watchdog.log_max_memory_entries,
    ));
    let watchdog = Arc::new(HealthSupervisor::new(
        &config,
        asterisk,
        volte,
        clock,
        action_log,
    ));

    if config.watchdog.enabled {
        watchdog.start().await;
    } else {
        info!("Watchdog disabled in config; start via POST /api/watchdog/start");
    }

    let state = AppState {
        config: Arc::clone(&config),
        start_time: Instant::now(),
        watchdog: Arc::clone(&watchdog),
    };

    // Build router
    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route("/api/watchdog/status", get(routes::watchdog::status))
        .route("/api/watchdog/start", post(routes::watchdog::start))
        .route("/api/watchdog/stop", post(routes::watchdog::stop))
        .route("/api/watchdog/history", get(routes::watchdog::history))
        .route("/api/watchdog/reset/{modem_id}", post(routes::watchdog::reset))
        .route(
            "/api/watchdog/force-action",
            post(routes::watchdog::force_action),
        )
        .route(
            "/api/watchdog/cleanup-smsdb",
            post(routes::watchdog::cleanup_smsdb),
        )
        .route(
            "/api/watchdog/logs",
            get(routes::watchdog::logs).delete(routes::watchdog::clear_logs),
        )
        .route("/api/watchdog/config", put(routes::watchdog::put_config))
        .layer(middleware::from_fn(modemwatch::auth::require_api_key));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([AUTHORIZATION, CONTENT_TYPE, ACCEPT]);

    let app = Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(Extension(ApiKey(config.auth.api_key.clone())))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready on {}", config.server.listen);

    // Graceful shutdown on SIGINT/SIGTERM
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    watchdog.stop().await;
    info!("Goodbye");
}
