//! # Voice Gateway - Main Application Entry Point
//!
//! Network-facing gateway for voice-driven clients. It accepts streamed voice frames over
//! WebSocket, hands each frame to a downstream processing pipeline and relays the replies
//! back. It also offers a stateless ingest endpoint and session bookkeeping.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: Every connection and request is handled asynchronously
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Error handling using Rust's Result type
//! - **Arc**: The registry, sink and metrics are shared by reference, never as globals
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (defaults, TOML file, environment variables)
//! - **state**: The injected shared state and gateway metrics
//! - **session**: Session registry, id strategies and the idle/retention reaper
//! - **relay**: Transport-agnostic stream relay and the processing sink seam
//! - **websocket**: Adapts WebSocket connections to the relay
//! - **ingest**: Single-payload ingest with correlation tracking
//! - **handlers**: HTTP request handlers and the route table
//! - **health**: Health check and Prometheus metrics endpoints
//! - **middleware**: Request logging, per-route metrics, error envelope
//! - **error**: HTTP error taxonomy and the JSON error envelope

// Module declarations - These tell Rust about our other source files
mod config;      // Configuration management (config.rs)
mod error;       // Error handling types (error.rs)
mod state;       // Application state management (state.rs)
mod session;     // Session registry (session/ directory)
mod relay;       // Stream relay and processing sink (relay/ directory)
mod websocket;   // WebSocket relay endpoint (websocket.rs)
mod ingest;      // Voice ingest (ingest.rs)
mod health;      // Health check endpoints (health.rs)
mod middleware;  // Custom middleware (middleware/ directory)
mod handlers;    // HTTP request handlers (handlers/ directory)

use actix_cors::Cors;
use actix_web::{http::header, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Builds the shared state**: session registry, processing sink, metrics
/// 4. **Starts the session reaper** in the background
/// 5. **Configures the HTTP server** with middleware and routes
/// 6. **Handles graceful shutdown** when receiving system signals
#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let app_state = AppState::new(config.clone())?;
    info!(sink = app_state.sink.name(), "Processing sink ready");

    let reaper = session::reaper::spawn_reaper(
        app_state.registry.clone(),
        config.retention_policy(),
        Duration::from_secs(config.sessions.reap_interval_secs),
    );

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", bind_addr);

    let app_config = config.clone();
    let data = web::Data::new(app_state);
    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .app_data(web::PayloadConfig::new(app_config.server.max_payload_bytes))
            // Middleware executes in reverse order for responses
            .wrap(middleware::error_envelope())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .wrap(build_cors(&app_config))
            .wrap(TracingLogger::default())
            .configure(handlers::configure)
    })
    .bind(&bind_addr)?;
    if config.server.workers > 0 {
        server = server.workers(config.server.workers);
    }
    let server = server.run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Wait for either the server to finish OR a shutdown signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    reaper.abort();
    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "voice_gateway=trace")
/// - If not set, defaults to "voice_gateway=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_gateway=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// CORS policy from the configured allow-list; empty or `*` allows any origin.
fn build_cors(config: &AppConfig) -> Cors {
    let cors = Cors::default()
        .allowed_methods(vec!["GET", "POST", "DELETE"])
        .allowed_headers(vec![
            header::ORIGIN,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::AUTHORIZATION,
        ])
        .max_age(3600);

    if config.allows_any_origin() {
        return cors.allow_any_origin();
    }
    config
        .server
        .cors_origins
        .iter()
        .fold(cors, |cors, origin| cors.allowed_origin(origin))
}

/// Resolve once SIGINT (Ctrl+C) or SIGTERM arrives.
///
/// If a signal handler cannot be installed the gateway keeps running and only the
/// remaining signal can stop it.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => {}
    }
}
