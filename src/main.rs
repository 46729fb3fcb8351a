//! # Voice Stream Gateway - Main Application Entry Point
//!
//! Real-time audio streaming server. Clients open a WebSocket, send binary
//! audio chunks, and get one acknowledgment per chunk.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML file + environment variables)
//! - **state**: Shared application state and metrics
//! - **audio**: Frame codec, sessions, registry, ingest loops, dispatcher
//! - **websocket**: Actix actor bridging a socket to a session connection
//! - **health**: Health, metrics and session listing endpoints
//! - **middleware**: Per-endpoint request metrics
//! - **handlers**: Home page, config view, stream upgrade endpoint
//! - **error**: HTTP error type and JSON error responses
//!
//! ## Shutdown:
//! SIGINT/SIGTERM → dispatcher drains every session (bounded by
//! `stream.shutdown_timeout_ms`) → HTTP server stops.

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use audio::dispatcher::Dispatcher;
use audio::processor::AcknowledgeOnly;
use config::AppConfig;
use state::{AppState, MetricsHandle};
use std::sync::Arc;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-stream-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{} (stream endpoint {})",
        config.server.host,
        config.server.port,
        config.stream_url()
    );

    let metrics = MetricsHandle::new();
    let dispatcher = Arc::new(Dispatcher::new(
        &config.stream,
        config.performance.max_concurrent_sessions,
        Arc::new(AcknowledgeOnly),
        metrics.clone(),
    ));
    let app_state = AppState::new(config.clone(), metrics, dispatcher.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let stream_path = config.stream.path.clone();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware runs in reverse order for responses
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .configure(|cfg| routes(cfg, &stream_path))
    })
    // Signals are ours: sessions must drain before the server stops
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
            }
        }
        signal = wait_for_shutdown_signal() => {
            if let Err(e) = signal {
                error!("Signal handler failed, shutting down: {}", e);
            }
            info!("Shutdown signal received, draining sessions...");
            let report = dispatcher.shutdown().await;
            info!(
                drained = report.drained,
                forced = report.forced,
                "Sessions drained"
            );
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Register every route. The stream endpoint lives at the configured path.
fn routes(cfg: &mut web::ServiceConfig, stream_path: &str) {
    cfg.route("/", web::get().to(handlers::home_page))
        .route(stream_path, web::get().to(handlers::stream_websocket))
        .service(
            web::scope("/api/v1")
                .route("/health", web::get().to(health::health_check))
                .route("/metrics", web::get().to(health::detailed_metrics))
                .route("/sessions", web::get().to(health::list_sessions))
                .route("/config", web::get().to(handlers::get_config)),
        )
        // Also provide health check at root level for convenience
        .route("/health", web::get().to(health::health_check));
}

/// Set up structured logging.
///
/// `RUST_LOG` controls what gets logged; defaults to
/// `voice_stream_gateway=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_stream_gateway=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok(())
}
