//! # Voice Relay - Main Application Entry Point
//!
//! Sits between voice clients and an inference backend. Clients stream
//! fixed-size PCM frames over a WebSocket; the relay buffers them per
//! session, decides when a batch is worth sending, submits it as a job and
//! streams the job's stage events back in order.
//!
//! ## Application Architecture:
//! - **config**: configuration (TOML file + `APP__*` environment variables)
//! - **audio**: frame codec, per-session buffers and the session store
//! - **dispatch**: dispatch policy, job startup and the idle sweep
//! - **pipeline**: stage events, the in-process pipeline and synthesis collection
//! - **backend**: the bridge to remote or local inference
//! - **websocket**: the `/ws` connection actor
//! - **state / health / handlers / middleware**: shared state and the HTTP API
//! - **error**: relay and HTTP error types

mod audio;
mod backend;
mod config;
mod dispatch;
mod error;
mod handlers;
mod health;
mod middleware;
mod pipeline;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use backend::{local::LocalBackend, remote::RemoteBackend, BackendBridge};
use config::{AppConfig, BackendMode};
use dispatch::sweep::IdleSweeper;
use state::AppState;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        frame_bytes = config.protocol.frame_bytes(),
        mode = ?config.backend.mode,
        "Configuration loaded"
    );
    if !config.backend.is_configured() {
        warn!("Backend credentials are not configured; jobs will fail until they are set");
    }

    let http = reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .build()?;
    let shared_config = Arc::new(RwLock::new(config.clone()));
    let backend = build_backend(http, &shared_config, &config);

    let app_state = web::Data::new(AppState::with_shared_config(shared_config, backend));
    let sweeper = IdleSweeper::spawn(
        Arc::clone(&app_state.dispatcher),
        config.dispatch.sweep_interval(),
    );

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .route("/ws", web::get().to(websocket::relay_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::get().to(handlers::get_session)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

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

    sweeper.shutdown().await;
    info!("Server stopped gracefully");
    Ok(())
}

fn build_backend(
    http: reqwest::Client,
    shared: &Arc<RwLock<AppConfig>>,
    config: &AppConfig,
) -> Arc<dyn BackendBridge> {
    match config.backend.mode {
        BackendMode::Local => Arc::new(LocalBackend::from_config(http, Arc::clone(shared))),
        BackendMode::Blocking | BackendMode::Streaming => {
            Arc::new(RemoteBackend::from_config(http, &config.backend))
        }
    }
}

/// `RUST_LOG` overrides the default `voice_relay=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
