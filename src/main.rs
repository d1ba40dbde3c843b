//! # Vet Consult Backend - Main Application Entry Point
//!
//! Serves the veterinary booking UI's voice intake assistant. Each browser
//! connection on `/ws/consultation` drives one live consultation against the
//! streaming speech/LLM endpoint, and the collected booking details are
//! handed back to the UI when the assistant completes the consultation.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **state**: shared state, session slots and metrics
//! - **health**: health and metrics endpoints
//! - **middleware**: per-endpoint request metrics
//! - **handlers**: config and tool listing endpoints
//! - **websocket**: the browser bridge for one consultation per connection
//! - **consultation**: the session controller and microphone seam
//! - **live**: wire protocol and transport for the streaming endpoint
//! - **audio**: framing, PCM codec and playback scheduling
//! - **tools**: the functions the assistant may call
//! - **records**: users, pets and doctors the tools read from
//! - **transcript**: assembly of streamed transcript fragments
//! - **error**: HTTP errors and the consultation failure taxonomy

mod audio;
mod config;
mod consultation;
mod error;
mod handlers;
mod health;
mod live;
mod middleware;
mod records;
mod state;
mod tools;
mod transcript;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::from_fn, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use live::GeminiLiveConnector;
use records::InMemoryRecords;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGTERM or SIGINT arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting vet-consult-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        model = %config.live.model,
        "Configuration loaded"
    );
    if config.live.api_key.is_empty() {
        warn!("No API key configured; set GEMINI_API_KEY or APP_LIVE__API_KEY");
    }
    if !live::VOICES.contains(&config.live.voice.as_str()) {
        warn!(voice = %config.live.voice, "Voice is not one of the known prebuilt voices");
    }

    let records = match &config.records.seed_file {
        Some(path) => InMemoryRecords::load(path)?,
        None => {
            warn!("No records.seed_file configured; record lookups will report the store as unavailable");
            InMemoryRecords::default()
        }
    };

    let connector = Arc::new(GeminiLiveConnector::new(
        config.live.endpoint.clone(),
        config.live.api_key.clone(),
    ));

    let app_state = AppState::new(config.clone(), records, connector);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(from_fn(middleware::record_metrics))
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/tools", web::get().to(handlers::list_tools)),
            )
            .route("/health", web::get().to(health::health_check))
            .route(
                "/ws/consultation",
                web::get().to(websocket::consultation_websocket),
            )
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

    info!("Server stopped gracefully");
    Ok(())
}

/// Log filter comes from `RUST_LOG`, defaulting to
/// `vet_consult_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vet_consult_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Raise `SHUTDOWN_SIGNAL` on SIGTERM or SIGINT. If the handlers cannot be
/// installed the server keeps running and can only be killed.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
