//! # recognize-server - Main Application Entry Point
//!
//! Streaming speech recognition over websockets. Clients stream raw PCM audio to
//! `/recognize`, send `EOS`, and get a transcript back.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML file + environment variables)
//! - **state**: Shared application state and metrics
//! - **session**: Per-connection state machine and the engine gate
//! - **transcription**: Recognition engine contract and the Whisper engine
//! - **websocket**: The websocket actor that moves frames to and from sessions
//! - **health** / **handlers**: Health, metrics and configuration endpoints
//! - **error**: Error types and HTTP error responses
//!
//! ## Engine Lifetime:
//! The engine is loaded once, before the server binds, and handed to the engine gate.
//! If an engine failure poisons the gate, the server shuts down and the process exits
//! with an error.

mod audio;          // PCM decoding and mel filterbank
mod config;         // Configuration management (config.rs)
mod error;          // Error handling types (error.rs)
mod handlers;       // HTTP request handlers (handlers/ directory)
mod health;         // Health check endpoints (health.rs)
mod session;        // Sessions and the engine gate (session/ directory)
mod state;          // Application state management (state.rs)
mod transcription;  // Recognition engines (transcription/ directory)
mod websocket;      // WebSocket endpoint (websocket.rs)

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use session::EngineGate;
use state::AppState;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::WhisperEngine;

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Loads the recognition engine** and puts it behind the engine gate
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Waits** for a shutdown signal, a server failure or a poisoned engine
#[actix_web::main]
async fn main() -> Result<()> {
    // .ok() means "ignore errors" - it's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting recognize-server v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let engine = WhisperEngine::load(&config.engine).await?;
    let gate = EngineGate::new(Box::new(engine));

    let app_state = AppState::new(config.clone(), gate.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

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
            .wrap(TracingLogger::default())
            .route("/recognize", web::get().to(websocket::recognize))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Whichever finishes first wins; the other two are dropped.
    let outcome = tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!("Server error: {}", e);
                    Err(e.into())
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                    Err(e.into())
                }
            }
        }
        signal = wait_for_shutdown() => {
            signal?;
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
            Ok(())
        }
        reason = gate.poisoned() => {
            error!("Recognition engine failed ({}), stopping server...", reason);
            server_handle.stop(false).await;
            Err(anyhow::anyhow!("recognition engine failed: {}", reason))
        }
    };

    info!("Server stopped");
    outcome
}

/// Initialize the tracing (logging) system.
///
/// `RUST_LOG` controls what gets logged; without it the default is
/// "recognize_server=debug,actix_web=info".
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "recognize_server=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolves on SIGTERM or SIGINT (Ctrl+C).
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
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
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok(())
}
