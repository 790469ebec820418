//! # Call Bridge Backend - Main Application Entry Point
//!
//! This is the main entry point for the call-bridge-backend web server.
//! It bridges a telephony provider's call media streams to a realtime
//! conversational AI engine, one websocket pair per call.
//!
//! ## Application Architecture:
//! - **config**: Handles application configuration (TOML files + environment variables)
//! - **state**: Manages shared application state and metrics
//! - **calls**: Call records, storage, and the lifecycle service
//! - **telephony**: Provider frame codec, output queue, audio bridge, registry
//! - **engine**: Conversation engine traits and the realtime websocket client
//! - **websocket**: The provider-facing media stream socket actor
//! - **health**: System health monitoring endpoints
//! - **middleware**: Custom request processing logic (logging, metrics)
//! - **handlers**: HTTP request handlers for API endpoints
//! - **error**: Custom error types and HTTP error responses

// Module declarations - These tell Rust about our other source files
mod calls;       // Call domain (calls/ directory)
mod config;      // Configuration management (config.rs)
mod engine;      // Conversation engine client (engine/ directory)
mod error;       // Error handling types (error.rs)
mod handlers;    // HTTP request handlers (handlers/ directory)
mod health;      // Health check endpoints (health.rs)
mod middleware;  // Custom middleware (middleware/ directory)
mod state;       // Application state management (state.rs)
mod telephony;   // Provider media stream plumbing (telephony/ directory)
mod websocket;   // Media stream socket actor (websocket.rs)

// External crate imports - These are dependencies from Cargo.toml
use actix_cors::Cors;  // Cross-Origin Resource Sharing support
use actix_web::{web, App, HttpServer};  // Web framework
use anyhow::Result;    // Better error handling with context
use std::sync::atomic::{AtomicBool, Ordering};  // Thread-safe boolean for shutdown
use std::sync::Arc;
use tracing::{error, info};  // Structured logging
use tracing_actix_web::TracingLogger;  // Request logs that join our tracing output
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};  // Logging setup

use calls::{CallLifecycleService, InMemoryCallRepository};
use config::AppConfig;
use engine::RealtimeEngine;
use state::AppState;
use telephony::SessionRegistry;

/// Global shutdown signal that can be accessed from anywhere in the program.
/// This only coordinates process-level shutdown; per-call cleanup is driven
/// by each call's own socket and callbacks, never by signal handlers.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Creates shared application state** and the call lifecycle service
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown**: stop accepting requests, then finalize
///    every call that is still streaming
#[actix_web::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    // Set up structured logging (tracing) for debugging and monitoring
    init_tracing()?;

    // Load application configuration from config.toml and environment variables
    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting call-bridge-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.engine.agent_id.is_empty() {
        error!("No engine agent configured; calls will be canceled at stream attach");
    }

    // Create the shared application state that all HTTP requests can access
    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    // Wire up the call lifecycle: storage, engine client, and the registry
    // of live bridges.
    let repository = Arc::new(InMemoryCallRepository::new());
    let conversation_engine = Arc::new(RealtimeEngine::new(config.engine.clone()));
    let registry = Arc::new(SessionRegistry::new());
    let lifecycle = CallLifecycleService::new(
        repository,
        conversation_engine,
        registry,
        app_state.clone(),
    );
    let lifecycle_data = web::Data::new(lifecycle.clone());

    // Set up signal handlers for graceful shutdown (Ctrl+C, SIGTERM, etc.)
    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    // Create the HTTP server with all its configuration
    let server = HttpServer::new(move || {
        // The provider posts webhooks and browsers may hit the status API,
        // so keep CORS permissive.
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            // Share our application state with all request handlers
            .app_data(web::Data::new(app_state.clone()))
            .app_data(lifecycle_data.clone())
            // Add middleware in order (they execute in reverse order for responses)
            .wrap(cors)                                    // Handle CORS
            .wrap(TracingLogger::default())                // Access logs through tracing
            .wrap(middleware::MetricsMiddleware)           // Collect performance metrics
            .wrap(middleware::RequestLogging)              // Custom request logging
            // Define API routes under /api/v1 prefix
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
            )
            // Also provide health check at root level for convenience
            .route("/health", web::get().to(health::health_check))
            // Provider-facing call endpoints. The fixed segments must be
            // registered before the catch-all {call_sid} lookup.
            .route("/calls/incoming", web::post().to(handlers::incoming_call))
            .route("/calls/incoming", web::get().to(handlers::incoming_call))
            .route("/calls/status", web::post().to(handlers::call_status))
            .route("/calls/media/{call_sid}", web::get().to(websocket::media_stream))
            .route("/calls/{call_sid}", web::get().to(handlers::get_call))
    })
    .bind(&bind_addr)?  // Bind to the configured host and port
    .run();             // Start the server (but don't block here)

    // Get a handle to control the server and spawn it in a separate task
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Wait for either the server to finish OR a shutdown signal
    tokio::select! {
        // If the server task finishes (which usually means an error)
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        // If we receive a shutdown signal (Ctrl+C, SIGTERM, etc.)
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;  // Gracefully stop the server
        }
    }

    // The server no longer accepts connections; end whatever calls are
    // still bridged so the engine sees clean goodbyes.
    lifecycle.shutdown_all().await;

    info!("Server stopped gracefully");
    Ok(())  // Return success
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "info", "call_bridge_backend=debug")
/// - If not set, defaults to "call_bridge_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            // Try to read RUST_LOG environment variable, or use defaults
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_bridge_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())  // Format logs nicely for console output
        .init();  // Actually start the logging system

    Ok(())
}

/// Set up signal handlers for graceful shutdown.
///
/// ## What this does:
/// - Listens for SIGTERM (termination signal from system)
/// - Listens for SIGINT (interrupt signal, usually Ctrl+C)
/// - When either signal is received, sets the global shutdown flag
///
/// The flag only stops the HTTP server; live calls are finalized
/// afterwards from main, where the lifecycle service is still owned.
fn setup_signal_handlers() {
    tokio::spawn(async {
        // Set up handlers for different types of shutdown signals
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        // Wait for either signal to arrive
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        // Set the global shutdown flag so other parts of the program know to stop
        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown signal to be set.
///
/// Simple polling; 100ms of shutdown latency is nothing next to the
/// seconds a phone call takes to wind down.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
