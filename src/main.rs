//! # Media Ingest Server - Main Application Entry Point
//!
//! A WebSocket server that records what clients stream to it and can stream
//! an audio asset back.
//!
//! ## What a client can do over `GET /ws`:
//! - Push AUDIO chunks (raw 16-bit mono PCM, 44.1 kHz), written to a `.wav`
//! - Push VIDEO chunks (one encoded frame each), assembled into a video by ffmpeg
//! - Ask for playback of a configured audio asset, decoded by ffmpeg and sent
//!   back as base64 PCM
//! - Close the session, or just drop the connection; either way the session
//!   is finalized exactly once
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **state**: shared state, metrics, and the session registry
//! - **protocol**: JSON wire events
//! - **media**: the audio and video recorders
//! - **codec**: the ffmpeg bridge and the playback pipeline
//! - **session**: per-connection session, lifecycle guard, and registry
//! - **dispatcher**: routes a connection's events to its session
//! - **websocket**: the per-connection actor and upgrade endpoint
//! - **health / handlers / middleware**: the HTTP surface around it
//! - **error**: HTTP error responses

mod codec;
mod config;
mod dispatcher;
mod error;
mod handlers;
mod health;
mod media;
mod middleware;
mod protocol;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use crate::codec::FfmpegBridge;
use crate::config::AppConfig;
use crate::session::TeardownTrigger;
use crate::state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGTERM or SIGINT has been received.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// ## Startup sequence:
/// 1. Load `.env`, initialize tracing
/// 2. Load and validate configuration
/// 3. Create the media output directories
/// 4. Build shared state around the ffmpeg bridge
/// 5. Serve until a shutdown signal arrives
///
/// ## Shutdown sequence:
/// The HTTP server is stopped gracefully first, which stops every WebSocket
/// actor. Dispatchers run on this runtime rather than on the workers, so a
/// teardown already under way survives the workers going away. Any session
/// still registered is then finalized here, or waited on if its own teardown
/// is still running.
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    prepare_media_dirs(&config).await?;

    let bridge = Arc::new(FfmpegBridge::new(config.codec.ffmpeg_path.clone()));
    let app_state = AppState::new(config.clone(), bridge);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/recordings", web::get().to(handlers::list_recordings))
            .route("/ws", web::get().to(websocket::media_websocket))
            .route("/", web::get().to(websocket::media_websocket))
    })
    .disable_signals()
    .bind(&bind_addr)
    .with_context(|| format!("failed to bind {}", bind_addr))?
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

    let finalized = app_state
        .registry
        .teardown_all(TeardownTrigger::ServerShutdown)
        .await;
    if finalized > 0 {
        info!(sessions = finalized, "Finalized sessions left open at shutdown");
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls filtering; without it this crate logs at debug and
/// actix-web at info.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "media_ingest_server=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Create the audio, video, and scratch directories if they do not exist.
///
/// A missing playback asset is only a warning: recording works without it,
/// and playback requests are refused with a log line until it appears.
async fn prepare_media_dirs(config: &AppConfig) -> Result<()> {
    for dir in [
        &config.media.audio_dir,
        &config.media.video_dir,
        &config.media.scratch_dir,
    ] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        info!(dir = %dir.display(), "Media directory ready");
    }

    if !tokio::fs::try_exists(&config.media.playback_asset)
        .await
        .unwrap_or(false)
    {
        warn!(
            asset = %config.media.playback_asset.display(),
            "Playback asset not found; playback requests will be refused"
        );
    }

    Ok(())
}

/// Set [`SHUTDOWN_SIGNAL`] on SIGTERM or SIGINT.
fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
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

/// Poll [`SHUTDOWN_SIGNAL`] every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
