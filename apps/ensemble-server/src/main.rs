//! Ensemble Server - headless playback coordinator for Sonos groups.
//!
//! Runs the playback engine against a configured set of renderers, logging
//! sink updates and engine events. It is meant for deployments where another
//! process drives playback through the engine and only coordination is needed.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ensemble_core::{BroadcastEventEmitter, LoggingSpeakerSink, PlaybackEngine, RendererId};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

use crate::config::{RendererConfig, ServerConfig};

/// Capacity of the engine event channel the server logs from.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Ensemble Server - playback coordination for grouped Sonos renderers.
#[derive(Parser, Debug)]
#[command(name = "ensemble-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "ENSEMBLE_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Additional renderer as ID@HOST[:PORT] (repeatable).
    #[arg(short, long = "renderer", value_name = "ID@HOST[:PORT]")]
    renderers: Vec<RendererConfig>,

    /// Renderer to activate as playback target (overrides config file).
    #[arg(short, long)]
    activate: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Ensemble Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    config.renderers.extend(args.renderers);
    if let Some(id) = args.activate {
        config.active_renderer = Some(id);
    }

    if config.renderers.is_empty() {
        log::warn!("No renderers configured - add some with --renderer ID@HOST");
    }

    let emitter = BroadcastEventEmitter::new(EVENT_CHANNEL_CAPACITY);
    let mut events = emitter.subscribe();
    let engine = PlaybackEngine::with_soap_transport(
        config.engine.clone(),
        Arc::new(LoggingSpeakerSink),
        Arc::new(emitter),
    )
    .context("Failed to create playback engine")?;

    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log::info!("[Event] {:?}", event),
                Err(RecvError::Lagged(n)) => log::warn!("[Event] Skipped {} event(s)", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    for renderer in &config.renderers {
        engine
            .add_renderer(renderer.renderer_id(), renderer.endpoint())
            .await
            .with_context(|| format!("Failed to add renderer {}", renderer.id))?;
    }

    engine.start();
    log::info!("Engine started with {} renderer(s)", config.renderers.len());

    if let Some(id) = &config.active_renderer {
        if let Err(e) = engine.set_active(&RendererId::new(id.as_str()), true).await {
            log::warn!("Could not activate {}: {}", id, e);
        }
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    engine.shutdown();
    event_log.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
