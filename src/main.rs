use anyhow::{Context, Result};
use clap::Parser;
use live_relay::{
    create_router, AccessToken, AppState, Config, RecorderConfig, RelayEvent, RelayLifecycle,
    SegmentRecorder,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Relay a live RTMPS stream into fragmented MP4 segments
#[derive(Debug, Parser)]
#[command(name = "live-relay", version)]
struct Args {
    /// Settings file, without extension
    #[arg(long, default_value = "config/live-relay")]
    config: String,

    /// Access token `<channel>-<token1>-<token2>` (overrides settings)
    #[arg(long)]
    token: Option<String>,

    /// Relay server (overrides settings)
    #[arg(long)]
    server: Option<String>,

    /// Write per-track fMP4 files to this directory
    #[arg(long)]
    output: Option<PathBuf>,

    /// Start relaying immediately instead of waiting for a login request
    #[arg(long)]
    connect: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut cfg = Config::load(&args.config)?;

    if let Some(token) = args.token {
        cfg.relay.access_token = token;
    }
    if let Some(server) = args.server {
        cfg.relay.server = server;
    }
    if let Some(output) = args.output {
        cfg.output.directory = Some(output);
    }

    info!("Live Relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Client id: {}", cfg.relay.client_id);

    let (relay, events) = RelayLifecycle::new();
    let relay = Arc::new(relay);

    // Consume relay events: record to disk or just log them
    let sink = match &cfg.output.directory {
        Some(dir) => {
            let mut recorder = SegmentRecorder::new(RecorderConfig::new(
                cfg.relay.client_id.clone(),
                dir.clone(),
            ))?;
            tokio::spawn(async move {
                match recorder.record(events).await {
                    Ok(files) => info!("Recorded {} track files", files.len()),
                    Err(e) => error!("Recording failed: {:#}", e),
                }
            })
        }
        None => tokio::spawn(log_events(events)),
    };

    if args.connect {
        let token = AccessToken::parse(&cfg.relay.access_token)
            .context("--connect needs a valid access token")?;
        relay
            .start(cfg.relay.relay_config(&token))
            .await
            .context("Failed to start relay")?;
    }

    let addr = format!("{}:{}", cfg.http.bind, cfg.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server to {}", addr))?;
    info!("HTTP server listening on {}", addr);

    let app = create_router(AppState::new(Arc::clone(&relay), cfg.relay.clone()));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Shutting down");
    relay.stop().await?;

    // Dropping the relay closes the event channel and ends the sink
    drop(relay);
    if let Err(e) = sink.await {
        warn!("Event sink task failed: {}", e);
    }

    Ok(())
}

async fn log_events(mut events: mpsc::UnboundedReceiver<RelayEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            RelayEvent::Segment(segment) => debug!(
                "Segment {} ({:?}, track {}, {} bytes)",
                segment.sequence,
                segment.kind,
                segment.track_id,
                segment.payload.len()
            ),
            RelayEvent::Error(message) => warn!("Relay: {}", message),
            RelayEvent::End => info!("Relay stream ended"),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
}
