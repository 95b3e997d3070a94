mod config;
mod hub;
mod web;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cradle_media::nest::{
    FileTokenProvider, NestDeviceClient, NestStreamReaderManager, StaticTokenProvider,
    TokenProvider,
};
use cradle_media::peers::{AudioWebRtcService, PeerPush, VideoWebRtcService};
use cradle_media::repo::{MemoryRoomRepository, MemorySettingsRepository};
use cradle_media::streaming::{AudioStreamingService, VideoStreamingService};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tracing_subscriber::EnvFilter;

use crate::hub::AppState;

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/cradle.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    gstreamer::init().context("Failed to initialize GStreamer")?;

    let (config_path, port_override) = parse_args();
    let mut config = config::load_config(&config_path)?;
    if let Some(p) = port_override {
        config.server.port = p;
    }

    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("Invalid bind address")?;

    // Repositories, seeded from the config file.
    let rooms_repo = Arc::new(MemoryRoomRepository::new(config.rooms.clone()));
    let settings_repo = Arc::new(MemorySettingsRepository::new(config.settings.clone()));

    // SDM client, when Nest is configured.
    let token_provider: Option<Arc<dyn TokenProvider>> =
        if let Some(token) = config.nest.access_token.clone() {
            Some(Arc::new(StaticTokenProvider::new(token)))
        } else {
            config
                .nest
                .token_file
                .clone()
                .map(|path| Arc::new(FileTokenProvider::new(path)) as Arc<dyn TokenProvider>)
        };
    let nest_client = match (&config.nest.project_id, token_provider) {
        (Some(project_id), Some(tokens)) => {
            Some(Arc::new(NestDeviceClient::new(project_id.clone(), tokens)))
        }
        _ => None,
    };

    let nest_manager = Arc::new(NestStreamReaderManager::new());

    let audio_streaming = AudioStreamingService::new(
        rooms_repo.clone(),
        settings_repo.clone(),
        nest_manager.clone(),
        nest_client.clone(),
        config.settings.clone(),
    );
    let video_streaming = VideoStreamingService::new(
        rooms_repo.clone(),
        nest_manager.clone(),
        nest_client.clone(),
    );

    // Server→client pushes from the WebRTC services (trickled ICE) flow
    // through this channel into the hub's per-viewer senders.
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<PeerPush>();
    let audio_rtc = AudioWebRtcService::new(audio_streaming.clone(), push_tx.clone());
    let video_rtc = VideoWebRtcService::new(video_streaming.clone(), push_tx);

    let state = Arc::new(AppState {
        config,
        rooms_repo,
        settings_repo,
        audio_streaming: audio_streaming.clone(),
        video_streaming: video_streaming.clone(),
        audio_rtc,
        video_rtc,
        nest_client,
        connections: Mutex::new(HashMap::new()),
        started_at: std::time::Instant::now(),
    });

    // Load the room cache before accepting viewers.
    state.refresh_services().await;

    let push_state = Arc::clone(&state);
    tokio::spawn(async move {
        while let Some(push) = push_rx.recv().await {
            push_state.push_to(&push.peer_id, push.message).await;
        }
    });

    let app = web::build_router(Arc::clone(&state));

    tracing::info!("===========================================");
    tracing::info!("  Cradle baby-monitor relay");
    tracing::info!("  Listening on http://{bind_addr}");
    tracing::info!("===========================================");

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Stop readers and cloud sessions before exiting.
    tracing::info!("Shutting down readers");
    audio_streaming.shutdown().await;
    video_streaming.shutdown().await;
    tracing::info!("Cradle server shut down cleanly");

    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("Failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
