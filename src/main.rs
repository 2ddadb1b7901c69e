//! Vision Streamer - live viewer for a vehicle-access vision server
//!
//! Streams processed frames and zone statistics over a WebSocket, uploads
//! videos for processing and drives sessions from the console.

mod app;
mod media;
mod vision;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use log::{debug, info, warn};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use app::{FramePolicy, Settings, UiAction};
use media::MemorySurface;
use vision::{StartSource, VisionApiClient};

#[derive(Parser)]
#[command(name = "vision-streamer")]
#[command(about = "Live viewer for the vision inference server", version)]
struct Cli {
    #[command(flatten)]
    options: Options,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug, Default)]
struct Options {
    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// REST base URL, e.g. http://host:8000/api/v1
    #[arg(long, global = true)]
    server: Option<String>,

    /// WebSocket URL (derived from --server when omitted)
    #[arg(long, global = true)]
    ws_url: Option<String>,

    /// Preselect a video file to upload
    #[arg(long, global = true)]
    video: Option<PathBuf>,

    /// Start the selected source once connected
    #[arg(long, global = true)]
    autostart: bool,

    /// Periodically write the displayed frame to this PNG
    #[arg(long, global = true)]
    snapshot: Option<PathBuf>,

    /// Drop frames that arrive faster than they can be drawn
    #[arg(long, global = true)]
    latest_wins: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream frames and stats; actions are read from stdin (default)
    Watch,

    /// One-shot calls against the REST endpoints
    Rest {
        #[command(subcommand)]
        call: RestCall,
    },
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum RestCall {
    /// Fetch current stats
    Stats,
    /// Start processing
    Start {
        /// Remote identifier returned by a previous upload
        #[arg(long)]
        video_path: Option<String>,

        /// Use the server camera
        #[arg(long, conflicts_with = "video_path")]
        webcam: bool,
    },
    /// Stop processing
    Stop,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    info!("Vision Streamer v{}", env!("CARGO_PKG_VERSION"));

    let settings = load_settings(&cli.options)?;

    // One dispatch loop drives the session; decoding runs on blocking threads
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let result = match cli.command.unwrap_or(Commands::Watch) {
        Commands::Watch => runtime.block_on(watch(settings, &cli.options)),
        Commands::Rest { call } => runtime.block_on(rest(settings, call)),
    };

    // The stdin reader may still be parked in a blocking read
    runtime.shutdown_background();
    result
}

fn load_settings(options: &Options) -> Result<Settings> {
    let mut settings = match options.config.as_ref() {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load().unwrap_or_else(|e| {
            warn!("Using default settings: {}", e);
            Settings::default()
        }),
    };

    if let Some(server) = options.server.as_ref() {
        settings.api_base_url = server.clone();
    }
    if let Some(ws_url) = options.ws_url.as_ref() {
        settings.ws_url = Some(ws_url.clone());
    }
    if let Some(path) = options.snapshot.as_ref() {
        settings.snapshot_path = Some(path.clone());
    }
    if options.latest_wins {
        settings.frame_policy = FramePolicy::LatestWins;
    }

    Ok(settings)
}

async fn watch(settings: Settings, options: &Options) -> Result<()> {
    let surface = match settings.snapshot_path.clone() {
        Some(path) => MemorySurface::with_snapshot(path, settings.snapshot_interval),
        None => MemorySurface::new(),
    };

    let (mut session, events) = app::build_session(&settings, surface);
    info!("Streaming from {}", session.link().url());

    if let Some(video) = options.video.clone() {
        session.handle_action(UiAction::SelectFile(video));
    }
    if options.autostart {
        session.start_when_ready();
    }

    let (action_tx, action_rx) = mpsc::channel(16);

    let stdin_tx = action_tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match UiAction::parse(&line) {
                Some(action) => {
                    if stdin_tx.send(action).await.is_err() {
                        break;
                    }
                }
                None => warn!(
                    "Unknown command '{}' (start, stop, stats, source webcam|video, file <path>, status, reconnect, quit)",
                    line.trim()
                ),
            }
        }
        debug!("Console input closed");
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            let _ = action_tx.send(UiAction::Quit).await;
        }
    });

    let session = app::run(session, events, action_rx).await;

    let render = session.render_stats();
    info!(
        "Session ended after {} connection attempts: {} frames drawn, {} dropped, {} undecodable",
        session.link().connect_attempts(),
        render.frames_drawn,
        render.frames_dropped,
        render.decode_failures
    );
    Ok(())
}

async fn rest(settings: Settings, call: RestCall) -> Result<()> {
    let client = VisionApiClient::new(&settings.api_base_url);

    let response = match call {
        RestCall::Stats => client.fetch_stats().await?,
        RestCall::Start { video_path, webcam } => {
            let source = if webcam {
                StartSource::Webcam
            } else {
                let video_path = video_path
                    .ok_or_else(|| anyhow::anyhow!("--video-path or --webcam is required"))?;
                StartSource::Video { video_path }
            };
            client.start_processing(&source).await?
        }
        RestCall::Stop => client.stop_processing().await?,
    };

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
