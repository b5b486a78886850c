use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiosk_checkin::config::{self, Config};
use kiosk_checkin::gallery;
use kiosk_vision::{
    CancelToken, FrameSource, NativeLibrary, NativeMatchBridge, RecognitionError,
    RecognitionOrchestrator,
};
use log::{info, warn};

/// How long to wait for the stream before giving up on the camera.
const FRAME_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "kiosk-checkin")]
#[command(version, about = "Face check-in kiosk - camera capture and 1:N recognition")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize the person in front of the camera against a gallery snapshot
    Recognize {
        /// JSON snapshot of waiting users
        #[arg(short, long)]
        gallery: PathBuf,
        /// Frames to try before giving up
        #[arg(short, long, default_value_t = 30)]
        attempts: u32,
    },
    /// Save a single camera frame
    Snapshot {
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Print the native engine version
    Version,
    /// Open config file in editor
    Config,
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(None)?;

    match cli.command {
        Commands::Recognize { gallery, attempts } => recognize(&cfg, &gallery, attempts),
        Commands::Snapshot { out } => snapshot(&cfg, &out),
        Commands::Version => version(&cfg),
        Commands::Config => open_config(),
    }
}

fn load_engine(cfg: &Config) -> Result<NativeMatchBridge> {
    let engine = NativeLibrary::load(
        &cfg.engine.library,
        &cfg.engine.model_path,
        &cfg.engine.sdk_path,
    )
    .context("Failed to load native face engine")?;
    Ok(NativeMatchBridge::new(Arc::new(engine)))
}

fn recognize(cfg: &Config, gallery_path: &Path, attempts: u32) -> Result<()> {
    let gallery = gallery::load_snapshot(gallery_path)?;
    let orchestrator = RecognitionOrchestrator::new(load_engine(cfg)?, cfg.matching.thresholds());

    let source = FrameSource::v4l(cfg.camera.capture_settings());
    let frames = source.subscribe(2);
    source.start().context("Failed to open camera")?;
    info!("Camera opened. Look at the camera...");

    let cancel = CancelToken::new();
    let mut identity = None;
    for i in 0..attempts {
        let frame = frames
            .recv_timeout(FRAME_WAIT)
            .context("Camera stopped delivering frames")?;
        orchestrator.prewarm(&frame);

        match orchestrator.recognize(Some(&frame), &gallery, &cancel) {
            Ok(verdict) => {
                if let Some(quality) = verdict.quality {
                    source.offer_best_shot(&frame, quality);
                }
                if verdict.accepted {
                    identity = verdict.identity;
                    break;
                }
                if let Some(rejection) = verdict.rejection {
                    info!("Frame {}: {}", i + 1, rejection.status_message());
                }
                if let Some(reason) = verdict.reason {
                    log::debug!("Frame {}: {}", i + 1, reason);
                }
            }
            Err(RecognitionError::Busy) => {}
            Err(e) => warn!("Frame {}: {}", i + 1, e),
        }
    }
    source.stop();

    match identity {
        Some(identity) => {
            info!(
                "✓ Welcome, {} (queue {})",
                identity.masked_name(),
                identity.queue_oid
            );
            Ok(())
        }
        None => anyhow::bail!("Recognition failed: no matching face after {attempts} frames"),
    }
}

fn snapshot(cfg: &Config, out: &Path) -> Result<()> {
    let source = FrameSource::v4l(cfg.camera.capture_settings());
    source.start().context("Failed to open camera")?;

    // The first grabs after opening may come back empty.
    let cancel = CancelToken::new();
    let frame = (0..10).find_map(|_| source.capture_once(&cancel));
    source.stop();

    let frame = frame.context("Camera did not produce a frame")?;
    frame
        .image()
        .save(out)
        .with_context(|| format!("Failed to write {}", out.display()))?;
    info!(
        "✓ Saved {}x{} frame to {}",
        frame.width(),
        frame.height(),
        out.display()
    );
    Ok(())
}

fn version(cfg: &Config) -> Result<()> {
    let bridge = load_engine(cfg)?;
    println!("{}", bridge.engine_version());
    Ok(())
}

fn open_config() -> Result<()> {
    let config_path = config::CONFIG_PATH.as_os_str();
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {:?}", config_path);

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}
