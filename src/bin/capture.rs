//! capture - run a frame source until Ctrl-C
//!
//! This binary:
//! 1. Loads capture settings (config file + env overrides + flags)
//! 2. Opens the configured device and starts the acquisition loop
//! 3. Logs frame statistics periodically
//! 4. Toggles pause on `p` + Enter, quits on `q` + Enter or Ctrl-C
//! 5. Optionally writes the last delivered frame as PNG on shutdown

use anyhow::{Context, Result};
use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};

use vision_capture::{
    CaptureConfig, FrameCounter, FrameSource, PauseControl, SnapshotSink, StopOutcome,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "CAPTURE_CONFIG")]
    config: Option<PathBuf>,
    /// Device identifier: index, /dev path, or stub://kind.
    #[arg(long)]
    device: Option<String>,
    /// Target frame width.
    #[arg(long)]
    width: Option<u32>,
    /// Target frame height.
    #[arg(long)]
    height: Option<u32>,
    /// Write the last frame here on shutdown.
    #[arg(long)]
    snapshot: Option<PathBuf>,
    /// Start with delivery paused.
    #[arg(long)]
    paused: bool,
}

enum Control {
    Quit,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = CaptureConfig::load_from(args.config.as_deref())?;
    if let Some(device) = args.device {
        cfg.source.device = device;
    }
    if let Some(width) = args.width {
        cfg.source.width = width;
    }
    if let Some(height) = args.height {
        cfg.source.height = height;
    }
    if args.snapshot.is_some() {
        cfg.snapshot_path = args.snapshot;
    }

    let mut source = FrameSource::open_config(cfg.source.clone())?;

    let counter = FrameCounter::new();
    let snapshot = SnapshotSink::new();
    {
        let counter = counter.clone();
        let snapshot = snapshot.clone();
        source.on_frame(move |frame| {
            counter.record(&frame);
            snapshot.store(frame);
        });
    }

    if args.paused {
        source.pause();
    }
    source.start()?;
    log::info!(
        "capture running on {} at {}x{} (p+Enter toggles pause, q+Enter or Ctrl-C quits)",
        cfg.source.device,
        cfg.source.width,
        cfg.source.height
    );

    let (tx, rx) = mpsc::channel();
    let ctrlc_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send(Control::Quit);
    })
    .context("error setting Ctrl-C handler")?;
    spawn_input_reader(source.pause_control(), tx);

    loop {
        match rx.recv_timeout(cfg.stats_interval) {
            Ok(Control::Quit) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                let stats = source.stats();
                log::info!(
                    "frames read={} delivered={} discarded={} failures={} paused={} last={:?}",
                    stats.frames_read,
                    stats.frames_delivered,
                    stats.frames_discarded,
                    stats.read_failures,
                    source.is_paused(),
                    counter.last_dimensions()
                );
            }
        }
    }

    log::info!("shutdown requested, stopping capture...");
    if source.stop() == StopOutcome::TimedOut {
        log::warn!("acquisition loop still blocked in a device read; exiting anyway");
    }
    if let Some(path) = &cfg.snapshot_path {
        if let Err(err) = snapshot.save_png(path) {
            log::warn!("snapshot skipped: {:#}", err);
        }
    }
    log::info!("captured {} frames", counter.frames());
    Ok(())
}

fn spawn_input_reader(pause: PauseControl, tx: mpsc::Sender<Control>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            match line.trim() {
                "p" => {
                    let paused = pause.toggle();
                    log::info!("delivery {}", if paused { "paused" } else { "resumed" });
                }
                "q" => {
                    let _ = tx.send(Control::Quit);
                    break;
                }
                "" => {}
                other => log::warn!("unknown command {:?} (use p or q)", other),
            }
        }
    });
}
