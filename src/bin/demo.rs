//! demo - synthetic end-to-end run of a frame source

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use vision_capture::{FrameRecorder, FrameSource, SnapshotSink, SourceConfig, StopOutcome};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Synthetic device to capture from.
    #[arg(long, default_value = "stub://fixed")]
    device: String,
    /// Duration of each phase (running, paused, resumed) in milliseconds.
    #[arg(long, default_value_t = 500)]
    phase_ms: u64,
    /// Target frame width.
    #[arg(long, default_value_t = 160)]
    width: u32,
    /// Target frame height.
    #[arg(long, default_value_t = 120)]
    height: u32,
    /// Optional PNG path for the last delivered frame.
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if !args.device.starts_with("stub://") {
        return Err(anyhow!("demo only runs against stub:// devices"));
    }
    let phase = Duration::from_millis(args.phase_ms);

    stage("open source");
    let mut source = FrameSource::open_config(SourceConfig {
        device: args.device.clone(),
        width: args.width,
        height: args.height,
        ..SourceConfig::default()
    })?;

    let recorder = FrameRecorder::new();
    let snapshot = SnapshotSink::new();
    {
        let mut record = recorder.callback();
        let snapshot = snapshot.clone();
        source.on_frame(move |frame| {
            snapshot.store(frame.clone());
            record(frame);
        });
    }

    stage("capture");
    source.start()?;
    std::thread::sleep(phase);
    let before_pause = recorder.len();

    stage("pause");
    source.pause();
    std::thread::sleep(phase);
    let during_pause = recorder.len() - before_pause;

    stage("resume");
    source.resume();
    std::thread::sleep(phase);

    stage("stop");
    let outcome = source.stop();
    if outcome == StopOutcome::TimedOut {
        return Err(anyhow!("synthetic device did not stop within the grace period"));
    }

    let frames = recorder.take();
    let stats = source.stats();
    let ordered = frames.windows(2).all(|w| w[0].sequence < w[1].sequence);
    let sized = frames
        .iter()
        .all(|f| (f.width, f.height) == (args.width, args.height));

    eprintln!("demo: delivered {} frames", frames.len());
    eprintln!("demo: {} frame(s) slipped in as pause took effect", during_pause);
    eprintln!(
        "demo: read={} discarded={} failures={}",
        stats.frames_read, stats.frames_discarded, stats.read_failures
    );
    eprintln!("demo: acquisition order preserved: {}", ordered);
    eprintln!("demo: all frames {}x{}: {}", args.width, args.height, sized);

    if let Some(path) = &args.snapshot {
        snapshot.save_png(path)?;
        eprintln!("demo: snapshot written to {}", path.display());
    }

    if !ordered || !sized {
        return Err(anyhow!("demo checks failed"));
    }
    Ok(())
}

fn stage(msg: &str) {
    eprintln!("demo: {}", msg);
}
