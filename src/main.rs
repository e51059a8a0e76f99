//! ring-cam-capture binary: capture frames and report their grey level.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use ring_cam_capture::{to_greyscale, CaptureLifecycle, CaptureSettings, Fidelity, V4l2Sdk};

/// Capture frames from a V4L2 camera through the eight-slot ring.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Video device index (/dev/videoN). Overrides the configured camera id.
    #[arg(long)]
    device: Option<u32>,

    /// TOML capture settings.
    #[arg(long, env = "RING_CAM_CONFIG")]
    config: Option<PathBuf>,

    /// Number of frames to acquire before stopping.
    #[arg(long, default_value_t = 100)]
    frames: u32,

    /// Take UYVY luma bytes directly instead of full colour conversion.
    #[arg(long)]
    fast: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut settings = match &args.config {
        Some(path) => CaptureSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => CaptureSettings::default(),
    };
    if let Some(device) = args.device {
        settings.camera_id = device;
    }
    let fidelity = if args.fast {
        Fidelity::Fast
    } else {
        Fidelity::Accurate
    };

    let lifecycle = CaptureLifecycle::new(V4l2Sdk::new());
    lifecycle.start(&settings).context("starting capture")?;
    info!(
        "Capture method: {}, {:.2} fps",
        lifecycle.capture_method_name(),
        lifecycle.actual_frame_rate().unwrap_or(settings.fps)
    );

    let mut stale = 0u32;
    for _ in 0..args.frames {
        let frame = lifecycle.next_frame().context("acquiring frame")?;
        if !frame.fresh {
            stale += 1;
        }
        let grey = to_greyscale(&frame, fidelity).context("converting frame")?;
        let total: u64 = grey.as_raw().iter().map(|&luma| u64::from(luma)).sum();
        let pixels = u64::from(grey.width()) * u64::from(grey.height());
        info!(
            "Slot {} ({}): {}x{}, mean grey {}",
            frame.slot,
            if frame.fresh { "fresh" } else { "repeat" },
            grey.width(),
            grey.height(),
            total.checked_div(pixels).unwrap_or_default()
        );
    }

    if stale > 0 {
        warn!("{stale} of {} frames were repeats", args.frames);
    }
    lifecycle.stop().context("stopping capture")?;
    Ok(())
}
