//! Drives a [`FrameSource`] the way a UI timer would: each tick ends the
//! frame submitted on the previous tick and submits the next one, so the
//! worker renders while the "UI" presents.
//!
//! Uses the in-memory GL so it runs anywhere. `RUST_LOG=debug` shows the
//! target being recreated on every resize.

use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use offgl::{CpuBitmap, FrameHandle, FrameOutcome, FrameSource, FrameSourceConfig, Size};
use offgl_readback::{SoftContext, SoftGl};
use tracing::{info, trace, warn};
use tracing_subscriber::EnvFilter;

const TICK: Duration = Duration::from_millis(16);
const FRAMES: u64 = 600;
const SIZES: [Size; 4] = [
    Size::new(320, 240),
    Size::new(640, 360),
    Size::new(1, 480),
    Size::new(0, 0),
];

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = FrameSourceConfig {
        size: SIZES[0],
        ..FrameSourceConfig::default()
    };
    let mut source = FrameSource::spawn(config, || Ok((SoftContext::new(), SoftGl::new())))
        .context("failed to start the frame source")?;

    let mut back: Option<CpuBitmap> = None;
    let mut in_flight: Option<FrameHandle<CpuBitmap>> = None;
    let mut presented = 0u64;
    let mut window = Instant::now();

    for tick in 0..FRAMES {
        let started = Instant::now();

        match source.end_render(in_flight.take()) {
            FrameOutcome::Presented(mut bitmap) => {
                presented += 1;
                if let Some(dirty) = bitmap.take_dirty() {
                    trace!(?dirty, "present");
                }
                back = Some(bitmap);
            }
            FrameOutcome::Failed { buffer, error } => {
                warn!("frame {tick} failed: {error}");
                back = Some(buffer);
            }
            FrameOutcome::Skipped | FrameOutcome::Foreign(_) => {}
        }

        if tick % 120 == 0 {
            let size = SIZES[(tick / 120) as usize % SIZES.len()];
            info!(%size, "resizing output");
            source.set_size(size);
        }

        let phase = tick as u32;
        in_flight = source.begin_render(
            move |gl: &mut SoftGl| {
                gl.fill(|x, y| 0xFF00_0000 | (((x as u32 + phase) & 0xFF) << 16) | (y as u32 & 0xFF))
            },
            &mut back,
        )?;

        if window.elapsed() >= Duration::from_secs(1) {
            let fps = presented as f64 / window.elapsed().as_secs_f64();
            info!(fps, size = %source.size(), pending = source.pending(), "frame rate");
            presented = 0;
            window = Instant::now();
        }

        if let Some(rest) = TICK.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    source.end_render(in_flight.take());
    let discarded = source.shutdown();
    info!(discarded, "frame source stopped");
    Ok(())
}
