//! `vidpipe-capture` — capture, transcode, and publish video to local sinks.

use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use vidpipe::config::{CaptureArgs, PipelineConfig};
use vidpipe::pipeline::PipelineLoop;

/// Cleared by SIGINT/SIGTERM; the pipeline loop polls this once per
/// iteration so shutdown finishes the in-flight frame and tears every sink
/// and codec down through its own `Drop` impl instead of aborting mid-frame.
static RUN: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_sig: libc::c_int) {
    RUN.store(false, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as usize);
        libc::signal(libc::SIGTERM, handle_signal as usize);
    }
}

fn main() {
    env_logger::init();
    let args = CaptureArgs::parse();

    if let Err(e) = run(args) {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(args: CaptureArgs) -> anyhow::Result<()> {
    let config = PipelineConfig::load(args)?;
    log::info!(
        "vidpipe-capture starting: device={} {}x{} {} @ {}fps",
        config.device, config.width, config.height, config.pixel_format, config.fps
    );

    install_signal_handlers();

    let pipeline = PipelineLoop::start(&config)?;
    let frames = pipeline.run(&RUN)?;
    log::info!("vidpipe-capture exiting cleanly after {frames} frames");
    Ok(())
}
