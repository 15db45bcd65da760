//! `vidpipe-rtsp` — republish a `--h264-sock` access-unit stream as RTSP.

use clap::Parser;
use vidpipe::config::RtspArgs;
use vidpipe::republish::rtsp;

fn main() {
    env_logger::init();
    let args = RtspArgs::parse();

    if let Err(e) = rtsp::run(args) {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}
