//! `vidpipe-webrtc` — republish a `--h264-sock` access-unit stream as WebRTC,
//! negotiated over a local newline-delimited-JSON signaling socket.

use clap::Parser;
use vidpipe::config::WebRtcArgs;
use vidpipe::republish::webrtc;

fn main() {
    env_logger::init();
    let args = WebRtcArgs::parse();

    if let Err(e) = webrtc::run(args) {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}
