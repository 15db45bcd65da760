//! Pipeline configuration: CLI flags merged over an optional TOML file.
//!
//! Mirrors `capture-usb-mpp --help`'s flag set one-for-one, with an added
//! `--config` file layer (serde + toml, as the rest of this corpus does it).

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

fn default_device() -> String {
    "/dev/video0".to_string()
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

fn default_pixel_format() -> String {
    "yuyv".to_string()
}

fn default_fps() -> u32 {
    30
}

fn default_jpeg_quality() -> u32 {
    80
}

fn default_h264_bitrate_kbps() -> u32 {
    2000
}

fn default_idle_ms() -> u64 {
    1000
}

/// Config-file-shaped fields; every field here also has a CLI flag in
/// [`CaptureArgs`] — CLI always wins when both are present.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct FileConfig {
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_pixel_format")]
    pub pixel_format: String,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default)]
    pub frames: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u32,
    #[serde(default = "default_h264_bitrate_kbps")]
    pub h264_bitrate_kbps: u32,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub jpeg_sock: Option<String>,
    #[serde(default)]
    pub mjpeg_sock: Option<String>,
    #[serde(default)]
    pub h264_sock: Option<String>,
    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,
    #[serde(default)]
    pub num_planes: u32,
    #[serde(default)]
    pub debug: bool,
}

impl Default for FileConfig {
    fn default() -> Self {
        FileConfig {
            device: default_device(),
            width: default_width(),
            height: default_height(),
            pixel_format: default_pixel_format(),
            fps: default_fps(),
            frames: 0,
            jpeg_quality: default_jpeg_quality(),
            h264_bitrate_kbps: default_h264_bitrate_kbps(),
            output: None,
            jpeg_sock: None,
            mjpeg_sock: None,
            h264_sock: None,
            idle_ms: default_idle_ms(),
            num_planes: 0,
            debug: false,
        }
    }
}

/// CLI flags for `vidpipe-capture`.
#[derive(Debug, Parser, Clone)]
#[command(name = "vidpipe-capture", about = "Capture, transcode, and publish video")]
pub struct CaptureArgs {
    /// Optional TOML config file; CLI flags override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub device: Option<String>,
    #[arg(long)]
    pub width: Option<u32>,
    #[arg(long)]
    pub height: Option<u32>,
    #[arg(long = "pixel-format")]
    pub pixel_format: Option<String>,
    #[arg(long)]
    pub fps: Option<u32>,
    /// Number of frames to capture, 0 = unlimited.
    #[arg(long)]
    pub frames: Option<u64>,
    #[arg(long = "jpeg-quality")]
    pub jpeg_quality: Option<u32>,
    #[arg(long = "h264-bitrate")]
    pub h264_bitrate_kbps: Option<u32>,
    /// Snapshot write-and-rename file path.
    #[arg(long)]
    pub output: Option<String>,
    #[arg(long = "jpeg-sock")]
    pub jpeg_sock: Option<String>,
    #[arg(long = "mjpeg-sock")]
    pub mjpeg_sock: Option<String>,
    #[arg(long = "h264-sock")]
    pub h264_sock: Option<String>,
    #[arg(long)]
    pub idle: Option<u64>,
    #[arg(long = "num-planes")]
    pub num_planes: Option<u32>,
    #[arg(long)]
    pub debug: bool,
}

/// Fully resolved pipeline configuration, CLI merged over file defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: String,
    pub fps: u32,
    pub frames: u64,
    pub jpeg_quality: u32,
    pub h264_bitrate_kbps: u32,
    pub output: Option<String>,
    pub jpeg_sock: Option<String>,
    pub mjpeg_sock: Option<String>,
    pub h264_sock: Option<String>,
    pub idle_ms: u64,
    pub num_planes: u32,
    pub debug: bool,
}

impl PipelineConfig {
    pub fn load(args: CaptureArgs) -> anyhow::Result<Self> {
        let file = match &args.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str(&text)?
            }
            None => FileConfig::default(),
        };

        Ok(PipelineConfig {
            device: args.device.unwrap_or(file.device),
            width: args.width.unwrap_or(file.width),
            height: args.height.unwrap_or(file.height),
            pixel_format: args.pixel_format.unwrap_or(file.pixel_format),
            fps: args.fps.unwrap_or(file.fps),
            frames: args.frames.unwrap_or(file.frames),
            jpeg_quality: args.jpeg_quality.unwrap_or(file.jpeg_quality),
            h264_bitrate_kbps: args.h264_bitrate_kbps.unwrap_or(file.h264_bitrate_kbps),
            output: args.output.or(file.output),
            jpeg_sock: args.jpeg_sock.or(file.jpeg_sock),
            mjpeg_sock: args.mjpeg_sock.or(file.mjpeg_sock),
            h264_sock: args.h264_sock.or(file.h264_sock),
            idle_ms: args.idle.unwrap_or(file.idle_ms),
            num_planes: args.num_planes.unwrap_or(file.num_planes),
            debug: args.debug || file.debug,
        })
    }
}

/// CLI flags for `vidpipe-rtsp`.
#[derive(Debug, Parser, Clone)]
#[command(name = "vidpipe-rtsp", about = "Republish an h264 sink as RTSP")]
pub struct RtspArgs {
    #[arg(long = "h264-sock")]
    pub h264_sock: String,
    #[arg(long = "rtsp-port", default_value_t = 8554)]
    pub rtsp_port: u16,
    #[arg(long = "max-clients", default_value_t = 4)]
    pub max_clients: usize,
    #[arg(long = "buffer-size", default_value_t = 300_000)]
    pub buffer_size: usize,
    #[arg(long)]
    pub debug: bool,
}

/// CLI flags for `vidpipe-webrtc`.
#[derive(Debug, Parser, Clone)]
#[command(name = "vidpipe-webrtc", about = "Republish an h264 sink over WebRTC")]
pub struct WebRtcArgs {
    #[arg(long = "webrtc-sock")]
    pub webrtc_sock: String,
    #[arg(long = "h264-sock")]
    pub h264_sock: String,
    #[arg(long = "max-clients", default_value_t = 4)]
    pub max_clients: usize,
    /// STUN server URL, may be repeated.
    #[arg(long = "stun")]
    pub stun: Vec<String>,
    #[arg(long)]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_args() -> CaptureArgs {
        CaptureArgs {
            config: None,
            device: None,
            width: None,
            height: None,
            pixel_format: None,
            fps: None,
            frames: None,
            jpeg_quality: None,
            h264_bitrate_kbps: None,
            output: None,
            jpeg_sock: None,
            mjpeg_sock: None,
            h264_sock: None,
            idle: None,
            num_planes: None,
            debug: false,
        }
    }

    #[test]
    fn defaults_apply_with_no_cli_flags_and_no_config_file() {
        let config = PipelineConfig::load(bare_args()).unwrap();
        assert_eq!(config.device, "/dev/video0");
        assert_eq!(config.width, 1920);
        assert_eq!(config.fps, 30);
        assert_eq!(config.idle_ms, 1000);
        assert!(config.jpeg_sock.is_none());
    }

    #[test]
    fn cli_flag_overrides_file_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vidpipe.toml");
        std::fs::write(&path, "width = 640\nheight = 480\nfps = 15\n").unwrap();

        let mut args = bare_args();
        args.config = Some(path);
        args.fps = Some(60);

        let config = PipelineConfig::load(args).unwrap();
        assert_eq!(config.width, 640, "unset CLI flag should fall through to the file value");
        assert_eq!(config.fps, 60, "CLI flag must win over the file value");
    }
}
