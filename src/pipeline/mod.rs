//! Capture-transcode-publish pipeline orchestrator.
//!
//! Collapses the two capture flavors in `capture-usb-mpp/main.c` (capture
//! already gives JPEG bytes) and `capture-mipi-mpp/main.c` (capture gives a
//! raw pixel format, and a JPEG encode step produces the snapshot/MJPEG
//! bytes) into one loop body parameterized by [`InputKind`], so the h264
//! path, socket fan-out, frame pacing, and idle-wait are written once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::capture::{CaptureDevice, PixelFormat};
use crate::codec::h264::H264Encoder;
use crate::codec::jpeg::{JpegDecoder, JpegEncoder};
use crate::codec::RateControl;
use crate::config::PipelineConfig;
use crate::error::{CaptureError, CodecError};
use crate::sink::MultiSinkPublisher;

/// The six-byte Annex-B access-unit delimiter the original daemon appends
/// after every encoded H.264 packet (`NAL_AUD_FRAME`).
pub const NAL_AUD_FRAME: [u8; 6] = [0x00, 0x00, 0x00, 0x01, 0x09, 0xf0];

/// Which shape of bytes the capture device hands back per frame.
pub enum InputKind {
    /// Capture negotiated a raw pixel format (YUYV/NV12/...); a JPEG encode
    /// step is needed before anything can be written to a JPEG-shaped sink.
    Raw,
    /// Capture negotiated MJPEG; captured bytes already are JPEG bytes and
    /// an H.264 path needs a JPEG decode step first.
    Mjpeg,
}

struct OutputFileWriter {
    path: String,
}

impl OutputFileWriter {
    /// Mirrors `write_output_rename_cb`: write to `<path>.tmp` then rename
    /// over `path`, so a reader never observes a partial write.
    fn write(&self, data: &[u8]) {
        let tmp = format!("{}.tmp", self.path);
        match std::fs::write(&tmp, data) {
            Ok(()) => {
                if let Err(e) = std::fs::rename(&tmp, &self.path) {
                    log::warn!("rename {} -> {}: {e}", tmp, self.path);
                }
            }
            Err(e) => log::warn!("write {tmp}: {e}"),
        }
    }
}

/// Owns every open resource the capture pipeline needs and runs its loop.
pub struct PipelineLoop {
    capture: CaptureDevice,
    input_kind: InputKind,
    fps: u32,
    frame_limit: u64,
    idle: Duration,

    output_file: Option<OutputFileWriter>,
    jpeg_sink: Option<MultiSinkPublisher>,
    mjpeg_sink: Option<MultiSinkPublisher>,
    h264_sink: Option<MultiSinkPublisher>,

    jpeg_encoder: Option<JpegEncoder>,
    jpeg_decoder: Option<JpegDecoder>,
    h264_encoder: Option<H264Encoder>,
}

impl PipelineLoop {
    pub fn start(config: &PipelineConfig) -> anyhow::Result<Self> {
        // Unknown formats are rejected outright rather than silently
        // coerced to a default — an unsupported `--pixel-format` must fail
        // startup the same way the driver rejecting a known one does.
        let pixel_format = PixelFormat::parse(&config.pixel_format).ok_or_else(|| {
            CaptureError::FormatRejected(format!("unsupported pixel format {:?}", config.pixel_format))
        })?;
        let input_kind = match pixel_format {
            PixelFormat::Mjpeg | PixelFormat::Jpeg => InputKind::Mjpeg,
            _ => InputKind::Raw,
        };

        let mut capture = CaptureDevice::open(
            &config.device,
            config.width,
            config.height,
            pixel_format,
            config.fps,
            config.num_planes,
        )?;
        let width = capture.width();
        let height = capture.height();

        let output_file = config.output.clone().map(|path| OutputFileWriter { path });

        let jpeg_sink = match &config.jpeg_sock {
            Some(path) => Some(MultiSinkPublisher::open(path, true, false)?),
            None => None,
        };
        let mjpeg_sink = match &config.mjpeg_sock {
            Some(path) => Some(MultiSinkPublisher::open(path, false, false)?),
            None => None,
        };
        let h264_sink = match &config.h264_sock {
            Some(path) => Some(MultiSinkPublisher::open(path, false, true)?),
            None => None,
        };

        // The JPEG encoder is only needed when capture hands back raw
        // pixels and something downstream wants JPEG-shaped bytes.
        let jpeg_encoder = match input_kind {
            InputKind::Raw if output_file.is_some() || jpeg_sink.is_some() || mjpeg_sink.is_some() => {
                Some(JpegEncoder::open(&config.device, width, height, pixel_format, config.jpeg_quality)?)
            }
            _ => None,
        };

        // The JPEG decoder is only needed when capture hands back MJPEG
        // bytes and the h264 sink wants raw frames to encode.
        let jpeg_decoder = match input_kind {
            InputKind::Mjpeg if h264_sink.is_some() => {
                Some(JpegDecoder::open(&config.device, width, height)?)
            }
            _ => None,
        };

        // The H.264 encoder's OUTPUT queue must match whatever raw format it
        // is actually fed each iteration. On the raw-capture path that is
        // the capture format; on the MJPEG path it's always the JPEG
        // decoder's own output format (NV12, see `JpegDecoder::open`), not
        // the MJPEG bytes capture produced.
        let h264_input_format = match input_kind {
            InputKind::Raw => pixel_format,
            InputKind::Mjpeg => PixelFormat::Nv12,
        };
        let h264_encoder = if h264_sink.is_some() {
            let rc = RateControl::for_bitrate_kbps(config.h264_bitrate_kbps, config.fps);
            Some(H264Encoder::open(&config.device, width, height, h264_input_format, rc)?)
        } else {
            None
        };

        Ok(PipelineLoop {
            capture,
            input_kind,
            fps: config.fps.max(1),
            frame_limit: config.frames,
            idle: Duration::from_millis(config.idle_ms),
            output_file,
            jpeg_sink,
            mjpeg_sink,
            h264_sink,
            jpeg_encoder,
            jpeg_decoder,
            h264_encoder,
        })
    }

    /// Runs until `frame_limit` is reached, the capture device times out, or
    /// `run_flag` is cleared. `run_flag` is checked once per iteration, at
    /// the top of the loop, so SIGINT/SIGTERM finish the in-flight frame and
    /// tear every sink/codec down normally via `Drop` rather than aborting
    /// mid-frame.
    pub fn run(self, run_flag: &'static AtomicBool) -> anyhow::Result<u64> {
        self.run_inner(run_flag)
    }

    fn run_inner(mut self, run_flag: &'static AtomicBool) -> anyhow::Result<u64> {
        let frame_delay = Duration::from_micros(1_000_000 / self.fps as u64);
        let mut frames_captured: u64 = 0;
        let mut last_frame = Instant::now();
        let mut stats_time = Instant::now();
        let mut frames_this_second = 0u32;
        let mut jpeg_encoded_this_second = 0u32;
        let mut h264_encoded_this_second = 0u32;

        loop {
            if !run_flag.load(Ordering::SeqCst) {
                log::info!("shutdown requested, exiting cleanly");
                break;
            }

            if self.frame_limit > 0 && frames_captured >= self.frame_limit {
                break;
            }

            let frame = match self.capture.read_frame() {
                Ok(f) => f,
                Err(CaptureError::CaptureTimeout) => {
                    log::warn!("capture read timed out, stopping");
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            let data = frame.data[..frame.bytes_used].to_vec();
            CaptureDevice::release(frame);

            if let Some(s) = &mut self.jpeg_sink {
                s.accept_all();
            }
            if let Some(s) = &mut self.mjpeg_sink {
                s.accept_all();
            }
            if let Some(s) = &mut self.h264_sink {
                s.accept_all();
            }

            frames_captured += 1;
            frames_this_second += 1;
            let mut encoded_any = false;

            let jpeg_bytes: Option<Vec<u8>> = match self.input_kind {
                InputKind::Mjpeg => Some(data.clone()),
                InputKind::Raw => {
                    if self.output_file.is_some() || self.jpeg_sink.is_some() || self.mjpeg_sink.is_some() {
                        match self.jpeg_encoder.as_mut().unwrap().encode(&data) {
                            Ok(packet) => Some(packet.data),
                            Err(e) => {
                                log::warn!("jpeg encode failed: {e}");
                                None
                            }
                        }
                    } else {
                        None
                    }
                }
            };

            if let Some(jpeg) = &jpeg_bytes {
                jpeg_encoded_this_second += 1;
                if let Some(w) = &self.output_file {
                    w.write(jpeg);
                    encoded_any = true;
                }
                if let Some(s) = &mut self.jpeg_sink {
                    if s.has_clients() {
                        s.write_frame(jpeg);
                        encoded_any = true;
                    }
                }
                if let Some(s) = &mut self.mjpeg_sink {
                    if s.has_clients() {
                        s.write_frame(jpeg);
                        encoded_any = true;
                    }
                }
            }

            if let Some(sink) = &mut self.h264_sink {
                if sink.has_clients() {
                    let need_keyframe = sink.need_keyframe();
                    let encode_result = match self.input_kind {
                        InputKind::Raw => self
                            .h264_encoder
                            .as_mut()
                            .unwrap()
                            .encode(&data, need_keyframe),
                        InputKind::Mjpeg => self
                            .jpeg_decoder
                            .as_mut()
                            .unwrap()
                            .decode(&data)
                            .and_then(|frame| self.h264_encoder.as_mut().unwrap().encode(&frame.data, need_keyframe)),
                    };

                    match encode_result {
                        Ok(packet) => {
                            sink.write_frame(&packet.data);
                            sink.write_frame(&NAL_AUD_FRAME);
                            sink.clear_need_keyframe();
                            encoded_any = true;
                            h264_encoded_this_second += 1;
                        }
                        Err(CodecError::PacketMissing) => {}
                        Err(e) => log::warn!("h264 encode failed: {e}"),
                    }
                }
            }

            let now = Instant::now();
            if now.duration_since(stats_time) >= Duration::from_secs(1) {
                log::info!(
                    "fps={frames_this_second} total={frames_captured} jpeg={jpeg_encoded_this_second} \
                     h264={h264_encoded_this_second} clients[jpeg={} mjpeg={} h264={}]",
                    self.jpeg_sink.as_ref().map_or(0, |s| s.client_count()),
                    self.mjpeg_sink.as_ref().map_or(0, |s| s.client_count()),
                    self.h264_sink.as_ref().map_or(0, |s| s.client_count()),
                );
                frames_this_second = 0;
                jpeg_encoded_this_second = 0;
                h264_encoded_this_second = 0;
                stats_time = now;
            }

            let frame_elapsed = now.duration_since(last_frame);
            if frame_elapsed < frame_delay {
                std::thread::sleep(frame_delay - frame_elapsed);
            }
            last_frame = Instant::now();

            if !encoded_any && !self.idle.is_zero() {
                std::thread::sleep(self.idle);
            }
        }

        Ok(frames_captured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_write_rename_leaves_no_tmp_file_and_full_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.jpg").to_string_lossy().into_owned();
        let writer = OutputFileWriter { path: path.clone() };

        let jpeg = [0xFFu8, 0xD8, b'x', b'x', b'x', 0xFF, 0xD9];
        writer.write(&jpeg);

        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk, jpeg);
        assert_eq!(&on_disk[..2], &[0xFF, 0xD8]);
        assert_eq!(&on_disk[on_disk.len() - 2..], &[0xFF, 0xD9]);
        assert!(!std::path::Path::new(&format!("{path}.tmp")).exists());
    }

    #[test]
    fn second_write_rename_never_exposes_a_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.jpg").to_string_lossy().into_owned();
        let writer = OutputFileWriter { path: path.clone() };

        writer.write(&[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
        let first = std::fs::read(&path).unwrap();

        writer.write(&[0xFF, 0xD8, 9, 9, 9, 9, 9, 0xFF, 0xD9]);
        let second = std::fs::read(&path).unwrap();

        assert_ne!(first.len(), second.len());
        assert_eq!(&second[..2], &[0xFF, 0xD8]);
        assert_eq!(&second[second.len() - 2..], &[0xFF, 0xD9]);
    }
}
