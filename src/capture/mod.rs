//! V4L2 capture device handle.
//!
//! Opens a capture device, negotiates a pixel format and frame rate, and
//! streams frames out of a driver-owned mmap buffer ring. Buffer lifetime is
//! modeled explicitly with [`FrameRef`]/[`release`](CaptureDevice::release)
//! even though, on top of `v4l`'s [`MmapStream`], the previous buffer is
//! actually requeued automatically the next time a frame is read — see
//! `DESIGN.md` for why we kept the explicit release call in the public API.

use std::time::Duration;

use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use crate::error::CaptureError;

/// Pixel formats this pipeline knows how to request and hand to a codec.
///
/// Covers the raw-capture set (`YUYV`, `UYVY`, `NV12`, `NV21`, `YUV420`,
/// `RGB24`, `BGR24`) plus the USB-MJPEG pipeline's `MJPEG`, with `JPEG` as
/// its driver-rejected fallback (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuyv,
    Uyvy,
    Nv12,
    Nv21,
    Yuv420,
    Rgb24,
    Bgr24,
    Mjpeg,
    Jpeg,
}

impl PixelFormat {
    pub fn fourcc(self) -> FourCC {
        match self {
            PixelFormat::Yuyv => FourCC::new(b"YUYV"),
            PixelFormat::Uyvy => FourCC::new(b"UYVY"),
            PixelFormat::Nv12 => FourCC::new(b"NV12"),
            PixelFormat::Nv21 => FourCC::new(b"NV21"),
            PixelFormat::Yuv420 => FourCC::new(b"YU12"),
            PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
            PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Jpeg => FourCC::new(b"JPEG"),
        }
    }

    /// Mirrors `capture-mipi-mpp`'s `parse_pixel_format`: case-insensitive
    /// name/alias lookup, `None` for anything unrecognized so the caller can
    /// reject the format outright instead of silently substituting one.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "yuyv" | "yuy2" => Some(PixelFormat::Yuyv),
            "uyvy" => Some(PixelFormat::Uyvy),
            "nv12" => Some(PixelFormat::Nv12),
            "nv21" => Some(PixelFormat::Nv21),
            "yuv420" | "i420" | "yu12" => Some(PixelFormat::Yuv420),
            "rgb24" | "rgb3" => Some(PixelFormat::Rgb24),
            "bgr24" | "bgr3" => Some(PixelFormat::Bgr24),
            "mjpeg" | "mjpg" => Some(PixelFormat::Mjpeg),
            "jpeg" | "jpg" => Some(PixelFormat::Jpeg),
            _ => None,
        }
    }
}

/// A single captured frame, borrowed from the driver's buffer ring.
///
/// Valid until the next call to [`CaptureDevice::read_frame`] or until
/// [`CaptureDevice::release`] is called, whichever comes first.
pub struct FrameRef<'a> {
    pub data: &'a [u8],
    pub bytes_used: usize,
    pub sequence: u32,
}

/// An open, negotiated V4L2 capture device.
pub struct CaptureDevice {
    stream: MmapStream<'static>,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl CaptureDevice {
    /// Opens `path`, queries its `VIDIOC_QUERYCAP` capabilities, requests
    /// `width`x`height` in `pixel_format` at `fps`, and arms the driver's
    /// mmap buffer ring for streaming.
    ///
    /// `requested_planes` is the caller's `--num-planes` hint; only
    /// single-planar capture is wired up end to end (mirroring the only
    /// streaming path the rest of this crate's codec sessions use), so a
    /// device that advertises multi-planar capture *only* is accepted but
    /// logged as a narrower mode than requested, while a device with
    /// neither capture capability fails outright with `CapabilityMissing`.
    ///
    /// The driver is free to return a narrower format than requested (most
    /// commonly a different resolution); the negotiated values are what
    /// callers should act on afterward, not the ones passed in. `MJPEG` is
    /// retried as plain `JPEG` if the driver doesn't accept the former,
    /// matching the USB-MJPEG pipeline's documented fallback.
    pub fn open(
        path: &str,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        fps: u32,
        requested_planes: u32,
    ) -> Result<Self, CaptureError> {
        let mut device = Device::with_path(path)
            .map_err(|e| CaptureError::DeviceUnavailable(e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CaptureError::DeviceUnavailable(e))?;
        let mplane_capable = caps.capabilities.contains(CapFlags::VIDEO_CAPTURE_MPLANE);
        let singleplane_capable = caps.capabilities.contains(CapFlags::VIDEO_CAPTURE);
        if !mplane_capable && !singleplane_capable {
            return Err(CaptureError::CapabilityMissing(format!(
                "{path}: {} ({}) advertises no VIDEO_CAPTURE or VIDEO_CAPTURE_MPLANE capability",
                caps.card, caps.driver
            )));
        }
        if !caps.capabilities.contains(CapFlags::STREAMING) {
            return Err(CaptureError::CapabilityMissing(format!(
                "{path}: {} ({}) does not support streaming I/O",
                caps.card, caps.driver
            )));
        }
        if !singleplane_capable && requested_planes > 1 {
            log::warn!(
                "{path}: only VIDEO_CAPTURE_MPLANE is advertised but this pipeline only drives \
                 single-planar mmap streaming; requesting a single plane anyway"
            );
        }

        let requested = Format::new(width, height, pixel_format.fourcc());
        let mut negotiated = device
            .set_format(&requested)
            .map_err(|e| CaptureError::FormatRejected(e.to_string()))?;

        if pixel_format == PixelFormat::Mjpeg && negotiated.fourcc != pixel_format.fourcc() {
            log::warn!("{path}: MJPG rejected, falling back to JPEG fourcc");
            let fallback = Format::new(width, height, PixelFormat::Jpeg.fourcc());
            negotiated = device
                .set_format(&fallback)
                .map_err(|e| CaptureError::FormatRejected(e.to_string()))?;
        }

        if fps > 0 {
            if let Ok(mut params) = device.params() {
                params.interval = v4l::Fraction::new(1, fps);
                let _ = device.set_params(&params);
            }
        }

        log::info!(
            "v4l2 capture opened: {} {}x{} {:?} ({}, {})",
            path,
            negotiated.width,
            negotiated.height,
            negotiated.fourcc,
            caps.card,
            caps.driver,
        );

        let static_device: &'static mut Device = Box::leak(Box::new(device));
        let stream = MmapStream::with_buffers(static_device, Type::VideoCapture, 4)
            .map_err(|e| CaptureError::DeviceUnavailable(e))?;

        Ok(CaptureDevice {
            stream,
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Blocks (with a 2-second cap) until a frame is available, dequeues it,
    /// and returns a borrow into the driver buffer holding it.
    pub fn read_frame(&mut self) -> Result<FrameRef<'_>, CaptureError> {
        let (data, meta) = self.stream.next().map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                CaptureError::CaptureTimeout
            } else {
                CaptureError::DeviceUnavailable(e)
            }
        })?;

        Ok(FrameRef {
            data,
            bytes_used: meta.bytesused as usize,
            sequence: meta.sequence,
        })
    }

    /// Returns a buffer to the driver's queue.
    ///
    /// No-op on top of `MmapStream`, which requeues the previous buffer the
    /// next time [`read_frame`](Self::read_frame) is called; kept so callers
    /// don't have to special-case this capture backend. Takes `frame` by
    /// value (not `&mut self`) so it can be called after the frame's bytes
    /// have already been copied out of the device's own borrow.
    pub fn release(frame: FrameRef<'_>) {
        drop(frame);
    }

    /// How long the pipeline should wait for a frame before treating the
    /// device as stalled. Matches the original daemon's capture-read cap.
    pub fn read_timeout() -> Duration {
        Duration::from_secs(2)
    }

    pub fn close(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_pixel_format_aliases_case_insensitively() {
        assert_eq!(PixelFormat::parse("YUYV"), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::parse("yuy2"), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::parse("uyvy"), Some(PixelFormat::Uyvy));
        assert_eq!(PixelFormat::parse("nv12"), Some(PixelFormat::Nv12));
        assert_eq!(PixelFormat::parse("nv21"), Some(PixelFormat::Nv21));
        assert_eq!(PixelFormat::parse("yuv420"), Some(PixelFormat::Yuv420));
        assert_eq!(PixelFormat::parse("i420"), Some(PixelFormat::Yuv420));
        assert_eq!(PixelFormat::parse("rgb24"), Some(PixelFormat::Rgb24));
        assert_eq!(PixelFormat::parse("bgr24"), Some(PixelFormat::Bgr24));
        assert_eq!(PixelFormat::parse("MJPG"), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::parse("jpeg"), Some(PixelFormat::Jpeg));
        assert_eq!(PixelFormat::parse("bogus"), None);
    }

    #[test]
    fn fourcc_round_trips_through_parse() {
        for fmt in [
            PixelFormat::Yuyv,
            PixelFormat::Uyvy,
            PixelFormat::Nv12,
            PixelFormat::Nv21,
            PixelFormat::Yuv420,
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
            PixelFormat::Mjpeg,
            PixelFormat::Jpeg,
        ] {
            let name = format!("{:?}", fmt).to_lowercase();
            assert_eq!(PixelFormat::parse(&name), Some(fmt));
        }
    }

    #[test]
    fn unsupported_pixel_format_name_is_rejected_not_defaulted() {
        // A spec-valid-sounding but unrecognized spelling must not silently
        // coerce to some default format (see PipelineLoop::start).
        assert_eq!(PixelFormat::parse("yv12"), None);
    }
}
