//! JPEG hardware encoder/decoder sessions.
//!
//! Grounded on `mpp_jpeg_encoder_init`/`mpp_decode_jpeg` (`mpp_enc_ctx.h`,
//! `mpp_dec_ctx.h`). The encoder maps MPP's `jpeg:quant` key onto
//! `V4L2_CID_JPEG_COMPRESSION_QUALITY`. The decoder mirrors MPP's two-port
//! task protocol (poll input, dequeue, submit; poll output, dequeue,
//! resubmit) with the OUTPUT/CAPTURE queue pair `v4l`'s stream API already
//! manages for us.

use v4l::buffer::Type;
use v4l::control::{Control, Value as CtrlValue};
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::{CaptureStream, OutputStream};
use v4l::video::{Capture, Output};
use v4l::{Device, Format, FourCC};

use super::{align_16, map_v4l_error, FrameHandle, PacketHandle};
use crate::capture::PixelFormat;
use crate::error::CodecError;

pub struct JpegEncoder {
    width: u32,
    height: u32,
    output: MmapStream<'static>,
    capture: MmapStream<'static>,
}

impl JpegEncoder {
    pub fn open(
        device_path: &str,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        quality: u32,
    ) -> Result<Self, CodecError> {
        let mut device = Device::with_path(device_path)
            .map_err(|e| CodecError::InitFailed(e.to_string()))?;

        let out_fmt = Format::new(width, height, pixel_format.fourcc());
        Output::set_format(&device, &out_fmt).map_err(|e| CodecError::InitFailed(e.to_string()))?;

        let cap_fmt = Format::new(width, height, FourCC::new(b"MJPG"));
        Capture::set_format(&device, &cap_fmt).map_err(|e| CodecError::InitFailed(e.to_string()))?;

        let _ = device.set_control(Control {
            id: v4l::control::id::JPEG_COMPRESSION_QUALITY,
            value: CtrlValue::Integer(quality as i64),
        });

        let static_device: &'static mut Device = Box::leak(Box::new(device));
        let output = MmapStream::with_buffers(static_device, Type::VideoOutput, 4)
            .map_err(|e| CodecError::InitFailed(e.to_string()))?;
        let capture = MmapStream::with_buffers(static_device, Type::VideoCapture, 4)
            .map_err(|e| CodecError::InitFailed(e.to_string()))?;

        Ok(JpegEncoder { width, height, output, capture })
    }

    pub fn encode(&mut self, data: &[u8]) -> Result<PacketHandle, CodecError> {
        let (out_buf, _meta) = self.output.next().map_err(map_v4l_error)?;
        let copy_len = data.len().min(out_buf.len());
        unsafe {
            let ptr = out_buf.as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, copy_len);
        }

        let (packet, meta) = self.capture.next().map_err(map_v4l_error)?;
        if packet.is_empty() {
            return Err(CodecError::PacketMissing);
        }

        Ok(PacketHandle {
            data: packet[..meta.bytesused as usize].to_vec(),
            is_keyframe: true,
        })
    }
}

pub struct JpegDecoder {
    width: u32,
    height: u32,
    hor_stride: u32,
    ver_stride: u32,
    output: MmapStream<'static>,
    capture: MmapStream<'static>,
}

impl JpegDecoder {
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CodecError> {
        let mut device = Device::with_path(device_path)
            .map_err(|e| CodecError::InitFailed(e.to_string()))?;

        let out_fmt = Format::new(width, height, FourCC::new(b"MJPG"));
        Output::set_format(&device, &out_fmt).map_err(|e| CodecError::InitFailed(e.to_string()))?;

        let cap_fmt = Format::new(width, height, FourCC::new(b"NV12"));
        Capture::set_format(&device, &cap_fmt).map_err(|e| CodecError::InitFailed(e.to_string()))?;

        let static_device: &'static mut Device = Box::leak(Box::new(device));
        let output = MmapStream::with_buffers(static_device, Type::VideoOutput, 4)
            .map_err(|e| CodecError::InitFailed(e.to_string()))?;
        let capture = MmapStream::with_buffers(static_device, Type::VideoCapture, 4)
            .map_err(|e| CodecError::InitFailed(e.to_string()))?;

        Ok(JpegDecoder {
            width,
            height,
            hor_stride: align_16(width),
            ver_stride: align_16(height),
            output,
            capture,
        })
    }

    /// Mirrors `mpp_decode_jpeg`'s poll-input / dequeue / enqueue,
    /// poll-output / dequeue / enqueue pair, collapsed onto `v4l`'s
    /// blocking OUTPUT/CAPTURE stream iterators.
    pub fn decode(&mut self, data: &[u8]) -> Result<FrameHandle, CodecError> {
        let (out_buf, _meta) = self.output.next().map_err(map_v4l_error)?;
        let copy_len = data.len().min(out_buf.len());
        unsafe {
            let ptr = out_buf.as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, copy_len);
        }

        let (frame, meta) = self.capture.next().map_err(map_v4l_error)?;
        if frame.is_empty() {
            return Err(CodecError::PacketMissing);
        }

        Ok(FrameHandle {
            data: frame[..meta.bytesused as usize].to_vec(),
            width: self.width,
            height: self.height,
            hor_stride: self.hor_stride,
            ver_stride: self.ver_stride,
        })
    }
}
