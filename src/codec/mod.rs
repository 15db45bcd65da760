//! Hardware codec sessions.
//!
//! The reference daemon drives Rockchip's MPP library directly through a
//! vendor FFI layer (`mpp_enc_ctx_t` / `mpp_dec_ctx_t`, configured with
//! string-keyed `mpp_enc_cfg_set_s32` calls and a two-port task queue for
//! decode). We don't have an MPP binding crate in this corpus, so each
//! session here drives the same hardware through its V4L2 mem2mem (M2M)
//! device node instead, using `v4l`'s OUTPUT/CAPTURE stream pair and V4L2
//! controls in place of MPP's config keys. The parameters each session
//! negotiates are named after their MPP counterpart in doc comments so the
//! mapping is traceable.

pub mod h264;
pub mod jpeg;

use crate::error::CodecError;

/// 16-pixel stride alignment MPP (and most hardware codecs) require.
pub fn align_16(value: u32) -> u32 {
    (value + 15) & !15
}

/// An encoded packet returned from a codec session.
///
/// Owns its bytes; `Drop` is where the MPP original would call
/// `mpp_packet_deinit` / `mpp_buffer_put`, we just free the `Vec`.
pub struct PacketHandle {
    pub data: Vec<u8>,
    pub is_keyframe: bool,
}

impl Drop for PacketHandle {
    fn drop(&mut self) {
        log::trace!("releasing packet handle ({} bytes)", self.data.len());
    }
}

/// A decoded raw frame returned from a codec session.
pub struct FrameHandle {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub hor_stride: u32,
    pub ver_stride: u32,
}

impl Drop for FrameHandle {
    fn drop(&mut self) {
        log::trace!("releasing frame handle ({}x{})", self.width, self.height);
    }
}

/// Rate-control parameters shared by both the JPEG and H.264 encoders'
/// `rc:*` MPP keys, re-expressed as the V4L2 controls that drive the same
/// hardware rate controller.
#[derive(Debug, Clone, Copy)]
pub struct RateControl {
    pub bitrate_bps: u32,
    pub bitrate_min_bps: u32,
    pub bitrate_max_bps: u32,
    pub gop: u32,
}

impl RateControl {
    /// Mirrors `rc:bps_target/min/max` and `rc:gop` in `mpp_h264_encoder_init`.
    pub fn for_bitrate_kbps(bitrate_kbps: u32, fps: u32) -> Self {
        RateControl {
            bitrate_bps: bitrate_kbps * 1000,
            bitrate_min_bps: bitrate_kbps * 500,
            bitrate_max_bps: bitrate_kbps * 1500,
            gop: fps * 2,
        }
    }
}

/// Maps a failed OUTPUT/CAPTURE queue `next()` call onto the codec error
/// taxonomy. A would-block means the driver had no buffer ready on that
/// queue, i.e. the session's buffer pool is exhausted for this poll cycle;
/// anything else is a harder submit failure.
pub(crate) fn map_v4l_error(e: std::io::Error) -> CodecError {
    if e.kind() == std::io::ErrorKind::WouldBlock {
        CodecError::BufferExhausted
    } else {
        CodecError::SubmitFailed(e.to_string())
    }
}
