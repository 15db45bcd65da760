//! Error taxonomy for the capture/codec/sink/framer subsystems (spec §7).

use thiserror::Error;

/// Errors from opening or driving the V4L2 capture device.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(#[from] std::io::Error),

    #[error("device lacks required capability: {0}")]
    CapabilityMissing(String),

    #[error("device rejected requested format: {0}")]
    FormatRejected(String),

    #[error("capture read timed out")]
    CaptureTimeout,
}

/// Errors from the hardware codec handle.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("codec session init failed: {0}")]
    InitFailed(String),

    #[error("codec buffer pool exhausted")]
    BufferExhausted,

    #[error("codec submit failed: {0}")]
    SubmitFailed(String),

    #[error("codec produced no packet")]
    PacketMissing,
}

/// Errors from the multi-sink publisher. Most are scoped to one client and
/// recovered by closing that client; see `vidpipe::sink`.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to bind endpoint {path}: {source}")]
    EndpointBindFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to listen on endpoint {path}: {source}")]
    EndpointListenFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("client write timed out")]
    ClientWriteTimeout,

    #[error("client write error: {0}")]
    ClientWriteError(std::io::Error),

    #[error("client idle timeout")]
    ClientIdleTimeout,

    #[error("no free client slot")]
    ClientSlotExhausted,
}

/// Errors from the access-unit framer.
#[derive(Error, Debug)]
pub enum FramerError {
    #[error("buffer overflowed MAX_FRAME_SIZE, discarding partial unit")]
    ParseOverflow,

    #[error("input closed before a complete access unit was seen")]
    ShortReadEof,
}
