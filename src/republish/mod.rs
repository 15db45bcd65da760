//! Shared plumbing for the RTSP and WebRTC republisher binaries.
//!
//! Both binaries subscribe to a `--h264-sock` access-unit stream produced
//! by `vidpipe-capture` and fan each unit out to their own client set. The
//! "one pending buffer per subscriber, drop on overflow" adapter here is
//! grounded on `stream-rtsp/main.cpp`'s `DynamicH264Stream`.

pub mod rtsp;
pub mod webrtc;

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A single pending access unit, shared between the framer's read loop and
/// whichever subscriber hasn't yet drained it.
pub type SharedUnit = Arc<Vec<u8>>;

/// One subscriber's single-slot mailbox. `send` drops the new unit (and
/// counts it) if the previous one hasn't been collected yet, mirroring
/// `DynamicH264Stream::sendNewFrame`'s "previous frame not sent yet" guard.
/// Unlike the live555 original's chunked `doGetNextFrame` pull (bounded by
/// `fMaxSize`), subscribers here pull one whole access unit at a time, which
/// is what `TrackLocalStaticSample::write_sample` expects.
pub struct FrameSourceAdapter {
    pending: Mutex<Option<SharedUnit>>,
    dropped: AtomicU64,
}

impl FrameSourceAdapter {
    pub fn new() -> Self {
        FrameSourceAdapter { pending: Mutex::new(None), dropped: AtomicU64::new(0) }
    }

    pub fn send(&self, unit: &SharedUnit) {
        let mut slot = self.pending.lock();
        if slot.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        *slot = Some(unit.clone());
    }

    /// Takes the pending unit, if any, leaving the slot empty.
    pub fn take(&self) -> Option<SharedUnit> {
        self.pending.lock().take()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for FrameSourceAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens (or re-opens, if the writer side restarted) the upstream h264
/// socket. Mirrors `h264_stream_open_or_close`'s lazy connect.
pub fn connect_upstream(path: &str) -> std::io::Result<UnixStream> {
    let stream = UnixStream::connect(path)?;
    stream.set_nonblocking(true)?;
    Ok(stream)
}
