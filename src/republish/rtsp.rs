//! RTSP republisher: reads already-encoded H.264 access units off a
//! `--h264-sock` and serves them at `rtsp://<host>:<port>/stream`.
//!
//! One shared GStreamer pipeline feeds every client (`appsrc ! h264parse !
//! rtph264pay`), the same "single shared pipeline" design as
//! `cap_rtsp::start_server`, adapted from BGRA-in/encode-here to
//! already-encoded-bytes-in/no-encode. Client admission mirrors
//! `stream-rtsp/main.cpp`'s `close_old_clients` cap.

use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gstreamer::glib::MainLoop;
use gstreamer::prelude::*;
use gstreamer_app::AppSrc;
use gstreamer_rtsp_server::prelude::*;
use gstreamer_rtsp_server::{RTSPMediaFactory, RTSPServer};

use crate::config::RtspArgs;
use crate::framer::AccessUnitFramer;
use crate::republish::connect_upstream;

struct SharedAppSrc {
    appsrc: Option<AppSrc>,
}

pub fn run(args: RtspArgs) -> anyhow::Result<()> {
    gstreamer::init()?;

    let shared = Arc::new(Mutex::new(SharedAppSrc { appsrc: None }));
    let client_count = Arc::new(AtomicUsize::new(0));
    let max_clients = args.max_clients;

    let server = RTSPServer::new();
    server.set_service(&args.rtsp_port.to_string());

    let mounts = server.mount_points().ok_or_else(|| anyhow::anyhow!("no RTSP mount points"))?;
    let factory = RTSPMediaFactory::new();
    factory.set_shared(true);
    factory.set_launch(
        "appsrc name=src is-live=true format=time do-timestamp=true block=true \
         caps=video/x-h264,stream-format=byte-stream,alignment=au ! h264parse ! rtph264pay name=pay0 pt=96 config-interval=1",
    );

    {
        let shared = shared.clone();
        let buffer_size = args.buffer_size;
        factory.connect_media_configure(move |_, media| {
            let pipeline = media.element();
            if let Ok(bin) = pipeline.downcast::<gstreamer::Bin>() {
                if let Some(src) = bin.by_name("src") {
                    if let Ok(appsrc) = src.downcast::<AppSrc>() {
                        appsrc.set_format(gstreamer::Format::Time);
                        appsrc.set_max_bytes(buffer_size as u64);
                        let mut s = shared.lock().unwrap();
                        s.appsrc = Some(appsrc);
                    }
                }
            }
        });
    }

    {
        let client_count = client_count.clone();
        server.connect_client_connected(move |_server, client| {
            let current = client_count.fetch_add(1, Ordering::SeqCst) + 1;
            if current > max_clients {
                log::warn!("rtsp: rejecting client, max {max_clients} reached");
                client.close();
                client_count.fetch_sub(1, Ordering::SeqCst);
            } else {
                log::info!("rtsp: client connected ({current}/{max_clients})");
            }
        });
    }

    mounts.add_factory("/stream", factory);
    let main_context = gstreamer::glib::MainContext::default();
    let _guard = main_context.acquire().map_err(|_| anyhow::anyhow!("failed to acquire glib main context"))?;
    let id = server.attach(Some(&main_context))?;
    let _ = id;

    log::info!("rtsp server listening on rtsp://0.0.0.0:{}/stream", args.rtsp_port);

    let shared_for_reader = shared.clone();
    let h264_sock = args.h264_sock.clone();
    main_context.spawn_local(async move {
        feed_loop(h264_sock, shared_for_reader).await;
    });

    let mainloop = MainLoop::new(Some(&main_context), false);
    mainloop.run();

    Ok(())
}

/// Polls the upstream h264 socket, frames it into access units, and pushes
/// each one into the shared appsrc. Mirrors `h264_read_handler` /
/// `h264_stream_process`, but driven from an async GLib timeout instead of
/// `BasicTaskScheduler`'s background fd handler.
async fn feed_loop(h264_sock: String, shared: Arc<Mutex<SharedAppSrc>>) {
    let mut framer = AccessUnitFramer::new();
    let mut sock = None;
    let mut buf = [0u8; 65536];

    loop {
        if sock.is_none() {
            match connect_upstream(&h264_sock) {
                Ok(s) => {
                    log::info!("rtsp: connected to upstream {h264_sock}");
                    sock = Some(s);
                }
                Err(_) => {
                    gstreamer::glib::timeout_future(std::time::Duration::from_millis(500)).await;
                    continue;
                }
            }
        }

        let s = sock.as_mut().unwrap();
        match s.read(&mut buf) {
            Ok(0) => {
                sock = None;
            }
            Ok(n) => {
                let shared = shared.clone();
                let _ = framer.feed(&buf[..n], |unit| {
                    let guard = shared.lock().unwrap();
                    if let Some(appsrc) = &guard.appsrc {
                        if let Ok(mut gst_buf) = gstreamer::Buffer::with_size(unit.len()) {
                            if let Some(bufw) = gst_buf.get_mut() {
                                if let Ok(mut map) = bufw.map_writable() {
                                    map.as_mut_slice().copy_from_slice(unit);
                                }
                            }
                            let _ = appsrc.push_buffer(gst_buf);
                        }
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                gstreamer::glib::timeout_future(std::time::Duration::from_millis(10)).await;
            }
            Err(_) => {
                sock = None;
            }
        }
    }
}
