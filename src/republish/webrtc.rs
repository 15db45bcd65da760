//! WebRTC republisher: reads access units off a `--h264-sock` and republishes
//! them as H.264 RTP samples to any number of browser peers, signaled over a
//! local Unix socket with newline-delimited JSON.
//!
//! Signaling message shapes (`type` field) match `stream-webrtc/main.cpp`'s
//! `handle_request`: `request` (server creates the offer), `offer`
//! (client-initiated, server answers), `answer` (client's SDP answer to a
//! server-initiated offer), `remote_candidate` (trickled ICE). The peer
//! connection itself is built with `webrtc-rs`, matching
//! `streaming/webrtc_streamer.rs`'s `MediaEngine`/`APIBuilder`/H.264 track
//! setup, re-targeted from WebSocket+TCP to one-shot-per-line Unix sockets.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::ReentrantMutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cell::RefCell;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::WebRtcArgs;
use crate::framer::AccessUnitFramer;
use crate::republish::{connect_upstream, FrameSourceAdapter, SharedUnit};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SignalRequest {
    Request {
        #[serde(default)]
        timeout_s: Option<u64>,
    },
    Offer {
        sdp: String,
    },
    Answer {
        id: String,
        sdp: String,
    },
    RemoteCandidate {
        id: String,
        #[serde(default)]
        candidate: Option<String>,
        #[serde(default)]
        candidates: Option<Vec<String>>,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum SignalResponse {
    Offer { r#type: &'static str, id: String, sdp: String },
    Answer { r#type: &'static str, id: String, sdp: String },
    Ok { r#type: &'static str },
    Error { error: String },
}

struct ClientState {
    pc: Arc<RTCPeerConnection>,
    adapter: Arc<FrameSourceAdapter>,
}

type ClientMap = ReentrantMutex<RefCell<HashMap<String, ClientState>>>;

pub fn run(args: WebRtcArgs) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(run_async(args))
}

async fn run_async(args: WebRtcArgs) -> anyhow::Result<()> {
    let _ = std::fs::remove_file(&args.webrtc_sock);
    let listener = UnixListener::bind(&args.webrtc_sock)?;
    listener.set_nonblocking(true)?;

    let clients: Arc<ClientMap> = Arc::new(ReentrantMutex::new(RefCell::new(HashMap::new())));
    let next_id = Arc::new(AtomicU64::new(1));

    let fanout_clients = clients.clone();
    let h264_sock = args.h264_sock.clone();
    tokio::spawn(async move {
        fanout_loop(h264_sock, fanout_clients).await;
    });

    log::info!("webrtc signaling listening on {}", args.webrtc_sock);

    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                let clients = clients.clone();
                let next_id = next_id.clone();
                let stun = args.stun.clone();
                let max_clients = args.max_clients;
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = handle_connection(stream, clients, next_id, stun, max_clients) {
                        log::warn!("webrtc: connection handler error: {e}");
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => {
                log::warn!("webrtc: accept error: {e}");
            }
        }
    }
}

/// Handles exactly one newline-delimited-JSON request on `stream`, matching
/// the original daemon's one-shot-per-connection signaling style.
fn handle_connection(
    stream: UnixStream,
    clients: Arc<ClientMap>,
    next_id: Arc<AtomicU64>,
    stun: Vec<String>,
    max_clients: usize,
) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    let response = match parse_request(line.trim()) {
        Ok(request) => handle_request(request, &clients, &next_id, &stun, max_clients),
        Err(resp) => resp,
    };

    let mut out = stream;
    let body = serde_json::to_string(&response)?;
    out.write_all(body.as_bytes())?;
    out.write_all(b"\n")?;
    Ok(())
}

/// Parses one signaling line into a [`SignalRequest`], by hand rather than
/// through `SignalRequest`'s derived `Deserialize`, so malformed JSON, an
/// unrecognized `type`, or a request missing a field it needs produces the
/// matching error response instead of dropping the connection.
fn parse_request(line: &str) -> Result<SignalRequest, SignalResponse> {
    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|_| SignalResponse::Error { error: "unknown type".to_owned() })?;

    let ty = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
    let str_field = |key: &str| value.get(key).and_then(|v| v.as_str()).map(str::to_owned);

    match ty {
        "request" => Ok(SignalRequest::Request {
            timeout_s: value.get("timeout_s").and_then(|v| v.as_u64()),
        }),
        "offer" => match str_field("sdp") {
            Some(sdp) => Ok(SignalRequest::Offer { sdp }),
            None => Err(SignalResponse::Error { error: "missing id or sdp".to_owned() }),
        },
        "answer" => match (str_field("id"), str_field("sdp")) {
            (Some(id), Some(sdp)) => Ok(SignalRequest::Answer { id, sdp }),
            _ => Err(SignalResponse::Error { error: "missing id or sdp".to_owned() }),
        },
        "remote_candidate" => match str_field("id") {
            Some(id) => {
                let candidates = value
                    .get("candidates")
                    .and_then(|v| v.as_array())
                    .map(|arr| arr.iter().filter_map(|c| c.as_str().map(str::to_owned)).collect());
                Ok(SignalRequest::RemoteCandidate { id, candidate: str_field("candidate"), candidates })
            }
            None => Err(SignalResponse::Error { error: "missing id".to_owned() }),
        },
        _ => Err(SignalResponse::Error { error: "unknown type".to_owned() }),
    }
}

fn handle_request(
    request: SignalRequest,
    clients: &Arc<ClientMap>,
    next_id: &Arc<AtomicU64>,
    stun: &[String],
    max_clients: usize,
) -> SignalResponse {
    let rt = tokio::runtime::Handle::try_current();
    let exec = |fut| match rt {
        Ok(handle) => handle.block_on(fut),
        Err(_) => tokio::runtime::Runtime::new().unwrap().block_on(fut),
    };

    match request {
        SignalRequest::Request { .. } => exec(async_create_offer(clients.clone(), next_id.clone(), stun.to_vec(), max_clients)),
        SignalRequest::Offer { sdp } => exec(async_create_answer(clients.clone(), next_id.clone(), stun.to_vec(), max_clients, sdp)),
        SignalRequest::Answer { id, sdp } => exec(async_set_answer(clients.clone(), id, sdp)),
        SignalRequest::RemoteCandidate { id, candidate, candidates } => {
            exec(async_add_candidates(clients.clone(), id, candidate, candidates))
        }
    }
}

fn build_peer_connection_api() -> anyhow::Result<webrtc::api::API> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                    .to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: 102,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;
    Ok(APIBuilder::new().with_media_engine(media_engine).build())
}

async fn new_client(
    clients: &Arc<ClientMap>,
    next_id: &Arc<AtomicU64>,
    stun: &[String],
    max_clients: usize,
) -> anyhow::Result<(String, Arc<RTCPeerConnection>, Arc<TrackLocalStaticSample>)> {
    let count = {
        let guard = clients.lock();
        guard.borrow().len()
    };
    if count >= max_clients {
        anyhow::bail!("max clients reached");
    }

    let api = build_peer_connection_api()?;
    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: stun.to_vec(),
            ..Default::default()
        }],
        ..Default::default()
    };
    let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            ..Default::default()
        },
        "video".to_owned(),
        "vidpipe".to_owned(),
    ));
    pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>).await?;

    let id = format!("client-{}", next_id.fetch_add(1, Ordering::SeqCst));
    let adapter = Arc::new(FrameSourceAdapter::new());

    {
        let guard = clients.lock();
        guard.borrow_mut().insert(id.clone(), ClientState { pc: pc.clone(), adapter: adapter.clone() });
    }

    spawn_sample_pump(id.clone(), clients.clone(), adapter, track.clone());

    Ok((id, pc, track))
}

/// Drains one client's `FrameSourceAdapter` and writes each access unit as
/// an RTP sample, until the client is removed from `clients`.
fn spawn_sample_pump(
    id: String,
    clients: Arc<ClientMap>,
    adapter: Arc<FrameSourceAdapter>,
    track: Arc<TrackLocalStaticSample>,
) {
    tokio::spawn(async move {
        loop {
            let still_present = {
                let guard = clients.lock();
                guard.borrow().contains_key(&id)
            };
            if !still_present {
                break;
            }

            match adapter.take() {
                Some(unit) => {
                    let sample = Sample {
                        data: bytes::Bytes::copy_from_slice(&unit),
                        duration: Duration::from_millis(33),
                        ..Default::default()
                    };
                    if track.write_sample(&sample).await.is_err() {
                        break;
                    }
                }
                None => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    });
}

async fn async_create_offer(
    clients: Arc<ClientMap>,
    next_id: Arc<AtomicU64>,
    stun: Vec<String>,
    max_clients: usize,
) -> SignalResponse {
    match new_client(&clients, &next_id, &stun, max_clients).await {
        Ok((id, pc, _track)) => match pc.create_offer(None).await {
            Ok(offer) => {
                if let Err(e) = pc.set_local_description(offer.clone()).await {
                    return SignalResponse::Error { error: e.to_string() };
                }
                SignalResponse::Offer { r#type: "offer", id, sdp: offer.sdp }
            }
            Err(_) => SignalResponse::Error { error: "failed to create offer".to_owned() },
        },
        Err(e) => SignalResponse::Error { error: e.to_string() },
    }
}

async fn async_create_answer(
    clients: Arc<ClientMap>,
    next_id: Arc<AtomicU64>,
    stun: Vec<String>,
    max_clients: usize,
    sdp: String,
) -> SignalResponse {
    match new_client(&clients, &next_id, &stun, max_clients).await {
        Ok((id, pc, _track)) => {
            let offer = match RTCSessionDescription::offer(sdp) {
                Ok(o) => o,
                Err(e) => return SignalResponse::Error { error: e.to_string() },
            };
            if let Err(e) = pc.set_remote_description(offer).await {
                return SignalResponse::Error { error: e.to_string() };
            }
            match pc.create_answer(None).await {
                Ok(answer) => {
                    if let Err(e) = pc.set_local_description(answer.clone()).await {
                        return SignalResponse::Error { error: e.to_string() };
                    }
                    SignalResponse::Answer { r#type: "answer", id, sdp: answer.sdp }
                }
                Err(_) => SignalResponse::Error { error: "failed to create answer".to_owned() },
            }
        }
        Err(e) => SignalResponse::Error { error: e.to_string() },
    }
}

async fn async_set_answer(clients: Arc<ClientMap>, id: String, sdp: String) -> SignalResponse {
    let pc = {
        let guard = clients.lock();
        guard.borrow().get(&id).map(|c| c.pc.clone())
    };
    match pc {
        Some(pc) => {
            let answer = match RTCSessionDescription::answer(sdp) {
                Ok(a) => a,
                Err(e) => return SignalResponse::Error { error: e.to_string() },
            };
            match pc.set_remote_description(answer).await {
                Ok(()) => SignalResponse::Ok { r#type: "ok" },
                Err(e) => SignalResponse::Error { error: e.to_string() },
            }
        }
        None => SignalResponse::Error { error: "client not found".to_owned() },
    }
}

async fn async_add_candidates(
    clients: Arc<ClientMap>,
    id: String,
    candidate: Option<String>,
    candidates: Option<Vec<String>>,
) -> SignalResponse {
    let pc = {
        let guard = clients.lock();
        guard.borrow().get(&id).map(|c| c.pc.clone())
    };
    let pc = match pc {
        Some(pc) => pc,
        None => return SignalResponse::Error { error: format!("unknown client {id}") },
    };

    let mut all = candidates.unwrap_or_default();
    if let Some(c) = candidate {
        all.push(c);
    }

    for cand in all {
        let init = RTCIceCandidateInit { candidate: cand, ..Default::default() };
        if let Err(e) = pc.add_ice_candidate(init).await {
            return SignalResponse::Error { error: e.to_string() };
        }
    }

    SignalResponse::Ok { r#type: "ok" }
}

/// Reads the upstream h264 socket, frames it into access units, and fans
/// each one out to every connected client's `FrameSourceAdapter`.
async fn fanout_loop(h264_sock: String, clients: Arc<ClientMap>) {
    let mut framer = AccessUnitFramer::new();
    let mut sock: Option<UnixStream> = None;
    let mut buf = [0u8; 65536];

    loop {
        if sock.is_none() {
            match connect_upstream(&h264_sock) {
                Ok(s) => sock = Some(s),
                Err(_) => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            }
        }

        let s = sock.as_mut().unwrap();
        match s.read(&mut buf) {
            Ok(0) => sock = None,
            Ok(n) => {
                let clients = clients.clone();
                let _ = framer.feed(&buf[..n], |unit| {
                    let shared: SharedUnit = Arc::new(unit.to_vec());
                    let guard = clients.lock();
                    for client in guard.borrow().values() {
                        client.adapter.send(&shared);
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(_) => sock = None,
        }
    }
}
