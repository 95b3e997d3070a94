//! One Nest camera's live media: a receive-only WebRTC session negotiated
//! through the SDM API, depacketized into Opus passthrough packets and
//! Annex-B H.264 access units, kept alive by periodic stream extension.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use audiopus::coder::Decoder as OpusDecoder;
use audiopus::{Channels, SampleRate};
use bytes::Bytes;
use cradle_protocol::VideoFrame;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_remote::TrackRemote;

use super::candidate::{normalize_candidate, strip_candidates};
use super::client::{NestApiError, NestDeviceClient};
use super::depacketize::H264Depacketizer;
use crate::unix_ms;

/// Stream extension cadence. SDM media sessions expire 5 minutes after the
/// last extension; extending at 4 minutes leaves a 60 s margin for a slow
/// or retried extend call. Do not raise this to the full TTL.
const EXTEND_INTERVAL: Duration = Duration::from_secs(240);
/// Consecutive extend failures tolerated before tearing the session down.
const MAX_EXTEND_FAILURES: u32 = 3;
/// Reconnect delays for short-lived sessions.
const RECONNECT_DELAYS_SECS: [u64; 3] = [5, 15, 45];
/// Sessions shorter than this count as failed attempts; longer ones reset
/// the attempt counter.
const MIN_STABLE_CONNECTION: Duration = Duration::from_secs(60);
const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// One depacketized Opus packet plus its decoded PCM for metering.
#[derive(Debug, Clone)]
pub struct NestAudioPacket {
    pub raw_opus: Bytes,
    /// 16-bit signed little-endian, 48 kHz stereo.
    pub pcm: Bytes,
    /// 48 kHz samples per channel covered by the packet.
    pub duration_rtp_units: u32,
}

/// Shared, reference-counted reader for one room's Nest camera. Consumers
/// subscribe to the broadcast channels; lagging subscribers lose old frames
/// rather than stalling the stream.
pub struct NestStreamReader {
    room_id: i32,
    cancel: CancellationToken,
    audio_tx: broadcast::Sender<NestAudioPacket>,
    video_tx: broadcast::Sender<VideoFrame>,
}

impl NestStreamReader {
    pub fn spawn(room_id: i32, device_id: String, client: Arc<NestDeviceClient>) -> Arc<Self> {
        let (audio_tx, _) = broadcast::channel(64);
        let (video_tx, _) = broadcast::channel(64);
        let cancel = CancellationToken::new();

        let reader = Arc::new(Self {
            room_id,
            cancel: cancel.clone(),
            audio_tx: audio_tx.clone(),
            video_tx: video_tx.clone(),
        });

        tokio::spawn(run_reader(
            room_id, device_id, client, audio_tx, video_tx, cancel,
        ));
        reader
    }

    /// Build a reader with live channels but no background task.
    #[cfg(test)]
    pub(crate) fn detached(room_id: i32) -> Arc<Self> {
        let (audio_tx, _) = broadcast::channel(4);
        let (video_tx, _) = broadcast::channel(4);
        Arc::new(Self {
            room_id,
            cancel: CancellationToken::new(),
            audio_tx,
            video_tx,
        })
    }

    pub fn room_id(&self) -> i32 {
        self.room_id
    }

    pub fn subscribe_audio(&self) -> broadcast::Receiver<NestAudioPacket> {
        self.audio_tx.subscribe()
    }

    pub fn subscribe_video(&self) -> broadcast::Receiver<VideoFrame> {
        self.video_tx.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for NestStreamReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_reader(
    room_id: i32,
    device_id: String,
    client: Arc<NestDeviceClient>,
    audio_tx: broadcast::Sender<NestAudioPacket>,
    video_tx: broadcast::Sender<VideoFrame>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        info!(room_id, device_id = %device_id, attempt, "Starting Nest stream session");
        let started = Instant::now();
        match run_session(
            room_id, &device_id, &client, &audio_tx, &video_tx, &cancel,
        )
        .await
        {
            Ok(()) => break,
            Err(e) => {
                if cancel.is_cancelled() {
                    break;
                }
                warn!(room_id, "Nest stream session ended: {e:#}");
                // A connection that stayed up for a while earns a fresh
                // attempt counter.
                if started.elapsed() >= MIN_STABLE_CONNECTION {
                    attempt = 1;
                } else {
                    attempt += 1;
                }
                if attempt > MAX_RECONNECT_ATTEMPTS {
                    error!(
                        room_id,
                        "Nest stream keeps failing, giving up until the room is refreshed"
                    );
                    break;
                }
                let delay =
                    Duration::from_secs(RECONNECT_DELAYS_SECS[(attempt as usize - 1).min(2)]);
                info!(room_id, delay_secs = delay.as_secs(), "Reconnecting Nest stream");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    info!(room_id, "Nest stream reader stopped");
}

/// Lowercase the Opus codec name in rtpmap lines; the SDM endpoint rejects
/// offers advertising `OPUS/48000`.
fn patch_offer_codec_case(sdp: &str) -> String {
    let mut out = sdp
        .lines()
        .map(|line| {
            let line = line.trim_end_matches('\r');
            if line.starts_with("a=rtpmap:") {
                line.replace("OPUS/", "opus/")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\r\n");
    out.push_str("\r\n");
    out
}

fn build_media_engine() -> anyhow::Result<MediaEngine> {
    let mut media_engine = MediaEngine::default();

    // Register ONLY the formats Nest sends. register_default_codecs would
    // invite the camera to negotiate something the passthrough path cannot
    // forward.
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_string(),
                rtcp_feedback: vec![],
            },
            payload_type: 102,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    Ok(media_engine)
}

async fn build_peer_connection() -> anyhow::Result<Arc<RTCPeerConnection>> {
    let mut media_engine = build_media_engine()?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            ..Default::default()
        }],
        ..Default::default()
    };

    Ok(Arc::new(api.new_peer_connection(config).await?))
}

/// Run one negotiated session to completion. Returns Ok(()) only when the
/// reader was cancelled; any other exit is an error for the reconnect loop.
async fn run_session(
    room_id: i32,
    device_id: &str,
    client: &Arc<NestDeviceClient>,
    audio_tx: &broadcast::Sender<NestAudioPacket>,
    video_tx: &broadcast::Sender<VideoFrame>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let pc = build_peer_connection().await?;

    pc.add_transceiver_from_kind(
        RTPCodecType::Audio,
        Some(RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        }),
    )
    .await
    .context("Failed to add audio transceiver")?;
    pc.add_transceiver_from_kind(
        RTPCodecType::Video,
        Some(RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        }),
    )
    .await
    .context("Failed to add video transceiver")?;

    // Nest requires an open data channel alongside the media.
    let _data_channel = pc
        .create_data_channel("data", None)
        .await
        .context("Failed to create data channel")?;

    // Session-fatal peer states wake the keep-alive loop below.
    let (fail_tx, mut fail_rx) = mpsc::channel::<RTCPeerConnectionState>(1);
    pc.on_peer_connection_state_change(Box::new(move |state| {
        match state {
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                let _ = fail_tx.try_send(state);
            }
            _ => {
                debug!(?state, "Nest peer connection state changed");
            }
        }
        Box::pin(async {})
    }));

    let track_audio_tx = audio_tx.clone();
    let track_video_tx = video_tx.clone();
    let track_cancel = cancel.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let audio_tx = track_audio_tx.clone();
        let video_tx = track_video_tx.clone();
        let cancel = track_cancel.clone();
        Box::pin(async move {
            info!(
                kind = ?track.kind(),
                codec = %track.codec().capability.mime_type,
                "Nest track started"
            );
            match track.kind() {
                RTPCodecType::Audio => {
                    tokio::spawn(run_audio_track(track, audio_tx, cancel));
                }
                RTPCodecType::Video => {
                    tokio::spawn(run_video_track(track, video_tx, cancel));
                }
                _ => {}
            }
        })
    }));

    // Offer with full (non-trickle) candidates: the SDM exchange is a
    // single round trip.
    let offer = pc.create_offer(None).await.context("Failed to create offer")?;
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(offer)
        .await
        .context("Failed to set local description")?;
    tokio::select! {
        _ = gather_complete.recv() => {}
        _ = tokio::time::sleep(Duration::from_secs(10)) => {
            warn!(room_id, "ICE gathering timed out, submitting partial offer");
        }
    }
    let local = pc
        .local_description()
        .await
        .context("Local description missing after gathering")?;
    let offer_sdp = patch_offer_codec_case(&local.sdp);

    let session = client.generate_webrtc_stream(device_id, &offer_sdp).await?;
    info!(
        room_id,
        media_session_id = %session.media_session_id,
        "Nest WebRTC stream generated"
    );

    // The answer's candidate lines don't survive the SDP parser; strip them
    // and trickle them in one by one after normalization.
    let stripped = strip_candidates(&session.answer_sdp);
    let answer = RTCSessionDescription::answer(stripped.sdp)
        .context("Failed to parse Nest answer SDP")?;
    pc.set_remote_description(answer)
        .await
        .context("Failed to set remote description")?;

    for remote in &stripped.candidates {
        match normalize_candidate(&remote.candidate) {
            Some(candidate) => {
                let init = RTCIceCandidateInit {
                    candidate,
                    sdp_mid: remote.sdp_mid.clone(),
                    sdp_mline_index: Some(remote.sdp_mline_index),
                    ..Default::default()
                };
                if let Err(e) = pc.add_ice_candidate(init).await {
                    warn!(room_id, candidate = %remote.candidate, "Failed to add Nest candidate: {e}");
                }
            }
            None => {
                warn!(room_id, candidate = %remote.candidate, "Dropping unusable Nest candidate");
            }
        }
    }

    // Keep-alive: extend the media session every 4 minutes, backing off on
    // 429 and tearing down after 3 consecutive failures.
    let mut media_session_id = session.media_session_id.clone();
    let mut extend_failures: u32 = 0;
    let mut next_extend = tokio::time::Instant::now() + EXTEND_INTERVAL;

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            state = fail_rx.recv() => {
                break Err(anyhow::anyhow!("peer connection entered {state:?}"));
            }
            _ = tokio::time::sleep_until(next_extend) => {
                match client.extend_webrtc_stream(device_id, &media_session_id).await {
                    Ok(new_id) => {
                        extend_failures = 0;
                        media_session_id = new_id;
                        next_extend = tokio::time::Instant::now() + EXTEND_INTERVAL;
                        debug!(room_id, "Nest stream extended");
                    }
                    Err(NestApiError::RateLimited { retry_after_seconds }) => {
                        extend_failures += 1;
                        if extend_failures >= MAX_EXTEND_FAILURES {
                            break Err(anyhow::anyhow!(
                                "stream extension rate-limited {extend_failures} times in a row"
                            ));
                        }
                        warn!(
                            room_id,
                            retry_after_seconds,
                            extend_failures,
                            "Nest extension rate-limited, rescheduling"
                        );
                        next_extend = tokio::time::Instant::now()
                            + Duration::from_secs(retry_after_seconds.max(30));
                    }
                    Err(e) => {
                        extend_failures += 1;
                        if extend_failures >= MAX_EXTEND_FAILURES {
                            break Err(anyhow::anyhow!(
                                "stream extension failed {extend_failures} times in a row: {e}"
                            ));
                        }
                        warn!(room_id, extend_failures, "Nest extension failed: {e}");
                        next_extend = tokio::time::Instant::now() + Duration::from_secs(30);
                    }
                }
            }
        }
    };

    // Best-effort shutdown of the cloud session; failure is logged, not
    // propagated.
    if let Err(e) = client.stop_webrtc_stream(device_id, &media_session_id).await {
        warn!(room_id, "stop_webrtc_stream failed: {e}");
    }
    if let Err(e) = pc.close().await {
        warn!(room_id, "Failed to close Nest peer connection: {e}");
    }

    result
}

async fn run_audio_track(
    track: Arc<TrackRemote>,
    audio_tx: broadcast::Sender<NestAudioPacket>,
    cancel: CancellationToken,
) {
    let mut decoder = match OpusDecoder::new(SampleRate::Hz48000, Channels::Stereo) {
        Ok(d) => d,
        Err(e) => {
            error!("Failed to create Opus decoder: {e:?}");
            return;
        }
    };
    // 120 ms stereo at 48 kHz, the largest Opus frame.
    let mut pcm_buf = vec![0i16; 5760 * 2];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = track.read_rtp() => {
                let (packet, _) = match result {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let payload = packet.payload;
                if payload.is_empty() {
                    continue;
                }
                let duration = audiopus::packet::nb_samples(payload.as_ref(), SampleRate::Hz48000)
                    .unwrap_or(960) as u32;
                // Metering needs PCM, but a decode failure must not stall
                // the stream.
                let decoded = match decoder.decode(Some(payload.as_ref()), &mut pcm_buf[..], false) {
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Opus decode failed, dropping frame: {e:?}");
                        continue;
                    }
                };
                let mut pcm = Vec::with_capacity(decoded * 2 * 2);
                for &sample in &pcm_buf[..decoded * 2] {
                    pcm.extend_from_slice(&sample.to_le_bytes());
                }
                let _ = audio_tx.send(NestAudioPacket {
                    raw_opus: payload,
                    pcm: Bytes::from(pcm),
                    duration_rtp_units: duration,
                });
            }
        }
    }
    debug!("Nest audio track loop ended");
}

async fn run_video_track(
    track: Arc<TrackRemote>,
    video_tx: broadcast::Sender<VideoFrame>,
    cancel: CancellationToken,
) {
    let mut depacketizer = H264Depacketizer::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = track.read_rtp() => {
                let (packet, _) = match result {
                    Ok(p) => p,
                    Err(_) => break,
                };
                if let Some(unit) = depacketizer.push(
                    &packet.payload,
                    packet.header.marker,
                    packet.header.timestamp,
                ) {
                    let _ = video_tx.send(VideoFrame::RawH264 {
                        annex_b_data: unit.annex_b,
                        duration_rtp_units: unit.duration_rtp_units,
                        timestamp_ms: unix_ms(),
                    });
                }
            }
        }
    }
    debug!("Nest video track loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_patch_lowercases_opus_rtpmap_only() {
        let sdp = "v=0\r\n\
                   a=rtpmap:111 OPUS/48000/2\r\n\
                   a=fmtp:111 minptime=10;useinbandfec=1\r\n\
                   s=OPUS SESSION\r\n";
        let patched = patch_offer_codec_case(sdp);
        assert!(patched.contains("a=rtpmap:111 opus/48000/2"));
        // Non-rtpmap lines stay untouched.
        assert!(patched.contains("s=OPUS SESSION"));
    }

    #[test]
    fn offer_patch_keeps_lowercase_opus() {
        let sdp = "a=rtpmap:111 opus/48000/2\r\n";
        assert_eq!(patch_offer_codec_case(sdp), sdp);
    }

    #[test]
    fn reconnect_delays_are_cubic() {
        assert_eq!(RECONNECT_DELAYS_SECS, [5, 15, 45]);
        assert_eq!(MIN_STABLE_CONNECTION, Duration::from_secs(60));
    }

    #[test]
    fn detached_reader_stops_on_drop() {
        let reader = NestStreamReader::detached(7);
        assert_eq!(reader.room_id(), 7);
        assert!(!reader.is_stopped());
        let cancel = reader.cancel.clone();
        drop(reader);
        assert!(cancel.is_cancelled());
    }
}
