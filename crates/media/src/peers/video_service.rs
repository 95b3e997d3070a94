//! Per-peer video distribution: H.264 Annex-B passthrough for Nest rooms,
//! per-peer VP8 encoding for RTSP rooms.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use cradle_protocol::{ServerMessage, StreamSourceType, VideoFrame};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_VP8, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::vp8::Vp8Encoder;
use super::{PeerPush, PushSender, video_key};
use crate::streaming::{StreamingError, SubscriptionId, VideoStreamingService};

/// RTP units per VP8 frame at the fixed 10 fps cap (90 kHz clock).
const VP8_FRAME_RTP_UNITS: u64 = 9_000;
const VIDEO_CLOCK_RATE: u64 = 90_000;

struct VideoPeer {
    key: String,
    room_id: i32,
    pc: Arc<RTCPeerConnection>,
    subscription: SubscriptionId,
    send_task: JoinHandle<()>,
    pending_candidates: std::sync::Mutex<Vec<RTCIceCandidateInit>>,
}

struct Inner {
    streaming: VideoStreamingService,
    connections: Mutex<HashMap<String, Arc<VideoPeer>>>,
    push_tx: PushSender,
}

#[derive(Clone)]
pub struct VideoWebRtcService {
    inner: Arc<Inner>,
}

impl VideoWebRtcService {
    pub fn new(streaming: VideoStreamingService, push_tx: PushSender) -> Self {
        Self {
            inner: Arc::new(Inner {
                streaming,
                connections: Mutex::new(HashMap::new()),
                push_tx,
            }),
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    pub async fn start_stream(
        &self,
        peer_id: &str,
        room_id: i32,
    ) -> Result<String, StreamingError> {
        let room = self
            .inner
            .streaming
            .room(room_id)
            .await
            .ok_or(StreamingError::RoomNotFound(room_id))?;
        if !room.video_ready() {
            return Err(StreamingError::NotStreamable(room_id));
        }
        let key = video_key(peer_id, room_id);
        self.close_key(&key).await;

        let passthrough = room.stream_source_type == StreamSourceType::GoogleNest;
        let pc = super::build_peer_connection(video_media_engine(passthrough)?)
            .await
            .context("Failed to create video peer connection")?;

        let capability = if passthrough {
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: VIDEO_CLOCK_RATE as u32,
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_string(),
                ..Default::default()
            }
        } else {
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: VIDEO_CLOCK_RATE as u32,
                ..Default::default()
            }
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            "video".to_string(),
            format!("cradle-video-{room_id}"),
        ));
        pc.add_transceiver_from_track(
            Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Sendonly,
                send_encodings: vec![],
            }),
        )
        .await
        .context("Failed to add video track")?;

        {
            let push_tx = self.inner.push_tx.clone();
            let peer_id = peer_id.to_string();
            pc.on_ice_candidate(Box::new(move |candidate| {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(json) => {
                            let _ = push_tx.send(PeerPush {
                                peer_id: peer_id.clone(),
                                message: ServerMessage::ReceiveVideoIceCandidate {
                                    room_id,
                                    candidate: json.candidate,
                                    sdp_mid: json.sdp_mid,
                                    sdp_mline_index: json.sdp_mline_index,
                                },
                            });
                        }
                        Err(e) => {
                            warn!("Failed to serialize ICE candidate: {e}");
                        }
                    }
                }
                Box::pin(async {})
            }));
        }

        let log_key = key.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            debug!(key = %log_key, ?state, "Video peer connection state changed");
            Box::pin(async {})
        }));

        let offer = pc
            .create_offer(None)
            .await
            .context("Failed to create offer")?;
        pc.set_local_description(offer.clone())
            .await
            .context("Failed to set local description")?;

        let (frame_tx, frame_rx) = mpsc::channel::<VideoFrame>(8);
        let handler: crate::streaming::VideoHandler = Arc::new(move |frame: &VideoFrame| {
            let _ = frame_tx.try_send(frame.clone());
        });
        let subscription = match self.inner.streaming.subscribe(room_id, handler).await {
            Ok(s) => s,
            Err(e) => {
                let _ = pc.close().await;
                return Err(e);
            }
        };

        let send_task = tokio::spawn(run_send_loop(
            key.clone(),
            frame_rx,
            Arc::clone(&track),
            passthrough,
        ));

        let peer = Arc::new(VideoPeer {
            key: key.clone(),
            room_id,
            pc,
            subscription,
            send_task,
            pending_candidates: std::sync::Mutex::new(Vec::new()),
        });
        self.inner.connections.lock().await.insert(key.clone(), peer);
        info!(key, passthrough, "Video stream started");
        Ok(offer.sdp)
    }

    pub async fn set_remote_description(
        &self,
        peer_id: &str,
        room_id: i32,
        sdp_type: &str,
        sdp: &str,
    ) -> Result<(), StreamingError> {
        let peer = self
            .get(&video_key(peer_id, room_id))
            .await
            .ok_or(StreamingError::RoomNotFound(room_id))?;
        if !sdp_type.eq_ignore_ascii_case("answer") {
            return Err(StreamingError::Other(anyhow::anyhow!(
                "unsupported SDP type {sdp_type:?}, expected \"answer\""
            )));
        }
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .context("Failed to parse SDP answer")?;
        peer.pc
            .set_remote_description(answer)
            .await
            .context("Failed to set remote description")?;

        let pending: Vec<RTCIceCandidateInit> = {
            let mut queue = peer
                .pending_candidates
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            queue.drain(..).collect()
        };
        for init in pending {
            if let Err(e) = peer.pc.add_ice_candidate(init).await {
                warn!(key = %peer.key, "Failed to apply queued ICE candidate: {e}");
            }
        }
        Ok(())
    }

    pub async fn add_ice_candidate(
        &self,
        peer_id: &str,
        room_id: i32,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Result<(), StreamingError> {
        let peer = self
            .get(&video_key(peer_id, room_id))
            .await
            .ok_or(StreamingError::RoomNotFound(room_id))?;
        let init = RTCIceCandidateInit {
            candidate,
            sdp_mid,
            sdp_mline_index,
            ..Default::default()
        };
        if peer.pc.signaling_state() == RTCSignalingState::Stable {
            peer.pc
                .add_ice_candidate(init)
                .await
                .context("Failed to add ICE candidate")?;
        } else {
            peer.pending_candidates
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(init);
        }
        Ok(())
    }

    pub async fn stop_stream(&self, peer_id: &str, room_id: i32) -> Result<(), StreamingError> {
        let key = video_key(peer_id, room_id);
        if !self.inner.connections.lock().await.contains_key(&key) {
            return Err(StreamingError::RoomNotFound(room_id));
        }
        self.close_key(&key).await;
        Ok(())
    }

    pub async fn close_all_for_peer(&self, peer_id: &str) {
        let prefix = format!("{peer_id}_v_");
        let keys: Vec<String> = {
            let connections = self.inner.connections.lock().await;
            connections
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect()
        };
        for key in keys {
            self.close_key(&key).await;
        }
    }

    async fn get(&self, key: &str) -> Option<Arc<VideoPeer>> {
        self.inner.connections.lock().await.get(key).cloned()
    }

    async fn close_key(&self, key: &str) {
        let peer = self.inner.connections.lock().await.remove(key);
        if let Some(peer) = peer {
            self.inner
                .streaming
                .unsubscribe(peer.room_id, peer.subscription)
                .await;
            peer.send_task.abort();
            if let Err(e) = peer.pc.close().await {
                warn!(key, "Peer connection close: {e}");
            }
            info!(key, "Video peer connection closed");
        }
    }
}

fn video_media_engine(passthrough: bool) -> anyhow::Result<MediaEngine> {
    let mut media_engine = MediaEngine::default();
    if passthrough {
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: VIDEO_CLOCK_RATE as u32,
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
    } else {
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: VIDEO_CLOCK_RATE as u32,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;
    }
    Ok(media_engine)
}

async fn run_send_loop(
    key: String,
    mut rx: mpsc::Receiver<VideoFrame>,
    track: Arc<TrackLocalStaticSample>,
    passthrough: bool,
) {
    let mut encoder: Option<Vp8Encoder> = None;
    let mut pts_ns: u64 = 0;
    let mut mismatch_warned = false;

    while let Some(frame) = rx.recv().await {
        match (&frame, passthrough) {
            (
                VideoFrame::RawH264 {
                    annex_b_data,
                    duration_rtp_units,
                    ..
                },
                true,
            ) => {
                let duration = Duration::from_nanos(
                    *duration_rtp_units as u64 * 1_000_000_000 / VIDEO_CLOCK_RATE,
                );
                let sample = Sample {
                    data: annex_b_data.clone(),
                    duration,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    debug!(key, "Video write_sample failed: {e}");
                }
            }
            (
                VideoFrame::I420 {
                    width,
                    height,
                    data,
                    ..
                },
                false,
            ) => {
                // (Re)build the encoder when the frame geometry changes.
                if encoder
                    .as_ref()
                    .is_none_or(|e| e.dimensions() != (*width, *height) || e.has_error())
                {
                    match Vp8Encoder::new(*width, *height) {
                        Ok(e) => encoder = Some(e),
                        Err(e) => {
                            warn!(key, "Failed to create VP8 encoder: {e:#}");
                            encoder = None;
                            continue;
                        }
                    }
                }
                let Some(enc) = encoder.as_ref() else { continue };
                match enc.encode(data, pts_ns) {
                    Ok(encoded_frames) => {
                        for encoded in encoded_frames {
                            let sample = Sample {
                                data: encoded.into(),
                                duration: Duration::from_nanos(
                                    VP8_FRAME_RTP_UNITS * 1_000_000_000 / VIDEO_CLOCK_RATE,
                                ),
                                ..Default::default()
                            };
                            if let Err(e) = track.write_sample(&sample).await {
                                debug!(key, "Video write_sample failed: {e}");
                            }
                        }
                    }
                    Err(e) => warn!(key, "VP8 encode failed: {e:#}"),
                }
                pts_ns += VP8_FRAME_RTP_UNITS * 1_000_000_000 / VIDEO_CLOCK_RATE;
            }
            _ => {
                if !mismatch_warned {
                    warn!(
                        key,
                        passthrough, "Frame variant does not match the room's source type, dropping"
                    );
                    mismatch_warned = true;
                }
            }
        }
    }
    debug!(key, "Video send loop ended");
}
