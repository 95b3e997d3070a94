//! Per-peer audio distribution: one send-only peer connection per
//! (peer, room), Opus passthrough for Nest rooms, resample+encode for RTSP
//! rooms, and `audioLevels` data-channel telemetry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use cradle_protocol::{AudioFrame, ServerMessage, StreamSourceType, TelemetryMessage};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::data_channel::RTCDataChannel;
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

use super::opus::{OPUS_CLOCK_RATE, PeerOpusEncoder};
use super::resample::LinearResampler;
use super::{PeerPush, PushSender, audio_key};
use crate::audio::convert;
use crate::streaming::{AudioStreamingService, StreamingError, SubscriptionId};

/// Minimum spacing between audioLevel telemetry messages per connection.
const LEVEL_SEND_INTERVAL: Duration = Duration::from_millis(100);

struct AudioPeer {
    key: String,
    room_id: i32,
    pc: Arc<RTCPeerConnection>,
    data_channel: Arc<RTCDataChannel>,
    dc_open: Arc<AtomicBool>,
    subscription: SubscriptionId,
    send_task: JoinHandle<()>,
    /// ICE candidates received before the remote answer was applied.
    pending_candidates: std::sync::Mutex<Vec<RTCIceCandidateInit>>,
}

struct Inner {
    streaming: AudioStreamingService,
    connections: Mutex<HashMap<String, Arc<AudioPeer>>>,
    push_tx: PushSender,
}

#[derive(Clone)]
pub struct AudioWebRtcService {
    inner: Arc<Inner>,
}

impl AudioWebRtcService {
    pub fn new(streaming: AudioStreamingService, push_tx: PushSender) -> Self {
        let alerts_rx = streaming.subscribe_alerts();
        let inner = Arc::new(Inner {
            streaming,
            connections: Mutex::new(HashMap::new()),
            push_tx,
        });
        tokio::spawn(run_alert_router(alerts_rx, Arc::downgrade(&inner)));
        Self { inner }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    /// Create a fresh peer connection for (peer, room) and return the SDP
    /// offer. Any previous connection under the same key is torn down
    /// first, so Start→Stop→Start always yields a clean session.
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
        if !room.audio_ready() {
            return Err(StreamingError::NotStreamable(room_id));
        }
        let key = audio_key(peer_id, room_id);
        self.close_key(&key).await;

        let pc = super::build_peer_connection(opus_media_engine()?)
            .await
            .context("Failed to create audio peer connection")?;

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                ..Default::default()
            },
            "audio".to_string(),
            format!("cradle-audio-{room_id}"),
        ));
        pc.add_transceiver_from_track(
            Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Sendonly,
                send_encodings: vec![],
            }),
        )
        .await
        .context("Failed to add audio track")?;

        let data_channel = pc
            .create_data_channel("audioLevels", None)
            .await
            .context("Failed to create audioLevels data channel")?;
        let dc_open = Arc::new(AtomicBool::new(false));
        {
            let flag = Arc::clone(&dc_open);
            data_channel.on_open(Box::new(move || {
                flag.store(true, Ordering::Relaxed);
                Box::pin(async {})
            }));
            let flag = Arc::clone(&dc_open);
            data_channel.on_close(Box::new(move || {
                flag.store(false, Ordering::Relaxed);
                Box::pin(async {})
            }));
        }

        // Trickle our candidates to the viewer through the signaling hub.
        {
            let push_tx = self.inner.push_tx.clone();
            let peer_id = peer_id.to_string();
            pc.on_ice_candidate(Box::new(move |candidate| {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(json) => {
                            let _ = push_tx.send(PeerPush {
                                peer_id: peer_id.clone(),
                                message: ServerMessage::ReceiveAudioIceCandidate {
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
            debug!(key = %log_key, ?state, "Audio peer connection state changed");
            Box::pin(async {})
        }));

        let offer = pc
            .create_offer(None)
            .await
            .context("Failed to create offer")?;
        pc.set_local_description(offer.clone())
            .await
            .context("Failed to set local description")?;

        // Route frames through a bounded channel; the subscription handler
        // must never block the reader's dispatch loop.
        let (frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(32);
        let handler: crate::streaming::AudioHandler = Arc::new(move |frame: &AudioFrame| {
            let _ = frame_tx.try_send(frame.clone());
        });
        let subscription = match self.inner.streaming.subscribe(room_id, handler).await {
            Ok(s) => s,
            Err(e) => {
                let _ = pc.close().await;
                return Err(e);
            }
        };

        let passthrough = room.stream_source_type == StreamSourceType::GoogleNest;
        let send_task = tokio::spawn(run_send_loop(
            key.clone(),
            frame_rx,
            Arc::clone(&track),
            Arc::clone(&data_channel),
            Arc::clone(&dc_open),
            passthrough,
        ));

        let peer = Arc::new(AudioPeer {
            key: key.clone(),
            room_id,
            pc,
            data_channel,
            dc_open,
            subscription,
            send_task,
            pending_candidates: std::sync::Mutex::new(Vec::new()),
        });
        self.inner.connections.lock().await.insert(key.clone(), peer);
        info!(key, passthrough, "Audio stream started");
        Ok(offer.sdp)
    }

    /// Apply the viewer's SDP answer, then flush any candidates queued
    /// while the connection was still negotiating.
    pub async fn set_remote_description(
        &self,
        peer_id: &str,
        room_id: i32,
        sdp_type: &str,
        sdp: &str,
    ) -> Result<(), StreamingError> {
        let peer = self
            .get(&audio_key(peer_id, room_id))
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

    /// Apply immediately once signaling is stable, otherwise queue until
    /// the answer lands.
    pub async fn add_ice_candidate(
        &self,
        peer_id: &str,
        room_id: i32,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Result<(), StreamingError> {
        let peer = self
            .get(&audio_key(peer_id, room_id))
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
        let key = audio_key(peer_id, room_id);
        if !self.inner.connections.lock().await.contains_key(&key) {
            return Err(StreamingError::RoomNotFound(room_id));
        }
        self.close_key(&key).await;
        Ok(())
    }

    /// Tear down every audio connection belonging to a disconnected peer.
    pub async fn close_all_for_peer(&self, peer_id: &str) {
        let prefix = format!("{peer_id}_a_");
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

    async fn get(&self, key: &str) -> Option<Arc<AudioPeer>> {
        self.inner.connections.lock().await.get(key).cloned()
    }

    async fn close_key(&self, key: &str) {
        let peer = self.inner.connections.lock().await.remove(key);
        if let Some(peer) = peer {
            // Unsubscribe before touching the peer connection: no frame may
            // reach the track once stop completes.
            self.inner
                .streaming
                .unsubscribe(peer.room_id, peer.subscription)
                .await;
            peer.send_task.abort();
            if let Err(e) = peer.data_channel.close().await {
                debug!(key, "Data channel close: {e}");
            }
            if let Err(e) = peer.pc.close().await {
                warn!(key, "Peer connection close: {e}");
            }
            info!(key, "Audio peer connection closed");
        }
    }
}

fn opus_media_engine() -> anyhow::Result<MediaEngine> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;
    Ok(media_engine)
}

/// Deliver frames to the track and audio levels to the data channel.
/// Passthrough sends the Nest Opus payload as-is; the RTSP path resamples
/// to the Opus clock and encodes 20 ms frames.
async fn run_send_loop(
    key: String,
    mut rx: mpsc::Receiver<AudioFrame>,
    track: Arc<TrackLocalStaticSample>,
    data_channel: Arc<RTCDataChannel>,
    dc_open: Arc<AtomicBool>,
    passthrough: bool,
) {
    let mut last_level_sent: Option<Instant> = None;
    let mut resampler: Option<LinearResampler> = None;
    let mut encoder: Option<PeerOpusEncoder> = None;
    let mut passthrough_warned = false;

    while let Some(frame) = rx.recv().await {
        if passthrough {
            match (&frame.raw_opus, frame.duration_rtp_units) {
                (Some(opus), Some(units)) => {
                    let duration =
                        Duration::from_nanos(units as u64 * 1_000_000_000 / OPUS_CLOCK_RATE as u64);
                    let sample = Sample {
                        data: opus.clone(),
                        duration,
                        ..Default::default()
                    };
                    if let Err(e) = track.write_sample(&sample).await {
                        debug!(key, "Audio write_sample failed: {e}");
                    }
                }
                _ => {
                    if !passthrough_warned {
                        warn!(key, "Opus passthrough expected but frame carries no Opus payload, dropping");
                        passthrough_warned = true;
                    }
                }
            }
        } else {
            let samples = convert::s16le_to_i16(&frame.pcm_data);
            if samples.is_empty() {
                continue;
            }
            let channels = frame.channels.max(1);
            if resampler
                .as_ref()
                .is_none_or(|r| !r.matches(frame.sample_rate, channels))
            {
                resampler = Some(LinearResampler::new(
                    frame.sample_rate,
                    OPUS_CLOCK_RATE,
                    channels,
                ));
                match PeerOpusEncoder::new(OPUS_CLOCK_RATE, channels) {
                    Ok(e) => encoder = Some(e),
                    Err(e) => {
                        warn!(key, "Failed to configure Opus encoder: {e:#}");
                        encoder = None;
                    }
                }
            }
            let (Some(rs), Some(enc)) = (resampler.as_mut(), encoder.as_mut()) else {
                continue;
            };
            let resampled = rs.resample(&samples);
            match enc.encode(&resampled) {
                Ok(packets) => {
                    for (data, samples_per_channel) in packets {
                        let duration = Duration::from_nanos(
                            samples_per_channel as u64 * 1_000_000_000 / OPUS_CLOCK_RATE as u64,
                        );
                        let sample = Sample {
                            data,
                            duration,
                            ..Default::default()
                        };
                        if let Err(e) = track.write_sample(&sample).await {
                            debug!(key, "Audio write_sample failed: {e}");
                        }
                    }
                }
                Err(e) => warn!(key, "Opus encode failed: {e:#}"),
            }
        }

        // Level telemetry, rate-limited per connection.
        if dc_open.load(Ordering::Relaxed)
            && last_level_sent.is_none_or(|t| t.elapsed() >= LEVEL_SEND_INTERVAL)
        {
            let msg = TelemetryMessage::AudioLevel {
                level: frame.audio_level_db,
                timestamp: frame.timestamp_ms,
            };
            if let Ok(json) = serde_json::to_string(&msg)
                && data_channel.send_text(json).await.is_ok()
            {
                last_level_sent = Some(Instant::now());
            }
        }
    }
    debug!(key, "Audio send loop ended");
}

/// Route sound alerts from the streaming service to every open data
/// channel whose key ends with `_a_{room_id}`.
async fn run_alert_router(
    mut alerts_rx: broadcast::Receiver<cradle_protocol::SoundAlert>,
    inner: std::sync::Weak<Inner>,
) {
    loop {
        match alerts_rx.recv().await {
            Ok(alert) => {
                let Some(inner) = inner.upgrade() else { break };
                let suffix = format!("_a_{}", alert.room_id);
                let peers: Vec<Arc<AudioPeer>> = {
                    let connections = inner.connections.lock().await;
                    connections
                        .iter()
                        .filter(|(key, _)| key.ends_with(&suffix))
                        .map(|(_, peer)| Arc::clone(peer))
                        .collect()
                };
                let msg = TelemetryMessage::SoundAlert {
                    level: alert.level_db,
                    threshold: alert.threshold_db,
                    room_id: alert.room_id,
                    timestamp: alert.timestamp_ms,
                };
                let Ok(json) = serde_json::to_string(&msg) else {
                    continue;
                };
                for peer in peers {
                    if !peer.dc_open.load(Ordering::Relaxed) {
                        continue;
                    }
                    if let Err(e) = peer.data_channel.send_text(json.clone()).await {
                        debug!(key = %peer.key, "Sound alert send failed: {e}");
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Alert router lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
