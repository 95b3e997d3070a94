//! Signaling hub: one persistent WebSocket per viewer carrying call/result
//! envelopes plus server pushes (trickled ICE, room and settings updates).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use cradle_protocol::{
    CallEnvelope, ClientCall, CradleConfig, ErrorCode, Room, ServerMessage,
};
use cradle_media::nest::{NestApiError, NestDeviceClient};
use cradle_media::peers::{AudioWebRtcService, VideoWebRtcService};
use cradle_media::repo::{RoomRepository, SettingsRepository};
use cradle_media::streaming::{AudioStreamingService, StreamingError, VideoStreamingService};
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Duration, Instant, interval};
use uuid::Uuid;

/// How often the hub pings each viewer socket.
const VIEWER_PING_INTERVAL: Duration = Duration::from_secs(20);

/// A viewer that hasn't ponged within this window is considered gone and
/// its peer connections are torn down.
const VIEWER_PONG_TIMEOUT: Duration = Duration::from_secs(60);

pub struct AppState {
    pub config: CradleConfig,
    pub rooms_repo: Arc<dyn RoomRepository>,
    pub settings_repo: Arc<dyn SettingsRepository>,
    pub audio_streaming: AudioStreamingService,
    pub video_streaming: VideoStreamingService,
    pub audio_rtc: AudioWebRtcService,
    pub video_rtc: VideoWebRtcService,
    pub nest_client: Option<Arc<NestDeviceClient>>,
    /// Outbound sender per connected viewer, keyed by peer id.
    pub connections: Mutex<HashMap<String, mpsc::UnboundedSender<ServerMessage>>>,
    pub started_at: std::time::Instant,
}

impl AppState {
    /// Push a message to one viewer; silently dropped if it disconnected.
    pub async fn push_to(&self, peer_id: &str, message: ServerMessage) {
        let connections = self.connections.lock().await;
        if let Some(tx) = connections.get(peer_id) {
            let _ = tx.send(message);
        }
    }

    /// Push a message to every connected viewer.
    pub async fn broadcast(&self, message: ServerMessage) {
        let connections = self.connections.lock().await;
        for tx in connections.values() {
            let _ = tx.send(message.clone());
        }
    }

    /// Reconcile both streaming services after a room mutation.
    pub async fn refresh_services(&self) {
        if let Err(e) = self.audio_streaming.refresh_rooms().await {
            tracing::error!("Audio room refresh failed: {e:#}");
        }
        if let Err(e) = self.video_streaming.refresh_rooms().await {
            tracing::error!("Video room refresh failed: {e:#}");
        }
    }
}

/// Handle one viewer's WebSocket for its whole lifetime. Disconnect tears
/// down every peer connection the viewer opened.
pub async fn handle_viewer_ws(mut socket: WebSocket, state: Arc<AppState>) {
    let peer_id = Uuid::new_v4().to_string();
    tracing::info!(%peer_id, "Viewer connected");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    state
        .connections
        .lock()
        .await
        .insert(peer_id.clone(), out_tx.clone());

    let mut ping_interval = interval(VIEWER_PING_INTERVAL);
    // interval() fires straight away; skip that tick so the first ping
    // goes out one full interval after connect.
    ping_interval.tick().await;
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > VIEWER_PONG_TIMEOUT {
                    tracing::debug!(%peer_id, "Viewer ping timeout, closing");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            Some(message) = out_rx.recv() => {
                let json = match serde_json::to_string(&message) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!(%peer_id, "Failed to serialize push: {e}");
                        continue;
                    }
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Some(result) = socket.recv() => {
                match result {
                    Ok(Message::Text(text)) => {
                        let response = match serde_json::from_str::<CallEnvelope>(&text) {
                            Ok(envelope) => {
                                dispatch_call(&state, &peer_id, envelope).await
                            }
                            Err(e) => {
                                tracing::warn!(%peer_id, "Invalid viewer message: {e}");
                                ServerMessage::Error {
                                    id: None,
                                    code: ErrorCode::Internal,
                                    message: format!("Invalid message format: {e}"),
                                }
                            }
                        };
                        let _ = out_tx.send(response);
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!(%peer_id, "Viewer WebSocket closed");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(%peer_id, "Viewer WebSocket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            else => break,
        }
    }

    state.connections.lock().await.remove(&peer_id);
    state.audio_rtc.close_all_for_peer(&peer_id).await;
    state.video_rtc.close_all_for_peer(&peer_id).await;
    tracing::info!(%peer_id, "Viewer disconnected, connections cleaned up");
}

fn ok(id: u64, data: Option<serde_json::Value>) -> ServerMessage {
    ServerMessage::Result { id, data }
}

fn err(id: u64, code: ErrorCode, message: impl Into<String>) -> ServerMessage {
    ServerMessage::Error {
        id: Some(id),
        code,
        message: message.into(),
    }
}

fn streaming_err(id: u64, e: StreamingError) -> ServerMessage {
    match e {
        StreamingError::RoomNotFound(_) => err(id, ErrorCode::NotFound, e.to_string()),
        StreamingError::NotStreamable(_) => err(id, ErrorCode::InvalidRoom, e.to_string()),
        StreamingError::Other(inner) => err(id, ErrorCode::Internal, format!("{inner:#}")),
    }
}

fn validated(id: u64, room: &Room) -> Option<ServerMessage> {
    room.validate()
        .err()
        .map(|e| err(id, ErrorCode::InvalidRoom, e.to_string()))
}

async fn dispatch_call(state: &Arc<AppState>, peer_id: &str, envelope: CallEnvelope) -> ServerMessage {
    let id = envelope.id;
    match envelope.call {
        ClientCall::GetRooms => match state.rooms_repo.list().await {
            Ok(rooms) => ok(id, Some(serde_json::json!(rooms))),
            Err(e) => err(id, ErrorCode::Internal, format!("{e:#}")),
        },

        ClientCall::CreateRoom { room } => {
            if let Some(rejection) = validated(id, &room) {
                return rejection;
            }
            match state.rooms_repo.create(room).await {
                Ok(created) => {
                    state.refresh_services().await;
                    state.broadcast(ServerMessage::RoomsUpdated).await;
                    ok(id, Some(serde_json::json!(created)))
                }
                Err(e) => err(id, ErrorCode::Internal, format!("{e:#}")),
            }
        }

        ClientCall::UpdateRoom { room } => {
            if let Some(rejection) = validated(id, &room) {
                return rejection;
            }
            match state.rooms_repo.update(room).await {
                Ok(Some(updated)) => {
                    state.refresh_services().await;
                    state.broadcast(ServerMessage::RoomsUpdated).await;
                    state
                        .broadcast(ServerMessage::ActiveRoomChanged {
                            room: updated.clone(),
                        })
                        .await;
                    ok(id, Some(serde_json::json!(updated)))
                }
                Ok(None) => err(id, ErrorCode::NotFound, "room does not exist"),
                Err(e) => err(id, ErrorCode::Internal, format!("{e:#}")),
            }
        }

        ClientCall::DeleteRoom { room_id } => match state.rooms_repo.delete(room_id).await {
            Ok(deleted) => {
                state.refresh_services().await;
                state.broadcast(ServerMessage::RoomsUpdated).await;
                ok(id, Some(serde_json::json!(deleted)))
            }
            Err(e) => err(id, ErrorCode::Internal, format!("{e:#}")),
        },

        ClientCall::GetAudioSettings | ClientCall::GetGlobalSettings => {
            match state.settings_repo.get().await {
                Ok(settings) => ok(id, Some(serde_json::json!(settings))),
                Err(e) => err(id, ErrorCode::Internal, format!("{e:#}")),
            }
        }

        ClientCall::UpdateAudioSettings { settings } => {
            match state.settings_repo.update(settings.clone()).await {
                Ok(()) => {
                    state.audio_streaming.update_settings(settings).await;
                    state.broadcast(ServerMessage::SettingsUpdated).await;
                    ok(id, None)
                }
                Err(e) => err(id, ErrorCode::Internal, format!("{e:#}")),
            }
        }

        ClientCall::GetNestDevices => match &state.nest_client {
            Some(client) => match client.list_devices().await {
                Ok(devices) => ok(id, Some(serde_json::json!(devices))),
                Err(NestApiError::RateLimited {
                    retry_after_seconds,
                }) => err(
                    id,
                    ErrorCode::RateLimited,
                    format!("SDM rate limit, retry after {retry_after_seconds}s"),
                ),
                Err(e) => err(id, ErrorCode::Internal, e.to_string()),
            },
            None => err(id, ErrorCode::Internal, "Nest is not configured"),
        },

        ClientCall::StartAudioStream { room_id } => {
            match state.audio_rtc.start_stream(peer_id, room_id).await {
                Ok(sdp) => ok(id, Some(serde_json::json!(sdp))),
                Err(e) => streaming_err(id, e),
            }
        }
        ClientCall::SetAudioRemoteDescription {
            room_id,
            sdp_type,
            sdp,
        } => {
            match state
                .audio_rtc
                .set_remote_description(peer_id, room_id, &sdp_type, &sdp)
                .await
            {
                Ok(()) => ok(id, None),
                Err(e) => streaming_err(id, e),
            }
        }
        ClientCall::AddAudioIceCandidate {
            room_id,
            candidate,
            sdp_mid,
            sdp_mline_index,
        } => {
            match state
                .audio_rtc
                .add_ice_candidate(peer_id, room_id, candidate, sdp_mid, sdp_mline_index)
                .await
            {
                Ok(()) => ok(id, None),
                Err(e) => streaming_err(id, e),
            }
        }
        ClientCall::StopAudioStream { room_id } => {
            match state.audio_rtc.stop_stream(peer_id, room_id).await {
                Ok(()) => ok(id, None),
                Err(e) => streaming_err(id, e),
            }
        }

        ClientCall::StartVideoStream { room_id } => {
            match state.video_rtc.start_stream(peer_id, room_id).await {
                Ok(sdp) => ok(id, Some(serde_json::json!(sdp))),
                Err(e) => streaming_err(id, e),
            }
        }
        ClientCall::SetVideoRemoteDescription {
            room_id,
            sdp_type,
            sdp,
        } => {
            match state
                .video_rtc
                .set_remote_description(peer_id, room_id, &sdp_type, &sdp)
                .await
            {
                Ok(()) => ok(id, None),
                Err(e) => streaming_err(id, e),
            }
        }
        ClientCall::AddVideoIceCandidate {
            room_id,
            candidate,
            sdp_mid,
            sdp_mline_index,
        } => {
            match state
                .video_rtc
                .add_ice_candidate(peer_id, room_id, candidate, sdp_mid, sdp_mline_index)
                .await
            {
                Ok(()) => ok(id, None),
                Err(e) => streaming_err(id, e),
            }
        }
        ClientCall::StopVideoStream { room_id } => {
            match state.video_rtc.stop_stream(peer_id, room_id).await {
                Ok(()) => ok(id, None),
                Err(e) => streaming_err(id, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_error_maps_to_error_codes() {
        let msg = streaming_err(1, StreamingError::RoomNotFound(9));
        assert!(matches!(
            msg,
            ServerMessage::Error {
                id: Some(1),
                code: ErrorCode::NotFound,
                ..
            }
        ));

        let msg = streaming_err(2, StreamingError::NotStreamable(9));
        assert!(matches!(
            msg,
            ServerMessage::Error {
                code: ErrorCode::InvalidRoom,
                ..
            }
        ));

        let msg = streaming_err(3, StreamingError::Other(anyhow::anyhow!("boom")));
        assert!(matches!(
            msg,
            ServerMessage::Error {
                code: ErrorCode::Internal,
                ..
            }
        ));
    }

    #[test]
    fn invalid_room_is_rejected_before_repo() {
        let room = Room {
            id: 1,
            name: "broken".to_string(),
            stream_source_type: cradle_protocol::StreamSourceType::Rtsp,
            enable_audio_stream: true,
            enable_video_stream: false,
            camera_stream_url: None,
            camera_credentials: None,
            nest_device_id: None,
        };
        let rejection = validated(5, &room).expect("invalid room must be rejected");
        assert!(matches!(
            rejection,
            ServerMessage::Error {
                id: Some(5),
                code: ErrorCode::InvalidRoom,
                ..
            }
        ));
    }
}
