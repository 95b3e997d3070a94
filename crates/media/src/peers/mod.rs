//! Per-peer WebRTC distribution: one peer connection per (peer, room) for
//! audio and video each, fed by subscriptions to the streaming services.

pub mod audio_service;
pub mod opus;
pub mod resample;
pub mod video_service;
pub mod vp8;

pub use audio_service::AudioWebRtcService;
pub use video_service::VideoWebRtcService;

use cradle_protocol::ServerMessage;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;

/// A server→client push routed to one peer's signaling connection.
#[derive(Debug, Clone)]
pub struct PeerPush {
    pub peer_id: String,
    pub message: ServerMessage,
}

pub type PushSender = tokio::sync::mpsc::UnboundedSender<PeerPush>;

/// Audio connections are keyed `{peer}_a_{room}`.
pub fn audio_key(peer_id: &str, room_id: i32) -> String {
    format!("{peer_id}_a_{room_id}")
}

/// Video connections are keyed `{peer}_v_{room}`.
pub fn video_key(peer_id: &str, room_id: i32) -> String {
    format!("{peer_id}_v_{room_id}")
}

/// Build a peer connection with the service-wide transport policy: one
/// public STUN server, everything bundled on a single transport.
pub(crate) async fn build_peer_connection(
    mut media_engine: MediaEngine,
) -> anyhow::Result<std::sync::Arc<RTCPeerConnection>> {
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
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    };

    Ok(std::sync::Arc::new(api.new_peer_connection(config).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_embed_peer_kind_and_room() {
        assert_eq!(audio_key("peer-1", 3), "peer-1_a_3");
        assert_eq!(video_key("peer-1", 3), "peer-1_v_3");
    }

    #[test]
    fn audio_and_video_keyspaces_are_disjoint() {
        assert_ne!(audio_key("p", 1), video_key("p", 1));
    }

    #[test]
    fn key_prefix_selects_one_peer_only() {
        let keys = [
            audio_key("alice", 1),
            audio_key("alice", 2),
            audio_key("alice-2", 1),
            video_key("alice", 1),
        ];
        let prefix = "alice_a_";
        let matching: Vec<_> = keys.iter().filter(|k| k.starts_with(prefix)).collect();
        assert_eq!(matching.len(), 2);
    }

    #[test]
    fn key_suffix_selects_one_room_only() {
        let keys = [
            audio_key("alice", 1),
            audio_key("bob", 1),
            audio_key("carol", 11),
        ];
        let suffix = "_a_1";
        let matching: Vec<_> = keys.iter().filter(|k| k.ends_with(suffix)).collect();
        assert_eq!(matching.len(), 2, "room 11 must not match room 1");
    }
}
