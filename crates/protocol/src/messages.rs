use serde::{Deserialize, Serialize};

use crate::room::{GlobalSettings, Room};

/// A client→server call on the signaling channel. Each call is answered on
/// the same channel with a `ServerMessage::Result` or `ServerMessage::Error`
/// carrying the envelope id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCall {
    GetRooms,
    CreateRoom {
        room: Room,
    },
    UpdateRoom {
        room: Room,
    },
    DeleteRoom {
        room_id: i32,
    },
    GetAudioSettings,
    GetGlobalSettings,
    UpdateAudioSettings {
        settings: GlobalSettings,
    },
    GetNestDevices,
    StartAudioStream {
        room_id: i32,
    },
    SetAudioRemoteDescription {
        room_id: i32,
        sdp_type: String,
        sdp: String,
    },
    AddAudioIceCandidate {
        room_id: i32,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    },
    StopAudioStream {
        room_id: i32,
    },
    StartVideoStream {
        room_id: i32,
    },
    SetVideoRemoteDescription {
        room_id: i32,
        sdp_type: String,
        sdp: String,
    },
    AddVideoIceCandidate {
        room_id: i32,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    },
    StopVideoStream {
        room_id: i32,
    },
}

/// Wire envelope for a client call: the call's fields plus a client-chosen
/// id echoed in the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub call: ClientCall,
}

/// Error classification surfaced on failed calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    InvalidRoom,
    RateLimited,
    Internal,
}

/// Server→client messages: call results, call errors, and unsolicited pushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Result {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        code: ErrorCode,
        message: String,
    },
    ReceiveAudioIceCandidate {
        room_id: i32,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    },
    ReceiveVideoIceCandidate {
        room_id: i32,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    },
    RoomsUpdated,
    ActiveRoomChanged {
        room: Room,
    },
    SettingsUpdated,
}

/// Telemetry sent on the `audioLevels` data channel. Field names are part of
/// the browser contract and stay camelCase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TelemetryMessage {
    #[serde(rename = "audioLevel")]
    AudioLevel { level: f32, timestamp: u64 },
    #[serde(rename = "soundAlert")]
    SoundAlert {
        level: f32,
        threshold: f32,
        #[serde(rename = "roomId")]
        room_id: i32,
        timestamp: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::StreamSourceType;

    #[test]
    fn call_envelope_roundtrip() {
        let envelope = CallEnvelope {
            id: 7,
            call: ClientCall::StartAudioStream { room_id: 3 },
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""type":"start_audio_stream""#));
        assert!(json.contains(r#""id":7"#));
        assert!(json.contains(r#""room_id":3"#));

        let parsed: CallEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, 7);
        match parsed.call {
            ClientCall::StartAudioStream { room_id } => assert_eq!(room_id, 3),
            other => panic!("expected StartAudioStream, got {other:?}"),
        }
    }

    #[test]
    fn call_from_browser_format() {
        let browser_json = r#"{
            "type": "add_audio_ice_candidate",
            "id": 12,
            "room_id": 1,
            "candidate": "candidate:1 1 udp 2130706431 192.168.1.1 50000 typ host",
            "sdp_mid": "0",
            "sdp_mline_index": 0
        }"#;
        let envelope: CallEnvelope = serde_json::from_str(browser_json).unwrap();
        match envelope.call {
            ClientCall::AddAudioIceCandidate {
                room_id,
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                assert_eq!(room_id, 1);
                assert!(candidate.starts_with("candidate:"));
                assert_eq!(sdp_mid.as_deref(), Some("0"));
                assert_eq!(sdp_mline_index, Some(0));
            }
            other => panic!("expected AddAudioIceCandidate, got {other:?}"),
        }
    }

    #[test]
    fn update_room_carries_full_room() {
        let envelope = CallEnvelope {
            id: 2,
            call: ClientCall::UpdateRoom {
                room: Room {
                    id: 4,
                    name: "Nursery".to_string(),
                    stream_source_type: StreamSourceType::Rtsp,
                    enable_audio_stream: true,
                    enable_video_stream: true,
                    camera_stream_url: Some("rtsp://cam/1".to_string()),
                    camera_credentials: None,
                    nest_device_id: None,
                },
            },
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""type":"update_room""#));
        assert!(json.contains(r#""stream_source_type":"rtsp""#));
        let _: CallEnvelope = serde_json::from_str(&json).unwrap();
    }

    #[test]
    fn result_without_data_omits_field() {
        let msg = ServerMessage::Result { id: 9, data: None };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"result","id":9}"#);
    }

    #[test]
    fn error_is_snake_case_with_code() {
        let msg = ServerMessage::Error {
            id: Some(4),
            code: ErrorCode::NotFound,
            message: "no audio connection for room 9".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""code":"not_found""#));
    }

    #[test]
    fn ice_push_roundtrip() {
        let msg = ServerMessage::ReceiveAudioIceCandidate {
            room_id: 5,
            candidate: "candidate:1 1 udp 2130706431 10.0.0.1 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let json = serde_json::to_string(&msg).unwrap();
        // Must be snake_case, NOT kebab-case
        assert!(json.contains(r#""type":"receive_audio_ice_candidate""#));
        assert!(!json.contains("receive-audio"));
        let _: ServerMessage = serde_json::from_str(&json).unwrap();
    }

    #[test]
    fn audio_level_telemetry_shape() {
        let msg = TelemetryMessage::AudioLevel {
            level: -42.5,
            timestamp: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"audioLevel","level":-42.5,"timestamp":1700000000000}"#
        );
    }

    #[test]
    fn sound_alert_telemetry_shape() {
        let msg = TelemetryMessage::SoundAlert {
            level: -15.0,
            threshold: -20.0,
            room_id: 3,
            timestamp: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"soundAlert""#));
        assert!(json.contains(r#""roomId":3"#));
        assert!(json.contains(r#""threshold":-20.0"#));
        assert!(!json.contains("room_id"));
    }
}
