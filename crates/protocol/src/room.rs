use serde::{Deserialize, Serialize};

/// Where a room's media comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamSourceType {
    Rtsp,
    GoogleNest,
}

/// Camera credentials for RTSP sources.
/// Password is redacted in Debug output to prevent accidental logging.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for CameraCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraCredentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// One monitored room, bound to a single camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: i32,
    pub name: String,
    pub stream_source_type: StreamSourceType,
    #[serde(default)]
    pub enable_audio_stream: bool,
    #[serde(default)]
    pub enable_video_stream: bool,
    #[serde(default)]
    pub camera_stream_url: Option<String>,
    #[serde(default)]
    pub camera_credentials: Option<CameraCredentials>,
    #[serde(default)]
    pub nest_device_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomConfigError {
    #[error("room {0} uses an RTSP source but has no camera_stream_url")]
    MissingStreamUrl(i32),
    #[error("room {0} uses a Google Nest source but has no nest_device_id")]
    MissingDeviceId(i32),
}

impl Room {
    /// Check the source-type invariants: RTSP rooms need a URL, Nest rooms a
    /// device id.
    pub fn validate(&self) -> Result<(), RoomConfigError> {
        match self.stream_source_type {
            StreamSourceType::Rtsp => {
                if self
                    .camera_stream_url
                    .as_deref()
                    .is_none_or(|u| u.is_empty())
                {
                    return Err(RoomConfigError::MissingStreamUrl(self.id));
                }
            }
            StreamSourceType::GoogleNest => {
                if self.nest_device_id.as_deref().is_none_or(|d| d.is_empty()) {
                    return Err(RoomConfigError::MissingDeviceId(self.id));
                }
            }
        }
        Ok(())
    }

    /// The identity of the media source: the RTSP URL or the Nest device id.
    /// A change in this value forces a reader restart during refresh.
    pub fn source_key(&self) -> Option<&str> {
        match self.stream_source_type {
            StreamSourceType::Rtsp => self.camera_stream_url.as_deref(),
            StreamSourceType::GoogleNest => self.nest_device_id.as_deref(),
        }
    }

    pub fn audio_ready(&self) -> bool {
        self.enable_audio_stream && self.validate().is_ok()
    }

    pub fn video_ready(&self) -> bool {
        self.enable_video_stream && self.validate().is_ok()
    }
}

/// Process-wide audio processing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Rolling-mean level above this triggers a sound alert (dBFS).
    #[serde(default = "default_sound_threshold_db")]
    pub sound_threshold_db: f32,
    /// Number of per-frame levels averaged into the published level.
    #[serde(default = "default_average_sample_count")]
    pub average_sample_count: usize,
    /// Apply the high-pass/low-pass chain before metering.
    #[serde(default = "default_true")]
    pub filter_enabled: bool,
    #[serde(default = "default_low_pass_hz")]
    pub low_pass_hz: f32,
    #[serde(default = "default_high_pass_hz")]
    pub high_pass_hz: f32,
    /// Minimum spacing between sound alerts for the same room.
    #[serde(default = "default_threshold_pause_seconds")]
    pub threshold_pause_seconds: u64,
    /// Gain applied to decoded RTSP audio before metering and fan-out (dB).
    #[serde(default = "default_volume_adjustment_db")]
    pub volume_adjustment_db: f32,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            sound_threshold_db: default_sound_threshold_db(),
            average_sample_count: default_average_sample_count(),
            filter_enabled: true,
            low_pass_hz: default_low_pass_hz(),
            high_pass_hz: default_high_pass_hz(),
            threshold_pause_seconds: default_threshold_pause_seconds(),
            volume_adjustment_db: default_volume_adjustment_db(),
        }
    }
}

fn default_sound_threshold_db() -> f32 {
    -20.0
}
fn default_average_sample_count() -> usize {
    10
}
fn default_true() -> bool {
    true
}
fn default_low_pass_hz() -> f32 {
    4000.0
}
fn default_high_pass_hz() -> f32 {
    300.0
}
fn default_threshold_pause_seconds() -> u64 {
    30
}
fn default_volume_adjustment_db() -> f32 {
    -15.0
}

/// Emitted when a room's rolling level crosses the configured threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoundAlert {
    pub room_id: i32,
    pub level_db: f32,
    pub threshold_db: f32,
    /// Unix epoch milliseconds.
    pub timestamp_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtsp_room() -> Room {
        Room {
            id: 1,
            name: "Nursery".to_string(),
            stream_source_type: StreamSourceType::Rtsp,
            enable_audio_stream: true,
            enable_video_stream: false,
            camera_stream_url: Some("rtsp://cam.local/stream".to_string()),
            camera_credentials: None,
            nest_device_id: None,
        }
    }

    #[test]
    fn rtsp_room_requires_url() {
        let mut room = rtsp_room();
        assert!(room.validate().is_ok());

        room.camera_stream_url = None;
        assert_eq!(room.validate(), Err(RoomConfigError::MissingStreamUrl(1)));

        room.camera_stream_url = Some(String::new());
        assert_eq!(room.validate(), Err(RoomConfigError::MissingStreamUrl(1)));
    }

    #[test]
    fn nest_room_requires_device_id() {
        let mut room = rtsp_room();
        room.stream_source_type = StreamSourceType::GoogleNest;
        assert_eq!(room.validate(), Err(RoomConfigError::MissingDeviceId(1)));

        room.nest_device_id = Some("enterprises/p/devices/d".to_string());
        assert!(room.validate().is_ok());
    }

    #[test]
    fn source_key_follows_source_type() {
        let mut room = rtsp_room();
        assert_eq!(room.source_key(), Some("rtsp://cam.local/stream"));

        room.stream_source_type = StreamSourceType::GoogleNest;
        room.nest_device_id = Some("enterprises/p/devices/d".to_string());
        assert_eq!(room.source_key(), Some("enterprises/p/devices/d"));
    }

    #[test]
    fn audio_ready_requires_flag_and_valid_config() {
        let mut room = rtsp_room();
        assert!(room.audio_ready());

        room.enable_audio_stream = false;
        assert!(!room.audio_ready());

        room.enable_audio_stream = true;
        room.camera_stream_url = None;
        assert!(!room.audio_ready());
    }

    #[test]
    fn source_type_serializes_snake_case() {
        let json = serde_json::to_string(&StreamSourceType::GoogleNest).unwrap();
        assert_eq!(json, r#""google_nest""#);
        let json = serde_json::to_string(&StreamSourceType::Rtsp).unwrap();
        assert_eq!(json, r#""rtsp""#);
    }

    #[test]
    fn credentials_redacted_in_debug() {
        let creds = CameraCredentials {
            username: "monitor".to_string(),
            password: "hunter2".to_string(),
        };
        let debug = format!("{creds:?}");
        assert!(debug.contains("monitor"));
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn settings_defaults() {
        let settings = GlobalSettings::default();
        assert_eq!(settings.sound_threshold_db, -20.0);
        assert_eq!(settings.average_sample_count, 10);
        assert!(settings.filter_enabled);
        assert_eq!(settings.low_pass_hz, 4000.0);
        assert_eq!(settings.high_pass_hz, 300.0);
        assert_eq!(settings.threshold_pause_seconds, 30);
        assert_eq!(settings.volume_adjustment_db, -15.0);
    }

    #[test]
    fn settings_defaults_match_empty_json() {
        let from_json: GlobalSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(from_json, GlobalSettings::default());
    }
}
