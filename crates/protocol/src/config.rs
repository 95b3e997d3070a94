use serde::{Deserialize, Serialize};

use crate::room::{GlobalSettings, Room, StreamSourceType};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CradleConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub nest: NestConfig,
    /// Initial global audio settings (hot-reloadable over the hub afterwards).
    #[serde(default)]
    pub settings: GlobalSettings,
    /// Rooms seeded into the in-memory repository at startup.
    #[serde(default)]
    pub rooms: Vec<Room>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTP port (signaling WebSocket + health)
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Google Smart Device Management access. Only needed when a room uses a
/// `google_nest` source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NestConfig {
    /// SDM project id (`enterprises/{project}` is derived from this).
    pub project_id: Option<String>,
    /// Static OAuth access token. Useful for development; production wires a
    /// real token provider.
    pub access_token: Option<String>,
    /// Path to a file holding the access token, re-read on each request.
    pub token_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl Default for CradleConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            nest: NestConfig::default(),
            settings: GlobalSettings::default(),
            rooms: Vec::new(),
        }
    }
}

impl CradleConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        let mut seen_ids = std::collections::HashSet::new();
        for room in &self.rooms {
            if !seen_ids.insert(room.id) {
                issues.push(format!(
                    "ERROR: duplicate room id {} in [[rooms]].",
                    room.id
                ));
            }
            if let Err(e) = room.validate() {
                issues.push(format!("ERROR: {e}"));
            }
        }

        let any_nest = self
            .rooms
            .iter()
            .any(|r| r.stream_source_type == StreamSourceType::GoogleNest);
        if any_nest && self.nest.project_id.is_none() {
            issues.push(
                "ERROR: a room uses a google_nest source but nest.project_id is not set."
                    .to_string(),
            );
        }
        if any_nest && self.nest.access_token.is_none() && self.nest.token_file.is_none() {
            issues.push(
                "WARNING: no nest.access_token or nest.token_file configured. \
                 Nest readers will fail until a token provider is wired."
                    .to_string(),
            );
        }

        if self.settings.average_sample_count == 0 {
            issues.push("ERROR: settings.average_sample_count must be >= 1.".to_string());
        }
        if self.settings.low_pass_hz <= self.settings.high_pass_hz {
            issues.push(format!(
                "WARNING: settings.low_pass_hz ({}) is not above settings.high_pass_hz ({}). \
                 The filter chain will attenuate the whole band.",
                self.settings.low_pass_hz, self.settings.high_pass_hz
            ));
        }
        if self.settings.sound_threshold_db > 0.0 {
            issues.push(format!(
                "WARNING: settings.sound_threshold_db ({}) is above 0 dBFS and can never trigger.",
                self.settings.sound_threshold_db
            ));
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8090
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: CradleConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 8090);
        assert!(config.nest.project_id.is_none());
        assert!(config.rooms.is_empty());
        assert_eq!(config.settings, GlobalSettings::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let config: CradleConfig = toml::from_str(
            r#"
[settings]
sound_threshold_db = -35.0
"#,
        )
        .expect("partial config should deserialize");

        assert_eq!(config.settings.sound_threshold_db, -35.0);
        assert_eq!(config.settings.average_sample_count, 10);
        assert_eq!(config.server.port, 8090);
    }

    #[test]
    fn rooms_seed_parses() {
        let config: CradleConfig = toml::from_str(
            r#"
[[rooms]]
id = 1
name = "Nursery"
stream_source_type = "rtsp"
enable_audio_stream = true
camera_stream_url = "rtsp://cam.local/stream"

[[rooms]]
id = 2
name = "Twins"
stream_source_type = "google_nest"
enable_audio_stream = true
enable_video_stream = true
nest_device_id = "enterprises/p/devices/d"

[nest]
project_id = "p"
access_token = "token"
"#,
        )
        .expect("rooms seed should deserialize");

        assert_eq!(config.rooms.len(), 2);
        assert_eq!(
            config.rooms[1].stream_source_type,
            StreamSourceType::GoogleNest
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_port_zero_is_error() {
        let mut config = CradleConfig::default();
        config.server.port = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:") && i.contains("port")));
    }

    #[test]
    fn validate_duplicate_room_ids() {
        let config: CradleConfig = toml::from_str(
            r#"
[[rooms]]
id = 1
name = "A"
stream_source_type = "rtsp"
camera_stream_url = "rtsp://a"

[[rooms]]
id = 1
name = "B"
stream_source_type = "rtsp"
camera_stream_url = "rtsp://b"
"#,
        )
        .unwrap();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("duplicate room id")));
    }

    #[test]
    fn validate_nest_room_without_project_id() {
        let config: CradleConfig = toml::from_str(
            r#"
[[rooms]]
id = 1
name = "Twins"
stream_source_type = "google_nest"
nest_device_id = "enterprises/p/devices/d"
"#,
        )
        .unwrap();
        let issues = config.validate().unwrap_err();
        assert!(
            issues
                .iter()
                .any(|i| i.starts_with("ERROR:") && i.contains("project_id"))
        );
    }

    #[test]
    fn validate_invalid_room_is_error() {
        let config: CradleConfig = toml::from_str(
            r#"
[[rooms]]
id = 3
name = "Broken"
stream_source_type = "rtsp"
"#,
        )
        .unwrap();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("camera_stream_url")));
    }

    #[test]
    fn validate_filter_band_warning() {
        let mut config = CradleConfig::default();
        config.settings.low_pass_hz = 200.0;
        config.settings.high_pass_hz = 300.0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("WARNING:") && i.contains("low_pass_hz")));
    }

    #[test]
    fn validate_zero_average_count_is_error() {
        let mut config = CradleConfig::default();
        config.settings.average_sample_count = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("average_sample_count")));
    }
}
