//! Smart Device Management REST client: device listing and WebRTC stream
//! lifecycle commands, with typed rate-limit errors.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

const SDM_BASE_URL: &str = "https://smartdevicemanagement.googleapis.com/v1";
/// Fallback when a 429 response carries no Retry-After header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;
/// Never retry sooner than this after a 429.
const MIN_RETRY_AFTER_SECS: u64 = 30;

/// Source of OAuth access tokens. The relay never performs the OAuth flow
/// itself; the host wires a provider in.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> anyhow::Result<String>;
}

/// Fixed token, useful for development and tests.
pub struct StaticTokenProvider(String);

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}

/// Token re-read from a file on every request, so an external refresher can
/// rotate it without restarting the relay.
pub struct FileTokenProvider {
    path: PathBuf,
}

impl FileTokenProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TokenProvider for FileTokenProvider {
    async fn access_token(&self) -> anyhow::Result<String> {
        let token = tokio::fs::read_to_string(&self.path).await?;
        let token = token.trim().to_string();
        if token.is_empty() {
            anyhow::bail!("token file {} is empty", self.path.display());
        }
        Ok(token)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NestApiError {
    #[error("SDM rate limit, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },
    #[error("SDM request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("no access token available: {0}")]
    Token(String),
    #[error("SDM transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct NestDevice {
    /// Full resource name, `enterprises/{project}/devices/{device}`.
    pub device_id: String,
    pub display_name: String,
    pub device_type: String,
}

#[derive(Debug, Clone)]
pub struct WebRtcSession {
    pub answer_sdp: String,
    pub media_session_id: String,
    pub expires_at: Option<String>,
}

pub struct NestDeviceClient {
    http: reqwest::Client,
    base_url: String,
    project_id: String,
    tokens: Arc<dyn TokenProvider>,
}

#[derive(Deserialize, Default)]
struct DeviceList {
    #[serde(default)]
    devices: Vec<DeviceEntry>,
}

#[derive(Deserialize)]
struct DeviceEntry {
    name: String,
    #[serde(rename = "type", default)]
    device_type: String,
    #[serde(default)]
    traits: serde_json::Value,
}

#[derive(Deserialize, Default)]
struct CommandResponse {
    #[serde(default)]
    results: CommandResults,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct CommandResults {
    #[serde(default)]
    answer_sdp: String,
    #[serde(default)]
    media_session_id: String,
    #[serde(default)]
    expires_at: Option<String>,
}

impl NestDeviceClient {
    pub fn new(project_id: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: SDM_BASE_URL.to_string(),
            project_id: project_id.into(),
            tokens,
        }
    }

    /// Override the API base URL (test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn token(&self) -> Result<String, NestApiError> {
        self.tokens
            .access_token()
            .await
            .map_err(|e| NestApiError::Token(format!("{e:#}")))
    }

    /// List cameras and doorbells in the project. The returned `device_id`
    /// is the full resource name used by the command endpoints.
    pub async fn list_devices(&self) -> Result<Vec<NestDevice>, NestApiError> {
        let token = self.token().await?;
        let url = format!(
            "{}/enterprises/{}/devices",
            self.base_url, self.project_id
        );
        let response = self.http.get(&url).bearer_auth(token).send().await?;
        let list: DeviceList = Self::read_json(response).await?;

        Ok(list
            .devices
            .into_iter()
            .filter(|d| is_camera_device(&d.device_type))
            .map(|d| {
                let display_name = d
                    .traits
                    .pointer("/sdm.devices.traits.Info/customName")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                NestDevice {
                    device_id: d.name,
                    display_name,
                    device_type: d.device_type,
                }
            })
            .collect())
    }

    /// Start a WebRTC stream: submit our SDP offer, get the answer and a
    /// media session id valid for five minutes.
    pub async fn generate_webrtc_stream(
        &self,
        device_id: &str,
        offer_sdp: &str,
    ) -> Result<WebRtcSession, NestApiError> {
        let results = self
            .execute_command(
                device_id,
                "sdm.devices.commands.CameraLiveStream.GenerateWebRtcStream",
                json!({ "offerSdp": offer_sdp }),
            )
            .await?;
        Ok(WebRtcSession {
            answer_sdp: results.answer_sdp,
            media_session_id: results.media_session_id,
            expires_at: results.expires_at,
        })
    }

    /// Extend the stream; returns the (possibly rotated) media session id.
    pub async fn extend_webrtc_stream(
        &self,
        device_id: &str,
        media_session_id: &str,
    ) -> Result<String, NestApiError> {
        let results = self
            .execute_command(
                device_id,
                "sdm.devices.commands.CameraLiveStream.ExtendWebRtcStream",
                json!({ "mediaSessionId": media_session_id }),
            )
            .await?;
        if results.media_session_id.is_empty() {
            Ok(media_session_id.to_string())
        } else {
            Ok(results.media_session_id)
        }
    }

    pub async fn stop_webrtc_stream(
        &self,
        device_id: &str,
        media_session_id: &str,
    ) -> Result<(), NestApiError> {
        self.execute_command(
            device_id,
            "sdm.devices.commands.CameraLiveStream.StopWebRtcStream",
            json!({ "mediaSessionId": media_session_id }),
        )
        .await?;
        Ok(())
    }

    async fn execute_command(
        &self,
        device_id: &str,
        command: &str,
        params: serde_json::Value,
    ) -> Result<CommandResults, NestApiError> {
        let token = self.token().await?;
        let url = format!("{}/{}:executeCommand", self.base_url, device_id);
        debug!(device_id, command, "SDM executeCommand");
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&json!({ "command": command, "params": params }))
            .send()
            .await?;
        let parsed: CommandResponse = Self::read_json(response).await?;
        Ok(parsed.results)
    }

    async fn read_json<T: serde::de::DeserializeOwned + Default>(
        response: reqwest::Response,
    ) -> Result<T, NestApiError> {
        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = retry_after_seconds(response.headers());
            return Err(NestApiError::RateLimited {
                retry_after_seconds: retry_after,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NestApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(T::default());
        }
        serde_json::from_str(&body).map_err(|e| NestApiError::Status {
            status: status.as_u16(),
            body: format!("invalid response body: {e}"),
        })
    }
}

/// Keep only cameras and doorbells from a device listing.
fn is_camera_device(device_type: &str) -> bool {
    device_type.contains("CAMERA") || device_type.contains("DOORBELL")
}

/// Seconds to wait after a 429: the Retry-After header when present (else
/// 60), floored at 30.
fn retry_after_seconds(headers: &reqwest::header::HeaderMap) -> u64 {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
        .max(MIN_RETRY_AFTER_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

    #[test]
    fn camera_and_doorbell_types_match() {
        assert!(is_camera_device("sdm.devices.types.CAMERA"));
        assert!(is_camera_device("sdm.devices.types.DOORBELL"));
        assert!(!is_camera_device("sdm.devices.types.THERMOSTAT"));
        assert!(!is_camera_device(""));
    }

    #[test]
    fn retry_after_uses_header() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("120"));
        assert_eq!(retry_after_seconds(&headers), 120);
    }

    #[test]
    fn retry_after_defaults_to_sixty() {
        assert_eq!(retry_after_seconds(&HeaderMap::new()), 60);
    }

    #[test]
    fn retry_after_floors_at_thirty() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("5"));
        assert_eq!(retry_after_seconds(&headers), 30);
    }

    #[test]
    fn retry_after_ignores_garbage() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(retry_after_seconds(&headers), 60);
    }

    #[test]
    fn device_list_parses_and_filters() {
        let body = r#"{
            "devices": [
                {
                    "name": "enterprises/p/devices/cam1",
                    "type": "sdm.devices.types.CAMERA",
                    "traits": { "sdm.devices.traits.Info": { "customName": "Nursery" } }
                },
                {
                    "name": "enterprises/p/devices/thermo",
                    "type": "sdm.devices.types.THERMOSTAT",
                    "traits": {}
                },
                {
                    "name": "enterprises/p/devices/door",
                    "type": "sdm.devices.types.DOORBELL",
                    "traits": {}
                }
            ]
        }"#;
        let list: DeviceList = serde_json::from_str(body).unwrap();
        let cameras: Vec<_> = list
            .devices
            .iter()
            .filter(|d| is_camera_device(&d.device_type))
            .collect();
        assert_eq!(cameras.len(), 2);
        assert_eq!(cameras[0].name, "enterprises/p/devices/cam1");
        assert_eq!(
            cameras[0]
                .traits
                .pointer("/sdm.devices.traits.Info/customName")
                .and_then(|v| v.as_str()),
            Some("Nursery")
        );
    }

    #[test]
    fn command_response_parses_generate_result() {
        let body = r#"{
            "results": {
                "answerSdp": "v=0\r\n",
                "mediaSessionId": "session-1",
                "expiresAt": "2030-01-01T00:00:00Z"
            }
        }"#;
        let parsed: CommandResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.results.answer_sdp, "v=0\r\n");
        assert_eq!(parsed.results.media_session_id, "session-1");
        assert!(parsed.results.expires_at.is_some());
    }

    #[test]
    fn command_response_tolerates_empty_results() {
        let parsed: CommandResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.results.media_session_id.is_empty());
    }
}
