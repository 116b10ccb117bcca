//! Narrow OpenWebIF client for the Enigma2 receiver.
//!
//! Only the calls the control plane needs are implemented: a status probe
//! used as the connectivity check for live intents, the timer list used to
//! detect recordings that are still being written, and the stream URL of a
//! live service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;
use url::Url;

use crate::{Error, Result};

/// Timer state reported while the receiver is recording.
pub const TIMER_STATE_RUNNING: i32 = 2;

/// Receiver connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    pub base_url: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub timeout: Duration,
    pub stream_port: u16,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1".to_string(),
            username: None,
            password: None,
            timeout: Duration::from_secs(10),
            stream_port: 8001,
        }
    }
}

/// `/api/statusinfo` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusInfo {
    #[serde(rename = "inStandby", default, deserialize_with = "flag")]
    pub in_standby: bool,
    #[serde(rename = "isRecording", default, deserialize_with = "flag")]
    pub is_recording: bool,
    #[serde(default)]
    pub currservice_name: String,
    #[serde(default)]
    pub currservice_serviceref: String,
}

/// One entry of `/api/timerlist`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timer {
    #[serde(default)]
    pub serviceref: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub begin: i64,
    #[serde(default)]
    pub end: i64,
    #[serde(default)]
    pub state: i32,
    #[serde(default)]
    pub disabled: i32,
    #[serde(default)]
    pub filename: Option<String>,
}

impl Timer {
    pub fn is_running(&self) -> bool {
        self.state == TIMER_STATE_RUNNING && self.disabled == 0
    }
}

#[derive(Debug, Deserialize)]
struct TimerListResponse {
    #[serde(default)]
    result: bool,
    #[serde(default)]
    timers: Vec<Timer>,
}

/// OpenWebIF reports booleans as `true`, `"true"` or `1` depending on firmware.
fn flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::String(s) => s.eq_ignore_ascii_case("true") || s == "1",
        serde_json::Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    })
}

/// Whether a running timer is writing `receiver_path`.
pub fn is_recording_in_progress(timers: &[Timer], receiver_path: &str) -> bool {
    timers
        .iter()
        .filter(|t| t.is_running())
        .filter_map(|t| t.filename.as_deref())
        .any(|f| f == receiver_path)
}

/// Calls the control plane makes against the receiver.
#[async_trait]
pub trait ReceiverClient: Send + Sync {
    async fn status(&self) -> Result<StatusInfo>;

    async fn timers(&self) -> Result<Vec<Timer>>;

    /// HTTP stream URL for a live service reference.
    fn stream_url(&self, service_ref: &str) -> Result<String>;
}

pub struct OpenWebIfClient {
    config: ReceiverConfig,
    base: Url,
    client: Client,
}

impl OpenWebIfClient {
    pub fn new(config: ReceiverConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| Error::config(format!("invalid receiver URL '{}': {e}", config.base_url)))?;
        if base.host_str().is_none() {
            return Err(Error::config(format!(
                "receiver URL '{}' has no host",
                config.base_url
            )));
        }
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            config,
            base,
            client,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self
            .base
            .join(path)
            .map_err(|e| Error::Other(format!("invalid receiver path {path}: {e}")))?;

        let mut request = self.client.get(url);
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_ref());
        }

        let response = request.send().await?.error_for_status()?;
        let body = response.json::<T>().await?;
        debug!(path, "Receiver request succeeded");
        Ok(body)
    }
}

#[async_trait]
impl ReceiverClient for OpenWebIfClient {
    async fn status(&self) -> Result<StatusInfo> {
        self.get_json("/api/statusinfo").await
    }

    async fn timers(&self) -> Result<Vec<Timer>> {
        let list: TimerListResponse = self.get_json("/api/timerlist").await?;
        if !list.result {
            return Err(Error::Other("receiver rejected timer list request".to_string()));
        }
        Ok(list.timers)
    }

    fn stream_url(&self, service_ref: &str) -> Result<String> {
        let service_ref = service_ref.trim();
        if service_ref.is_empty() || service_ref.chars().any(char::is_whitespace) {
            return Err(Error::validation(format!(
                "invalid service reference '{service_ref}'"
            )));
        }
        let host = self
            .base
            .host_str()
            .ok_or_else(|| Error::config("receiver URL has no host"))?;
        Ok(format!(
            "http://{host}:{}/{service_ref}",
            self.config.stream_port
        ))
    }
}
