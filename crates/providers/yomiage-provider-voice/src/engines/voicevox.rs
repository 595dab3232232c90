//! VOICEVOX-compatible synthesis engine
//!
//! Works with VOICEVOX, AivisSpeech and other engines exposing the same two
//! step API: `POST /audio_query` turns text into an editable query object,
//! `POST /synthesis` renders that query to WAV.
//!
//! When several endpoints are configured every request is raced across all
//! of them and the first successful answer wins.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use reqwest::{Client, Response, StatusCode};
use std::sync::OnceLock;
use std::time::Duration;
use yomiage_core::config::SynthesisSection;
use yomiage_core::{SynthesisClient, VoiceParams};

use crate::types::VoiceError;

/// Shared HTTP client for connection pooling
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

/// Settings for one client
#[derive(Debug, Clone)]
pub struct VoicevoxConfig {
    /// Engine base URLs, e.g. `http://127.0.0.1:10101`
    pub endpoints: Vec<String>,
    /// Deadline covering both requests of one synthesis
    pub timeout: Duration,
}

impl Default for VoicevoxConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:10101".to_string()],
            timeout: Duration::from_secs(10),
        }
    }
}

impl From<&SynthesisSection> for VoicevoxConfig {
    fn from(section: &SynthesisSection) -> Self {
        Self {
            endpoints: section.endpoints.clone(),
            timeout: section.timeout(),
        }
    }
}

/// Client for one or more VOICEVOX-compatible engines
#[derive(Debug, Clone)]
pub struct VoicevoxClient {
    endpoints: Vec<String>,
    timeout: Duration,
}

impl VoicevoxClient {
    /// Create a client. At least one endpoint is required.
    pub fn new(config: VoicevoxConfig) -> Result<Self, VoiceError> {
        let endpoints: Vec<String> = config
            .endpoints
            .iter()
            .map(|e| e.trim().trim_end_matches('/').to_string())
            .filter(|e| !e.is_empty())
            .collect();
        if endpoints.is_empty() {
            return Err(VoiceError::Config("no synthesis endpoints configured".into()));
        }
        Ok(Self {
            endpoints,
            timeout: config.timeout,
        })
    }

    /// Client for the engine AivisSpeech runs by default
    pub fn localhost() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:10101".to_string()],
            timeout: Duration::from_secs(10),
        }
    }

    /// Configured base URLs
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    fn client() -> &'static Client {
        HTTP_CLIENT.get_or_init(|| {
            Client::builder()
                .pool_idle_timeout(Duration::from_secs(90))
                .build()
                .unwrap_or_else(|_| Client::new())
        })
    }

    fn request_error(&self, base: &str, err: reqwest::Error) -> VoiceError {
        if err.is_timeout() {
            VoiceError::Timeout(self.timeout)
        } else if err.is_connect() {
            VoiceError::Unavailable(format!("cannot connect to {}: {}", base, err))
        } else {
            VoiceError::Unavailable(format!("{}: {}", base, err))
        }
    }

    async fn check_status(base: &str, step: &str, response: Response) -> Result<Response, VoiceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = format!("{} {} returned {}: {}", base, step, status, body.trim());
        if status == StatusCode::UNPROCESSABLE_ENTITY || status == StatusCode::BAD_REQUEST {
            Err(VoiceError::InvalidInput(detail))
        } else {
            Err(VoiceError::Unavailable(detail))
        }
    }

    /// Run both steps against one engine
    async fn synthesize_on(&self, base: &str, text: &str, voice: &VoiceParams) -> Result<Bytes, VoiceError> {
        let speaker = voice.speaker.to_string();
        let upspeak = if voice.interrogative_upspeak { "true" } else { "false" };
        let client = Self::client();

        let response = client
            .post(format!("{}/audio_query", base))
            .query(&[
                ("text", text),
                ("speaker", speaker.as_str()),
                ("enable_interrogative_upspeak", upspeak),
            ])
            .send()
            .await
            .map_err(|e| self.request_error(base, e))?;
        let query: serde_json::Value = Self::check_status(base, "audio_query", response)
            .await?
            .json()
            .await
            .map_err(|e| VoiceError::Unavailable(format!("{} audio_query body: {}", base, e)))?;

        let response = client
            .post(format!("{}/synthesis", base))
            .query(&[
                ("speaker", speaker.as_str()),
                ("enable_interrogative_upspeak", upspeak),
            ])
            .json(&query)
            .send()
            .await
            .map_err(|e| self.request_error(base, e))?;
        let audio = Self::check_status(base, "synthesis", response)
            .await?
            .bytes()
            .await
            .map_err(|e| self.request_error(base, e))?;

        if audio.is_empty() {
            return Err(VoiceError::Unavailable(format!("{} returned no audio", base)));
        }
        Ok(audio)
    }

    async fn synthesize_bounded(&self, base: &str, text: &str, voice: &VoiceParams) -> Result<Bytes, VoiceError> {
        match tokio::time::timeout(self.timeout, self.synthesize_on(base, text, voice)).await {
            Ok(result) => result,
            Err(_) => Err(VoiceError::Timeout(self.timeout)),
        }
    }

    /// Synthesize on whichever engine answers first
    pub async fn synthesize_wav(&self, text: &str, voice: &VoiceParams) -> Result<Bytes, VoiceError> {
        if text.trim().is_empty() {
            return Err(VoiceError::InvalidInput("empty text".into()));
        }

        let mut attempts: FuturesUnordered<_> = self
            .endpoints
            .iter()
            .map(|base| async move { (base.as_str(), self.synthesize_bounded(base, text, voice).await) })
            .collect();

        let mut worst: Option<VoiceError> = None;
        while let Some((base, result)) = attempts.next().await {
            match result {
                Ok(audio) => {
                    tracing::debug!(
                        endpoint = base,
                        speaker = voice.speaker,
                        bytes = audio.len(),
                        "Synthesized"
                    );
                    // dropping the rest cancels the slower engines
                    return Ok(audio);
                }
                Err(e) => {
                    tracing::debug!(endpoint = base, error = %e, "Engine attempt failed");
                    worst = match worst {
                        Some(prev) if prev.precedence() >= e.precedence() => Some(prev),
                        _ => Some(e),
                    };
                }
            }
        }
        Err(worst.unwrap_or_else(|| VoiceError::Unavailable("no endpoints".into())))
    }

    /// Whether any engine answers `GET /version`
    pub async fn ping(&self) -> bool {
        let client = Self::client();
        let mut probes: FuturesUnordered<_> = self
            .endpoints
            .iter()
            .map(|base| {
                client
                    .get(format!("{}/version", base))
                    .timeout(Duration::from_secs(2))
                    .send()
            })
            .collect();
        while let Some(result) = probes.next().await {
            if matches!(result, Ok(ref r) if r.status().is_success()) {
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl SynthesisClient for VoicevoxClient {
    fn name(&self) -> &str {
        "voicevox"
    }

    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> yomiage_core::Result<Bytes> {
        Ok(self.synthesize_wav(text, voice).await?)
    }

    async fn is_ready(&self) -> bool {
        self.ping().await
    }
}
