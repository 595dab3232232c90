//! Configuration loading
//!
//! Sources, lowest priority first: built-in defaults, the YAML file
//! (`configs/config.yml`), then environment variables (a `.env` file is
//! loaded into the environment first). Loaded once at start; there is no
//! hot reload.

use crate::error::{ReadoutError, Result};
use crate::queue::OverflowPolicy;
use crate::roster::SpeakerEntry;
use crate::router::RouterRules;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "configs/config.yml";

/// Speaker used for announcements and as the fallback voice (Anneli)
pub const DEFAULT_SPEAKER: u32 = 888_753_760;

/// Load environment variables from a .env file in the working directory or a
/// parent. Missing file is not an error.
pub fn load_env() -> Result<()> {
    match dotenvy::dotenv() {
        Ok(path) => {
            tracing::info!(path = %path.display(), "Loaded environment file");
            Ok(())
        }
        Err(dotenvy::Error::LineParse(line, pos)) => Err(ReadoutError::config(format!(
            "Failed to parse .env file at line {}, position {}",
            line, pos
        ))),
        Err(dotenvy::Error::Io(_)) => {
            tracing::debug!("No .env file found - using process environment only");
            Ok(())
        }
        Err(e) => Err(ReadoutError::config(format!(
            "Failed to load .env file: {}",
            e
        ))),
    }
}

/// Get optional environment variable, ignoring empty values
pub fn get_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Get environment variable parsed as `T`; unparsable values are an error
pub fn get_env_parsed<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
{
    match get_env(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            ReadoutError::config(format!(
                "Environment variable '{}' has invalid value '{}'",
                key, raw
            ))
        }),
    }
}

/// Chat platform credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordSection {
    /// Bot token
    pub access_token: String,
    /// Application id, used for the invite link
    pub application_id: Option<u64>,
}

/// Queue and text limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadoutSection {
    /// Maximum characters read from one message
    pub max_text_length: usize,
    /// Appended when a message is cut
    pub truncation_suffix: String,
    /// Pending utterances per guild
    pub queue_capacity: usize,
    /// Behaviour at capacity
    pub overflow_policy: OverflowPolicy,
}

impl Default for ReadoutSection {
    fn default() -> Self {
        Self {
            max_text_length: 40,
            truncation_suffix: "以下省略".to_string(),
            queue_capacity: 8,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

/// Synthesis engine endpoints and voice defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisSection {
    /// Base URLs of VOICEVOX-compatible engines; requests race across them
    pub endpoints: Vec<String>,
    /// Per-call deadline
    pub timeout_ms: u64,
    /// Speaker for announcements and users without an assignment
    pub default_speaker: u32,
    /// Raise pitch at the end of questions
    pub interrogative_upspeak: bool,
}

impl Default for SynthesisSection {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:10101".to_string()],
            timeout_ms: 10_000,
            default_speaker: DEFAULT_SPEAKER,
            interrogative_upspeak: true,
        }
    }
}

impl SynthesisSection {
    /// Per-call deadline as a Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Which transcoder turns engine audio into frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscoderKind {
    /// External ffmpeg process; accepts any container ffmpeg understands
    #[default]
    Ffmpeg,
    /// In-process WAV decoder
    Wav,
}

/// Transcoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderSection {
    /// Implementation
    pub kind: TranscoderKind,
    /// ffmpeg binary
    pub ffmpeg_path: String,
    /// Longest wait for the next frame from the transcoder
    pub frame_timeout_ms: u64,
}

impl Default for TranscoderSection {
    fn default() -> Self {
        Self {
            kind: TranscoderKind::Ffmpeg,
            ffmpeg_path: "ffmpeg".to_string(),
            frame_timeout_ms: 5_000,
        }
    }
}

/// Frame pacing and teardown bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackSection {
    /// Deadline for handing one frame to the voice connection
    pub send_timeout_ms: u64,
    /// Frames sent ahead of real time at the start of each utterance
    pub prebuffer_frames: u32,
    /// How long `leave` waits for a driver to stop before aborting it
    pub teardown_timeout_ms: u64,
}

impl Default for PlaybackSection {
    fn default() -> Self {
        Self {
            send_timeout_ms: 1_000,
            prebuffer_frames: 5,
            teardown_timeout_ms: 3_000,
        }
    }
}

/// Session lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Deadline for establishing a voice connection
    pub connect_timeout_ms: u64,
    /// Grace period before leaving a channel with no humans left
    pub idle_grace_secs: u64,
    /// Join the channel a user enters when the guild has no session
    pub auto_join: bool,
    /// Announce humans entering and leaving the session's channel
    pub announce_presence: bool,
    /// Announcement for a join; `{name}` is replaced with the display name
    pub join_template: String,
    /// Announcement for a leave
    pub leave_template: String,
    /// Spoken right after the bot joins; empty to stay silent
    pub greeting: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            idle_grace_secs: 5,
            auto_join: true,
            announce_presence: true,
            join_template: "{name} さんが入室しました。".to_string(),
            leave_template: "{name} さんが退室しました。".to_string(),
            greeting: "読み上げを開始します。".to_string(),
        }
    }
}

/// Speaker catalog and persisted assignments
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoicesSection {
    /// Speakers randomly assigned to new users
    pub catalog: Vec<SpeakerEntry>,
    /// YAML file holding user → speaker assignments
    pub mapping_file: Option<PathBuf>,
}

impl Default for VoicesSection {
    fn default() -> Self {
        Self {
            catalog: SpeakerEntry::builtin_catalog(),
            mapping_file: None,
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadoutConfig {
    pub discord: DiscordSection,
    pub readout: ReadoutSection,
    pub synthesis: SynthesisSection,
    pub transcoder: TranscoderSection,
    pub playback: PlaybackSection,
    pub session: SessionSection,
    pub voices: VoicesSection,
    pub router: RouterRules,
}

impl ReadoutConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read the YAML file at `path`, apply environment overrides and validate
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_yaml_str(&raw).map_err(|e| {
                ReadoutError::config(format!("{} could not be parsed: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(token) = get_env("DISCORD_TOKEN") {
            self.discord.access_token = token;
        }
        if let Some(app_id) = get_env_parsed::<u64>("DISCORD_APPLICATION_ID")? {
            self.discord.application_id = Some(app_id);
        }
        if let Some(endpoints) = get_env("YOMIAGE_TTS_ENDPOINTS") {
            self.synthesis.endpoints = endpoints
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(max) = get_env_parsed::<usize>("YOMIAGE_MAX_TEXT_LENGTH")? {
            self.readout.max_text_length = max;
        }
        if let Some(capacity) = get_env_parsed::<usize>("YOMIAGE_QUEUE_CAPACITY")? {
            self.readout.queue_capacity = capacity;
        }
        if let Some(timeout) = get_env_parsed::<u64>("YOMIAGE_SYNTHESIS_TIMEOUT_MS")? {
            self.synthesis.timeout_ms = timeout;
        }
        if let Some(grace) = get_env_parsed::<u64>("YOMIAGE_IDLE_GRACE_SECS")? {
            self.session.idle_grace_secs = grace;
        }
        Ok(())
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.readout.max_text_length == 0 {
            problems.push("readout.max_text_length must be greater than 0");
        }
        if self.readout.queue_capacity == 0 {
            problems.push("readout.queue_capacity must be greater than 0");
        }
        if self.synthesis.endpoints.is_empty() {
            problems.push("synthesis.endpoints must list at least one engine");
        }
        if self.synthesis.timeout_ms == 0 {
            problems.push("synthesis.timeout_ms must be greater than 0");
        }
        if self.playback.send_timeout_ms == 0 {
            problems.push("playback.send_timeout_ms must be greater than 0");
        }
        if self.playback.teardown_timeout_ms == 0 {
            problems.push("playback.teardown_timeout_ms must be greater than 0");
        }
        if self.transcoder.frame_timeout_ms == 0 {
            problems.push("transcoder.frame_timeout_ms must be greater than 0");
        }
        if self.session.connect_timeout_ms == 0 {
            problems.push("session.connect_timeout_ms must be greater than 0");
        }
        if self.voices.catalog.is_empty() {
            problems.push("voices.catalog must list at least one speaker");
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ReadoutError::config(problems.join("; ")))
        }
    }

    /// Credentials are only needed to start the gateway connection
    pub fn require_token(&self) -> Result<&str> {
        if self.discord.access_token.trim().is_empty() {
            return Err(ReadoutError::config(
                "discord.access_token is not set (config.yml or DISCORD_TOKEN)",
            ));
        }
        Ok(&self.discord.access_token)
    }

    /// Settings the playback driver needs
    pub fn driver_settings(&self) -> crate::driver::DriverSettings {
        crate::driver::DriverSettings {
            synthesis_timeout: self.synthesis.timeout(),
            frame_timeout: Duration::from_millis(self.transcoder.frame_timeout_ms),
            send_timeout: Duration::from_millis(self.playback.send_timeout_ms),
            prebuffer_frames: self.playback.prebuffer_frames,
        }
    }

    /// Settings the session manager needs
    pub fn session_settings(&self) -> crate::session::SessionSettings {
        crate::session::SessionSettings {
            queue_capacity: self.readout.queue_capacity,
            overflow_policy: self.readout.overflow_policy,
            connect_timeout: Duration::from_millis(self.session.connect_timeout_ms),
            teardown_timeout: Duration::from_millis(self.playback.teardown_timeout_ms),
            idle_grace: Duration::from_secs(self.session.idle_grace_secs),
            driver: self.driver_settings(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_original_bot() {
        let config = ReadoutConfig::default();
        assert_eq!(config.readout.max_text_length, 40);
        assert_eq!(config.synthesis.default_speaker, 888_753_760);
        assert_eq!(config.readout.overflow_policy, OverflowPolicy::DropOldest);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
discord:
  access_token: "abc"
  application_id: 1234
readout:
  queue_capacity: 3
  overflow_policy: reject_newest
synthesis:
  endpoints: ["http://localhost:10101", "http://192.168.0.246:10101"]
  timeout_ms: 2000
"#;
        let config = ReadoutConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.discord.access_token, "abc");
        assert_eq!(config.discord.application_id, Some(1234));
        assert_eq!(config.readout.queue_capacity, 3);
        assert_eq!(config.readout.overflow_policy, OverflowPolicy::RejectNewest);
        assert_eq!(config.readout.max_text_length, 40);
        assert_eq!(config.synthesis.endpoints.len(), 2);
        assert_eq!(config.synthesis.timeout(), Duration::from_secs(2));
        assert_eq!(config.session.idle_grace_secs, 5);
    }

    #[test]
    fn test_validate_collects_problems() {
        let mut config = ReadoutConfig::default();
        config.readout.queue_capacity = 0;
        config.synthesis.endpoints.clear();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("queue_capacity"));
        assert!(err.contains("endpoints"));
    }

    #[test]
    fn test_require_token() {
        let mut config = ReadoutConfig::default();
        assert!(config.require_token().is_err());
        config.discord.access_token = "token".to_string();
        assert_eq!(config.require_token().unwrap(), "token");
    }

    #[test]
    fn test_malformed_yaml_is_an_error() {
        let err = ReadoutConfig::from_yaml_str("readout: [unclosed").unwrap_err();
        assert!(matches!(err, ReadoutError::Yaml(_)));
    }

    #[test]
    fn test_example_file_matches_defaults() {
        let example = include_str!("../../../../configs/config.example.yml");
        let config = ReadoutConfig::from_yaml_str(example).unwrap();
        let defaults = ReadoutConfig::default();
        assert_eq!(config.router, defaults.router);
        assert_eq!(config.session.greeting, defaults.session.greeting);
        assert_eq!(config.synthesis.default_speaker, DEFAULT_SPEAKER);
        assert_eq!(config.voices.catalog.len(), defaults.voices.catalog.len());
        config.validate().unwrap();
    }
}
