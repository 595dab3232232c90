//! Seams to the external collaborators: synthesis engine, transcoder and the
//! chat platform's voice connection.

use crate::error::Result;
use crate::types::{AudioFrame, ChannelId, FrameStream, GuildId, VoiceParams};
use async_trait::async_trait;
use bytes::Bytes;

/// Text to audio, implemented by each synthesis backend
#[async_trait]
pub trait SynthesisClient: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Synthesize `text` into the engine's native audio container (WAV for
    /// VOICEVOX-compatible engines).
    ///
    /// Fails with `SynthesisUnavailable`, `SynthesisTimeout` or `InvalidInput`.
    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<Bytes>;

    /// Whether the backend answers at all
    async fn is_ready(&self) -> bool {
        true
    }
}

/// Raw synthesized audio to playback frames
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Transcoder name for logs
    fn name(&self) -> &str;

    /// Start converting `audio`. Frames are produced at decode speed, with
    /// sequence numbers starting at 0; a malformed payload surfaces as a
    /// `DecodeError` item or an immediate error.
    async fn transcode(&self, audio: Bytes) -> Result<FrameStream>;
}

/// Frame sink of one guild's voice connection.
///
/// Only the guild's playback driver ever calls into it.
#[async_trait]
pub trait VoiceSink: Send + Sync {
    /// Hand one frame to the connection. Must not block past its own timeout.
    async fn send_frame(&self, frame: AudioFrame) -> Result<()>;

    /// Tear the connection down. Idempotent.
    async fn close(&self);
}

/// Establishes voice connections
#[async_trait]
pub trait VoiceConnector: Send + Sync {
    /// Join `channel` in `guild` and return its frame sink
    async fn connect(&self, guild: GuildId, channel: ChannelId) -> Result<Box<dyn VoiceSink>>;

    /// Drop whatever connection exists for `guild`, used when a driver had to
    /// be aborted before it could close its own sink
    async fn disconnect(&self, guild: GuildId);
}

/// Live view of who is sitting in voice channels
pub trait PresenceSource: Send + Sync {
    /// Humans currently in `channel`, or `None` when the platform state for
    /// `guild` is not known yet
    fn humans_in(&self, guild: GuildId, channel: ChannelId) -> Option<usize>;
}
