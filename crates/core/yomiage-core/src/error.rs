//! Error types for the readout pipeline

use crate::types::GuildId;
use std::time::Duration;
use thiserror::Error;

/// Main error type for yomiage operations
#[derive(Debug, Error)]
pub enum ReadoutError {
    /// Establishing the voice connection failed
    #[error("Voice connect failed for guild {guild_id}: {reason}")]
    ConnectFailed {
        /// Guild the join was attempted in
        guild_id: GuildId,
        /// Underlying cause
        reason: String,
    },

    /// Readout queue is at capacity and the overflow policy rejected the utterance
    #[error("Readout queue full for guild {guild_id} (capacity {capacity})")]
    QueueFull {
        /// Guild whose queue overflowed
        guild_id: GuildId,
        /// Configured capacity
        capacity: usize,
    },

    /// Synthesis engine unreachable or answered with a server error
    #[error("Synthesis engine unavailable: {0}")]
    SynthesisUnavailable(String),

    /// Synthesis call exceeded its deadline
    #[error("Synthesis timed out after {0:?}")]
    SynthesisTimeout(Duration),

    /// Synthesis engine refused the text
    #[error("Invalid synthesis input: {0}")]
    InvalidInput(String),

    /// Synthesized audio could not be turned into frames
    #[error("Audio decode error: {0}")]
    DecodeError(String),

    /// A session already exists for the guild
    #[error("Already joined a voice channel in guild {0}")]
    AlreadyJoined(GuildId),

    /// No session exists for the guild
    #[error("Not joined to a voice channel in guild {0}")]
    NotJoined(GuildId),

    /// The session's queue was closed while the operation was in progress
    #[error("Session for guild {0} is closed")]
    SessionClosed(GuildId),

    /// The voice connection dropped underneath the driver
    #[error("Voice connection lost: {0}")]
    ConnectionLost(String),

    /// A frame could not be handed to the voice connection in time
    #[error("Voice frame send timed out after {0:?}")]
    SinkTimeout(Duration),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Convenient Result type using ReadoutError
pub type Result<T> = std::result::Result<T, ReadoutError>;

impl ReadoutError {
    /// Create a connect failure
    pub fn connect_failed(guild_id: GuildId, reason: impl Into<String>) -> Self {
        ReadoutError::ConnectFailed {
            guild_id,
            reason: reason.into(),
        }
    }

    /// Create a synthesis-unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        ReadoutError::SynthesisUnavailable(msg.into())
    }

    /// Create an invalid-input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        ReadoutError::InvalidInput(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        ReadoutError::DecodeError(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        ReadoutError::Config(msg.into())
    }

    /// Create a connection-lost error
    pub fn connection_lost(msg: impl Into<String>) -> Self {
        ReadoutError::ConnectionLost(msg.into())
    }

    /// Failures that end the current utterance but never the guild's session
    pub fn is_utterance_scoped(&self) -> bool {
        matches!(
            self,
            ReadoutError::SynthesisUnavailable(_)
                | ReadoutError::SynthesisTimeout(_)
                | ReadoutError::InvalidInput(_)
                | ReadoutError::DecodeError(_)
        )
    }

    /// Failures meaning the voice connection can no longer carry audio
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, ReadoutError::ConnectionLost(_))
    }
}
