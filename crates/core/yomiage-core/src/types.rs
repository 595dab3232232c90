//! Core types shared by every stage of the readout pipeline

use crate::error::{ReadoutError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

macro_rules! snowflake {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Raw snowflake value
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }
    };
}

snowflake!(
    /// Chat server (guild) identifier; the unit of voice-session isolation
    GuildId
);
snowflake!(
    /// Text or voice channel identifier
    ChannelId
);
snowflake!(
    /// User identifier
    UserId
);

/// Voice/style parameters sent to the synthesis engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceParams {
    /// Engine speaker (style) id
    pub speaker: u32,
    /// Raise pitch at the end of questions
    pub interrogative_upspeak: bool,
}

impl VoiceParams {
    /// Params for a speaker with upspeak enabled
    pub fn speaker(speaker: u32) -> Self {
        Self {
            speaker,
            interrogative_upspeak: true,
        }
    }
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self::speaker(crate::config::DEFAULT_SPEAKER)
    }
}

/// One unit of text submitted for synthesis and playback.
///
/// Immutable once created; consumed exactly once by the guild's driver.
#[derive(Debug, Clone)]
pub struct Utterance {
    guild_id: GuildId,
    speaker_id: UserId,
    text: String,
    voice: VoiceParams,
    submitted_at: Instant,
}

impl Utterance {
    /// Build an utterance. Text is trimmed; empty text is rejected and text
    /// longer than `max_chars` characters is cut at a character boundary.
    pub fn new(
        guild_id: GuildId,
        speaker_id: UserId,
        text: &str,
        voice: VoiceParams,
        max_chars: usize,
    ) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ReadoutError::invalid_input("utterance text is empty"));
        }
        let text = match trimmed.char_indices().nth(max_chars) {
            Some((cut, _)) => trimmed[..cut].to_string(),
            None => trimmed.to_string(),
        };
        Ok(Self {
            guild_id,
            speaker_id,
            text,
            voice,
            submitted_at: Instant::now(),
        })
    }

    /// Guild this utterance belongs to
    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// Author of the text (or the bot itself for announcements)
    pub fn speaker_id(&self) -> UserId {
        self.speaker_id
    }

    /// Text to synthesize
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Voice parameters for the synthesis call
    pub fn voice(&self) -> &VoiceParams {
        &self.voice
    }

    /// When the utterance was created
    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }
}

/// Sample rate of voice frames (Hz)
pub const FRAME_SAMPLE_RATE: u32 = 48_000;
/// Interleaved channel count of voice frames
pub const FRAME_CHANNELS: u16 = 2;
/// Nominal duration of one voice frame
pub const FRAME_DURATION: Duration = Duration::from_millis(20);
/// Samples per channel in one frame
pub const FRAME_SAMPLES_PER_CHANNEL: usize = 960;
/// Bytes in one frame of interleaved signed 16-bit little-endian PCM
pub const FRAME_BYTES: usize = FRAME_SAMPLES_PER_CHANNEL * FRAME_CHANNELS as usize * 2;

/// Fixed-duration chunk of 48 kHz stereo s16le PCM with its sequence number
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Position within the utterance, starting at 0
    pub seq: u64,
    /// Interleaved PCM, exactly `FRAME_BYTES` long
    pub pcm: Bytes,
}

impl AudioFrame {
    /// Create a frame, padding a short final chunk with silence
    pub fn new(seq: u64, pcm: &[u8]) -> Result<Self> {
        if pcm.len() > FRAME_BYTES {
            return Err(ReadoutError::decode(format!(
                "frame {} is {} bytes, expected at most {}",
                seq,
                pcm.len(),
                FRAME_BYTES
            )));
        }
        let pcm = if pcm.len() == FRAME_BYTES {
            Bytes::copy_from_slice(pcm)
        } else {
            let mut padded = pcm.to_vec();
            padded.resize(FRAME_BYTES, 0);
            Bytes::from(padded)
        };
        Ok(Self { seq, pcm })
    }

    /// A frame of silence
    pub fn silence(seq: u64) -> Self {
        Self {
            seq,
            pcm: Bytes::from(vec![0u8; FRAME_BYTES]),
        }
    }

    /// Nominal playback duration
    pub fn duration(&self) -> Duration {
        FRAME_DURATION
    }

    /// Iterate the interleaved samples
    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.pcm
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
    }
}

/// Lazy, finite, non-restartable sequence of frames for one utterance
pub type FrameStream = mpsc::Receiver<Result<AudioFrame>>;

/// Sender half of a frame stream
pub type FrameStreamSender = mpsc::Sender<Result<AudioFrame>>;

/// Create a frame stream channel
pub fn create_frame_stream(buffer_size: usize) -> (FrameStreamSender, FrameStream) {
    mpsc::channel(buffer_size)
}

/// Playback driver state for one guild
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    /// Waiting for the next utterance
    Idle,
    /// Synthesis call in flight
    Synthesizing,
    /// Emitting frames to the voice connection
    Streaming,
    /// Loop exited; the session is gone
    Terminated,
}

impl DriverState {
    /// Whether an utterance is in flight
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Synthesizing | Self::Streaming)
    }
}
