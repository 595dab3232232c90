//! yomiage core
//!
//! Per-guild text-to-speech readout pipeline. Chat events go through the
//! [`router::MessageRouter`], which builds utterances and admits them into
//! the guild's bounded [`queue::ReadoutQueue`]. One
//! [`driver::PlaybackDriver`] per guild synthesizes each utterance, turns the
//! audio into 20 ms frames and paces them into the voice connection. The
//! [`session::GuildSessionManager`] owns every session and serializes joins
//! and leaves per guild.
//!
//! Platform and engine specifics stay behind the traits in [`traits`]; the
//! Discord adaptor and the VOICEVOX provider implement them.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use yomiage_core::testing::{FakeConnector, PcmTranscoder, ScriptedSynth};
//! use yomiage_core::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ReadoutConfig::default();
//!     let manager = GuildSessionManager::new(
//!         Arc::new(FakeConnector::new()),
//!         Arc::new(ScriptedSynth::new()),
//!         Arc::new(PcmTranscoder::new()),
//!         Arc::new(ReadoutMetrics::new()),
//!         config.session_settings(),
//!     );
//!     manager.join(GuildId(1), ChannelId(10)).await?;
//!     manager.leave(GuildId(1)).await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod roster;
pub mod router;
pub mod session;
pub mod testing;
pub mod traits;
pub mod types;

pub use config::{load_env, ReadoutConfig, TranscoderKind, DEFAULT_CONFIG_PATH, DEFAULT_SPEAKER};
pub use driver::{DriverExit, DriverSettings, PlaybackDriver};
pub use error::{ReadoutError, Result};
pub use event::{
    create_event_channel, Author, ChatEvent, ChatEventReceiver, ChatEventSender, InboundMessage,
    Mention, VoiceStateChange,
};
pub use logging::init_logging;
pub use metrics::{MetricsSnapshot, ReadoutMetrics};
pub use queue::{Admission, OverflowPolicy, ReadoutQueue};
pub use roster::{SpeakerEntry, SpeakerRoster};
pub use router::{
    DropReason, FilterRule, IgnoreReason, MessageRouter, RouteOutcome, RouterRules,
    RouterSettings, TextRule,
};
pub use session::{GuildSessionManager, SessionHandle, SessionSettings};
pub use traits::{PresenceSource, SynthesisClient, Transcoder, VoiceConnector, VoiceSink};
pub use types::{
    create_frame_stream, AudioFrame, ChannelId, DriverState, FrameStream, FrameStreamSender,
    GuildId, UserId, Utterance, VoiceParams, FRAME_BYTES, FRAME_CHANNELS, FRAME_DURATION,
    FRAME_SAMPLES_PER_CHANNEL, FRAME_SAMPLE_RATE,
};
