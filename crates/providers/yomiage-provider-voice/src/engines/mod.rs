//! Synthesis engines

pub mod voicevox;

pub use voicevox::{VoicevoxClient, VoicevoxConfig};
