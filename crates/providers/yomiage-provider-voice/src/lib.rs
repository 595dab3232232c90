//! Voice provider for yomiage
//!
//! Implements the core's synthesis and transcoding seams.
//!
//! ## Synthesis
//! - VOICEVOX-compatible engines (VOICEVOX, AivisSpeech, COEIROINK) over
//!   their two step HTTP API, raced across every configured endpoint
//!
//! ## Transcoding
//! - ffmpeg (default) - any container the engine returns
//! - WAV - in-process decoding with hound, no external binary

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engines;
pub mod transcode;
mod types;

pub use engines::{VoicevoxClient, VoicevoxConfig};
pub use transcode::{decode_wav, FfmpegTranscoder, WavTranscoder};
pub use types::VoiceError;

use std::sync::Arc;
use yomiage_core::config::{SynthesisSection, TranscoderSection};
use yomiage_core::{TranscoderKind, Transcoder};

struct SettingRow {
    name: &'static str,
    value: String,
}

fn pad(s: &str, w: usize) -> String {
    let mut out: String = s.chars().take(w).collect();
    let len = out.chars().count();
    out.push_str(&" ".repeat(w.saturating_sub(len)));
    out
}

fn render(title: &str, rows: &[SettingRow]) {
    let line = format!("+{}+", "-".repeat(62));
    tracing::info!("{}", line);
    tracing::info!("|{}|", pad(&format!(" {} ", title.to_uppercase()), 62));
    tracing::info!("+{}+", "=".repeat(62));
    for row in rows {
        tracing::info!("|{}|{}|", pad(row.name, 20), pad(&row.value, 41));
    }
    tracing::info!("{}", line);
}

/// Log the effective provider settings as a table
pub fn log_settings(synthesis: &SynthesisSection, transcoder: &TranscoderSection) {
    let mut rows: Vec<SettingRow> = synthesis
        .endpoints
        .iter()
        .map(|e| SettingRow {
            name: "endpoint",
            value: e.clone(),
        })
        .collect();
    rows.push(SettingRow {
        name: "timeout",
        value: format!("{} ms", synthesis.timeout_ms),
    });
    rows.push(SettingRow {
        name: "default speaker",
        value: synthesis.default_speaker.to_string(),
    });
    rows.push(SettingRow {
        name: "transcoder",
        value: match transcoder.kind {
            TranscoderKind::Ffmpeg => format!("ffmpeg ({})", transcoder.ffmpeg_path),
            TranscoderKind::Wav => "wav".to_string(),
        },
    });
    render("voice provider", &rows);
}

/// Build the synthesis client described by the config
pub fn synthesizer_from_config(section: &SynthesisSection) -> Result<VoicevoxClient, VoiceError> {
    VoicevoxClient::new(VoicevoxConfig::from(section))
}

/// Build the transcoder described by the config
pub fn transcoder_from_config(section: &TranscoderSection) -> Arc<dyn Transcoder> {
    match section.kind {
        TranscoderKind::Ffmpeg => Arc::new(FfmpegTranscoder::new(section.ffmpeg_path.clone())),
        TranscoderKind::Wav => Arc::new(WavTranscoder::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_truncates_and_fills() {
        assert_eq!(pad("abc", 5), "abc  ");
        assert_eq!(pad("読み上げ開始", 3), "読み上");
    }

    #[test]
    fn test_transcoder_follows_kind() {
        let mut section = TranscoderSection::default();
        assert_eq!(transcoder_from_config(&section).name(), "ffmpeg");
        section.kind = TranscoderKind::Wav;
        assert_eq!(transcoder_from_config(&section).name(), "wav");
    }

    #[test]
    fn test_synthesizer_uses_configured_endpoints() {
        let section = SynthesisSection {
            endpoints: vec!["http://engine-a:50021".into(), "http://engine-b:50021/".into()],
            ..SynthesisSection::default()
        };
        let client = synthesizer_from_config(&section).unwrap();
        assert_eq!(client.endpoints(), ["http://engine-a:50021", "http://engine-b:50021"]);
    }
}
