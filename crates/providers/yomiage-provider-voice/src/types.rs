//! Provider error type

use std::time::Duration;
use yomiage_core::ReadoutError;

/// Synthesis and transcoding failures
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Engine refused the text (HTTP 400/422)
    #[error("Engine rejected input: {0}")]
    InvalidInput(String),

    /// Engine unreachable, failing, or answering with nothing
    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    /// Engine did not answer within the deadline
    #[error("Engine timed out after {0:?}")]
    Timeout(Duration),

    /// Audio could not be decoded into frames
    #[error("Audio decode failed: {0}")]
    Decode(String),

    /// Audio container or sample layout not handled
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    /// Provider misconfigured
    #[error("Provider configuration error: {0}")]
    Config(String),
}

impl VoiceError {
    /// Ordering used when several endpoints fail: the most informative
    /// error is reported
    pub(crate) fn precedence(&self) -> u8 {
        match self {
            VoiceError::InvalidInput(_) => 3,
            VoiceError::Timeout(_) => 2,
            VoiceError::Unavailable(_) => 1,
            _ => 0,
        }
    }
}

impl From<VoiceError> for ReadoutError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::InvalidInput(msg) => ReadoutError::InvalidInput(msg),
            VoiceError::Unavailable(msg) => ReadoutError::SynthesisUnavailable(msg),
            VoiceError::Timeout(after) => ReadoutError::SynthesisTimeout(after),
            VoiceError::Decode(msg) => ReadoutError::DecodeError(msg),
            VoiceError::UnsupportedFormat(msg) => {
                ReadoutError::DecodeError(format!("unsupported format: {}", msg))
            }
            VoiceError::Config(msg) => ReadoutError::Config(msg),
        }
    }
}

impl From<hound::Error> for VoiceError {
    fn from(err: hound::Error) -> Self {
        match err {
            hound::Error::Unsupported => VoiceError::UnsupportedFormat("WAV sample layout".into()),
            other => VoiceError::Decode(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_survives_conversion() {
        let err: ReadoutError = VoiceError::InvalidInput("bad".into()).into();
        assert!(matches!(err, ReadoutError::InvalidInput(_)));

        let err: ReadoutError = VoiceError::Timeout(Duration::from_secs(2)).into();
        assert!(matches!(err, ReadoutError::SynthesisTimeout(d) if d == Duration::from_secs(2)));

        let err: ReadoutError = VoiceError::Unavailable("down".into()).into();
        assert!(err.is_utterance_scoped());

        let err: ReadoutError = VoiceError::UnsupportedFormat("ALAW".into()).into();
        assert!(matches!(err, ReadoutError::DecodeError(_)));
    }

    #[test]
    fn test_precedence_order() {
        let invalid = VoiceError::InvalidInput(String::new());
        let timeout = VoiceError::Timeout(Duration::from_secs(1));
        let down = VoiceError::Unavailable(String::new());
        assert!(invalid.precedence() > timeout.precedence());
        assert!(timeout.precedence() > down.precedence());
    }
}
