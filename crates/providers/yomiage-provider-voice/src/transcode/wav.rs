//! In-process WAV transcoder
//!
//! VOICEVOX-compatible engines answer with PCM WAV (24 kHz mono by default),
//! so ffmpeg is not strictly needed. Samples are converted to stereo and
//! linearly resampled to the frame rate.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::Cursor;
use yomiage_core::{
    create_frame_stream, AudioFrame, FrameStream, Transcoder, FRAME_BYTES, FRAME_SAMPLE_RATE,
};

use super::FRAME_BUFFER;
use crate::types::VoiceError;

/// Decode a WAV payload into interleaved 48 kHz stereo samples
pub fn decode_wav(audio: &[u8]) -> Result<Vec<i16>, VoiceError> {
    let mut reader = hound::WavReader::new(Cursor::new(audio))?;
    let spec = reader.spec();
    if spec.channels == 0 || spec.sample_rate == 0 {
        return Err(VoiceError::Decode("WAV header has no channels or rate".into()));
    }

    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Float, 32) => reader.samples::<f32>().collect::<Result<_, _>>()?,
        (hound::SampleFormat::Int, bits @ 8..=32) => {
            let scale = (1i64 << (bits - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
        (format, bits) => {
            return Err(VoiceError::UnsupportedFormat(format!(
                "{:?} with {} bits per sample",
                format, bits
            )))
        }
    };

    let channels = usize::from(spec.channels);
    let (left, right): (Vec<f32>, Vec<f32>) = samples
        .chunks_exact(channels)
        .map(|frame| {
            let l = frame[0];
            let r = if channels > 1 { frame[1] } else { l };
            (l, r)
        })
        .unzip();

    let left = resample(&left, spec.sample_rate, FRAME_SAMPLE_RATE);
    let right = resample(&right, spec.sample_rate, FRAME_SAMPLE_RATE);

    Ok(left
        .iter()
        .zip(right.iter())
        .flat_map(|(l, r)| [to_i16(*l), to_i16(*r)])
        .collect())
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

/// Linear interpolation resampler
fn resample(input: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || input.is_empty() {
        return input.to_vec();
    }
    let out_len = ((input.len() as u64 * u64::from(to)).div_ceil(u64::from(from))) as usize;
    let step = f64::from(from) / f64::from(to);
    let last = input.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            input[idx] * (1.0 - frac) + input[next] * frac
        })
        .collect()
}

/// Transcoder for PCM WAV payloads
#[derive(Debug, Clone, Default)]
pub struct WavTranscoder;

impl WavTranscoder {
    /// Create a WAV transcoder
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transcoder for WavTranscoder {
    fn name(&self) -> &str {
        "wav"
    }

    async fn transcode(&self, audio: Bytes) -> yomiage_core::Result<FrameStream> {
        let samples = tokio::task::spawn_blocking(move || decode_wav(&audio))
            .await
            .map_err(|e| VoiceError::Decode(format!("decoder task failed: {}", e)))??;

        let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let (tx, rx) = create_frame_stream(FRAME_BUFFER);
        tokio::spawn(async move {
            for (seq, chunk) in pcm.chunks(FRAME_BYTES).enumerate() {
                if tx.send(AudioFrame::new(seq as u64, chunk)).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
