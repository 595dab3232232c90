//! Engine audio to 48 kHz stereo playback frames

pub mod ffmpeg;
pub mod wav;

pub use ffmpeg::FfmpegTranscoder;
pub use wav::{decode_wav, WavTranscoder};

/// Frames buffered between a transcoder and the playback driver
pub const FRAME_BUFFER: usize = 32;
