//! ffmpeg transcoder
//!
//! Pipes the engine's audio through an `ffmpeg` child process and cuts its
//! raw s16le output into frames as it arrives. The child is killed as soon as
//! the frame stream is dropped.

use async_trait::async_trait;
use bytes::Bytes;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use yomiage_core::{
    create_frame_stream, AudioFrame, FrameStream, FrameStreamSender, Transcoder, FRAME_BYTES,
    FRAME_CHANNELS, FRAME_SAMPLE_RATE,
};

use super::FRAME_BUFFER;
use crate::types::VoiceError;

/// Transcoder backed by an external ffmpeg binary
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg_path: String,
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegTranscoder {
    /// Transcoder running the ffmpeg binary at `ffmpeg_path`
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    /// Arguments turning any input on stdin into frame-format PCM on stdout
    pub fn args() -> Vec<String> {
        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-i",
            "pipe:0",
            "-f",
            "s16le",
            "-acodec",
            "pcm_s16le",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain([
            "-ar".to_string(),
            FRAME_SAMPLE_RATE.to_string(),
            "-ac".to_string(),
            FRAME_CHANNELS.to_string(),
            "pipe:1".to_string(),
        ])
        .collect()
    }
}

/// Fill `buf` from `reader`, returning fewer bytes only at end of stream
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Cut a PCM byte stream into frames. Returns how many frames were sent, or
/// `None` when the receiver went away.
pub(crate) async fn pump_frames<R: AsyncRead + Unpin>(
    reader: &mut R,
    tx: &FrameStreamSender,
) -> Option<u64> {
    let mut buf = vec![0u8; FRAME_BYTES];
    let mut seq = 0u64;
    loop {
        let n = match read_frame(reader, &mut buf).await {
            Ok(0) => return Some(seq),
            Ok(n) => n,
            Err(e) => {
                let err = VoiceError::Decode(format!("reading transcoder output: {}", e));
                return tx.send(Err(err.into())).await.ok().map(|_| seq);
            }
        };
        // a short read is the padded tail
        if tx.send(AudioFrame::new(seq, &buf[..n])).await.is_err() {
            return None;
        }
        seq += 1;
        if n < FRAME_BYTES {
            return Some(seq);
        }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn transcode(&self, audio: Bytes) -> yomiage_core::Result<FrameStream> {
        let mut child = Command::new(&self.ffmpeg_path)
            .args(Self::args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VoiceError::Decode(format!("failed to start {}: {}", self.ffmpeg_path, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| VoiceError::Decode("ffmpeg stdin unavailable".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| VoiceError::Decode("ffmpeg stdout unavailable".into()))?;
        let mut stderr = child.stderr.take();

        tokio::spawn(async move {
            // a broken pipe here means ffmpeg already gave up; its exit status says why
            let _ = stdin.write_all(&audio).await;
            let _ = stdin.shutdown().await;
        });
        let diagnostics = tokio::spawn(async move {
            let mut text = String::new();
            if let Some(stderr) = stderr.as_mut() {
                let _ = stderr.take(16 * 1024).read_to_string(&mut text).await;
            }
            text
        });

        let (tx, rx) = create_frame_stream(FRAME_BUFFER);
        tokio::spawn(async move {
            let Some(frames) = pump_frames(&mut stdout, &tx).await else {
                tracing::trace!("Frame stream dropped, stopping ffmpeg");
                return;
            };
            let status = child.wait().await;
            let stderr = diagnostics.await.unwrap_or_default();
            match status {
                Ok(status) if status.success() => {
                    tracing::trace!(frames, "ffmpeg finished");
                }
                Ok(status) => {
                    let err = VoiceError::Decode(format!(
                        "ffmpeg exited with {} after {} frames: {}",
                        status,
                        frames,
                        stderr.trim()
                    ));
                    let _ = tx.send(Err(err.into())).await;
                }
                Err(e) => {
                    let _ = tx
                        .send(Err(VoiceError::Decode(format!("waiting for ffmpeg: {}", e)).into()))
                        .await;
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_request_frame_format() {
        let args = FfmpegTranscoder::args().join(" ");
        assert!(args.contains("-i pipe:0"));
        assert!(args.contains("-f s16le"));
        assert!(args.contains("-ar 48000"));
        assert!(args.contains("-ac 2"));
        assert!(args.ends_with("pipe:1"));
    }

    #[tokio::test]
    async fn test_pump_cuts_frames_and_pads_tail() {
        let pcm = vec![1u8; FRAME_BYTES * 2 + 100];
        let mut reader = std::io::Cursor::new(pcm);
        let (tx, mut rx) = create_frame_stream(8);

        let sent = pump_frames(&mut reader, &tx).await;
        drop(tx);
        assert_eq!(sent, Some(3));

        let mut seqs = Vec::new();
        while let Some(frame) = rx.recv().await {
            let frame = frame.unwrap();
            assert_eq!(frame.pcm.len(), FRAME_BYTES);
            seqs.push(frame.seq);
        }
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_pump_stops_when_receiver_drops() {
        let mut reader = std::io::Cursor::new(vec![0u8; FRAME_BYTES * 10]);
        let (tx, rx) = create_frame_stream(1);
        drop(rx);
        assert_eq!(pump_frames(&mut reader, &tx).await, None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_decode_error() {
        let transcoder = FfmpegTranscoder::new("/nonexistent/ffmpeg-for-tests");
        let err = transcoder.transcode(Bytes::from_static(b"RIFF")).await.unwrap_err();
        assert!(matches!(err, yomiage_core::ReadoutError::DecodeError(_)));
    }
}
