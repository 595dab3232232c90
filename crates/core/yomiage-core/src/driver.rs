//! Playback driver
//!
//! One driver task per guild session. It is the only consumer of the guild's
//! queue and the only writer to its voice sink, which is what keeps a single
//! utterance in flight per guild. Every suspension point races the session's
//! cancellation token, so teardown interrupts a blocked dequeue, a pending
//! synthesis call, frame pacing and a frame send alike.

use crate::error::{ReadoutError, Result};
use crate::metrics::ReadoutMetrics;
use crate::queue::ReadoutQueue;
use crate::traits::{SynthesisClient, Transcoder, VoiceSink};
use crate::types::{DriverState, GuildId, Utterance, FRAME_DURATION};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Timeouts and pacing for one driver
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Deadline for one synthesis call
    pub synthesis_timeout: Duration,
    /// Longest wait for the transcoder to yield the next frame
    pub frame_timeout: Duration,
    /// Deadline for handing one frame to the sink
    pub send_timeout: Duration,
    /// Frames sent ahead of real time before pacing starts
    pub prebuffer_frames: u32,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            synthesis_timeout: Duration::from_secs(10),
            frame_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(1),
            prebuffer_frames: 5,
        }
    }
}

/// Why a driver loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverExit {
    /// The queue was closed while idle
    QueueClosed,
    /// The session's cancellation token fired
    Cancelled,
    /// The voice connection can no longer carry audio
    ConnectionLost(String),
}

/// Result of one utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Playback {
    Completed { frames: u64 },
    Interrupted,
}

/// Per-guild state machine: `Idle → Synthesizing → Streaming → Idle`, and
/// `Terminated` once the loop exits.
pub struct PlaybackDriver {
    guild_id: GuildId,
    queue: Arc<ReadoutQueue>,
    synth: Arc<dyn SynthesisClient>,
    transcoder: Arc<dyn Transcoder>,
    sink: Box<dyn VoiceSink>,
    settings: DriverSettings,
    metrics: Arc<ReadoutMetrics>,
    cancel: CancellationToken,
    state: watch::Sender<DriverState>,
}

impl PlaybackDriver {
    /// Build a driver; the receiver observes its state transitions
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        guild_id: GuildId,
        queue: Arc<ReadoutQueue>,
        synth: Arc<dyn SynthesisClient>,
        transcoder: Arc<dyn Transcoder>,
        sink: Box<dyn VoiceSink>,
        settings: DriverSettings,
        metrics: Arc<ReadoutMetrics>,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<DriverState>) {
        let (state, state_rx) = watch::channel(DriverState::Idle);
        (
            Self {
                guild_id,
                queue,
                synth,
                transcoder,
                sink,
                settings,
                metrics,
                cancel,
                state,
            },
            state_rx,
        )
    }

    fn set_state(&self, next: DriverState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            trace!(guild_id = %self.guild_id, from = ?prev, to = ?next, "Driver state");
        }
    }

    /// Run until the queue closes, the token is cancelled or the connection
    /// is lost. The sink is closed before returning.
    pub async fn run(self) -> DriverExit {
        info!(guild_id = %self.guild_id, synth = self.synth.name(), transcoder = self.transcoder.name(), "Playback driver started");

        let exit = loop {
            self.set_state(DriverState::Idle);

            let utterance = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break DriverExit::Cancelled,
                next = self.queue.dequeue_blocking() => match next {
                    Some(utterance) => utterance,
                    None => break DriverExit::QueueClosed,
                },
            };

            match self.play(&utterance).await {
                Ok(Playback::Completed { frames }) => {
                    self.metrics.record_completed();
                    debug!(
                        guild_id = %self.guild_id,
                        frames,
                        waited_ms = utterance.submitted_at().elapsed().as_millis() as u64,
                        "Utterance played"
                    );
                }
                Ok(Playback::Interrupted) => {
                    self.metrics.record_interrupted();
                    break DriverExit::Cancelled;
                }
                Err(ReadoutError::ConnectionLost(reason)) => {
                    self.metrics.record_interrupted();
                    warn!(guild_id = %self.guild_id, reason = %reason, "Voice connection lost");
                    break DriverExit::ConnectionLost(reason);
                }
                Err(e) => {
                    // terminal for this utterance only; never retried
                    warn!(
                        guild_id = %self.guild_id,
                        user_id = %utterance.speaker_id(),
                        error = %e,
                        "Utterance dropped"
                    );
                }
            }
        };

        self.set_state(DriverState::Terminated);
        self.sink.close().await;
        info!(guild_id = %self.guild_id, exit = ?exit, "Playback driver stopped");
        exit
    }

    async fn play(&self, utterance: &Utterance) -> Result<Playback> {
        self.set_state(DriverState::Synthesizing);
        let synthesis_timeout = self.settings.synthesis_timeout;
        let audio = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(Playback::Interrupted),
            result = timeout(synthesis_timeout, self.synth.synthesize(utterance.text(), utterance.voice())) => {
                match result {
                    Ok(Ok(audio)) => audio,
                    Ok(Err(e)) => {
                        if matches!(e, ReadoutError::SynthesisTimeout(_)) {
                            self.metrics.record_synthesis_timeout();
                        } else {
                            self.metrics.record_synthesis_failure();
                        }
                        return Err(e);
                    }
                    Err(_) => {
                        self.metrics.record_synthesis_timeout();
                        return Err(ReadoutError::SynthesisTimeout(synthesis_timeout));
                    }
                }
            }
        };

        self.set_state(DriverState::Streaming);
        let mut frames = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(Playback::Interrupted),
            result = self.transcoder.transcode(audio) => result.inspect_err(|_| {
                self.metrics.record_decode_failure();
            })?,
        };

        let lead = u64::from(self.settings.prebuffer_frames);
        let mut started: Option<Instant> = None;
        let mut sent: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(Playback::Interrupted),
                next = timeout(self.settings.frame_timeout, frames.recv()) => next,
            };
            let frame = match next {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => {
                    self.metrics.record_decode_failure();
                    return Err(e);
                }
                Ok(None) => break,
                Err(_) => {
                    self.metrics.record_decode_failure();
                    return Err(ReadoutError::decode(format!(
                        "transcoder produced no frame within {:?}",
                        self.settings.frame_timeout
                    )));
                }
            };

            // the clock starts at the first frame, not when transcoding began
            let started = *started.get_or_insert_with(Instant::now);
            if sent >= lead {
                let offset = u32::try_from(sent - lead).unwrap_or(u32::MAX);
                let due = started + FRAME_DURATION * offset;
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Ok(Playback::Interrupted),
                    _ = sleep_until(due) => {}
                }
            }

            trace!(guild_id = %self.guild_id, seq = frame.seq, "Sending frame");
            let send_timeout = self.settings.send_timeout;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(Playback::Interrupted),
                result = timeout(send_timeout, self.sink.send_frame(frame)) => match result {
                    Ok(Ok(())) => self.metrics.record_frame_sent(),
                    Ok(Err(e)) => return Err(e),
                    Err(_) => return Err(ReadoutError::SinkTimeout(send_timeout)),
                },
            }
            sent += 1;
        }

        Ok(Playback::Completed { frames: sent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::OverflowPolicy;
    use crate::testing::{PcmTranscoder, RecordingSink, ScriptedSynth, SynthStep};
    use crate::types::{UserId, VoiceParams};

    struct Harness {
        queue: Arc<ReadoutQueue>,
        sink: RecordingSink,
        synth: Arc<ScriptedSynth>,
        metrics: Arc<ReadoutMetrics>,
        cancel: CancellationToken,
        state: watch::Receiver<DriverState>,
        task: tokio::task::JoinHandle<DriverExit>,
    }

    fn start(synth: ScriptedSynth, settings: DriverSettings) -> Harness {
        let queue = Arc::new(ReadoutQueue::new(GuildId(1), 8, OverflowPolicy::DropOldest));
        let sink = RecordingSink::new();
        let synth = Arc::new(synth);
        let metrics = Arc::new(ReadoutMetrics::new());
        let cancel = CancellationToken::new();
        let (driver, state) = PlaybackDriver::new(
            GuildId(1),
            queue.clone(),
            synth.clone(),
            Arc::new(PcmTranscoder::new()),
            Box::new(sink.clone()),
            settings,
            metrics.clone(),
            cancel.clone(),
        );
        let task = tokio::spawn(driver.run());
        Harness {
            queue,
            sink,
            synth,
            metrics,
            cancel,
            state,
            task,
        }
    }

    fn utterance(text: &str) -> Utterance {
        Utterance::new(GuildId(1), UserId(2), text, VoiceParams::default(), 100).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_plays_in_order_then_closes() {
        let h = start(ScriptedSynth::new().frames_per_call(3), DriverSettings::default());
        for text in ["one", "two", "three"] {
            h.queue.enqueue(utterance(text)).unwrap();
        }
        h.sink.wait_for_frames(9).await;

        h.queue.close();
        assert_eq!(h.task.await.unwrap(), DriverExit::QueueClosed);
        assert_eq!(h.synth.calls(), vec!["one", "two", "three"]);
        assert_eq!(h.sink.frame_tags(), vec![0, 0, 0, 1, 1, 1, 2, 2, 2]);
        assert!(h.sink.is_closed());
        assert_eq!(*h.state.borrow(), DriverState::Terminated);
        assert_eq!(h.metrics.snapshot().utterances_completed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_synthesis_does_not_block_next() {
        let synth = ScriptedSynth::new()
            .frames_per_call(2)
            .script("bad", SynthStep::Unavailable);
        let h = start(synth, DriverSettings::default());
        h.queue.enqueue(utterance("bad")).unwrap();
        h.queue.enqueue(utterance("good")).unwrap();

        h.sink.wait_for_frames(2).await;
        h.cancel.cancel();
        assert_eq!(h.task.await.unwrap(), DriverExit::Cancelled);

        assert_eq!(h.synth.calls(), vec!["bad", "good"]);
        let snap = h.metrics.snapshot();
        assert_eq!(snap.synthesis_failures, 1);
        assert_eq!(snap.utterances_completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthesis_timeout_returns_to_idle_without_audio() {
        let settings = DriverSettings {
            synthesis_timeout: Duration::from_secs(2),
            ..DriverSettings::default()
        };
        let mut h = start(ScriptedSynth::new().script("slow", SynthStep::Hang), settings);
        let begin = Instant::now();
        h.queue.enqueue(utterance("slow")).unwrap();

        h.state
            .wait_for(|s| *s == DriverState::Synthesizing)
            .await
            .unwrap();
        h.state.wait_for(|s| *s == DriverState::Idle).await.unwrap();

        let elapsed = begin.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_millis(2100));
        assert_eq!(h.sink.frame_count(), 0);
        assert_eq!(h.metrics.snapshot().synthesis_timeouts, 1);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_are_paced_after_prebuffer() {
        let settings = DriverSettings {
            prebuffer_frames: 2,
            ..DriverSettings::default()
        };
        let h = start(ScriptedSynth::new().frames_per_call(12), settings);
        h.queue.enqueue(utterance("long")).unwrap();
        h.sink.wait_for_frames(12).await;

        let times = h.sink.frame_times();
        let first = times[0];
        // 2 frames of lead, then one frame per 20 ms
        assert!(times[2] - first < Duration::from_millis(5));
        let span = times[11] - first;
        assert!(span >= Duration::from_millis(180), "span {:?}", span);
        assert!(span < Duration::from_millis(220), "span {:?}", span);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_transcoder_start_does_not_burst() {
        let settings = DriverSettings {
            prebuffer_frames: 2,
            ..DriverSettings::default()
        };
        let queue = Arc::new(ReadoutQueue::new(GuildId(1), 8, OverflowPolicy::DropOldest));
        let sink = RecordingSink::new();
        let cancel = CancellationToken::new();
        let (driver, _state) = PlaybackDriver::new(
            GuildId(1),
            queue.clone(),
            Arc::new(ScriptedSynth::new().frames_per_call(12)),
            Arc::new(PcmTranscoder::with_startup_delay(Duration::from_millis(500))),
            Box::new(sink.clone()),
            settings,
            Arc::new(ReadoutMetrics::new()),
            cancel.clone(),
        );
        let task = tokio::spawn(driver.run());
        queue.enqueue(utterance("late start")).unwrap();
        sink.wait_for_frames(12).await;

        let times = sink.frame_times();
        let span = times[11] - times[0];
        assert!(span >= Duration::from_millis(180), "span {:?}", span);
        assert!(span < Duration::from_millis(220), "span {:?}", span);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_stream_stops_frames() {
        let settings = DriverSettings {
            prebuffer_frames: 0,
            ..DriverSettings::default()
        };
        let mut h = start(ScriptedSynth::new().frames_per_call(500), settings);
        h.queue.enqueue(utterance("endless")).unwrap();
        h.state
            .wait_for(|s| *s == DriverState::Streaming)
            .await
            .unwrap();
        h.sink.wait_for_frames(10).await;

        h.cancel.cancel();
        let exit = tokio::time::timeout(Duration::from_millis(100), h.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, DriverExit::Cancelled);

        let frozen = h.sink.frame_count();
        assert!(frozen < 500);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.sink.frame_count(), frozen);
        assert!(h.sink.is_closed());
        assert_eq!(h.metrics.snapshot().utterances_interrupted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_connection_ends_driver() {
        let h = start(ScriptedSynth::new().frames_per_call(5), DriverSettings::default());
        h.sink.fail_after(2);
        h.queue.enqueue(utterance("x")).unwrap();

        let exit = h.task.await.unwrap();
        assert!(matches!(exit, DriverExit::ConnectionLost(_)));
        assert_eq!(h.sink.frame_count(), 2);
    }
}
