//! In-memory collaborators for tests
//!
//! `ScriptedSynth` returns a tiny fake payload naming the call index and a
//! frame count; `PcmTranscoder` expands that payload into frames whose first
//! sample carries the call index, so a `RecordingSink` can tell which
//! utterance every frame came from.

use crate::error::{ReadoutError, Result};
use crate::traits::{PresenceSource, SynthesisClient, Transcoder, VoiceConnector, VoiceSink};
use crate::types::{create_frame_stream, AudioFrame, ChannelId, FrameStream, GuildId, VoiceParams, FRAME_BYTES};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// What a scripted synthesis call does
#[derive(Debug, Clone)]
pub enum SynthStep {
    /// Succeed with this many frames
    Frames(u32),
    /// Fail with `SynthesisUnavailable`
    Unavailable,
    /// Fail with `InvalidInput`
    Invalid,
    /// Succeed with a payload the transcoder cannot decode
    Garbage,
    /// Never answer
    Hang,
    /// Answer with the default frame count after a delay
    Delay(Duration),
}

/// Synthesis client driven by a per-text script
#[derive(Debug)]
pub struct ScriptedSynth {
    frames_per_call: u32,
    script: HashMap<String, SynthStep>,
    otherwise: Option<SynthStep>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for ScriptedSynth {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSynth {
    pub fn new() -> Self {
        Self {
            frames_per_call: 3,
            script: HashMap::new(),
            otherwise: None,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Frames produced by unscripted texts
    pub fn frames_per_call(mut self, frames: u32) -> Self {
        self.frames_per_call = frames;
        self
    }

    /// Behaviour for one exact text
    pub fn script(mut self, text: impl Into<String>, step: SynthStep) -> Self {
        self.script.insert(text.into(), step);
        self
    }

    /// Behaviour for every unscripted text
    pub fn otherwise(mut self, step: SynthStep) -> Self {
        self.otherwise = Some(step);
        self
    }

    /// Texts in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Highest number of concurrent calls observed
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Encode the fake payload understood by `PcmTranscoder`
pub fn fake_audio(tag: u32, frames: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32_le(tag);
    buf.put_u32_le(frames);
    buf.freeze()
}

#[async_trait]
impl SynthesisClient for ScriptedSynth {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn synthesize(&self, text: &str, _voice: &VoiceParams) -> Result<Bytes> {
        let tag = {
            let mut calls = self.calls.lock();
            calls.push(text.to_string());
            (calls.len() - 1) as u32
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let step = self.script.get(text).or(self.otherwise.as_ref()).cloned();
        match step {
            None => Ok(fake_audio(tag, self.frames_per_call)),
            Some(SynthStep::Frames(n)) => Ok(fake_audio(tag, n)),
            Some(SynthStep::Unavailable) => Err(ReadoutError::unavailable("scripted outage")),
            Some(SynthStep::Invalid) => Err(ReadoutError::invalid_input("scripted rejection")),
            Some(SynthStep::Garbage) => Ok(Bytes::from_static(b"not audio")),
            Some(SynthStep::Hang) => std::future::pending().await,
            Some(SynthStep::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(fake_audio(tag, self.frames_per_call))
            }
        }
    }
}

/// Expands `fake_audio` payloads into tagged frames
#[derive(Debug, Default)]
pub struct PcmTranscoder {
    startup: Duration,
}

impl PcmTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait `startup` before the first frame, like a child process spinning up
    pub fn with_startup_delay(startup: Duration) -> Self {
        Self { startup }
    }
}

#[async_trait]
impl Transcoder for PcmTranscoder {
    fn name(&self) -> &str {
        "pcm-fake"
    }

    async fn transcode(&self, audio: Bytes) -> Result<FrameStream> {
        if audio.len() != 8 {
            return Err(ReadoutError::decode("unrecognised fake payload"));
        }
        let tag = u32::from_le_bytes([audio[0], audio[1], audio[2], audio[3]]);
        let count = u32::from_le_bytes([audio[4], audio[5], audio[6], audio[7]]);

        let (tx, rx) = create_frame_stream(16);
        let startup = self.startup;
        tokio::spawn(async move {
            if !startup.is_zero() {
                tokio::time::sleep(startup).await;
            }
            for seq in 0..u64::from(count) {
                let mut pcm = vec![0u8; FRAME_BYTES];
                pcm[..4].copy_from_slice(&tag.to_le_bytes());
                let frame = AudioFrame::new(seq, &pcm);
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[derive(Debug, Clone)]
struct SentFrame {
    seq: u64,
    tag: u32,
    at: Instant,
}

#[derive(Debug)]
struct SinkInner {
    frames: Mutex<Vec<SentFrame>>,
    count: watch::Sender<usize>,
    closed: AtomicBool,
    stalled: AtomicBool,
    fail_after: Mutex<Option<usize>>,
}

/// Voice sink that records every frame it is handed
#[derive(Debug, Clone)]
pub struct RecordingSink {
    inner: Arc<SinkInner>,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            inner: Arc::new(SinkInner {
                frames: Mutex::new(Vec::new()),
                count,
                closed: AtomicBool::new(false),
                stalled: AtomicBool::new(false),
                fail_after: Mutex::new(None),
            }),
        }
    }

    /// Report `ConnectionLost` once `n` frames have been accepted
    pub fn fail_after(&self, n: usize) {
        *self.inner.fail_after.lock() = Some(n);
    }

    /// Make every send hang
    pub fn set_stalled(&self, stalled: bool) {
        self.inner.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn frame_count(&self) -> usize {
        self.inner.frames.lock().len()
    }

    /// Call index carried by each frame, in send order
    pub fn frame_tags(&self) -> Vec<u32> {
        self.inner.frames.lock().iter().map(|f| f.tag).collect()
    }

    /// Sequence numbers in send order
    pub fn frame_seqs(&self) -> Vec<u64> {
        self.inner.frames.lock().iter().map(|f| f.seq).collect()
    }

    /// Send instants in send order
    pub fn frame_times(&self) -> Vec<Instant> {
        self.inner.frames.lock().iter().map(|f| f.at).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` frames were accepted
    pub async fn wait_for_frames(&self, n: usize) {
        let mut rx = self.inner.count.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }
}

#[async_trait]
impl VoiceSink for RecordingSink {
    async fn send_frame(&self, frame: AudioFrame) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ReadoutError::connection_lost("sink closed"));
        }
        if self.inner.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let limit = *self.inner.fail_after.lock();
        let mut frames = self.inner.frames.lock();
        if limit.is_some_and(|n| frames.len() >= n) {
            return Err(ReadoutError::connection_lost("scripted disconnect"));
        }
        let tag = u32::from_le_bytes([frame.pcm[0], frame.pcm[1], frame.pcm[2], frame.pcm[3]]);
        frames.push(SentFrame {
            seq: frame.seq,
            tag,
            at: Instant::now(),
        });
        self.inner.count.send_replace(frames.len());
        Ok(())
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct ConnectorState {
    sinks: HashMap<GuildId, RecordingSink>,
    channels: HashMap<GuildId, ChannelId>,
    failing: HashMap<GuildId, String>,
    hanging: Vec<GuildId>,
    connects: usize,
    disconnects: Vec<GuildId>,
}

/// Connector handing out `RecordingSink`s
#[derive(Debug, Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse connections to `guild`
    pub fn fail_guild(&self, guild: GuildId, reason: impl Into<String>) {
        self.state.lock().failing.insert(guild, reason.into());
    }

    /// Never finish connecting to `guild`
    pub fn hang_guild(&self, guild: GuildId) {
        self.state.lock().hanging.push(guild);
    }

    /// Sink of the latest connection to `guild`
    pub fn sink(&self, guild: GuildId) -> Option<RecordingSink> {
        self.state.lock().sinks.get(&guild).cloned()
    }

    /// Channel of the latest connection to `guild`
    pub fn channel(&self, guild: GuildId) -> Option<ChannelId> {
        self.state.lock().channels.get(&guild).copied()
    }

    /// Successful connects so far
    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    /// Guilds passed to `disconnect`, in order
    pub fn disconnects(&self) -> Vec<GuildId> {
        self.state.lock().disconnects.clone()
    }
}

#[async_trait]
impl VoiceConnector for FakeConnector {
    async fn connect(&self, guild: GuildId, channel: ChannelId) -> Result<Box<dyn VoiceSink>> {
        let hang = {
            let state = self.state.lock();
            if let Some(reason) = state.failing.get(&guild) {
                return Err(ReadoutError::connect_failed(guild, reason.clone()));
            }
            state.hanging.contains(&guild)
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let sink = RecordingSink::new();
        let mut state = self.state.lock();
        state.connects += 1;
        state.sinks.insert(guild, sink.clone());
        state.channels.insert(guild, channel);
        Ok(Box::new(sink))
    }

    async fn disconnect(&self, guild: GuildId) {
        self.state.lock().disconnects.push(guild);
    }
}

/// Presence view backed by a table the test fills in
#[derive(Debug, Default)]
pub struct StaticPresence {
    humans: Mutex<HashMap<(GuildId, ChannelId), usize>>,
}

impl StaticPresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, guild: GuildId, channel: ChannelId, humans: usize) {
        self.humans.lock().insert((guild, channel), humans);
    }
}

impl PresenceSource for StaticPresence {
    fn humans_in(&self, guild: GuildId, channel: ChannelId) -> Option<usize> {
        self.humans.lock().get(&(guild, channel)).copied()
    }
}
