//! Discord voice over songbird
//!
//! Each session plays a single live track fed from a [`PcmPipe`]. The playback
//! driver pushes frames into the pipe at real-time pace; songbird's mixer pulls
//! them out and pads with silence whenever the pipe runs dry, so the track
//! never ends until the sink is closed.

use async_trait::async_trait;
use parking_lot::Mutex;
use songbird::input::core::io::MediaSource;
use songbird::input::{Input, RawAdapter};
use songbird::tracks::TrackHandle;
use songbird::{CoreEvent, Event, EventContext, EventHandler as SongbirdEventHandler, Songbird, TrackEvent};
use std::collections::VecDeque;
use std::io::{self, Read, Seek, SeekFrom};
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use yomiage_core::{
    AudioFrame, ChannelId, GuildId, ReadoutError, Result, VoiceConnector, VoiceSink,
    FRAME_CHANNELS, FRAME_SAMPLES_PER_CHANNEL, FRAME_SAMPLE_RATE,
};

/// One frame as interleaved f32 little-endian, the layout `RawAdapter` reads
pub const F32_FRAME_BYTES: usize = FRAME_SAMPLES_PER_CHANNEL * FRAME_CHANNELS as usize * 4;

/// Largest block of silence handed out in one read
const SILENCE_BYTES: usize = F32_FRAME_BYTES;

/// Bounded byte pipe between the playback driver and songbird's mixer
pub struct PcmPipe {
    buffer: Mutex<VecDeque<u8>>,
    capacity: usize,
    closed: AtomicBool,
    space: Notify,
}

impl PcmPipe {
    /// Pipe holding at most `frames` frames
    pub fn new(frames: usize) -> Arc<Self> {
        let capacity = frames.max(1) * F32_FRAME_BYTES;
        Arc::new(Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            closed: AtomicBool::new(false),
            space: Notify::new(),
        })
    }

    /// Convert s16le PCM to f32le
    pub fn encode(frame: &AudioFrame) -> Vec<u8> {
        frame
            .samples()
            .flat_map(|s| (f32::from(s) / 32768.0).to_le_bytes())
            .collect()
    }

    /// Queue one frame, waiting for the mixer to make room.
    /// Fails once the pipe is closed.
    pub async fn write(&self, frame: &AudioFrame) -> Result<()> {
        let bytes = Self::encode(frame);
        loop {
            if self.is_closed() {
                return Err(ReadoutError::connection_lost("voice track ended"));
            }
            {
                let mut buffer = self.buffer.lock();
                if buffer.len() + bytes.len() <= self.capacity {
                    buffer.extend(bytes.iter().copied());
                    return Ok(());
                }
            }
            self.space.notified().await;
        }
    }

    /// Bytes waiting for the mixer
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Stop accepting frames; the reader sees end of stream once drained
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.space.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn read_into(&self, buf: &mut [u8]) -> usize {
        let mut buffer = self.buffer.lock();
        if buffer.is_empty() {
            if self.is_closed() {
                return 0;
            }
            let n = buf.len().min(SILENCE_BYTES);
            buf[..n].fill(0);
            return n;
        }
        let n = buf.len().min(buffer.len());
        for (dst, src) in buf.iter_mut().zip(buffer.drain(..n)) {
            *dst = src;
        }
        drop(buffer);
        self.space.notify_one();
        n
    }
}

/// Mixer side of a [`PcmPipe`]
pub struct PipeReader(Arc<PcmPipe>);

impl PipeReader {
    pub fn new(pipe: Arc<PcmPipe>) -> Self {
        Self(pipe)
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.0.read_into(buf))
    }
}

impl Seek for PipeReader {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "live PCM pipe cannot seek"))
    }
}

impl MediaSource for PipeReader {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// Marks a sink dead when songbird drops the connection or the track
struct ConnectionWatch {
    guild: GuildId,
    lost: Arc<AtomicBool>,
    pipe: Arc<PcmPipe>,
}

#[async_trait]
impl SongbirdEventHandler for ConnectionWatch {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let cause = match ctx {
            EventContext::DriverDisconnect(_) => "driver disconnected",
            EventContext::Track(_) => "track stopped",
            _ => return None,
        };
        // closed by the sink itself
        if self.pipe.is_closed() {
            return None;
        }
        if !self.lost.swap(true, Ordering::AcqRel) {
            warn!(guild_id = %self.guild, cause, "Voice connection lost");
        }
        self.pipe.close();
        None
    }
}

/// Frame sink for one guild's songbird call
pub struct SongbirdSink {
    guild: GuildId,
    songbird: Arc<Songbird>,
    pipe: Arc<PcmPipe>,
    track: TrackHandle,
    lost: Arc<AtomicBool>,
    closed: AtomicBool,
    send_timeout: Duration,
}

#[async_trait]
impl VoiceSink for SongbirdSink {
    async fn send_frame(&self, frame: AudioFrame) -> Result<()> {
        if self.lost.load(Ordering::Acquire) {
            return Err(ReadoutError::connection_lost("voice connection dropped"));
        }
        match tokio::time::timeout(self.send_timeout, self.pipe.write(&frame)).await {
            Ok(result) => result,
            Err(_) => Err(ReadoutError::SinkTimeout(self.send_timeout)),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pipe.close();
        if let Err(e) = self.track.stop() {
            debug!(guild_id = %self.guild, error = %e, "Track already stopped");
        }
        if let Some(guild) = songbird_guild(self.guild) {
            if let Err(e) = self.songbird.remove(guild).await {
                debug!(guild_id = %self.guild, error = %e, "Voice call already gone");
            }
        }
        info!(guild_id = %self.guild, "Voice sink closed");
    }
}

fn songbird_guild(guild: GuildId) -> Option<songbird::id::GuildId> {
    NonZeroU64::new(guild.get()).map(songbird::id::GuildId::from)
}

fn songbird_channel(channel: ChannelId) -> Option<songbird::id::ChannelId> {
    NonZeroU64::new(channel.get()).map(songbird::id::ChannelId::from)
}

/// Opens songbird calls on behalf of the session manager
#[derive(Clone)]
pub struct SongbirdConnector {
    songbird: Arc<Songbird>,
    pipe_frames: usize,
    send_timeout: Duration,
}

impl SongbirdConnector {
    /// `pipe_frames` bounds how far ahead of the mixer the driver may run
    pub fn new(songbird: Arc<Songbird>, pipe_frames: usize, send_timeout: Duration) -> Self {
        Self {
            songbird,
            pipe_frames,
            send_timeout,
        }
    }

    pub fn songbird(&self) -> &Arc<Songbird> {
        &self.songbird
    }
}

#[async_trait]
impl VoiceConnector for SongbirdConnector {
    async fn connect(&self, guild: GuildId, channel: ChannelId) -> Result<Box<dyn VoiceSink>> {
        let (Some(sb_guild), Some(sb_channel)) = (songbird_guild(guild), songbird_channel(channel)) else {
            return Err(ReadoutError::connect_failed(guild, "invalid guild or channel id"));
        };

        let call = self
            .songbird
            .join(sb_guild, sb_channel)
            .await
            .map_err(|e| ReadoutError::connect_failed(guild, e.to_string()))?;

        let pipe = PcmPipe::new(self.pipe_frames);
        let lost = Arc::new(AtomicBool::new(false));
        let input: Input = RawAdapter::new(
            PipeReader::new(pipe.clone()),
            FRAME_SAMPLE_RATE,
            u32::from(FRAME_CHANNELS),
        )
        .into();

        let track = {
            let mut call = call.lock().await;
            call.add_global_event(
                Event::Core(CoreEvent::DriverDisconnect),
                ConnectionWatch {
                    guild,
                    lost: lost.clone(),
                    pipe: pipe.clone(),
                },
            );
            call.play_input(input)
        };
        for event in [TrackEvent::End, TrackEvent::Error] {
            let watch = ConnectionWatch {
                guild,
                lost: lost.clone(),
                pipe: pipe.clone(),
            };
            if let Err(e) = track.add_event(Event::Track(event), watch) {
                warn!(guild_id = %guild, error = %e, "Could not watch voice track");
            }
        }

        info!(guild_id = %guild, channel_id = %channel, "Joined voice channel");
        Ok(Box::new(SongbirdSink {
            guild,
            songbird: self.songbird.clone(),
            pipe,
            track,
            lost,
            closed: AtomicBool::new(false),
            send_timeout: self.send_timeout,
        }))
    }

    async fn disconnect(&self, guild: GuildId) {
        let Some(sb_guild) = songbird_guild(guild) else {
            return;
        };
        match self.songbird.remove(sb_guild).await {
            Ok(()) => info!(guild_id = %guild, "Left voice channel"),
            Err(e) => debug!(guild_id = %guild, error = %e, "No voice call to leave"),
        }
    }
}
