//! Guild session manager
//!
//! Owns every live session. Create and destroy are serialized per guild by a
//! slot mutex, so two sessions never coexist for one guild while different
//! guilds join and leave in parallel. A separate read index lets the router
//! find a session without waiting on a join or leave in progress.

use crate::driver::{DriverExit, DriverSettings, PlaybackDriver};
use crate::error::{ReadoutError, Result};
use crate::metrics::ReadoutMetrics;
use crate::queue::{Admission, OverflowPolicy, ReadoutQueue};
use crate::traits::{SynthesisClient, Transcoder, VoiceConnector};
use crate::types::{ChannelId, DriverState, GuildId, Utterance};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Session lifecycle settings
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub connect_timeout: Duration,
    /// Bound on waiting for a driver to stop during `leave`
    pub teardown_timeout: Duration,
    /// Grace period before leaving a channel without humans
    pub idle_grace: Duration,
    pub driver: DriverSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 8,
            overflow_policy: OverflowPolicy::DropOldest,
            connect_timeout: Duration::from_secs(10),
            teardown_timeout: Duration::from_secs(3),
            idle_grace: Duration::from_secs(5),
            driver: DriverSettings::default(),
        }
    }
}

/// Shared view of a live session
#[derive(Debug)]
pub struct SessionHandle {
    guild_id: GuildId,
    voice_channel: ChannelId,
    generation: u64,
    queue: Arc<ReadoutQueue>,
    state: watch::Receiver<DriverState>,
    idle_timer: parking_lot::Mutex<Option<CancellationToken>>,
    joined_at: Instant,
}

impl SessionHandle {
    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// Voice channel the bot sits in
    pub fn voice_channel(&self) -> ChannelId {
        self.voice_channel
    }

    /// Text channel whose messages are read: the voice channel's own chat
    pub fn bound_channel(&self) -> ChannelId {
        self.voice_channel
    }

    /// Distinguishes successive sessions of the same guild
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Admit an utterance into this session's queue
    pub fn enqueue(&self, utterance: Utterance) -> Result<Admission> {
        self.queue.enqueue(utterance)
    }

    pub fn queue(&self) -> &ReadoutQueue {
        &self.queue
    }

    /// Current driver state
    pub fn driver_state(&self) -> DriverState {
        *self.state.borrow()
    }

    /// Watch driver state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<DriverState> {
        self.state.clone()
    }

    /// Whether an idle-teardown timer is running
    pub fn idle_timer_armed(&self) -> bool {
        self.idle_timer.lock().is_some()
    }

    pub fn joined_at(&self) -> Instant {
        self.joined_at
    }

    fn disarm_idle_timer(&self) -> bool {
        match self.idle_timer.lock().take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

struct GuildSession {
    handle: Arc<SessionHandle>,
    cancel: CancellationToken,
    driver: JoinHandle<DriverExit>,
}

type Slot = Arc<Mutex<Option<GuildSession>>>;

struct Inner {
    slots: DashMap<GuildId, Slot>,
    handles: DashMap<GuildId, Arc<SessionHandle>>,
    connector: Arc<dyn VoiceConnector>,
    synth: Arc<dyn SynthesisClient>,
    transcoder: Arc<dyn Transcoder>,
    metrics: Arc<ReadoutMetrics>,
    settings: SessionSettings,
    generations: AtomicU64,
}

/// Registry of guild sessions. Cheap to clone.
#[derive(Clone)]
pub struct GuildSessionManager {
    inner: Arc<Inner>,
}

impl GuildSessionManager {
    pub fn new(
        connector: Arc<dyn VoiceConnector>,
        synth: Arc<dyn SynthesisClient>,
        transcoder: Arc<dyn Transcoder>,
        metrics: Arc<ReadoutMetrics>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: DashMap::new(),
                handles: DashMap::new(),
                connector,
                synth,
                transcoder,
                metrics,
                settings,
                generations: AtomicU64::new(0),
            }),
        }
    }

    fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn slot(&self, guild: GuildId) -> Slot {
        self.inner
            .slots
            .entry(guild)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Forget a slot nobody holds and nobody occupies. Takes the caller's
    /// clone so the reference count check sees only the map's copy.
    fn prune(&self, guild: GuildId, slot: Slot) {
        drop(slot);
        self.inner.slots.remove_if(&guild, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().map(|s| s.is_none()).unwrap_or(false)
        });
    }

    /// Join `channel` in `guild`: connect, create the queue and start the
    /// playback driver. Nothing is registered when the connection fails.
    pub async fn join(&self, guild: GuildId, channel: ChannelId) -> Result<Arc<SessionHandle>> {
        let slot = self.slot(guild);
        let mut occupant = slot.lock().await;
        if occupant.is_some() {
            return Err(ReadoutError::AlreadyJoined(guild));
        }

        let connect_timeout = self.inner.settings.connect_timeout;
        let connected = timeout(connect_timeout, self.inner.connector.connect(guild, channel)).await;
        let sink = match connected {
            Ok(Ok(sink)) => sink,
            Ok(Err(e)) => {
                drop(occupant);
                self.prune(guild, slot);
                self.inner.metrics.record_connect_failure();
                warn!(guild_id = %guild, channel_id = %channel, error = %e, "Voice connect failed");
                return Err(match e {
                    ReadoutError::ConnectFailed { .. } => e,
                    other => ReadoutError::connect_failed(guild, other.to_string()),
                });
            }
            Err(_) => {
                // the half-open connection may exist on the platform side
                self.inner.connector.disconnect(guild).await;
                drop(occupant);
                self.prune(guild, slot);
                self.inner.metrics.record_connect_failure();
                warn!(guild_id = %guild, channel_id = %channel, "Voice connect timed out");
                return Err(ReadoutError::connect_failed(
                    guild,
                    format!("timed out after {:?}", connect_timeout),
                ));
            }
        };

        let settings = &self.inner.settings;
        let queue = Arc::new(ReadoutQueue::new(
            guild,
            settings.queue_capacity,
            settings.overflow_policy,
        ));
        let cancel = CancellationToken::new();
        let (driver, state) = PlaybackDriver::new(
            guild,
            queue.clone(),
            self.inner.synth.clone(),
            self.inner.transcoder.clone(),
            sink,
            settings.driver.clone(),
            self.inner.metrics.clone(),
            cancel.clone(),
        );
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = Arc::new(SessionHandle {
            guild_id: guild,
            voice_channel: channel,
            generation,
            queue,
            state,
            idle_timer: parking_lot::Mutex::new(None),
            joined_at: Instant::now(),
        });

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let exit = driver.run().await;
            if let DriverExit::ConnectionLost(_) = &exit {
                // leave awaits this task, so it has to run elsewhere
                if let Some(manager) = Self::from_weak(&weak) {
                    tokio::spawn(async move {
                        let _ = manager.leave_generation(guild, Some(generation)).await;
                    });
                }
            }
            exit
        });

        *occupant = Some(GuildSession {
            handle: handle.clone(),
            cancel,
            driver: task,
        });
        self.inner.handles.insert(guild, handle.clone());
        self.inner.metrics.record_joined();
        info!(guild_id = %guild, channel_id = %channel, generation, "Joined voice channel");
        Ok(handle)
    }

    /// Leave `guild`: pending utterances are discarded, the driver is stopped
    /// and the voice connection torn down.
    pub async fn leave(&self, guild: GuildId) -> Result<()> {
        self.leave_generation(guild, None).await
    }

    /// Leave only if the live session is `generation` (timers and driver
    /// exits must not tear down a newer session)
    async fn leave_generation(&self, guild: GuildId, generation: Option<u64>) -> Result<()> {
        let Some(slot) = self.inner.slots.get(&guild).map(|s| s.clone()) else {
            return Err(ReadoutError::NotJoined(guild));
        };
        let mut occupant = slot.lock().await;
        let session = match occupant.take() {
            Some(session) if generation.map_or(true, |g| g == session.handle.generation) => {
                session
            }
            other => {
                *occupant = other;
                drop(occupant);
                self.prune(guild, slot);
                return Err(ReadoutError::NotJoined(guild));
            }
        };

        self.inner.handles.remove(&guild);
        session.handle.disarm_idle_timer();
        let discarded = session.handle.queue.close();
        session.cancel.cancel();

        let teardown_timeout = self.inner.settings.teardown_timeout;
        let mut driver = session.driver;
        match timeout(teardown_timeout, &mut driver).await {
            Ok(Ok(exit)) => debug!(guild_id = %guild, exit = ?exit, "Driver joined"),
            Ok(Err(e)) => {
                warn!(guild_id = %guild, error = %e, "Driver task failed");
                self.inner.connector.disconnect(guild).await;
            }
            Err(_) => {
                warn!(guild_id = %guild, timeout = ?teardown_timeout, "Driver did not stop in time, aborting");
                driver.abort();
                self.inner.connector.disconnect(guild).await;
            }
        }

        drop(occupant);
        self.prune(guild, slot);
        self.inner.metrics.record_left();
        info!(
            guild_id = %guild,
            generation = session.handle.generation,
            discarded,
            "Left voice channel"
        );
        Ok(())
    }

    /// Report how many humans remain in `channel`. When it is the session's
    /// channel, zero starts the idle grace timer and anything else cancels it.
    pub fn update_presence(&self, guild: GuildId, channel: ChannelId, humans: usize) {
        let Some(handle) = self.session(guild) else {
            return;
        };
        if handle.voice_channel() != channel {
            return;
        }

        if humans > 0 {
            if handle.disarm_idle_timer() {
                debug!(guild_id = %guild, humans, "Idle teardown cancelled");
            }
            return;
        }

        let mut timer = handle.idle_timer.lock();
        if timer.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *timer = Some(token.clone());
        drop(timer);

        let grace = self.inner.settings.idle_grace;
        let generation = handle.generation();
        let weak = Arc::downgrade(&self.inner);
        info!(guild_id = %guild, grace = ?grace, "Channel empty, idle teardown armed");
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    if let Some(manager) = Self::from_weak(&weak) {
                        info!(guild_id = %guild, "Leaving idle voice channel");
                        let _ = manager.leave_generation(guild, Some(generation)).await;
                    }
                }
            }
        });
    }

    /// Live session of `guild`
    pub fn session(&self, guild: GuildId) -> Option<Arc<SessionHandle>> {
        self.inner.handles.get(&guild).map(|h| h.value().clone())
    }

    pub fn is_joined(&self, guild: GuildId) -> bool {
        self.inner.handles.contains_key(&guild)
    }

    /// Every live session
    pub fn sessions(&self) -> Vec<Arc<SessionHandle>> {
        self.inner.handles.iter().map(|h| h.value().clone()).collect()
    }

    /// Leave every guild, used at shutdown
    pub async fn leave_all(&self) {
        let guilds: Vec<GuildId> = self.inner.handles.iter().map(|h| *h.key()).collect();
        let leaves = guilds.into_iter().map(|guild| {
            let manager = self.clone();
            async move {
                if let Err(e) = manager.leave(guild).await {
                    debug!(guild_id = %guild, error = %e, "Already gone at shutdown");
                }
            }
        });
        futures_util::future::join_all(leaves).await;
    }

    pub fn metrics(&self) -> &Arc<ReadoutMetrics> {
        &self.inner.metrics
    }
}
