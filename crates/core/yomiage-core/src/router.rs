//! Message router
//!
//! Turns chat events into utterances. Eligibility and text cleanup are data
//! (`FilterRule`, `TextRule`) so deployments can reorder or drop rules from
//! config. Routing is total: every event ends as an outcome, never an error.

use crate::config::ReadoutConfig;
use crate::error::{ReadoutError, Result};
use crate::event::{ChatEvent, ChatEventReceiver, InboundMessage, VoiceStateChange};
use crate::queue::Admission;
use crate::roster::SpeakerRoster;
use crate::session::{GuildSessionManager, SessionHandle};
use crate::traits::PresenceSource;
use crate::types::{ChannelId, GuildId, UserId, Utterance, VoiceParams};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Message eligibility checks, evaluated in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum FilterRule {
    /// Drop direct messages
    RequireGuild,
    /// Drop messages from bot accounts
    IgnoreBots,
    /// Drop the bot's own messages
    IgnoreSelf,
    /// Only read the text chat bound to the guild's session
    RequireBoundChannel,
    /// Drop messages starting with a prefix (case-insensitive)
    IgnorePrefix { prefix: String },
    /// Drop messages with neither text nor attachments
    RequireText,
}

/// Text cleanup steps, applied in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum TextRule {
    /// Remove `<:name:id>` and `<a:name:id>`
    StripCustomEmoji,
    /// Remove unicode emoji
    StripEmoji,
    /// Read mentions as `{prefix}{display name}`
    ReplaceMentions { prefix: String },
    /// Read links as a placeholder word
    ReplaceUrls { placeholder: String },
    /// Collapse runs of whitespace and newlines into one space
    CollapseWhitespace,
    /// Cut long text; unset fields fall back to the `readout` section
    Truncate {
        #[serde(default)]
        max: Option<usize>,
        #[serde(default)]
        suffix: Option<String>,
    },
}

/// Router rules as configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterRules {
    pub filters: Vec<FilterRule>,
    pub text: Vec<TextRule>,
    /// Read in place of attached files
    pub attachment_text: String,
}

impl Default for RouterRules {
    fn default() -> Self {
        Self {
            filters: vec![
                FilterRule::RequireGuild,
                FilterRule::IgnoreBots,
                FilterRule::IgnoreSelf,
                FilterRule::RequireBoundChannel,
                FilterRule::IgnorePrefix {
                    prefix: "neko!".to_string(),
                },
                FilterRule::RequireText,
            ],
            text: vec![
                TextRule::StripCustomEmoji,
                TextRule::StripEmoji,
                TextRule::ReplaceMentions {
                    prefix: "アットマーク ".to_string(),
                },
                TextRule::ReplaceUrls {
                    placeholder: "URL".to_string(),
                },
                TextRule::CollapseWhitespace,
                TextRule::Truncate {
                    max: None,
                    suffix: None,
                },
            ],
            attachment_text: "添付ファイル".to_string(),
        }
    }
}

/// Everything the router needs from configuration
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub rules: RouterRules,
    pub max_text_length: usize,
    pub truncation_suffix: String,
    pub announce_speaker: u32,
    pub interrogative_upspeak: bool,
    pub auto_join: bool,
    pub announce_presence: bool,
    pub join_template: String,
    pub leave_template: String,
    pub greeting: String,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from_config(&ReadoutConfig::default())
    }
}

impl RouterSettings {
    pub fn from_config(config: &ReadoutConfig) -> Self {
        Self {
            rules: config.router.clone(),
            max_text_length: config.readout.max_text_length,
            truncation_suffix: config.readout.truncation_suffix.clone(),
            announce_speaker: config.synthesis.default_speaker,
            interrogative_upspeak: config.synthesis.interrogative_upspeak,
            auto_join: config.session.auto_join,
            announce_presence: config.session.announce_presence,
            join_template: config.session.join_template.clone(),
            leave_template: config.session.leave_template.clone(),
            greeting: config.session.greeting.clone(),
        }
    }
}

/// Why an event produced no utterance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    NotInGuild,
    FromBot,
    FromSelf,
    NoSession,
    WrongChannel,
    Prefixed(String),
    Empty,
    /// Voice update without a channel change (mute, deafen, stream)
    NoChannelChange,
    /// Voice update for a channel the bot is not in
    OtherChannel,
}

/// Why an admitted-looking event was lost
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    QueueFull,
    SessionClosed,
}

/// Result of routing one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// An utterance was queued
    Enqueued,
    /// An utterance was queued after evicting the oldest pending one
    Displaced,
    Ignored(IgnoreReason),
    Dropped(DropReason),
    /// A join was started in the background
    Joining { channel: ChannelId },
    /// The session was told to leave
    Leaving,
    /// Presence was recorded; nothing to say
    PresenceUpdated,
}

#[derive(Debug)]
enum CompiledRule {
    StripCustomEmoji(Regex),
    StripEmoji(Regex),
    ReplaceMentions { prefix: String, raw: Regex },
    ReplaceUrls { placeholder: String },
    CollapseWhitespace,
    Truncate { max: usize, suffix: String },
}

const CUSTOM_EMOJI: &str = r"<a?:\w+:\d+>";
const UNICODE_EMOJI: &str =
    r"[\p{Extended_Pictographic}\x{1F1E6}-\x{1F1FF}\x{1F3FB}-\x{1F3FF}\x{FE0F}\x{200D}\x{20E3}]";

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| ReadoutError::config(format!("bad pattern {}: {}", pattern, e)))
}

/// Routes chat events into guild sessions
pub struct MessageRouter {
    settings: RouterSettings,
    text_rules: Vec<CompiledRule>,
    url: Regex,
    custom_emoji: Regex,
    emoji: Regex,
    manager: GuildSessionManager,
    roster: Arc<SpeakerRoster>,
    self_id: AtomicU64,
    presence: OnceCell<Arc<dyn PresenceSource>>,
}

impl MessageRouter {
    pub fn new(
        settings: RouterSettings,
        manager: GuildSessionManager,
        roster: Arc<SpeakerRoster>,
    ) -> Result<Self> {
        let url = compile(r"https?://\S+")?;
        let custom_emoji = compile(CUSTOM_EMOJI)?;
        let emoji = compile(UNICODE_EMOJI)?;
        let mut text_rules = Vec::with_capacity(settings.rules.text.len());
        for rule in &settings.rules.text {
            text_rules.push(match rule {
                TextRule::StripCustomEmoji => {
                    CompiledRule::StripCustomEmoji(custom_emoji.clone())
                }
                TextRule::StripEmoji => CompiledRule::StripEmoji(emoji.clone()),
                TextRule::ReplaceMentions { prefix } => CompiledRule::ReplaceMentions {
                    prefix: prefix.clone(),
                    raw: compile(r"<@[!&]?(\d+)>")?,
                },
                TextRule::ReplaceUrls { placeholder } => CompiledRule::ReplaceUrls {
                    placeholder: placeholder.clone(),
                },
                TextRule::CollapseWhitespace => CompiledRule::CollapseWhitespace,
                TextRule::Truncate { max, suffix } => CompiledRule::Truncate {
                    max: max.unwrap_or(settings.max_text_length),
                    suffix: suffix
                        .clone()
                        .unwrap_or_else(|| settings.truncation_suffix.clone()),
                },
            });
        }
        Ok(Self {
            settings,
            text_rules,
            url,
            custom_emoji,
            emoji,
            manager,
            roster,
            self_id: AtomicU64::new(0),
            presence: OnceCell::new(),
        })
    }

    /// Record the bot's own user id once the gateway reports it
    pub fn set_self_id(&self, id: UserId) {
        self.self_id.store(id.get(), Ordering::Relaxed);
    }

    /// Install the presence view consulted right after a join lands. Only the
    /// first call takes effect.
    pub fn set_presence_source(&self, source: Arc<dyn PresenceSource>) {
        if self.presence.set(source).is_err() {
            debug!("Presence source already installed");
        }
    }

    fn self_id(&self) -> Option<UserId> {
        match self.self_id.load(Ordering::Relaxed) {
            0 => None,
            id => Some(UserId(id)),
        }
    }

    pub fn manager(&self) -> &GuildSessionManager {
        &self.manager
    }

    /// Consume events until the channel closes or `shutdown` fires
    pub async fn run(self: Arc<Self>, mut events: ChatEventReceiver, shutdown: CancellationToken) {
        info!("Message router started");
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let outcome = self.route(event);
            debug!(outcome = ?outcome, "Routed event");
        }
        info!("Message router stopped");
    }

    /// Route one event
    pub fn route(self: &Arc<Self>, event: ChatEvent) -> RouteOutcome {
        self.manager.metrics().record_event();
        let outcome = match event {
            ChatEvent::Message(message) => self.route_message(&message),
            ChatEvent::VoiceState(change) => self.route_voice_state(&change),
        };
        if let RouteOutcome::Ignored(reason) = &outcome {
            self.manager.metrics().record_ignored();
            debug!(reason = ?reason, "Event ignored");
        }
        outcome
    }

    fn check_filters(
        &self,
        message: &InboundMessage,
        session: Option<&SessionHandle>,
    ) -> Option<IgnoreReason> {
        for rule in &self.settings.rules.filters {
            let verdict = match rule {
                FilterRule::RequireGuild => message.guild_id.is_none().then_some(IgnoreReason::NotInGuild),
                FilterRule::IgnoreBots => message.author.is_bot.then_some(IgnoreReason::FromBot),
                FilterRule::IgnoreSelf => (self.self_id() == Some(message.author.id))
                    .then_some(IgnoreReason::FromSelf),
                FilterRule::RequireBoundChannel => match session {
                    None => Some(IgnoreReason::NoSession),
                    Some(s) if s.bound_channel() != message.channel_id => {
                        Some(IgnoreReason::WrongChannel)
                    }
                    Some(_) => None,
                },
                FilterRule::IgnorePrefix { prefix } => self
                    .without_emoji(&message.content)
                    .trim_start()
                    .to_lowercase()
                    .starts_with(&prefix.to_lowercase())
                    .then(|| IgnoreReason::Prefixed(prefix.clone())),
                FilterRule::RequireText => (message.content.trim().is_empty()
                    && message.attachment_count == 0)
                    .then_some(IgnoreReason::Empty),
            };
            if verdict.is_some() {
                return verdict;
            }
        }
        None
    }

    /// Content with custom and unicode emoji removed; prefixes are matched
    /// against this so an emoji in front of a command does not hide it
    fn without_emoji(&self, content: &str) -> String {
        let stripped = self.custom_emoji.replace_all(content, "");
        self.emoji.replace_all(&stripped, "").into_owned()
    }

    /// Text to speak for a message that passed the filters
    pub fn render_text(&self, message: &InboundMessage) -> String {
        let trimmed = message.content.trim();
        let placeholder = self.text_rules.iter().find_map(|rule| match rule {
            CompiledRule::ReplaceUrls { placeholder } => Some(placeholder.as_str()),
            _ => None,
        });

        if let (Some(placeholder), Some(m)) = (placeholder, self.url.find(trimmed)) {
            if m.start() == 0 && m.end() == trimmed.len() && message.attachment_count == 0 {
                return placeholder.to_string();
            }
        }

        let body = self.apply_text_rules(trimmed, message);
        if message.attachment_count > 0 {
            let lead = self.settings.rules.attachment_text.as_str();
            return if body.is_empty() {
                lead.to_string()
            } else {
                format!("{} {}", lead, body)
            };
        }
        body
    }

    fn apply_text_rules(&self, text: &str, message: &InboundMessage) -> String {
        let mut text = text.to_string();
        for rule in &self.text_rules {
            text = match rule {
                CompiledRule::StripCustomEmoji(re) | CompiledRule::StripEmoji(re) => {
                    re.replace_all(&text, "").into_owned()
                }
                CompiledRule::ReplaceMentions { prefix, raw } => raw
                    .replace_all(&text, |caps: &regex::Captures<'_>| {
                        let id = caps[1].parse::<u64>().ok();
                        match message.mentions.iter().find(|m| Some(m.id) == id) {
                            Some(mention) => format!("{}{}", prefix, mention.display_name),
                            None => String::new(),
                        }
                    })
                    .into_owned(),
                CompiledRule::ReplaceUrls { placeholder } => self
                    .url
                    .replace_all(&text, regex::NoExpand(placeholder))
                    .into_owned(),
                CompiledRule::CollapseWhitespace => {
                    text.split_whitespace().collect::<Vec<_>>().join(" ")
                }
                CompiledRule::Truncate { max, suffix } => {
                    let cut = text.char_indices().nth(*max).map(|(at, _)| at);
                    match cut {
                        Some(cut) => format!("{}{}", &text[..cut], suffix),
                        None => text,
                    }
                }
            };
        }
        text.trim().to_string()
    }

    fn route_message(&self, message: &InboundMessage) -> RouteOutcome {
        let session = message.guild_id.and_then(|g| self.manager.session(g));
        if let Some(reason) = self.check_filters(message, session.as_deref()) {
            return RouteOutcome::Ignored(reason);
        }
        let Some(session) = session else {
            return RouteOutcome::Ignored(IgnoreReason::NoSession);
        };

        let text = self.render_text(message);
        if text.is_empty() {
            return RouteOutcome::Ignored(IgnoreReason::Empty);
        }

        let speaker = self
            .roster
            .speaker_for(message.author.id, &message.author.display_name);
        let voice = VoiceParams {
            speaker,
            interrogative_upspeak: self.settings.interrogative_upspeak,
        };
        self.submit(&session, message.author.id, &text, voice)
    }

    fn hard_limit(&self) -> usize {
        self.settings.max_text_length + self.settings.truncation_suffix.chars().count()
    }

    fn submit(
        &self,
        session: &SessionHandle,
        author: UserId,
        text: &str,
        voice: VoiceParams,
    ) -> RouteOutcome {
        let guild = session.guild_id();
        let utterance = match Utterance::new(guild, author, text, voice, self.hard_limit()) {
            Ok(u) => u,
            Err(_) => return RouteOutcome::Ignored(IgnoreReason::Empty),
        };
        let metrics = self.manager.metrics();
        match session.enqueue(utterance) {
            Ok(Admission::Queued) => {
                metrics.record_enqueued();
                RouteOutcome::Enqueued
            }
            Ok(Admission::Displaced(old)) => {
                metrics.record_enqueued();
                metrics.record_displaced();
                debug!(guild_id = %guild, dropped = %old.text(), "Queue full, oldest utterance dropped");
                RouteOutcome::Displaced
            }
            Err(ReadoutError::QueueFull { capacity, .. }) => {
                metrics.record_rejected();
                debug!(guild_id = %guild, capacity, "Queue full, utterance rejected");
                RouteOutcome::Dropped(DropReason::QueueFull)
            }
            Err(e) => {
                debug!(guild_id = %guild, error = %e, "Session closed under utterance");
                RouteOutcome::Dropped(DropReason::SessionClosed)
            }
        }
    }

    fn announce(&self, session: &SessionHandle, who: UserId, template: &str, name: &str) -> RouteOutcome {
        let text = template.replace("{name}", name);
        let voice = VoiceParams {
            speaker: self.settings.announce_speaker,
            interrogative_upspeak: self.settings.interrogative_upspeak,
        };
        self.submit(session, who, &text, voice)
    }

    fn route_voice_state(self: &Arc<Self>, change: &VoiceStateChange) -> RouteOutcome {
        let guild = change.guild_id;
        let session = self.manager.session(guild);

        if self.self_id() == Some(change.member.id) {
            // the bot was disconnected or moved by someone else
            return match session {
                Some(s) if change.before == Some(s.voice_channel()) && change.is_move() => {
                    info!(guild_id = %guild, "Removed from voice channel");
                    let manager = self.manager.clone();
                    tokio::spawn(async move {
                        let _ = manager.leave(guild).await;
                    });
                    RouteOutcome::Leaving
                }
                _ => RouteOutcome::Ignored(IgnoreReason::FromSelf),
            };
        }
        if change.member.is_bot {
            return RouteOutcome::Ignored(IgnoreReason::FromBot);
        }
        if !change.is_move() {
            return RouteOutcome::Ignored(IgnoreReason::NoChannelChange);
        }

        let Some(session) = session else {
            return match change.after {
                Some(channel) if self.settings.auto_join => {
                    self.spawn_join(guild, channel);
                    RouteOutcome::Joining { channel }
                }
                _ => RouteOutcome::Ignored(IgnoreReason::NoSession),
            };
        };

        let channel = session.voice_channel();
        let Some(humans) = change.humans_in(channel) else {
            return RouteOutcome::Ignored(IgnoreReason::OtherChannel);
        };
        self.manager.update_presence(guild, channel, humans);

        if !self.settings.announce_presence {
            return RouteOutcome::PresenceUpdated;
        }
        let name = change.member.display_name.as_str();
        if change.after == Some(channel) {
            self.announce(&session, change.member.id, &self.settings.join_template, name)
        } else if humans > 0 {
            self.announce(&session, change.member.id, &self.settings.leave_template, name)
        } else {
            // nobody left to hear it
            RouteOutcome::PresenceUpdated
        }
    }

    fn spawn_join(self: &Arc<Self>, guild: GuildId, channel: ChannelId) {
        let router = self.clone();
        tokio::spawn(async move {
            match router.join(guild, channel).await {
                Ok(_) => {}
                Err(ReadoutError::AlreadyJoined(_)) => {
                    debug!(guild_id = %guild, "Auto-join raced an existing session");
                }
                Err(e) => warn!(guild_id = %guild, channel_id = %channel, error = %e, "Auto-join failed"),
            }
        });
    }

    /// Join a voice channel and speak the greeting
    pub async fn join(&self, guild: GuildId, channel: ChannelId) -> Result<Arc<SessionHandle>> {
        let session = self.manager.join(guild, channel).await?;
        // voice updates that arrived while connecting found no session
        if let Some(humans) = self.presence.get().and_then(|p| p.humans_in(guild, channel)) {
            self.manager.update_presence(guild, channel, humans);
        }
        if !self.settings.greeting.trim().is_empty() {
            let who = self.self_id().unwrap_or(UserId(0));
            let voice = VoiceParams {
                speaker: self.settings.announce_speaker,
                interrogative_upspeak: self.settings.interrogative_upspeak,
            };
            self.submit(&session, who, &self.settings.greeting, voice);
        }
        Ok(session)
    }

    /// Leave a guild's voice channel
    pub async fn leave(&self, guild: GuildId) -> Result<()> {
        self.manager.leave(guild).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Author, Mention};
    use crate::metrics::ReadoutMetrics;
    use crate::roster::SpeakerEntry;
    use crate::session::SessionSettings;
    use crate::testing::{FakeConnector, PcmTranscoder, ScriptedSynth, StaticPresence, SynthStep};
    use crate::types::DriverState;
    use std::time::Duration;

    const GUILD: GuildId = GuildId(1);
    const VOICE: ChannelId = ChannelId(10);

    fn router_with(settings: RouterSettings) -> Arc<MessageRouter> {
        let manager = GuildSessionManager::new(
            Arc::new(FakeConnector::new()),
            // the first utterance blocks in synthesis so later ones stay queued
            Arc::new(ScriptedSynth::new().otherwise(SynthStep::Hang)),
            Arc::new(PcmTranscoder::new()),
            Arc::new(ReadoutMetrics::new()),
            SessionSettings {
                queue_capacity: 3,
                ..SessionSettings::default()
            },
        );
        let roster = Arc::new(SpeakerRoster::new(vec![SpeakerEntry::new("only", 42)], 7));
        let router = Arc::new(MessageRouter::new(settings, manager, roster).unwrap());
        router.set_self_id(UserId(999));
        router
    }

    fn quiet_settings() -> RouterSettings {
        RouterSettings {
            greeting: String::new(),
            ..RouterSettings::default()
        }
    }

    fn message(content: &str) -> InboundMessage {
        InboundMessage {
            guild_id: Some(GUILD),
            channel_id: VOICE,
            author: Author::human(5, "alice"),
            content: content.to_string(),
            mentions: Vec::new(),
            attachment_count: 0,
        }
    }

    async fn joined(router: &Arc<MessageRouter>) -> Arc<SessionHandle> {
        let session = router.join(GUILD, VOICE).await.unwrap();
        let mut state = session.subscribe_state();
        router.route(ChatEvent::Message(message("blocker")));
        state.wait_for(|s| *s == DriverState::Synthesizing).await.unwrap();
        session
    }

    #[test]
    fn test_rules_deserialize_from_yaml() {
        let yaml = r#"
filters:
  - rule: require_guild
  - rule: ignore_prefix
    prefix: "!"
text:
  - rule: replace_urls
    placeholder: "リンク"
  - rule: truncate
    max: 10
"#;
        let rules: RouterRules = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rules.filters.len(), 2);
        assert_eq!(
            rules.text[1],
            TextRule::Truncate {
                max: Some(10),
                suffix: None
            }
        );
        assert_eq!(rules.attachment_text, "添付ファイル");
    }

    #[tokio::test]
    async fn test_text_cleanup() {
        let router = router_with(quiet_settings());

        let mut m = message("<:pepe:123456> hi <@77>   see https://example.com/x?y=1\nbye 😀");
        m.mentions.push(Mention {
            id: 77,
            display_name: "bob".to_string(),
        });
        assert_eq!(router.render_text(&m), "hi アットマーク bob see URL bye");

        assert_eq!(router.render_text(&message("https://example.com/only")), "URL");

        let long = "あ".repeat(50);
        let expected = format!("{}以下省略", "あ".repeat(40));
        assert_eq!(router.render_text(&message(&long)), expected);

        let mut with_file = message("見て");
        with_file.attachment_count = 1;
        assert_eq!(router.render_text(&with_file), "添付ファイル 見て");
    }

    #[tokio::test]
    async fn test_filters_are_total() {
        let router = router_with(quiet_settings());

        // nothing is joined yet
        assert_eq!(
            router.route(ChatEvent::Message(message("hello"))),
            RouteOutcome::Ignored(IgnoreReason::NoSession)
        );

        let _session = joined(&router).await;

        let mut dm = message("hi");
        dm.guild_id = None;
        assert_eq!(
            router.route(ChatEvent::Message(dm)),
            RouteOutcome::Ignored(IgnoreReason::NotInGuild)
        );

        let mut from_bot = message("hi");
        from_bot.author = Author::bot(3, "musicbot");
        assert_eq!(
            router.route(ChatEvent::Message(from_bot)),
            RouteOutcome::Ignored(IgnoreReason::FromBot)
        );

        let mut elsewhere = message("hi");
        elsewhere.channel_id = ChannelId(11);
        assert_eq!(
            router.route(ChatEvent::Message(elsewhere)),
            RouteOutcome::Ignored(IgnoreReason::WrongChannel)
        );

        assert_eq!(
            router.route(ChatEvent::Message(message("NEKO!play song"))),
            RouteOutcome::Ignored(IgnoreReason::Prefixed("neko!".to_string()))
        );
        for hidden in ["<:x:1>neko!play", "<a:spin:22> 😀 Neko!skip"] {
            assert_eq!(
                router.route(ChatEvent::Message(message(hidden))),
                RouteOutcome::Ignored(IgnoreReason::Prefixed("neko!".to_string()))
            );
        }
        assert_eq!(
            router.route(ChatEvent::Message(message("   "))),
            RouteOutcome::Ignored(IgnoreReason::Empty)
        );
        assert_eq!(
            router.route(ChatEvent::Message(message("<:only:1>"))),
            RouteOutcome::Ignored(IgnoreReason::Empty)
        );
        assert_eq!(
            router.route(ChatEvent::Message(message("読んで"))),
            RouteOutcome::Enqueued
        );
    }

    #[tokio::test]
    async fn test_overflow_is_counted() {
        let router = router_with(quiet_settings());
        let session = joined(&router).await;

        for text in ["A", "B", "C"] {
            assert_eq!(router.route(ChatEvent::Message(message(text))), RouteOutcome::Enqueued);
        }
        assert_eq!(
            router.route(ChatEvent::Message(message("D"))),
            RouteOutcome::Displaced
        );
        assert_eq!(session.queue().pending_texts(), vec!["B", "C", "D"]);

        let snap = router.manager().metrics().snapshot();
        assert_eq!(snap.utterances_displaced, 1);
        assert_eq!(snap.queue_full_total(), 1);
    }

    #[tokio::test]
    async fn test_presence_announcements() {
        let router = router_with(quiet_settings());
        let session = joined(&router).await;

        let enter = VoiceStateChange {
            guild_id: GUILD,
            member: Author::human(6, "carol"),
            before: None,
            after: Some(VOICE),
            humans_in_before: 0,
            humans_in_after: 2,
        };
        assert_eq!(router.route(ChatEvent::VoiceState(enter)), RouteOutcome::Enqueued);

        let leave = VoiceStateChange {
            guild_id: GUILD,
            member: Author::human(6, "carol"),
            before: Some(VOICE),
            after: None,
            humans_in_before: 1,
            humans_in_after: 0,
        };
        assert_eq!(router.route(ChatEvent::VoiceState(leave)), RouteOutcome::Enqueued);
        assert_eq!(
            session.queue().pending_texts(),
            vec!["carol さんが入室しました。", "carol さんが退室しました。"]
        );

        let last_out = VoiceStateChange {
            guild_id: GUILD,
            member: Author::human(5, "alice"),
            before: Some(VOICE),
            after: Some(ChannelId(50)),
            humans_in_before: 0,
            humans_in_after: 1,
        };
        assert_eq!(
            router.route(ChatEvent::VoiceState(last_out)),
            RouteOutcome::PresenceUpdated
        );
        assert!(session.idle_timer_armed());
    }

    #[tokio::test]
    async fn test_auto_join_and_greeting() {
        let router = router_with(RouterSettings::default());
        let enter = VoiceStateChange {
            guild_id: GUILD,
            member: Author::human(5, "alice"),
            before: None,
            after: Some(VOICE),
            humans_in_before: 0,
            humans_in_after: 1,
        };
        assert_eq!(
            router.route(ChatEvent::VoiceState(enter)),
            RouteOutcome::Joining { channel: VOICE }
        );

        for _ in 0..50 {
            if router.manager().is_joined(GUILD) {
                break;
            }
            tokio::task::yield_now().await;
        }
        let session = router.manager().session(GUILD).unwrap();
        assert_eq!(session.voice_channel(), VOICE);
        let mut state = session.subscribe_state();
        state.wait_for(|s| *s == DriverState::Synthesizing).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_human_leaving_during_join_arms_idle_timer() {
        let router = router_with(RouterSettings::default());
        let presence = Arc::new(StaticPresence::new());
        router.set_presence_source(presence.clone());

        let enter = VoiceStateChange {
            guild_id: GUILD,
            member: Author::human(5, "alice"),
            before: None,
            after: Some(VOICE),
            humans_in_before: 0,
            humans_in_after: 1,
        };
        assert_eq!(
            router.route(ChatEvent::VoiceState(enter)),
            RouteOutcome::Joining { channel: VOICE }
        );

        // alice is gone before the connection is up
        let leave = VoiceStateChange {
            guild_id: GUILD,
            member: Author::human(5, "alice"),
            before: Some(VOICE),
            after: None,
            humans_in_before: 0,
            humans_in_after: 0,
        };
        assert_eq!(
            router.route(ChatEvent::VoiceState(leave)),
            RouteOutcome::Ignored(IgnoreReason::NoSession)
        );
        presence.set(GUILD, VOICE, 0);

        for _ in 0..50 {
            if router.manager().is_joined(GUILD) {
                break;
            }
            tokio::task::yield_now().await;
        }
        let session = router.manager().session(GUILD).unwrap();
        assert!(session.idle_timer_armed());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!router.manager().is_joined(GUILD));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_with_listeners_present_stays() {
        let router = router_with(quiet_settings());
        let presence = Arc::new(StaticPresence::new());
        presence.set(GUILD, VOICE, 2);
        router.set_presence_source(presence);

        let session = router.join(GUILD, VOICE).await.unwrap();
        assert!(!session.idle_timer_armed());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(router.manager().is_joined(GUILD));
    }
}
