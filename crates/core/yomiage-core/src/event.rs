//! Typed chat events
//!
//! The chat adaptor translates gateway callbacks into these values and pushes
//! them into one channel; the router consumes them in arrival order.

use crate::types::{ChannelId, GuildId, UserId};
use tokio::sync::mpsc;

/// Who produced an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub id: UserId,
    /// Guild nickname if set, otherwise the global name
    pub display_name: String,
    pub is_bot: bool,
}

impl Author {
    pub fn human(id: u64, display_name: impl Into<String>) -> Self {
        Self {
            id: UserId(id),
            display_name: display_name.into(),
            is_bot: false,
        }
    }

    pub fn bot(id: u64, display_name: impl Into<String>) -> Self {
        Self {
            is_bot: true,
            ..Self::human(id, display_name)
        }
    }
}

/// A resolved user or role mention inside message content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    /// User or role id as it appears in `<@id>`, `<@!id>` or `<@&id>`
    pub id: u64,
    pub display_name: String,
}

/// A message posted in a text channel
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// `None` for direct messages
    pub guild_id: Option<GuildId>,
    pub channel_id: ChannelId,
    pub author: Author,
    pub content: String,
    pub mentions: Vec<Mention>,
    pub attachment_count: usize,
}

/// A member's voice channel changed
#[derive(Debug, Clone)]
pub struct VoiceStateChange {
    pub guild_id: GuildId,
    pub member: Author,
    /// Channel before the change, `None` if the member was not in voice
    pub before: Option<ChannelId>,
    /// Channel after the change, `None` if the member left voice
    pub after: Option<ChannelId>,
    /// Humans left in `before` once the change is applied
    pub humans_in_before: usize,
    /// Humans in `after` once the change is applied
    pub humans_in_after: usize,
}

impl VoiceStateChange {
    /// Whether the member actually moved between channels (mute/deafen
    /// updates keep the same channel)
    pub fn is_move(&self) -> bool {
        self.before != self.after
    }

    /// Humans present in `channel` after the change, if this event
    /// concerns that channel
    pub fn humans_in(&self, channel: ChannelId) -> Option<usize> {
        if self.after == Some(channel) {
            Some(self.humans_in_after)
        } else if self.before == Some(channel) {
            Some(self.humans_in_before)
        } else {
            None
        }
    }
}

/// Everything the router reacts to
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Message(InboundMessage),
    VoiceState(VoiceStateChange),
}

impl ChatEvent {
    /// Guild the event belongs to, if any
    pub fn guild_id(&self) -> Option<GuildId> {
        match self {
            ChatEvent::Message(m) => m.guild_id,
            ChatEvent::VoiceState(v) => Some(v.guild_id),
        }
    }
}

/// Sending half used by chat adaptors
pub type ChatEventSender = mpsc::Sender<ChatEvent>;

/// Receiving half consumed by the router
pub type ChatEventReceiver = mpsc::Receiver<ChatEvent>;

/// Create the event channel
pub fn create_event_channel(buffer_size: usize) -> (ChatEventSender, ChatEventReceiver) {
    mpsc::channel(buffer_size)
}
