//! Discord adaptor for yomiage
//!
//! Turns serenity gateway callbacks into [`ChatEvent`]s for the message
//! router, answers the `/vjoin` and `/vleave` slash commands, and provides the
//! songbird-backed [`VoiceConnector`](yomiage_core::VoiceConnector).

use serenity::all::{CommandInteraction, Interaction};
use serenity::async_trait as serenity_async_trait;
use serenity::builder::{
    CreateCommand, CreateInteractionResponse, CreateInteractionResponseFollowup,
    CreateInteractionResponseMessage, EditInteractionResponse,
};
use serenity::cache::{Cache, Settings as CacheSettings};
use serenity::gateway::ShardManager;
use serenity::model::application::Command;
use serenity::model::channel::Message as DiscordMessage;
use serenity::model::gateway::{GatewayIntents, Ready};
use serenity::model::voice::VoiceState;
use serenity::prelude::*;
use songbird::serenity::SerenityInit;
use songbird::Songbird;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use yomiage_core::config::DiscordSection;
use yomiage_core::{
    Author, ChannelId, ChatEvent, ChatEventSender, GuildId, InboundMessage, Mention,
    MessageRouter, PresenceSource, ReadoutError, Result, UserId, VoiceStateChange,
};

pub mod voice;
pub use voice::{PcmPipe, PipeReader, SongbirdConnector, SongbirdSink};

/// Permissions requested by the invite link: view channels, send messages,
/// read history, connect, speak
pub const INVITE_PERMISSIONS: u64 = 3_148_864;

const NOT_IN_GUILD: &str = "サーバー内で使用してください。";
const NOT_IN_VOICE: &str = "先に、ボイスチャンネルに接続してください。";
const ALREADY_JOINED: &str = "ボットは既にボイスチャンネルに接続しています。";
const JOINED: &str = "ボイスチャンネルに接続しました。";
const NOT_JOINED: &str = "ボットはボイスチャットに接続していません。";
const WRONG_CHANNEL: &str = "ボットが存在するチャンネルでコマンドを使用してください。";
const LEFT: &str = "切断しました。";

/// OAuth2 link that adds the bot with the permissions it needs
pub fn invite_url(application_id: u64) -> String {
    format!(
        "https://discord.com/api/oauth2/authorize?client_id={}&permissions={}&scope=bot%20applications.commands",
        application_id, INVITE_PERMISSIONS
    )
}

#[derive(Clone)]
pub struct DiscordConfig {
    pub token: String,
    pub intents: GatewayIntents,
    pub application_id: Option<u64>,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            intents: GatewayIntents::GUILDS
                | GatewayIntents::GUILD_MESSAGES
                | GatewayIntents::MESSAGE_CONTENT
                | GatewayIntents::GUILD_MEMBERS
                | GatewayIntents::GUILD_VOICE_STATES,
            application_id: None,
        }
    }
}

impl From<&DiscordSection> for DiscordConfig {
    fn from(section: &DiscordSection) -> Self {
        Self {
            token: section.access_token.clone(),
            application_id: section.application_id,
            ..Self::default()
        }
    }
}

/// Nickname, then global name, then username
fn display_name(nick: Option<&str>, global_name: Option<&str>, username: &str) -> String {
    nick.or(global_name).unwrap_or(username).to_string()
}

/// Humans whose voice state points at `channel`
fn count_humans<I>(states: I, channel: u64) -> usize
where
    I: IntoIterator<Item = (Option<u64>, bool)>,
{
    states
        .into_iter()
        .filter(|(state_channel, is_bot)| *state_channel == Some(channel) && !is_bot)
        .count()
}

/// `(channel, is_bot)` of every voice state the cache holds for `guild`,
/// `None` until the guild is cached
fn voice_occupancy(
    cache: &Cache,
    guild: serenity::model::id::GuildId,
) -> Option<Vec<(Option<u64>, bool)>> {
    let guild = cache.guild(guild)?;
    let states = guild
        .voice_states
        .values()
        .map(|vs| {
            let is_bot = vs
                .member
                .as_ref()
                .map(|m| m.user.bot)
                .or_else(|| guild.members.get(&vs.user_id).map(|m| m.user.bot))
                .unwrap_or(false);
            (vs.channel_id.map(|c| c.get()), is_bot)
        })
        .collect();
    Some(states)
}

/// Human counts straight from the gateway cache
pub struct CachePresence {
    cache: Arc<Cache>,
}

impl CachePresence {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }
}

impl PresenceSource for CachePresence {
    fn humans_in(&self, guild: GuildId, channel: ChannelId) -> Option<usize> {
        let guild = serenity::model::id::GuildId::new(guild.get());
        voice_occupancy(&self.cache, guild).map(|states| count_humans(states, channel.get()))
    }
}

struct Handler {
    events: ChatEventSender,
    router: Arc<MessageRouter>,
    application_id: Option<u64>,
}

impl Handler {
    fn mentions(ctx: &Context, msg: &DiscordMessage) -> Vec<Mention> {
        let guild = msg.guild_id.and_then(|id| ctx.cache.guild(id));
        let mut mentions: Vec<Mention> = msg
            .mentions
            .iter()
            .map(|user| {
                let name = guild
                    .as_ref()
                    .and_then(|g| g.members.get(&user.id))
                    .map(|m| m.display_name().to_string())
                    .unwrap_or_else(|| display_name(None, user.global_name.as_deref(), &user.name));
                Mention {
                    id: user.id.get(),
                    display_name: name,
                }
            })
            .collect();
        if let Some(guild) = guild.as_ref() {
            for role in &msg.mention_roles {
                if let Some(r) = guild.roles.get(role) {
                    mentions.push(Mention {
                        id: role.get(),
                        display_name: r.name.clone(),
                    });
                }
            }
        }
        mentions
    }

    /// Human counts of the channels on both sides of a voice change, read from
    /// the cache after it applied the change
    fn humans_around(
        ctx: &Context,
        guild: serenity::model::id::GuildId,
        before: Option<u64>,
        after: Option<u64>,
    ) -> (usize, usize) {
        let Some(states) = voice_occupancy(&ctx.cache, guild) else {
            return (0, 0);
        };
        let count = |channel: Option<u64>| {
            channel.map_or(0, |c| count_humans(states.iter().copied(), c))
        };
        (count(before), count(after))
    }

    async fn forward(&self, event: ChatEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Router gone, dropping gateway event");
        }
    }

    async fn reply(ctx: &Context, cmd: &CommandInteraction, content: &str, ephemeral: bool) {
        let message = CreateInteractionResponseMessage::new()
            .content(content)
            .ephemeral(ephemeral);
        if let Err(e) = cmd
            .create_response(&ctx.http, CreateInteractionResponse::Message(message))
            .await
        {
            warn!(command = %cmd.data.name, error = %e, "Interaction reply failed");
        }
    }

    /// Finish a deferred interaction; failures go out as an ephemeral followup
    async fn finish(ctx: &Context, cmd: &CommandInteraction, outcome: std::result::Result<&str, String>) {
        let sent = match outcome {
            Ok(content) => cmd
                .edit_response(&ctx.http, EditInteractionResponse::new().content(content))
                .await
                .map(|_| ()),
            Err(content) => {
                let followup = CreateInteractionResponseFollowup::new()
                    .content(content)
                    .ephemeral(true);
                match cmd.create_followup(&ctx.http, followup).await {
                    Ok(_) => cmd.delete_response(&ctx.http).await,
                    Err(e) => Err(e),
                }
            }
        };
        if let Err(e) = sent {
            warn!(command = %cmd.data.name, error = %e, "Interaction followup failed");
        }
    }

    async fn vjoin(&self, ctx: &Context, cmd: &CommandInteraction, guild_id: serenity::model::id::GuildId) {
        let guild = GuildId(guild_id.get());
        let channel = ctx
            .cache
            .guild(guild_id)
            .and_then(|g| g.voice_states.get(&cmd.user.id).and_then(|vs| vs.channel_id))
            .map(|c| ChannelId(c.get()));
        let Some(channel) = channel else {
            return Self::reply(ctx, cmd, NOT_IN_VOICE, true).await;
        };
        if self.router.manager().is_joined(guild) {
            return Self::reply(ctx, cmd, ALREADY_JOINED, true).await;
        }

        // connecting can outlast the interaction deadline
        if let Err(e) = cmd.defer(&ctx.http).await {
            warn!(guild_id = %guild, error = %e, "Could not defer /vjoin");
            return;
        }
        let outcome = match self.router.join(guild, channel).await {
            Ok(_) => Ok(JOINED),
            Err(ReadoutError::AlreadyJoined(_)) => Err(ALREADY_JOINED.to_string()),
            Err(e) => {
                warn!(guild_id = %guild, channel_id = %channel, error = %e, "/vjoin failed");
                Err(format!("ボイスチャンネルに接続できませんでした: {}", e))
            }
        };
        Self::finish(ctx, cmd, outcome).await;
    }

    async fn vleave(&self, ctx: &Context, cmd: &CommandInteraction, guild_id: serenity::model::id::GuildId) {
        let guild = GuildId(guild_id.get());
        let Some(session) = self.router.manager().session(guild) else {
            return Self::reply(ctx, cmd, NOT_JOINED, true).await;
        };
        if session.bound_channel() != ChannelId(cmd.channel_id.get()) {
            return Self::reply(ctx, cmd, WRONG_CHANNEL, true).await;
        }
        drop(session);

        if let Err(e) = cmd.defer(&ctx.http).await {
            warn!(guild_id = %guild, error = %e, "Could not defer /vleave");
            return;
        }
        let outcome = match self.router.leave(guild).await {
            Ok(()) => Ok(LEFT),
            Err(ReadoutError::NotJoined(_)) => Err(NOT_JOINED.to_string()),
            Err(e) => Err(format!("切断に失敗しました: {}", e)),
        };
        Self::finish(ctx, cmd, outcome).await;
    }
}

#[serenity_async_trait]
impl serenity::prelude::EventHandler for Handler {
    async fn message(&self, ctx: Context, msg: DiscordMessage) {
        let mentions = Self::mentions(&ctx, &msg);
        let nick = msg.member.as_ref().and_then(|m| m.nick.as_deref());
        let author = Author {
            id: UserId(msg.author.id.get()),
            display_name: display_name(nick, msg.author.global_name.as_deref(), &msg.author.name),
            is_bot: msg.author.bot,
        };
        let event = InboundMessage {
            guild_id: msg.guild_id.map(|g| GuildId(g.get())),
            channel_id: ChannelId(msg.channel_id.get()),
            author,
            content: msg.content.clone(),
            mentions,
            attachment_count: msg.attachments.len(),
        };
        self.forward(ChatEvent::Message(event)).await;
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };
        let before = old.as_ref().and_then(|o| o.channel_id).map(|c| c.get());
        let after = new.channel_id.map(|c| c.get());
        let (humans_in_before, humans_in_after) = Self::humans_around(&ctx, guild_id, before, after);

        let member = match new.member.as_ref() {
            Some(m) => Author {
                id: UserId(new.user_id.get()),
                display_name: m.display_name().to_string(),
                is_bot: m.user.bot,
            },
            None => Author::human(new.user_id.get(), new.user_id.to_string()),
        };
        debug!(
            guild_id = %guild_id,
            user_id = %new.user_id,
            before = ?before,
            after = ?after,
            humans_in_before,
            humans_in_after,
            "Voice state update"
        );

        self.forward(ChatEvent::VoiceState(VoiceStateChange {
            guild_id: GuildId(guild_id.get()),
            member,
            before: before.map(ChannelId),
            after: after.map(ChannelId),
            humans_in_before,
            humans_in_after,
        }))
        .await;
    }

    async fn ready(&self, ctx: Context, ready: Ready) {
        self.router.set_self_id(UserId(ready.user.id.get()));
        info!(
            user = %ready.user.name,
            guilds_count = %ready.guilds.len(),
            "Discord ready"
        );
        let application_id = self.application_id.unwrap_or_else(|| ready.application.id.get());
        info!(url = %invite_url(application_id), "Invite link");

        let http = ctx.http.clone();
        tokio::spawn(async move {
            let commands = [
                CreateCommand::new("vjoin").description("ボイスチャットにボットを追加。"),
                CreateCommand::new("vleave").description("ボイスチャットから切断します。"),
            ];
            for builder in commands {
                if let Err(e) = Command::create_global_command(&http, builder).await {
                    warn!(error = %format!("{:?}", e), "Register global command failed");
                }
            }
        });
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Command(cmd) = interaction else {
            return;
        };
        let Some(guild_id) = cmd.guild_id else {
            return Self::reply(&ctx, &cmd, NOT_IN_GUILD, true).await;
        };
        match cmd.data.name.as_str() {
            "vjoin" => self.vjoin(&ctx, &cmd, guild_id).await,
            "vleave" => self.vleave(&ctx, &cmd, guild_id).await,
            other => debug!(command = other, "Unknown command"),
        }
    }
}

/// Running gateway client
pub struct DiscordHandle {
    shard_manager: Arc<ShardManager>,
    task: JoinHandle<()>,
}

impl DiscordHandle {
    /// Close every shard and wait for the client task
    pub async fn shutdown(self) {
        self.shard_manager.shutdown_all().await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "Discord client task ended abnormally");
        }
        info!("Discord adapter stopped");
    }
}

/// Connect to the gateway. Events go to `events`; slash commands are served
/// through `router`. `songbird` must be the instance behind the router's
/// [`SongbirdConnector`].
pub async fn start_discord(
    config: DiscordConfig,
    router: Arc<MessageRouter>,
    events: ChatEventSender,
    songbird: Arc<Songbird>,
) -> Result<DiscordHandle> {
    if config.token.trim().is_empty() {
        return Err(ReadoutError::config("Discord token is empty"));
    }
    let handler = Handler {
        events,
        router: router.clone(),
        application_id: config.application_id,
    };

    // voice states and members back the human counts
    let mut cache_settings = CacheSettings::default();
    cache_settings.cache_guilds = true;
    cache_settings.cache_channels = true;
    cache_settings.cache_users = true;

    let mut client = Client::builder(&config.token, config.intents)
        .event_handler(handler)
        .cache_settings(cache_settings)
        .register_songbird_with(songbird)
        .await
        .map_err(|e| ReadoutError::config(format!("creating Discord client: {:?}", e)))?;

    // joins re-check occupancy once connected
    router.set_presence_source(Arc::new(CachePresence::new(client.cache.clone())));

    let shard_manager = client.shard_manager.clone();
    let task = tokio::spawn(async move {
        if let Err(why) = client.start().await {
            error!(error = %format!("{:?}", why), "Discord client error");
        }
    });
    info!("Discord adapter started");
    Ok(DiscordHandle {
        shard_manager,
        task,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invite_url_carries_permissions() {
        let url = invite_url(1234);
        assert!(url.contains("client_id=1234"));
        assert!(url.contains("permissions=3148864"));
        assert!(url.ends_with("scope=bot%20applications.commands"));
    }

    #[test]
    fn test_display_name_precedence() {
        assert_eq!(display_name(Some("nick"), Some("global"), "user"), "nick");
        assert_eq!(display_name(None, Some("global"), "user"), "global");
        assert_eq!(display_name(None, None, "user"), "user");
    }

    #[test]
    fn test_count_humans_skips_bots_and_other_channels() {
        let states = [
            (Some(10), false),
            (Some(10), true),
            (Some(10), false),
            (Some(20), false),
            (None, false),
        ];
        assert_eq!(count_humans(states, 10), 2);
        assert_eq!(count_humans(states, 20), 1);
        assert_eq!(count_humans(states, 30), 0);
    }

    #[test]
    fn test_cache_presence_unknown_guild() {
        let presence = CachePresence::new(Arc::new(Cache::new()));
        assert_eq!(presence.humans_in(GuildId(1), ChannelId(10)), None);
    }

    #[test]
    fn test_config_from_section() {
        let section = DiscordSection {
            access_token: "token".into(),
            application_id: Some(99),
        };
        let config = DiscordConfig::from(&section);
        assert_eq!(config.token, "token");
        assert_eq!(config.application_id, Some(99));
        assert!(config.intents.contains(GatewayIntents::GUILD_VOICE_STATES));
        assert!(config.intents.contains(GatewayIntents::MESSAGE_CONTENT));
    }
}
