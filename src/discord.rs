use std::sync::Arc;
use std::time::Duration;

use serenity::{
    async_trait,
    client::bridge::gateway::{ShardId, ShardManager},
    client::{Context, EventHandler},
    http::Http,
    model::channel::{Channel, ChannelType, Message},
    model::gateway::Ready,
    model::id::ChannelId,
    model::prelude::VoiceState,
    prelude::{Mutex, TypeMapKey},
    Result as SerenityResult,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::commands::{ChatGateway, Dispatcher, Invocation, Response};
use crate::resolver::YtDlpResolver;
use crate::session::{Notice, SessionManager};
use crate::voice::SongbirdTransport;

pub type BotSessions = SessionManager<YtDlpResolver, SongbirdTransport>;
pub type BotDispatcher = Dispatcher<YtDlpResolver, SongbirdTransport>;

pub struct ShardManagerContainer;

impl TypeMapKey for ShardManagerContainer {
    type Value = Arc<Mutex<ShardManager>>;
}

pub struct Handler {
    dispatcher: Arc<BotDispatcher>,
    sessions: Arc<BotSessions>,
}

impl Handler {
    pub fn new(dispatcher: Arc<BotDispatcher>, sessions: Arc<BotSessions>) -> Self {
        Self { dispatcher, sessions }
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        let Some(command) = self.dispatcher.parse(&msg.content) else {
            return;
        };

        info!("Message received {}", msg.content);

        let voice_channel = msg
            .guild(&ctx.cache)
            .and_then(|guild| guild.voice_states.get(&msg.author.id).and_then(|voice_state| voice_state.channel_id));

        let invocation = Invocation {
            guild_id: msg.guild_id,
            author_id: msg.author.id,
            text_channel: msg.channel_id,
            voice_channel,
        };

        let gateway = SerenityGateway { ctx: &ctx };

        match self.dispatcher.dispatch(&gateway, &invocation, command).await {
            Some(Response::Say(content)) => check_msg(msg.channel_id.say(&ctx.http, content).await),
            Some(Response::Reply(content)) => check_msg(msg.reply(&ctx.http, content).await),
            None => {}
        }
    }

    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("{} is connected!", ready.user.name);
    }

    async fn voice_state_update(&self, ctx: Context, _: Option<VoiceState>, new: VoiceState) {
        if new.channel_id.is_some() || new.user_id != ctx.cache.current_user_id() {
            return;
        }

        if let Some(guild_id) = new.guild_id {
            info!("Bot left the voice channel in guild {}", guild_id.0);

            self.sessions.disconnect(guild_id).await;
        }
    }
}

/// Latency and broadcast backed by the gateway cache and shard runners.
struct SerenityGateway<'a> {
    ctx: &'a Context,
}

#[async_trait]
impl ChatGateway for SerenityGateway<'_> {
    async fn latency(&self) -> Option<Duration> {
        let shard_manager = {
            let data = self.ctx.data.read().await;
            data.get::<ShardManagerContainer>()?.clone()
        };

        let manager = shard_manager.lock().await;
        let runners = manager.runners.lock().await;

        runners.get(&ShardId(self.ctx.shard_id))?.latency
    }

    async fn broadcast(&self, content: &str) -> usize {
        let cache = &self.ctx.cache;
        let bot_id = cache.current_user_id();
        let mut delivered = 0;

        for guild_id in cache.guilds() {
            let Some(guild) = cache.guild(guild_id) else {
                continue;
            };

            let candidates = guild
                .channels
                .values()
                .filter_map(|channel| match channel {
                    Channel::Guild(channel) if channel.kind == ChannelType::Text => Some(channel),
                    _ => None,
                })
                .map(|channel| {
                    let can_send = channel
                        .permissions_for_user(cache, bot_id)
                        .map(|permissions| permissions.send_messages())
                        .unwrap_or(false);

                    (channel.position, channel.id, can_send)
                })
                .collect();

            let Some(channel_id) = announcement_channel(guild.system_channel_id, candidates) else {
                debug!("No channel to announce in for guild {}", guild_id.0);
                continue;
            };

            match channel_id.say(&self.ctx.http, content).await {
                Ok(_) => delivered += 1,
                Err(why) => warn!("Announcement to guild {} failed: {why:?}", guild_id.0),
            }
        }

        delivered
    }
}

/// The guild's system channel, or else the top-most text channel the bot may
/// write to. Candidates are `(position, id, can_send)`.
pub fn announcement_channel(system_channel: Option<ChannelId>, mut candidates: Vec<(i64, ChannelId, bool)>) -> Option<ChannelId> {
    if system_channel.is_some() {
        return system_channel;
    }

    candidates.sort_by_key(|(position, id, _)| (*position, id.0));

    candidates
        .into_iter()
        .find(|(_, _, can_send)| *can_send)
        .map(|(_, id, _)| id)
}

/// Posts the session manager's notices until the channel closes.
pub async fn forward_notices(http: Arc<Http>, mut notices: UnboundedReceiver<Notice>) {
    while let Some(notice) = notices.recv().await {
        check_msg(notice.channel_id.say(&http, notice.content).await);
    }
}

/// Checks that a message successfully sent; if not, then logs why.
fn check_msg(result: SerenityResult<Message>) {
    if let Err(why) = result {
        warn!("Error sending message: {why:?}");
    }
}
