use std::sync::Arc;

use serenity::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use songbird::input::Input;
use songbird::tracks::TrackHandle;
use songbird::{Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::error::VoiceError;

/// Notifications that drive a guild's playback forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The track started under `token` reached the end or was stopped.
    Finished { guild_id: GuildId, token: u64 },
    /// The idle timer armed under `token` ran out.
    IdleExpired { guild_id: GuildId, token: u64 },
}

/// Handed to the transport with every track; fired once when it ends.
#[derive(Clone, Debug)]
pub struct EndSignal {
    events: UnboundedSender<PlaybackEvent>,
    guild_id: GuildId,
    token: u64,
}

impl EndSignal {
    pub fn new(events: UnboundedSender<PlaybackEvent>, guild_id: GuildId, token: u64) -> Self {
        Self { events, guild_id, token }
    }

    pub fn fire(&self) {
        let event = PlaybackEvent::Finished {
            guild_id: self.guild_id,
            token: self.token,
        };

        if self.events.send(event).is_err() {
            debug!("Playback driver is gone, dropping end of track {}", self.token);
        }
    }
}

/// Controls for the resource that is currently playing.
pub trait Playback: Send + Sync + 'static {
    fn pause(&self) -> Result<(), VoiceError>;

    fn resume(&self) -> Result<(), VoiceError>;

    /// Ends the resource early. The transport still fires its `EndSignal`.
    fn stop(&self) -> Result<(), VoiceError>;
}

/// Voice connections, one per guild, and playback on top of them.
#[async_trait]
pub trait VoiceTransport: Send + Sync + 'static {
    type Stream: Send + 'static;
    type Playback: Playback;

    async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), VoiceError>;

    /// Builds a resource from `stream` with the given gain and plays it.
    async fn play(
        &self,
        guild_id: GuildId,
        stream: Self::Stream,
        gain: f32,
        on_end: EndSignal,
    ) -> Result<Self::Playback, VoiceError>;

    async fn leave(&self, guild_id: GuildId) -> Result<(), VoiceError>;
}

pub struct SongbirdTransport {
    manager: Arc<Songbird>,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    type Stream = Input;
    type Playback = SongbirdPlayback;

    async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), VoiceError> {
        let (handler_lock, result) = self.manager.join(guild_id, channel_id).await;

        result.map_err(|why| VoiceError::Join(why.to_string()))?;

        info!("Joined voice channel {} in guild {}", channel_id.0, guild_id.0);

        let mut handler = handler_lock.lock().await;

        if handler.is_deaf() {
            debug!("Already deafened in guild {}", guild_id.0);
        } else if let Err(why) = handler.deafen(true).await {
            warn!("Deafen failed due to {why:?}");
        }

        Ok(())
    }

    async fn play(
        &self,
        guild_id: GuildId,
        stream: Input,
        gain: f32,
        on_end: EndSignal,
    ) -> Result<SongbirdPlayback, VoiceError> {
        let handler_lock = self.manager.get(guild_id).ok_or(VoiceError::NotConnected)?;

        let (mut track, track_handle) = songbird::create_player(stream);
        track.set_volume(gain);

        {
            let mut handler = handler_lock.lock().await;
            handler.play(track);
        }

        track_handle
            .add_event(Event::Track(TrackEvent::End), SongEndNotifier { signal: on_end })
            .map_err(|why| VoiceError::Control(why.to_string()))?;

        Ok(SongbirdPlayback(track_handle))
    }

    async fn leave(&self, guild_id: GuildId) -> Result<(), VoiceError> {
        if self.manager.get(guild_id).is_none() {
            return Ok(());
        }

        self.manager
            .remove(guild_id)
            .await
            .map_err(|why| VoiceError::Leave(why.to_string()))
    }
}

pub struct SongbirdPlayback(TrackHandle);

impl Playback for SongbirdPlayback {
    fn pause(&self) -> Result<(), VoiceError> {
        self.0.pause().map_err(|why| VoiceError::Control(why.to_string()))
    }

    fn resume(&self) -> Result<(), VoiceError> {
        self.0.play().map_err(|why| VoiceError::Control(why.to_string()))
    }

    fn stop(&self) -> Result<(), VoiceError> {
        self.0.stop().map_err(|why| VoiceError::Control(why.to_string()))
    }
}

struct SongEndNotifier {
    signal: EndSignal,
}

#[async_trait]
impl VoiceEventHandler for SongEndNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        debug!("End notifier triggered");

        self.signal.fire();

        Some(Event::Cancel)
    }
}
