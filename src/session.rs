//! Per-guild queues and the playback driver.
//!
//! Every guild with an active session owns exactly one [`GuildQueue`] in the
//! table. A queue moves between three phases: `Connecting` while the voice
//! join is in flight, `Playing` while the head track is on air and `Idle`
//! once the queue ran dry and the teardown timer is armed. When that timer
//! fires the entry is removed and the voice connection destroyed.
//!
//! Commands mutate the table under its lock, but never hold it across a
//! search, a stream open or a voice join. Track completions and timer
//! expiries arrive as [`PlaybackEvent`]s on one channel and are applied in
//! order by [`SessionManager::drive`]. Tokens on both make stale events
//! harmless.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use serenity::model::id::{ChannelId, GuildId};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CommandError, CommandResult};
use crate::models::Song;
use crate::resolver::TrackResolver;
use crate::voice::{EndSignal, Playback, PlaybackEvent, VoiceTransport};

pub const MIN_VOLUME: f32 = 0.0;
pub const MAX_VOLUME: f32 = 2.0;

/// A message the bot wants to post on its own, outside of a command reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub channel_id: ChannelId,
    pub content: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Playing,
    Idle,
}

struct ActivePlayback<P> {
    token: u64,
    handle: P,
}

struct IdleTimer {
    token: u64,
    task: JoinHandle<()>,
}

pub struct GuildQueue<S, P> {
    pub text_channel: ChannelId,
    pub voice_channel: ChannelId,
    session_id: u64,
    phase: Phase,
    songs: VecDeque<Song<S>>,
    playback: Option<ActivePlayback<P>>,
    volume: f32,
    idle_timer: Option<IdleTimer>,
}

impl<S, P> GuildQueue<S, P> {
    fn new(text_channel: ChannelId, voice_channel: ChannelId, session_id: u64, first: Song<S>) -> Self {
        Self {
            text_channel,
            voice_channel,
            session_id,
            phase: Phase::Connecting,
            songs: VecDeque::from([first]),
            playback: None,
            volume: 1.0,
            idle_timer: None,
        }
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.task.abort();
            debug!("Idle timer {} cancelled", timer.token);
        }
    }
}

/// What `play` did with the resolved song.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlayOutcome {
    /// The song went on air right away.
    Started { title: String },
    /// The song was appended behind others, at this 1-based position.
    Queued { title: String, position: usize },
}

pub struct PlayRequest {
    pub guild_id: GuildId,
    pub text_channel: ChannelId,
    pub voice_channel: ChannelId,
    pub query: String,
}

/// Read-only view of a queue.
#[cfg(test)]
#[derive(Clone, Debug, PartialEq)]
pub struct QueueSnapshot {
    pub phase: Phase,
    pub titles: Vec<String>,
    pub volume: f32,
    pub idle_timer_armed: bool,
}

pub struct SessionManager<R, V>
where
    R: TrackResolver,
    V: VoiceTransport<Stream = R::Stream>,
{
    resolver: R,
    voice: V,
    idle_timeout: Duration,
    guilds: Mutex<HashMap<GuildId, GuildQueue<R::Stream, V::Playback>>>,
    generations: Mutex<HashMap<GuildId, u64>>,
    tokens: AtomicU64,
    events: UnboundedSender<PlaybackEvent>,
    notices: UnboundedSender<Notice>,
}

impl<R, V> SessionManager<R, V>
where
    R: TrackResolver,
    V: VoiceTransport<Stream = R::Stream>,
{
    /// Builds a manager together with the receiving ends of its playback
    /// event channel (to feed into [`Self::drive`]) and its notice channel.
    pub fn new(
        resolver: R,
        voice: V,
        idle_timeout: Duration,
    ) -> (Self, UnboundedReceiver<PlaybackEvent>, UnboundedReceiver<Notice>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (notices, notices_rx) = mpsc::unbounded_channel();

        let manager = Self {
            resolver,
            voice,
            idle_timeout,
            guilds: Mutex::new(HashMap::new()),
            generations: Mutex::new(HashMap::new()),
            tokens: AtomicU64::new(1),
            events,
            notices,
        };

        (manager, events_rx, notices_rx)
    }

    /// The event loop: applies completions and timer expiries one at a time.
    pub async fn drive(self: Arc<Self>, mut events: UnboundedReceiver<PlaybackEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
    }

    pub async fn handle_event(&self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Finished { guild_id, token } => self.on_track_end(guild_id, token).await,
            PlaybackEvent::IdleExpired { guild_id, token } => self.on_idle_expired(guild_id, token).await,
        }
    }

    pub async fn play(&self, request: PlayRequest) -> CommandResult<PlayOutcome> {
        let PlayRequest {
            guild_id,
            text_channel,
            voice_channel,
            query,
        } = request;

        let query = query.trim();

        if query.is_empty() {
            return Err(CommandError::EmptyQuery);
        }

        let generation = self.generation(guild_id).await;

        info!("Resolving {query:?} for guild {}", guild_id.0);

        let result = self
            .resolver
            .search(query, 1)
            .await?
            .into_iter()
            .next()
            .ok_or(CommandError::NoMatch)?;

        let opened = self.resolver.open_stream(&result.url).await?;
        let song = Song::new(result, opened);
        let title = song.title.clone();

        info!("Resolved {} - {} ({})", song.title, song.url, song.format);

        let mut guilds = self.guilds.lock().await;

        if self.generation(guild_id).await != generation {
            info!("Dropping {title}, playback in guild {} was stopped while it loaded", guild_id.0);

            return Err(CommandError::Superseded);
        }

        if let Some(queue) = guilds.get_mut(&guild_id) {
            queue.songs.push_back(song);
            let position = queue.songs.len();

            if queue.phase == Phase::Idle {
                self.start_head(guild_id, queue).await;

                return Ok(PlayOutcome::Started { title });
            }

            info!("Queued {title} at position {position} in guild {}", guild_id.0);

            return Ok(PlayOutcome::Queued { title, position });
        }

        let session_id = self.next_token();
        guilds.insert(guild_id, GuildQueue::new(text_channel, voice_channel, session_id, song));
        drop(guilds);

        if let Err(why) = self.voice.join(guild_id, voice_channel).await {
            warn!("Join failed in guild {}: {why}", guild_id.0);

            let mut guilds = self.guilds.lock().await;

            if guilds.get(&guild_id).map(|queue| queue.session_id) == Some(session_id) {
                guilds.remove(&guild_id);
            }

            if let Err(why) = self.voice.leave(guild_id).await {
                debug!("Cleanup after failed join: {why}");
            }

            return Err(CommandError::Join(why));
        }

        let mut guilds = self.guilds.lock().await;

        match guilds.get_mut(&guild_id) {
            Some(queue) if queue.session_id == session_id => {
                self.start_head(guild_id, queue).await;

                Ok(PlayOutcome::Started { title })
            }
            _ => Err(CommandError::Superseded),
        }
    }

    /// Ends the current track early; the normal completion path advances.
    pub async fn skip(&self, guild_id: GuildId) -> CommandResult<()> {
        let guilds = self.guilds.lock().await;
        let queue = guilds.get(&guild_id).ok_or(CommandError::NoQueue)?;
        let playback = queue.playback.as_ref().ok_or(CommandError::NothingPlaying)?;

        info!("Skipping track {} in guild {}", playback.token, guild_id.0);

        playback.handle.stop().map_err(CommandError::Control)
    }

    /// Clears the pending songs and stops the player; the session then idles
    /// out like any other empty queue. Also invalidates in-flight `play`s.
    pub async fn stop(&self, guild_id: GuildId) -> CommandResult<()> {
        self.bump_generation(guild_id).await;

        let mut guilds = self.guilds.lock().await;
        let queue = guilds.get_mut(&guild_id).ok_or(CommandError::NoQueue)?;

        queue.songs.clear();

        info!("Stopped playback in guild {}", guild_id.0);

        match &queue.playback {
            Some(playback) => playback.handle.stop().map_err(CommandError::Control),
            None => Ok(()),
        }
    }

    pub async fn pause(&self, guild_id: GuildId) -> CommandResult<()> {
        let guilds = self.guilds.lock().await;
        let queue = guilds.get(&guild_id).ok_or(CommandError::NoQueue)?;
        let playback = queue.playback.as_ref().ok_or(CommandError::NothingPlaying)?;

        playback.handle.pause().map_err(CommandError::Control)
    }

    pub async fn resume(&self, guild_id: GuildId) -> CommandResult<()> {
        let guilds = self.guilds.lock().await;
        let queue = guilds.get(&guild_id).ok_or(CommandError::NoQueue)?;
        let playback = queue.playback.as_ref().ok_or(CommandError::NothingPlaying)?;

        playback.handle.resume().map_err(CommandError::Control)
    }

    /// Sets the gain used for every resource built from now on.
    pub async fn set_volume(&self, guild_id: GuildId, argument: Option<&str>) -> CommandResult<f32> {
        let mut guilds = self.guilds.lock().await;
        let queue = guilds.get_mut(&guild_id).ok_or(CommandError::NoQueue)?;

        let volume = parse_volume(argument)?;
        queue.volume = volume;

        info!("Volume in guild {} set to {volume}", guild_id.0);

        Ok(volume)
    }

    /// Titles in play order, the current track first.
    pub async fn titles(&self, guild_id: GuildId) -> CommandResult<Vec<String>> {
        let guilds = self.guilds.lock().await;

        match guilds.get(&guild_id) {
            Some(queue) if !queue.songs.is_empty() => Ok(queue.songs.iter().map(|song| song.title.clone()).collect()),
            _ => Err(CommandError::EmptyQueue),
        }
    }

    pub async fn shuffle(&self, guild_id: GuildId) -> CommandResult<()> {
        let mut guilds = self.guilds.lock().await;

        match guilds.get_mut(&guild_id) {
            Some(queue) if queue.songs.len() > 1 => {
                shuffle_upcoming(&mut queue.songs, &mut thread_rng());

                Ok(())
            }
            _ => Err(CommandError::QueueTooShort),
        }
    }

    /// Drops the session right away, e.g. after the bot was kicked from its
    /// voice channel.
    pub async fn disconnect(&self, guild_id: GuildId) {
        let mut guilds = self.guilds.lock().await;

        match guilds.get(&guild_id) {
            Some(queue) if queue.phase != Phase::Connecting => {}
            _ => return,
        }

        if let Some(mut queue) = guilds.remove(&guild_id) {
            queue.cancel_idle_timer();
            queue.songs.clear();

            if let Some(playback) = queue.playback.take() {
                if let Err(why) = playback.handle.stop() {
                    debug!("Stopping track on disconnect failed: {why}");
                }
            }

            if let Err(why) = self.voice.leave(guild_id).await {
                debug!("Leave after disconnect failed: {why}");
            }

            info!("Session in guild {} torn down after disconnect", guild_id.0);
        }
    }

    #[cfg(test)]
    pub async fn snapshot(&self, guild_id: GuildId) -> Option<QueueSnapshot> {
        let guilds = self.guilds.lock().await;

        guilds.get(&guild_id).map(|queue| QueueSnapshot {
            phase: queue.phase,
            titles: queue.songs.iter().map(|song| song.title.clone()).collect(),
            volume: queue.volume,
            idle_timer_armed: queue.idle_timer.is_some(),
        })
    }

    #[cfg(test)]
    pub async fn session_count(&self) -> usize {
        self.guilds.lock().await.len()
    }

    async fn on_track_end(&self, guild_id: GuildId, token: u64) {
        let mut guilds = self.guilds.lock().await;

        let Some(queue) = guilds.get_mut(&guild_id) else {
            debug!("Track {token} ended in guild {} without a session", guild_id.0);
            return;
        };

        if queue.playback.as_ref().map(|playback| playback.token) != Some(token) {
            debug!("Ignoring stale end of track {token} in guild {}", guild_id.0);
            return;
        }

        queue.playback = None;

        if let Some(finished) = queue.songs.pop_front() {
            info!("Finished {} in guild {}", finished.title, guild_id.0);
        }

        self.start_head(guild_id, queue).await;
    }

    async fn on_idle_expired(&self, guild_id: GuildId, token: u64) {
        let mut guilds = self.guilds.lock().await;

        let expired = guilds.get(&guild_id).is_some_and(|queue| {
            queue.phase == Phase::Idle && queue.idle_timer.as_ref().map(|timer| timer.token) == Some(token)
        });

        if !expired {
            debug!("Ignoring stale idle timer {token} in guild {}", guild_id.0);
            return;
        }

        if let Some(queue) = guilds.remove(&guild_id) {
            debug!("Leaving voice channel {} in guild {}", queue.voice_channel.0, guild_id.0);
        }

        // Still under the table lock, so a new session cannot race the leave.
        if let Err(why) = self.voice.leave(guild_id).await {
            warn!("Leaving voice in guild {} failed: {why}", guild_id.0);
        }

        info!("Idle for {:?}, session in guild {} torn down", self.idle_timeout, guild_id.0);
    }

    /// Plays the head of the queue, dropping songs that fail to start. Arms the
    /// idle timer when nothing is left.
    async fn start_head(&self, guild_id: GuildId, queue: &mut GuildQueue<R::Stream, V::Playback>) {
        queue.cancel_idle_timer();

        loop {
            let Some(song) = queue.songs.front_mut() else {
                self.arm_idle_timer(guild_id, queue);
                return;
            };

            let Some(stream) = song.stream.take() else {
                warn!("{} has no stream left, dropping it", song.title);
                queue.songs.pop_front();
                continue;
            };

            song.gain = queue.volume;
            let gain = song.gain;
            let title = song.title.clone();
            let token = self.next_token();
            let on_end = EndSignal::new(self.events.clone(), guild_id, token);

            match self.voice.play(guild_id, stream, gain, on_end).await {
                Ok(handle) => {
                    info!("Playing {title} (track {token}) at gain {gain} in guild {}", guild_id.0);

                    queue.playback = Some(ActivePlayback { token, handle });
                    queue.phase = Phase::Playing;
                    self.notify(queue.text_channel, format!("🎶 Now playing: **{title}**"));

                    return;
                }
                Err(why) => {
                    warn!("Could not start {title} in guild {}: {why}", guild_id.0);

                    self.notify(queue.text_channel, format!("❌ Could not play **{title}** ({why})."));
                    queue.songs.pop_front();
                }
            }
        }
    }

    fn arm_idle_timer(&self, guild_id: GuildId, queue: &mut GuildQueue<R::Stream, V::Playback>) {
        queue.cancel_idle_timer();

        let token = self.next_token();
        let events = self.events.clone();
        let timeout = self.idle_timeout;

        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(PlaybackEvent::IdleExpired { guild_id, token });
        });

        queue.idle_timer = Some(IdleTimer { token, task });
        queue.phase = Phase::Idle;

        info!("Queue in guild {} is empty, leaving in {timeout:?}", guild_id.0);
    }

    fn notify(&self, channel_id: ChannelId, content: String) {
        if self.notices.send(Notice { channel_id, content }).is_err() {
            debug!("Notice channel closed");
        }
    }

    fn next_token(&self) -> u64 {
        self.tokens.fetch_add(1, Ordering::Relaxed)
    }

    async fn generation(&self, guild_id: GuildId) -> u64 {
        self.generations.lock().await.get(&guild_id).copied().unwrap_or(0)
    }

    async fn bump_generation(&self, guild_id: GuildId) {
        *self.generations.lock().await.entry(guild_id).or_insert(0) += 1;
    }
}

/// Accepts a number in `MIN_VOLUME..=MAX_VOLUME`.
pub fn parse_volume(argument: Option<&str>) -> CommandResult<f32> {
    let volume: f32 = argument
        .and_then(|value| value.trim().parse().ok())
        .ok_or(CommandError::InvalidVolume)?;

    if (MIN_VOLUME..=MAX_VOLUME).contains(&volume) {
        Ok(volume)
    } else {
        Err(CommandError::InvalidVolume)
    }
}

/// Shuffles everything behind the head, which stays where it is.
pub fn shuffle_upcoming<T, G: Rng + ?Sized>(items: &mut VecDeque<T>, rng: &mut G) {
    if items.len() > 2 {
        items.make_contiguous()[1..].shuffle(rng);
    }
}
