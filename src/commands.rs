use std::sync::Arc;
use std::time::Duration;

use serenity::async_trait;
use serenity::model::id::{ChannelId, GuildId, UserId};
use tracing::info;

use crate::error::{CommandError, CommandResult};
use crate::resolver::TrackResolver;
use crate::session::{PlayOutcome, PlayRequest, SessionManager};
use crate::voice::VoiceTransport;

pub const HELP_TEXT: &str = r#"
**Commands:**
    **play [URL|Title]** - Plays (or adds to the queue) a track given a URL or a video title.
    **skip** - Skips the current track.
    **stop** - Stops the current track and clears the queue.
    **pause** - Pauses the current track.
    **resume** - Resumes the paused track.
    **volume [0.0-2.0]** - Sets the volume for the next tracks.
    **queue** - Shows the queue of tracks.
    **shuffle** - Reorders the upcoming tracks randomly.
    **ping** - Shows the gateway latency.
    "#;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Play(String),
    Skip,
    Stop,
    Pause,
    Resume,
    Volume(Option<String>),
    Queue,
    Shuffle,
    Ping,
    Announce(String),
    Help,
}

impl Command {
    /// Returns `None` for messages without the prefix and for unknown
    /// commands.
    pub fn parse(prefix: &str, content: &str) -> Option<Self> {
        let rest = content.strip_prefix(prefix)?;
        let mut tokens = rest.split_whitespace();
        let name = tokens.next()?.to_lowercase();
        let args: Vec<&str> = tokens.collect();

        let command = match name.as_str() {
            "play" => Self::Play(args.join(" ")),
            "skip" => Self::Skip,
            "stop" => Self::Stop,
            "pause" => Self::Pause,
            "resume" => Self::Resume,
            "volume" => Self::Volume(args.first().map(|arg| arg.to_string())),
            "queue" => Self::Queue,
            "shuffle" => Self::Shuffle,
            "ping" => Self::Ping,
            "announce" => Self::Announce(args.join(" ")),
            "help" => Self::Help,
            _ => return None,
        };

        Some(command)
    }
}

/// Who sent a command and from where.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub guild_id: Option<GuildId>,
    pub author_id: UserId,
    pub text_channel: ChannelId,
    /// The voice channel the author is currently connected to, if any.
    pub voice_channel: Option<ChannelId>,
}

/// What to send back for a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    /// A plain message in the command's channel.
    Say(String),
    /// A reply to the command message; used for refusals.
    Reply(String),
}

/// The bits of the chat platform the dispatcher needs beyond replying.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn latency(&self) -> Option<Duration>;

    /// Posts `content` once in every guild; returns how many received it.
    async fn broadcast(&self, content: &str) -> usize;
}

pub struct Dispatcher<R, V>
where
    R: TrackResolver,
    V: VoiceTransport<Stream = R::Stream>,
{
    sessions: Arc<SessionManager<R, V>>,
    prefix: String,
    owner_id: Option<UserId>,
}

impl<R, V> Dispatcher<R, V>
where
    R: TrackResolver,
    V: VoiceTransport<Stream = R::Stream>,
{
    pub fn new(sessions: Arc<SessionManager<R, V>>, prefix: String, owner_id: Option<UserId>) -> Self {
        Self {
            sessions,
            prefix,
            owner_id,
        }
    }

    pub fn parse(&self, content: &str) -> Option<Command> {
        Command::parse(&self.prefix, content)
    }

    /// Runs one command. Never fails: refusals come back as replies.
    pub async fn dispatch<G>(&self, gateway: &G, invocation: &Invocation, command: Command) -> Option<Response>
    where
        G: ChatGateway + ?Sized,
    {
        info!("Running {command:?} for user {}", invocation.author_id.0);

        match self.execute(gateway, invocation, command).await {
            Ok(response) => response,
            Err(why) => Some(Response::Reply(why.to_string())),
        }
    }

    async fn execute<G>(&self, gateway: &G, invocation: &Invocation, command: Command) -> CommandResult<Option<Response>>
    where
        G: ChatGateway + ?Sized,
    {
        let say = |content: String| -> CommandResult<Option<Response>> { Ok(Some(Response::Say(content))) };

        match command {
            Command::Ping => {
                let latency = match gateway.latency().await {
                    Some(latency) => format!("{}ms", latency.as_millis()),
                    None => "unknown".to_string(),
                };

                Ok(Some(Response::Reply(format!("🏓 Pong! Latency: {latency}"))))
            }
            Command::Help => say(HELP_TEXT.to_string()),
            Command::Announce(text) => {
                if self.owner_id != Some(invocation.author_id) {
                    return Err(CommandError::NotOwner);
                }

                if text.trim().is_empty() {
                    return Err(CommandError::EmptyAnnouncement);
                }

                let delivered = gateway
                    .broadcast(&format!("📢 **Announcement from the bot owner**:\n{text}"))
                    .await;

                info!("Announcement delivered to {delivered} guild(s)");

                Ok(Some(Response::Reply(format!("✅ Announcement sent to {delivered} server(s)."))))
            }
            command => {
                let guild_id = invocation.guild_id.ok_or(CommandError::NotInGuild)?;

                self.execute_in_guild(guild_id, invocation, command).await
            }
        }
    }

    async fn execute_in_guild(
        &self,
        guild_id: GuildId,
        invocation: &Invocation,
        command: Command,
    ) -> CommandResult<Option<Response>> {
        let say = |content: &str| -> CommandResult<Option<Response>> { Ok(Some(Response::Say(content.to_string()))) };

        match command {
            Command::Play(query) => {
                let voice_channel = invocation.voice_channel.ok_or(CommandError::NotInVoice)?;

                if query.trim().is_empty() {
                    return Err(CommandError::EmptyQuery);
                }

                let outcome = self
                    .sessions
                    .play(PlayRequest {
                        guild_id,
                        text_channel: invocation.text_channel,
                        voice_channel,
                        query,
                    })
                    .await?;

                match outcome {
                    // The now playing notice covers it.
                    PlayOutcome::Started { .. } => Ok(None),
                    PlayOutcome::Queued { title, .. } => say(&format!("🎵 Added to queue: **{title}**")),
                }
            }
            Command::Skip => {
                self.sessions.skip(guild_id).await?;
                say("⏭️ Skipping...")
            }
            Command::Stop => {
                self.sessions.stop(guild_id).await?;
                say("⏹️ Music stopped and queue cleared.")
            }
            Command::Pause => {
                self.sessions.pause(guild_id).await?;
                say("⏸️ Paused.")
            }
            Command::Resume => {
                self.sessions.resume(guild_id).await?;
                say("▶️ Resumed.")
            }
            Command::Volume(argument) => {
                let volume = self.sessions.set_volume(guild_id, argument.as_deref()).await?;
                say(&format!("🔊 Volume set to {}%", (volume * 100.0).round()))
            }
            Command::Queue => {
                let titles = self.sessions.titles(guild_id).await?;
                say(&format!("📜 Queue:\n{}", format_queue(&titles)))
            }
            Command::Shuffle => {
                self.sessions.shuffle(guild_id).await?;
                say("🔀 Queue shuffled!")
            }
            Command::Ping | Command::Help | Command::Announce(_) => Ok(None),
        }
    }
}

pub fn format_queue(titles: &[String]) -> String {
    titles
        .iter()
        .enumerate()
        .map(|(index, title)| format!("{}. {title}", index + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::session::tests::{FakeResolver, FakeVoice, Harness, GUILD, TEXT, VOICE};

    const OWNER: UserId = UserId(42);
    const STRANGER: UserId = UserId(7);

    #[derive(Default)]
    struct FakeGateway {
        broadcasts: StdMutex<Vec<String>>,
        guilds: AtomicUsize,
    }

    #[async_trait]
    impl ChatGateway for FakeGateway {
        async fn latency(&self) -> Option<Duration> {
            Some(Duration::from_millis(42))
        }

        async fn broadcast(&self, content: &str) -> usize {
            self.broadcasts.lock().unwrap().push(content.to_string());
            self.guilds.load(Ordering::SeqCst)
        }
    }

    fn dispatcher(harness: &Harness) -> Dispatcher<FakeResolver, FakeVoice> {
        Dispatcher::new(harness.manager.clone(), "!".to_string(), Some(OWNER))
    }

    fn in_voice(author_id: UserId) -> Invocation {
        Invocation {
            guild_id: Some(GUILD),
            author_id,
            text_channel: TEXT,
            voice_channel: Some(VOICE),
        }
    }

    async fn run(dispatcher: &Dispatcher<FakeResolver, FakeVoice>, invocation: &Invocation, content: &str) -> Option<Response> {
        let gateway = FakeGateway::default();
        let command = dispatcher.parse(content).expect("known command");

        dispatcher.dispatch(&gateway, invocation, command).await
    }

    #[test]
    fn parses_prefix_name_and_arguments() {
        assert_eq!(
            Command::parse("!", "!play never  gonna give you up"),
            Some(Command::Play("never gonna give you up".to_string()))
        );
        assert_eq!(Command::parse("!", "!SKIP"), Some(Command::Skip));
        assert_eq!(Command::parse("!", "!Volume 1.5 extra"), Some(Command::Volume(Some("1.5".to_string()))));
        assert_eq!(Command::parse("!", "!volume"), Some(Command::Volume(None)));
        assert_eq!(Command::parse("!", "!play"), Some(Command::Play(String::new())));
        assert_eq!(Command::parse("?", "?queue"), Some(Command::Queue));
    }

    #[test]
    fn ignores_everything_else() {
        assert_eq!(Command::parse("!", "play something"), None);
        assert_eq!(Command::parse("!", "!"), None);
        assert_eq!(Command::parse("!", "!dance"), None);
        assert_eq!(Command::parse("!", " !play x"), None);
    }

    #[test]
    fn queue_listing_is_one_indexed() {
        let titles = vec!["first".to_string(), "second".to_string()];

        assert_eq!(format_queue(&titles), "1. first\n2. second");
    }

    #[tokio::test]
    async fn play_requires_voice_and_a_query() {
        let harness = Harness::new();
        let dispatcher = dispatcher(&harness);

        let mut outside = in_voice(STRANGER);
        outside.voice_channel = None;

        assert_eq!(
            run(&dispatcher, &outside, "!play song").await,
            Some(Response::Reply(CommandError::NotInVoice.to_string()))
        );
        assert_eq!(
            run(&dispatcher, &in_voice(STRANGER), "!play").await,
            Some(Response::Reply(CommandError::EmptyQuery.to_string()))
        );
        assert_eq!(harness.manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn queueing_a_second_song_confirms_and_lists_both() {
        let harness = Harness::new();
        let dispatcher = dispatcher(&harness);
        let invocation = in_voice(STRANGER);

        assert_eq!(run(&dispatcher, &invocation, "!play first").await, None);
        assert_eq!(
            run(&dispatcher, &invocation, "!play second").await,
            Some(Response::Say("🎵 Added to queue: **second**".to_string()))
        );
        assert_eq!(
            run(&dispatcher, &invocation, "!queue").await,
            Some(Response::Say("📜 Queue:\n1. first\n2. second".to_string()))
        );
    }

    #[tokio::test]
    async fn volume_replies() {
        let harness = Harness::new();
        let dispatcher = dispatcher(&harness);
        let invocation = in_voice(STRANGER);

        assert_eq!(
            run(&dispatcher, &invocation, "!volume 1").await,
            Some(Response::Reply(CommandError::NoQueue.to_string()))
        );

        run(&dispatcher, &invocation, "!play song").await;

        assert_eq!(
            run(&dispatcher, &invocation, "!volume 1.5").await,
            Some(Response::Say("🔊 Volume set to 150%".to_string()))
        );
        assert_eq!(
            run(&dispatcher, &invocation, "!volume 3").await,
            Some(Response::Reply(CommandError::InvalidVolume.to_string()))
        );
        assert_eq!(harness.manager.snapshot(GUILD).await.unwrap().volume, 1.5);
    }

    #[tokio::test]
    async fn guild_commands_outside_a_guild_are_refused() {
        let harness = Harness::new();
        let dispatcher = dispatcher(&harness);
        let mut direct = in_voice(STRANGER);
        direct.guild_id = None;

        assert_eq!(
            run(&dispatcher, &direct, "!skip").await,
            Some(Response::Reply(CommandError::NotInGuild.to_string()))
        );
    }

    #[tokio::test]
    async fn ping_reports_latency() {
        let harness = Harness::new();
        let dispatcher = dispatcher(&harness);

        assert_eq!(
            run(&dispatcher, &in_voice(STRANGER), "!ping").await,
            Some(Response::Reply("🏓 Pong! Latency: 42ms".to_string()))
        );
    }

    #[tokio::test]
    async fn announce_is_owner_only_and_needs_text() {
        let harness = Harness::new();
        let dispatcher = dispatcher(&harness);
        let gateway = FakeGateway::default();
        gateway.guilds.store(3, Ordering::SeqCst);

        let refused = dispatcher
            .dispatch(&gateway, &in_voice(STRANGER), Command::Announce("hello".to_string()))
            .await;
        assert_eq!(refused, Some(Response::Reply(CommandError::NotOwner.to_string())));

        let empty = dispatcher
            .dispatch(&gateway, &in_voice(OWNER), Command::Announce("  ".to_string()))
            .await;
        assert_eq!(empty, Some(Response::Reply(CommandError::EmptyAnnouncement.to_string())));

        assert!(gateway.broadcasts.lock().unwrap().is_empty());

        let sent = dispatcher
            .dispatch(&gateway, &in_voice(OWNER), Command::Announce("maintenance tonight".to_string()))
            .await;
        assert_eq!(sent, Some(Response::Reply("✅ Announcement sent to 3 server(s).".to_string())));
        assert_eq!(
            *gateway.broadcasts.lock().unwrap(),
            vec!["📢 **Announcement from the bot owner**:\nmaintenance tonight".to_string()]
        );
    }

    #[tokio::test]
    async fn announce_without_configured_owner_is_refused() {
        let harness = Harness::new();
        let dispatcher = Dispatcher::new(harness.manager.clone(), "!".to_string(), None);

        assert_eq!(
            run(&dispatcher, &in_voice(OWNER), "!announce hi").await,
            Some(Response::Reply(CommandError::NotOwner.to_string()))
        );
    }
}
