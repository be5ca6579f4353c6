use thiserror::Error;

/// Problems found while reading the process configuration at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Failures of the track search / stream resolution step.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("search failed: {0}")]
    Search(String),

    #[error("could not open stream: {0}")]
    Stream(String),
}

/// Failures reported by the voice transport.
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("could not join the voice channel: {0}")]
    Join(String),

    #[error("not connected to a voice channel")]
    NotConnected,

    #[error("could not leave the voice channel: {0}")]
    Leave(String),

    #[error("playback control failed: {0}")]
    Control(String),
}

/// Everything a command can fail with. The `Display` text is what the user
/// sees as a reply.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("This command only works inside a server.")]
    NotInGuild,

    #[error("🎤 You need to be in a voice channel!")]
    NotInVoice,

    #[error("Give me a song title or a YouTube link.")]
    EmptyQuery,

    #[error("❌ Song not found.")]
    NoMatch,

    #[error("❌ Could not load that song ({0}).")]
    Resolve(#[from] ResolveError),

    #[error("❌ Failed to play the song ({0}).")]
    Join(VoiceError),

    #[error("❌ Player error ({0}).")]
    Control(VoiceError),

    #[error("❌ Nothing is playing.")]
    NoQueue,

    #[error("❌ No track is playing right now.")]
    NothingPlaying,

    #[error("🚫 The queue is empty.")]
    EmptyQueue,

    #[error("❌ Not enough songs to shuffle.")]
    QueueTooShort,

    #[error("Use a volume between 0.0 and 2.0")]
    InvalidVolume,

    #[error("❌ Only the bot owner can make announcements.")]
    NotOwner,

    #[error("Write the announcement text after the command.")]
    EmptyAnnouncement,

    #[error("⏹️ Playback was stopped before the song finished loading.")]
    Superseded,
}

pub type CommandResult<T> = Result<T, CommandError>;
