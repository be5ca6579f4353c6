use std::error::Error;
use std::sync::Arc;

use serenity::{client::Client, prelude::GatewayIntents};
use songbird::{SerenityInit, Songbird};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::commands::Dispatcher;
use crate::config::Config;
use crate::discord::{forward_notices, Handler, ShardManagerContainer};
use crate::resolver::YtDlpResolver;
use crate::session::SessionManager;
use crate::voice::SongbirdTransport;

mod commands;
mod config;
mod discord;
mod error;
mod keepalive;
mod models;
mod resolver;
mod session;
mod voice;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relay_bot=info,warn")))
        .init();

    let config = Config::from_env()?;

    info!("Starting with {config:?}");

    let songbird = Songbird::serenity();

    let (sessions, events, notices) =
        SessionManager::new(YtDlpResolver, SongbirdTransport::new(songbird.clone()), config.idle_timeout);
    let sessions = Arc::new(sessions);

    let dispatcher = Arc::new(Dispatcher::new(sessions.clone(), config.prefix.clone(), config.owner_id));

    let intents = GatewayIntents::non_privileged() | GatewayIntents::MESSAGE_CONTENT;

    let mut client = Client::builder(&config.token, intents)
        .event_handler(Handler::new(dispatcher, sessions.clone()))
        .register_songbird_with(songbird)
        .await?;

    {
        let mut data = client.data.write().await;
        data.insert::<ShardManagerContainer>(client.shard_manager.clone());
    }

    tokio::spawn(sessions.drive(events));
    tokio::spawn(forward_notices(client.cache_and_http.http.clone(), notices));

    let port = config.port;
    tokio::spawn(async move {
        if let Err(why) = keepalive::serve(port).await {
            error!("Keepalive server stopped: {why}");
        }
    });

    tokio::spawn(async move {
        let _ = client.start().await.map_err(|why| error!("Client ended: {why:?}"));
    });

    tokio::signal::ctrl_c().await?;

    info!("Received Ctrl-C, shutting down.");

    Ok(())
}
