mod cache;
mod config;
mod discord;
mod handler;
mod log;
mod models;
mod notify;
mod osu_api;
mod polling;
mod queue;
mod scores;
mod store;
mod stream;
mod tracker;

use anyhow::Result;
use clap::Parser;
use serenity::prelude::*;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::RwLock;

use config::Config;
use handler::BotHandler;
use osu_api::OsuClient;
use store::ProfileStore;
use tracker::Tracker;

#[derive(Parser)]
struct Args {
    /// Path to the configuration file.
    #[arg(long, default_value = "config.toml")]
    config: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_file(&args.config)
        .expect("Failed to read config. Please create it with your bot token and settings.");

    print_config_info(&config);

    let config = Arc::new(config);
    let client = Arc::new(OsuClient::new(config.osu.clone())?);
    let store = Arc::new(ProfileStore::load(&config.tracking.profiles_path).await?);
    let tracker = Arc::new(RwLock::new(Tracker::default()));

    let intents = GatewayIntents::GUILD_MESSAGES | GatewayIntents::MESSAGE_CONTENT;

    let handler = BotHandler {
        config: Arc::clone(&config),
        client: Arc::clone(&client),
        store: Arc::clone(&store),
        tracker: Arc::clone(&tracker),
        started: AtomicBool::new(false),
    };

    let mut client = Client::builder(&config.discord.token, intents)
        .event_handler(handler)
        .await
        .expect("Failed to create Discord client");

    println!("[+] Starting tracker bot...\n");

    if let Err(why) = client.start().await {
        eprintln!("[-] Client error: {:?}", why);
    }

    Ok(())
}

fn print_config_info(config: &Config) {
    println!("📋 Configuration loaded:");
    println!("   API URL: {}", config.osu.api_url);
    println!("   Poll interval: {}s", config.tracking.poll_interval);
    println!("   pp threshold: {}", config.tracking.pp_threshold);
    println!("   Request budget: {}/min", config.osu.requests_per_minute);
    println!(
        "   Stream: {} ({})",
        config.stream.url,
        if config.stream.enabled { "enabled" } else { "disabled" }
    );
    println!("   Notification channels: {}", config.discord.channels.len());
    for channel in &config.discord.channels {
        println!(
            "      - guild {} -> channel {}",
            channel.guild_id, channel.channel_id
        );
    }
    println!();
}
