use clap::Parser;
use client::network::BotClient;
use log::info;
use shared::{hex, opcode, SCENE_CHANNEL};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:1034")]
    server: String,

    /// Seconds to stay connected
    #[arg(short = 'd', long, default_value = "10")]
    duration: u64,

    /// Milliseconds between pings
    #[arg(short = 'p', long, default_value = "1000")]
    ping_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting bot...");
    let mut bot = BotClient::new(&args.server).await?;
    bot.connect(Duration::from_secs(5)).await?;

    // Ask for the character list like the game does after the first scene load
    bot.send_reliable(SCENE_CHANNEL, &[opcode::ENTITIES_LIST]).await?;

    let rounds = (args.duration * 1000 / args.ping_interval.max(1)).max(1);
    for _ in 0..rounds {
        bot.ping().await?;
        for frame in bot.collect_for(Duration::from_millis(args.ping_interval)).await {
            info!(
                "0x{:02x} seq {}: {}",
                frame.type_byte,
                frame.sequence,
                hex(&frame.payload)
            );
        }
        if !bot.is_connected() {
            return Ok(());
        }
    }

    bot.disconnect("Bot finished").await?;
    info!("Disconnected");
    Ok(())
}
