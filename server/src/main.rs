use clap::Parser;
use log::info;
use server::config::{DupDecay, ServerConfig};
use server::network::Server;
use std::path::PathBuf;
use std::time::Duration;

/// Parses command-line arguments, binds the game port and runs until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "0.0.0.0")]
        host: String,
        /// Game port to listen on
        #[clap(short, long, default_value_t = shared::DEFAULT_GAME_PORT)]
        port: u16,
        /// Seconds without a ping before a session is dropped
        #[clap(long, default_value = "30")]
        ping_timeout: u64,
        /// Seconds between ping-timeout checks
        #[clap(long, default_value = "5")]
        ping_check: u64,
        /// Milliseconds reliable sends wait to be coalesced
        #[clap(long, default_value = "15")]
        flush_delay: u64,
        /// Duplicate frames tolerated before a kick
        #[clap(long, default_value = "100")]
        dup_threshold: u32,
        /// How the duplicate counter recovers on in-order frames
        #[clap(long, value_enum, default_value = "reset")]
        dup_decay: DupDecay,
        /// Maximum number of sessions
        #[clap(short, long, default_value = "128")]
        max_connected: usize,
        /// Directory for player records; kept in memory when absent
        #[clap(short, long)]
        data_dir: Option<PathBuf>,
        /// Percentage of inbound frames to drop, for testing
        #[clap(long, default_value = "0")]
        inbound_loss: u8,
        /// Percentage of outbound datagrams to drop, for testing
        #[clap(long, default_value = "0")]
        outbound_loss: u8,
    }

    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        ping_timeout: Duration::from_secs(args.ping_timeout),
        ping_check_interval: Duration::from_secs(args.ping_check.max(1)),
        flush_delay: Duration::from_millis(args.flush_delay),
        dup_kick_threshold: args.dup_threshold,
        dup_decay: args.dup_decay,
        max_connected: args.max_connected,
        data_dir: args.data_dir,
        inbound_loss: args.inbound_loss,
        outbound_loss: args.outbound_loss,
        ..ServerConfig::default()
    };

    let mut server = Server::new(config).await?;
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
            shutdown.shutdown();
        }
    });

    server.run().await?;

    Ok(())
}
