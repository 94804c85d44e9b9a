//! # Protocol Client Library
//!
//! A headless client for the game server's UDP protocol. It exists to drive a
//! server from tests and from the command line without the real game client.
//!
//! ## What the bot does
//!
//! ### Handshake
//! Sends a connect SYN with a random 13-byte token, waits for the connect
//! response echoing that token and answers with connection-established.
//!
//! ### Being a good peer
//! Every ordered frame received is acknowledged with its halved sequence, and
//! pings are answered with a pong carrying the bot's own timestamp. Servers
//! that kick silent or lagging peers therefore keep the bot connected.
//!
//! ### Sending
//! Ordered-reliable requests get a per-channel sequence that advances by 2.
//! Explicit sequences can be sent as well, which is how tests provoke
//! duplicates and retransmissions.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::BotClient;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let mut bot = BotClient::new("127.0.0.1:1034").await?;
//!     bot.connect(Duration::from_secs(2)).await?;
//!
//!     // "Prefab list ready" on the scene channel
//!     bot.send_reliable(6, &[6]).await?;
//!     for frame in bot.collect_for(Duration::from_millis(500)).await {
//!         println!("{:?}", frame);
//!     }
//!
//!     bot.disconnect("bye").await?;
//!     Ok(())
//! }
//! ```

pub mod network;
