//! # Game Server Library
//!
//! This library implements the server side of a reliable-messaging protocol
//! carried over UDP. It turns one unordered datagram socket into per-peer
//! ordered channels with acknowledgements, duplicate suppression, abuse
//! protection and coalesced sends, and drives a small session lifecycle on top
//! of them.
//!
//! ## Core Responsibilities
//!
//! ### Ordered Delivery
//! Every reliable frame carries a sequence number that advances by 2 per
//! channel. The sequencer accepts in-order frames, remembers the sequences a
//! jump skipped and accepts them later when the client retransmits. Anything
//! else is a duplicate: it is acknowledged again but never delivered twice.
//!
//! ### Session Lifecycle
//! A session starts with a connect SYN, becomes established on the client's
//! connection-established message and then walks through the in-game stages
//! (character select, loading, entities sent, game info sent). Requests that
//! arrive too early for the current stage are rejected or repaired.
//!
//! ### Outgoing Traffic
//! Frames that must keep their order are appended to a per-session buffer
//! flushed after a short delay or once it would exceed 1024 bytes. Stateless
//! control frames (acks, pings, pongs, disconnects) are sent right away.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Event Loop
//! All protocol state is owned by one [`gateway::Gateway`], driven by a
//! single task. The gateway never touches the socket: it consumes datagrams
//! and leaves outgoing datagrams in an outbox that [`network::Server`]
//! writes out. This keeps the protocol core testable without sockets.
//!
//! ### Gameplay Seam
//! Gameplay lives behind the [`handler::GameHandler`] trait. The handler is
//! handed the [`registry::SessionRegistry`] to send replies, move players
//! between scenes or disconnect them.
//!
//! ## Module Organization
//!
//! - `sequencer`: inbound classification and outbound counters
//! - `ack`: outstanding reliable sends awaiting acknowledgement
//! - `coalescer`: per-session outgoing buffer with flush deadline
//! - `abuse`: duplicate-flood kick policy
//! - `session`: per-peer state and handshake transitions
//! - `registry`: owned session table, scenes and outbox
//! - `dispatch`: opcode recognition for application frames
//! - `handler`: gameplay collaborator trait and default implementation
//! - `gateway`: datagram consumption and control-frame handling
//! - `network`: tokio UDP driver
//! - `store`: player persistence
//! - `loss`: fault injection for resilience testing
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let config = ServerConfig {
//!         host: "0.0.0.0".to_string(),
//!         ..ServerConfig::default()
//!     };
//!
//!     let mut server = Server::new(config).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod abuse;
pub mod ack;
pub mod coalescer;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod loss;
pub mod network;
pub mod registry;
pub mod scene;
pub mod sequencer;
pub mod session;
pub mod store;

pub use error::SessionError;
