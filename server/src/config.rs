//! Runtime configuration of the game server
//!
//! Built from the command line in `main.rs`. Every switch the transport
//! consults at runtime lives here so tests can construct a server with
//! tightened timings without touching global state.

use shared::{DEFAULT_GAME_PORT, MAX_DATAGRAM_LEN};
use std::path::PathBuf;
use std::time::Duration;

/// How the duplicate counter recovers when an in-order frame arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DupDecay {
    /// Any in-order frame clears the counter
    Reset,
    /// Each in-order frame takes one off the counter
    Decrement,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Sessions that have not pinged for this long are dropped
    pub ping_timeout: Duration,
    pub ping_check_interval: Duration,
    /// Delay between the last coalesced send and the flush
    pub flush_delay: Duration,
    pub coalesce_limit: usize,
    pub dup_kick_threshold: u32,
    pub dup_decay: DupDecay,
    pub max_connected: usize,
    /// Where player records are written; `None` keeps them in memory
    pub data_dir: Option<PathBuf>,
    /// Percentage of inbound frames dropped on purpose
    pub inbound_loss: u8,
    /// Percentage of outbound datagrams dropped on purpose
    pub outbound_loss: u8,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn fault_injection_enabled(&self) -> bool {
        self.inbound_loss > 0 || self.outbound_loss > 0
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_GAME_PORT,
            ping_timeout: Duration::from_secs(30),
            ping_check_interval: Duration::from_secs(5),
            flush_delay: Duration::from_millis(15),
            coalesce_limit: MAX_DATAGRAM_LEN,
            dup_kick_threshold: 100,
            dup_decay: DupDecay::Reset,
            max_connected: 128,
            data_dir: None,
            inbound_loss: 0,
            outbound_loss: 0,
        }
    }
}
