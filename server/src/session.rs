//! Server-side state for one peer
//!
//! A session is keyed by the peer's socket address. It tracks two state
//! machines: the connection handshake ([`ConnectionState`]) and, once
//! connected, the peer's progress into the game world ([`InGameStage`]).
//! It also owns the per-peer transport state: sequence counters, the missing
//! set, the ack ledger, the coalescing buffer and the raw receive buffer.

use crate::ack::AckLedger;
use crate::coalescer::SendCoalescer;
use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::sequencer::{ChannelSequencer, OutboundSequences};
use shared::frame;
use shared::{FrameError, MessageType, Quaternion, Vector3};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    SynReceived,
    Established,
}

/// Progress of a connected peer into the world
///
/// Ordered, so gates can be written as `stage >= InGameStage::EntitiesSent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InGameStage {
    /// Choosing or editing a character
    CharacterSelect = 0,
    /// A scene load was sent and the client is loading it
    Loading = 1,
    /// Scene members were instantiated to the client
    EntitiesSent = 2,
    /// The client received its own game data and is playing
    GameInfoSent = 3,
}

/// The character a session is playing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Character {
    pub name: String,
    /// Opaque appearance blob, sent as-is to other clients
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct Session {
    /// Network address, also the registry key
    pub addr: SocketAddr,
    /// Account name used as the persistence key
    pub name: String,
    pub state: ConnectionState,
    pub stage: InGameStage,
    pub outbound: OutboundSequences,
    pub sequencer: ChannelSequencer,
    pub acks: AckLedger,
    pub coalescer: SendCoalescer,
    /// Duplicates received since the counter last decayed
    pub duplicates: u32,
    /// Raw bytes received and not yet consumed
    pub recv_buffer: Vec<u8>,
    pub last_ping: Instant,
    pub ping_count: u8,
    /// Entity id, also used as the netview id; zero until connected
    pub netview_id: u16,
    /// Scene the session is a member of
    pub scene: Option<String>,
    pub position: Vector3,
    pub rotation: Quaternion,
    /// Last animation frame accepted from this peer, replayed to late joiners
    pub last_animation: Vec<u8>,
    pub character: Option<Character>,
}

impl Session {
    pub fn new(addr: SocketAddr, name: String, config: &ServerConfig, now: Instant) -> Self {
        Self {
            addr,
            name,
            state: ConnectionState::Unconnected,
            stage: InGameStage::CharacterSelect,
            outbound: OutboundSequences::new(),
            sequencer: ChannelSequencer::new(),
            acks: AckLedger::new(),
            coalescer: SendCoalescer::new(config.coalesce_limit, config.flush_delay),
            duplicates: 0,
            recv_buffer: Vec::new(),
            last_ping: now,
            ping_count: 0,
            netview_id: 0,
            scene: None,
            position: Vector3::default(),
            rotation: Quaternion::default(),
            last_animation: Vec::new(),
            character: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Established
    }

    /// Handles a connect SYN
    ///
    /// Outbound counters always restart from zero. Returns whether a connect
    /// response should be sent, which is only the case before the session is
    /// established.
    pub fn on_connect_syn(&mut self) -> bool {
        self.outbound.reset();
        if self.is_connected() {
            return false;
        }

        self.state = ConnectionState::SynReceived;
        self.acks.expect_handshake();
        true
    }

    /// Handles connection-established; a repeat is an error and changes nothing
    pub fn establish(&mut self, netview_id: u16) -> Result<(), SessionError> {
        if self.is_connected() {
            return Err(SessionError::AlreadyConnected);
        }

        self.state = ConnectionState::Established;
        self.outbound.reset();
        self.acks.complete_handshake();
        self.netview_id = netview_id;
        Ok(())
    }

    /// Fails unless the session reached at least `required`
    pub fn require_stage(&self, required: InGameStage) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        if self.stage < required {
            return Err(SessionError::PrematureRequest {
                stage: self.stage,
                required,
            });
        }
        Ok(())
    }

    /// Frames `payload` with the next outbound sequence for `ty`
    ///
    /// Ordered frames are recorded in the ack ledger.
    pub fn frame(
        &mut self,
        ty: MessageType,
        payload: &[u8],
        now: Instant,
    ) -> Result<Vec<u8>, FrameError> {
        let sequence = self.outbound.peek(ty);
        let bytes = frame::encode(ty, sequence, payload)?;
        self.outbound.next(ty);

        if ty.is_reliable_ordered() {
            self.acks.record_send(ty.to_byte(), sequence, now);
        }
        Ok(bytes)
    }

    pub fn on_ping(&mut self, counter: u8, now: Instant) {
        self.ping_count = counter;
        self.last_ping = now;
    }

    pub fn ping_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_ping) > timeout
    }

    /// Label used in log lines
    pub fn label(&self) -> String {
        format!("{} ({}/{})", self.netview_id, self.name, self.addr)
    }
}
