//! Datagram gateway
//!
//! The protocol core. It takes raw datagrams with their source address and
//! produces outgoing datagrams in the registry's outbox, without touching a
//! socket. The network driver feeds it; tests can drive it directly.
//!
//! Each datagram is appended to its session's receive buffer, which is then
//! consumed frame by frame until empty. A frame that tears the session down
//! stops the loop immediately.

use crate::abuse::{AbusePolicy, Verdict, LAG_KICK_REASON};
use crate::config::ServerConfig;
use crate::dispatch::{self, Route};
use crate::error::SessionError;
use crate::handler::{DefaultHandler, GameHandler, Selection, INVALID_DATA_REASON};
use crate::loss::{self, PacketLoss};
use crate::registry::SessionRegistry;
use crate::sequencer::Classification;
use crate::session::{InGameStage, Session};
use crate::store::{MemoryStore, PlayerStore};
use log::{debug, error, info, trace, warn};
use shared::frame::{self, parse_acks};
use shared::{
    hex, opcode, Frame, FrameHeader, MessageType, PayloadReader, CHARACTER_SELECT_SCENE,
    SCENE_CHANNEL,
};
use std::net::SocketAddr;
use std::time::Instant;

pub const SERVER_CLOSED_REASON: &str = "Server closed by the admin";
pub const PING_TIMEOUT_REASON: &str = "You were disconnected for not answering pings.";

pub struct Gateway<H: GameHandler = DefaultHandler> {
    registry: SessionRegistry,
    handler: H,
    policy: AbusePolicy,
}

impl Gateway<DefaultHandler> {
    /// Gateway with the default handler, an in-memory store and the loss
    /// simulation the config asks for
    pub fn with_config(config: ServerConfig) -> Self {
        let loss = loss::from_percentages(config.inbound_loss, config.outbound_loss);
        Self::new(config, DefaultHandler::new(), Box::new(MemoryStore::new()), loss)
    }
}

impl<H: GameHandler> Gateway<H> {
    pub fn new(
        config: ServerConfig,
        handler: H,
        store: Box<dyn PlayerStore>,
        loss: Box<dyn PacketLoss>,
    ) -> Self {
        let policy = AbusePolicy::new(config.dup_kick_threshold, config.dup_decay);
        Self {
            registry: SessionRegistry::new(config, store, loss),
            handler,
            policy,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SessionRegistry {
        &mut self.registry
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Creates a session for a known login before its first datagram
    pub fn admit(&mut self, addr: SocketAddr, name: &str, now: Instant) -> Result<(), SessionError> {
        if self.registry.contains(&addr) {
            return Ok(());
        }
        self.registry.set_now(now);
        let session = Session::new(addr, name.to_string(), self.registry.config(), now);
        self.registry.insert(session)?;
        info!("Admitted {} from {}", name, addr);
        Ok(())
    }

    /// Consumes one datagram from `addr`
    pub fn handle_datagram(&mut self, addr: SocketAddr, bytes: &[u8], now: Instant) {
        self.registry.set_now(now);
        if !self.registry.contains(&addr) && !self.open_session(addr, bytes, now) {
            return;
        }

        let buffer = match self.registry.session_mut(&addr) {
            Some(session) => {
                session.recv_buffer.extend_from_slice(bytes);
                std::mem::take(&mut session.recv_buffer)
            }
            None => return,
        };

        let mut cursor = 0;
        while cursor < buffer.len() {
            let (frame, consumed) = match Frame::decode(&buffer[cursor..]) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(
                        "Discarding {} trailing bytes from {}: {} ({})",
                        buffer.len() - cursor,
                        addr,
                        e,
                        hex(&buffer[cursor..])
                    );
                    break;
                }
            };
            cursor += consumed;

            if self.registry.drop_inbound() {
                trace!("Dropping inbound frame from {}", addr);
                continue;
            }

            self.process_frame(addr, &frame, now);
            if !self.registry.contains(&addr) {
                return;
            }
        }
    }

    /// Opens a session for an unknown address if its first frame is a SYN
    fn open_session(&mut self, addr: SocketAddr, bytes: &[u8], now: Instant) -> bool {
        let is_syn = FrameHeader::peek(bytes)
            .map(|h| h.message_type() == Some(MessageType::Connect))
            .unwrap_or(false);
        if !is_syn {
            debug!("Ignoring {} bytes from unknown peer {}", bytes.len(), addr);
            return false;
        }

        let session = Session::new(addr, addr.to_string(), self.registry.config(), now);
        match self.registry.insert(session) {
            Ok(()) => true,
            Err(e) => {
                warn!("Refusing {}: {}", addr, e);
                self.registry
                    .send_immediate(addr, frame::encode_disconnect("Server full"));
                false
            }
        }
    }

    fn process_frame(&mut self, addr: SocketAddr, frame: &Frame<'_>, now: Instant) {
        let ty = match frame.message_type() {
            Some(ty) => ty,
            None => {
                warn!("Unknown data received from {} (hex): {}", addr, hex(frame.raw));
                return;
            }
        };

        if let MessageType::ReliableOrdered(channel) = ty {
            if !self.classify_reliable(addr, channel, frame) {
                return;
            }
        }

        match ty {
            MessageType::Ping => self.on_ping(addr, frame, now),
            MessageType::Pong => trace!("Pong from {}", addr),
            MessageType::Connect => self.on_connect(addr, frame),
            MessageType::ConnectResponse => {
                warn!("Unexpected connect response from {}", addr)
            }
            MessageType::ConnectionEstablished => self.on_established(addr),
            MessageType::Acknowledge => {
                if let Some(session) = self.registry.session_mut(&addr) {
                    let matched = session.acks.on_ack(&parse_acks(frame.payload));
                    trace!("{} acked {} sends", addr, matched);
                }
            }
            MessageType::Disconnect => {
                let reason = frame::disconnect_reason(frame.payload);
                info!("{} sent disconnect: {}", addr, reason);
                self.registry.teardown(addr, None);
            }
            MessageType::ReliableOrdered(_) => {
                self.registry.send_ack(addr, frame);
                self.dispatch(addr, frame);
            }
            MessageType::Unreliable => self.dispatch(addr, frame),
        }
    }

    /// Runs the sequencer and abuse policy; returns whether to keep going
    fn classify_reliable(&mut self, addr: SocketAddr, channel: u8, frame: &Frame<'_>) -> bool {
        let policy = self.policy;
        let session = match self.registry.session_mut(&addr) {
            Some(s) => s,
            None => return false,
        };
        let sequence = frame.sequence();
        let last = session.sequencer.last_accepted(channel);

        match session.sequencer.classify(channel, sequence) {
            Classification::Duplicate => {
                if policy.on_duplicate(&mut session.duplicates) == Verdict::Kick {
                    error!("Kicking {}: too many duplicate frames", session.label());
                    self.registry.teardown(addr, Some(LAG_KICK_REASON));
                    return false;
                }
                debug!(
                    "Discarding duplicate (-{}) from {}",
                    last.wrapping_sub(sequence),
                    addr
                );
                self.registry.send_ack(addr, frame);
                false
            }
            Classification::RetransmissionFill => {
                info!(
                    "Processing retransmission (-{}) from {}",
                    last.wrapping_sub(sequence),
                    session.label()
                );
                true
            }
            Classification::GapAccepted { skipped } => {
                info!(
                    "Unordered message (+{}) from {}, {} missing",
                    sequence.wrapping_sub(last),
                    session.label(),
                    skipped
                );
                true
            }
            Classification::InOrder => {
                policy.on_in_order(&mut session.duplicates);
                true
            }
        }
    }

    fn on_ping(&mut self, addr: SocketAddr, frame: &Frame<'_>, now: Instant) {
        let counter = frame.payload.first().copied().unwrap_or(0);
        if let Some(session) = self.registry.session_mut(&addr) {
            session.on_ping(counter, now);
        }
        let timestamp = self.registry.clock().timestamp_at(now);
        self.registry
            .send_immediate(addr, frame::encode_pong(counter, timestamp));
    }

    fn on_connect(&mut self, addr: SocketAddr, frame: &Frame<'_>) {
        let token = frame::connect_token(frame.payload);
        let respond = match self.registry.session_mut(&addr) {
            Some(session) => session.on_connect_syn(),
            None => return,
        };

        if respond {
            debug!("Connecting {}", addr);
            let response =
                frame::encode_connect_response(&token, self.registry.clock().timestamp());
            self.registry.send_coalesced_frame(addr, &response);
        }
    }

    fn on_established(&mut self, addr: SocketAddr) {
        let connected = match self.registry.session(&addr) {
            Some(s) => s.is_connected(),
            None => return,
        };
        if connected {
            error!("Received duplicate connect ACK from {}", addr);
            return;
        }

        let id = self.registry.allocate_entity_id();
        let label = match self.registry.session_mut(&addr) {
            Some(session) => match session.establish(id) {
                Ok(()) => session.label(),
                Err(e) => {
                    error!("Connect ACK from {}: {}", addr, e);
                    return;
                }
            },
            None => return,
        };
        info!("{} connected", label);
        self.registry.persist_login(&addr);

        let set_id = [opcode::SET_ID, id as u8, (id >> 8) as u8];
        let result = self
            .registry
            .send(addr, MessageType::ordered(SCENE_CHANNEL), &set_id)
            .and_then(|_| {
                self.registry
                    .send_load_scene_frame(addr, CHARACTER_SELECT_SCENE)
            });
        if let Err(e) = result {
            warn!("Failed to start game for {}: {}", addr, e);
        }
    }

    fn dispatch(&mut self, addr: SocketAddr, frame: &Frame<'_>) {
        let route = match dispatch::route(frame) {
            Some(route) => route,
            None => {
                warn!(
                    "Unknown message from {} (hex): {}",
                    addr,
                    hex(frame.raw)
                );
                return;
            }
        };

        let connected = self
            .registry
            .session(&addr)
            .map(|s| s.is_connected())
            .unwrap_or(false);
        if !connected {
            warn!("Dropping {} from {}: {}", route.name(), addr, SessionError::NotConnected);
            return;
        }

        match route {
            Route::EntitiesList => self.entities_list(addr),
            Route::GameInfo { netview_id } => self.game_info(addr, netview_id),
            Route::EditCharacter { index, data } => self.edit_character(addr, index, data),
            Route::Vortex { id } => self.vortex(addr, id),
            other => self.handler.on_route(&mut self.registry, addr, other),
        }
    }

    /// "Prefab list ready"
    fn entities_list(&mut self, addr: SocketAddr) {
        let (stage, label) = match self.registry.session(&addr) {
            Some(s) => (s.stage, s.label()),
            None => return,
        };

        match stage {
            InGameStage::CharacterSelect => {
                debug!("Sending character list to {}", label);
                self.handler.character_list(&mut self.registry, addr);
                return;
            }
            InGameStage::Loading => info!("Sending entities list to {}", label),
            _ => info!("Entities list already sent to {}, resending anyway", label),
        }

        match self.registry.instantiate_scene_to(addr) {
            Ok(count) => {
                debug!("Instantiated {} entities to {}", count, label);
                self.handler.entities_sent(&mut self.registry, addr);
            }
            Err(e) => warn!("Failed to send entities to {}: {}", label, e),
        }
    }

    /// "Game info ready" for entity `netview_id`
    fn game_info(&mut self, addr: SocketAddr, netview_id: u16) {
        let (own_id, stage, label) = match self.registry.session(&addr) {
            Some(s) => {
                if let Err(e) = s.require_stage(InGameStage::EntitiesSent) {
                    info!("Game info requested too soon by {}: {}", s.label(), e);
                    return;
                }
                (s.netview_id, s.stage, s.label())
            }
            None => return,
        };

        if netview_id == own_id {
            if stage == InGameStage::GameInfoSent {
                info!("Game info already sent to {}, resending anyway", label);
            }
            self.handler.send_own_game_info(&mut self.registry, addr);
            if let Some(session) = self.registry.session_mut(&addr) {
                session.stage = InGameStage::GameInfoSent;
            }
        } else if let Some(other) = self.registry.find_by_netview(netview_id) {
            self.handler
                .send_other_game_info(&mut self.registry, addr, other);
        } else {
            error!(
                "Error sending game info to {}: {}",
                label,
                SessionError::UnknownEntity(netview_id)
            );
        }
    }

    fn edit_character(&mut self, addr: SocketAddr, index: u32, data: &[u8]) {
        let (stage, scene, label) = match self.registry.session(&addr) {
            Some(s) => (s.stage, s.scene.clone(), s.label()),
            None => return,
        };

        if stage != InGameStage::CharacterSelect {
            // Usually a double click on "play"; reloading hides the client's
            // stuck save dialog
            info!("Rejecting game start request from {}: already in game", label);
            let scene = scene.unwrap_or_else(|| CHARACTER_SELECT_SCENE.to_string());
            if let Err(e) = self.registry.send_load_scene_frame(addr, &scene) {
                warn!("Failed to resend scene to {}: {}", label, e);
            }
            if let Some(session) = self.registry.session_mut(&addr) {
                session.stage = InGameStage::Loading;
            }
            return;
        }

        let name = match PayloadReader::new(data).read_string() {
            Ok(name) => name,
            Err(e) => {
                warn!("Unreadable character data from {}: {}", label, e);
                self.registry.teardown(addr, Some(INVALID_DATA_REASON));
                return;
            }
        };

        match self
            .handler
            .select_character(&mut self.registry, addr, index, &name, data)
        {
            Selection::Load {
                scene,
                position,
                rotation,
            } => {
                if let Err(e) = self.registry.load_scene(addr, &scene, position, rotation) {
                    warn!("Failed to load {} for {}: {}", scene, label, e);
                    return;
                }
                self.handler.character_loaded(&mut self.registry, addr);
            }
            Selection::Kick(reason) => {
                warn!("Kicking {}: {}", label, reason);
                self.registry.teardown(addr, Some(reason.as_str()));
            }
        }
    }

    fn vortex(&mut self, addr: SocketAddr, id: u8) {
        let scene = match self.registry.session(&addr) {
            Some(s) if s.stage >= InGameStage::EntitiesSent => s.scene.clone(),
            Some(s) => {
                debug!("Ignoring vortex from {} while loading", s.label());
                return;
            }
            None => return,
        };
        let scene = scene.unwrap_or_default();

        match self.handler.resolve_vortex(&scene, id) {
            Some(target) => {
                if let Err(e) =
                    self.registry
                        .load_scene(addr, &target.scene, target.position, target.rotation)
                {
                    warn!("Failed to follow vortex for {}: {}", addr, e);
                }
            }
            None => error!("Can't find vortex {} on map {}", id, scene),
        }
    }

    /// Flushes coalesced buffers whose deadline passed
    pub fn poll_flush(&mut self, now: Instant) {
        self.registry.set_now(now);
        self.registry.flush_due(now);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.registry.next_flush_deadline()
    }

    pub fn drain_outbox(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.registry.drain_outbox()
    }

    /// Tears down every session that stopped pinging; returns how many
    pub fn check_ping_timeouts(&mut self, now: Instant) -> usize {
        self.registry.set_now(now);
        let timeout = self.registry.config().ping_timeout;
        let expired: Vec<SocketAddr> = self
            .registry
            .addrs()
            .into_iter()
            .filter(|addr| {
                self.registry
                    .session(addr)
                    .map(|s| s.ping_expired(now, timeout))
                    .unwrap_or(false)
            })
            .collect();

        for addr in &expired {
            info!("Ping timeout for {}", addr);
            self.registry.teardown(*addr, Some(PING_TIMEOUT_REASON));
        }
        expired.len()
    }

    /// Disconnects everyone and saves their records
    pub fn shutdown(&mut self) {
        let addrs = self.registry.addrs();
        info!("Disconnecting {} sessions", addrs.len());
        for addr in addrs {
            self.registry.teardown(addr, Some(SERVER_CLOSED_REASON));
        }
    }
}
