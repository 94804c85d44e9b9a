//! Owned registry of live sessions
//!
//! The registry is the handle gameplay code receives to act on the transport:
//! it frames and queues sends, moves sessions between scenes and tears
//! sessions down. Outgoing datagrams collect in an outbox that the network
//! loop drains after every event, so nothing in here touches a socket.

use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::loss::PacketLoss;
use crate::scene::SceneDirectory;
use crate::session::{InGameStage, Session};
use crate::store::{unix_now, PlayerStore};
use log::{debug, info, trace, warn};
use shared::frame::{self, AckEntry};
use shared::{
    opcode, Frame, MessageType, PayloadWriter, ProtocolClock, Quaternion, Vector3, PLAYER_PREFAB,
    SCENE_CHANNEL,
};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

pub struct SessionRegistry {
    config: ServerConfig,
    sessions: HashMap<SocketAddr, Session>,
    scenes: SceneDirectory,
    outbox: VecDeque<(SocketAddr, Vec<u8>)>,
    store: Box<dyn PlayerStore>,
    loss: Box<dyn PacketLoss>,
    clock: ProtocolClock,
    now: Instant,
    next_entity_id: u16,
}

impl SessionRegistry {
    pub fn new(
        config: ServerConfig,
        store: Box<dyn PlayerStore>,
        loss: Box<dyn PacketLoss>,
    ) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
            scenes: SceneDirectory::new(),
            outbox: VecDeque::new(),
            store,
            loss,
            clock: ProtocolClock::new(),
            now: Instant::now(),
            next_entity_id: 1,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn clock(&self) -> &ProtocolClock {
        &self.clock
    }

    /// Time of the event being processed; sends and coalescer deadlines use it
    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn set_now(&mut self, now: Instant) {
        self.now = now;
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.sessions.contains_key(addr)
    }

    pub fn session(&self, addr: &SocketAddr) -> Option<&Session> {
        self.sessions.get(addr)
    }

    pub fn session_mut(&mut self, addr: &SocketAddr) -> Option<&mut Session> {
        self.sessions.get_mut(addr)
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.sessions.keys().copied().collect()
    }

    pub fn find_by_netview(&self, netview_id: u16) -> Option<SocketAddr> {
        self.sessions
            .values()
            .find(|s| s.is_connected() && s.netview_id == netview_id)
            .map(|s| s.addr)
    }

    pub fn scene_members(&self, scene: &str) -> Vec<SocketAddr> {
        self.scenes.members(scene).to_vec()
    }

    pub fn store(&self) -> &dyn PlayerStore {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> &mut dyn PlayerStore {
        self.store.as_mut()
    }

    /// Registers a new session, enforcing the connected-session limit
    pub fn insert(&mut self, session: Session) -> Result<(), SessionError> {
        if self.sessions.len() >= self.config.max_connected {
            return Err(SessionError::ServerFull);
        }
        debug!("New session for {}", session.addr);
        self.sessions.insert(session.addr, session);
        Ok(())
    }

    /// Hands out the next entity id not held by a connected session
    pub fn allocate_entity_id(&mut self) -> u16 {
        let mut id = self.next_entity_id;
        for _ in 0..u16::MAX {
            id = self.next_entity_id;
            self.next_entity_id = self.next_entity_id.checked_add(1).unwrap_or(1);
            if self.find_by_netview(id).is_none() {
                break;
            }
        }
        id
    }

    /// Frames and queues `payload` for `addr`
    ///
    /// Frames that must keep their order go through the session's coalescer,
    /// everything else is queued as its own datagram.
    pub fn send(
        &mut self,
        addr: SocketAddr,
        ty: MessageType,
        payload: &[u8],
    ) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(&addr)
            .ok_or(SessionError::UnknownPeer(addr))?;
        let now = self.now;
        let bytes = session.frame(ty, payload, now)?;

        if ty.is_coalesced() {
            if let Some(datagram) = session.coalescer.push(&bytes, now) {
                trace!("Coalescing limit reached for {}, flushing early", addr);
                self.emit(addr, datagram);
            }
        } else {
            self.emit(addr, bytes);
        }
        Ok(())
    }

    /// Queues an already framed, unsequenced frame through the coalescer
    pub fn send_coalesced_frame(&mut self, addr: SocketAddr, bytes: &[u8]) {
        let flushed = match self.sessions.get_mut(&addr) {
            Some(session) => session.coalescer.push(bytes, self.now),
            None => return,
        };
        if let Some(datagram) = flushed {
            self.emit(addr, datagram);
        }
    }

    /// Queues a control frame as its own datagram
    pub fn send_immediate(&mut self, addr: SocketAddr, bytes: Vec<u8>) {
        self.emit(addr, bytes);
    }

    /// Acknowledges a received ordered frame right away
    pub fn send_ack(&mut self, addr: SocketAddr, received: &Frame<'_>) {
        let entry = AckEntry::for_sequence(received.header.type_byte, received.sequence());
        trace!(
            "Acking {} seq {} from {}",
            received.header.type_byte,
            received.sequence(),
            addr
        );
        self.emit(addr, frame::encode_ack(&[entry]));
    }

    fn emit(&mut self, addr: SocketAddr, datagram: Vec<u8>) {
        if self.loss.drop_outbound() {
            trace!("Dropping {} outbound bytes to {}", datagram.len(), addr);
            return;
        }
        self.outbox.push_back((addr, datagram));
    }

    pub(crate) fn drop_inbound(&mut self) -> bool {
        self.loss.drop_inbound()
    }

    /// Moves every coalesced buffer whose deadline passed into the outbox
    pub fn flush_due(&mut self, now: Instant) {
        let due: Vec<(SocketAddr, Vec<u8>)> = self
            .sessions
            .iter_mut()
            .filter_map(|(addr, s)| s.coalescer.poll(now).map(|d| (*addr, d)))
            .collect();

        for (addr, datagram) in due {
            trace!("Flushing {} bytes to {}", datagram.len(), addr);
            self.emit(addr, datagram);
        }
    }

    /// Flushes every coalesced buffer regardless of deadlines
    pub fn flush_all(&mut self) {
        let pending: Vec<(SocketAddr, Vec<u8>)> = self
            .sessions
            .iter_mut()
            .filter_map(|(addr, s)| s.coalescer.take().map(|d| (*addr, d)))
            .collect();

        for (addr, datagram) in pending {
            self.emit(addr, datagram);
        }
    }

    pub fn next_flush_deadline(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter_map(|s| s.coalescer.deadline())
            .min()
    }

    pub fn drain_outbox(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.outbox.drain(..).collect()
    }

    pub fn pending_datagrams(&self) -> usize {
        self.outbox.len()
    }

    /// Sends the scene-load frame on the scene channel
    pub fn send_load_scene_frame(&mut self, addr: SocketAddr, scene: &str) -> Result<(), SessionError> {
        let mut payload = PayloadWriter::with_opcode(opcode::LOAD_SCENE);
        payload.put_string(&scene.to_lowercase());
        self.send(addr, MessageType::ordered(SCENE_CHANNEL), &payload.into_bytes())
    }

    /// Moves `addr` into `scene` at the given transform
    ///
    /// The session drops back to [`InGameStage::Loading`]. Members of the old
    /// scene are told to remove its entity, members of the new scene that are
    /// already in game are told to instantiate it, and the client is told to
    /// load the scene.
    pub fn load_scene(
        &mut self,
        addr: SocketAddr,
        scene: &str,
        position: Vector3,
        rotation: Quaternion,
    ) -> Result<(), SessionError> {
        let scene = scene.to_lowercase();
        let (old_scene, netview_id) = {
            let session = self
                .sessions
                .get_mut(&addr)
                .ok_or(SessionError::UnknownPeer(addr))?;
            session.stage = InGameStage::Loading;
            session.position = position;
            session.rotation = rotation;
            session.last_animation.clear();
            (session.scene.replace(scene.clone()), session.netview_id)
        };

        info!(
            "Loading scene \"{}\" for {} at {} {} {}",
            scene, netview_id, position.x, position.y, position.z
        );

        if let Some(old) = old_scene {
            let remaining = self.scenes.leave(&old, addr);
            self.send_netview_remove(&remaining, netview_id);
        }

        let instantiate = self.instantiate_payload(&addr)?;
        for member in self.scenes.members(&scene).to_vec() {
            if self.stage_of(&member) >= Some(InGameStage::EntitiesSent) {
                self.send_or_warn(member, MessageType::ordered(SCENE_CHANNEL), &instantiate);
            }
        }
        self.scenes.join(&scene, addr);

        self.send_load_scene_frame(addr, &scene)
    }

    /// Instantiates every member of the session's scene to it, then marks the
    /// session as having its entities
    pub fn instantiate_scene_to(&mut self, addr: SocketAddr) -> Result<usize, SessionError> {
        let scene = self
            .session(&addr)
            .ok_or(SessionError::UnknownPeer(addr))?
            .scene
            .clone();

        let members = scene
            .map(|scene| self.scene_members(&scene))
            .unwrap_or_default();
        for member in &members {
            let payload = self.instantiate_payload(member)?;
            self.send(addr, MessageType::ordered(SCENE_CHANNEL), &payload)?;
        }

        if let Some(session) = self.session_mut(&addr) {
            session.stage = InGameStage::EntitiesSent;
        }
        Ok(members.len())
    }

    /// Instantiate frame describing the entity of `of`
    pub fn instantiate_payload(&self, of: &SocketAddr) -> Result<Vec<u8>, SessionError> {
        let session = self.session(of).ok_or(SessionError::UnknownPeer(*of))?;
        let mut payload = PayloadWriter::with_opcode(opcode::INSTANTIATE);
        payload
            .put_string(PLAYER_PREFAB)
            .put_u16(session.netview_id)
            .put_u16(session.netview_id)
            .put_vector(session.position)
            .put_quaternion(session.rotation);
        Ok(payload.into_bytes())
    }

    /// Sends `payload` to every member of `scene` at or past `min_stage`
    ///
    /// Returns how many peers it went to.
    pub fn broadcast_scene(
        &mut self,
        scene: &str,
        except: Option<SocketAddr>,
        min_stage: InGameStage,
        ty: MessageType,
        payload: &[u8],
    ) -> usize {
        let mut sent = 0;
        for member in self.scene_members(scene) {
            if Some(member) == except || self.stage_of(&member) < Some(min_stage) {
                continue;
            }
            self.send_or_warn(member, ty, payload);
            sent += 1;
        }
        sent
    }

    fn stage_of(&self, addr: &SocketAddr) -> Option<InGameStage> {
        self.session(addr).map(|s| s.stage)
    }

    fn send_or_warn(&mut self, addr: SocketAddr, ty: MessageType, payload: &[u8]) {
        if let Err(e) = self.send(addr, ty, payload) {
            warn!("Failed to queue {} for {}: {}", ty, addr, e);
        }
    }

    fn send_netview_remove(&mut self, members: &[SocketAddr], netview_id: u16) {
        let mut payload = PayloadWriter::with_opcode(opcode::NETVIEW_REMOVE);
        payload.put_u16(netview_id);
        let payload = payload.into_bytes();

        for member in members {
            debug!("Removing netview {} from {}", netview_id, member);
            self.send_or_warn(*member, MessageType::ordered(SCENE_CHANNEL), &payload);
        }
    }

    /// Stamps the login time and entity id into the player's record
    pub fn persist_login(&mut self, addr: &SocketAddr) {
        let (name, entity_id) = match self.session(addr) {
            Some(s) => (s.name.clone(), s.netview_id),
            None => return,
        };

        let result = self.store.load_or_default(&name).and_then(|mut record| {
            record.last_seen = unix_now();
            record.entity_id = entity_id;
            self.store.save(&record)
        });
        if let Err(e) = result {
            warn!("Failed to save login of {}: {}", name, e);
        }
    }

    fn persist_logout(&mut self, session: &Session) {
        let result = self.store.load_or_default(&session.name).and_then(|mut record| {
            record.last_seen = unix_now();
            record.last_scene = session.scene.clone();
            record.entity_id = session.netview_id;

            if let (Some(character), Some(scene)) = (&session.character, &session.scene) {
                if let Some(saved) = record
                    .characters
                    .iter_mut()
                    .find(|c| c.name == character.name)
                {
                    saved.scene = scene.clone();
                    saved.position = [session.position.x, session.position.y, session.position.z];
                }
            }
            self.store.save(&record)
        });
        if let Err(e) = result {
            warn!("Failed to save {}: {}", session.name, e);
        }
    }

    /// Destroys the session of `addr`
    ///
    /// With a reason, the peer is sent a disconnect frame first. Pending
    /// coalesced frames are discarded, the other members of its scene are
    /// told to remove its entity and the player record is saved. Returns the
    /// removed session.
    pub fn teardown(&mut self, addr: SocketAddr, reason: Option<&str>) -> Option<Session> {
        let mut session = self.sessions.remove(&addr)?;

        if let Some(reason) = reason {
            self.emit(addr, frame::encode_disconnect(reason));
        }
        session.coalescer.clear();

        if let Some(scene) = &session.scene {
            let remaining = self.scenes.leave(scene, addr);
            self.send_netview_remove(&remaining, session.netview_id);
        }

        self.persist_logout(&session);
        info!("{} disconnected", session.label());
        Some(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::NoLoss;
    use crate::store::MemoryStore;
    use shared::{PayloadReader, HEADER_LEN};
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(
            ServerConfig::default(),
            Box::new(MemoryStore::new()),
            Box::new(NoLoss),
        )
    }

    fn connect(reg: &mut SessionRegistry, port: u16) -> SocketAddr {
        let a = addr(port);
        let mut session = Session::new(a, format!("p{}", port), reg.config(), Instant::now());
        session.on_connect_syn();
        let id = reg.allocate_entity_id();
        session.establish(id).unwrap();
        reg.insert(session).unwrap();
        a
    }

    /// Splits every queued datagram for `to` into frames
    fn frames_to(reg: &mut SessionRegistry, to: SocketAddr) -> Vec<Vec<u8>> {
        reg.flush_all();
        let mut frames = Vec::new();
        for (dest, datagram) in reg.drain_outbox() {
            if dest != to {
                continue;
            }
            let mut cursor = 0;
            while cursor < datagram.len() {
                let (f, consumed) = Frame::decode(&datagram[cursor..]).unwrap();
                frames.push(f.raw.to_vec());
                cursor += consumed;
            }
        }
        frames
    }

    #[test]
    fn test_entity_ids_are_unique() {
        let mut reg = registry();
        let a = connect(&mut reg, 1);
        let b = connect(&mut reg, 2);
        assert_ne!(
            reg.session(&a).unwrap().netview_id,
            reg.session(&b).unwrap().netview_id
        );
        assert_eq!(reg.find_by_netview(reg.session(&b).unwrap().netview_id), Some(b));
    }

    #[test]
    fn test_max_connected() {
        let mut reg = SessionRegistry::new(
            ServerConfig {
                max_connected: 1,
                ..ServerConfig::default()
            },
            Box::new(MemoryStore::new()),
            Box::new(NoLoss),
        );
        connect(&mut reg, 1);
        let extra = Session::new(addr(2), "x".into(), reg.config(), Instant::now());
        assert_eq!(reg.insert(extra), Err(SessionError::ServerFull));
    }

    #[test]
    fn test_reliable_sends_are_coalesced() {
        let mut reg = registry();
        let a = connect(&mut reg, 1);

        reg.send(a, MessageType::ordered(6), &[4, 1, 0]).unwrap();
        reg.send(a, MessageType::ordered(6), &[5]).unwrap();
        assert_eq!(reg.pending_datagrams(), 0);
        assert!(reg.next_flush_deadline().is_some());

        reg.flush_due(Instant::now() + reg.config().flush_delay * 2);
        let out = reg.drain_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1.len(), 2 * HEADER_LEN + 4);
    }

    #[test]
    fn test_control_frames_bypass_coalescer() {
        let mut reg = registry();
        let a = connect(&mut reg, 1);
        reg.send(a, MessageType::Unreliable, &[1, 2]).unwrap();
        reg.send_immediate(a, frame::encode_ping(1));
        assert_eq!(reg.pending_datagrams(), 2);
    }

    #[test]
    fn test_send_to_unknown_peer() {
        let mut reg = registry();
        assert_eq!(
            reg.send(addr(9), MessageType::ordered(1), &[1]),
            Err(SessionError::UnknownPeer(addr(9)))
        );
    }

    #[test]
    fn test_load_scene_notifies_members() {
        let mut reg = registry();
        let a = connect(&mut reg, 1);
        let b = connect(&mut reg, 2);

        reg.load_scene(b, "ponyville", Vector3::default(), Quaternion::default())
            .unwrap();
        reg.session_mut(&b).unwrap().stage = InGameStage::GameInfoSent;
        frames_to(&mut reg, b);

        reg.load_scene(a, "ponyville", Vector3::default(), Quaternion::default())
            .unwrap();
        assert_eq!(reg.session(&a).unwrap().stage, InGameStage::Loading);

        let to_b = frames_to(&mut reg, b);
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0][0], 0x48);
        assert_eq!(to_b[0][HEADER_LEN], opcode::INSTANTIATE);

        // a moves away, b is told to remove a's entity
        reg.load_scene(a, "canterlot", Vector3::default(), Quaternion::default())
            .unwrap();
        let to_b = frames_to(&mut reg, b);
        let a_id = reg.session(&a).unwrap().netview_id;
        assert_eq!(
            &to_b[0][HEADER_LEN..],
            &[opcode::NETVIEW_REMOVE, a_id as u8, (a_id >> 8) as u8]
        );
        assert_eq!(reg.scene_members("ponyville"), vec![b]);
    }

    #[test]
    fn test_load_scene_frame_layout() {
        let mut reg = registry();
        let a = connect(&mut reg, 1);
        reg.load_scene(a, "PonyVille", Vector3::default(), Quaternion::default())
            .unwrap();

        let frames = frames_to(&mut reg, a);
        let last = frames.last().unwrap();
        let mut reader = PayloadReader::new(&last[HEADER_LEN..]);
        assert_eq!(reader.read_u8().unwrap(), opcode::LOAD_SCENE);
        assert_eq!(reader.read_string().unwrap(), "ponyville");
    }

    #[test]
    fn test_instantiate_scene_sets_stage() {
        let mut reg = registry();
        let a = connect(&mut reg, 1);
        let b = connect(&mut reg, 2);
        reg.load_scene(a, "ponyville", Vector3::default(), Quaternion::default())
            .unwrap();
        reg.load_scene(b, "ponyville", Vector3::default(), Quaternion::default())
            .unwrap();

        assert_eq!(reg.instantiate_scene_to(a).unwrap(), 2);
        assert_eq!(reg.session(&a).unwrap().stage, InGameStage::EntitiesSent);
    }

    #[test]
    fn test_teardown_discards_pending_and_saves() {
        let mut reg = registry();
        let a = connect(&mut reg, 1);
        reg.load_scene(a, "ponyville", Vector3::default(), Quaternion::default())
            .unwrap();

        let removed = reg.teardown(a, Some("bye")).unwrap();
        assert_eq!(removed.addr, a);
        assert!(!reg.contains(&a));
        assert!(reg.scene_members("ponyville").is_empty());

        // Only the disconnect frame goes out; the scene load was discarded
        let out = reg.drain_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1[0], 0x87);

        let record = reg.store().load("p1").unwrap().unwrap();
        assert_eq!(record.last_scene.as_deref(), Some("ponyville"));
        assert!(reg.teardown(a, None).is_none());
    }
}
