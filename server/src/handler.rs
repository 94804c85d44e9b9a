//! Gameplay collaborator contract
//!
//! The gateway owns the protocol and the session state machine; everything
//! the game itself decides (which characters exist, what a vortex leads to,
//! what to do with chat) goes through [`GameHandler`]. Handlers act on the
//! transport only through the [`SessionRegistry`] they are handed.
//!
//! [`DefaultHandler`] is a small self-contained implementation: characters
//! are kept in the player store, animations and chat are relayed to scene
//! members, and the remaining routes are logged.

use crate::dispatch::{Route, NEW_CHARACTER};
use crate::registry::SessionRegistry;
use crate::session::{Character, InGameStage};
use crate::store::CharacterRecord;
use log::{debug, info, warn};
use shared::{
    MessageType, PayloadReader, PayloadWriter, Quaternion, Vector3, ANIMATION_CHANNEL,
    CHARACTER_CHANNEL,
};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Scene new characters start in
pub const DEFAULT_SPAWN_SCENE: &str = "ponyville";

pub const INVALID_NAME_REASON: &str =
    "Pony names need to be longer than 3 characters and contain only one whitespace.";
pub const INVALID_DATA_REASON: &str = "You were kicked for sending invalid data.";

/// Ordered channel carrying entity data and stats
const DATA_CHANNEL: u8 = 18;

const OP_CHARACTER_LIST: u8 = 0x01;
const OP_CHAT: u8 = 0x0F;
const OP_PONY_DATA: u8 = 0xC8;
const OP_SET_STAT: u8 = 50;
const OP_SET_MAX_STAT: u8 = 51;

/// Animation byte meaning "flying"; only a landing may follow it
const ANIMATION_FLYING: u8 = 0x01;
const ANIMATION_LANDING: u8 = 0x00;

/// What to do after a character was picked
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Load {
        scene: String,
        position: Vector3,
        rotation: Quaternion,
    },
    Kick(String),
}

/// Where a vortex leads
#[derive(Debug, Clone, PartialEq)]
pub struct VortexTarget {
    pub scene: String,
    pub position: Vector3,
    pub rotation: Quaternion,
}

pub trait GameHandler: Send {
    /// Sends the character list to a session still selecting a character
    fn character_list(&mut self, registry: &mut SessionRegistry, addr: SocketAddr);

    /// Creates (`index == NEW_CHARACTER`) or updates a character and decides
    /// where it spawns
    fn select_character(
        &mut self,
        registry: &mut SessionRegistry,
        addr: SocketAddr,
        index: u32,
        name: &str,
        data: &[u8],
    ) -> Selection;

    /// Called after the scene load for a selected character was queued
    fn character_loaded(&mut self, _registry: &mut SessionRegistry, _addr: SocketAddr) {}

    /// Called after the scene was instantiated to the session
    fn entities_sent(&mut self, _registry: &mut SessionRegistry, _addr: SocketAddr) {}

    fn send_own_game_info(&mut self, registry: &mut SessionRegistry, addr: SocketAddr);

    /// Sends the game data of `other` to `addr`
    fn send_other_game_info(
        &mut self,
        registry: &mut SessionRegistry,
        addr: SocketAddr,
        other: SocketAddr,
    );

    fn resolve_vortex(&mut self, scene: &str, id: u8) -> Option<VortexTarget>;

    /// Every route the gateway does not handle itself
    fn on_route(&mut self, registry: &mut SessionRegistry, addr: SocketAddr, route: Route<'_>);
}

/// Checks and normalises a character name
///
/// Names need at least 3 characters. With a space, the first two words must
/// each have 3 characters and anything after the second word is dropped.
pub fn normalize_name(name: &str) -> Option<String> {
    if name.chars().count() < 3 {
        return None;
    }
    if !name.contains(' ') {
        return Some(name.to_string());
    }

    let mut words = name.split(' ');
    let first = words.next().unwrap_or_default();
    let second = words.next().unwrap_or_default();
    if first.chars().count() < 3 || second.chars().count() < 3 {
        return None;
    }
    Some(format!("{} {}", first, second))
}

#[derive(Debug, Default)]
pub struct DefaultHandler {
    vortexes: HashMap<(String, u8), VortexTarget>,
}

impl DefaultHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the destination of vortex `id` in `scene`
    pub fn with_vortex(mut self, scene: &str, id: u8, target: VortexTarget) -> Self {
        self.vortexes.insert((scene.to_lowercase(), id), target);
        self
    }

    fn send_stats(registry: &mut SessionRegistry, addr: SocketAddr) {
        let netview_id = match registry.session(&addr) {
            Some(s) => s.netview_id,
            None => return,
        };

        for stat in 0..2u8 {
            for op in [OP_SET_MAX_STAT, OP_SET_STAT] {
                let mut payload = PayloadWriter::new();
                payload
                    .put_u16(netview_id)
                    .put_u8(op)
                    .put_u8(stat)
                    .put_f32(100.0);
                send_or_warn(registry, addr, DATA_CHANNEL, &payload.into_bytes());
            }
        }
    }

    fn pony_data_payload(netview_id: u16, character: &Character) -> Vec<u8> {
        let mut payload = PayloadWriter::new();
        payload
            .put_u16(netview_id)
            .put_u8(OP_PONY_DATA)
            .put_bytes(&character.data);
        payload.into_bytes()
    }

    fn relay_animation(registry: &mut SessionRegistry, addr: SocketAddr, body: &[u8]) {
        let scene = {
            let session = match registry.session_mut(&addr) {
                Some(s) => s,
                None => return,
            };
            let scene = match &session.scene {
                Some(scene) => scene.clone(),
                None => {
                    warn!("Animation from {} outside any scene, dropped", addr);
                    return;
                }
            };

            // A flying player has to land before anything else is accepted
            let flying = session.last_animation.get(3) == Some(&ANIMATION_FLYING);
            if flying && body.get(3) != Some(&ANIMATION_LANDING) {
                debug!("Rejecting animation from {} while flying", session.label());
                return;
            }
            session.last_animation = body.to_vec();
            scene
        };

        registry.broadcast_scene(
            &scene,
            Some(addr),
            InGameStage::EntitiesSent,
            MessageType::ordered(ANIMATION_CHANNEL),
            body,
        );
    }

    fn relay_chat(registry: &mut SessionRegistry, addr: SocketAddr, channel: u8, body: &[u8]) {
        let message = match PayloadReader::new(body).read_string() {
            Ok(message) => message,
            Err(e) => {
                warn!("Unreadable chat message from {}: {}", addr, e);
                return;
            }
        };

        let (scene, netview_id, author, position, rotation) = match registry.session(&addr) {
            Some(s) => (
                s.scene.clone(),
                s.netview_id,
                s.character
                    .as_ref()
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| s.name.clone()),
                s.position,
                s.rotation,
            ),
            None => return,
        };
        let scene = match scene {
            Some(scene) => scene,
            None => return,
        };

        if message.starts_with("/stuck") || message.starts_with("unstuck me") {
            info!("Reloading scene for stuck player {}", author);
            if let Err(e) = registry.load_scene(addr, &scene, position, rotation) {
                warn!("Failed to reload scene for {}: {}", addr, e);
            }
            return;
        }

        let mut payload = PayloadWriter::with_opcode(OP_CHAT);
        payload
            .put_u8(channel)
            .put_string(&author)
            .put_string(&message)
            .put_u16(netview_id)
            .put_u16(netview_id)
            .put_u8(0);
        registry.broadcast_scene(
            &scene,
            None,
            InGameStage::EntitiesSent,
            MessageType::ordered(CHARACTER_CHANNEL),
            &payload.into_bytes(),
        );
    }

    fn delete_character(&mut self, registry: &mut SessionRegistry, addr: SocketAddr, index: u32) {
        let name = match registry.session(&addr) {
            Some(s) => s.name.clone(),
            None => return,
        };

        let result = registry.store().load_or_default(&name).and_then(|mut record| {
            if (index as usize) < record.characters.len() {
                let removed = record.characters.remove(index as usize);
                info!("Deleting character {} ({})", removed.name, name);
                registry.store_mut().save(&record)
            } else {
                warn!("Invalid character index {} from {}", index, name);
                Ok(())
            }
        });
        if let Err(e) = result {
            warn!("Failed to delete character of {}: {}", name, e);
        }

        self.character_list(registry, addr);
    }

    fn sync_position(registry: &mut SessionRegistry, addr: SocketAddr, netview_id: u16, body: &[u8]) {
        let session = match registry.session_mut(&addr) {
            Some(s) => s,
            None => return,
        };
        // Syncs while loading would teleport the player to a stale position
        if session.netview_id != netview_id || session.stage < InGameStage::EntitiesSent {
            return;
        }

        let mut reader = PayloadReader::new(body);
        let position = reader.skip(6).and_then(|_| reader.read_vector());
        match position {
            Ok(position) => session.position = position,
            Err(e) => debug!("Short position sync from {}: {}", addr, e),
        }
    }
}

fn send_or_warn(registry: &mut SessionRegistry, addr: SocketAddr, channel: u8, payload: &[u8]) {
    if let Err(e) = registry.send(addr, MessageType::ordered(channel), payload) {
        warn!("Failed to queue frame for {}: {}", addr, e);
    }
}

impl GameHandler for DefaultHandler {
    fn character_list(&mut self, registry: &mut SessionRegistry, addr: SocketAddr) {
        let name = match registry.session(&addr) {
            Some(s) => s.name.clone(),
            None => return,
        };
        let characters = match registry.store().load_or_default(&name) {
            Ok(record) => record.characters,
            Err(e) => {
                warn!("Failed to load characters of {}: {}", name, e);
                Vec::new()
            }
        };

        let mut payload = PayloadWriter::with_opcode(OP_CHARACTER_LIST);
        payload.put_u32(characters.len() as u32);
        for character in &characters {
            payload.put_bytes(&character.data);
        }

        info!("Sending {} characters to {}", characters.len(), name);
        send_or_warn(registry, addr, CHARACTER_CHANNEL, &payload.into_bytes());
    }

    fn select_character(
        &mut self,
        registry: &mut SessionRegistry,
        addr: SocketAddr,
        index: u32,
        name: &str,
        data: &[u8],
    ) -> Selection {
        let name = match normalize_name(name) {
            Some(name) => name,
            None => {
                warn!("Invalid character name {:?} from {}", name, addr);
                return Selection::Kick(INVALID_NAME_REASON.to_string());
            }
        };
        let player = match registry.session(&addr) {
            Some(s) => s.name.clone(),
            None => return Selection::Kick(INVALID_DATA_REASON.to_string()),
        };

        let mut record = match registry.store().load_or_default(&player) {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to load characters of {}: {}", player, e);
                return Selection::Kick(INVALID_DATA_REASON.to_string());
            }
        };

        let character = if index == NEW_CHARACTER {
            let created = CharacterRecord {
                name: name.clone(),
                data: data.to_vec(),
                scene: DEFAULT_SPAWN_SCENE.to_string(),
                position: [0.0; 3],
            };
            record.characters.push(created.clone());
            created
        } else {
            match record.characters.get_mut(index as usize) {
                Some(existing) => {
                    existing.name = name.clone();
                    existing.data = data.to_vec();
                    existing.clone()
                }
                None => {
                    warn!("Invalid character index {} from {}", index, player);
                    return Selection::Kick(INVALID_DATA_REASON.to_string());
                }
            }
        };

        if let Err(e) = registry.store_mut().save(&record) {
            warn!("Failed to save characters of {}: {}", player, e);
        }
        if let Some(session) = registry.session_mut(&addr) {
            session.character = Some(Character {
                name,
                data: character.data,
            });
        }

        let [x, y, z] = character.position;
        Selection::Load {
            scene: character.scene,
            position: Vector3 { x, y, z },
            rotation: Quaternion::default(),
        }
    }

    fn character_loaded(&mut self, registry: &mut SessionRegistry, addr: SocketAddr) {
        // Empty friend list and journal
        send_or_warn(registry, addr, CHARACTER_CHANNEL, &[0x14, 0x15, 0, 0, 0, 0]);
        send_or_warn(registry, addr, CHARACTER_CHANNEL, &[0x0e, 0, 0, 0, 0]);
    }

    fn entities_sent(&mut self, registry: &mut SessionRegistry, addr: SocketAddr) {
        Self::send_stats(registry, addr);
    }

    fn send_own_game_info(&mut self, registry: &mut SessionRegistry, addr: SocketAddr) {
        Self::send_stats(registry, addr);

        let payload = match registry.session(&addr) {
            Some(s) => match &s.character {
                Some(character) => Self::pony_data_payload(s.netview_id, character),
                None => {
                    warn!("Game info requested by {} without a character", s.label());
                    return;
                }
            },
            None => return,
        };
        send_or_warn(registry, addr, DATA_CHANNEL, &payload);
    }

    fn send_other_game_info(
        &mut self,
        registry: &mut SessionRegistry,
        addr: SocketAddr,
        other: SocketAddr,
    ) {
        let (payload, animation) = match registry.session(&other) {
            Some(s) => match &s.character {
                Some(character) => (
                    Self::pony_data_payload(s.netview_id, character),
                    s.last_animation.clone(),
                ),
                None => return,
            },
            None => return,
        };

        send_or_warn(registry, addr, DATA_CHANNEL, &payload);
        if !animation.is_empty() {
            send_or_warn(registry, addr, ANIMATION_CHANNEL, &animation);
        }
    }

    fn resolve_vortex(&mut self, scene: &str, id: u8) -> Option<VortexTarget> {
        self.vortexes.get(&(scene.to_lowercase(), id)).cloned()
    }

    fn on_route(&mut self, registry: &mut SessionRegistry, addr: SocketAddr, route: Route<'_>) {
        match route {
            Route::Animation { body } => Self::relay_animation(registry, addr, body),
            Route::Chat { channel, body } => Self::relay_chat(registry, addr, channel, body),
            Route::DeleteCharacter { index } => self.delete_character(registry, addr, index),
            Route::PositionSync { netview_id, body } => {
                Self::sync_position(registry, addr, netview_id, body)
            }
            other => debug!("Unhandled {} request from {}", other.name(), addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::loss::NoLoss;
    use crate::session::Session;
    use crate::store::MemoryStore;
    use assert_approx_eq::assert_approx_eq;
    use shared::Frame;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Instant;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// Registry with two in-game players sharing "ponyville"
    fn scene_with_two() -> (SessionRegistry, SocketAddr, SocketAddr) {
        let mut reg = SessionRegistry::new(
            ServerConfig::default(),
            Box::new(MemoryStore::new()),
            Box::new(NoLoss),
        );
        let mut players = Vec::new();
        for port in [1, 2] {
            let a = addr(port);
            let mut session = Session::new(a, format!("p{}", port), reg.config(), Instant::now());
            session.on_connect_syn();
            let id = reg.allocate_entity_id();
            session.establish(id).unwrap();
            reg.insert(session).unwrap();
            reg.load_scene(a, "ponyville", Vector3::default(), Quaternion::default())
                .unwrap();
            players.push(a);
        }
        for a in &players {
            reg.session_mut(a).unwrap().stage = InGameStage::GameInfoSent;
        }
        reg.flush_all();
        reg.drain_outbox();
        (reg, players[0], players[1])
    }

    /// Flushes and drains the outbox once, grouping frames by destination
    fn payloads_by_peer(reg: &mut SessionRegistry) -> HashMap<SocketAddr, Vec<(u8, Vec<u8>)>> {
        reg.flush_all();
        let mut out: HashMap<SocketAddr, Vec<(u8, Vec<u8>)>> = HashMap::new();
        for (dest, datagram) in reg.drain_outbox() {
            let frames = out.entry(dest).or_default();
            let mut cursor = 0;
            while cursor < datagram.len() {
                let (f, consumed) = Frame::decode(&datagram[cursor..]).unwrap();
                frames.push((f.header.type_byte, f.payload.to_vec()));
                cursor += consumed;
            }
        }
        out
    }

    fn payloads_to(reg: &mut SessionRegistry, to: SocketAddr) -> Vec<(u8, Vec<u8>)> {
        payloads_by_peer(reg).remove(&to).unwrap_or_default()
    }

    #[test]
    fn test_position_sync_updates_own_entity_only() {
        let (mut reg, a, b) = scene_with_two();
        let mut handler = DefaultHandler::new();
        let id = reg.session(&a).unwrap().netview_id;

        let mut body = PayloadWriter::new();
        body.put_u16(id)
            .put_u32(0)
            .put_vector(Vector3 { x: 1.5, y: 2.0, z: -3.25 });
        let body = body.into_bytes();
        handler.on_route(&mut reg, a, Route::PositionSync { netview_id: id, body: &body });

        let position = reg.session(&a).unwrap().position;
        assert_approx_eq!(position.x, 1.5);
        assert_approx_eq!(position.z, -3.25);

        // b cannot move a's entity
        handler.on_route(&mut reg, b, Route::PositionSync { netview_id: id, body: &body });
        assert_approx_eq!(reg.session(&b).unwrap().position.x, 0.0);
    }

    #[test]
    fn test_animation_relay_and_flying_guard() {
        let (mut reg, a, b) = scene_with_two();
        let mut handler = DefaultHandler::new();

        let fly = [0, 0, 0xCA, ANIMATION_FLYING];
        handler.on_route(&mut reg, a, Route::Animation { body: &fly });
        let to_b = payloads_to(&mut reg, b);
        assert_eq!(to_b, vec![(0x4E, fly.to_vec())]);

        // Still flying: anything but a landing is dropped
        handler.on_route(&mut reg, a, Route::Animation { body: &[0, 0, 0xCA, 0x05] });
        assert!(payloads_to(&mut reg, b).is_empty());

        handler.on_route(&mut reg, a, Route::Animation { body: &[0, 0, 0xCA, ANIMATION_LANDING] });
        let sent = payloads_by_peer(&mut reg);
        assert_eq!(sent.get(&b).map(Vec::len), Some(1));
        assert!(!sent.contains_key(&a));
    }

    #[test]
    fn test_chat_is_broadcast_to_scene() {
        let (mut reg, a, b) = scene_with_two();
        let mut handler = DefaultHandler::new();

        let mut body = PayloadWriter::new();
        body.put_string("hello");
        let body = body.into_bytes();
        handler.on_route(&mut reg, a, Route::Chat { channel: 8, body: &body });

        let mut sent = payloads_by_peer(&mut reg);
        for peer in [a, b] {
            let frames = sent.remove(&peer).unwrap_or_default();
            assert_eq!(frames.len(), 1);
            let mut reader = PayloadReader::new(&frames[0].1);
            assert_eq!(reader.read_u8().unwrap(), OP_CHAT);
            assert_eq!(reader.read_u8().unwrap(), 8);
            assert_eq!(reader.read_string().unwrap(), "p1");
            assert_eq!(reader.read_string().unwrap(), "hello");
        }
    }

    #[test]
    fn test_stuck_command_reloads_scene() {
        let (mut reg, a, _) = scene_with_two();
        let mut handler = DefaultHandler::new();

        let mut body = PayloadWriter::new();
        body.put_string("/stuck");
        let body = body.into_bytes();
        handler.on_route(&mut reg, a, Route::Chat { channel: 8, body: &body });

        assert_eq!(reg.session(&a).unwrap().stage, InGameStage::Loading);
        let frames = payloads_to(&mut reg, a);
        assert_eq!(frames.last().unwrap().1[0], shared::opcode::LOAD_SCENE);
        assert!(frames.iter().all(|(_, p)| p[0] != OP_CHAT));
    }

    #[test]
    fn test_character_list_and_delete() {
        let (mut reg, a, _) = scene_with_two();
        let mut handler = DefaultHandler::new();
        reg.session_mut(&a).unwrap().stage = InGameStage::CharacterSelect;

        let selection = handler.select_character(&mut reg, a, NEW_CHARACTER, "Applejack", &[7, 7]);
        assert!(matches!(selection, Selection::Load { ref scene, .. } if scene == DEFAULT_SPAWN_SCENE));
        payloads_to(&mut reg, a);

        handler.character_list(&mut reg, a);
        let frames = payloads_to(&mut reg, a);
        assert_eq!(frames[0].1, vec![OP_CHARACTER_LIST, 1, 0, 0, 0, 7, 7]);

        handler.on_route(&mut reg, a, Route::DeleteCharacter { index: 0 });
        let frames = payloads_to(&mut reg, a);
        assert_eq!(frames[0].1, vec![OP_CHARACTER_LIST, 0, 0, 0, 0]);
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Rarity"), Some("Rarity".to_string()));
        assert_eq!(normalize_name("Big Mac"), Some("Big Mac".to_string()));
        assert_eq!(
            normalize_name("Apple Bloom Junior"),
            Some("Apple Bloom".to_string())
        );
        assert_eq!(normalize_name("Al"), None);
        assert_eq!(normalize_name("Al Bundy"), None);
        assert_eq!(normalize_name("Twilight Ex"), None);
    }

    #[test]
    fn test_vortex_lookup_is_case_insensitive() {
        let target = VortexTarget {
            scene: "canterlot".to_string(),
            position: Vector3::default(),
            rotation: Quaternion::default(),
        };
        let mut handler = DefaultHandler::new().with_vortex("Ponyville", 2, target.clone());
        assert_eq!(handler.resolve_vortex("ponyville", 2), Some(target));
        assert_eq!(handler.resolve_vortex("ponyville", 3), None);
    }
}
