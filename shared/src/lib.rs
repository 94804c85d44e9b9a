pub mod error;
pub mod frame;
pub mod message;
pub mod serialize;

pub use error::FrameError;
pub use frame::{AckEntry, Frame, FrameHeader, CONNECT_TOKEN_LEN, HEADER_LEN};
pub use message::{MessageType, OUTBOUND_COUNTERS, RELIABLE_CHANNELS, UNRELIABLE_SLOT};
pub use serialize::{hex, PayloadReader, PayloadWriter, ProtocolClock, Quaternion, Vector3};

/// Default UDP port of the game server
pub const DEFAULT_GAME_PORT: u16 = 1034;

/// Largest datagram the coalescer will build
pub const MAX_DATAGRAM_LEN: usize = 1024;

/// Ordered channel carrying entity and scene traffic
pub const SCENE_CHANNEL: u8 = 6;
/// Ordered channel carrying character-select traffic
pub const CHARACTER_CHANNEL: u8 = 4;
/// Ordered channel carrying animations
pub const ANIMATION_CHANNEL: u8 = 12;
/// Ordered channel carrying item and skill RPCs
pub const ITEM_CHANNEL: u8 = 11;
/// Ordered channel carrying vortex traversal
pub const VORTEX_CHANNEL: u8 = 20;

/// Opcodes of server-to-client frames on [`SCENE_CHANNEL`]
pub mod opcode {
    pub const INSTANTIATE: u8 = 1;
    pub const NETVIEW_REMOVE: u8 = 2;
    pub const SET_ID: u8 = 4;
    pub const LOAD_SCENE: u8 = 5;
    pub const ENTITIES_LIST: u8 = 6;
    pub const GAME_INFO: u8 = 8;
}

/// Scene every session is sent to right after the handshake
pub const CHARACTER_SELECT_SCENE: &str = "characters";

/// Prefab name clients instantiate for player entities
pub const PLAYER_PREFAB: &str = "PlayerBase";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_constants_map_to_type_bytes() {
        assert_eq!(MessageType::ordered(SCENE_CHANNEL).to_byte(), 0x48);
        assert_eq!(MessageType::ordered(CHARACTER_CHANNEL).to_byte(), 0x46);
        assert_eq!(MessageType::ordered(ANIMATION_CHANNEL).to_byte(), 0x4e);
        assert_eq!(MessageType::ordered(ITEM_CHANNEL).to_byte(), 0x4d);
        assert_eq!(MessageType::ordered(VORTEX_CHANNEL).to_byte(), 0x56);
    }
}
