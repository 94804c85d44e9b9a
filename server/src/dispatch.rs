//! Opcode recognition for application frames
//!
//! Maps a decoded frame to a [`Route`] by its type byte, declared bit length
//! and the opcode bytes inside the payload. No business logic happens here;
//! the gateway and the gameplay handler act on the route. Anything that does
//! not match is reported as `None` and the caller logs and skips it.

use shared::{
    Frame, MessageType, PayloadReader, ANIMATION_CHANNEL, CHARACTER_CHANNEL, ITEM_CHANNEL,
    SCENE_CHANNEL, VORTEX_CHANNEL,
};

const OP_EDIT_CHARACTER: u8 = 0x01;
const OP_DELETE_CHARACTER: u8 = 0x02;
const OP_CONTINUE_DIALOG: u8 = 0x0B;
const OP_DIALOG_ANSWER: u8 = 0x0C;
const OP_CHAT: u8 = 0x0F;
const OP_FRIEND_REQUEST: u8 = 0x14;
const OP_PLAYER_REPORT: u8 = 0xCF;
const OP_ANIMATION: u8 = 0xCA;

/// Index in the payload that character indices use for "create a new one"
pub const NEW_CHARACTER: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemRequest {
    Skill,
    Wear,
    BeginShop,
    EndShop,
    Buy,
    Sell,
    GetWorn,
    Unwear,
    RunScript,
}

impl ItemRequest {
    fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            0x3D => Some(ItemRequest::Skill),
            0x08 => Some(ItemRequest::Wear),
            0x16 => Some(ItemRequest::BeginShop),
            0x17 => Some(ItemRequest::EndShop),
            0x0A => Some(ItemRequest::Buy),
            0x0B => Some(ItemRequest::Sell),
            0x04 => Some(ItemRequest::GetWorn),
            0x09 => Some(ItemRequest::Unwear),
            0x31 => Some(ItemRequest::RunScript),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route<'a> {
    /// "Prefab list ready": instantiate the scene to the client
    EntitiesList,
    /// "Game info ready" for the entity `netview_id`
    GameInfo { netview_id: u16 },
    EditCharacter { index: u32, data: &'a [u8] },
    DeleteCharacter { index: u32 },
    Chat { channel: u8, body: &'a [u8] },
    ContinueDialog,
    DialogAnswer { answer: u32 },
    FriendRequest { target: u8 },
    PlayerReport { target: u8, text: &'a [u8] },
    Vortex { id: u8 },
    /// Whole animation payload, relayed verbatim
    Animation { body: &'a [u8] },
    Item {
        request: ItemRequest,
        target: u16,
        body: &'a [u8],
    },
    PositionSync { netview_id: u16, body: &'a [u8] },
}

impl Route<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Route::EntitiesList => "entities list",
            Route::GameInfo { .. } => "game info",
            Route::EditCharacter { .. } => "edit character",
            Route::DeleteCharacter { .. } => "delete character",
            Route::Chat { .. } => "chat",
            Route::ContinueDialog => "continue dialog",
            Route::DialogAnswer { .. } => "dialog answer",
            Route::FriendRequest { .. } => "friend request",
            Route::PlayerReport { .. } => "player report",
            Route::Vortex { .. } => "vortex",
            Route::Animation { .. } => "animation",
            Route::Item { .. } => "item",
            Route::PositionSync { .. } => "position sync",
        }
    }
}

/// Recognises an application frame
pub fn route<'a>(frame: &Frame<'a>) -> Option<Route<'a>> {
    let payload = frame.payload;
    let bits = frame.header.payload_bits;

    match frame.message_type()? {
        MessageType::Unreliable => {
            let netview_id = u16_at(payload, 0)?;
            Some(Route::PositionSync {
                netview_id,
                body: payload,
            })
        }
        MessageType::ReliableOrdered(channel) => route_ordered(channel + 1, bits, payload),
        _ => None,
    }
}

fn route_ordered(channel: u8, bits: u16, payload: &[u8]) -> Option<Route<'_>> {
    let opcode = payload.first().copied();

    match channel {
        SCENE_CHANNEL if bits == 8 && opcode == Some(shared::opcode::ENTITIES_LIST) => {
            Some(Route::EntitiesList)
        }
        SCENE_CHANNEL if bits == 0x18 && opcode == Some(shared::opcode::GAME_INFO) => {
            Some(Route::GameInfo {
                netview_id: u16_at(payload, 1)?,
            })
        }
        CHARACTER_CHANNEL => route_character(opcode?, payload),
        VORTEX_CHANNEL if bits == 0x18 => Some(Route::Vortex { id: opcode? }),
        ANIMATION_CHANNEL if payload.get(2) == Some(&OP_ANIMATION) => {
            Some(Route::Animation { body: payload })
        }
        ITEM_CHANNEL => {
            let request = ItemRequest::from_opcode(*payload.get(2)?)?;
            Some(Route::Item {
                request,
                target: u16_at(payload, 0)?,
                body: payload,
            })
        }
        _ => None,
    }
}

fn route_character(opcode: u8, payload: &[u8]) -> Option<Route<'_>> {
    match opcode {
        OP_EDIT_CHARACTER => Some(Route::EditCharacter {
            index: u32_at(payload, 1)?,
            data: payload.get(5..)?,
        }),
        OP_DELETE_CHARACTER => Some(Route::DeleteCharacter {
            index: u32_at(payload, 1)?,
        }),
        OP_CHAT => Some(Route::Chat {
            channel: *payload.get(1)?,
            body: payload.get(2..)?,
        }),
        OP_CONTINUE_DIALOG => Some(Route::ContinueDialog),
        OP_DIALOG_ANSWER => Some(Route::DialogAnswer {
            answer: u32_at(payload, 1)?,
        }),
        OP_FRIEND_REQUEST => Some(Route::FriendRequest {
            target: *payload.get(5)?,
        }),
        OP_PLAYER_REPORT => {
            let len = *payload.get(4)? as usize;
            let start = payload.len().checked_sub(len)?;
            Some(Route::PlayerReport {
                target: *payload.get(2)?,
                text: &payload[start..],
            })
        }
        _ => None,
    }
}

fn u16_at(payload: &[u8], offset: usize) -> Option<u16> {
    let mut reader = PayloadReader::new(payload.get(offset..)?);
    reader.read_u16().ok()
}

fn u32_at(payload: &[u8], offset: usize) -> Option<u32> {
    let mut reader = PayloadReader::new(payload.get(offset..)?);
    reader.read_u32().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::frame::encode;

    fn routed(ty: MessageType, payload: &[u8]) -> Option<Route<'static>> {
        let bytes: &'static [u8] = Box::leak(encode(ty, 0, payload).unwrap().into_boxed_slice());
        let (frame, _) = Frame::decode(bytes).unwrap();
        route(&frame)
    }

    #[test]
    fn test_scene_channel_routes() {
        assert_eq!(
            routed(MessageType::ordered(6), &[6]),
            Some(Route::EntitiesList)
        );
        assert_eq!(
            routed(MessageType::ordered(6), &[8, 0x10, 0x00]),
            Some(Route::GameInfo { netview_id: 16 })
        );
        // Opcode alone is not enough, the bit length must match too
        assert_eq!(routed(MessageType::ordered(6), &[6, 0]), None);
        assert_eq!(routed(MessageType::ordered(6), &[8, 1]), None);
    }

    #[test]
    fn test_character_channel_routes() {
        let mut edit = vec![0x01, 0xFF, 0xFF, 0xFF, 0xFF];
        edit.extend_from_slice(&[3, b'A', b'b', b'c']);
        match routed(MessageType::ordered(4), &edit) {
            Some(Route::EditCharacter { index, data }) => {
                assert_eq!(index, NEW_CHARACTER);
                assert_eq!(data, &[3, b'A', b'b', b'c']);
            }
            other => panic!("unexpected route {:?}", other),
        }

        assert_eq!(
            routed(MessageType::ordered(4), &[0x02, 1, 0, 0, 0]),
            Some(Route::DeleteCharacter { index: 1 })
        );
        assert_eq!(
            routed(MessageType::ordered(4), &[0x0C, 2, 0, 0, 0]),
            Some(Route::DialogAnswer { answer: 2 })
        );
        assert_eq!(
            routed(MessageType::ordered(4), &[0x0B]),
            Some(Route::ContinueDialog)
        );
        assert_eq!(
            routed(MessageType::ordered(4), &[0x14, 0, 0, 0, 0, 9]),
            Some(Route::FriendRequest { target: 9 })
        );
        assert_eq!(routed(MessageType::ordered(4), &[0x99]), None);
    }

    #[test]
    fn test_chat_route() {
        let payload = [0x0F, 4, 5, b'h', b'e', b'l', b'l', b'o', 0];
        match routed(MessageType::ordered(4), &payload) {
            Some(Route::Chat { channel, body }) => {
                assert_eq!(channel, 4);
                assert_eq!(body[0], 5);
            }
            other => panic!("unexpected route {:?}", other),
        }
    }

    #[test]
    fn test_player_report_takes_trailing_text() {
        let payload = [0xCF, 0, 7, 0, 3, b'b', b'a', b'd'];
        assert_eq!(
            routed(MessageType::ordered(4), &payload),
            Some(Route::PlayerReport {
                target: 7,
                text: b"bad",
            })
        );
    }

    #[test]
    fn test_world_routes() {
        assert_eq!(
            routed(MessageType::ordered(20), &[3, 0, 0]),
            Some(Route::Vortex { id: 3 })
        );
        assert!(matches!(
            routed(MessageType::ordered(12), &[1, 0, 0xCA, 0x01]),
            Some(Route::Animation { .. })
        ));
        assert_eq!(
            routed(MessageType::ordered(11), &[5, 0, 0x31]),
            Some(Route::Item {
                request: ItemRequest::RunScript,
                target: 5,
                body: &[5, 0, 0x31],
            })
        );
        assert_eq!(routed(MessageType::ordered(11), &[5, 0, 0x77]), None);
    }

    #[test]
    fn test_position_sync() {
        assert!(matches!(
            routed(MessageType::Unreliable, &[2, 0, 1, 2, 3, 4]),
            Some(Route::PositionSync { netview_id: 2, .. })
        ));
        assert_eq!(routed(MessageType::Unreliable, &[2]), None);
    }

    #[test]
    fn test_short_payloads_do_not_panic() {
        assert_eq!(routed(MessageType::ordered(4), &[0x01, 0xFF]), None);
        assert_eq!(routed(MessageType::ordered(4), &[]), None);
        assert_eq!(routed(MessageType::ordered(11), &[1]), None);
        assert_eq!(routed(MessageType::ordered(30), &[1, 2, 3]), None);
        assert_eq!(routed(MessageType::Ping, &[1]), None);
    }
}
