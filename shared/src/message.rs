//! Message-type table for the datagram protocol
//!
//! Every frame starts with a single type byte. The values are fixed by the
//! client and must not be renumbered.

use std::fmt;

/// Number of independent ordered-reliable channels
pub const RELIABLE_CHANNELS: usize = 32;

/// Index of the unreliable counter inside a session's outbound counter array
pub const UNRELIABLE_SLOT: usize = RELIABLE_CHANNELS;

/// Total number of outbound sequence counters kept per session
pub const OUTBOUND_COUNTERS: usize = RELIABLE_CHANNELS + 1;

const UNRELIABLE: u8 = 0x01;
const RELIABLE_ORDERED_FIRST: u8 = 0x43;
const RELIABLE_ORDERED_LAST: u8 = RELIABLE_ORDERED_FIRST + RELIABLE_CHANNELS as u8 - 1;
const PING: u8 = 0x81;
const PONG: u8 = 0x82;
const CONNECT: u8 = 0x83;
const CONNECT_RESPONSE: u8 = 0x84;
const CONNECTION_ESTABLISHED: u8 = 0x85;
const ACKNOWLEDGE: u8 = 0x86;
const DISCONNECT: u8 = 0x87;

/// A decoded message type
///
/// `ReliableOrdered` carries the zero-based channel index. The client names
/// channels starting from one ("ordered 6" is channel index 5), see
/// [`MessageType::ordered`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Unreliable,
    ReliableOrdered(u8),
    Ping,
    Pong,
    Connect,
    ConnectResponse,
    ConnectionEstablished,
    Acknowledge,
    Disconnect,
}

impl MessageType {
    /// Builds an ordered-reliable type from the client's one-based channel number
    pub fn ordered(number: u8) -> Self {
        MessageType::ReliableOrdered(number.saturating_sub(1))
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            UNRELIABLE => Some(MessageType::Unreliable),
            RELIABLE_ORDERED_FIRST..=RELIABLE_ORDERED_LAST => {
                Some(MessageType::ReliableOrdered(byte - RELIABLE_ORDERED_FIRST))
            }
            PING => Some(MessageType::Ping),
            PONG => Some(MessageType::Pong),
            CONNECT => Some(MessageType::Connect),
            CONNECT_RESPONSE => Some(MessageType::ConnectResponse),
            CONNECTION_ESTABLISHED => Some(MessageType::ConnectionEstablished),
            ACKNOWLEDGE => Some(MessageType::Acknowledge),
            DISCONNECT => Some(MessageType::Disconnect),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            MessageType::Unreliable => UNRELIABLE,
            MessageType::ReliableOrdered(channel) => {
                RELIABLE_ORDERED_FIRST + (channel % RELIABLE_CHANNELS as u8)
            }
            MessageType::Ping => PING,
            MessageType::Pong => PONG,
            MessageType::Connect => CONNECT,
            MessageType::ConnectResponse => CONNECT_RESPONSE,
            MessageType::ConnectionEstablished => CONNECTION_ESTABLISHED,
            MessageType::Acknowledge => ACKNOWLEDGE,
            MessageType::Disconnect => DISCONNECT,
        }
    }

    /// Zero-based channel index for ordered-reliable types
    pub fn channel(self) -> Option<u8> {
        match self {
            MessageType::ReliableOrdered(channel) => Some(channel),
            _ => None,
        }
    }

    pub fn is_reliable_ordered(self) -> bool {
        matches!(self, MessageType::ReliableOrdered(_))
    }

    /// Whether frames of this type must keep their position relative to other
    /// frames sent to the same peer, and therefore go through the coalescer.
    pub fn is_coalesced(self) -> bool {
        matches!(
            self,
            MessageType::ReliableOrdered(_) | MessageType::ConnectResponse
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Unreliable => write!(f, "Unreliable"),
            MessageType::ReliableOrdered(channel) => write!(f, "ReliableOrdered{}", channel + 1),
            MessageType::Ping => write!(f, "Ping"),
            MessageType::Pong => write!(f, "Pong"),
            MessageType::Connect => write!(f, "Connect"),
            MessageType::ConnectResponse => write!(f, "ConnectResponse"),
            MessageType::ConnectionEstablished => write!(f, "ConnectionEstablished"),
            MessageType::Acknowledge => write!(f, "Acknowledge"),
            MessageType::Disconnect => write!(f, "Disconnect"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_channel_bytes() {
        assert_eq!(MessageType::ordered(1).to_byte(), 0x43);
        assert_eq!(MessageType::ordered(4).to_byte(), 0x46);
        assert_eq!(MessageType::ordered(6).to_byte(), 0x48);
        assert_eq!(MessageType::ordered(32).to_byte(), 0x62);
    }

    #[test]
    fn test_from_byte_channels() {
        assert_eq!(
            MessageType::from_byte(0x48),
            Some(MessageType::ReliableOrdered(5))
        );
        assert_eq!(MessageType::from_byte(0x48).and_then(|t| t.channel()), Some(5));
        assert_eq!(MessageType::from_byte(0x63), None);
        assert_eq!(MessageType::from_byte(0x42), None);
    }

    #[test]
    fn test_control_types() {
        for byte in 0x81..=0x87u8 {
            let ty = MessageType::from_byte(byte).unwrap();
            assert_eq!(ty.to_byte(), byte);
            assert!(!ty.is_reliable_ordered());
        }
        assert_eq!(MessageType::from_byte(0x88), None);
        assert_eq!(MessageType::from_byte(0x00), None);
    }

    #[test]
    fn test_coalesced_classes() {
        assert!(MessageType::ordered(6).is_coalesced());
        assert!(MessageType::ConnectResponse.is_coalesced());
        assert!(!MessageType::Ping.is_coalesced());
        assert!(!MessageType::Pong.is_coalesced());
        assert!(!MessageType::Acknowledge.is_coalesced());
        assert!(!MessageType::Disconnect.is_coalesced());
        assert!(!MessageType::Unreliable.is_coalesced());
    }

    #[test]
    fn test_display_uses_client_numbering() {
        assert_eq!(MessageType::ordered(6).to_string(), "ReliableOrdered6");
    }
}
