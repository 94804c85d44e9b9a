//! Errors raised while reading or writing wire data

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer ends before the frame or field it announces
    Truncated { needed: usize, available: usize },
    /// The type byte is not in the message-type table
    UnknownType(u8),
    /// The payload's bit length would overflow the 16-bit length field
    PayloadTooLarge(usize),
    /// A length-prefixed string has a malformed prefix or is not UTF-8
    InvalidString,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Truncated { needed, available } => write!(
                f,
                "frame truncated: needed {} bytes, {} available",
                needed, available
            ),
            FrameError::UnknownType(byte) => write!(f, "unknown message type 0x{:02x}", byte),
            FrameError::PayloadTooLarge(len) => {
                write!(f, "payload of {} bytes does not fit a frame", len)
            }
            FrameError::InvalidString => write!(f, "invalid length-prefixed string"),
        }
    }
}

impl std::error::Error for FrameError {}
