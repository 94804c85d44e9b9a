//! Frame codec
//!
//! Every frame has a 5-byte header: type byte, 16-bit sequence and the payload
//! length expressed in bits, both little-endian. Encoding multiplies the byte
//! count by 8 and decoding divides the bit count by 8; a bit count that is not
//! a multiple of 8 therefore loses its remainder on the way in, which the
//! client relies on.

use crate::error::FrameError;
use crate::message::MessageType;
use byteorder::{ByteOrder, LittleEndian};

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 5;

/// Number of bytes kept from a connect SYN payload and echoed in the response
pub const CONNECT_TOKEN_LEN: usize = 13;

/// Largest payload whose bit length still fits in the 16-bit length field
pub const MAX_PAYLOAD_LEN: usize = (u16::MAX / 8) as usize;

/// Fixed bit length announced by connect responses (13 token bytes + f32)
const CONNECT_RESPONSE_BITS: u16 = 0x88;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub type_byte: u8,
    pub sequence: u16,
    pub payload_bits: u16,
}

impl FrameHeader {
    /// Reads a header from the start of `buf` without looking at the payload
    pub fn peek(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::Truncated {
                needed: HEADER_LEN,
                available: buf.len(),
            });
        }

        Ok(Self {
            type_byte: buf[0],
            sequence: LittleEndian::read_u16(&buf[1..3]),
            payload_bits: LittleEndian::read_u16(&buf[3..5]),
        })
    }

    pub fn payload_len(&self) -> usize {
        (self.payload_bits / 8) as usize
    }

    /// Total bytes this frame occupies on the wire
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_len()
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_byte(self.type_byte)
    }
}

/// A decoded frame borrowing its payload from the receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub header: FrameHeader,
    pub payload: &'a [u8],
    /// The whole frame including header, used for hex dumps
    pub raw: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Decodes the first frame of `buf`
    ///
    /// Returns the frame and the number of bytes it consumed so the caller
    /// can advance its cursor. An unknown type byte is not an error here: the
    /// declared length is still valid and the frame can be skipped.
    pub fn decode(buf: &'a [u8]) -> Result<(Frame<'a>, usize), FrameError> {
        let header = FrameHeader::peek(buf)?;
        let consumed = header.frame_len();

        if buf.len() < consumed {
            return Err(FrameError::Truncated {
                needed: consumed,
                available: buf.len(),
            });
        }

        let frame = Frame {
            header,
            payload: &buf[HEADER_LEN..consumed],
            raw: &buf[..consumed],
        };

        Ok((frame, consumed))
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.header.message_type()
    }

    pub fn sequence(&self) -> u16 {
        self.header.sequence
    }
}

/// Encodes a standard frame: header followed by `payload`
pub fn encode(ty: MessageType, sequence: u16, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&header_bytes(ty.to_byte(), sequence, (payload.len() * 8) as u16));
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Ping: fixed 6 bytes, the last one is the ping counter
pub fn encode_ping(counter: u8) -> Vec<u8> {
    let mut frame = header_bytes(MessageType::Ping.to_byte(), 0, 8).to_vec();
    frame.push(counter);
    frame
}

/// Pong: ping counter followed by the sender's float timestamp
pub fn encode_pong(counter: u8, timestamp: f32) -> Vec<u8> {
    let mut frame = header_bytes(MessageType::Pong.to_byte(), 0, 8 * 5).to_vec();
    frame.push(counter);
    frame.extend_from_slice(&f32_bytes(timestamp));
    frame
}

/// Connect response: fixed length marker, the echoed SYN token and a timestamp
pub fn encode_connect_response(token: &[u8; CONNECT_TOKEN_LEN], timestamp: f32) -> Vec<u8> {
    let mut frame = header_bytes(
        MessageType::ConnectResponse.to_byte(),
        0,
        CONNECT_RESPONSE_BITS,
    )
    .to_vec();
    frame.extend_from_slice(token);
    frame.extend_from_slice(&f32_bytes(timestamp));
    frame
}

/// Disconnect: one length byte then the reason text
///
/// Reasons longer than 255 bytes are cut to fit the length byte.
pub fn encode_disconnect(reason: &str) -> Vec<u8> {
    let bytes = &reason.as_bytes()[..reason.len().min(u8::MAX as usize)];
    let bits = ((bytes.len() + 1) * 8) as u16;

    let mut frame = header_bytes(MessageType::Disconnect.to_byte(), 0, bits).to_vec();
    frame.push(bytes.len() as u8);
    frame.extend_from_slice(bytes);
    frame
}

/// Reads the reason text out of a disconnect payload
pub fn disconnect_reason(payload: &[u8]) -> String {
    match payload.split_first() {
        Some((&len, rest)) => {
            let len = (len as usize).min(rest.len());
            String::from_utf8_lossy(&rest[..len]).into_owned()
        }
        None => String::new(),
    }
}

/// Extracts the token a connect SYN carries, zero-padded when short
pub fn connect_token(payload: &[u8]) -> [u8; CONNECT_TOKEN_LEN] {
    let mut token = [0u8; CONNECT_TOKEN_LEN];
    let len = payload.len().min(CONNECT_TOKEN_LEN);
    token[..len].copy_from_slice(&payload[..len]);
    token
}

/// One acknowledgement triplet
///
/// The sequence is echoed with each of its two bytes halved on its own, which
/// is what the client sends and expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckEntry {
    pub type_byte: u8,
    pub seq_lo: u8,
    pub seq_hi: u8,
}

impl AckEntry {
    pub fn for_sequence(type_byte: u8, sequence: u16) -> Self {
        let [lo, hi] = sequence.to_le_bytes();
        Self {
            type_byte,
            seq_lo: lo / 2,
            seq_hi: hi / 2,
        }
    }

    /// The halved sequence as a single number, for keying
    pub fn halved(&self) -> u16 {
        u16::from_le_bytes([self.seq_lo, self.seq_hi])
    }
}

/// Acknowledge frame carrying `entries`
pub fn encode_ack(entries: &[AckEntry]) -> Vec<u8> {
    let payload: Vec<u8> = entries
        .iter()
        .flat_map(|e| [e.type_byte, e.seq_lo, e.seq_hi])
        .collect();
    let bits = (payload.len() * 8) as u16;

    let mut frame = header_bytes(MessageType::Acknowledge.to_byte(), 0, bits).to_vec();
    frame.extend_from_slice(&payload);
    frame
}

/// Splits an acknowledge payload into triplets, ignoring a trailing partial one
pub fn parse_acks(payload: &[u8]) -> Vec<AckEntry> {
    payload
        .chunks_exact(3)
        .map(|chunk| AckEntry {
            type_byte: chunk[0],
            seq_lo: chunk[1],
            seq_hi: chunk[2],
        })
        .collect()
}

fn header_bytes(type_byte: u8, sequence: u16, bits: u16) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0] = type_byte;
    LittleEndian::write_u16(&mut header[1..3], sequence);
    LittleEndian::write_u16(&mut header[3..5], bits);
    header
}

fn f32_bytes(value: f32) -> [u8; 4] {
    let mut bytes = [0u8; 4];
    LittleEndian::write_f32(&mut bytes, value);
    bytes
}
