//! Payload serialization helpers
//!
//! Application payloads are built from little-endian integers and floats,
//! strings prefixed by a 7-bit variable-length byte count, and the vector and
//! quaternion layouts the client uses for transforms.

use crate::error::FrameError;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::time::Instant;

/// A position in world space
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// A rotation, stored in the client's x, y, z, w order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        }
    }
}

/// Reads fields sequentially out of a payload slice
pub struct PayloadReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> PayloadReader<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(payload),
        }
    }

    pub fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    pub fn remaining(&self) -> usize {
        self.cursor.get_ref().len().saturating_sub(self.position())
    }

    pub fn skip(&mut self, count: usize) -> Result<(), FrameError> {
        self.ensure(count)?;
        self.cursor.set_position((self.position() + count) as u64);
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, FrameError> {
        self.ensure(1)?;
        self.cursor.read_u8().map_err(|_| self.truncated(1))
    }

    pub fn read_u16(&mut self) -> Result<u16, FrameError> {
        self.ensure(2)?;
        self.cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| self.truncated(2))
    }

    pub fn read_u32(&mut self) -> Result<u32, FrameError> {
        self.ensure(4)?;
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| self.truncated(4))
    }

    pub fn read_f32(&mut self) -> Result<f32, FrameError> {
        self.ensure(4)?;
        self.cursor
            .read_f32::<LittleEndian>()
            .map_err(|_| self.truncated(4))
    }

    pub fn read_vector(&mut self) -> Result<Vector3, FrameError> {
        Ok(Vector3 {
            x: self.read_f32()?,
            y: self.read_f32()?,
            z: self.read_f32()?,
        })
    }

    /// Reads a 7-bit length-prefixed UTF-8 string
    pub fn read_string(&mut self) -> Result<String, FrameError> {
        let len = self.read_varint()? as usize;
        self.ensure(len)?;

        let start = self.position();
        let bytes = &self.cursor.get_ref()[start..start + len];
        let text = std::str::from_utf8(bytes)
            .map_err(|_| FrameError::InvalidString)?
            .to_string();
        self.cursor.set_position((start + len) as u64);
        Ok(text)
    }

    fn read_varint(&mut self) -> Result<u32, FrameError> {
        let mut value: u32 = 0;
        let mut shift = 0;

        loop {
            if shift > 28 {
                return Err(FrameError::InvalidString);
            }
            let byte = self.read_u8()?;
            value |= ((byte & 0x7f) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn ensure(&self, count: usize) -> Result<(), FrameError> {
        if self.remaining() < count {
            return Err(self.truncated(count));
        }
        Ok(())
    }

    fn truncated(&self, count: usize) -> FrameError {
        FrameError::Truncated {
            needed: self.position() + count,
            available: self.cursor.get_ref().len(),
        }
    }
}

/// Builds a payload field by field
///
/// Writes go into an owned buffer and cannot fail.
#[derive(Debug, Default, Clone)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a payload with its opcode byte
    pub fn with_opcode(opcode: u8) -> Self {
        let mut writer = Self::new();
        writer.put_u8(opcode);
        writer
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        let mut bytes = [0u8; 2];
        LittleEndian::write_u16(&mut bytes, value);
        self.buf.extend_from_slice(&bytes);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        let mut bytes = [0u8; 4];
        LittleEndian::write_u32(&mut bytes, value);
        self.buf.extend_from_slice(&bytes);
        self
    }

    pub fn put_f32(&mut self, value: f32) -> &mut Self {
        let mut bytes = [0u8; 4];
        LittleEndian::write_f32(&mut bytes, value);
        self.buf.extend_from_slice(&bytes);
        self
    }

    pub fn put_vector(&mut self, v: Vector3) -> &mut Self {
        self.put_f32(v.x).put_f32(v.y).put_f32(v.z)
    }

    pub fn put_quaternion(&mut self, q: Quaternion) -> &mut Self {
        self.put_f32(q.x).put_f32(q.y).put_f32(q.z).put_f32(q.w)
    }

    pub fn put_string(&mut self, text: &str) -> &mut Self {
        let mut len = text.len() as u32;
        while len >= 0x80 {
            self.buf.push((len as u8 & 0x7f) | 0x80);
            len >>= 7;
        }
        self.buf.push(len as u8);
        self.buf.extend_from_slice(text.as_bytes());
        self
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Float timestamps carried by pong and connect-response frames
///
/// Seconds elapsed since the clock was created, which is server start.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolClock {
    start: Instant,
}

impl ProtocolClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn timestamp(&self) -> f32 {
        self.start.elapsed().as_secs_f32()
    }

    pub fn timestamp_at(&self, now: Instant) -> f32 {
        now.saturating_duration_since(self.start).as_secs_f32()
    }
}

impl Default for ProtocolClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercase hex rendering used when logging unrecognised frames
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
