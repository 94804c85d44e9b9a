//! Outgoing frame coalescing
//!
//! Ordered frames for one peer are appended to a buffer and written as one
//! datagram when the flush deadline passes. Every push moves the deadline
//! forward. A push that would take the buffer past the size limit flushes the
//! previous contents first, so no datagram built here carries more than the
//! limit unless a single frame is already larger.
//!
//! The coalescer owns no timer. The network loop asks for the earliest
//! deadline across sessions and calls [`SendCoalescer::poll`] when it fires.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct SendCoalescer {
    buffer: Vec<u8>,
    deadline: Option<Instant>,
    limit: usize,
    delay: Duration,
}

impl SendCoalescer {
    pub fn new(limit: usize, delay: Duration) -> Self {
        Self {
            buffer: Vec::with_capacity(limit),
            deadline: None,
            limit,
            delay,
        }
    }

    /// Appends `frame`, returning a datagram to write right away if the
    /// previous contents had to be flushed to make room
    pub fn push(&mut self, frame: &[u8], now: Instant) -> Option<Vec<u8>> {
        let flushed = if !self.buffer.is_empty() && self.buffer.len() + frame.len() > self.limit
        {
            self.take()
        } else {
            None
        };

        self.buffer.extend_from_slice(frame);
        self.deadline = Some(now + self.delay);
        flushed
    }

    /// Returns the buffered datagram if its deadline has passed
    pub fn poll(&mut self, now: Instant) -> Option<Vec<u8>> {
        match self.deadline {
            Some(deadline) if deadline <= now => self.take(),
            _ => None,
        }
    }

    /// Empties the buffer regardless of the deadline
    pub fn take(&mut self) -> Option<Vec<u8>> {
        self.deadline = None;
        if self.buffer.is_empty() {
            return None;
        }
        Some(std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(self.limit),
        ))
    }

    /// Drops pending frames and cancels the deadline
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
