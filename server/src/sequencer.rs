//! Per-session sequence bookkeeping
//!
//! Inbound, every ordered-reliable frame is classified against the last
//! sequence accepted on its channel. Sequences advance by 2, so a jump of more
//! than 2 leaves gaps that are remembered as missing and accepted later when
//! the client retransmits them.
//!
//! Outbound, each session keeps one counter per ordered channel plus one for
//! unreliable traffic.

use log::warn;
use shared::{MessageType, OUTBOUND_COUNTERS, RELIABLE_CHANNELS, UNRELIABLE_SLOT};
use std::collections::HashSet;

/// Distance between consecutive reliable sequences
pub const RELIABLE_STEP: u16 = 2;

/// Most missing sequences remembered per session, across all channels
///
/// Past this, a gap only records the sequences closest to the frame that
/// opened it.
pub const MAX_MISSING: usize = 4096;

/// Outcome of classifying one received reliable frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Next expected sequence, or the first frame seen on a channel
    InOrder,
    /// Accepted after a jump; `skipped` sequences were marked missing
    GapAccepted { skipped: usize },
    /// A previously missing sequence arrived
    RetransmissionFill,
    /// Already seen; acknowledge but do not deliver
    Duplicate,
}

impl Classification {
    /// Whether the frame should be handed to dispatch
    pub fn is_accepted(self) -> bool {
        !matches!(self, Classification::Duplicate)
    }
}

#[derive(Debug, Default)]
pub struct ChannelSequencer {
    last_accepted: [Option<u16>; RELIABLE_CHANNELS],
    missing: HashSet<(u8, u16)>,
}

impl ChannelSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies `sequence` on zero-based `channel` and updates state
    ///
    /// A channel that has accepted nothing yet takes any sequence. Gaps are
    /// measured from zero in that case, so a first frame of 4 leaves 2 missing.
    pub fn classify(&mut self, channel: u8, sequence: u16) -> Classification {
        let index = channel as usize % RELIABLE_CHANNELS;
        let channel = index as u8;

        if let Some(last) = self.last_accepted[index] {
            if sequence <= last {
                if self.missing.remove(&(channel, sequence)) {
                    return Classification::RetransmissionFill;
                }
                return Classification::Duplicate;
            }
        }

        let base = self.last_accepted[index].unwrap_or(0) as u32;
        let step = RELIABLE_STEP as u32;
        self.last_accepted[index] = Some(sequence);

        if sequence as u32 > base + step {
            let skipped = ((sequence as u32 - base - 1) / step) as usize;
            self.mark_missing(channel, base, sequence as u32, skipped);
            return Classification::GapAccepted { skipped };
        }

        Classification::InOrder
    }

    /// Records the sequences strictly between `base` and `sequence`
    ///
    /// When the set is near full only the newest ones are kept.
    fn mark_missing(&mut self, channel: u8, base: u32, sequence: u32, skipped: usize) {
        let step = RELIABLE_STEP as u32;
        let room = MAX_MISSING.saturating_sub(self.missing.len());
        let tracked = skipped.min(room);
        if tracked < skipped {
            warn!(
                "Missing set full; {} skipped sequences on channel {} not tracked",
                skipped - tracked,
                channel + 1
            );
        }

        let mut gap = base + step * (skipped - tracked) as u32 + step;
        while gap < sequence {
            self.missing.insert((channel, gap as u16));
            gap += step;
        }
    }

    /// Last sequence accepted on `channel`, zero when nothing was accepted
    pub fn last_accepted(&self, channel: u8) -> u16 {
        self.last_accepted[channel as usize % RELIABLE_CHANNELS].unwrap_or(0)
    }

    pub fn has_accepted(&self, channel: u8) -> bool {
        self.last_accepted[channel as usize % RELIABLE_CHANNELS].is_some()
    }

    pub fn is_missing(&self, channel: u8, sequence: u16) -> bool {
        self.missing.contains(&(channel, sequence))
    }

    pub fn missing_count(&self) -> usize {
        self.missing.len()
    }

    pub fn reset(&mut self) {
        self.last_accepted = [None; RELIABLE_CHANNELS];
        self.missing.clear();
    }
}

/// Outbound sequence counters for one session
#[derive(Debug, Clone)]
pub struct OutboundSequences {
    counters: [u16; OUTBOUND_COUNTERS],
}

impl Default for OutboundSequences {
    fn default() -> Self {
        Self {
            counters: [0; OUTBOUND_COUNTERS],
        }
    }
}

impl OutboundSequences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the sequence to stamp on the next frame of type `ty`
    ///
    /// Ordered channels step by 2 and unreliable traffic by 1. Control
    /// frames are not sequenced and always get zero.
    pub fn next(&mut self, ty: MessageType) -> u16 {
        let (slot, step) = match ty {
            MessageType::ReliableOrdered(channel) => {
                (channel as usize % RELIABLE_CHANNELS, RELIABLE_STEP)
            }
            MessageType::Unreliable => (UNRELIABLE_SLOT, 1),
            _ => return 0,
        };

        let sequence = self.counters[slot];
        self.counters[slot] = sequence.wrapping_add(step);
        sequence
    }

    pub fn peek(&self, ty: MessageType) -> u16 {
        match ty {
            MessageType::ReliableOrdered(channel) => {
                self.counters[channel as usize % RELIABLE_CHANNELS]
            }
            MessageType::Unreliable => self.counters[UNRELIABLE_SLOT],
            _ => 0,
        }
    }

    pub fn reset(&mut self) {
        self.counters = [0; OUTBOUND_COUNTERS];
    }

    pub fn is_reset(&self) -> bool {
        self.counters.iter().all(|&c| c == 0)
    }
}
