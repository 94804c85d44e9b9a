//! Acknowledgement tracking for reliable sends
//!
//! Nothing is retransmitted from here. The ledger only records which ordered
//! frames the peer has not confirmed yet, keyed the way acknowledgements
//! arrive (type byte plus halved sequence bytes), so the state can be logged
//! and inspected.

use log::trace;
use shared::AckEntry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct AckLedger {
    outstanding: HashMap<AckEntry, Instant>,
    awaiting_handshake: bool,
}

impl AckLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a reliable frame that was just queued for sending
    pub fn record_send(&mut self, type_byte: u8, sequence: u16, now: Instant) {
        self.outstanding
            .insert(AckEntry::for_sequence(type_byte, sequence), now);
    }

    /// Removes every outstanding send matched by `entries`
    ///
    /// Returns how many entries matched.
    pub fn on_ack(&mut self, entries: &[AckEntry]) -> usize {
        let mut matched = 0;
        for entry in entries {
            if self.outstanding.remove(entry).is_some() {
                matched += 1;
            } else {
                trace!(
                    "Ack for unknown send type 0x{:02x} seq {}",
                    entry.type_byte,
                    entry.halved()
                );
            }
        }
        matched
    }

    /// Marks that a connect response went out and the peer owes us a
    /// connection-established
    pub fn expect_handshake(&mut self) {
        self.awaiting_handshake = true;
    }

    /// Clears the pending handshake; returns whether one was pending
    pub fn complete_handshake(&mut self) -> bool {
        std::mem::replace(&mut self.awaiting_handshake, false)
    }

    pub fn awaiting_handshake(&self) -> bool {
        self.awaiting_handshake
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_outstanding(&self, type_byte: u8, sequence: u16) -> bool {
        self.outstanding
            .contains_key(&AckEntry::for_sequence(type_byte, sequence))
    }

    /// Age of the oldest unconfirmed send
    pub fn oldest_unacked(&self, now: Instant) -> Option<Duration> {
        self.outstanding
            .values()
            .min()
            .map(|sent| now.saturating_duration_since(*sent))
    }

    pub fn clear(&mut self) {
        self.outstanding.clear();
        self.awaiting_handshake = false;
    }
}
