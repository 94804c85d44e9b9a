//! Duplicate-flood protection
//!
//! Clients that keep retransmitting frames the server already accepted are
//! usually lagging badly. Past a threshold the session is kicked with a
//! client-visible reason.

use crate::config::DupDecay;

/// Reason sent to a peer kicked for flooding duplicates
pub const LAG_KICK_REASON: &str =
    "You were kicked for lagging the server, sorry. You can login again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Tolerate,
    Kick,
}

#[derive(Debug, Clone, Copy)]
pub struct AbusePolicy {
    threshold: u32,
    decay: DupDecay,
}

impl AbusePolicy {
    pub fn new(threshold: u32, decay: DupDecay) -> Self {
        Self { threshold, decay }
    }

    /// Counts one duplicate and decides whether the peer has had enough
    pub fn on_duplicate(&self, counter: &mut u32) -> Verdict {
        *counter = counter.saturating_add(1);
        if *counter >= self.threshold {
            Verdict::Kick
        } else {
            Verdict::Tolerate
        }
    }

    /// Lets the counter recover after an in-order frame
    pub fn on_in_order(&self, counter: &mut u32) {
        match self.decay {
            DupDecay::Reset => *counter = 0,
            DupDecay::Decrement => *counter = counter.saturating_sub(1),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}
