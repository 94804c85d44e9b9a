//! Packet-loss simulation for resilience testing
//!
//! The gateway consults a [`PacketLoss`] strategy for every inbound frame and
//! every outbound datagram. Production runs use [`NoLoss`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Decides whether a frame or datagram should be silently dropped
pub trait PacketLoss: Send {
    fn drop_inbound(&mut self) -> bool;
    fn drop_outbound(&mut self) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoLoss;

impl PacketLoss for NoLoss {
    fn drop_inbound(&mut self) -> bool {
        false
    }

    fn drop_outbound(&mut self) -> bool {
        false
    }
}

/// Drops a fixed percentage of traffic in each direction
#[derive(Debug)]
pub struct RandomLoss {
    rng: StdRng,
    inbound_percent: u8,
    outbound_percent: u8,
}

impl RandomLoss {
    pub fn new(inbound_percent: u8, outbound_percent: u8) -> Self {
        Self::with_rng(inbound_percent, outbound_percent, StdRng::from_entropy())
    }

    /// Deterministic variant for tests
    pub fn seeded(inbound_percent: u8, outbound_percent: u8, seed: u64) -> Self {
        Self::with_rng(inbound_percent, outbound_percent, StdRng::seed_from_u64(seed))
    }

    fn with_rng(inbound_percent: u8, outbound_percent: u8, rng: StdRng) -> Self {
        Self {
            rng,
            inbound_percent: inbound_percent.min(100),
            outbound_percent: outbound_percent.min(100),
        }
    }

    fn roll(&mut self, percent: u8) -> bool {
        percent > 0 && self.rng.gen_range(0..100u8) < percent
    }
}

impl PacketLoss for RandomLoss {
    fn drop_inbound(&mut self) -> bool {
        let percent = self.inbound_percent;
        self.roll(percent)
    }

    fn drop_outbound(&mut self) -> bool {
        let percent = self.outbound_percent;
        self.roll(percent)
    }
}

/// Picks the strategy matching the configured percentages
pub fn from_percentages(inbound_percent: u8, outbound_percent: u8) -> Box<dyn PacketLoss> {
    if inbound_percent == 0 && outbound_percent == 0 {
        Box::new(NoLoss)
    } else {
        Box::new(RandomLoss::new(inbound_percent, outbound_percent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_loss_never_drops() {
        let mut loss = NoLoss;
        for _ in 0..100 {
            assert!(!loss.drop_inbound());
            assert!(!loss.drop_outbound());
        }
    }

    #[test]
    fn test_extremes() {
        let mut all = RandomLoss::seeded(100, 0, 1);
        for _ in 0..100 {
            assert!(all.drop_inbound());
            assert!(!all.drop_outbound());
        }
    }

    #[test]
    fn test_rate_is_roughly_respected() {
        let mut loss = RandomLoss::seeded(30, 30, 42);
        let dropped = (0..10_000).filter(|_| loss.drop_inbound()).count();
        assert!(dropped > 2_500 && dropped < 3_500, "dropped {}", dropped);
    }

    #[test]
    fn test_percent_is_capped() {
        let mut loss = RandomLoss::seeded(250, 250, 7);
        assert!(loss.drop_outbound());
    }
}
