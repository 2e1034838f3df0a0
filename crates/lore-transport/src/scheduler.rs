use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Probabilistic packet dropper used to emulate lossy links.
///
/// A packet is dropped with probability `drop_rate`; each such drop is
/// followed by `drop_burst` unconditional drops.
#[derive(Debug, Clone)]
pub struct PacketScheduler {
    drop_rate: f64,
    drop_burst: u32,
    burst_remaining: u32,
    rng: StdRng,
    passed: u64,
    dropped: u64,
}

impl PacketScheduler {
    pub fn new(drop_rate: f64, drop_burst: u32) -> Self {
        Self::with_rng(drop_rate, drop_burst, StdRng::from_entropy())
    }

    /// Deterministic scheduler for reproducible runs.
    pub fn seeded(drop_rate: f64, drop_burst: u32, seed: u64) -> Self {
        Self::with_rng(drop_rate, drop_burst, StdRng::seed_from_u64(seed))
    }

    fn with_rng(drop_rate: f64, drop_burst: u32, rng: StdRng) -> Self {
        let drop_rate = if drop_rate.is_finite() {
            drop_rate.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            drop_rate,
            drop_burst,
            burst_remaining: 0,
            rng,
            passed: 0,
            dropped: 0,
        }
    }

    /// Decides the fate of the next packet. Returns true when it may be sent.
    pub fn admit(&mut self) -> bool {
        if self.burst_remaining > 0 {
            self.burst_remaining -= 1;
            self.dropped += 1;
            return false;
        }
        if self.drop_rate > 0.0 && self.rng.gen_bool(self.drop_rate) {
            self.burst_remaining = self.drop_burst;
            self.dropped += 1;
            return false;
        }
        self.passed += 1;
        true
    }

    pub fn passed(&self) -> u64 {
        self.passed
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
