use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default averaging window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

/// Sliding-window byte counter.
#[derive(Debug, Clone)]
pub struct BandwidthMonitor {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    total: u64,
}

impl Default for BandwidthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl BandwidthMonitor {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            samples: VecDeque::new(),
            total: 0,
        }
    }

    pub fn record(&mut self, bytes: usize) {
        self.record_at(Instant::now(), bytes);
    }

    pub fn record_at(&mut self, now: Instant, bytes: usize) {
        self.expire(now);
        let bytes = bytes as u64;
        self.samples.push_back((now, bytes));
        self.total = self.total.saturating_add(bytes);
    }

    pub fn bytes_per_second(&mut self) -> u64 {
        self.bytes_per_second_at(Instant::now())
    }

    /// Bytes seen inside the window divided by the window length.
    pub fn bytes_per_second_at(&mut self, now: Instant) -> u64 {
        self.expire(now);
        (self.total as f64 / self.window.as_secs_f64()) as u64
    }

    /// How long a sender must pause before `next` more bytes keep it at or
    /// below `limit` bytes per second. Zero when unlimited or under budget.
    pub fn throttle_delay_at(&mut self, now: Instant, next: usize, limit: u64) -> Duration {
        if limit == 0 {
            return Duration::ZERO;
        }
        self.expire(now);
        let budget = limit as f64 * self.window.as_secs_f64();
        let pending = self.total.saturating_add(next as u64) as f64;
        if pending <= budget {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((pending - budget) / limit as f64).min(self.window)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.total = 0;
    }

    fn expire(&mut self, now: Instant) {
        while let Some((at, bytes)) = self.samples.front().copied() {
            if now.saturating_duration_since(at) < self.window {
                break;
            }
            self.samples.pop_front();
            self.total = self.total.saturating_sub(bytes);
        }
    }
}
