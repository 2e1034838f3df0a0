use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::adapter::TransportAdapter;
use crate::transport::Transport;

/// Packets drained per tick before flushing modifieds.
const MAX_PACKETS_PER_TICK: usize = 256;
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Background thread that pumps inbound packets and flushes pending
/// modifieds on the transport's poll interval.
pub struct TransportRunner {
    running: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl TransportRunner {
    pub fn spawn<A>(transport: Arc<Transport<A>>) -> Self
    where
        A: TransportAdapter + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let ticks = Arc::new(AtomicU64::new(0));
        let interval = transport.settings().poll_interval().max(MIN_POLL_INTERVAL);

        let worker_running = Arc::clone(&running);
        let worker_ticks = Arc::clone(&ticks);
        let worker = thread::spawn(move || {
            debug!("transport runner: started for {}", transport.originator());
            while worker_running.load(Ordering::Acquire) {
                if let Err(err) = transport.pump(MAX_PACKETS_PER_TICK) {
                    warn!("transport runner: receive failed: {err}");
                }
                if let Err(err) = transport.knowledge_base().send_modifieds() {
                    warn!("transport runner: send failed: {err}");
                }
                worker_ticks.fetch_add(1, Ordering::Relaxed);
                thread::sleep(interval);
            }
            debug!("transport runner: stopped for {}", transport.originator());
        });

        Self {
            running,
            ticks,
            worker: Some(worker),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Completed loop iterations.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Signals the thread and waits for it to exit.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for TransportRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use lore_core::Record;
    use lore_engine::{EvalSettings, KnowledgeBase};

    use super::TransportRunner;
    use crate::adapter::InMemoryAdapter;
    use crate::settings::TransportSettings;
    use crate::transport::Transport;

    #[test]
    fn runner_flushes_delayed_writes_and_stops() {
        let kb = KnowledgeBase::with_id("agent.0");
        let transport = Transport::new(
            &kb,
            TransportSettings {
                poll_interval_secs: 0.005,
                ..TransportSettings::default()
            },
            InMemoryAdapter::default(),
        )
        .expect("transport should build");
        let mut runner = TransportRunner::spawn(transport.clone());
        assert!(runner.is_running());

        kb.set_with("x", Record::integer(1).into_value(), &EvalSettings::delayed())
            .expect("delayed set should succeed");
        let deadline = Instant::now() + Duration::from_secs(5);
        while transport.stats().sent_packets == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(transport.stats().sent_packets, 1);

        runner.stop();
        assert!(!runner.is_running());
        let ticks = runner.ticks();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(runner.ticks(), ticks);
    }
}
