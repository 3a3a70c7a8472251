use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Detects a capture stream that has silently stopped delivering data.
///
/// The producer calls [`feed`] from its data callback; a monitor thread
/// trips [`is_triggered`] once no feed arrives within the timeout. The
/// owning source treats a trip as losing its device.
///
/// [`feed`]: StallWatchdog::feed
/// [`is_triggered`]: StallWatchdog::is_triggered
#[derive(Clone)]
pub struct StallWatchdog {
    timeout: Duration,
    epoch: Instant,
    last_feed_ms: Arc<AtomicU64>,
    triggered: Arc<AtomicBool>,
}

impl StallWatchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            epoch: Instant::now(),
            last_feed_ms: Arc::new(AtomicU64::new(0)),
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn feed(&self) {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        self.last_feed_ms.store(now_ms, Ordering::Relaxed);
        self.triggered.store(false, Ordering::Relaxed);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Relaxed)
    }

    /// Spawns the monitor thread; it exits when `running` clears.
    pub fn spawn_monitor(&self, running: Arc<AtomicBool>) -> JoinHandle<()> {
        let timeout_ms = self.timeout.as_millis() as u64;
        let epoch = self.epoch;
        let last_feed_ms = Arc::clone(&self.last_feed_ms);
        let triggered = Arc::clone(&self.triggered);

        // Seed so a stream that never produces still times out.
        self.feed();

        thread::Builder::new()
            .name("stall-watchdog".to_string())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(250));
                    let now_ms = epoch.elapsed().as_millis() as u64;
                    let last = last_feed_ms.load(Ordering::Relaxed);
                    if now_ms.saturating_sub(last) > timeout_ms
                        && !triggered.swap(true, Ordering::Relaxed)
                    {
                        tracing::error!(
                            stalled_ms = now_ms.saturating_sub(last),
                            "no data from capture stream"
                        );
                    }
                }
            })
            .expect("failed to spawn watchdog thread")
    }
}
