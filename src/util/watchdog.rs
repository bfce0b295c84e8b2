use log::warn;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Watches the event loop for stalls. The loop resets the watchdog once per
/// iteration; a helper thread warns after `warn_millis` without a reset and
/// aborts the process after `abort_millis`. An abort period of 0 disables
/// aborting (used in tests and single-step drivers).
pub struct Watchdog {
    last_reset: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    start: Instant,
}

impl Watchdog {
    pub fn new(warn_millis: u64, abort_millis: u64) -> Self {
        let start = Instant::now();
        let last_reset = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let last_reset = last_reset.clone();
            let stop = stop.clone();
            Some(std::thread::spawn(move || {
                let mut warned_at = u64::MAX;
                while !stop.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(50));
                    let now = start.elapsed().as_millis() as u64;
                    let last = last_reset.load(Ordering::Acquire);
                    let idle = now.saturating_sub(last);
                    if abort_millis > 0 && idle > abort_millis {
                        warn!("watchdog: event loop stalled for {idle} ms, aborting");
                        std::process::abort();
                    }
                    if idle > warn_millis && warned_at != last {
                        warn!("watchdog: event loop idle for {idle} ms");
                        warned_at = last;
                    }
                }
            }))
        };
        Self { last_reset, stop, thread, start }
    }

    /// Marks the event loop as alive.
    pub fn reset(&self) {
        let now = self.start.elapsed().as_millis() as u64;
        self.last_reset.store(now, Ordering::Release);
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
