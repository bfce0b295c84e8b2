use std::time::Instant;

/// A process-wide clock measuring seconds since startup. The worker's event
/// loop samples it once per iteration and threads the timestamp through all
/// periodic checks, so tests can drive workers with synthetic time instead.
#[derive(Clone)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    /// Seconds elapsed since the clock was created.
    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// A periodic gate for maintenance tasks in the event loop. `ready` returns
/// true at most once per period, and fires on the first call.
pub struct Periodic {
    period: f64,
    next: Option<f64>,
}

impl Periodic {
    pub fn new(period: f64) -> Self {
        Self { period, next: None }
    }

    /// Returns true if the period has elapsed since the last ready time, and
    /// schedules the next one.
    pub fn ready(&mut self, now: f64) -> bool {
        match self.next {
            Some(next) if now < next => false,
            _ => {
                self.next = Some(now + self.period);
                true
            }
        }
    }
}
