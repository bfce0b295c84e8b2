use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A process-scoped shutdown flag, created at startup and passed by handle
/// to every component that needs to observe or trigger termination.
#[derive(Clone, Default)]
pub struct Terminator {
    flag: Arc<AtomicBool>,
}

impl Terminator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
