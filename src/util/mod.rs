pub mod permutation;
pub mod terminator;
pub mod threadpool;
pub mod timer;
pub mod watchdog;

pub use permutation::AdjustablePermutation;
pub use terminator::Terminator;
pub use threadpool::ThreadPool;
pub use timer::{Clock, Periodic};
pub use watchdog::Watchdog;
