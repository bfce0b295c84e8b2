//! The application interface the scheduler drives jobs through. Backends
//! (SAT portfolios, clustering, the built-in demo solver) are opaque to the
//! scheduler: it starts, suspends, resumes, and terminates them, polls for a
//! result, and relays their tree-internal messages, but never inspects their
//! state.

pub mod demo;

use crate::error::{Error, Result};
use crate::schedule::{AppKind, JobDescription, JobMessage, JobResult, JobTree};
use crate::Rank;

use std::collections::HashMap;

/// One job's application backend. All calls come from the worker's event
/// loop; implementations must never block. Long-running work belongs on
/// helper threads whose completion the implementation observes through
/// atomics polled in `communicate`.
pub trait Application {
    /// Starts solving the given description.
    fn start(&mut self, desc: &JobDescription, now: f64) -> Result<()>;
    /// Pauses solving; the job node became suspended.
    fn suspend(&mut self, now: f64);
    /// Resumes solving after a suspension.
    fn resume(&mut self, now: f64);
    /// Stops solving for good.
    fn terminate(&mut self);
    /// Appends a further description revision of an incremental job.
    fn append_revision(&mut self, desc: &JobDescription) -> Result<()>;
    /// Polls for a result code. None while unsolved.
    fn solved(&self, now: f64) -> Option<i32>;
    /// The result of a solved job.
    fn result(&self) -> JobResult;
    /// The number of workers this job could currently make use of.
    fn max_demand(&self) -> u32 {
        u32::MAX
    }
    /// Whether the backend has tree-internal traffic to emit.
    fn wants_to_communicate(&self) -> bool {
        false
    }
    /// Emits tree-internal messages, e.g. for sharing learned state.
    fn communicate(&mut self, _tree: &JobTree) -> Vec<(Rank, JobMessage)> {
        Vec::new()
    }
    /// Delivers a tree-internal message from another node of this job.
    fn handle_message(&mut self, source: Rank, msg: JobMessage);
    /// Logs backend statistics.
    fn dump_stats(&self) {}
    /// Whether all backend resources can be released right now.
    fn is_destructible(&self) -> bool {
        true
    }
    /// Tells the backend to shed memory under pressure.
    fn memory_panic(&mut self) {}
}

/// A factory producing application instances of one kind.
pub type AppFactory = Box<dyn Fn() -> Box<dyn Application> + Send>;

/// The set of application backends a worker can run, keyed by the kind
/// carried in job requests.
#[derive(Default)]
pub struct AppRegistry {
    factories: HashMap<AppKind, AppFactory>,
}

impl AppRegistry {
    /// A registry with all built-in applications.
    pub fn standard() -> Self {
        let mut registry = Self::default();
        registry
            .register(AppKind::Demo, Box::new(|| Box::new(demo::DemoJob::new()) as Box<dyn Application>));
        registry
    }

    pub fn register(&mut self, kind: AppKind, factory: AppFactory) {
        self.factories.insert(kind, factory);
    }

    pub fn create(&self, kind: AppKind) -> Result<Box<dyn Application>> {
        match self.factories.get(&kind) {
            Some(factory) => Ok(factory()),
            None => Err(Error::BadRequest(format!("no application registered for {kind:?}"))),
        }
    }
}
