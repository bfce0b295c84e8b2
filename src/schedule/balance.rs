use super::request::JobRequest;
use crate::{Epoch, JobId};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One batch of volume assignments emitted by the load balancer, tagged with
/// its monotonically increasing epoch.
#[derive(Clone, Debug, PartialEq)]
pub struct Assignments {
    pub epoch: Epoch,
    pub volumes: HashMap<JobId, u32>,
}

/// The load balancer interface the scheduler consumes volumes through. The
/// balancing algorithm itself is an external concern; the scheduler only
/// assumes monotonic epochs and in-order delivery of assignments.
pub trait Balancer: Send {
    fn register_job(&mut self, job_id: JobId, demand: u32);
    fn unregister_job(&mut self, job_id: JobId);
    fn update_demand(&mut self, job_id: JobId, demand: u32);
    /// Concludes a balancing round if one is due.
    fn advance(&mut self, now: f64) -> Option<Assignments>;
    /// Whether an incoming request outranks the currently held commitment,
    /// allowing the scheduler to pre-empt it.
    fn outranks(&self, _incoming: &JobRequest, _committed: &JobRequest) -> bool {
        false
    }
}

/// A local proportional balancer for single-process fleets: each registered
/// job receives a share of the workers proportional to its demand, at least
/// one each. Every worker computes the same assignments from the same
/// demand events, so no communication is needed. Epochs conclude on a fixed
/// period whenever the demand picture changed.
pub struct ProportionalBalancer {
    num_workers: u32,
    period: f64,
    demands: BTreeMap<JobId, u32>,
    epoch: Epoch,
    dirty: bool,
    last_round: f64,
}

impl ProportionalBalancer {
    pub fn new(num_workers: u32, period: f64) -> Self {
        Self { num_workers, period, demands: BTreeMap::new(), epoch: 0, dirty: false, last_round: 0.0 }
    }
}

impl Balancer for ProportionalBalancer {
    fn register_job(&mut self, job_id: JobId, demand: u32) {
        self.demands.insert(job_id, demand.max(1));
        self.dirty = true;
    }

    fn unregister_job(&mut self, job_id: JobId) {
        if self.demands.remove(&job_id).is_some() {
            self.dirty = true;
        }
    }

    fn update_demand(&mut self, job_id: JobId, demand: u32) {
        if let Some(current) = self.demands.get_mut(&job_id) {
            if *current != demand.max(1) {
                *current = demand.max(1);
                self.dirty = true;
            }
        }
    }

    fn advance(&mut self, now: f64) -> Option<Assignments> {
        if !self.dirty || now - self.last_round < self.period {
            return None;
        }
        self.dirty = false;
        self.last_round = now;
        self.epoch += 1;

        let total: u64 = self.demands.values().map(|&d| u64::from(d)).sum();
        let volumes = self
            .demands
            .iter()
            .map(|(&job_id, &demand)| {
                let share =
                    (u64::from(self.num_workers) * u64::from(demand) / total.max(1)) as u32;
                (job_id, share.clamp(1, demand))
            })
            .collect();
        Some(Assignments { epoch: self.epoch, volumes })
    }

    fn outranks(&self, incoming: &JobRequest, committed: &JobRequest) -> bool {
        // Root requests may pre-empt a commitment to an inner node, so a
        // fresh job is never starved by growth traffic.
        incoming.requested_index == 0 && committed.requested_index > 0
    }
}

/// A balancer replaying a fixed schedule of assignment batches, released one
/// epoch at a time by the test driver. Sharing the release counter across
/// the fleet's workers models the global balancer concluding an epoch on
/// every worker.
pub struct ScriptedBalancer {
    script: Vec<Assignments>,
    released: Arc<AtomicUsize>,
    emitted: usize,
}

impl ScriptedBalancer {
    pub fn new(script: Vec<Assignments>, released: Arc<AtomicUsize>) -> Self {
        Self { script, released, emitted: 0 }
    }
}

impl Balancer for ScriptedBalancer {
    fn register_job(&mut self, _job_id: JobId, _demand: u32) {}
    fn unregister_job(&mut self, _job_id: JobId) {}
    fn update_demand(&mut self, _job_id: JobId, _demand: u32) {}

    fn advance(&mut self, _now: f64) -> Option<Assignments> {
        if self.emitted < self.released.load(Ordering::Acquire).min(self.script.len()) {
            let assignments = self.script[self.emitted].clone();
            self.emitted += 1;
            Some(assignments)
        } else {
            None
        }
    }
}
