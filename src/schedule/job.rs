use super::request::{AppKind, JobDescription, JobRequest, JobResult};
use super::tree::JobTree;
use crate::app::Application;
use crate::error::{Error, Result};
use crate::{Epoch, JobId, Rank, Revision};

use log::debug;
use std::sync::Arc;

/// The lifecycle state of a job node on this worker. A job enters the
/// database as Inactive on the first relevant message and leaves via
/// termination (Past) or forgetting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    /// Resident but neither committed nor running.
    Inactive,
    /// Reserved for a specific (job, index) slot by an adoption handshake.
    Committed,
    /// Running its application backend.
    Active,
    /// Paused after a shrink; a dormant copy kept for fast reactivation.
    Suspended,
    /// Terminated; kept only until destructible.
    Past,
}

/// One job's per-worker view: its state, tree position, description
/// revisions, volume, and application backend.
pub struct Job {
    id: JobId,
    kind: AppKind,
    state: JobState,
    tree: JobTree,
    commitment: Option<JobRequest>,
    /// Highest description revision present; -1 before the first transfer.
    revision: Revision,
    desired_revision: Revision,
    volume: u32,
    last_demand: u32,
    result_transfer_pending: bool,
    /// Highest revision a result was accepted for; -1 for none.
    solved_revision: Revision,
    /// Serialized description revisions, shared for cheap re-sending.
    revisions: Vec<Arc<Vec<u8>>>,
    /// Decoded metadata of revision 0.
    desc: Option<JobDescription>,
    app: Option<Box<dyn Application>>,
    epoch_of_last_commitment: Epoch,
    time_of_activation: f64,
    time_of_first_volume_update: Option<f64>,
    used_cpu_seconds: f64,
    cpu_accounted_until: f64,
    /// Last state change, used by the eviction policy.
    last_activity: f64,
    /// Children waiting for a description revision this worker does not have
    /// yet.
    waiting_for_revision: Vec<(Rank, Revision)>,
}

impl Job {
    pub fn new(
        id: JobId,
        kind: AppKind,
        num_workers: u32,
        identity_tree: bool,
        now: f64,
    ) -> Self {
        Self {
            id,
            kind,
            state: JobState::Inactive,
            tree: JobTree::new(num_workers, id, identity_tree),
            commitment: None,
            revision: -1,
            desired_revision: 0,
            volume: 0,
            last_demand: 0,
            result_transfer_pending: false,
            solved_revision: -1,
            revisions: Vec::new(),
            desc: None,
            app: None,
            epoch_of_last_commitment: -1,
            time_of_activation: 0.0,
            time_of_first_volume_update: None,
            used_cpu_seconds: 0.0,
            cpu_accounted_until: 0.0,
            last_activity: now,
            waiting_for_revision: Vec::new(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> AppKind {
        self.kind
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn tree(&self) -> &JobTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut JobTree {
        &mut self.tree
    }

    pub fn index(&self) -> crate::Index {
        self.tree.index()
    }

    /// Whether this worker holds a suspended copy that could be reactivated
    /// without a description transfer.
    pub fn is_dormant(&self) -> bool {
        self.state == JobState::Suspended
    }

    /// Whether this worker holds the job's dormant root.
    pub fn is_dormant_root(&self) -> bool {
        self.is_dormant() && self.tree.is_root()
    }

    // Commitment.

    pub fn has_commitment(&self) -> bool {
        self.commitment.is_some()
    }

    pub fn commitment(&self) -> Option<&JobRequest> {
        self.commitment.as_ref()
    }

    /// Reserves this worker for the request's slot and takes the position in
    /// the tree.
    pub fn commit(&mut self, req: JobRequest, now: f64) {
        self.tree.place(req.requested_index, req.requesting_rank, req.root_rank);
        self.desired_revision = self.desired_revision.max(req.current_revision);
        self.epoch_of_last_commitment = req.balancing_epoch;
        self.commitment = Some(req);
        if self.state == JobState::Inactive {
            self.state = JobState::Committed;
        }
        self.last_activity = now;
    }

    /// Drops the commitment, falling back to Inactive or to the dormant
    /// Suspended state.
    pub fn uncommit(&mut self, now: f64) -> Option<JobRequest> {
        if self.state == JobState::Committed {
            self.state = JobState::Inactive;
        }
        self.last_activity = now;
        self.commitment.take()
    }

    pub fn epoch_of_last_commitment(&self) -> Epoch {
        self.epoch_of_last_commitment
    }

    // Description revisions.

    pub fn has_description(&self) -> bool {
        !self.revisions.is_empty()
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn desired_revision(&self) -> Revision {
        self.desired_revision
    }

    pub fn set_desired_revision(&mut self, revision: Revision) {
        self.desired_revision = self.desired_revision.max(revision);
    }

    pub fn description(&self) -> Option<&JobDescription> {
        self.desc.as_ref()
    }

    /// Appends the next serialized description revision. Returns false for a
    /// revision this worker already has; a gap is an error since revisions
    /// are transferred strictly in order.
    pub fn append_revision(&mut self, data: Vec<u8>) -> Result<bool> {
        let desc = JobDescription::from_bytes(&data)?;
        if desc.job_id != self.id {
            return Err(Error::BadRequest(format!(
                "description of job #{} delivered to job #{}",
                desc.job_id, self.id
            )));
        }
        let next = self.revisions.len() as Revision;
        if desc.revision < next {
            debug!("job #{} already has revision {}", self.id, desc.revision);
            return Ok(false);
        }
        if desc.revision > next {
            return Err(Error::BadRequest(format!(
                "job #{} received revision {} but expects {next}",
                self.id, desc.revision
            )));
        }
        self.revision = desc.revision;
        if let Some(app) = &mut self.app {
            app.append_revision(&desc)?;
        }
        if self.desc.is_none() {
            self.desc = Some(desc);
        }
        self.revisions.push(Arc::new(data));
        Ok(true)
    }

    pub fn serialized_revision(&self, revision: Revision) -> Option<Arc<Vec<u8>>> {
        usize::try_from(revision).ok().and_then(|r| self.revisions.get(r)).cloned()
    }

    pub fn waiting_for_revision(&mut self) -> &mut Vec<(Rank, Revision)> {
        &mut self.waiting_for_revision
    }

    // Execution.

    /// Moves the job to Active, starting the application backend.
    pub fn execute(&mut self, mut app: Box<dyn Application>, now: f64) -> Result<()> {
        let desc = self
            .desc
            .as_ref()
            .ok_or_else(|| Error::BadRequest(format!("executing job #{} without description", self.id)))?;
        app.start(desc, now)?;
        // Replay any further revisions that arrived before execution.
        for data in &self.revisions[1..] {
            app.append_revision(&JobDescription::from_bytes(data)?)?;
        }
        self.app = Some(app);
        self.state = JobState::Active;
        self.time_of_activation = now;
        self.cpu_accounted_until = now;
        self.last_activity = now;
        Ok(())
    }

    /// Moves a suspended job back to Active without a description transfer.
    pub fn reactivate(&mut self, now: f64) {
        if let Some(app) = &mut self.app {
            app.resume(now);
        }
        self.state = JobState::Active;
        self.cpu_accounted_until = now;
        self.last_activity = now;
    }

    pub fn suspend(&mut self, now: f64) {
        self.account_cpu(now);
        if let Some(app) = &mut self.app {
            app.suspend(now);
        }
        self.state = JobState::Suspended;
        self.last_activity = now;
    }

    pub fn terminate(&mut self, now: f64) {
        self.account_cpu(now);
        if let Some(app) = &mut self.app {
            app.terminate();
        }
        self.state = JobState::Past;
        self.last_activity = now;
    }

    pub fn app(&self) -> Option<&dyn Application> {
        self.app.as_deref()
    }

    pub fn app_mut(&mut self) -> Option<&mut (dyn Application + 'static)> {
        self.app.as_deref_mut()
    }

    pub fn is_destructible(&self) -> bool {
        self.app.as_ref().map_or(true, |app| app.is_destructible())
    }

    pub fn wants_to_communicate(&self) -> bool {
        self.app.as_ref().is_some_and(|app| app.wants_to_communicate())
    }

    /// Lets the backend emit its tree-internal traffic.
    pub fn communicate(&mut self) -> Vec<(Rank, super::request::JobMessage)> {
        match &mut self.app {
            Some(app) => app.communicate(&self.tree),
            None => Vec::new(),
        }
    }

    // Volume and demand.

    pub fn volume(&self) -> u32 {
        self.volume
    }

    /// Applies a new volume and charges the CPU spent under the old one.
    pub fn update_volume(&mut self, volume: u32, now: f64) {
        self.account_cpu(now);
        self.volume = volume;
        if self.time_of_first_volume_update.is_none() && self.state == JobState::Active {
            self.time_of_first_volume_update = Some(now);
        }
    }

    fn account_cpu(&mut self, now: f64) {
        if self.state == JobState::Active {
            self.used_cpu_seconds += f64::from(self.volume) * (now - self.cpu_accounted_until);
        }
        self.cpu_accounted_until = now;
    }

    /// The number of workers this job wants, growing along full binary trees
    /// over time: 1, 3, 7, ... up to the fleet size and the backend's cap.
    pub fn demand(&self, now: f64, num_workers: u32, growth_period: f64) -> u32 {
        if self.state != JobState::Active {
            return 0;
        }
        let cap = self.app.as_ref().map_or(u32::MAX, |app| app.max_demand()).min(num_workers);
        if growth_period <= 0.0 {
            return cap;
        }
        let steps = ((now - self.time_of_activation) / growth_period) as u32;
        let full_tree = (1u32 << (steps + 1).min(31)).saturating_sub(1);
        full_tree.min(cap)
    }

    pub fn last_demand(&self) -> u32 {
        self.last_demand
    }

    pub fn set_last_demand(&mut self, demand: u32) {
        self.last_demand = demand;
    }

    // Results.

    pub fn result_transfer_pending(&self) -> bool {
        self.result_transfer_pending
    }

    pub fn set_result_transfer_pending(&mut self, pending: bool) {
        self.result_transfer_pending = pending;
    }

    pub fn set_revision_solved(&mut self, revision: Revision) {
        self.solved_revision = self.solved_revision.max(revision);
    }

    pub fn is_revision_solved(&self, revision: Revision) -> bool {
        self.solved_revision >= revision
    }

    pub fn result(&self) -> Option<JobResult> {
        self.app.as_ref().map(|app| app.result())
    }

    // Statistics.

    pub fn age_since_activation(&self, now: f64) -> f64 {
        now - self.time_of_activation
    }

    pub fn used_cpu_seconds(&self, now: f64) -> f64 {
        let running = if self.state == JobState::Active {
            f64::from(self.volume) * (now - self.cpu_accounted_until)
        } else {
            0.0
        };
        self.used_cpu_seconds + running
    }

    pub fn latency_of_first_volume_update(&self) -> f64 {
        self.time_of_first_volume_update
            .map_or(0.0, |t| t - self.time_of_activation)
    }

    pub fn last_activity(&self) -> f64 {
        self.last_activity
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "#{}:{}", self.id, self.tree.index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::demo::DemoJob;

    fn description(revision: Revision) -> JobDescription {
        JobDescription {
            job_id: 1,
            application: AppKind::Demo,
            client_rank: 0,
            priority: 1.0,
            incremental: true,
            wallclock_limit: 0.0,
            cpu_limit: 0.0,
            revision,
            payload: vec![-1],
        }
    }

    fn job() -> Job {
        Job::new(1, AppKind::Demo, 8, false, 0.0)
    }

    #[test]
    fn revisions_append_in_order() {
        let mut job = job();
        assert!(!job.has_description());
        assert!(job.append_revision(description(0).to_bytes().unwrap()).unwrap());
        assert_eq!(job.revision(), 0);
        // A replayed revision is ignored, a gap is rejected.
        assert!(!job.append_revision(description(0).to_bytes().unwrap()).unwrap());
        assert!(job.append_revision(description(2).to_bytes().unwrap()).is_err());
        assert!(job.append_revision(description(1).to_bytes().unwrap()).unwrap());
        assert_eq!(job.revision(), 1);
        assert!(job.serialized_revision(1).is_some());
        assert!(job.serialized_revision(2).is_none());
    }

    #[test]
    fn lifecycle_transitions() {
        let mut job = job();
        job.append_revision(description(0).to_bytes().unwrap()).unwrap();
        job.execute(Box::new(DemoJob::new()), 1.0).unwrap();
        assert_eq!(job.state(), JobState::Active);
        job.suspend(2.0);
        assert_eq!(job.state(), JobState::Suspended);
        assert!(job.is_dormant());
        job.reactivate(3.0);
        assert_eq!(job.state(), JobState::Active);
        job.terminate(4.0);
        assert_eq!(job.state(), JobState::Past);
    }

    #[test]
    fn cpu_accounting_follows_volume() {
        let mut job = job();
        job.append_revision(description(0).to_bytes().unwrap()).unwrap();
        job.execute(Box::new(DemoJob::new()), 0.0).unwrap();
        job.update_volume(4, 0.0);
        assert_eq!(job.used_cpu_seconds(10.0), 40.0);
        job.update_volume(2, 10.0);
        assert_eq!(job.used_cpu_seconds(15.0), 50.0);
        job.suspend(20.0);
        assert_eq!(job.used_cpu_seconds(100.0), 60.0);
    }

    #[test]
    fn demand_grows_along_full_trees() {
        let mut job = job();
        job.append_revision(description(0).to_bytes().unwrap()).unwrap();
        assert_eq!(job.demand(5.0, 8, 1.0), 0); // not active yet
        job.execute(Box::new(DemoJob::new()), 0.0).unwrap();
        assert_eq!(job.demand(0.0, 8, 1.0), 1);
        assert_eq!(job.demand(1.0, 8, 1.0), 3);
        assert_eq!(job.demand(2.0, 8, 1.0), 7);
        assert_eq!(job.demand(3.0, 8, 1.0), 8); // capped by fleet size
        assert_eq!(job.demand(100.0, 8, 0.0), 8);
    }

    #[test]
    fn commitment_roundtrip() {
        let mut job = job();
        let req = JobRequest {
            job_id: 1,
            application: AppKind::Demo,
            root_rank: 0,
            requesting_rank: 2,
            requested_index: 5,
            current_revision: 0,
            last_known_revision: -1,
            time_of_birth: 0.0,
            num_hops: 3,
            balancing_epoch: 1,
        };
        job.commit(req.clone(), 1.0);
        assert_eq!(job.state(), JobState::Committed);
        assert!(job.has_commitment());
        assert_eq!(job.index(), 5);
        assert_eq!(job.tree().parent_rank(), 2);
        assert_eq!(job.epoch_of_last_commitment(), 1);
        let taken = job.uncommit(2.0).unwrap();
        assert!(taken.matches_commitment(&req));
        assert_eq!(job.state(), JobState::Inactive);
    }
}
