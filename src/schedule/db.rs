use super::balance::{Assignments, Balancer};
use super::job::{Job, JobState};
use super::request::{AppKind, JobRequest};
use crate::app::Application;
use crate::error::Result;
use crate::{Epoch, JobId, Rank};

use log::{debug, info};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// How a job request reached this worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestMode {
    /// Bounced across the fleet; any receiver may adopt or bounce on.
    Normal,
    /// Sent directly to a dormant child, which must accept or explicitly
    /// decline.
    TargetedRejoin,
}

/// The outcome of adoption policy for an incoming request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Adoption {
    /// Adopt; this worker is idle.
    FromIdle,
    /// Adopt, pre-empting the current commitment to the given job.
    ReplaceCurrent(JobId),
    /// Do not adopt.
    Reject,
}

/// How long a request rejected during an in-flight handshake for the same
/// job is parked before it is bounced onward.
const DEFER_DELAY: f64 = 0.05;

/// How long an inactive job without commitment stays resident before it is
/// eligible for eviction.
const STALE_JOB_AGE: f64 = 60.0;

/// The per-worker job store: all resident jobs, the single commitment slot,
/// the volume cache fed by the balancer, and the request queues that bridge
/// epochs. All adoption policy lives here; message traffic does not.
pub struct JobDatabase {
    rank: Rank,
    num_workers: u32,
    /// Mono mode: job trees use the identity permutation.
    identity_tree: bool,
    job_cache_size: usize,
    jobs: HashMap<JobId, Job>,
    /// The job this worker is committed to, if any. At most one at any
    /// instant.
    committed: Option<JobId>,
    /// The job this worker is running, if any. At most one at any instant.
    active: Option<JobId>,
    balancer: Box<dyn Balancer>,
    epoch: Epoch,
    /// Last known volume per job, with the epoch it was assigned under.
    volumes: HashMap<JobId, (u32, Epoch)>,
    /// Fresh root requests, activated when their first volume arrives.
    root_requests: HashMap<JobId, JobRequest>,
    /// A root request this worker could not adopt right away, retried from
    /// the periodic job check.
    pending_root_reactivation: Option<JobRequest>,
    /// Requests parked while a handshake for the same job is in flight.
    deferred: VecDeque<(f64, Rank, JobRequest)>,
    /// Requests from future epochs, drained in (epoch, arrival) order once
    /// their epoch becomes current.
    future: BTreeMap<(Epoch, u64), (Rank, RequestMode, JobRequest)>,
    arrivals: u64,
}

impl JobDatabase {
    pub fn new(
        rank: Rank,
        num_workers: u32,
        identity_tree: bool,
        job_cache_size: usize,
        balancer: Box<dyn Balancer>,
    ) -> Self {
        Self {
            rank,
            num_workers,
            identity_tree,
            job_cache_size,
            jobs: HashMap::new(),
            committed: None,
            active: None,
            balancer,
            epoch: 0,
            volumes: HashMap::new(),
            root_requests: HashMap::new(),
            pending_root_reactivation: None,
            deferred: VecDeque::new(),
            future: BTreeMap::new(),
            arrivals: 0,
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn num_workers(&self) -> u32 {
        self.num_workers
    }

    // Job access.

    pub fn has(&self, job_id: JobId) -> bool {
        self.jobs.contains_key(&job_id)
    }

    pub fn get(&self, job_id: JobId) -> Option<&Job> {
        self.jobs.get(&job_id)
    }

    pub fn get_mut(&mut self, job_id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&job_id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn create_job(&mut self, job_id: JobId, kind: AppKind, now: f64) -> &mut Job {
        debug!("creating job #{job_id}");
        self.jobs
            .entry(job_id)
            .or_insert_with(|| Job::new(job_id, kind, self.num_workers, self.identity_tree, now))
    }

    // Idleness and commitment.

    /// A worker is idle iff it has no commitment and no active job. Dormant
    /// (suspended) jobs do not make it busy.
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.committed.is_none()
    }

    pub fn is_busy_or_committed(&self) -> bool {
        !self.is_idle()
    }

    pub fn active_job_id(&self) -> Option<JobId> {
        self.active
    }

    pub fn committed_job_id(&self) -> Option<JobId> {
        self.committed
    }

    pub fn has_commitment(&self, job_id: JobId) -> bool {
        self.committed == Some(job_id)
    }

    pub fn commitment(&self, job_id: JobId) -> Option<&JobRequest> {
        if self.committed == Some(job_id) {
            self.jobs.get(&job_id).and_then(Job::commitment)
        } else {
            None
        }
    }

    /// Reserves this worker for the request's slot. Committing to the root
    /// slot makes this worker the job's root.
    pub fn commit(&mut self, mut req: JobRequest, now: f64) {
        debug_assert!(self.committed.is_none());
        if req.requested_index == 0 {
            req.root_rank = self.rank;
        }
        let job_id = req.job_id;
        if let Some(job) = self.jobs.get_mut(&job_id) {
            info!("commit {job} to index {}", req.requested_index);
            job.commit(req, now);
            self.committed = Some(job_id);
        }
    }

    pub fn uncommit(&mut self, job_id: JobId, now: f64) -> Option<JobRequest> {
        if self.committed != Some(job_id) {
            return None;
        }
        self.committed = None;
        self.jobs.get_mut(&job_id).and_then(|job| job.uncommit(now))
    }

    /// Applies adoption policy to an incoming request. This is the only
    /// place where the decision to adopt lives.
    pub fn try_adopt(&mut self, req: &JobRequest, mode: RequestMode) -> Adoption {
        if self.is_request_obsolete(req) {
            return Adoption::Reject;
        }
        // A terminated job never returns to this worker.
        if self.jobs.get(&req.job_id).is_some_and(|job| job.state() == JobState::Past) {
            return Adoption::Reject;
        }

        match mode {
            RequestMode::TargetedRejoin => {
                // A oneshot request is only acceptable while idle and still
                // holding the dormant copy it was addressed to.
                let dormant = self.jobs.get(&req.job_id).is_some_and(Job::is_dormant);
                if self.is_idle() && dormant {
                    Adoption::FromIdle
                } else {
                    Adoption::Reject
                }
            }
            RequestMode::Normal => {
                if self.is_idle() {
                    return Adoption::FromIdle;
                }
                // A not-yet-active commitment may be pre-empted by a request
                // the balancing policy ranks higher.
                if self.active.is_none() {
                    if let Some(job_id) = self.committed {
                        let outranked = self
                            .commitment(job_id)
                            .is_some_and(|held| self.balancer.outranks(req, held));
                        if outranked {
                            return Adoption::ReplaceCurrent(job_id);
                        }
                    }
                }
                Adoption::Reject
            }
        }
    }

    /// Cancels the held commitment if the incoming request claims the same
    /// slot under a newer epoch, returning the cancelled request. The newer
    /// handshake wins the race.
    pub fn cancel_stale_commitment(&mut self, req: &JobRequest, now: f64) -> Option<JobRequest> {
        let job_id = self.committed?;
        let held = self.commitment(job_id)?;
        if held.job_id == req.job_id
            && held.requested_index == req.requested_index
            && held.balancing_epoch < req.balancing_epoch
        {
            info!("commitment to #{job_id} superseded by epoch {}", req.balancing_epoch);
            self.balancer.unregister_job(job_id);
            return self.uncommit(job_id, now);
        }
        None
    }

    // Execution state.

    /// Moves a committed job to Active, starting its application.
    pub fn execute(&mut self, job_id: JobId, app: Box<dyn Application>, now: f64) -> Result<()> {
        let job = self.jobs.get_mut(&job_id).expect("executing unknown job");
        job.execute(app, now)?;
        info!("execute {job}");
        self.active = Some(job_id);
        if job.tree().is_root() {
            self.balancer.register_job(job_id, 1);
            job.set_last_demand(1);
        }
        Ok(())
    }

    /// Moves a suspended job back to Active without re-importing its
    /// description.
    pub fn reactivate(&mut self, job_id: JobId, now: f64) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.reactivate(now);
            info!("reactivate {job}");
            self.active = Some(job_id);
            if job.tree().is_root() {
                self.balancer.register_job(job_id, job.last_demand().max(1));
            }
        }
    }

    pub fn suspend(&mut self, job_id: JobId, now: f64) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.suspend(now);
            info!("suspend {job}");
        }
        if self.active == Some(job_id) {
            self.active = None;
        }
    }

    pub fn terminate(&mut self, job_id: JobId, now: f64) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.uncommit(now);
            job.terminate(now);
            info!("terminate {job}");
        }
        if self.active == Some(job_id) {
            self.active = None;
        }
        if self.committed == Some(job_id) {
            self.committed = None;
        }
        self.balancer.unregister_job(job_id);
        self.root_requests.remove(&job_id);
        if self.pending_root_reactivation.as_ref().is_some_and(|req| req.job_id == job_id) {
            self.pending_root_reactivation = None;
        }
    }

    /// Evicts jobs that are done or have gone stale: terminated jobs whose
    /// backends are destructible, inactive leftovers of failed handshakes,
    /// and the oldest dormant non-root copies beyond the cache size.
    pub fn forget_old_jobs(&mut self, now: f64) {
        let mut evict: Vec<JobId> = Vec::new();
        let mut dormant: Vec<(f64, JobId)> = Vec::new();
        for job in self.jobs.values() {
            match job.state() {
                // A terminated job holding a result keeps it until the
                // transfer to the client concluded.
                JobState::Past if job.is_destructible() && !job.result_transfer_pending() => {
                    evict.push(job.id())
                }
                JobState::Inactive
                    if !job.has_commitment() && now - job.last_activity() > STALE_JOB_AGE =>
                {
                    evict.push(job.id())
                }
                JobState::Suspended if !job.tree().is_root() => {
                    dormant.push((job.last_activity(), job.id()))
                }
                _ => {}
            }
        }
        if dormant.len() > self.job_cache_size {
            dormant.sort_by(|a, b| a.0.total_cmp(&b.0));
            evict.extend(dormant.iter().take(dormant.len() - self.job_cache_size).map(|&(_, id)| id));
        }
        for job_id in evict {
            debug!("forgetting job #{job_id}");
            self.jobs.remove(&job_id);
        }
    }

    // Obsolescence.

    /// A request is obsolete once its epoch has passed and the slot it asks
    /// for no longer exists under the current volume.
    pub fn is_request_obsolete(&self, req: &JobRequest) -> bool {
        if self.jobs.get(&req.job_id).is_some_and(|job| job.state() == JobState::Past) {
            return true;
        }
        if req.balancing_epoch >= self.epoch {
            return false;
        }
        match self.volumes.get(&req.job_id) {
            Some(&(volume, _)) => req.requested_index >= volume,
            None => false,
        }
    }

    /// Whether an adoption offer (or the outstanding request behind it) has
    /// been overtaken. With `check_slot`, an already filled child slot also
    /// counts, which settles races between simultaneous offers.
    pub fn is_adoption_offer_obsolete(&self, req: &JobRequest, check_slot: bool) -> bool {
        let Some(job) = self.jobs.get(&req.job_id) else { return true };
        if job.state() != JobState::Active {
            return true;
        }
        if job.volume() > 0 && req.requested_index >= job.volume() {
            return true;
        }
        if check_slot {
            let tree = job.tree();
            if req.requested_index == tree.left_child_index() && tree.has_left_child() {
                return true;
            }
            if req.requested_index == tree.right_child_index() && tree.has_right_child() {
                return true;
            }
        }
        false
    }

    // Dormancy queries.

    pub fn has_dormant_root(&self) -> bool {
        self.jobs.values().any(Job::is_dormant_root)
    }

    pub fn has_dormant_job(&self, job_id: JobId) -> bool {
        self.jobs.get(&job_id).is_some_and(Job::is_dormant)
    }

    pub fn has_inactive_jobs_waiting_for_reactivation(&self) -> bool {
        self.jobs
            .values()
            .any(|job| job.state() != JobState::Active && job.tree().is_waiting_for_reactivation())
    }

    // Root requests.

    /// Books a fresh root request; the job enters balancing and the request
    /// is activated once its first volume arrives.
    pub fn add_root_request(&mut self, req: JobRequest) {
        info!("root request {req}");
        self.balancer.register_job(req.job_id, 1);
        self.root_requests.insert(req.job_id, req);
    }

    pub fn has_root_request(&self, job_id: JobId) -> bool {
        self.root_requests.contains_key(&job_id)
    }

    pub fn take_root_request(&mut self, job_id: JobId) -> Option<JobRequest> {
        self.root_requests.remove(&job_id)
    }

    pub fn set_pending_root_reactivation(&mut self, req: JobRequest) {
        self.pending_root_reactivation = Some(req);
    }

    pub fn has_pending_root_reactivation(&self) -> bool {
        self.pending_root_reactivation.is_some()
    }

    pub fn take_pending_root_reactivation(&mut self) -> Option<JobRequest> {
        self.pending_root_reactivation.take()
    }

    // Deferred and future requests.

    pub fn defer_request(&mut self, now: f64, sender: Rank, req: JobRequest) {
        debug!("deferring {req}");
        self.deferred.push_back((now, sender, req));
    }

    /// Requests deferred long enough to be bounced onward.
    pub fn take_deferred_requests(&mut self, now: f64) -> Vec<(Rank, JobRequest)> {
        let mut due = Vec::new();
        while let Some((deferred_at, _, _)) = self.deferred.front() {
            if now - deferred_at < DEFER_DELAY {
                break;
            }
            let (_, sender, req) = self.deferred.pop_front().unwrap();
            due.push((sender, req));
        }
        due
    }

    /// Parks a request from a future epoch until that epoch arrives.
    pub fn add_future_request(&mut self, sender: Rank, mode: RequestMode, req: JobRequest) {
        debug!("future request {req} at epoch {}", self.epoch);
        self.arrivals += 1;
        self.future.insert((req.balancing_epoch, self.arrivals), (sender, mode, req));
    }

    /// Drains the future requests whose epoch has become current or past,
    /// in (epoch, arrival) order.
    pub fn take_arrived_future_requests(&mut self) -> Vec<(Rank, RequestMode, JobRequest)> {
        let mut arrived = Vec::new();
        while let Some((&(epoch, order), _)) = self.future.first_key_value() {
            if epoch > self.epoch {
                break;
            }
            arrived.push(self.future.remove(&(epoch, order)).unwrap());
        }
        arrived
    }

    // Balancing.

    pub fn global_epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn balancer_mut(&mut self) -> &mut dyn Balancer {
        self.balancer.as_mut()
    }

    pub fn unregister_job_from_balancer(&mut self, job_id: JobId) {
        self.balancer.unregister_job(job_id);
    }

    /// Consumes the balancer's next assignment batch, if any, advancing the
    /// global epoch and the volume cache. The caller propagates the per-job
    /// updates in ascending job order.
    pub fn advance_balancing(&mut self, now: f64) -> Option<Assignments> {
        let assignments = self.balancer.advance(now)?;
        debug_assert!(assignments.epoch > self.epoch);
        self.epoch = assignments.epoch;
        for (&job_id, &volume) in &assignments.volumes {
            self.volumes.insert(job_id, (volume, assignments.epoch));
        }
        Some(assignments)
    }

    pub fn volume(&self, job_id: JobId) -> Option<u32> {
        self.volumes.get(&job_id).map(|&(volume, _)| volume)
    }

    /// The root's demand changed; forward it to the balancer.
    pub fn handle_demand_update(&mut self, job_id: JobId, demand: u32) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.set_last_demand(demand);
        }
        self.balancer.update_demand(job_id, demand);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::demo::DemoJob;
    use crate::schedule::balance::ProportionalBalancer;
    use crate::schedule::JobDescription;

    fn request(job_id: JobId, index: u32, epoch: Epoch) -> JobRequest {
        JobRequest {
            job_id,
            application: AppKind::Demo,
            root_rank: 0,
            requesting_rank: 1,
            requested_index: index,
            current_revision: 0,
            last_known_revision: -1,
            time_of_birth: 0.0,
            num_hops: 2,
            balancing_epoch: epoch,
        }
    }

    fn db() -> JobDatabase {
        JobDatabase::new(0, 8, false, 4, Box::new(ProportionalBalancer::new(8, 0.0)))
    }

    fn add_described_job(db: &mut JobDatabase, job_id: JobId) {
        let desc = JobDescription {
            job_id,
            application: AppKind::Demo,
            client_rank: 0,
            priority: 1.0,
            incremental: false,
            wallclock_limit: 0.0,
            cpu_limit: 0.0,
            revision: 0,
            payload: vec![-1],
        };
        let job = db.create_job(job_id, AppKind::Demo, 0.0);
        job.append_revision(desc.to_bytes().unwrap()).unwrap();
    }

    #[test]
    fn idle_worker_adopts() {
        let mut db = db();
        assert!(db.is_idle());
        assert_eq!(db.try_adopt(&request(1, 3, 0), RequestMode::Normal), Adoption::FromIdle);
    }

    #[test]
    fn committed_worker_rejects_growth_requests() {
        let mut db = db();
        db.create_job(1, AppKind::Demo, 0.0);
        db.commit(request(1, 3, 0), 0.0);
        assert!(db.is_busy_or_committed());
        assert_eq!(db.try_adopt(&request(2, 5, 0), RequestMode::Normal), Adoption::Reject);
    }

    #[test]
    fn root_request_preempts_inner_commitment() {
        let mut db = db();
        db.create_job(1, AppKind::Demo, 0.0);
        db.commit(request(1, 3, 0), 0.0);
        // The proportional policy lets root requests outrank inner slots.
        assert_eq!(
            db.try_adopt(&request(2, 0, 0), RequestMode::Normal),
            Adoption::ReplaceCurrent(1)
        );
        // But another inner request does not.
        assert_eq!(db.try_adopt(&request(2, 4, 0), RequestMode::Normal), Adoption::Reject);
    }

    #[test]
    fn targeted_rejoin_requires_dormant_copy() {
        let mut db = db();
        assert_eq!(db.try_adopt(&request(1, 3, 0), RequestMode::TargetedRejoin), Adoption::Reject);

        add_described_job(&mut db, 1);
        db.commit(request(1, 3, 0), 0.0);
        db.execute(1, Box::new(DemoJob::new()), 0.0).unwrap();
        db.suspend(1, 1.0);
        db.uncommit(1, 1.0);
        assert!(db.has_dormant_job(1));
        assert_eq!(
            db.try_adopt(&request(1, 3, 1), RequestMode::TargetedRejoin),
            Adoption::FromIdle
        );
    }

    #[test]
    fn terminated_job_never_returns() {
        let mut db = db();
        db.create_job(1, AppKind::Demo, 0.0);
        db.terminate(1, 0.0);
        assert_eq!(db.try_adopt(&request(1, 3, 0), RequestMode::Normal), Adoption::Reject);
    }

    #[test]
    fn request_obsolescence_follows_epoch_and_volume() {
        let mut db = db();
        db.epoch = 5;
        db.volumes.insert(1, (4, 5));
        // Present or future epochs are never obsolete.
        assert!(!db.is_request_obsolete(&request(1, 7, 5)));
        assert!(!db.is_request_obsolete(&request(1, 7, 9)));
        // Past epoch: obsolete iff the slot fell outside the volume.
        assert!(db.is_request_obsolete(&request(1, 7, 4)));
        assert!(!db.is_request_obsolete(&request(1, 2, 4)));
        // Unknown volume: not obsolete.
        assert!(!db.is_request_obsolete(&request(2, 7, 4)));
    }

    #[test]
    fn offer_obsolescence_detects_filled_slot() {
        let mut db = db();
        add_described_job(&mut db, 1);
        db.commit(request(1, 1, 0), 0.0);
        db.execute(1, Box::new(DemoJob::new()), 0.0).unwrap();
        let job = db.get_mut(1).unwrap();
        job.update_volume(8, 0.0);
        // Offer for the (empty) left child slot of index 1, i.e. index 3.
        assert!(!db.is_adoption_offer_obsolete(&request(1, 3, 0), true));
        db.get_mut(1).unwrap().tree_mut().set_child(5, 3);
        assert!(db.is_adoption_offer_obsolete(&request(1, 3, 0), true));
        // Without the slot check the offer still stands.
        assert!(!db.is_adoption_offer_obsolete(&request(1, 3, 0), false));
    }

    #[test]
    fn future_requests_drain_in_epoch_order() {
        let mut db = db();
        db.epoch = 7;
        db.add_future_request(2, RequestMode::Normal, request(1, 3, 9));
        db.add_future_request(3, RequestMode::Normal, request(1, 4, 8));
        db.add_future_request(4, RequestMode::Normal, request(1, 5, 8));
        assert!(db.take_arrived_future_requests().is_empty());

        db.epoch = 8;
        let arrived = db.take_arrived_future_requests();
        assert_eq!(arrived.len(), 2);
        assert_eq!(arrived[0].2.requested_index, 4);
        assert_eq!(arrived[1].2.requested_index, 5);

        db.epoch = 9;
        let arrived = db.take_arrived_future_requests();
        assert_eq!(arrived.len(), 1);
        assert_eq!(arrived[0].2.requested_index, 3);
    }

    #[test]
    fn stale_commitment_yields_to_newer_epoch() {
        let mut db = db();
        db.create_job(1, AppKind::Demo, 0.0);
        db.commit(request(1, 3, 2), 0.0);
        assert!(db.cancel_stale_commitment(&request(1, 4, 5), 1.0).is_none());
        let cancelled = db.cancel_stale_commitment(&request(1, 3, 5), 1.0).unwrap();
        assert_eq!(cancelled.balancing_epoch, 2);
        assert!(db.is_idle());
    }

    #[test]
    fn deferred_requests_wait_out_the_delay() {
        let mut db = db();
        db.defer_request(1.0, 2, request(1, 3, 0));
        assert!(db.take_deferred_requests(1.01).is_empty());
        let due = db.take_deferred_requests(1.2);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, 2);
    }

    #[test]
    fn forgetting_keeps_dormant_roots_and_cache() {
        let mut db = JobDatabase::new(0, 8, false, 1, Box::new(ProportionalBalancer::new(8, 0.0)));
        // A terminated destructible job is evicted.
        db.create_job(1, AppKind::Demo, 0.0);
        db.terminate(1, 0.0);
        // Two dormant non-root copies, one beyond the cache size.
        for (job_id, time) in [(2, 1.0), (3, 2.0)] {
            add_described_job(&mut db, job_id);
            db.commit(request(job_id, 3, 0), time);
            db.execute(job_id, Box::new(DemoJob::new()), time).unwrap();
            db.suspend(job_id, time);
            db.uncommit(job_id, time);
        }
        db.forget_old_jobs(3.0);
        assert!(!db.has(1));
        assert!(!db.has(2), "oldest dormant copy beyond the cache is evicted");
        assert!(db.has(3));
    }
}
