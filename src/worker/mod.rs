//! The per-worker driver: a single-threaded cooperative event loop that
//! drains the message queue, fires the scheduling handlers, and paces
//! periodic maintenance (balancing, stats, job checks). All scheduler state
//! is owned here and touched only from this loop.

mod handlers;
mod volume;

use crate::app::AppRegistry;
use crate::comm::{CommLink, MessageQueue, Tag};
use crate::config::Config;
use crate::encoding::wire::{self, Wire};
use crate::error::Result;
use crate::schedule::router::CollectiveAction;
use crate::schedule::sysstate::{
    BUSY_RATIO, COMMITTED_RATIO, GLOBAL_MEM, NUM_HOPS, NUM_JOBS, SPAWNED_REQUESTS,
};
use crate::schedule::{
    Balancer, CollectiveAssignment, JobDatabase, JobDescription, JobRequest, JobResult,
    JobState, JobStatistics, RequestMode, RequestRouter, Side, SystemState,
};
use crate::util::{Periodic, Terminator, ThreadPool, Watchdog};
use crate::{JobId, Rank};

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Results of the off-thread node stats sampling, polled by the event loop.
struct StatsProbe {
    calculated: AtomicBool,
    memory_gb_bits: AtomicU32,
}

/// A job introduced by this worker in its client role: it serves the
/// description to the adopting root and collects the final result.
struct ClientJob {
    revisions: Vec<Arc<Vec<u8>>>,
    root_rank: Option<Rank>,
    statistics: Option<JobStatistics>,
    result: Option<JobResult>,
    done: bool,
}

/// One worker of the fleet. The scheduler is replicated symmetrically: every
/// worker holds the full component stack and processes the same message
/// protocol.
pub struct Worker {
    cfg: Config,
    rank: Rank,
    comm: CommLink,
    db: JobDatabase,
    router: RequestRouter,
    coll_assign: CollectiveAssignment,
    sys_state: SystemState,
    apps: AppRegistry,
    terminator: Terminator,
    thread_pool: ThreadPool,
    watchdog: Option<Watchdog>,
    stats_probe: Arc<StatsProbe>,
    client_jobs: HashMap<JobId, ClientJob>,
    periodic_stats: Periodic,
    periodic_balance: Periodic,
    periodic_maintenance: Periodic,
    periodic_job_check: Periodic,
    /// The current event loop time, set by the driver before handlers run.
    now: f64,
}

impl Worker {
    pub fn new(
        cfg: Config,
        comm: CommLink,
        balancer: Box<dyn Balancer>,
        apps: AppRegistry,
        terminator: Terminator,
    ) -> Self {
        let rank = cfg.rank;
        let db = JobDatabase::new(rank, cfg.num_workers, cfg.mono, cfg.job_cache_size, balancer);
        let router = RequestRouter::new(
            rank,
            cfg.num_workers,
            cfg.num_bounce_alternatives,
            cfg.derandomize,
            cfg.hops_until_collective_assignment,
            cfg.reactivation_scheduling,
        );
        let coll_assign = CollectiveAssignment::new(router.neighbors().first().copied());
        let sys_state = SystemState::new(rank, cfg.num_workers, cfg.sysstate_period, comm.clone());
        let watchdog = (cfg.watchdog_abort_millis > 0 || cfg.watchdog_warn_millis > 0)
            .then(|| Watchdog::new(cfg.watchdog_warn_millis, cfg.watchdog_abort_millis));
        Self {
            rank,
            comm,
            db,
            router,
            coll_assign,
            sys_state,
            apps,
            terminator,
            thread_pool: ThreadPool::new(1),
            watchdog,
            stats_probe: Arc::new(StatsProbe {
                calculated: AtomicBool::new(true),
                memory_gb_bits: AtomicU32::new(0),
            }),
            client_jobs: HashMap::new(),
            periodic_stats: Periodic::new(cfg.stats_period),
            periodic_balance: Periodic::new(cfg.balance_period),
            periodic_maintenance: Periodic::new(cfg.maintenance_period),
            periodic_job_check: Periodic::new(cfg.job_check_period),
            now: 0.0,
            cfg,
        }
    }

    /// Registers all message handlers with the queue. Every tag a worker can
    /// receive must be covered; an uncovered tag is a protocol violation.
    pub fn register(queue: &mut MessageQueue<Worker>) {
        queue.register_callback(
            Tag::RequestNode,
            Box::new(|w, h| w.handle_request_node(h, RequestMode::Normal)),
        );
        queue.register_callback(
            Tag::RequestNodeOneshot,
            Box::new(|w, h| w.handle_request_node(h, RequestMode::TargetedRejoin)),
        );
        queue.register_callback(Tag::RejectOneshot, Box::new(Worker::handle_reject_oneshot));
        queue.register_callback(Tag::OfferAdoption, Box::new(Worker::handle_offer_adoption));
        queue.register_callback(
            Tag::OfferAdoptionOfRoot,
            Box::new(Worker::handle_offer_adoption_of_root),
        );
        queue.register_callback(
            Tag::AnswerAdoptionOffer,
            Box::new(Worker::handle_answer_adoption_offer),
        );
        queue.register_callback(
            Tag::QueryJobDescription,
            Box::new(Worker::handle_query_job_description),
        );
        queue.register_callback(
            Tag::SendJobDescription,
            Box::new(Worker::handle_send_job_description),
        );
        queue.register_callback(Tag::QueryVolume, Box::new(Worker::handle_query_volume));
        queue.register_callback(
            Tag::NotifyVolumeUpdate,
            Box::new(Worker::handle_notify_volume_update),
        );
        queue.register_callback(
            Tag::NotifyNodeLeavingJob,
            Box::new(Worker::handle_notify_node_leaving_job),
        );
        queue.register_callback(
            Tag::NotifyJobTerminating,
            Box::new(Worker::handle_notify_job_terminating),
        );
        queue.register_callback(Tag::Interrupt, Box::new(Worker::handle_interrupt));
        queue.register_callback(
            Tag::NotifyJobAborting,
            Box::new(Worker::handle_notify_job_aborting),
        );
        queue.register_callback(
            Tag::IncrementalJobFinished,
            Box::new(Worker::handle_incremental_job_finished),
        );
        queue.register_callback(
            Tag::NotifyResultFound,
            Box::new(Worker::handle_notify_result_found),
        );
        queue.register_callback(
            Tag::NotifyResultObsolete,
            Box::new(Worker::handle_notify_result_obsolete),
        );
        queue.register_callback(Tag::QueryJobResult, Box::new(Worker::handle_query_job_result));
        queue.register_callback(Tag::SendJobResult, Box::new(Worker::handle_send_job_result));
        queue.register_callback(Tag::NotifyJobDone, Box::new(Worker::handle_notify_job_done));
        queue.register_callback(
            Tag::NotifyClientJobAborting,
            Box::new(Worker::handle_notify_client_job_aborting),
        );
        queue.register_callback(
            Tag::ApplicationMessage,
            Box::new(Worker::handle_application_message),
        );
        queue.register_callback(Tag::ReduceData, Box::new(|w, h| w.sys_state.handle(h)));
        queue.register_callback(Tag::BroadcastData, Box::new(|w, h| w.sys_state.handle(h)));
        queue.register_callback(Tag::DoExit, Box::new(Worker::handle_do_exit));
        queue.register_callback(
            Tag::Warmup,
            Box::new(|w, h| {
                debug!("rank {} received warmup message from {}", w.rank, h.source);
                Ok(())
            }),
        );
    }

    /// Sends warmup messages along this worker's expander edges.
    pub fn init(&mut self) {
        if self.cfg.derandomize && self.cfg.warmup {
            for &rank in self.router.neighbors() {
                debug!("rank {} sending warmup message to {rank}", self.rank);
                self.comm.send(rank, Tag::Warmup, wire::encode_i32s(&[1, 2, 3, 4, 5, 6, 7, 8]));
            }
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn db(&self) -> &JobDatabase {
        &self.db
    }

    /// Sets the event loop time before handlers run against the queue.
    pub fn set_now(&mut self, now: f64) {
        self.now = now;
    }

    /// One iteration of periodic maintenance: balancing, stats, job checks,
    /// and the system state aggregation.
    pub fn advance(&mut self, now: f64) -> Result<()> {
        self.now = now;
        if let Some(watchdog) = &self.watchdog {
            watchdog.reset();
        }

        if self.periodic_stats.ready(now) {
            self.check_stats();
        }

        if self.periodic_balance.ready(now) {
            self.advance_balancing()?;
        }

        if self.periodic_maintenance.ready(now) {
            self.db.forget_old_jobs(now);
            for (sender, mut req) in self.db.take_deferred_requests(now) {
                self.bounce_job_request(&mut req, sender);
            }
        }

        if self.periodic_job_check.ready(now) {
            self.check_jobs()?;
        }

        if let Some(global) = self.sys_state.aggregate(now) {
            let n = self.cfg.num_workers as f32;
            if self.rank == 0 {
                info!(
                    "sysstate busyratio={:.3} cmtdratio={:.3} jobs={} globmem={:.2}GB newreqs={} hops={}",
                    global[BUSY_RATIO] / n,
                    global[COMMITTED_RATIO] / n,
                    global[NUM_JOBS] as i64,
                    global[GLOBAL_MEM],
                    global[SPAWNED_REQUESTS] as i64,
                    global[NUM_HOPS] as i64,
                );
            }
            // Incrementally added fields start over each round.
            self.sys_state.set_local(NUM_HOPS, 0.0);
            self.sys_state.set_local(SPAWNED_REQUESTS, 0.0);
        }
        Ok(())
    }

    /// Whether the process should shut down: the terminator fired or the
    /// global time limit passed.
    pub fn check_terminate(&mut self, now: f64) -> bool {
        if self.terminator.is_set() {
            return true;
        }
        if self.cfg.time_limit > 0.0 && now > self.cfg.time_limit {
            info!("rank {}: time limit reached, terminating", self.rank);
            self.terminator.set();
            return true;
        }
        false
    }

    /// Polls the off-thread node stats sample and kicks off the next one.
    fn check_stats(&mut self) {
        if !self.stats_probe.calculated.load(Ordering::Acquire) {
            return;
        }
        let memory_gbs = f32::from_bits(self.stats_probe.memory_gb_bits.load(Ordering::Relaxed));
        self.sys_state.set_local(GLOBAL_MEM, memory_gbs);
        debug!("rank {}: mem={memory_gbs:.2}GB", self.rank);

        self.stats_probe.calculated.store(false, Ordering::Relaxed);
        let probe = self.stats_probe.clone();
        self.thread_pool.execute(move || {
            let memory_gbs = sample_memory_gbs();
            probe.memory_gb_bits.store(memory_gbs.to_bits(), Ordering::Relaxed);
            probe.calculated.store(true, Ordering::Release);
        });

        if let Some(job_id) = self.db.active_job_id() {
            if let Some(job) = self.db.get(job_id) {
                if let Some(app) = job.app() {
                    app.dump_stats();
                }
            }
        }
    }

    /// Concludes a balancing round: applies new volumes, re-injects requests
    /// whose future epoch has arrived, and advances collective assignment.
    fn advance_balancing(&mut self) -> Result<()> {
        if let Some(assignments) = self.db.advance_balancing(self.now) {
            let mut updates: Vec<(JobId, u32)> = assignments.volumes.into_iter().collect();
            updates.sort_unstable();
            for (job_id, volume) in updates {
                self.update_volume(job_id, volume, assignments.epoch);
            }
            for (sender, mode, req) in self.db.take_arrived_future_requests() {
                self.handle_request(sender, req, mode)?;
            }
        }

        if self.cfg.hops_until_collective_assignment >= 0 {
            let idle = self.db.is_idle();
            for action in self.coll_assign.advance(idle) {
                match action {
                    CollectiveAction::Inject(req) => {
                        self.handle_request(self.rank, req, RequestMode::Normal)?;
                    }
                    CollectiveAction::Forward(rank, req) => {
                        self.comm.send(rank, Tag::RequestNode, req.to_bytes());
                    }
                }
            }
        }
        Ok(())
    }

    /// The periodic per-job check: pending root reactivation, system state
    /// contributions, result and demand checks, waiting children, and
    /// application communication.
    fn check_jobs(&mut self) -> Result<()> {
        if let Some(req) = self.db.take_pending_root_reactivation() {
            self.handle_request(self.rank, req, RequestMode::Normal)?;
        }

        let Some(job_id) = self.db.active_job_id() else {
            let committed = if self.db.is_busy_or_committed() { 1.0 } else { 0.0 };
            self.sys_state.set_local(BUSY_RATIO, committed);
            self.sys_state.set_local(COMMITTED_RATIO, committed);
            self.sys_state.set_local(NUM_JOBS, 0.0);
            return Ok(());
        };
        self.sys_state.set_local(BUSY_RATIO, 1.0);
        self.sys_state.set_local(COMMITTED_RATIO, 0.0);
        let is_root = self.db.get(job_id).is_some_and(|job| job.tree().is_root());
        self.sys_state.set_local(NUM_JOBS, if is_root { 1.0 } else { 0.0 });

        if is_root && self.check_computation_limits(job_id) {
            self.timeout_job(job_id);
            return Ok(());
        }

        self.check_result(job_id);

        if is_root {
            let job = self.db.get(job_id).unwrap();
            let demand = job.demand(self.now, self.cfg.num_workers, self.cfg.growth_period);
            if demand != job.last_demand() {
                self.db.handle_demand_update(job_id, demand);
            }
        }

        self.serve_waiting_children(job_id);
        self.communicate(job_id);
        Ok(())
    }

    /// Checks whether the active job found a result, and reports it to the
    /// job's root (possibly this worker itself).
    fn check_result(&mut self, job_id: JobId) {
        let Some(job) = self.db.get(job_id) else { return };
        if job.state() != JobState::Active || job.result_transfer_pending() {
            return;
        }
        let Some(code) = job.app().and_then(|app| app.solved(self.now)) else { return };
        let root_rank = job.tree().root_rank();
        let revision = job.revision();
        info!("{job} : sending finished info to rank {root_rank}");
        self.comm.send(
            root_rank,
            Tag::NotifyResultFound,
            wire::encode_i32s(&[job_id as i32, revision, code]),
        );
        self.db.get_mut(job_id).unwrap().set_result_transfer_pending(true);
    }

    /// Serves queued description queries whose revision has arrived.
    fn serve_waiting_children(&mut self, job_id: JobId) {
        let Some(job) = self.db.get_mut(job_id) else { return };
        let revision = job.revision();
        let tree = job.tree();
        let (left, right) = (tree.child_rank(Side::Left), tree.child_rank(Side::Right));
        let waiting = job.waiting_for_revision();
        let mut due = Vec::new();
        waiting.retain(|&(rank, rev)| {
            if rev > revision {
                return true;
            }
            // Only currently attached children still get the transfer.
            if Some(rank) == left || Some(rank) == right {
                due.push((rank, rev));
            }
            false
        });
        for (rank, rev) in due {
            self.send_revision_description(job_id, rev, rank);
        }
    }

    /// Relays the application's tree-internal traffic.
    fn communicate(&mut self, job_id: JobId) {
        let Some(job) = self.db.get_mut(job_id) else { return };
        if job.state() != JobState::Active || !job.wants_to_communicate() {
            return;
        }
        for (rank, msg) in job.communicate() {
            self.comm.send(rank, Tag::ApplicationMessage, Wire::to_bytes(&msg));
        }
    }

    fn check_computation_limits(&self, job_id: JobId) -> bool {
        let Some(job) = self.db.get(job_id) else { return false };
        let Some(desc) = job.description() else { return false };
        if desc.wallclock_limit > 0.0 && job.age_since_activation(self.now) > desc.wallclock_limit {
            warn!("{job} exceeded wallclock limit of {:.2}s", desc.wallclock_limit);
            return true;
        }
        if desc.cpu_limit > 0.0 && job.used_cpu_seconds(self.now) > desc.cpu_limit {
            warn!("{job} exceeded CPU limit of {:.2}s", desc.cpu_limit);
            return true;
        }
        false
    }

    /// Aborts a job that hit its compute budget with a virtual self message,
    /// so the abort takes the same path as a received one.
    fn timeout_job(&mut self, job_id: JobId) {
        self.comm.send(self.rank, Tag::NotifyJobAborting, wire::encode_i32s(&[job_id as i32]));
        if self.cfg.mono {
            // No solution will be reported; begin to propagate the exit
            // signal once the abort is processed.
            self.comm.send(0, Tag::DoExit, wire::encode_i32s(&[0]));
        }
    }

    // Client role.

    /// Introduces a new job into the fleet, acting as its client: the
    /// description is served from here and the result lands here. The root
    /// request enters the fleet as a self message.
    pub fn introduce_job(&mut self, desc: JobDescription) -> Result<()> {
        let job_id = desc.job_id;
        let application = desc.application;
        let revision = desc.revision;
        let data = Arc::new(desc.to_bytes()?);
        self.client_jobs.insert(
            job_id,
            ClientJob {
                revisions: vec![data],
                root_rank: None,
                statistics: None,
                result: None,
                done: false,
            },
        );
        let req = JobRequest {
            job_id,
            application,
            root_rank: self.rank,
            requesting_rank: self.rank,
            requested_index: 0,
            current_revision: revision,
            last_known_revision: -1,
            time_of_birth: self.now as f32,
            num_hops: 0,
            balancing_epoch: self.db.global_epoch(),
        };
        info!("introducing job #{job_id}");
        self.comm.send(self.rank, Tag::RequestNode, req.to_bytes());
        Ok(())
    }

    /// The result collected for a job this worker introduced.
    pub fn client_job_result(&self, job_id: JobId) -> Option<&JobResult> {
        self.client_jobs.get(&job_id).and_then(|job| job.result.as_ref())
    }

    pub fn client_job_done(&self, job_id: JobId) -> bool {
        self.client_jobs.get(&job_id).is_some_and(|job| job.done)
    }
}

/// Samples this process's resident memory in GB from /proc. Runs on a pool
/// thread since the proc walk is too slow for the event loop.
fn sample_memory_gbs() -> f32 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else { return 0.0 };
    let resident_pages: u64 =
        statm.split_whitespace().nth(1).and_then(|v| v.parse().ok()).unwrap_or(0);
    (resident_pages * 4096) as f32 / 1e9
}
