//! End-to-end scheduling scenarios on a deterministic in-process cluster:
//! N workers over an in-memory transport, driven round-robin with synthetic
//! time and a scripted balancer released one epoch at a time.

use arbor::app::AppRegistry;
use arbor::comm::{channel_mesh, Frame, MessageQueue, Tag};
use arbor::config::Config;
use arbor::encoding::wire::Wire;
use arbor::schedule::{
    AppKind, Assignments, JobDescription, JobRequest, JobState, ScriptedBalancer, Side,
};
use arbor::util::Terminator;
use arbor::worker::Worker;
use arbor::{Epoch, Index, JobId, Rank};

use crossbeam::channel::Sender;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Cluster {
    queues: Vec<MessageQueue<Worker>>,
    workers: Vec<Worker>,
    injectors: Vec<Sender<Frame>>,
    released: Arc<AtomicUsize>,
    terminator: Terminator,
    now: f64,
}

impl Cluster {
    fn new(n: u32, script: Vec<Assignments>) -> Self {
        Self::with_config(n, script, |_| {})
    }

    fn with_config(n: u32, script: Vec<Assignments>, tweak: impl Fn(&mut Config)) -> Self {
        let released = Arc::new(AtomicUsize::new(0));
        let terminator = Terminator::new();
        let mut queues = Vec::new();
        let mut workers = Vec::new();
        let mut injectors = Vec::new();
        for (rank, transport) in channel_mesh(n).into_iter().enumerate() {
            let mut cfg = Config {
                rank: rank as Rank,
                num_workers: n,
                max_msg_size: 65536,
                balance_period: 0.0,
                maintenance_period: 0.0,
                job_check_period: 0.0,
                stats_period: 1e9,
                sysstate_period: 1e9,
                watchdog_warn_millis: 0,
                watchdog_abort_millis: 0,
                growth_period: 0.0,
                ..Config::default()
            };
            tweak(&mut cfg);
            injectors.push(transport.injector());
            let mut queue = MessageQueue::new(rank as Rank, cfg.max_msg_size, Box::new(transport));
            let balancer = ScriptedBalancer::new(script.clone(), released.clone());
            let worker = Worker::new(
                cfg,
                queue.link(),
                Box::new(balancer),
                AppRegistry::standard(),
                terminator.clone(),
            );
            Worker::register(&mut queue);
            queues.push(queue);
            workers.push(worker);
        }
        Self { queues, workers, injectors, released, terminator, now: 0.0 }
    }

    /// Makes every worker's balancer conclude the next scripted epoch.
    fn release_epoch(&self) {
        self.released.fetch_add(1, Ordering::Release);
    }

    /// One cooperative round: every worker drains a queue slice and runs its
    /// periodic maintenance, then time moves forward.
    fn step(&mut self) {
        for (queue, worker) in self.queues.iter_mut().zip(self.workers.iter_mut()) {
            worker.set_now(self.now);
            queue.advance(worker).unwrap();
            worker.advance(self.now).unwrap();
        }
        self.now += 0.01;
        self.check_invariants();
    }

    fn run(&mut self, rounds: usize) {
        for _ in 0..rounds {
            self.step();
            std::thread::yield_now();
        }
    }

    /// Steps until all queues drained and stayed drained, within a bound.
    fn settle(&mut self, max_rounds: usize) {
        let mut idle_streak = 0;
        for _ in 0..max_rounds {
            self.step();
            if self.queues.iter().all(MessageQueue::is_idle) {
                idle_streak += 1;
                if idle_streak >= 3 {
                    return;
                }
            } else {
                idle_streak = 0;
            }
            std::thread::yield_now();
        }
        panic!("cluster did not settle within {max_rounds} rounds");
    }

    /// Delivers a raw request frame to a worker, playing an external sender.
    fn inject_request(&self, to: Rank, from: Rank, req: &JobRequest) {
        self.injectors[to as usize]
            .send(Frame { from, tag: Tag::RequestNode.to_wire(), payload: req.to_bytes() })
            .unwrap();
    }

    /// The (rank, index) pairs holding the job in the given state.
    fn nodes_in_state(&self, job_id: JobId, state: JobState) -> Vec<(Rank, Index)> {
        let mut nodes = Vec::new();
        for worker in &self.workers {
            if let Some(job) = worker.db().get(job_id) {
                if job.state() == state {
                    nodes.push((worker.rank(), job.index()));
                }
            }
        }
        nodes.sort_unstable();
        nodes
    }

    fn active_indices(&self, job_id: JobId) -> Vec<Index> {
        let mut indices: Vec<Index> =
            self.nodes_in_state(job_id, JobState::Active).into_iter().map(|(_, i)| i).collect();
        indices.sort_unstable();
        indices
    }

    /// The rank holding the job's active root.
    fn root_rank(&self, job_id: JobId) -> Rank {
        self.nodes_in_state(job_id, JobState::Active)
            .into_iter()
            .find(|&(_, index)| index == 0)
            .expect("job has an active root")
            .0
    }

    fn committed_workers(&self, job_id: JobId) -> Vec<Rank> {
        self.workers
            .iter()
            .filter(|w| w.db().committed_job_id() == Some(job_id))
            .map(Worker::rank)
            .collect()
    }

    /// Invariants that must hold at every instant, not just at rest:
    /// slot uniqueness and commitment exclusivity.
    fn check_invariants(&self) {
        let mut active_slots: HashMap<(JobId, Index), Rank> = HashMap::new();
        for worker in &self.workers {
            let mut commitments = 0;
            let mut actives = 0;
            for job in worker.db().jobs() {
                if job.has_commitment() {
                    commitments += 1;
                }
                if job.state() == JobState::Active {
                    actives += 1;
                    let slot = (job.id(), job.index());
                    if let Some(other) = active_slots.insert(slot, worker.rank()) {
                        panic!(
                            "job #{}:{} active on both rank {other} and rank {}",
                            slot.0,
                            slot.1,
                            worker.rank()
                        );
                    }
                }
            }
            assert!(commitments <= 1, "rank {} holds {commitments} commitments", worker.rank());
            assert!(actives <= 1, "rank {} runs {actives} active jobs", worker.rank());
            assert_eq!(worker.db().committed_job_id().is_some(), commitments == 1);
        }
    }

    /// At rest, every active non-root node must be listed as the matching
    /// child of its parent's tree.
    fn check_tree_connectivity(&self, job_id: JobId) {
        for worker in &self.workers {
            let Some(job) = worker.db().get(job_id) else { continue };
            if job.state() != JobState::Active || job.tree().is_root() {
                continue;
            }
            let index = job.index();
            let parent_rank = job.tree().parent_rank();
            let side = if index % 2 == 1 { Side::Left } else { Side::Right };
            let parent = self.workers[parent_rank as usize]
                .db()
                .get(job_id)
                .unwrap_or_else(|| panic!("parent rank {parent_rank} does not hold job"));
            assert_eq!(
                parent.tree().child_rank(side),
                Some(worker.rank()),
                "parent of #{job_id}:{index} does not list rank {} as child",
                worker.rank()
            );
        }
    }
}

fn demo_description(job_id: JobId, solve_millis: i32, wallclock_limit: f64) -> JobDescription {
    JobDescription {
        job_id,
        application: AppKind::Demo,
        client_rank: 0,
        priority: 1.0,
        incremental: false,
        wallclock_limit,
        cpu_limit: 0.0,
        revision: 0,
        payload: vec![solve_millis],
    }
}

fn assignments(epoch: Epoch, volumes: &[(JobId, u32)]) -> Assignments {
    Assignments { epoch, volumes: volumes.iter().copied().collect() }
}

/// S1: a job grows from volume 1 to 4 across two balancing epochs, ending
/// with a connected tree of indices 0..4 on four distinct workers.
#[test]
fn grow_from_one_to_four() {
    let script = vec![assignments(1, &[(1, 1)]), assignments(2, &[(1, 4)])];
    let mut cluster = Cluster::new(4, script);

    cluster.workers[0].introduce_job(demo_description(1, -1, 0.0)).unwrap();
    cluster.release_epoch();
    cluster.settle(300);
    assert_eq!(cluster.active_indices(1), vec![0]);

    cluster.release_epoch();
    cluster.settle(300);

    let active = cluster.nodes_in_state(1, JobState::Active);
    assert_eq!(active.len(), 4, "four distinct workers hold the job: {active:?}");
    assert_eq!(cluster.active_indices(1), vec![0, 1, 2, 3]);
    let ranks: HashSet<Rank> = active.iter().map(|&(r, _)| r).collect();
    assert_eq!(ranks.len(), 4);
    cluster.check_tree_connectivity(1);
    assert!(cluster.committed_workers(1).is_empty());
}

/// S2: shrinking from 4 to 2 suspends the nodes at indices 2 and 3, whose
/// leave notifications prune them out of their parents' trees.
#[test]
fn shrink_from_four_to_two() {
    let script = vec![
        assignments(1, &[(1, 1)]),
        assignments(2, &[(1, 4)]),
        assignments(3, &[(1, 2)]),
    ];
    let mut cluster = Cluster::new(4, script);

    cluster.workers[0].introduce_job(demo_description(1, -1, 0.0)).unwrap();
    cluster.release_epoch();
    cluster.settle(300);
    cluster.release_epoch();
    cluster.settle(300);
    assert_eq!(cluster.active_indices(1), vec![0, 1, 2, 3]);

    cluster.release_epoch();
    cluster.settle(300);

    assert_eq!(cluster.active_indices(1), vec![0, 1]);
    let mut suspended: Vec<Index> =
        cluster.nodes_in_state(1, JobState::Suspended).into_iter().map(|(_, i)| i).collect();
    suspended.sort_unstable();
    assert_eq!(suspended, vec![2, 3]);
    cluster.check_tree_connectivity(1);
    assert!(cluster.committed_workers(1).is_empty(), "no commitment outstanding");

    // The parents no longer list the suspended nodes as children.
    let root_rank = cluster.root_rank(1);
    let root = cluster.workers[root_rank as usize].db().get(1).unwrap();
    assert!(!root.tree().has_right_child(), "index 2 was pruned from the root");
}

/// S3: two workers race commitments for the same slot; the parent accepts
/// exactly one offer and every loser uncommits again.
#[test]
fn racing_offers_settle_on_one_child() {
    let script = vec![assignments(1, &[(1, 1)]), assignments(2, &[(1, 2)])];
    let mut cluster = Cluster::new(4, script);

    cluster.workers[0].introduce_job(demo_description(1, -1, 0.0)).unwrap();
    cluster.release_epoch();
    cluster.settle(300);
    let root_rank = cluster.root_rank(1);

    // Two idle workers receive the same request for index 1 under the
    // not-yet-released epoch 2, so both re-process it in the same round.
    let idle: Vec<Rank> = (0..4).filter(|&r| r != root_rank).collect();
    let (a, b) = (idle[0], idle[1]);
    let req = JobRequest {
        job_id: 1,
        application: AppKind::Demo,
        root_rank,
        requesting_rank: root_rank,
        requested_index: 1,
        current_revision: 0,
        last_known_revision: -1,
        time_of_birth: 0.0,
        num_hops: 5,
        balancing_epoch: 2,
    };
    cluster.inject_request(a, root_rank, &req);
    cluster.inject_request(b, root_rank, &req);
    cluster.run(2); // both requests deferred as future
    assert!(cluster.committed_workers(1).is_empty());

    cluster.release_epoch();
    cluster.run(2);
    // The race is on: more than one worker committed to the slot.
    assert!(cluster.committed_workers(1).len() >= 2, "expected racing commitments");

    cluster.settle(300);
    // Exactly one adoptee won; everyone else uncommitted again.
    let active = cluster.nodes_in_state(1, JobState::Active);
    assert_eq!(active.iter().filter(|&&(_, index)| index == 1).count(), 1);
    assert!(cluster.committed_workers(1).is_empty());
    cluster.check_tree_connectivity(1);
}

/// S4: a request from epoch 9 received at epoch 7 is deferred, never
/// processed early, and springs back to life once the epoch arrives.
#[test]
fn future_epoch_request_is_deferred() {
    let script: Vec<Assignments> =
        (1..=3).map(|epoch| assignments(epoch, &[(1, 1)])).collect();
    let mut cluster = Cluster::new(2, script);
    cluster.release_epoch();
    cluster.run(5);

    let req = JobRequest {
        job_id: 9,
        application: AppKind::Demo,
        root_rank: 0,
        requesting_rank: 0,
        requested_index: 1,
        current_revision: 0,
        last_known_revision: -1,
        time_of_birth: 0.0,
        num_hops: 3,
        balancing_epoch: 3,
    };
    cluster.inject_request(1, 0, &req);

    // The worker is idle and would adopt, but must not before epoch 3.
    cluster.run(20);
    assert!(cluster.workers[1].db().committed_job_id().is_none());

    cluster.release_epoch(); // epoch 2: still in the future
    cluster.run(20);
    assert!(cluster.workers[1].db().committed_job_id().is_none());

    cluster.release_epoch(); // epoch 3: the request becomes current
    cluster.run(1);
    assert_eq!(cluster.workers[1].db().committed_job_id(), Some(9));
}

/// S5: a multi-megabyte description and result cross the fleet in batches
/// and reassemble byte-identically at the client.
#[test]
fn fragmented_description_and_result_roundtrip() {
    let script = vec![assignments(1, &[(1, 1)])];
    let mut cluster = Cluster::with_config(4, script, |cfg| cfg.max_msg_size = 1 << 20);

    // Large words defeat varint compression, pushing the encoded
    // description and result beyond ten 1 MiB batches each.
    let payload: Vec<i32> = std::iter::once(0)
        .chain((0..2_600_000).map(|i: i32| i.wrapping_mul(0x1000_0003) | 0x4000_0000))
        .collect();
    let mut desc = demo_description(1, 0, 0.0);
    desc.payload = payload.clone();

    cluster.workers[0].introduce_job(desc).unwrap();
    cluster.release_epoch();
    cluster.run(400);

    assert!(cluster.workers[0].client_job_done(1));
    let result = cluster.workers[0].client_job_result(1).expect("result arrived");
    assert_eq!(result.result_code, 10);
    assert_eq!(result.solution, payload, "solution reassembled byte-identically");
}

/// S6: in mono mode, a job hitting its wallclock limit is aborted via a
/// virtual self message and the fleet shuts down cleanly.
#[test]
fn abort_on_wallclock_timeout() {
    let script = vec![assignments(1, &[(1, 1)])];
    let mut cluster = Cluster::with_config(1, script, |cfg| cfg.mono = true);

    cluster.workers[0].introduce_job(demo_description(1, -1, 0.05)).unwrap();
    cluster.release_epoch();
    cluster.run(10);
    assert_eq!(cluster.active_indices(1), vec![0]);

    // Time passes beyond the limit; the root aborts itself.
    cluster.run(30);
    assert_eq!(cluster.workers[0].db().get(1).unwrap().state(), JobState::Past);
    assert!(cluster.workers[0].client_job_done(1));
    assert!(cluster.workers[0].client_job_result(1).is_none());
    assert!(cluster.terminator.is_set(), "exit signal propagated");
}

/// A solved job reports exactly once: the result travels to the root, the
/// client fetches it from the successful rank, and the tree terminates.
#[test]
fn solved_job_reaches_client_and_terminates() {
    let script = vec![assignments(1, &[(1, 1)]), assignments(2, &[(1, 3)])];
    let mut cluster = Cluster::new(4, script);

    cluster.workers[0].introduce_job(demo_description(1, 1500, 0.0)).unwrap();
    cluster.release_epoch();
    cluster.settle(300);
    cluster.release_epoch();
    cluster.settle(300);
    assert_eq!(cluster.active_indices(1), vec![0, 1, 2]);

    // The demo solver finishes after 1.5 s of job time.
    cluster.run(160);
    cluster.settle(300);
    assert!(cluster.workers[0].client_job_done(1));
    let result = cluster.workers[0].client_job_result(1).expect("result arrived");
    assert_eq!(result.job_id, 1);
    assert_eq!(result.result_code, 10);

    // Termination propagated through the whole tree.
    assert!(cluster.active_indices(1).is_empty());
    assert!(cluster.committed_workers(1).is_empty());
}

/// Two jobs share the fleet: each gets its own tree and volumes, and slot
/// uniqueness holds across both.
#[test]
fn two_jobs_coexist() {
    let script = vec![
        assignments(1, &[(1, 1)]),
        assignments(2, &[(1, 1), (2, 1)]),
        assignments(3, &[(1, 3), (2, 3)]),
    ];
    let mut cluster = Cluster::new(8, script);

    cluster.workers[0].introduce_job(demo_description(1, -1, 0.0)).unwrap();
    cluster.release_epoch();
    cluster.settle(400);
    cluster.workers[0].introduce_job(demo_description(2, -1, 0.0)).unwrap();
    cluster.release_epoch();
    cluster.settle(400);
    cluster.release_epoch();
    cluster.settle(400);

    assert_eq!(cluster.active_indices(1), vec![0, 1, 2]);
    assert_eq!(cluster.active_indices(2), vec![0, 1, 2]);
    cluster.check_tree_connectivity(1);
    cluster.check_tree_connectivity(2);

    // Six distinct workers carry the six nodes.
    let mut ranks: Vec<Rank> = cluster
        .nodes_in_state(1, JobState::Active)
        .into_iter()
        .chain(cluster.nodes_in_state(2, JobState::Active))
        .map(|(rank, _)| rank)
        .collect();
    ranks.sort_unstable();
    ranks.dedup();
    assert_eq!(ranks.len(), 6);
}

/// Shrinking and regrowing reattaches dormant children instead of cold
/// adoptions: the rank that held index 1 before gets it again.
#[test]
fn regrowth_prefers_dormant_children() {
    let script = vec![
        assignments(1, &[(1, 1)]),
        assignments(2, &[(1, 3)]),
        assignments(3, &[(1, 1)]),
        assignments(4, &[(1, 3)]),
    ];
    let mut cluster = Cluster::new(4, script);

    cluster.workers[0].introduce_job(demo_description(1, -1, 0.0)).unwrap();
    cluster.release_epoch();
    cluster.settle(300);
    cluster.release_epoch();
    cluster.settle(300);
    let before: HashMap<Index, Rank> = cluster
        .nodes_in_state(1, JobState::Active)
        .into_iter()
        .map(|(rank, index)| (index, rank))
        .collect();

    cluster.release_epoch(); // shrink to 1
    cluster.settle(300);
    assert_eq!(cluster.active_indices(1), vec![0]);

    cluster.release_epoch(); // regrow to 3
    cluster.settle(300);
    let after: HashMap<Index, Rank> = cluster
        .nodes_in_state(1, JobState::Active)
        .into_iter()
        .map(|(rank, index)| (index, rank))
        .collect();
    assert_eq!(after.len(), 3);
    assert_eq!(before.get(&0), after.get(&0));
    // The dormant copies were reactivated rather than freshly adopted: the
    // child slots are filled by the same two ranks as before (their sides
    // may swap, since dormant children are tried in leave order).
    let children = |map: &HashMap<Index, Rank>| -> HashSet<Rank> {
        [1, 2].iter().filter_map(|i| map.get(i)).copied().collect()
    };
    assert_eq!(children(&before), children(&after));
}
