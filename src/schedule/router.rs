use super::request::JobRequest;
use crate::util::permutation::{expander_neighbors, AdjustablePermutation};
use crate::Rank;

use itertools::Itertools as _;
use log::debug;
use rand::Rng as _;
use std::collections::VecDeque;

/// Where to move a job request next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// Bounce the request to this rank.
    Forward(Rank),
    /// Hand the request to the collective assignment helper.
    Collective,
}

/// Routes job requests across the fleet's fixed expander graph until a
/// willing adopter is found. In derandomized mode a bounce picks a random
/// neighbor from the worker's fixed edge set; otherwise it follows a
/// pseudorandom permutation derived from the request identity, which makes
/// whole bounce chains reproducible. Either way, a bounce avoids returning
/// the request to its sender or its requester when alternatives exist.
pub struct RequestRouter {
    rank: Rank,
    num_workers: u32,
    derandomize: bool,
    hops_until_collective: i32,
    reactivation_scheduling: bool,
    neighbors: Vec<Rank>,
}

impl RequestRouter {
    pub fn new(
        rank: Rank,
        num_workers: u32,
        num_bounce_alternatives: u32,
        derandomize: bool,
        hops_until_collective: i32,
        reactivation_scheduling: bool,
    ) -> Self {
        // At most half the fleet can serve as bounce alternatives.
        let mut alternatives = num_bounce_alternatives;
        if 2 * alternatives > num_workers {
            alternatives = num_workers / 2;
            log::warn!(
                "number of bounce alternatives must be at most half the fleet, using {alternatives}"
            );
        }
        let neighbors = expander_neighbors(num_workers, alternatives, rank);
        debug!("rank {rank} bounce alternatives: {}", neighbors.iter().join(" "));
        Self {
            rank,
            num_workers,
            derandomize,
            hops_until_collective,
            reactivation_scheduling,
            neighbors,
        }
    }

    /// This worker's outgoing edges in the expander graph.
    pub fn neighbors(&self) -> &[Rank] {
        &self.neighbors
    }

    /// Picks the next destination for a request whose hop count has already
    /// been incremented for this bounce.
    pub fn route(&self, req: &JobRequest, sender: Rank) -> Route {
        if self.hops_until_collective >= 0
            && req.num_hops >= self.hops_until_collective
            && (self.reactivation_scheduling || req.requested_index > 0)
        {
            return Route::Collective;
        }
        if self.derandomize {
            Route::Forward(self.weighted_neighbor(req, sender))
        } else {
            Route::Forward(self.permutation_hop(req, sender))
        }
    }

    fn weighted_neighbor(&self, req: &JobRequest, sender: Rank) -> Rank {
        let mut rng = rand::thread_rng();
        let mut next = self.neighbors[rng.gen_range(0..self.neighbors.len())];
        if self.neighbors.len() > 2 {
            while next == req.requesting_rank || next == sender {
                next = self.neighbors[rng.gen_range(0..self.neighbors.len())];
            }
        }
        next
    }

    fn permutation_hop(&self, req: &JobRequest, sender: Rank) -> Rank {
        let n = self.num_workers;
        let seed = 3 * u64::from(req.job_id)
            + 7 * u64::from(req.requested_index)
            + 11 * u64::from(req.requesting_rank);
        let perm = AdjustablePermutation::new(n, seed);
        let mut position = req.num_hops.max(0) as usize % n as usize;
        let mut next = perm.get(position);
        if n > 3 {
            while next == self.rank || next == req.requesting_rank || next == sender {
                position = (position + 1) % n as usize;
                next = perm.get(position);
            }
        }
        next
    }
}

/// What to do with a collectively assigned request.
#[derive(Clone, Debug, PartialEq)]
pub enum CollectiveAction {
    /// Process the request locally, as if freshly received.
    Inject(JobRequest),
    /// Pass the request along the given edge.
    Forward(Rank, JobRequest),
}

/// Parks requests that hopped too long, matching them against this worker's
/// idleness instead of bouncing further. An idle worker absorbs one parked
/// request per balancing round; a busy one pushes its backlog along its best
/// outgoing edge once its status changed.
#[derive(Default)]
pub struct CollectiveAssignment {
    queued: VecDeque<JobRequest>,
    status_dirty: bool,
    best_edge: Option<Rank>,
}

impl CollectiveAssignment {
    pub fn new(best_edge: Option<Rank>) -> Self {
        Self { queued: VecDeque::new(), status_dirty: false, best_edge }
    }

    pub fn add_request(&mut self, req: JobRequest) {
        self.queued.push_back(req);
    }

    /// Marks the local idle/busy status as changed since the last round.
    pub fn set_status_dirty(&mut self) {
        self.status_dirty = true;
    }

    pub fn has_requests(&self) -> bool {
        !self.queued.is_empty()
    }

    pub fn advance(&mut self, idle: bool) -> Vec<CollectiveAction> {
        if self.queued.is_empty() {
            self.status_dirty = false;
            return Vec::new();
        }
        if idle {
            self.status_dirty = false;
            return self.queued.pop_front().map(CollectiveAction::Inject).into_iter().collect();
        }
        if !self.status_dirty {
            return Vec::new();
        }
        self.status_dirty = false;
        match self.best_edge {
            Some(edge) => {
                self.queued.drain(..).map(|req| CollectiveAction::Forward(edge, req)).collect()
            }
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::AppKind;

    fn request(num_hops: i32, requested_index: u32) -> JobRequest {
        JobRequest {
            job_id: 7,
            application: AppKind::Demo,
            root_rank: 0,
            requesting_rank: 2,
            requested_index,
            current_revision: 0,
            last_known_revision: -1,
            time_of_birth: 0.0,
            num_hops,
            balancing_epoch: 1,
        }
    }

    fn router(rank: Rank, hops_until_collective: i32) -> RequestRouter {
        RequestRouter::new(rank, 8, 3, false, hops_until_collective, false)
    }

    #[test]
    fn permutation_hop_avoids_self_sender_requester() {
        let router = router(0, -1);
        for hops in 0..32 {
            let Route::Forward(next) = router.route(&request(hops, 3), 5) else {
                panic!("expected a forward")
            };
            assert_ne!(next, 0, "bounced to self");
            assert_ne!(next, 2, "bounced back to requester");
            assert_ne!(next, 5, "bounced back to sender");
        }
    }

    #[test]
    fn permutation_hops_are_deterministic() {
        let a = router(1, -1);
        let b = router(1, -1);
        for hops in 0..8 {
            assert_eq!(a.route(&request(hops, 3), 0), b.route(&request(hops, 3), 0));
        }
    }

    #[test]
    fn collective_assignment_after_threshold() {
        let router = router(0, 4);
        assert!(matches!(router.route(&request(3, 3), 5), Route::Forward(_)));
        assert_eq!(router.route(&request(4, 3), 5), Route::Collective);
        // Root requests keep bouncing unless reactivation scheduling owns
        // the leave/join semantics.
        assert!(matches!(router.route(&request(4, 0), 5), Route::Forward(_)));
    }

    #[test]
    fn weighted_mode_stays_within_neighbors() {
        let router = RequestRouter::new(0, 8, 3, true, -1, false);
        for _ in 0..32 {
            let Route::Forward(next) = router.route(&request(1, 3), 5) else {
                panic!("expected a forward")
            };
            assert!(router.neighbors().contains(&next));
            assert_ne!(next, 2);
            assert_ne!(next, 5);
        }
    }

    #[test]
    fn collective_queue_injects_when_idle() {
        let mut coll = CollectiveAssignment::new(Some(3));
        coll.add_request(request(8, 3));
        coll.add_request(request(8, 4));
        assert_eq!(coll.advance(false), vec![]); // busy, status unchanged
        let actions = coll.advance(true);
        assert!(matches!(actions.as_slice(), [CollectiveAction::Inject(_)]));
        coll.set_status_dirty();
        let actions = coll.advance(false);
        assert!(matches!(actions.as_slice(), [CollectiveAction::Forward(3, _)]));
        assert!(!coll.has_requests());
    }
}
