use crate::util::AdjustablePermutation;
use crate::{Epoch, Index, JobId, Rank};

use std::collections::{BTreeSet, VecDeque};

/// A side of a binary tree node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// This worker's position in one job's binary tree of nodes. Cross-worker
/// links are plain ranks; no ownership crosses workers. The tree also keeps
/// the bookkeeping that drives growth: preferred child ranks from a per-job
/// permutation, dormant children for fast reattachment, past children for
/// reliable termination, and the desire flags of outstanding growth
/// requests.
pub struct JobTree {
    index: Index,
    /// For the root, the client rank that introduced the job.
    parent_rank: Rank,
    root_rank: Rank,
    left_child: Option<Rank>,
    right_child: Option<Rank>,
    /// Ranks that have ever been children, kept to propagate termination.
    past_children: BTreeSet<Rank>,
    /// Ranks retained after a shrink for fast reattachment.
    dormant_children: VecDeque<Rank>,
    /// Times of the last outgoing growth request per side.
    desire_left: Option<f64>,
    desire_right: Option<f64>,
    waiting_for_reactivation_at: Option<Epoch>,
    epoch_of_last_requests: Epoch,
    /// Maps tree indexes to preferred fresh-growth ranks; identity in mono
    /// mode so a single job occupies ranks 0..volume.
    permutation: AdjustablePermutation,
    identity_permutation: bool,
}

impl JobTree {
    pub fn new(num_workers: u32, job_id: JobId, identity_permutation: bool) -> Self {
        Self {
            index: 0,
            parent_rank: 0,
            root_rank: 0,
            left_child: None,
            right_child: None,
            past_children: BTreeSet::new(),
            dormant_children: VecDeque::new(),
            desire_left: None,
            desire_right: None,
            waiting_for_reactivation_at: None,
            epoch_of_last_requests: -1,
            permutation: AdjustablePermutation::new(num_workers, 0x7ee0 + u64::from(job_id)),
            identity_permutation,
        }
    }

    /// Places this node in the tree, on commitment to a request.
    pub fn place(&mut self, index: Index, parent_rank: Rank, root_rank: Rank) {
        self.index = index;
        self.parent_rank = parent_rank;
        self.root_rank = root_rank;
    }

    pub fn index(&self) -> Index {
        self.index
    }

    pub fn is_root(&self) -> bool {
        self.index == 0
    }

    /// The parent's rank; for the root, the client's rank.
    pub fn parent_rank(&self) -> Rank {
        self.parent_rank
    }

    pub fn root_rank(&self) -> Rank {
        self.root_rank
    }

    pub fn left_child_index(&self) -> Index {
        2 * self.index + 1
    }

    pub fn right_child_index(&self) -> Index {
        2 * self.index + 2
    }

    pub fn has_left_child(&self) -> bool {
        self.left_child.is_some()
    }

    pub fn has_right_child(&self) -> bool {
        self.right_child.is_some()
    }

    pub fn child_rank(&self, side: Side) -> Option<Rank> {
        match side {
            Side::Left => self.left_child,
            Side::Right => self.right_child,
        }
    }

    pub fn child_index(&self, side: Side) -> Index {
        match side {
            Side::Left => self.left_child_index(),
            Side::Right => self.right_child_index(),
        }
    }

    /// The rank a fresh growth request for the given side is first sent to.
    pub fn preferred_child_rank(&self, side: Side) -> Rank {
        let index = self.child_index(side);
        if self.identity_permutation {
            index % self.permutation.len() as u32
        } else {
            self.permutation.get(index as usize)
        }
    }

    /// Marks the given rank as the child at `index`, returning which side it
    /// landed on. Returns None if the index is not a child index of this
    /// node (the root offer case, where index is 0).
    pub fn set_child(&mut self, rank: Rank, index: Index) -> Option<Side> {
        let side = self.side_of(index)?;
        match side {
            Side::Left => self.left_child = Some(rank),
            Side::Right => self.right_child = Some(rank),
        }
        self.past_children.insert(rank);
        self.dormant_children.retain(|&r| r != rank);
        match side {
            Side::Left => self.desire_left = None,
            Side::Right => self.desire_right = None,
        }
        Some(side)
    }

    /// Removes the child at (rank, index) if it is currently attached,
    /// keeping it as a dormant and past child. Returns the side it was
    /// detached from.
    pub fn prune(&mut self, rank: Rank, index: Index) -> Option<Side> {
        let side = self.side_of(index)?;
        if self.child_rank(side) != Some(rank) {
            return None;
        }
        match side {
            Side::Left => self.left_child = None,
            Side::Right => self.right_child = None,
        }
        self.add_dormant_child(rank);
        Some(side)
    }

    fn side_of(&self, index: Index) -> Option<Side> {
        if index == self.left_child_index() {
            Some(Side::Left)
        } else if index == self.right_child_index() {
            Some(Side::Right)
        } else {
            None
        }
    }

    pub fn add_dormant_child(&mut self, rank: Rank) {
        if !self.dormant_children.contains(&rank) {
            self.dormant_children.push_back(rank);
        }
    }

    pub fn remove_dormant_child(&mut self, rank: Rank) {
        self.dormant_children.retain(|&r| r != rank);
    }

    pub fn has_dormant_children(&self) -> bool {
        !self.dormant_children.is_empty()
    }

    /// The next dormant child to try for reattachment, cycling through the
    /// retained ranks.
    pub fn next_dormant_child(&mut self) -> Option<Rank> {
        let rank = self.dormant_children.pop_front()?;
        self.dormant_children.push_back(rank);
        Some(rank)
    }

    pub fn past_children(&self) -> impl Iterator<Item = Rank> + '_ {
        self.past_children.iter().copied()
    }

    pub fn clear_past_children(&mut self) {
        self.past_children.clear();
    }

    pub fn set_desire(&mut self, side: Side, time: f64) {
        match side {
            Side::Left => self.desire_left = Some(time),
            Side::Right => self.desire_right = Some(time),
        }
    }

    pub fn unset_desire(&mut self, side: Side) {
        match side {
            Side::Left => self.desire_left = None,
            Side::Right => self.desire_right = None,
        }
    }

    pub fn desire(&self, side: Side) -> Option<f64> {
        match side {
            Side::Left => self.desire_left,
            Side::Right => self.desire_right,
        }
    }

    /// Marks this (suspended) node as awaiting reactivation under the given
    /// epoch.
    pub fn set_waiting_for_reactivation(&mut self, epoch: Epoch) {
        self.waiting_for_reactivation_at = Some(epoch);
    }

    /// Clears the waiting flag if it was set at or before the given epoch.
    pub fn stop_waiting_for_reactivation(&mut self, epoch: Epoch) {
        if let Some(waiting) = self.waiting_for_reactivation_at {
            if waiting <= epoch {
                self.waiting_for_reactivation_at = None;
            }
        }
    }

    pub fn is_waiting_for_reactivation(&self) -> bool {
        self.waiting_for_reactivation_at.is_some()
    }

    pub fn epoch_of_last_requests(&self) -> Epoch {
        self.epoch_of_last_requests
    }

    pub fn set_epoch_of_last_requests(&mut self, epoch: Epoch) {
        self.epoch_of_last_requests = epoch;
    }
}
