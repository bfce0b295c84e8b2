//! Volume update propagation: upon a new volume for a job, each tree node
//! locally decides to grow, shrink, stay, uncommit, or suspend, emits
//! child-directed updates and spawn requests, and keeps the desire flags
//! honest.

use super::Worker;
use crate::comm::Tag;
use crate::encoding::wire::{self, Wire};
use crate::schedule::sysstate::{NUM_HOPS, SPAWNED_REQUESTS};
use crate::schedule::{JobRequest, JobState, Route, Side};
use crate::{Epoch, JobId, Rank};

use log::{debug, info, warn};

impl Worker {
    /// Checks and applies the currently known volume of a freshly adopted
    /// job, so a node that joined late still grows or shrinks correctly.
    pub(super) fn initiate_volume_update(&mut self, job_id: JobId) {
        let Some(job) = self.db.get(job_id) else { return };
        if self.cfg.explicit_volume_updates {
            if job.tree().is_root() {
                // The root triggers growth by replaying its own volume.
                if job.volume() > 1 {
                    self.update_volume(job_id, job.volume(), self.db.global_epoch());
                }
            } else {
                // Inner nodes query their parent.
                let parent = job.tree().parent_rank();
                self.comm.send(parent, Tag::QueryVolume, wire::encode_i32s(&[job_id as i32]));
            }
        } else {
            if self.db.global_epoch() < job.epoch_of_last_commitment() {
                // The balancing epoch which caused this job node is not
                // present yet.
                return;
            }
            if let Some(volume) = self.db.volume(job_id) {
                self.update_volume(job_id, volume, self.db.global_epoch());
            }
        }
    }

    /// Applies a new volume to this worker's node of the job, deciding
    /// growth and shrink per side and propagating the update down the tree.
    pub(super) fn update_volume(&mut self, job_id: JobId, volume: u32, epoch: Epoch) {
        let now = self.now;
        if !self.db.has(job_id) {
            // A root request parked here becomes live with its first volume.
            if let Some(mut req) = self.db.take_root_request(job_id) {
                info!("activating root request {req}");
                let requester = req.requesting_rank;
                self.bounce_job_request(&mut req, requester);
            }
            return;
        }

        let job = self.db.get_mut(job_id).expect("resident");
        let this_index = job.index();
        let prev_volume = job.volume();
        job.update_volume(volume, now);
        debug!(
            "{job} : update v={volume} epoch={epoch} lastreqsepoch={}",
            job.tree().epoch_of_last_requests()
        );

        let was_waiting = job.tree().is_waiting_for_reactivation();
        job.tree_mut().stop_waiting_for_reactivation(epoch - 1);
        if self.cfg.hops_until_collective_assignment >= 0 {
            self.coll_assign.set_status_dirty();
        }

        if job.state() != JobState::Active {
            self.update_volume_of_inactive(job_id, this_index, prev_volume, volume, epoch, was_waiting);
            return;
        }

        // For each potential child: propagate the update, prune or grow.
        let mut suspended_for_dormant_root = false;
        for side in [Side::Left, Side::Right] {
            let job = self.db.get(job_id).expect("resident");
            let child_index = job.tree().child_index(side);
            if let Some(child_rank) = job.tree().child_rank(side) {
                if self.cfg.explicit_volume_updates {
                    self.comm.send(
                        child_rank,
                        Tag::NotifyVolumeUpdate,
                        wire::encode_i32s(&[job_id as i32, volume as i32, epoch]),
                    );
                }
                if self.cfg.reactivation_scheduling && child_index >= volume {
                    // The child leaves; under reactivation scheduling it
                    // learns from its own update rather than a message.
                    self.db.get_mut(job_id).unwrap().tree_mut().prune(child_rank, child_index);
                }
            } else if child_index < volume && job.tree().epoch_of_last_requests() < epoch {
                if self.db.has_dormant_root() {
                    // Becoming an inner node is not acceptable while holding
                    // a dormant root, which could not be restarted
                    // seamlessly then.
                    debug!("{job} cannot grow due to dormant root");
                    let parent = job.tree().parent_rank();
                    let root = job.tree().root_rank();
                    self.db.suspend(job_id, now);
                    self.comm.send(
                        parent,
                        Tag::NotifyNodeLeavingJob,
                        wire::encode_i32s(&[job_id as i32, this_index as i32, root as i32]),
                    );
                    suspended_for_dormant_root = true;
                    break;
                }
                self.spawn_job_request(job_id, side, epoch);
            } else {
                // No (further) desire to grow on this side.
                self.db.get_mut(job_id).unwrap().tree_mut().unset_desire(side);
            }
        }

        if let Some(job) = self.db.get_mut(job_id) {
            job.tree_mut().set_epoch_of_last_requests(epoch);
        }

        // Shrink (and pause solving) if necessary.
        if !suspended_for_dormant_root && this_index > 0 && this_index >= volume {
            let job = self.db.get(job_id).expect("resident");
            info!("{job} shrinking");
            let parent = job.tree().parent_rank();
            let root = job.tree().root_rank();
            self.db.suspend(job_id, now);
            if !self.cfg.reactivation_scheduling {
                self.comm.send(
                    parent,
                    Tag::NotifyNodeLeavingJob,
                    wire::encode_i32s(&[job_id as i32, this_index as i32, root as i32]),
                );
            }
        }
    }

    /// The volume update rules for a node that is not running: a committed
    /// slot outside the volume is given up, and suspended nodes track
    /// whether they should await reactivation.
    fn update_volume_of_inactive(
        &mut self,
        job_id: JobId,
        this_index: u32,
        prev_volume: u32,
        volume: u32,
        epoch: Epoch,
        was_waiting: bool,
    ) {
        let now = self.now;
        if self.db.has_commitment(job_id) && this_index > 0 && this_index >= volume {
            // Shrunk while committed: give the slot back.
            debug!("#{job_id}:{this_index} shrunk : uncommitting");
            let (parent, root) = {
                let tree = self.db.get(job_id).expect("resident").tree();
                (tree.parent_rank(), tree.root_rank())
            };
            self.db.uncommit(job_id, now);
            self.db.unregister_job_from_balancer(job_id);
            if !self.cfg.reactivation_scheduling {
                self.comm.send(
                    parent,
                    Tag::NotifyNodeLeavingJob,
                    wire::encode_i32s(&[job_id as i32, this_index as i32, root as i32]),
                );
            }
        }

        let Some(job) = self.db.get_mut(job_id) else { return };
        if job.state() == JobState::Suspended {
            // Keep waiting if the volume covered this index before and
            // still does; start waiting if it newly does.
            let covered_before = this_index < prev_volume;
            let covered_now = this_index < volume;
            if (covered_before && covered_now && was_waiting) || (!covered_before && covered_now) {
                job.tree_mut().set_waiting_for_reactivation(epoch);
            }
        }
    }

    /// Spawns a request for the child slot on the given side, preferring a
    /// dormant child for a targeted rejoin over a fresh bounce.
    pub(super) fn spawn_job_request(&mut self, job_id: JobId, side: Side, epoch: Epoch) {
        let Some(job) = self.db.get(job_id) else { return };
        let index = job.tree().child_index(side);
        let req = JobRequest {
            job_id,
            application: job.kind(),
            root_rank: job.tree().root_rank(),
            requesting_rank: self.rank,
            requested_index: index,
            current_revision: job.desired_revision(),
            last_known_revision: job.revision(),
            time_of_birth: self.now as f32,
            num_hops: 0,
            balancing_epoch: epoch,
        };

        let job = self.db.get_mut(job_id).expect("resident");
        let (dest, tag) = match job.tree_mut().next_dormant_child() {
            Some(rank) => (rank, Tag::RequestNodeOneshot),
            None => (job.tree().preferred_child_rank(side), Tag::RequestNode),
        };
        job.tree_mut().set_desire(side, self.now);
        info!("#{job_id}:{} growing: {req} -> [{dest}]", job.index());
        self.send_spawned_request(dest, tag, &req);
    }

    /// Sends a freshly spawned request, counting it in the system state.
    pub(super) fn send_spawned_request(&mut self, dest: Rank, tag: Tag, req: &JobRequest) {
        if dest == self.rank {
            // The preferred rank may be this worker itself; hop onward
            // instead of self-adopting a second tree node.
            let mut bounced = req.clone();
            self.bounce_job_request(&mut bounced, self.rank);
            return;
        }
        self.comm.send(dest, tag, req.to_bytes());
        self.sys_state.add_local(SPAWNED_REQUESTS, 1.0);
    }

    /// Forwards a request to the next worker: one more hop, with a warning
    /// once the hop count reaches a large power of two, and a hand-off to
    /// collective assignment when configured.
    pub(super) fn bounce_job_request(&mut self, req: &mut JobRequest, sender: Rank) {
        req.num_hops += 1;
        self.sys_state.add_local(NUM_HOPS, 1.0);

        let hops = req.num_hops;
        if hops >= 512 && (hops & (hops - 1)) == 0 {
            warn!("{req} has been bouncing for {hops} hops");
        }

        match self.router.route(req, sender) {
            Route::Collective => self.coll_assign.add_request(req.clone()),
            Route::Forward(next) => {
                debug!("hop {req} -> [{next}]");
                self.comm.send(next, Tag::RequestNode, req.to_bytes());
            }
        }
    }
}
