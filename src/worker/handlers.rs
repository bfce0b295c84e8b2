//! Message handlers: the adoption handshake on both sides, description and
//! result transfers, leave notifications, and top-down interruption.

use super::Worker;
use crate::comm::{MessageHandle, Tag};
use crate::encoding::bincode;
use crate::encoding::wire::{self, Wire};
use crate::error::{Error, Result};
use crate::schedule::sysstate::NUM_HOPS;
use crate::schedule::{
    Adoption, JobDescription, JobMessage, JobRequest, JobResult, JobState, JobStatistics,
    OneshotRejection, RequestMode, Side,
};
use crate::{JobId, Rank, Revision};

use log::{debug, info, warn};
use std::collections::BTreeSet;

impl Worker {
    pub(super) fn handle_request_node(
        &mut self,
        handle: &mut MessageHandle,
        mode: RequestMode,
    ) -> Result<()> {
        let req = JobRequest::from_bytes(handle.payload())?;
        self.handle_request(handle.source, req, mode)
    }

    /// Decides the fate of an incoming job request: adopt, defer, or move it
    /// along.
    pub(super) fn handle_request(
        &mut self,
        sender: Rank,
        mut req: JobRequest,
        mode: RequestMode,
    ) -> Result<()> {
        if self.db.is_request_obsolete(&req) {
            debug!("DISCARD {req} mode={mode:?}");
            if self.cfg.hops_until_collective_assignment >= 0 {
                self.coll_assign.set_status_dirty();
            }
            return Ok(());
        }

        if req.requested_index == 0 && req.num_hops == 0 {
            // A fresh job enters the fleet; it starts hopping once its first
            // volume arrives.
            self.db.add_root_request(req);
            return Ok(());
        }

        if req.balancing_epoch > self.db.global_epoch() {
            // From a future epoch: defer until it is from the present.
            self.db.add_future_request(sender, mode, req);
            return Ok(());
        }

        // A newer handshake for the slot we are committed to wins the race;
        // the would-be parent of the cancelled commitment learns we left.
        if let Some(cancelled) = self.db.cancel_stale_commitment(&req, self.now) {
            self.comm.send(
                cancelled.requesting_rank,
                Tag::NotifyNodeLeavingJob,
                wire::encode_i32s(&[
                    cancelled.job_id as i32,
                    cancelled.requested_index as i32,
                    cancelled.root_rank as i32,
                ]),
            );
        }

        if self.cfg.reactivation_scheduling && mode == RequestMode::TargetedRejoin {
            // The request doubles as the notification that the current
            // scheduling no longer needs this dormant node to wait.
            if let Some(job) = self.db.get_mut(req.job_id) {
                job.tree_mut().stop_waiting_for_reactivation(req.balancing_epoch);
            }
            if self.cfg.hops_until_collective_assignment >= 0 {
                self.coll_assign.set_status_dirty();
            }
        }
        let adoption = if self.cfg.reactivation_scheduling
            && mode != RequestMode::TargetedRejoin
            && self.db.has_inactive_jobs_waiting_for_reactivation()
        {
            // While any inactive job node is still waiting for its
            // reactivation notice, only targeted requests get through.
            Adoption::Reject
        } else {
            self.db.try_adopt(&req, mode)
        };

        match adoption {
            Adoption::FromIdle | Adoption::ReplaceCurrent(_) => {
                if let Adoption::ReplaceCurrent(removed) = adoption {
                    if let Some(job) = self.db.get(removed) {
                        self.comm.send(
                            job.tree().parent_rank(),
                            Tag::NotifyNodeLeavingJob,
                            wire::encode_i32s(&[
                                removed as i32,
                                job.index() as i32,
                                job.tree().root_rank() as i32,
                            ]),
                        );
                    }
                    self.db.uncommit(removed, self.now);
                    self.db.unregister_job_from_balancer(removed);
                }

                info!("ADOPT {req} mode={mode:?}");
                debug_assert!(!self.db.is_busy_or_committed(), "adopting while not idle");
                let job_id = req.job_id;
                let offer_tag = if req.requested_index == 0 {
                    Tag::OfferAdoptionOfRoot
                } else {
                    Tag::OfferAdoption
                };
                let dest = req.requesting_rank;
                if !self.db.has(job_id) {
                    self.db.create_job(job_id, req.application, self.now);
                }
                self.db.commit(req, self.now);
                let committed = self.db.commitment(job_id).expect("commitment just made").clone();
                self.comm.send(dest, offer_tag, committed.to_bytes());
            }
            Adoption::Reject => {
                if req.requested_index == 0
                    && self.db.get(req.job_id).is_some_and(|job| job.is_dormant_root())
                {
                    // This worker holds the dormant root but cannot adopt
                    // right now; retry once the commitment can be broken.
                    debug!("defer pending root reactivation {req}");
                    self.db.set_pending_root_reactivation(req);
                } else if mode == RequestMode::TargetedRejoin {
                    let still_dormant = self.db.has_dormant_job(req.job_id);
                    debug!("REJECT {req} myepoch={}", self.db.global_epoch());
                    let rejection =
                        OneshotRejection { request: req, is_child_still_dormant: still_dormant };
                    self.comm.send(sender, Tag::RejectOneshot, rejection.to_bytes());
                } else if self.db.committed_job_id() == Some(req.job_id) {
                    // A handshake for this job is in flight; wait it out
                    // briefly instead of bouncing into the race.
                    self.db.defer_request(self.now, sender, req);
                } else {
                    self.bounce_job_request(&mut req, sender);
                }
            }
        }
        Ok(())
    }

    /// A dormant child declined a oneshot request: try the next dormant
    /// child, falling back to normal hopping once the cache is exhausted.
    pub(super) fn handle_reject_oneshot(&mut self, handle: &mut MessageHandle) -> Result<()> {
        let rejection = OneshotRejection::from_bytes(handle.payload())?;
        let mut req = rejection.request;
        debug!("{req} rejected by dormant child {}", handle.source);

        if self.db.is_adoption_offer_obsolete(&req, false) {
            return Ok(());
        }
        let Some(job) = self.db.get_mut(req.job_id) else { return Ok(()) };
        if !rejection.is_child_still_dormant {
            job.tree_mut().remove_dormant_child(handle.source);
        }

        let mut fall_back_to_hopping = false;
        if req.num_hops > self.cfg.job_cache_size.max(2) as i32 {
            fall_back_to_hopping = true;
        } else {
            match job.tree_mut().next_dormant_child() {
                Some(rank) if rank != handle.source => {
                    req.num_hops += 1;
                    self.sys_state.add_local(NUM_HOPS, 1.0);
                    debug!("querying dormant child {rank} for {req}");
                    self.send_spawned_request(rank, Tag::RequestNodeOneshot, &req);
                }
                _ => fall_back_to_hopping = true,
            }
        }

        if fall_back_to_hopping {
            debug!("{req} : switching to normal hops");
            req.num_hops = -1;
            self.bounce_job_request(&mut req, handle.source);
        }
        Ok(())
    }

    /// The requester's side of the handshake: accept the first valid offer
    /// for a slot, mark the adoptee as child, and decline the rest.
    pub(super) fn handle_offer_adoption(&mut self, handle: &mut MessageHandle) -> Result<()> {
        let req = JobRequest::from_bytes(handle.payload())?;
        debug!("adoption offer from {} for {req}", handle.source);

        let reject = if self.db.is_adoption_offer_obsolete(&req, true) {
            info!("REJECT {req} offered by {}", handle.source);
            true
        } else {
            let job = self.db.get_mut(req.job_id).expect("offer for resident job");
            job.tree_mut().set_child(handle.source, req.requested_index);
            false
        };

        self.comm.send(
            handle.source,
            Tag::AnswerAdoptionOffer,
            wire::encode_i32s(&[req.job_id as i32, i32::from(!reject)]),
        );
        Ok(())
    }

    /// The client's side of a root offer: the first worker to offer the root
    /// of an introduced job gets it.
    pub(super) fn handle_offer_adoption_of_root(
        &mut self,
        handle: &mut MessageHandle,
    ) -> Result<()> {
        let req = JobRequest::from_bytes(handle.payload())?;
        let accept = match self.client_jobs.get_mut(&req.job_id) {
            Some(job) if !job.done && job.root_rank.is_none() => {
                info!("job #{} rooted at rank {}", req.job_id, handle.source);
                job.root_rank = Some(handle.source);
                true
            }
            _ => false,
        };
        self.comm.send(
            handle.source,
            Tag::AnswerAdoptionOffer,
            wire::encode_i32s(&[req.job_id as i32, i32::from(accept)]),
        );
        Ok(())
    }

    /// The adoptee learns the verdict: on acceptance it activates (after
    /// closing any revision gap); on rejection it uncommits and goes idle.
    pub(super) fn handle_answer_adoption_offer(
        &mut self,
        handle: &mut MessageHandle,
    ) -> Result<()> {
        let values = wire::decode_i32s(handle.payload(), 2)?;
        let job_id = values[0] as JobId;
        let accepted = values[1] == 1;

        if !self.db.has_commitment(job_id) {
            warn!("job commitment for #{job_id} not present despite adoption answer");
            return Ok(());
        }
        let req = self.db.commitment(job_id).expect("checked commitment").clone();

        if !accepted {
            debug!("rejected by {} to join #{job_id}; uncommitting", handle.source);
            self.db.uncommit(job_id, self.now);
            self.db.unregister_job_from_balancer(job_id);
            return Ok(());
        }

        // Check and apply the job's current volume; the commitment may be
        // cancelled right here if the job shrank in the meantime.
        self.initiate_volume_update(job_id);
        if !self.db.has_commitment(job_id) {
            return Ok(());
        }

        let job = self.db.get_mut(job_id).expect("committed job is resident");
        job.set_desired_revision(req.current_revision);
        if !job.has_description() || job.revision() < req.current_revision {
            // At least one revision must be transferred before or while the
            // job runs.
            let next_revision = if job.has_description() { job.revision() + 1 } else { 0 };
            self.comm.send(
                handle.source,
                Tag::QueryJobDescription,
                wire::encode_i32s(&[job_id as i32, next_revision]),
            );
        }
        if self.db.get(job_id).expect("resident").has_description() {
            self.activate_committed_job(job_id, req)?;
        }
        Ok(())
    }

    /// Turns the commitment into an active job node, resuming a dormant copy
    /// where one exists.
    fn activate_committed_job(&mut self, job_id: JobId, req: JobRequest) -> Result<()> {
        self.db.uncommit(job_id, self.now);
        if self.db.get(job_id).is_some_and(|job| job.is_dormant()) {
            self.db.reactivate(job_id, self.now);
        } else {
            let app = self.apps.create(req.application)?;
            self.db.execute(job_id, app, self.now)?;
        }
        Ok(())
    }

    pub(super) fn handle_query_job_description(
        &mut self,
        handle: &mut MessageHandle,
    ) -> Result<()> {
        let values = wire::decode_i32s(handle.payload(), 2)?;
        let job_id = values[0] as JobId;
        let revision = values[1];

        // The client serves descriptions of the jobs it introduced.
        if let Some(client) = self.client_jobs.get(&job_id) {
            if let Some(data) = usize::try_from(revision).ok().and_then(|r| client.revisions.get(r))
            {
                let data = (**data).clone();
                self.comm.send(handle.source, Tag::SendJobDescription, data);
            }
            return Ok(());
        }

        let Some(job) = self.db.get_mut(job_id) else {
            warn!("description query for unknown job #{job_id}");
            return Ok(());
        };
        if job.revision() >= revision {
            self.send_revision_description(job_id, revision, handle.source);
        } else {
            // Not present yet: park the query and serve it on arrival.
            job.waiting_for_revision().push((handle.source, revision));
        }
        Ok(())
    }

    pub(super) fn send_revision_description(
        &mut self,
        job_id: JobId,
        revision: Revision,
        dest: Rank,
    ) {
        let Some(data) = self.db.get(job_id).and_then(|job| job.serialized_revision(revision))
        else {
            return;
        };
        debug!("sending description of #{job_id} rev. {revision} ({} bytes) to {dest}", data.len());
        self.comm.send(dest, Tag::SendJobDescription, (*data).clone());
    }

    pub(super) fn handle_send_job_description(
        &mut self,
        handle: &mut MessageHandle,
    ) -> Result<()> {
        let data = handle.take_payload();
        let desc = JobDescription::from_bytes(&data)?;
        let job_id = desc.job_id;
        debug!("got description of #{job_id} rev. {} ({} bytes)", desc.revision, data.len());
        if !self.db.has(job_id) {
            return Ok(());
        }

        if !self.db.get_mut(job_id).expect("resident").append_revision(data)? {
            return Ok(());
        }

        // If the job has not started yet, execute it now.
        if self.db.has_commitment(job_id) {
            let req = self.db.commitment(job_id).expect("checked").clone();
            self.db.get_mut(job_id).expect("resident").set_desired_revision(req.current_revision);
            self.activate_committed_job(job_id, req)?;
            self.initiate_volume_update(job_id);
        }

        let job = self.db.get(job_id).expect("resident");
        if job.state() != JobState::Active {
            return Ok(());
        }
        if job.revision() < job.desired_revision() {
            // Not at the final revision: query the next one.
            let next_revision = job.revision() + 1;
            self.comm.send(
                handle.source,
                Tag::QueryJobDescription,
                wire::encode_i32s(&[job_id as i32, next_revision]),
            );
        }
        Ok(())
    }

    pub(super) fn handle_query_volume(&mut self, handle: &mut MessageHandle) -> Result<()> {
        let values = wire::decode_i32s(handle.payload(), 1)?;
        let job_id = values[0] as JobId;
        let Some(job) = self.db.get(job_id) else { return Ok(()) };

        let volume = job.volume();
        if job.state() == JobState::Active && volume == 0 {
            // Unknown right now: query the parent recursively; the answer
            // will flood back down the subtree.
            let parent = job.tree().parent_rank();
            self.comm.send(parent, Tag::QueryVolume, wire::encode_i32s(&[job_id as i32]));
            return Ok(());
        }

        debug!("answering #{job_id} volume query from {} with v={volume}", handle.source);
        self.comm.send(
            handle.source,
            Tag::NotifyVolumeUpdate,
            wire::encode_i32s(&[job_id as i32, volume as i32, self.db.global_epoch()]),
        );
        Ok(())
    }

    pub(super) fn handle_notify_volume_update(
        &mut self,
        handle: &mut MessageHandle,
    ) -> Result<()> {
        let values = wire::decode_i32s(handle.payload(), 3)?;
        let job_id = values[0] as JobId;
        let volume = values[1] as u32;
        let epoch = values[2];
        if !self.db.has(job_id) && !self.db.has_root_request(job_id) {
            warn!("volume update for unknown job #{job_id}");
            return Ok(());
        }
        self.update_volume(job_id, volume, epoch);
        Ok(())
    }

    /// A node left the job: prune it and look for a replacement if the slot
    /// is still inside the volume.
    pub(super) fn handle_notify_node_leaving_job(
        &mut self,
        handle: &mut MessageHandle,
    ) -> Result<()> {
        let values = wire::decode_i32s(handle.payload(), 3)?;
        let job_id = values[0] as JobId;
        let index = values[1] as u32;
        let root_rank = values[2] as Rank;

        if !self.db.has(job_id) {
            // Not resident here (e.g. we left too): pass it to the root.
            self.comm.send(root_rank, Tag::NotifyNodeLeavingJob, handle.take_payload());
            return Ok(());
        }

        let job = self.db.get_mut(job_id).expect("resident");
        let pruned = job.tree_mut().prune(handle.source, index);
        let volume = job.volume();
        if let Some(side) = pruned {
            if index < volume {
                info!("{} : looking for replacement at index {index}", self.db.get(job_id).unwrap());
                self.spawn_job_request(job_id, side, self.db.global_epoch());
            }
        }

        // The leave may have made the job willing to communicate.
        self.communicate(job_id);
        Ok(())
    }

    /// The root learns a node solved the job. Obsolete findings are waved
    /// off; a fresh one terminates (or, for incremental jobs, interrupts)
    /// the tree and notifies the client.
    pub(super) fn handle_notify_result_found(
        &mut self,
        handle: &mut MessageHandle,
    ) -> Result<()> {
        let values = wire::decode_i32s(handle.payload(), 3)?;
        let job_id = values[0] as JobId;
        let revision = values[1];

        let obsolete = match self.db.get(job_id) {
            Some(job) if job.tree().is_root() => {
                job.revision() > revision || job.is_revision_solved(revision)
            }
            _ => {
                warn!("invalid addressee for result of #{job_id}");
                true
            }
        };
        if obsolete {
            debug!("discarding obsolete result for #{job_id} rev. {revision}");
            self.comm.send(
                handle.source,
                Tag::NotifyResultObsolete,
                wire::encode_i32s(&[job_id as i32, revision]),
            );
            return Ok(());
        }

        info!("#{job_id} rev. {revision} solved by rank {}", handle.source);
        let job = self.db.get_mut(job_id).expect("checked residency");
        job.set_revision_solved(revision);
        let incremental = job.description().is_some_and(|desc| desc.incremental);

        self.send_job_done_to_client(job_id, handle.source);
        if incremental {
            self.interrupt_job(job_id, false, false);
        } else {
            self.interrupt_job(job_id, true, false);
        }
        Ok(())
    }

    fn send_job_done_to_client(&mut self, job_id: JobId, successful_rank: Rank) {
        let Some(job) = self.db.get(job_id) else { return };
        let Some(client_rank) = job.description().map(|desc| desc.client_rank) else { return };
        let statistics = JobStatistics {
            job_id,
            successful_rank,
            used_wallclock_seconds: job.age_since_activation(self.now),
            used_cpu_seconds: job.used_cpu_seconds(self.now),
            latency_of_first_volume_update: job.latency_of_first_volume_update(),
        };
        debug!("{job} : informing client {client_rank} the job is done");
        match bincode::serialize(&statistics) {
            Ok(payload) => {
                self.comm.send(client_rank, Tag::NotifyJobDone, payload);
            }
            Err(err) => warn!("failed to serialize statistics of #{job_id}: {err}"),
        }
    }

    pub(super) fn handle_notify_result_obsolete(
        &mut self,
        handle: &mut MessageHandle,
    ) -> Result<()> {
        let values = wire::decode_i32s(handle.payload(), 1)?;
        let job_id = values[0] as JobId;
        if let Some(job) = self.db.get_mut(job_id) {
            debug!("result of {job} unwanted");
            job.set_result_transfer_pending(false);
        }
        Ok(())
    }

    /// The client wants the full result from the node that found it.
    pub(super) fn handle_query_job_result(&mut self, handle: &mut MessageHandle) -> Result<()> {
        let values = wire::decode_i32s(handle.payload(), 1)?;
        let job_id = values[0] as JobId;
        let Some(result) = self.db.get(job_id).and_then(|job| job.result()) else {
            warn!("result query for #{job_id} which holds no result");
            return Ok(());
        };
        info!("sending result of #{job_id} rev. {} to client {}", result.revision, handle.source);
        self.comm.send(handle.source, Tag::SendJobResult, bincode::serialize(&result)?);
        if let Some(job) = self.db.get_mut(job_id) {
            job.set_result_transfer_pending(false);
        }
        Ok(())
    }

    pub(super) fn handle_send_job_result(&mut self, handle: &mut MessageHandle) -> Result<()> {
        let result: JobResult = bincode::deserialize(handle.payload())?;
        if let Some(client) = self.client_jobs.get_mut(&result.job_id) {
            info!("job #{} done with result code {}", result.job_id, result.result_code);
            client.result = Some(result);
            client.done = true;
            if self.cfg.mono {
                self.terminator.set();
            }
        }
        Ok(())
    }

    pub(super) fn handle_notify_job_done(&mut self, handle: &mut MessageHandle) -> Result<()> {
        let statistics: JobStatistics = bincode::deserialize(handle.payload())?;
        let job_id = statistics.job_id;
        let successful_rank = statistics.successful_rank;
        if let Some(client) = self.client_jobs.get_mut(&job_id) {
            if client.statistics.is_none() {
                client.statistics = Some(statistics);
                self.comm.send(
                    successful_rank,
                    Tag::QueryJobResult,
                    wire::encode_i32s(&[job_id as i32]),
                );
            }
        }
        Ok(())
    }

    pub(super) fn handle_notify_job_terminating(
        &mut self,
        handle: &mut MessageHandle,
    ) -> Result<()> {
        let values = wire::decode_i32s(handle.payload(), 1)?;
        self.interrupt_job(values[0] as JobId, true, false);
        Ok(())
    }

    pub(super) fn handle_interrupt(&mut self, handle: &mut MessageHandle) -> Result<()> {
        let values = wire::decode_i32s(handle.payload(), 1)?;
        self.interrupt_job(values[0] as JobId, false, false);
        Ok(())
    }

    pub(super) fn handle_notify_job_aborting(&mut self, handle: &mut MessageHandle) -> Result<()> {
        let values = wire::decode_i32s(handle.payload(), 1)?;
        let job_id = values[0] as JobId;
        if !self.db.has(job_id) {
            return Ok(());
        }
        let root = self.db.get(job_id).is_some_and(|job| job.tree().is_root());
        let parent = self.db.get(job_id).map(|job| job.tree().parent_rank());
        self.interrupt_job(job_id, true, true);
        if root {
            // Forward the abort notice to the client.
            if let Some(client_rank) = parent {
                self.comm.send(
                    client_rank,
                    Tag::NotifyClientJobAborting,
                    wire::encode_i32s(&[job_id as i32]),
                );
            }
        }
        Ok(())
    }

    pub(super) fn handle_incremental_job_finished(
        &mut self,
        handle: &mut MessageHandle,
    ) -> Result<()> {
        let values = wire::decode_i32s(handle.payload(), 1)?;
        let job_id = values[0] as JobId;
        if self.db.has(job_id) {
            info!("incremental job #{job_id} done");
            self.interrupt_job(job_id, true, false);
        }
        Ok(())
    }

    pub(super) fn handle_notify_client_job_aborting(
        &mut self,
        handle: &mut MessageHandle,
    ) -> Result<()> {
        let values = wire::decode_i32s(handle.payload(), 1)?;
        let job_id = values[0] as JobId;
        if let Some(client) = self.client_jobs.get_mut(&job_id) {
            info!("job #{job_id} aborted");
            client.done = true;
        }
        Ok(())
    }

    pub(super) fn handle_application_message(
        &mut self,
        handle: &mut MessageHandle,
    ) -> Result<()> {
        let msg = JobMessage::from_bytes(handle.payload())?;
        if !msg.verify_checksum() {
            return Err(Error::BadRequest(format!(
                "application message for #{} fails its checksum",
                msg.job_id
            )));
        }
        let Some(job) = self.db.get_mut(msg.job_id) else {
            warn!("application message for unknown job #{}", msg.job_id);
            return Ok(());
        };
        if job.state() == JobState::Active {
            let source = handle.source;
            if let Some(app) = job.app_mut() {
                app.handle_message(source, msg);
            }
        }
        Ok(())
    }

    pub(super) fn handle_do_exit(&mut self, _handle: &mut MessageHandle) -> Result<()> {
        info!("rank {}: exit requested", self.rank);
        self.terminator.set();
        Ok(())
    }

    /// Propagates an interruption down the tree and to past children, then
    /// suspends or terminates the local node. Terminate moves the job to
    /// Past; interrupt moves Active to Suspended.
    pub(super) fn interrupt_job(&mut self, job_id: JobId, terminate: bool, reckless: bool) {
        let Some(job) = self.db.get(job_id) else { return };
        // Already in the goal state, implying the message was forwarded
        // downwards before.
        if !terminate && job.state() == JobState::Suspended {
            return;
        }
        if terminate && job.state() == JobState::Past {
            return;
        }

        let tag = match (terminate, reckless) {
            (true, true) => Tag::NotifyJobAborting,
            (true, false) => Tag::NotifyJobTerminating,
            (false, _) => Tag::Interrupt,
        };
        let mut targets: BTreeSet<Rank> = job.tree().past_children().collect();
        targets.extend(job.tree().child_rank(Side::Left));
        targets.extend(job.tree().child_rank(Side::Right));
        for rank in targets {
            debug!("propagating interruption of #{job_id} to rank {rank}");
            self.comm.send(rank, tag, wire::encode_i32s(&[job_id as i32]));
        }

        let job = self.db.get_mut(job_id).expect("resident");
        if terminate {
            job.tree_mut().clear_past_children();
            self.db.terminate(job_id, self.now);
        } else if job.state() == JobState::Active {
            self.db.suspend(job_id, self.now);
        }
    }
}
