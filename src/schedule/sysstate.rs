use crate::comm::{CommLink, MessageHandle, Tag};
use crate::encoding::wire;
use crate::error::Result;
use crate::Rank;

use log::debug;
use std::collections::HashMap;

/// Fields of the fleet-wide system state aggregate.
pub const BUSY_RATIO: usize = 0;
pub const COMMITTED_RATIO: usize = 1;
pub const NUM_JOBS: usize = 2;
pub const GLOBAL_MEM: usize = 3;
pub const SPAWNED_REQUESTS: usize = 4;
pub const NUM_HOPS: usize = 5;
pub const NUM_FIELDS: usize = 6;

/// A periodic all-reduce of per-worker counters. Contributions travel up a
/// binary tree over the ranks (parent of r is (r-1)/2) and the sum is
/// broadcast back down, so each round costs two messages per worker. Rounds
/// are numbered; a contribution for a round the local worker has not started
/// yet is parked until it has.
pub struct SystemState {
    rank: Rank,
    num_workers: u32,
    comm: CommLink,
    period: f64,
    local: [f32; NUM_FIELDS],
    global: [f32; NUM_FIELDS],
    round: u32,
    in_flight: bool,
    last_round: f64,
    /// Summed child contributions per round, with how many arrived.
    contributions: HashMap<u32, (u32, [f32; NUM_FIELDS])>,
    ready: bool,
}

impl SystemState {
    pub fn new(rank: Rank, num_workers: u32, period: f64, comm: CommLink) -> Self {
        Self {
            rank,
            num_workers,
            comm,
            period,
            local: [0.0; NUM_FIELDS],
            global: [0.0; NUM_FIELDS],
            round: 0,
            in_flight: false,
            last_round: 0.0,
            contributions: HashMap::new(),
            ready: false,
        }
    }

    pub fn set_local(&mut self, field: usize, value: f32) {
        self.local[field] = value;
    }

    pub fn add_local(&mut self, field: usize, delta: f32) {
        self.local[field] += delta;
    }

    pub fn global(&self) -> &[f32; NUM_FIELDS] {
        &self.global
    }

    fn children(&self) -> impl Iterator<Item = Rank> + '_ {
        [2 * self.rank + 1, 2 * self.rank + 2]
            .into_iter()
            .filter(|&child| child < self.num_workers)
    }

    fn num_children(&self) -> u32 {
        self.children().count() as u32
    }

    /// Starts a round if the period elapsed, and returns the aggregated
    /// result once a round has completed.
    pub fn aggregate(&mut self, now: f64) -> Option<[f32; NUM_FIELDS]> {
        if !self.in_flight && now - self.last_round >= self.period {
            self.round += 1;
            self.in_flight = true;
            self.last_round = now;
            if self.num_workers == 1 {
                self.global = self.local;
                self.in_flight = false;
                self.ready = true;
            } else if self.num_children() == 0 {
                // A leaf contributes immediately.
                self.send(self.parent(), Tag::ReduceData, self.local);
            } else {
                self.try_flush();
            }
        }
        if self.ready {
            self.ready = false;
            return Some(self.global);
        }
        None
    }

    /// Handles a ReduceData or BroadcastData message.
    pub fn handle(&mut self, handle: &mut MessageHandle) -> Result<()> {
        let payload = handle.take_payload();
        let mut offset = 0;
        let round = wire::get_u32(&payload, &mut offset)?;
        let mut values = [0.0; NUM_FIELDS];
        for value in &mut values {
            *value = wire::get_f32(&payload, &mut offset)?;
        }

        match handle.tag {
            Tag::ReduceData => {
                let (count, sum) = self.contributions.entry(round).or_insert((0, [0.0; NUM_FIELDS]));
                *count += 1;
                for (total, value) in sum.iter_mut().zip(values) {
                    *total += value;
                }
                self.try_flush();
            }
            Tag::BroadcastData => {
                self.global = values;
                self.round = self.round.max(round);
                self.in_flight = false;
                self.ready = true;
                for child in self.children().collect::<Vec<_>>() {
                    self.send(child, Tag::BroadcastData, self.global);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Completes this worker's part of the current round once all child
    /// contributions have arrived.
    fn try_flush(&mut self) {
        if !self.in_flight {
            return;
        }
        let complete = self
            .contributions
            .get(&self.round)
            .map_or(self.num_children() == 0, |(count, _)| *count == self.num_children());
        if !complete || self.num_children() == 0 {
            return;
        }
        let (_, sum) = self.contributions.remove(&self.round).unwrap();
        let mut combined = self.local;
        for (total, value) in combined.iter_mut().zip(sum) {
            *total += value;
        }
        if self.rank == 0 {
            debug!("system state round {} complete", self.round);
            self.global = combined;
            self.in_flight = false;
            self.ready = true;
            for child in self.children().collect::<Vec<_>>() {
                self.send(child, Tag::BroadcastData, self.global);
            }
        } else {
            self.send(self.parent(), Tag::ReduceData, combined);
        }
    }

    fn parent(&self) -> Rank {
        (self.rank - 1) / 2
    }

    fn send(&self, to: Rank, tag: Tag, values: [f32; NUM_FIELDS]) {
        let mut payload = Vec::with_capacity(4 + 4 * NUM_FIELDS);
        wire::put_u32(&mut payload, self.round);
        for value in values {
            wire::put_f32(&mut payload, value);
        }
        self.comm.send(to, tag, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{channel_mesh, MessageQueue};

    fn setup(n: u32) -> (Vec<MessageQueue<SystemState>>, Vec<SystemState>) {
        channel_mesh(n)
            .into_iter()
            .enumerate()
            .map(|(rank, transport)| {
                let mut queue = MessageQueue::new(rank as Rank, 4096, Box::new(transport));
                queue.register_callback(
                    Tag::ReduceData,
                    Box::new(|state: &mut SystemState, handle| state.handle(handle)),
                );
                queue.register_callback(
                    Tag::BroadcastData,
                    Box::new(|state: &mut SystemState, handle| state.handle(handle)),
                );
                let state = SystemState::new(rank as Rank, n, 1.0, queue.link());
                (queue, state)
            })
            .unzip()
    }

    /// Drains queues and polls aggregation round-robin, recording the first
    /// aggregate each worker reports.
    fn drive(
        queues: &mut [MessageQueue<SystemState>],
        states: &mut [SystemState],
        now: f64,
        rounds: usize,
    ) -> Vec<Option<[f32; NUM_FIELDS]>> {
        let mut results = vec![None; states.len()];
        for _ in 0..rounds {
            for (rank, (queue, state)) in
                queues.iter_mut().zip(states.iter_mut()).enumerate()
            {
                queue.advance(state).unwrap();
                if let Some(global) = state.aggregate(now) {
                    results[rank].get_or_insert(global);
                }
            }
        }
        results
    }

    #[test]
    fn three_workers_reduce_to_root_and_broadcast() {
        let (mut queues, mut states) = setup(3);
        for (rank, state) in states.iter_mut().enumerate() {
            state.set_local(BUSY_RATIO, 1.0);
            state.set_local(NUM_HOPS, 10.0 * (rank as f32 + 1.0));
        }

        let results = drive(&mut queues, &mut states, 2.0, 8);
        for (rank, result) in results.into_iter().enumerate() {
            let global = result.unwrap_or_else(|| panic!("rank {rank} saw no aggregate"));
            assert_eq!(global[BUSY_RATIO], 3.0);
            assert_eq!(global[NUM_HOPS], 60.0);
            assert_eq!(global[NUM_JOBS], 0.0);
        }
    }

    #[test]
    fn contribution_for_an_unstarted_round_is_parked() {
        let (mut queues, mut states) = setup(2);
        states[0].set_local(SPAWNED_REQUESTS, 5.0);
        states[1].set_local(SPAWNED_REQUESTS, 7.0);

        // The leaf concludes its part of the round before the root has even
        // started it.
        assert_eq!(states[1].aggregate(2.0), None);
        queues[1].advance(&mut states[1]).unwrap();
        queues[0].advance(&mut states[0]).unwrap();
        assert_eq!(states[0].global()[SPAWNED_REQUESTS], 0.0, "nothing completes before the round starts");

        // Starting the round finds the parked contribution and completes
        // immediately.
        let global = states[0].aggregate(2.0).expect("round completes on start");
        assert_eq!(global[SPAWNED_REQUESTS], 12.0);

        // The broadcast still reaches the leaf.
        queues[0].advance(&mut states[0]).unwrap();
        queues[1].advance(&mut states[1]).unwrap();
        let global = states[1].aggregate(2.0).expect("leaf received the broadcast");
        assert_eq!(global[SPAWNED_REQUESTS], 12.0);
    }

    #[test]
    fn single_worker_aggregates_immediately() {
        let (_queues, mut states) = setup(1);
        states[0].set_local(NUM_JOBS, 1.0);
        states[0].set_local(GLOBAL_MEM, 2.5);

        let global = states[0].aggregate(1.0).expect("no peers to wait for");
        assert_eq!(global[NUM_JOBS], 1.0);
        assert_eq!(global[GLOBAL_MEM], 2.5);

        // The next round only begins once the period elapsed.
        assert_eq!(states[0].aggregate(1.5), None);
        assert!(states[0].aggregate(2.0).is_some());
    }
}
