use crate::error::Result;
use crate::Rank;

use serde_derive::Deserialize;
use std::collections::HashMap;

/// Worker configuration, loaded from a config file and ARBOR_-prefixed
/// environment variables. One instance is shared by all components of a
/// worker.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// This worker's rank, 0..num_workers.
    pub rank: Rank,
    /// The fleet size.
    pub num_workers: u32,
    /// The address this worker's transport listens on.
    pub listen_addr: String,
    /// Peer rank to address mapping.
    pub peers: HashMap<Rank, String>,
    pub log_level: String,

    /// Payloads above this size are fragmented into batches.
    pub max_msg_size: usize,
    /// Outgoing edges per worker in the expander graph.
    pub num_bounce_alternatives: u32,
    /// Hand requests to collective assignment after this many hops;
    /// negative disables.
    pub hops_until_collective_assignment: i32,
    /// Bounce along the fixed expander graph instead of pseudorandom
    /// permutations.
    pub derandomize: bool,
    /// Leave/join semantics owned by reactivation scheduling rather than
    /// inferred from volume updates alone.
    pub reactivation_scheduling: bool,
    /// Propagate volume updates explicitly down tree edges; otherwise
    /// workers rely on the balancer's volume cache.
    pub explicit_volume_updates: bool,
    /// Dormant job copies retained per worker.
    pub job_cache_size: usize,
    /// Send warmup messages along expander edges at startup.
    pub warmup: bool,

    /// Single-job mode: rank 0 introduces one job and the fleet shuts down
    /// once it completes. Job trees use the identity permutation.
    pub mono: bool,
    /// Milliseconds after which the mono demo job solves; negative: never.
    pub mono_solve_millis: i32,
    /// Wallclock budget for the mono job in seconds. 0 disables.
    pub mono_wallclock_limit: f64,

    /// Seconds per doubling of an active job's demand. 0: full demand
    /// immediately.
    pub growth_period: f64,
    pub balance_period: f64,
    pub stats_period: f64,
    pub maintenance_period: f64,
    pub job_check_period: f64,
    pub sysstate_period: f64,

    pub watchdog_warn_millis: u64,
    /// 0 disables the watchdog abort.
    pub watchdog_abort_millis: u64,
    /// Global process time limit in seconds. 0 disables.
    pub time_limit: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rank: 0,
            num_workers: 1,
            listen_addr: "0.0.0.0:9770".into(),
            peers: HashMap::new(),
            log_level: "info".into(),
            max_msg_size: 65536,
            num_bounce_alternatives: 4,
            hops_until_collective_assignment: -1,
            derandomize: false,
            reactivation_scheduling: false,
            explicit_volume_updates: true,
            job_cache_size: 4,
            warmup: false,
            mono: false,
            mono_solve_millis: 1000,
            mono_wallclock_limit: 0.0,
            growth_period: 0.0,
            balance_period: 0.1,
            stats_period: 1.0,
            maintenance_period: 1.0,
            job_check_period: 0.01,
            sysstate_period: 1.0,
            watchdog_warn_millis: 100,
            watchdog_abort_millis: 0,
            time_limit: 0.0,
        }
    }
}

impl Config {
    /// Loads the configuration from the given file, overlaid with
    /// environment variables.
    pub fn load(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .add_source(config::File::with_name(file).required(false))
            .add_source(config::Environment::with_prefix("ARBOR"))
            .build()?
            .try_deserialize()?)
    }
}
