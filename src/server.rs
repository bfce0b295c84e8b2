//! Runs one worker process: transport, message queue, and the event loop
//! that drives them.

use crate::app::AppRegistry;
use crate::comm::{MessageQueue, TcpTransport};
use crate::config::Config;
use crate::error::Result;
use crate::schedule::{AppKind, JobDescription, ProportionalBalancer};
use crate::util::{Clock, Terminator};
use crate::worker::Worker;

use log::{error, info};
use std::time::Duration;

pub struct Server {
    queue: MessageQueue<Worker>,
    worker: Worker,
    clock: Clock,
    terminator: Terminator,
}

impl Server {
    /// Builds a worker process connected to its peers over TCP.
    pub fn new(cfg: Config) -> Result<Self> {
        let transport = TcpTransport::new(cfg.rank, &cfg.listen_addr, cfg.peers.clone())?;
        let mut queue = MessageQueue::new(cfg.rank, cfg.max_msg_size, Box::new(transport));
        let terminator = Terminator::new();
        let balancer = ProportionalBalancer::new(cfg.num_workers, cfg.balance_period);
        let worker = Worker::new(
            cfg,
            queue.link(),
            Box::new(balancer),
            AppRegistry::standard(),
            terminator.clone(),
        );
        Worker::register(&mut queue);
        Ok(Self { queue, worker, clock: Clock::new(), terminator })
    }

    /// Runs the event loop until termination. Protocol violations abort the
    /// process; everything else flows through the handlers.
    pub fn serve(&mut self, mono_job: Option<JobDescription>) -> Result<()> {
        info!("rank {} serving", self.worker.rank());
        self.worker.init();
        if let Some(desc) = mono_job {
            self.worker.introduce_job(desc)?;
        }

        loop {
            let now = self.clock.elapsed();
            self.worker.set_now(now);
            if let Err(err) = self.queue.advance(&mut self.worker) {
                if err.is_fatal() {
                    error!("{err}");
                    std::process::abort();
                }
                return Err(err);
            }
            self.worker.advance(now)?;
            if self.worker.check_terminate(now) {
                break;
            }
            // Yield briefly; all queue operations are non-blocking.
            std::thread::sleep(Duration::from_micros(50));
        }
        info!("rank {} terminating", self.worker.rank());
        self.terminator.set();
        Ok(())
    }
}

/// The description of the single demo job a mono deployment runs.
pub fn mono_job_description(cfg: &Config) -> JobDescription {
    JobDescription {
        job_id: 1,
        application: AppKind::Demo,
        client_rank: 0,
        priority: 1.0,
        incremental: false,
        wallclock_limit: cfg.mono_wallclock_limit,
        cpu_limit: 0.0,
        revision: 0,
        payload: vec![cfg.mono_solve_millis],
    }
}
