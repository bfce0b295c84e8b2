use super::Application;
use crate::error::Result;
use crate::schedule::{JobDescription, JobMessage, JobResult};
use crate::Rank;

/// A trivial solver for exercising the scheduler: it "solves" a fixed time
/// after starting, where the first payload word gives the solving time in
/// milliseconds (negative: never solves). Only the root node of the tree
/// reports the solution; other nodes just burn time. Suspension stops the
/// clock.
pub struct DemoJob {
    desc: Option<JobDescription>,
    /// Accumulated solving time before the last suspension.
    progress: f64,
    /// Start of the current active stretch.
    running_since: Option<f64>,
    terminated: bool,
    messages_received: usize,
}

impl DemoJob {
    pub fn new() -> Self {
        Self {
            desc: None,
            progress: 0.0,
            running_since: None,
            terminated: false,
            messages_received: 0,
        }
    }

    /// The configured solving time in seconds, if any.
    fn target(&self) -> Option<f64> {
        let desc = self.desc.as_ref()?;
        match desc.payload.first() {
            Some(&millis) if millis >= 0 => Some(f64::from(millis) / 1000.0),
            _ => None,
        }
    }

    fn elapsed(&self, now: f64) -> f64 {
        self.progress + self.running_since.map_or(0.0, |since| now - since)
    }
}

impl Default for DemoJob {
    fn default() -> Self {
        Self::new()
    }
}

impl Application for DemoJob {
    fn start(&mut self, desc: &JobDescription, now: f64) -> Result<()> {
        self.desc = Some(desc.clone());
        self.running_since = Some(now);
        Ok(())
    }

    fn suspend(&mut self, now: f64) {
        if let Some(since) = self.running_since.take() {
            self.progress += now - since;
        }
    }

    fn resume(&mut self, now: f64) {
        if self.running_since.is_none() && !self.terminated {
            self.running_since = Some(now);
        }
    }

    fn terminate(&mut self) {
        self.terminated = true;
        self.running_since = None;
    }

    fn append_revision(&mut self, desc: &JobDescription) -> Result<()> {
        if let Some(current) = &mut self.desc {
            current.revision = desc.revision;
            current.payload.extend_from_slice(&desc.payload);
        }
        Ok(())
    }

    fn solved(&self, now: f64) -> Option<i32> {
        if self.terminated {
            return None;
        }
        let target = self.target()?;
        (self.elapsed(now) >= target).then_some(10)
    }

    fn result(&self) -> JobResult {
        let desc = self.desc.as_ref();
        JobResult {
            job_id: desc.map_or(0, |d| d.job_id),
            revision: desc.map_or(0, |d| d.revision),
            result_code: 10,
            solution: desc.map_or_else(Vec::new, |d| d.payload.clone()),
        }
    }

    fn handle_message(&mut self, _source: Rank, _msg: JobMessage) {
        self.messages_received += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::AppKind;

    fn description(millis: i32) -> JobDescription {
        JobDescription {
            job_id: 1,
            application: AppKind::Demo,
            client_rank: 0,
            priority: 1.0,
            incremental: false,
            wallclock_limit: 0.0,
            cpu_limit: 0.0,
            revision: 0,
            payload: vec![millis],
        }
    }

    #[test]
    fn solves_after_configured_delay() {
        let mut job = DemoJob::new();
        job.start(&description(500), 10.0).unwrap();
        assert_eq!(job.solved(10.0), None);
        assert_eq!(job.solved(10.4), None);
        assert_eq!(job.solved(10.5), Some(10));
        assert_eq!(job.result().result_code, 10);
    }

    #[test]
    fn suspension_stops_the_clock() {
        let mut job = DemoJob::new();
        job.start(&description(1000), 0.0).unwrap();
        job.suspend(0.4);
        assert_eq!(job.solved(100.0), None);
        job.resume(100.0);
        assert_eq!(job.solved(100.5), None);
        assert_eq!(job.solved(100.6), Some(10));
    }

    #[test]
    fn never_solves_when_negative() {
        let mut job = DemoJob::new();
        job.start(&description(-1), 0.0).unwrap();
        assert_eq!(job.solved(1e9), None);
    }
}
