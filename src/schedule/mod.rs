//! The malleable job scheduler: per-worker job state and adoption policy,
//! request routing across the expander graph, volume update propagation, and
//! the fleet-wide system state aggregate.

pub mod balance;
pub mod db;
pub mod job;
pub mod request;
pub mod router;
pub mod sysstate;
pub mod tree;

pub use balance::{Assignments, Balancer, ProportionalBalancer, ScriptedBalancer};
pub use db::{Adoption, JobDatabase, RequestMode};
pub use job::{Job, JobState};
pub use request::{
    AppKind, JobDescription, JobMessage, JobRequest, JobResult, JobStatistics, OneshotRejection,
};
pub use router::{CollectiveAssignment, RequestRouter, Route};
pub use sysstate::SystemState;
pub use tree::{JobTree, Side};
