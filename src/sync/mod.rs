//! Synchronization layer: freshness policy, the paginated sync worker,
//! chunked mutation jobs, and the durable queue/scheduler.

pub mod freshness;
mod mutation;
mod scheduler;
mod worker;

pub use mutation::{MutationOutcome, MutationRunner};
pub use scheduler::{EnqueueResult, JobEvent, JobQueue, Scheduler};
pub use worker::{RelationSyncer, RunOutcome};
