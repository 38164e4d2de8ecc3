//! The Job Queue: claim-with-lease, completion,
//! failure-with-backoff, and dead-letter transitions layered over the
//! Catalog's `forward_jobs` table, plus the worker poll loop that drives a
//! pluggable [`JobExecutor`].

mod backoff;
mod worker;

pub use backoff::{BackoffPolicy, DEFAULT_BACKOFF};
pub use worker::{run, ExecutionOutcome, JobExecutor, WorkerConfig};
