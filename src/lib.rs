//! Rate-accurate synthetic query load against a trace-storage backend.
//!
//! Configuration yields a [`domain::BucketRegistry`] of relative time windows and an
//! [`domain::ExecutionPlan`] of `(query, bucket)` pairs. The [`scheduler::Scheduler`]
//! builds one [`executor::QueryExecutor`] per query template; each runs a pool of workers
//! behind a shared rate limiter, walking its plan forever and reporting every dispatch to
//! a [`metrics::MetricsSink`].

pub mod api;
pub mod config;
pub mod domain;
pub mod executor;
pub mod metrics;
pub mod scheduler;
pub mod telemetry;
