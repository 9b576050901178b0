//! Admission-check-driven requeue scheduler.
//!
//! Workloads are submitted to queues with fixed capacity. The scheduler loop
//! reserves quota for them; external admission checks then report verdicts
//! that either admit the workload or evict it, releasing its quota and
//! optionally holding it back for a backoff period before it competes for
//! quota again.
//!
//! This crate primarily ships an `admission-controller` binary, but exposes
//! its library surface for integration testing and reuse.

pub mod api;
pub mod checks;
pub mod cleanup;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod eviction;
pub mod model;
pub mod quota;
pub mod requeue;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod store;
