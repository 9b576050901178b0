//! Background cleanup.

mod worker;

pub use worker::{CleanupWorker, CleanupWorkerConfig};
