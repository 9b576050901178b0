//! Scheduler loop.
//!
//! The reconciler picks pending workloads, reserves quota for them and
//! initializes their admission checks. The worker drives it from store
//! changes, requeue wake-ups and a periodic resync.

mod policy;
mod reconciler;
mod worker;

pub use policy::{PriorityFifo, SelectionPolicy};
pub use reconciler::{AdmitOutcome, ReconcileStats, SchedulerReconciler};
pub use worker::SchedulerWorker;
