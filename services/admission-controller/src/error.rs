//! Controller error types.

use admitq_id::WorkloadId;
use admitq_reconcile::ConflictAware;
use thiserror::Error;

use crate::checks::VerdictError;
use crate::store::StoreError;

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("workload not found: {0}")]
    WorkloadNotFound(WorkloadId),

    #[error("workload already exists: {0}")]
    WorkloadExists(WorkloadId),

    #[error("workload {workload} has no admission check named '{check}'")]
    CheckNotFound { workload: WorkloadId, check: String },

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("invalid verdict: {0}")]
    InvalidVerdict(#[from] VerdictError),

    #[error("invalid workload: {0}")]
    InvalidWorkload(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ControllerError {
    /// True for faults that clear up on their own and warrant a later retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_conflict() || e.is_unavailable(),
            _ => false,
        }
    }

    /// True when the store could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_unavailable())
    }
}

impl ConflictAware for ControllerError {
    fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }
}
