//! Workload lifecycle operations.
//!
//! Thin layer over the store used by the HTTP API. Quota reservation is
//! never done here; the scheduler loop picks submitted workloads up from the
//! change feed.

use admitq_id::WorkloadId;
use admitq_reconcile::{retry_on_conflict, ConflictRetry};
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::checks::{Verdict, VerdictRequest};
use crate::clock::SharedClock;
use crate::error::{ControllerError, ControllerResult};
use crate::eviction::{VerdictHandler, VerdictOutcome};
use crate::model::{ResourceList, Workload};
use crate::store::{Expect, ObjectKey, SharedStore, StoreError, Transaction, Versioned};

/// Request to create a workload.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitWorkload {
    pub queue: String,
    #[serde(default)]
    pub priority: i32,
    pub resources: ResourceList,
}

impl SubmitWorkload {
    fn validate(&self) -> ControllerResult<()> {
        if self.queue.trim().is_empty() {
            return Err(ControllerError::InvalidWorkload(
                "queue must not be empty".to_string(),
            ));
        }
        if let Some((name, quantity)) = self.resources.iter().find(|(_, q)| **q < 0) {
            return Err(ControllerError::InvalidWorkload(format!(
                "resource '{name}' has negative quantity {quantity}"
            )));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct WorkloadService {
    store: SharedStore,
    clock: SharedClock,
    verdicts: VerdictHandler,
    retry: ConflictRetry,
}

impl WorkloadService {
    pub fn new(store: SharedStore, clock: SharedClock, retry: ConflictRetry) -> Self {
        Self {
            verdicts: VerdictHandler::new(store.clone(), clock.clone(), retry),
            store,
            clock,
            retry,
        }
    }

    #[instrument(skip(self, request), fields(queue = %request.queue))]
    pub async fn submit(&self, request: SubmitWorkload) -> ControllerResult<Versioned<Workload>> {
        request.validate()?;

        if self.store.get_queue(&request.queue).await?.is_none() {
            warn!("Workload submitted to unknown queue; it stays pending until the queue exists");
        }

        let workload = Workload::new(request.queue, request.resources, self.clock.now())
            .with_priority(request.priority);
        let id = workload.id;

        let versions = self
            .store
            .commit(Transaction::new().put_workload(workload.clone(), Expect::Absent))
            .await
            .map_err(|e| match e {
                StoreError::Conflict { .. } => ControllerError::WorkloadExists(id),
                other => other.into(),
            })?;
        let version = versions
            .first()
            .copied()
            .ok_or_else(|| StoreError::InvalidTransaction("commit returned no versions".into()))?;

        info!(workload_id = %id, "Workload submitted");
        Ok(Versioned::new(version, workload))
    }

    pub async fn get(&self, id: &WorkloadId) -> ControllerResult<Versioned<Workload>> {
        self.store
            .get_workload(id)
            .await?
            .ok_or(ControllerError::WorkloadNotFound(*id))
    }

    pub async fn list(&self) -> ControllerResult<Vec<Versioned<Workload>>> {
        let mut workloads = self.store.list_workloads().await?;
        workloads.sort_by(|a, b| {
            a.value
                .created_at
                .cmp(&b.value.created_at)
                .then_with(|| a.value.id.cmp(&b.value.id))
        });
        Ok(workloads)
    }

    /// Delete a workload, releasing any reservation it holds in the same
    /// transaction. Pending requeue wake-ups for it become no-ops.
    #[instrument(skip(self), fields(workload_id = %id))]
    pub async fn delete(&self, id: &WorkloadId) -> ControllerResult<()> {
        retry_on_conflict(self.retry, &id.to_string(), move |_| self.delete_once(id)).await
    }

    async fn delete_once(&self, id: &WorkloadId) -> ControllerResult<()> {
        let current = self
            .store
            .get_workload(id)
            .await?
            .ok_or(ControllerError::WorkloadNotFound(*id))?;

        let mut txn = Transaction::new().delete(ObjectKey::workload(id), current.version);
        let mut released = false;
        if let Some(mut queue) = self.store.get_queue(&current.value.queue).await? {
            if queue.value.release(id).is_some() {
                released = true;
                txn = txn.put_queue(queue.value, Expect::Version(queue.version));
            }
        }
        self.store.commit(txn).await?;

        info!(released, "Workload deleted");
        Ok(())
    }

    /// Intake for an external admission check verdict.
    ///
    /// Malformed verdicts are refused before anything is read or written.
    pub async fn post_verdict(
        &self,
        id: &WorkloadId,
        check: &str,
        request: VerdictRequest,
    ) -> ControllerResult<VerdictOutcome> {
        let verdict = Verdict::try_from(request).map_err(|e| {
            warn!(workload_id = %id, check, error = %e, "Rejecting malformed verdict");
            ControllerError::from(e)
        })?;
        self.verdicts.handle(id, check, &verdict).await
    }

    pub fn verdicts(&self) -> &VerdictHandler {
        &self.verdicts
    }
}
