//! Scheduler reconciler for quota reservation.
//!
//! Each pass:
//! - Rebuilds the requeue queue from persisted RequeueStates
//! - Re-derives `admitted` for workloads that hold a reservation
//! - Offers quota to eligible pending workloads in policy order
//!
//! A workload is eligible when it holds no reservation, no required check
//! rejected it, and it carries no unexpired RequeueState. Running out of
//! capacity is the expected steady state, not an error: the workload stays
//! Pending with no RequeueState and is reconsidered on the next pass.

use std::collections::HashMap;
use std::sync::Arc;

use admitq_id::WorkloadId;
use admitq_reconcile::{retry_on_conflict, ConflictRetry};
use tracing::{debug, info, instrument, warn};

use super::policy::{PriorityFifo, SelectionPolicy};
use crate::clock::SharedClock;
use crate::error::ControllerResult;
use crate::model::{Reservation, Workload};
use crate::quota::ReserveOutcome;
use crate::requeue::RequeueTimer;
use crate::store::{Expect, SharedStore, Transaction};

/// Counters for a single reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub candidates: usize,
    pub reserved: usize,
    pub admitted: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Result of offering quota to one workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    Reserved { generation: u64, admitted: bool },
    NoCapacity,
    QueueMissing,
    /// The fresh read showed the workload is no longer eligible.
    Skipped,
}

/// The scheduler reconciler.
pub struct SchedulerReconciler {
    store: SharedStore,
    clock: SharedClock,
    requeue: RequeueTimer,
    policy: Arc<dyn SelectionPolicy>,
    retry: ConflictRetry,
}

impl SchedulerReconciler {
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        requeue: RequeueTimer,
        retry: ConflictRetry,
    ) -> Self {
        Self {
            store,
            clock,
            requeue,
            policy: Arc::new(PriorityFifo),
            retry,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn SelectionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn requeue(&self) -> &RequeueTimer {
        &self.requeue
    }

    /// Run a single reconciliation pass.
    ///
    /// Store unavailability aborts the pass; per-workload failures are
    /// counted and the pass continues.
    #[instrument(skip(self), fields(policy = self.policy.name()))]
    pub async fn reconcile_all(&self) -> ControllerResult<ReconcileStats> {
        let mut stats = ReconcileStats::default();
        let now = self.clock.now();

        let workloads = self.store.list_workloads().await?;
        let required: HashMap<String, Vec<String>> = self
            .store
            .list_queues()
            .await?
            .into_iter()
            .map(|q| (q.value.name, q.value.admission_checks))
            .collect();

        self.requeue.sync(&workloads);

        for wl in workloads.iter().map(|v| &v.value) {
            if !wl.has_reservation() {
                continue;
            }
            let checks = required_checks(&required, &wl.queue);
            let mut preview = wl.clone();
            let created = preview.status.admission_checks.initialize(checks, now);
            if created == 0 && !preview.recompute_admitted(checks) {
                continue;
            }
            match self.refresh_admitted(&wl.id).await {
                Ok(true) => stats.admitted += 1,
                Ok(false) => {}
                Err(e) if e.is_unavailable() => return Err(e),
                Err(e) => {
                    warn!(workload_id = %wl.id, error = %e, "Failed to refresh admission");
                    stats.failed += 1;
                }
            }
        }

        let mut candidates: Vec<&Workload> = workloads
            .iter()
            .map(|v| &v.value)
            .filter(|wl| {
                !wl.has_reservation()
                    && !wl.has_live_requeue(now)
                    && !wl.is_rejected(required_checks(&required, &wl.queue))
            })
            .collect();
        self.policy.order(&mut candidates);
        stats.candidates = candidates.len();
        debug!(candidates = candidates.len(), "Found pending workloads");

        for wl in candidates {
            match self.try_admit(&wl.id).await {
                Ok(AdmitOutcome::Reserved { admitted, .. }) => {
                    stats.reserved += 1;
                    if admitted {
                        stats.admitted += 1;
                    }
                }
                Ok(AdmitOutcome::NoCapacity) => {
                    debug!(
                        workload_id = %wl.id,
                        queue = %wl.queue,
                        "Insufficient quota, staying pending"
                    );
                    stats.skipped += 1;
                }
                Ok(AdmitOutcome::QueueMissing) => {
                    warn!(
                        workload_id = %wl.id,
                        queue = %wl.queue,
                        "Workload references unknown queue"
                    );
                    stats.skipped += 1;
                }
                Ok(AdmitOutcome::Skipped) => stats.skipped += 1,
                Err(e) if e.is_unavailable() => return Err(e),
                Err(e) => {
                    warn!(workload_id = %wl.id, error = %e, "Failed to reserve quota");
                    stats.failed += 1;
                }
            }
        }

        if stats.reserved > 0 || stats.failed > 0 {
            info!(
                candidates = stats.candidates,
                reserved = stats.reserved,
                admitted = stats.admitted,
                skipped = stats.skipped,
                failed = stats.failed,
                "Reconciliation pass complete"
            );
        }

        Ok(stats)
    }

    /// Offer quota to one workload.
    #[instrument(skip(self), fields(workload_id = %id))]
    pub async fn try_admit(&self, id: &WorkloadId) -> ControllerResult<AdmitOutcome> {
        let outcome = retry_on_conflict(self.retry, &id.to_string(), move |_| {
            self.try_admit_once(id)
        })
        .await?;
        if matches!(outcome, AdmitOutcome::Reserved { .. }) {
            self.requeue.cancel(id);
        }
        Ok(outcome)
    }

    async fn try_admit_once(&self, id: &WorkloadId) -> ControllerResult<AdmitOutcome> {
        let now = self.clock.now();

        let Some(current) = self.store.get_workload(id).await? else {
            return Ok(AdmitOutcome::Skipped);
        };
        let mut workload = current.value;
        if workload.has_reservation() || workload.has_live_requeue(now) {
            return Ok(AdmitOutcome::Skipped);
        }

        let Some(mut queue) = self.store.get_queue(&workload.queue).await? else {
            return Ok(AdmitOutcome::QueueMissing);
        };
        let required = queue.value.admission_checks.clone();
        if workload.is_rejected(&required) {
            return Ok(AdmitOutcome::Skipped);
        }

        match queue.value.try_reserve(workload.id, &workload.resources) {
            ReserveOutcome::Reserved => {}
            ReserveOutcome::AlreadyReserved => {
                // The queue still lists this workload; adopt that entry.
                warn!(queue = %workload.queue, "Queue already held a reservation for workload");
            }
            ReserveOutcome::InsufficientCapacity {
                resource,
                requested,
                available,
            } => {
                debug!(resource, requested, available, "Reservation does not fit");
                return Ok(AdmitOutcome::NoCapacity);
            }
        }

        let generation = workload.status.reservation_generation + 1;
        workload.status.reservation = Some(Reservation {
            queue: workload.queue.clone(),
            resources: workload.resources.clone(),
            generation,
            reserved_at: now,
        });
        workload.status.reservation_generation = generation;
        workload.status.requeue_state = None;
        workload.status.admission_checks.initialize(&required, now);
        workload.recompute_admitted(&required);
        let admitted = workload.is_admitted();
        let queue_name = workload.queue.clone();

        self.store
            .commit(
                Transaction::new()
                    .put_workload(workload, Expect::Version(current.version))
                    .put_queue(queue.value, Expect::Version(queue.version)),
            )
            .await?;

        info!(queue = %queue_name, generation, admitted, "Quota reserved");
        Ok(AdmitOutcome::Reserved {
            generation,
            admitted,
        })
    }

    /// Bring a reserved workload in line with its queue's current list of
    /// required checks. Returns true if the workload is now admitted.
    async fn refresh_admitted(&self, id: &WorkloadId) -> ControllerResult<bool> {
        retry_on_conflict(self.retry, &id.to_string(), move |_| {
            self.refresh_admitted_once(id)
        })
        .await
    }

    async fn refresh_admitted_once(&self, id: &WorkloadId) -> ControllerResult<bool> {
        let now = self.clock.now();
        let Some(current) = self.store.get_workload(id).await? else {
            return Ok(false);
        };
        let mut workload = current.value;
        if !workload.has_reservation() {
            return Ok(false);
        }
        let required = self
            .store
            .get_queue(&workload.queue)
            .await?
            .map(|q| q.value.admission_checks)
            .unwrap_or_default();

        let created = workload.status.admission_checks.initialize(&required, now);
        let flipped = workload.recompute_admitted(&required);
        let admitted = workload.is_admitted();
        if created == 0 && !flipped {
            return Ok(admitted);
        }

        self.store
            .commit(Transaction::new().put_workload(workload, Expect::Version(current.version)))
            .await?;
        info!(workload_id = %id, admitted, checks_created = created, "Admission re-derived");
        Ok(admitted)
    }
}

fn required_checks<'a>(required: &'a HashMap<String, Vec<String>>, queue: &str) -> &'a [String] {
    required.get(queue).map(Vec::as_slice).unwrap_or(&[])
}
