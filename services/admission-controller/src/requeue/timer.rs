//! Requeue timer task.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use admitq_id::WorkloadId;
use admitq_reconcile::{retry_on_conflict, ConflictRetry};
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, instrument, warn};

use super::RequeueQueue;
use crate::clock::SharedClock;
use crate::error::ControllerResult;
use crate::model::Workload;
use crate::store::{Expect, SharedStore, Transaction, Versioned};

/// Delay before retrying a wake-up whose store write failed.
const FAILED_RELEASE_DELAY: chrono::Duration = chrono::Duration::seconds(1);

/// What happened to one due wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// RequeueState cleared; the workload is eligible again.
    Released,
    /// The workload no longer exists.
    Gone,
    /// Nothing to clear; someone else already reset the RequeueState.
    AlreadyReleased,
    /// The persisted RequeueState points at a later time.
    NotYetDue(DateTime<Utc>),
}

/// Owns the requeue queue and wakes the scheduler loop when entries expire.
///
/// Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct RequeueTimer {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Mutex<RequeueQueue>,
    /// Signalled when the queue changes so the timer re-arms.
    changed: Notify,
    /// Signalled when workloads were released and need a scheduling pass.
    kick: Notify,
    store: SharedStore,
    clock: SharedClock,
    retry: ConflictRetry,
}

impl RequeueTimer {
    pub fn new(store: SharedStore, clock: SharedClock, retry: ConflictRetry) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(RequeueQueue::new()),
                changed: Notify::new(),
                kick: Notify::new(),
                store,
                clock,
                retry,
            }),
        }
    }

    fn queue(&self) -> MutexGuard<'_, RequeueQueue> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn schedule(&self, id: WorkloadId, at: DateTime<Utc>) {
        if self.queue().schedule(id, at) {
            debug!(workload_id = %id, requeue_at = %at, "Requeue scheduled");
            self.inner.changed.notify_one();
        }
    }

    pub fn cancel(&self, id: &WorkloadId) {
        if self.queue().cancel(id) {
            debug!(workload_id = %id, "Requeue cancelled");
            self.inner.changed.notify_one();
        }
    }

    pub fn pending(&self) -> usize {
        self.queue().len()
    }

    pub fn due_at(&self, id: &WorkloadId) -> Option<DateTime<Utc>> {
        self.queue().due_at(id)
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.queue().next_due()
    }

    /// Rebuild the queue from persisted state.
    ///
    /// Every workload carrying a RequeueState gets an entry (expired ones are
    /// due immediately so their state gets cleared); everything else is
    /// dropped. Entries due together are ordered by the persisted eviction
    /// time, so the order survives a restart.
    pub fn sync(&self, workloads: &[Versioned<Workload>]) {
        let mut backed_off: Vec<_> = workloads
            .iter()
            .filter_map(|wl| {
                let requeue = wl.value.status.requeue_state?;
                let since = wl
                    .value
                    .status
                    .last_eviction
                    .as_ref()
                    .map_or(requeue.requeue_at, |e| e.evicted_at);
                Some((requeue.requeue_at, since, wl.value.id))
            })
            .collect();
        backed_off.sort();

        let mut changed = false;
        {
            let mut queue = self.queue();
            let mut keep = HashSet::new();
            for (at, since, id) in backed_off {
                changed |= queue.schedule_since(id, at, since);
                keep.insert(id);
            }
            for id in queue.ids() {
                if !keep.contains(&id) {
                    changed |= queue.cancel(&id);
                }
            }
        }
        if changed {
            self.inner.changed.notify_one();
        }
    }

    /// Wait until released workloads need a scheduling pass.
    pub async fn kicked(&self) {
        self.inner.kick.notified().await;
    }

    /// Process every entry due at `now`. Returns the workloads that became
    /// eligible again.
    #[instrument(skip(self))]
    pub async fn release_due(&self, now: DateTime<Utc>) -> Vec<WorkloadId> {
        let due = self.queue().pop_due(now);
        let mut released = Vec::new();

        for id in due {
            match self.release(&id, now).await {
                Ok(ReleaseOutcome::Released) => {
                    info!(workload_id = %id, "Requeue backoff expired");
                    released.push(id);
                }
                Ok(ReleaseOutcome::NotYetDue(at)) => self.schedule(id, at),
                Ok(outcome) => {
                    debug!(workload_id = %id, ?outcome, "Requeue wake-up was a no-op");
                }
                Err(e) => {
                    warn!(workload_id = %id, error = %e, "Failed to release requeued workload");
                    self.schedule(id, now + FAILED_RELEASE_DELAY);
                }
            }
        }

        if !released.is_empty() {
            self.inner.kick.notify_one();
        }
        released
    }

    /// Clear the RequeueState of `id` if it has expired at `now`.
    pub async fn release(
        &self,
        id: &WorkloadId,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReleaseOutcome> {
        retry_on_conflict(self.inner.retry, &id.to_string(), move |_| {
            self.release_once(id, now)
        })
        .await
    }

    async fn release_once(
        &self,
        id: &WorkloadId,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReleaseOutcome> {
        let Some(current) = self.inner.store.get_workload(id).await? else {
            return Ok(ReleaseOutcome::Gone);
        };
        let Some(requeue) = current.value.status.requeue_state else {
            return Ok(ReleaseOutcome::AlreadyReleased);
        };
        if requeue.requeue_at > now {
            return Ok(ReleaseOutcome::NotYetDue(requeue.requeue_at));
        }

        let mut workload = current.value;
        workload.status.requeue_state = None;
        self.inner
            .store
            .commit(Transaction::new().put_workload(workload, Expect::Version(current.version)))
            .await?;
        Ok(ReleaseOutcome::Released)
    }

    /// Run the timer until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting requeue timer");

        loop {
            let next = self.next_due();
            let delay = next
                .map(|at| (at - self.inner.clock.now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(delay), if next.is_some() => {
                    self.release_due(self.inner.clock.now()).await;
                }
                _ = self.inner.changed.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Requeue timer shutting down");
                        break;
                    }
                }
            }
        }
    }
}
