//! Eviction controller.
//!
//! Reacts to a single verdict on a single workload. Each delivery is handled
//! by a stateless read-modify-write cycle against the store:
//!
//! 1. Read the workload and its queue.
//! 2. Derive the next check state from the *persisted* state.
//! 3. If the verdict is Retry or Rejected and the workload holds quota,
//!    release the reservation, clear `admitted`, and (for a delayed Retry)
//!    stamp a `RequeueState`.
//! 4. Commit workload and queue in one transaction, restarting from step 1
//!    on conflict.
//!
//! Because the quota release, the retry-count increment and the requeue
//! stamp share a transaction, no reader can see the incremented count while
//! the old reservation is still held. A Retry that arrives after its eviction
//! was persisted finds no reservation and is absorbed.

use admitq_id::WorkloadId;
use admitq_reconcile::{retry_on_conflict, ConflictRetry};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::checks::{transition, Verdict, VerdictState};
use crate::clock::SharedClock;
use crate::error::{ControllerError, ControllerResult};
use crate::model::{CheckState, Eviction, EvictionReason, QueueRecord, RequeueState, Workload};
use crate::store::{Expect, SharedStore, Transaction};

/// What an eviction changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionEffects {
    /// The queue reservation that was dropped, if the queue still had one.
    pub released: bool,
    pub requeue_at: Option<DateTime<Utc>>,
}

/// Release quota and reset admission status on `workload`.
///
/// `queue` is the workload's queue record, if it still exists. The caller
/// commits both records together.
pub fn evict(
    workload: &mut Workload,
    queue: Option<&mut QueueRecord>,
    reason: EvictionReason,
    check: &str,
    message: &str,
    requeue_after_seconds: Option<u32>,
    now: DateTime<Utc>,
) -> EvictionEffects {
    let released = queue
        .and_then(|queue| queue.release(&workload.id))
        .is_some();

    workload.status.reservation = None;
    workload.status.admitted = false;

    let requeue_state = match (reason, requeue_after_seconds) {
        (EvictionReason::AdmissionCheckRetry, Some(delay)) => Some(RequeueState {
            requeue_at: now + chrono::Duration::seconds(i64::from(delay)),
            count: workload
                .status
                .requeue_state
                .map_or(1, |previous| previous.count.saturating_add(1)),
        }),
        _ => None,
    };
    workload.status.requeue_state = requeue_state;

    workload.status.last_eviction = Some(Eviction {
        reason,
        check: check.to_string(),
        message: message.to_string(),
        evicted_at: now,
    });

    EvictionEffects {
        released,
        requeue_at: requeue_state.map(|r| r.requeue_at),
    }
}

/// Why a verdict did not change anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The check reported it is still working.
    StillPending,
    /// The verdict is already reflected in the persisted state.
    AlreadyApplied,
    /// A Retry arrived while no reservation is held; its eviction already
    /// happened.
    NotReserved,
    /// The check already rejected the workload.
    CheckRejected,
    /// The verdict was produced for a reservation the workload no longer holds.
    StaleGeneration,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StillPending => "still_pending",
            Self::AlreadyApplied => "already_applied",
            Self::NotReserved => "not_reserved",
            Self::CheckRejected => "check_rejected",
            Self::StaleGeneration => "stale_generation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerdictOutcome {
    /// Check state updated; workload kept its reservation.
    Applied { admitted: bool },
    /// Check state updated and the workload was evicted.
    Evicted {
        retry_count: u32,
        requeue_at: Option<DateTime<Utc>>,
    },
    Ignored(IgnoreReason),
}

/// Stateless per-verdict handler.
#[derive(Clone)]
pub struct VerdictHandler {
    store: SharedStore,
    clock: SharedClock,
    retry: ConflictRetry,
}

impl VerdictHandler {
    pub fn new(store: SharedStore, clock: SharedClock, retry: ConflictRetry) -> Self {
        Self {
            store,
            clock,
            retry,
        }
    }

    /// Apply `verdict` for `check` on workload `id`.
    #[instrument(skip(self, verdict), fields(workload_id = %id, check = %check, verdict = %verdict.state))]
    pub async fn handle(
        &self,
        id: &WorkloadId,
        check: &str,
        verdict: &Verdict,
    ) -> ControllerResult<VerdictOutcome> {
        retry_on_conflict(self.retry, &id.to_string(), move |_| {
            self.handle_once(id, check, verdict)
        })
        .await
    }

    async fn handle_once(
        &self,
        id: &WorkloadId,
        check: &str,
        verdict: &Verdict,
    ) -> ControllerResult<VerdictOutcome> {
        let now = self.clock.now();

        let current = self
            .store
            .get_workload(id)
            .await?
            .ok_or(ControllerError::WorkloadNotFound(*id))?;
        let mut workload = current.value;

        let Some(check_state) = workload.status.admission_checks.get(check).cloned() else {
            return Err(ControllerError::CheckNotFound {
                workload: *id,
                check: check.to_string(),
            });
        };

        if verdict.state == VerdictState::Pending {
            return Ok(VerdictOutcome::Ignored(IgnoreReason::StillPending));
        }

        if let Some(generation) = verdict.reservation_generation {
            let held = workload.status.reservation.as_ref().map(|r| r.generation);
            if held != Some(generation) {
                debug!(generation, ?held, "Verdict addressed to another reservation");
                return Ok(VerdictOutcome::Ignored(IgnoreReason::StaleGeneration));
            }
        }

        if verdict.state == VerdictState::Retry {
            if check_state.state == CheckState::Rejected {
                return Ok(VerdictOutcome::Ignored(IgnoreReason::CheckRejected));
            }
            if !workload.has_reservation() {
                debug!(
                    retry_count = check_state.retry_count,
                    "Retry already processed, no reservation to release"
                );
                return Ok(VerdictOutcome::Ignored(IgnoreReason::NotReserved));
            }
        }

        let Some(next) = transition(&check_state, verdict, now) else {
            return Ok(VerdictOutcome::Ignored(IgnoreReason::AlreadyApplied));
        };
        let retry_count = next.retry_count;
        workload.status.admission_checks.set(next);

        let mut queue = self.store.get_queue(&workload.queue).await?;
        let required = queue
            .as_ref()
            .map(|q| q.value.admission_checks.clone())
            .unwrap_or_default();

        let reason = match verdict.state {
            VerdictState::Retry => Some(EvictionReason::AdmissionCheckRetry),
            VerdictState::Rejected if workload.has_reservation() => {
                Some(EvictionReason::AdmissionCheckRejected)
            }
            _ => None,
        };

        let Some(reason) = reason else {
            workload.recompute_admitted(&required);
            let admitted = workload.is_admitted();
            self.store
                .commit(Transaction::new().put_workload(workload, Expect::Version(current.version)))
                .await?;

            if admitted {
                info!(retry_count, "Workload admitted");
            } else {
                debug!(state = ?verdict.state, "Check state updated");
            }
            return Ok(VerdictOutcome::Applied { admitted });
        };

        let effects = evict(
            &mut workload,
            queue.as_mut().map(|q| &mut q.value),
            reason,
            check,
            &verdict.message,
            verdict.requeue_after_seconds,
            now,
        );
        if !effects.released {
            warn!(queue = %workload.queue, "Evicted workload had no reservation in its queue record");
        }

        let mut txn =
            Transaction::new().put_workload(workload, Expect::Version(current.version));
        if let Some(queue) = queue {
            txn = txn.put_queue(queue.value, Expect::Version(queue.version));
        }
        self.store.commit(txn).await?;

        info!(
            reason = ?reason,
            retry_count,
            requeue_at = ?effects.requeue_at,
            "Workload evicted"
        );

        Ok(VerdictOutcome::Evicted {
            retry_count,
            requeue_at: effects.requeue_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{resources, Reservation};

    fn reserved(queue: &mut QueueRecord, now: DateTime<Utc>) -> Workload {
        let mut wl = Workload::new("dev", resources([("cpu", 1)]), now);
        queue.try_reserve(wl.id, &wl.resources);
        wl.status.reservation = Some(Reservation {
            queue: "dev".to_string(),
            resources: wl.resources.clone(),
            generation: 1,
            reserved_at: now,
        });
        wl.status.reservation_generation = 1;
        wl.status.admitted = true;
        wl
    }

    #[test]
    fn test_evict_retry_without_delay() {
        let now = Utc::now();
        let mut queue = QueueRecord::new("dev", resources([("cpu", 5)]));
        let mut wl = reserved(&mut queue, now);

        let effects = evict(
            &mut wl,
            Some(&mut queue),
            EvictionReason::AdmissionCheckRetry,
            "delayed-check",
            "Retrying admission check",
            None,
            now,
        );

        assert!(effects.released);
        assert_eq!(effects.requeue_at, None);
        assert!(!wl.has_reservation());
        assert!(!wl.is_admitted());
        assert!(wl.status.requeue_state.is_none());
        assert!(queue.reservations.is_empty());
        assert_eq!(
            wl.status.last_eviction.as_ref().unwrap().reason,
            EvictionReason::AdmissionCheckRetry
        );
    }

    #[test]
    fn test_evict_retry_with_delay_counts_requeues() {
        let now = Utc::now();
        let mut queue = QueueRecord::new("dev", resources([("cpu", 5)]));
        let mut wl = reserved(&mut queue, now);

        let effects = evict(
            &mut wl,
            Some(&mut queue),
            EvictionReason::AdmissionCheckRetry,
            "delayed-check",
            "",
            Some(5),
            now,
        );

        let expected = now + chrono::Duration::seconds(5);
        assert_eq!(effects.requeue_at, Some(expected));
        assert_eq!(
            wl.status.requeue_state,
            Some(RequeueState {
                requeue_at: expected,
                count: 1,
            })
        );

        // A later delayed eviction that finds a leftover requeue record
        // continues the count.
        wl.status.requeue_state = Some(RequeueState {
            requeue_at: now,
            count: 3,
        });
        evict(
            &mut wl,
            None,
            EvictionReason::AdmissionCheckRetry,
            "delayed-check",
            "",
            Some(1),
            now,
        );
        assert_eq!(wl.status.requeue_state.unwrap().count, 4);
    }

    #[test]
    fn test_evict_rejected_never_requeues() {
        let now = Utc::now();
        let mut queue = QueueRecord::new("dev", resources([("cpu", 5)]));
        let mut wl = reserved(&mut queue, now);

        let effects = evict(
            &mut wl,
            Some(&mut queue),
            EvictionReason::AdmissionCheckRejected,
            "cost",
            "over budget",
            Some(30),
            now,
        );
        assert!(effects.released);
        assert_eq!(effects.requeue_at, None);
        assert!(wl.status.requeue_state.is_none());
    }

    #[test]
    fn test_evict_without_queue_record() {
        let now = Utc::now();
        let mut queue = QueueRecord::new("dev", resources([("cpu", 5)]));
        let mut wl = reserved(&mut queue, now);

        let effects = evict(
            &mut wl,
            None,
            EvictionReason::AdmissionCheckRetry,
            "delayed-check",
            "",
            None,
            now,
        );
        assert!(!effects.released);
        assert!(!wl.has_reservation());
    }
}
