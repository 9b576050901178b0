//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use admitq_controller::{
    checks::Verdict,
    clock::{Clock, ManualClock, SharedClock},
    error::ControllerResult,
    eviction::VerdictOutcome,
    model::{resources, QueueRecord, Workload},
    requeue::RequeueTimer,
    scheduler::{ReconcileStats, SchedulerReconciler},
    service::{SubmitWorkload, WorkloadService},
    store::{Expect, InMemoryStore, ObjectStore, Transaction},
};
use admitq_id::WorkloadId;
use admitq_reconcile::ConflictRetry;
use chrono::{DateTime, Utc};

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub clock: ManualClock,
    pub requeue: RequeueTimer,
    pub reconciler: SchedulerReconciler,
    pub service: WorkloadService,
}

impl Harness {
    pub async fn new(queues: Vec<QueueRecord>) -> Self {
        let store = Arc::new(InMemoryStore::new());
        for queue in queues {
            store
                .commit(Transaction::new().put_queue(queue, Expect::Absent))
                .await
                .unwrap();
        }

        let clock = ManualClock::new(Utc::now());
        let shared: SharedClock = Arc::new(clock.clone());
        let retry = ConflictRetry::default();
        let requeue = RequeueTimer::new(store.clone(), shared.clone(), retry);
        let reconciler =
            SchedulerReconciler::new(store.clone(), shared.clone(), requeue.clone(), retry);
        let service = WorkloadService::new(store.clone(), shared, retry);

        Self {
            store,
            clock,
            requeue,
            reconciler,
            service,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn submit(&self, queue: &str, cpu: i64) -> WorkloadId {
        self.service
            .submit(SubmitWorkload {
                queue: queue.to_string(),
                priority: 0,
                resources: resources([("cpu", cpu)]),
            })
            .await
            .unwrap()
            .value
            .id
    }

    pub async fn reconcile(&self) -> ReconcileStats {
        self.reconciler.reconcile_all().await.unwrap()
    }

    pub async fn verdict(
        &self,
        id: &WorkloadId,
        check: &str,
        verdict: Verdict,
    ) -> ControllerResult<VerdictOutcome> {
        self.service.verdicts().handle(id, check, &verdict).await
    }

    pub async fn workload(&self, id: &WorkloadId) -> Workload {
        self.store.get_workload(id).await.unwrap().unwrap().value
    }

    pub async fn queue(&self, name: &str) -> QueueRecord {
        self.store.get_queue(name).await.unwrap().unwrap().value
    }

    /// Cross-record invariants that must hold in every committed state.
    pub async fn assert_consistent(&self) {
        let queues = self.store.list_queues().await.unwrap();
        let workloads = self.store.list_workloads().await.unwrap();

        for queue in &queues {
            let queue = &queue.value;
            for (resource, used) in queue.usage() {
                let capacity = queue.capacity.get(&resource).copied().unwrap_or(0);
                assert!(
                    used <= capacity,
                    "queue {} over capacity for {resource}: {used} > {capacity}",
                    queue.name
                );
            }
        }

        for wl in &workloads {
            let wl = &wl.value;
            let queue = queues.iter().find(|q| q.value.name == wl.queue);
            let held = queue.is_some_and(|q| q.value.holds(&wl.id));
            assert_eq!(
                wl.has_reservation(),
                held,
                "reservation mismatch for {}",
                wl.id
            );
            if wl.is_admitted() {
                let required = queue
                    .map(|q| q.value.admission_checks.clone())
                    .unwrap_or_default();
                assert!(wl.has_reservation());
                assert!(wl.status.admission_checks.all_ready(&required));
            }
            if wl.status.requeue_state.is_some() {
                assert!(!wl.has_reservation());
            }
        }
    }
}

pub fn queue(name: &str, cpu: i64, checks: &[&str]) -> QueueRecord {
    QueueRecord::new(name, resources([("cpu", cpu)])).with_admission_checks(checks.iter().copied())
}
