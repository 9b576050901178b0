//! Scheduler background worker.
//!
//! Runs a reconciliation pass whenever the store reports a change, the
//! requeue timer releases a workload, or the resync interval elapses.
//! Events only say "something changed"; the pass re-reads everything.

use std::time::Duration;

use admitq_reconcile::BackoffPolicy;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

use super::reconciler::SchedulerReconciler;
use crate::store::{Change, ChangeEvent, Kind, SharedStore};

/// Scheduler worker that runs the reconciliation loop.
pub struct SchedulerWorker {
    reconciler: SchedulerReconciler,
    store: SharedStore,
    interval: Duration,
    backoff: BackoffPolicy,
}

impl SchedulerWorker {
    pub fn new(reconciler: SchedulerReconciler, store: SharedStore, interval: Duration) -> Self {
        Self {
            reconciler,
            store,
            interval,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run the scheduler worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting scheduler worker"
        );

        let mut changes = self.store.subscribe();
        let mut feed_open = true;
        let mut failures: u32 = 0;

        // The first tick fires immediately and doubles as the startup pass
        // that rebuilds the requeue queue.
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                event = changes.recv(), if feed_open => {
                    feed_open = self.observe(event);
                    while let Ok(event) = changes.try_recv() {
                        self.observe(Ok(event));
                    }
                }
                _ = self.reconciler.requeue().kicked() => {
                    debug!("Requeue timer released workloads");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler worker shutting down");
                        break;
                    }
                    continue;
                }
            }

            match self.reconciler.reconcile_all().await {
                Ok(_) => failures = 0,
                Err(e) => {
                    let delay = self.backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    warn!(
                        error = %e,
                        failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "Scheduler reconciliation failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                info!("Scheduler worker shutting down");
                                break;
                            }
                        }
                    }
                    // Make sure the retry happens even if nothing else changes.
                    interval.reset_immediately();
                }
            }
        }
    }

    /// Apply side effects of one change event. Returns false once the feed
    /// is closed.
    fn observe(&self, event: Result<ChangeEvent, broadcast::error::RecvError>) -> bool {
        match event {
            Ok(ChangeEvent {
                key,
                change: Change::Deleted,
                ..
            }) if key.kind == Kind::Workload => {
                if let Some(id) = key.workload_id() {
                    self.reconciler.requeue().cancel(&id);
                }
                true
            }
            Ok(_) => true,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Missed events are covered by the full re-read of the pass.
                debug!(skipped, "Change feed lagged");
                true
            }
            Err(broadcast::error::RecvError::Closed) => {
                warn!("Change feed closed, falling back to periodic resync");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use admitq_id::WorkloadId;
    use admitq_reconcile::ConflictRetry;

    use super::*;
    use crate::clock::{SharedClock, SystemClock};
    use crate::model::{resources, QueueRecord, Workload};
    use crate::requeue::RequeueTimer;
    use crate::store::{Expect, InMemoryStore, ObjectStore, Transaction};

    fn worker(store: Arc<InMemoryStore>, interval: Duration) -> SchedulerWorker {
        let clock: SharedClock = Arc::new(SystemClock);
        let retry = ConflictRetry::default();
        let requeue = RequeueTimer::new(store.clone(), clock.clone(), retry);
        let reconciler = SchedulerReconciler::new(store.clone(), clock, requeue, retry);
        SchedulerWorker::new(reconciler, store, interval)
    }

    async fn wait_reserved(store: &InMemoryStore, id: &WorkloadId) -> bool {
        for _ in 0..200 {
            if let Some(wl) = store.get_workload(id).await.unwrap() {
                if wl.value.has_reservation() {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_reconciles_on_store_change() {
        let store = Arc::new(InMemoryStore::new());
        store
            .commit(Transaction::new().put_queue(
                QueueRecord::new("dev", resources([("cpu", 2)])),
                Expect::Absent,
            ))
            .await
            .unwrap();

        // Long resync interval: only the change feed can trigger the pass.
        let worker = Arc::new(worker(store.clone(), Duration::from_secs(3600)));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(rx).await }
        });

        // Let the startup pass run first.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let wl = Workload::new("dev", resources([("cpu", 1)]), chrono::Utc::now());
        let id = wl.id;
        store
            .commit(Transaction::new().put_workload(wl, Expect::Absent))
            .await
            .unwrap();

        assert!(wait_reserved(&store, &id).await);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_recovers_after_store_outage() {
        let store = Arc::new(InMemoryStore::new());
        store
            .commit(Transaction::new().put_queue(
                QueueRecord::new("dev", resources([("cpu", 2)])),
                Expect::Absent,
            ))
            .await
            .unwrap();
        let wl = Workload::new("dev", resources([("cpu", 1)]), chrono::Utc::now());
        let id = wl.id;
        store
            .commit(Transaction::new().put_workload(wl, Expect::Absent))
            .await
            .unwrap();
        store.set_available(false);

        let worker = Arc::new(
            worker(store.clone(), Duration::from_secs(3600)).with_backoff(BackoffPolicy {
                base: Duration::from_millis(10),
                max: Duration::from_millis(50),
                jitter: 0.0,
            }),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(rx).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        store.set_available(true);
        assert!(wait_reserved(&store, &id).await);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
