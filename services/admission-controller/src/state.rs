//! Application state shared across request handlers.

use std::sync::Arc;

use crate::quota::QuotaLedger;
use crate::service::WorkloadService;
use crate::store::SharedStore;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: SharedStore,
    workloads: WorkloadService,
    ledger: QuotaLedger,
}

impl AppState {
    pub fn new(store: SharedStore, workloads: WorkloadService) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                ledger: QuotaLedger::new(store.clone()),
                store,
                workloads,
            }),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.inner.store
    }

    pub fn workloads(&self) -> &WorkloadService {
        &self.inner.workloads
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.inner.ledger
    }
}
