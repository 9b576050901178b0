//! Quota ledger.
//!
//! Capacity accounting is a pure function of a [`QueueRecord`] value: the
//! ledger mutates the record it was given and the caller commits it through
//! the object store under the version it read. Two reconcilers reserving
//! against the same queue therefore race on the record version, and the loser
//! re-reads before trying again, so total reservations never exceed capacity.
//!
//! Running out of capacity is an expected outcome, not an error.

use std::collections::BTreeMap;

use admitq_id::WorkloadId;
use serde::Serialize;

use crate::model::{QueueRecord, ResourceList};
use crate::store::{SharedStore, StoreError};

/// Result of a reservation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Capacity was taken for the workload.
    Reserved,
    /// The workload already held a reservation; nothing changed.
    AlreadyReserved,
    /// Remaining capacity does not cover the request; nothing changed.
    InsufficientCapacity {
        resource: String,
        requested: i64,
        available: i64,
    },
}

impl ReserveOutcome {
    pub fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved | Self::AlreadyReserved)
    }
}

impl QueueRecord {
    /// Sum of all active reservations, per resource.
    pub fn usage(&self) -> ResourceList {
        let mut usage = ResourceList::new();
        for reserved in self.reservations.values() {
            for (resource, quantity) in reserved {
                *usage.entry(resource.clone()).or_insert(0) += quantity;
            }
        }
        usage
    }

    /// Capacity left for `resource`. Resources the queue does not offer have
    /// no capacity.
    pub fn available(&self, resource: &str) -> i64 {
        let capacity = self.capacity.get(resource).copied().unwrap_or(0);
        let used: i64 = self
            .reservations
            .values()
            .filter_map(|reserved| reserved.get(resource))
            .sum();
        capacity - used
    }

    pub fn remaining(&self) -> ResourceList {
        self.capacity
            .keys()
            .map(|resource| (resource.clone(), self.available(resource)))
            .collect()
    }

    pub fn holds(&self, workload: &WorkloadId) -> bool {
        self.reservations.contains_key(workload)
    }

    /// Reserve `request` for `workload` if every resource fits.
    ///
    /// Replaying a successful reservation is a no-op.
    pub fn try_reserve(&mut self, workload: WorkloadId, request: &ResourceList) -> ReserveOutcome {
        if self.holds(&workload) {
            return ReserveOutcome::AlreadyReserved;
        }

        for (resource, &requested) in request {
            if requested <= 0 {
                continue;
            }
            let available = self.available(resource);
            if requested > available {
                return ReserveOutcome::InsufficientCapacity {
                    resource: resource.clone(),
                    requested,
                    available,
                };
            }
        }

        self.reservations.insert(workload, request.clone());
        ReserveOutcome::Reserved
    }

    /// Drop the reservation for `workload`, returning what it held.
    ///
    /// Releasing a workload without a reservation is a no-op.
    pub fn release(&mut self, workload: &WorkloadId) -> Option<ResourceList> {
        self.reservations.remove(workload)
    }
}

/// One active reservation, as reported to quota tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationRecord {
    pub queue: String,
    pub workload_id: WorkloadId,
    pub resources: ResourceList,
}

/// Capacity summary for one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueUsage {
    pub queue: String,
    pub capacity: ResourceList,
    pub usage: ResourceList,
    pub remaining: ResourceList,
    pub reservations: usize,
    pub admission_checks: Vec<String>,
}

impl From<&QueueRecord> for QueueUsage {
    fn from(queue: &QueueRecord) -> Self {
        Self {
            queue: queue.name.clone(),
            capacity: queue.capacity.clone(),
            usage: queue.usage(),
            remaining: queue.remaining(),
            reservations: queue.reservations.len(),
            admission_checks: queue.admission_checks.clone(),
        }
    }
}

/// Read-only view of the ledger for reporting.
#[derive(Clone)]
pub struct QuotaLedger {
    store: SharedStore,
}

impl QuotaLedger {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Active reservations in `queue`, or `None` if the queue does not exist.
    pub async fn reservations(
        &self,
        queue: &str,
    ) -> Result<Option<Vec<ReservationRecord>>, StoreError> {
        let Some(record) = self.store.get_queue(queue).await? else {
            return Ok(None);
        };

        Ok(Some(
            record
                .value
                .reservations
                .iter()
                .map(|(workload_id, resources)| ReservationRecord {
                    queue: record.value.name.clone(),
                    workload_id: *workload_id,
                    resources: resources.clone(),
                })
                .collect(),
        ))
    }

    pub async fn usage(&self) -> Result<Vec<QueueUsage>, StoreError> {
        let queues = self.store.list_queues().await?;
        let by_name: BTreeMap<_, _> = queues
            .iter()
            .map(|q| (q.value.name.clone(), QueueUsage::from(&q.value)))
            .collect();
        Ok(by_name.into_values().collect())
    }
}
