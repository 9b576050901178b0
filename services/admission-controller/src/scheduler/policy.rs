//! Candidate ordering.

use crate::model::Workload;

/// Decides the order in which pending workloads are offered quota.
///
/// Policies only order; capacity is always checked by the quota ledger.
pub trait SelectionPolicy: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn order(&self, candidates: &mut [&Workload]);
}

/// Highest priority first, then longest waiting first, then by ID.
///
/// Waiting time counts from the latest eviction, so among workloads coming
/// back from a backoff the first evicted is offered quota first.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityFifo;

impl SelectionPolicy for PriorityFifo {
    fn name(&self) -> &'static str {
        "priority-fifo"
    }

    fn order(&self, candidates: &mut [&Workload]) {
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.queued_since().cmp(&b.queued_since()))
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{resources, Eviction, EvictionReason};
    use chrono::{Duration, Utc};

    #[test]
    fn test_priority_then_age() {
        let t0 = Utc::now();
        let old_low = Workload::new("q", resources([("cpu", 1)]), t0);
        let new_high = Workload::new("q", resources([("cpu", 1)]), t0 + Duration::seconds(10))
            .with_priority(10);
        let new_low = Workload::new("q", resources([("cpu", 1)]), t0 + Duration::seconds(5));

        let mut candidates = vec![&new_low, &old_low, &new_high];
        PriorityFifo.order(&mut candidates);

        let ids: Vec<_> = candidates.iter().map(|wl| wl.id).collect();
        assert_eq!(ids, vec![new_high.id, old_low.id, new_low.id]);
    }

    #[test]
    fn test_same_age_falls_back_to_id() {
        let t0 = Utc::now();
        let a = Workload::new("q", resources([("cpu", 1)]), t0);
        let b = Workload::new("q", resources([("cpu", 1)]), t0);
        let (first, second) = if a.id < b.id { (&a, &b) } else { (&b, &a) };

        let mut candidates = vec![second, first];
        PriorityFifo.order(&mut candidates);
        assert_eq!(candidates[0].id, first.id);
    }

    #[test]
    fn test_evicted_workloads_wait_from_eviction() {
        let t0 = Utc::now();
        let evicted = |at| Eviction {
            reason: EvictionReason::AdmissionCheckRetry,
            check: "delayed-check".to_string(),
            message: String::new(),
            evicted_at: at,
        };
        let mut first_evicted = Workload::new("q", resources([("cpu", 1)]), t0);
        let mut second_evicted = Workload::new("q", resources([("cpu", 1)]), t0);
        first_evicted.status.last_eviction = Some(evicted(t0 + Duration::seconds(1)));
        second_evicted.status.last_eviction = Some(evicted(t0 + Duration::seconds(6)));
        let fresh = Workload::new("q", resources([("cpu", 1)]), t0 + Duration::seconds(3));

        let mut candidates = vec![&second_evicted, &fresh, &first_evicted];
        PriorityFifo.order(&mut candidates);

        let ids: Vec<_> = candidates.iter().map(|wl| wl.id).collect();
        assert_eq!(ids, vec![first_evicted.id, fresh.id, second_evicted.id]);
    }
}
