//! Requeue scheduler.
//!
//! Evicted workloads with a backoff hint carry a `RequeueState` and must not
//! be reconsidered before `requeue_at`. [`RequeueQueue`] keeps those wake
//! times in order; [`RequeueTimer`] owns the timer that clears the
//! persisted `RequeueState` when it comes due and kicks the scheduler loop.
//!
//! The queue is an in-process cache of persisted state: it is rebuilt from
//! the store on every scheduler pass, so losing it (restart) only delays
//! wake-ups until the next pass, and wake times already in the past are due
//! immediately.

mod timer;

pub use timer::{ReleaseOutcome, RequeueTimer};

use std::collections::{BTreeMap, HashMap};

use admitq_id::WorkloadId;
use chrono::{DateTime, Utc};

/// Position of one wake-up: due time, then the instant the workload left
/// the schedulable pool, then enqueue order.
type Slot = (DateTime<Utc>, DateTime<Utc>, u64);

/// Time-ordered set of pending wake-ups, at most one per workload.
///
/// Entries due at the same instant come out first evicted, first released;
/// entries that also share an eviction time keep the order they were first
/// scheduled in.
#[derive(Debug, Default)]
pub struct RequeueQueue {
    entries: BTreeMap<Slot, WorkloadId>,
    index: HashMap<WorkloadId, Slot>,
    next_seq: u64,
}

impl RequeueQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, id: &WorkloadId) -> bool {
        self.index.contains_key(id)
    }

    /// Every scheduled workload, earliest first.
    pub fn ids(&self) -> Vec<WorkloadId> {
        self.entries.values().copied().collect()
    }

    pub fn due_at(&self, id: &WorkloadId) -> Option<DateTime<Utc>> {
        self.index.get(id).map(|(at, _, _)| *at)
    }

    /// Schedule (or move) the wake-up for `id`, ordered among equal due
    /// times by `at` itself.
    pub fn schedule(&mut self, id: WorkloadId, at: DateTime<Utc>) -> bool {
        self.schedule_since(id, at, at)
    }

    /// Schedule (or move) the wake-up for `id`. `since` is when the workload
    /// was evicted and decides the order among entries due at `at`.
    ///
    /// Rescheduling with the same times keeps the original position. Returns
    /// true if the queue changed.
    pub fn schedule_since(
        &mut self,
        id: WorkloadId,
        at: DateTime<Utc>,
        since: DateTime<Utc>,
    ) -> bool {
        if let Some(&slot) = self.index.get(&id) {
            if (slot.0, slot.1) == (at, since) {
                return false;
            }
            self.entries.remove(&slot);
        }

        let slot = (at, since, self.next_seq);
        self.next_seq += 1;
        self.entries.insert(slot, id);
        self.index.insert(id, slot);
        true
    }

    /// Drop the wake-up for `id`. Returns true if one existed.
    pub fn cancel(&mut self, id: &WorkloadId) -> bool {
        match self.index.remove(id) {
            Some(key) => {
                self.entries.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Earliest scheduled wake time.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.entries.keys().next().map(|(at, _, _)| *at)
    }

    /// Remove and return every workload due at or before `now`, earliest
    /// first, ties first evicted first.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<WorkloadId> {
        let mut due = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let id = entry.remove();
            self.index.remove(&id);
            due.push(id);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn test_pop_due_in_time_order() {
        let now = Utc::now();
        let mut queue = RequeueQueue::new();
        let (a, b, c) = (WorkloadId::new(), WorkloadId::new(), WorkloadId::new());

        queue.schedule(a, now + secs(10));
        queue.schedule(b, now + secs(5));
        queue.schedule(c, now + secs(20));

        assert_eq!(queue.next_due(), Some(now + secs(5)));
        assert!(queue.pop_due(now).is_empty());
        assert_eq!(queue.pop_due(now + secs(10)), vec![b, a]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_due(), Some(now + secs(20)));
    }

    #[test]
    fn test_ties_break_by_enqueue_order() {
        let now = Utc::now();
        let mut queue = RequeueQueue::new();
        let ids: Vec<_> = (0..4).map(|_| WorkloadId::new()).collect();

        // Schedule in reverse ID order to make sure the ID does not decide.
        for id in ids.iter().rev() {
            queue.schedule(*id, now);
        }
        let expected: Vec<_> = ids.iter().rev().copied().collect();
        assert_eq!(queue.pop_due(now), expected);
    }

    #[test]
    fn test_past_times_are_due_immediately() {
        let now = Utc::now();
        let mut queue = RequeueQueue::new();
        let id = WorkloadId::new();
        queue.schedule(id, now - secs(3600));
        assert_eq!(queue.pop_due(now), vec![id]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reschedule_and_cancel() {
        let now = Utc::now();
        let mut queue = RequeueQueue::new();
        let (a, b) = (WorkloadId::new(), WorkloadId::new());

        assert!(queue.schedule(a, now + secs(5)));
        assert!(queue.schedule(b, now + secs(5)));
        // Same time: keeps its place ahead of b.
        assert!(!queue.schedule(a, now + secs(5)));
        assert_eq!(queue.pop_due(now + secs(5)), vec![a, b]);

        queue.schedule(a, now + secs(5));
        assert!(queue.schedule(a, now + secs(50)));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.due_at(&a), Some(now + secs(50)));
        assert!(queue.pop_due(now + secs(10)).is_empty());

        assert!(queue.cancel(&a));
        assert!(!queue.cancel(&a));
        assert!(queue.pop_due(now + secs(100)).is_empty());
        assert_eq!(queue.next_due(), None);
    }

    #[test]
    fn test_ties_break_by_eviction_time() {
        let now = Utc::now();
        let mut queue = RequeueQueue::new();
        let (early, late) = (WorkloadId::new(), WorkloadId::new());

        // Scheduled in the opposite order of eviction.
        queue.schedule_since(late, now + secs(10), now + secs(5));
        queue.schedule_since(early, now + secs(10), now);
        assert_eq!(queue.pop_due(now + secs(10)), vec![early, late]);

        // Same due time but a new eviction time moves the entry.
        queue.schedule_since(early, now + secs(10), now);
        queue.schedule_since(late, now + secs(10), now + secs(5));
        assert!(queue.schedule_since(early, now + secs(10), now + secs(7)));
        assert_eq!(queue.pop_due(now + secs(10)), vec![late, early]);
    }
}
