//! Persisted records: workloads and queues.
//!
//! These are the only shapes written to the object store. Transition logic
//! lives in `checks`, `quota`, `eviction`, and `scheduler`; this module only
//! owns the data and the derived views every component agrees on.
//!
//! # Invariants
//!
//! - `admitted` implies a reservation is held and every required check is Ready.
//! - No reservation implies not admitted.
//! - A `RequeueState` is never present while a reservation is held.

use std::collections::BTreeMap;

use admitq_id::WorkloadId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checks::AdmissionChecks;

/// Resource name to requested (or offered) quantity.
pub type ResourceList = BTreeMap<String, i64>;

/// Resting state of a single admission check.
///
/// `Retry` is deliberately absent: a retry verdict is consumed by the
/// eviction that it triggers and the check comes back as `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckState {
    Pending,
    Ready,
    Rejected,
}

impl CheckState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Ready => "Ready",
            Self::Rejected => "Rejected",
        }
    }

    /// Ready and Rejected are final for the current reservation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Rejected)
    }
}

impl std::fmt::Display for CheckState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-check status as persisted on the workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionCheckState {
    pub name: String,
    pub state: CheckState,
    #[serde(default)]
    pub message: String,
    /// Number of processed Retry verdicts. Only this subsystem writes it.
    #[serde(default)]
    pub retry_count: u32,
    pub last_transition_time: DateTime<Utc>,
    /// Backoff hint from the most recent Retry verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeue_after_seconds: Option<u32>,
}

impl AdmissionCheckState {
    pub fn pending(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            state: CheckState::Pending,
            message: String::new(),
            retry_count: 0,
            last_transition_time: now,
            requeue_after_seconds: None,
        }
    }
}

/// Delayed re-entry into the schedulable pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequeueState {
    pub requeue_at: DateTime<Utc>,
    /// Consecutive requeues with a delay.
    pub count: u32,
}

impl RequeueState {
    /// A requeue is live until its wake time has passed.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.requeue_at > now
    }
}

/// Quota held for a workload in its queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub queue: String,
    pub resources: ResourceList,
    /// Ordinal of this reservation among all reservations the workload held.
    pub generation: u64,
    pub reserved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    AdmissionCheckRetry,
    AdmissionCheckRejected,
}

/// Record of the most recent eviction, kept for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eviction {
    pub reason: EvictionReason,
    pub check: String,
    #[serde(default)]
    pub message: String,
    pub evicted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation: Option<Reservation>,
    #[serde(default)]
    pub admitted: bool,
    #[serde(default)]
    pub admission_checks: AdmissionChecks,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeue_state: Option<RequeueState>,
    /// Generation of the latest reservation granted (0 if never reserved).
    #[serde(default)]
    pub reservation_generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_eviction: Option<Eviction>,
}

/// Derived lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadPhase {
    /// No reservation held.
    Pending,
    /// Reservation held, checks outstanding.
    Reserved,
    /// Reservation held and every required check Ready.
    Admitted,
    /// A required check rejected the workload.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub id: WorkloadId,
    pub queue: String,
    #[serde(default)]
    pub priority: i32,
    pub resources: ResourceList,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: WorkloadStatus,
}

impl Workload {
    pub fn new(queue: impl Into<String>, resources: ResourceList, now: DateTime<Utc>) -> Self {
        Self {
            id: WorkloadId::new(),
            queue: queue.into(),
            priority: 0,
            resources,
            created_at: now,
            status: WorkloadStatus::default(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn has_reservation(&self) -> bool {
        self.status.reservation.is_some()
    }

    pub fn is_admitted(&self) -> bool {
        self.status.admitted
    }

    pub fn is_rejected(&self, required: &[String]) -> bool {
        self.status.admission_checks.rejected(required).is_some()
    }

    pub fn has_live_requeue(&self, now: DateTime<Utc>) -> bool {
        self.status
            .requeue_state
            .is_some_and(|requeue| requeue.is_live(now))
    }

    /// When the workload last joined the pending pool: its latest eviction,
    /// or its creation if it was never evicted.
    pub fn queued_since(&self) -> DateTime<Utc> {
        self.status
            .last_eviction
            .as_ref()
            .map_or(self.created_at, |e| e.evicted_at)
    }

    /// Recompute `admitted` from the reservation and required checks.
    ///
    /// Returns true if the flag changed.
    pub fn recompute_admitted(&mut self, required: &[String]) -> bool {
        let admitted =
            self.has_reservation() && self.status.admission_checks.all_ready(required);
        let changed = self.status.admitted != admitted;
        self.status.admitted = admitted;
        changed
    }

    pub fn phase(&self, required: &[String]) -> WorkloadPhase {
        if self.is_rejected(required) {
            WorkloadPhase::Rejected
        } else if self.status.admitted {
            WorkloadPhase::Admitted
        } else if self.has_reservation() {
            WorkloadPhase::Reserved
        } else {
            WorkloadPhase::Pending
        }
    }
}

/// Capacity record for one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub name: String,
    pub capacity: ResourceList,
    /// Active reservations keyed by workload.
    #[serde(default)]
    pub reservations: BTreeMap<WorkloadId, ResourceList>,
    /// Checks every workload in this queue must pass, in declaration order.
    #[serde(default)]
    pub admission_checks: Vec<String>,
}

impl QueueRecord {
    pub fn new(name: impl Into<String>, capacity: ResourceList) -> Self {
        Self {
            name: name.into(),
            capacity,
            reservations: BTreeMap::new(),
            admission_checks: Vec::new(),
        }
    }

    pub fn with_admission_checks<I, S>(mut self, checks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.admission_checks = checks.into_iter().map(Into::into).collect();
        self
    }
}

/// Build a `ResourceList` from `(name, quantity)` pairs.
pub fn resources<I, S>(pairs: I) -> ResourceList
where
    I: IntoIterator<Item = (S, i64)>,
    S: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn reservation(now: DateTime<Utc>) -> Reservation {
        Reservation {
            queue: "dev".to_string(),
            resources: resources([("cpu", 1)]),
            generation: 1,
            reserved_at: now,
        }
    }

    #[test]
    fn test_admitted_requires_reservation() {
        let now = Utc::now();
        let mut wl = Workload::new("dev", resources([("cpu", 1)]), now);

        // No required checks, but no reservation either.
        assert!(!wl.recompute_admitted(&[]));
        assert!(!wl.is_admitted());

        wl.status.reservation = Some(reservation(now));
        assert!(wl.recompute_admitted(&[]));
        assert!(wl.is_admitted());
        assert_eq!(wl.phase(&[]), WorkloadPhase::Admitted);
    }

    #[test]
    fn test_admitted_requires_ready_checks() {
        let now = Utc::now();
        let checks = required(&["delayed-check"]);
        let mut wl = Workload::new("dev", resources([("cpu", 1)]), now);
        wl.status.reservation = Some(reservation(now));
        wl.status.admission_checks.initialize(&checks, now);

        assert!(!wl.recompute_admitted(&checks));
        assert_eq!(wl.phase(&checks), WorkloadPhase::Reserved);

        let mut ready = AdmissionCheckState::pending("delayed-check", now);
        ready.state = CheckState::Ready;
        wl.status.admission_checks.set(ready);
        assert!(wl.recompute_admitted(&checks));
        assert_eq!(wl.phase(&checks), WorkloadPhase::Admitted);

        wl.status.reservation = None;
        assert!(wl.recompute_admitted(&checks));
        assert!(!wl.is_admitted());
        assert_eq!(wl.phase(&checks), WorkloadPhase::Pending);
    }

    #[test]
    fn test_requeue_live_until_due() {
        let now = Utc::now();
        let requeue = RequeueState {
            requeue_at: now + chrono::Duration::seconds(5),
            count: 1,
        };
        assert!(requeue.is_live(now));
        assert!(!requeue.is_live(now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_workload_json_shape() {
        let now = Utc::now();
        let wl = Workload::new("dev", resources([("cpu", 2)]), now);
        let json = serde_json::to_value(&wl).unwrap();

        assert_eq!(json["queue"], "dev");
        assert_eq!(json["resources"]["cpu"], 2);
        assert!(json["status"].get("requeue_state").is_none());
        assert_eq!(json["status"]["admitted"], false);

        let back: Workload = serde_json::from_value(json).unwrap();
        assert_eq!(back, wl);
    }

    #[test]
    fn test_queue_reservations_keyed_by_workload_id() {
        let mut queue = QueueRecord::new("dev", resources([("cpu", 5)]));
        let id = WorkloadId::new();
        queue.reservations.insert(id, resources([("cpu", 1)]));

        let json = serde_json::to_value(&queue).unwrap();
        assert_eq!(json["reservations"][id.to_string()]["cpu"], 1);
    }
}
