//! Admission check registry.
//!
//! Each workload carries a map from check name to its persisted
//! [`AdmissionCheckState`]. Keys are unique; ordering carries no meaning, but
//! the map is sorted so the persisted form is stable across writers.
//!
//! The queue decides which checks are *required*. Checks present on the
//! workload but no longer required are kept for history and ignored by
//! admission decisions.

mod transition;

pub use transition::{transition, Verdict, VerdictError, VerdictRequest, VerdictState};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{AdmissionCheckState, CheckState};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdmissionChecks(BTreeMap<String, AdmissionCheckState>);

impl AdmissionChecks {
    pub fn get(&self, name: &str) -> Option<&AdmissionCheckState> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AdmissionCheckState> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Store a state computed by [`transition`], replacing any previous one.
    pub fn set(&mut self, state: AdmissionCheckState) {
        self.0.insert(state.name.clone(), state);
    }

    /// Prepare the required checks for a fresh reservation.
    ///
    /// Missing checks are created Pending. A check that exists is already
    /// either Pending (in flight, possibly after a processed Retry, keeping its
    /// retry count and backoff hint) or terminal, and is left untouched.
    /// Returns the number of checks created.
    pub fn initialize(&mut self, required: &[String], now: DateTime<Utc>) -> usize {
        let mut created = 0;
        for name in required {
            if !self.0.contains_key(name) {
                self.0
                    .insert(name.clone(), AdmissionCheckState::pending(name.clone(), now));
                created += 1;
            }
        }
        created
    }

    /// True when every required check is present and Ready.
    ///
    /// A queue with no required checks is trivially satisfied.
    pub fn all_ready(&self, required: &[String]) -> bool {
        required.iter().all(|name| {
            self.0
                .get(name)
                .is_some_and(|check| check.state == CheckState::Ready)
        })
    }

    /// The first required check (in queue order) that rejected the workload.
    pub fn rejected(&self, required: &[String]) -> Option<&AdmissionCheckState> {
        required
            .iter()
            .filter_map(|name| self.0.get(name))
            .find(|check| check.state == CheckState::Rejected)
    }
}
