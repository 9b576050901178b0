//! Check state machine.
//!
//! [`transition`] is a pure function of the last persisted check state and an
//! incoming verdict. It never reads an accumulator that survives between
//! deliveries, so a verdict replayed before its result is persisted produces
//! the same next state, and only one of the competing writes commits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::model::{AdmissionCheckState, CheckState};

/// Verdict states an external check controller may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerdictState {
    Pending,
    Ready,
    Retry,
    Rejected,
}

impl VerdictState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Ready => "Ready",
            Self::Retry => "Retry",
            Self::Rejected => "Rejected",
        }
    }
}

impl std::fmt::Display for VerdictState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VerdictState {
    type Err = VerdictError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" | "pending" => Ok(Self::Pending),
            "Ready" | "ready" => Ok(Self::Ready),
            "Retry" | "retry" => Ok(Self::Retry),
            "Rejected" | "rejected" => Ok(Self::Rejected),
            other => Err(VerdictError::UnknownState(other.to_string())),
        }
    }
}

/// A verdict that failed boundary validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerdictError {
    #[error("unrecognized check state '{0}'")]
    UnknownState(String),

    #[error("retry_count must not be negative (got {0})")]
    NegativeRetryCount(i64),

    #[error("requeue_after_seconds must not be negative (got {0})")]
    NegativeRequeueAfter(i64),

    #[error("requeue_after_seconds is out of range (got {0})")]
    RequeueAfterOutOfRange(i64),
}

/// Verdict as received on the wire, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerdictRequest {
    pub state: String,
    #[serde(default)]
    pub message: Option<String>,
    /// Advisory only; the persisted retry count is owned by the controller.
    #[serde(default)]
    pub retry_count: Option<i64>,
    #[serde(default)]
    pub requeue_after_seconds: Option<i64>,
    /// Reservation the verdict was produced for, when the check tracks it.
    #[serde(default)]
    pub reservation_generation: Option<u64>,
}

/// A validated verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub state: VerdictState,
    pub message: String,
    pub retry_count_hint: Option<u32>,
    pub requeue_after_seconds: Option<u32>,
    pub reservation_generation: Option<u64>,
}

impl Verdict {
    pub fn new(state: VerdictState) -> Self {
        Self {
            state,
            message: String::new(),
            retry_count_hint: None,
            requeue_after_seconds: None,
            reservation_generation: None,
        }
    }

    pub fn ready() -> Self {
        Self::new(VerdictState::Ready)
    }

    pub fn retry() -> Self {
        Self::new(VerdictState::Retry)
    }

    pub fn rejected() -> Self {
        Self::new(VerdictState::Rejected)
    }

    pub fn pending() -> Self {
        Self::new(VerdictState::Pending)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_retry_count_hint(mut self, hint: u32) -> Self {
        self.retry_count_hint = Some(hint);
        self
    }

    pub fn with_requeue_after(mut self, seconds: u32) -> Self {
        self.requeue_after_seconds = Some(seconds);
        self
    }

    pub fn for_generation(mut self, generation: u64) -> Self {
        self.reservation_generation = Some(generation);
        self
    }
}

impl TryFrom<VerdictRequest> for Verdict {
    type Error = VerdictError;

    fn try_from(req: VerdictRequest) -> Result<Self, Self::Error> {
        let state = req.state.parse()?;

        let retry_count_hint = match req.retry_count {
            Some(n) if n < 0 => return Err(VerdictError::NegativeRetryCount(n)),
            Some(n) => Some(u32::try_from(n).unwrap_or(u32::MAX)),
            None => None,
        };

        let requeue_after_seconds = match req.requeue_after_seconds {
            Some(n) if n < 0 => return Err(VerdictError::NegativeRequeueAfter(n)),
            Some(n) => {
                Some(u32::try_from(n).map_err(|_| VerdictError::RequeueAfterOutOfRange(n))?)
            }
            None => None,
        };

        Ok(Self {
            state,
            message: req.message.unwrap_or_default(),
            retry_count_hint,
            requeue_after_seconds,
            reservation_generation: req.reservation_generation,
        })
    }
}

/// Compute the next persisted state of a check.
///
/// Returns `None` when the verdict leaves the persisted state unchanged:
/// a Pending verdict, or a Ready/Rejected verdict that is already recorded.
///
/// Retry always yields a new state (Pending, retry count + 1). Whether a
/// Retry is still owed processing is decided by the eviction controller from
/// the persisted reservation, not here.
pub fn transition(
    current: &AdmissionCheckState,
    verdict: &Verdict,
    now: DateTime<Utc>,
) -> Option<AdmissionCheckState> {
    let settled = |state: CheckState| {
        if current.state == state && current.message == verdict.message {
            return None;
        }
        Some(AdmissionCheckState {
            name: current.name.clone(),
            state,
            message: verdict.message.clone(),
            retry_count: current.retry_count,
            last_transition_time: now,
            requeue_after_seconds: current.requeue_after_seconds,
        })
    };

    match verdict.state {
        VerdictState::Pending => None,
        VerdictState::Ready => settled(CheckState::Ready),
        VerdictState::Rejected => settled(CheckState::Rejected),
        VerdictState::Retry => {
            if let Some(hint) = verdict.retry_count_hint {
                debug!(
                    check = %current.name,
                    hint,
                    persisted = current.retry_count,
                    "Ignoring externally supplied retry count"
                );
            }
            Some(AdmissionCheckState {
                name: current.name.clone(),
                state: CheckState::Pending,
                message: verdict.message.clone(),
                retry_count: current.retry_count.saturating_add(1),
                last_transition_time: now,
                requeue_after_seconds: verdict.requeue_after_seconds,
            })
        }
    }
}
