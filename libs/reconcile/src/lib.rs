//! Reconciliation loop primitives.
//!
//! Every reconciler in the control plane follows the same discipline:
//!
//! - **Read fresh**: each attempt starts from the last persisted state.
//! - **Write conditionally**: the write names the version it was derived from.
//! - **Retry on conflict**: a rejected write restarts the cycle from a new read.
//!
//! This crate holds the pieces of that discipline that are independent of the
//! data model: the bounded conflict-retry loop, exponential backoff for
//! unavailable dependencies, and change-feed checkpoints.
//!
//! # Invariants
//!
//! - An operation passed to [`retry_on_conflict`] must be idempotent given the
//!   same persisted input; it may run several times.
//! - Checkpoints only move forward.

use std::future::Future;
use std::time::Duration;

use admitq_id::Revision;
use tracing::{debug, warn};

/// Classification hook for errors flowing through [`retry_on_conflict`].
pub trait ConflictAware {
    /// Returns true if the error is an optimistic-concurrency conflict that a
    /// fresh read may resolve.
    fn is_conflict(&self) -> bool;
}

/// Bound on the number of read-modify-write attempts per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictRetry {
    pub max_attempts: u32,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_CONFLICT_ATTEMPTS,
        }
    }
}

impl ConflictRetry {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }
}

/// Run a read-modify-write cycle, restarting it from scratch on conflict.
///
/// `op` receives the 1-based attempt number. Non-conflict errors are returned
/// immediately. When the attempt bound is reached the last conflict is
/// returned and the caller treats it as "retry later".
pub async fn retry_on_conflict<T, E, F, Fut>(
    policy: ConflictRetry,
    resource: &str,
    mut op: F,
) -> Result<T, E>
where
    E: ConflictAware + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Err(e) if e.is_conflict() => {
                if attempt >= policy.max_attempts {
                    warn!(
                        resource,
                        attempts = attempt,
                        error = %e,
                        "Giving up after repeated write conflicts"
                    );
                    return Err(e);
                }
                debug!(resource, attempt, "Write conflict, retrying from fresh read");
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Upper bound for any single delay (before jitter).
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given zero-based failure count.
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.min(32) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exp);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 + jitter * (rand::random::<f64>() * 2.0 - 1.0);

        Duration::from_millis((delay * factor).max(0.0) as u64)
    }
}

/// Position of a change-feed consumer.
///
/// Tracks the last delivered revision so a restarted feed neither skips nor
/// re-delivers more than necessary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Last delivered revision.
    pub revision: Revision,

    /// Timestamp of last checkpoint update.
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Checkpoint {
    pub fn new(revision: Revision) -> Self {
        Self {
            revision,
            updated_at: chrono::Utc::now(),
        }
    }

    /// Check if a revision has already been delivered.
    pub fn is_processed(&self, revision: Revision) -> bool {
        revision <= self.revision
    }

    /// Advance the checkpoint. Older revisions are ignored.
    pub fn advance(&mut self, revision: Revision) {
        if revision > self.revision {
            self.revision = revision;
            self.updated_at = chrono::Utc::now();
        }
    }
}

/// Default interval between full resync passes.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default bound on read-modify-write attempts.
pub const DEFAULT_MAX_CONFLICT_ATTEMPTS: u32 = 16;

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Conflict,
        Fatal,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl ConflictAware for TestError {
        fn is_conflict(&self) -> bool {
            matches!(self, TestError::Conflict)
        }
    }

    #[tokio::test]
    async fn test_retry_until_commit() {
        let calls = AtomicU32::new(0);
        let result = retry_on_conflict(ConflictRetry::new(5), "wl", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(TestError::Conflict)
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_on_conflict(ConflictRetry::new(4), "wl", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Conflict) }
        })
        .await;

        assert_eq!(result, Err(TestError::Conflict));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_on_conflict(ConflictRetry::default(), "wl", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Fatal) }
        })
        .await;

        assert_eq!(result, Err(TestError::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_conflict_retry_at_least_one_attempt() {
        assert_eq!(ConflictRetry::new(0).max_attempts, 1);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
            jitter: 0.0,
        };

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(40), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let policy = BackoffPolicy::default();
        for _ in 0..50 {
            let d = policy.delay(2);
            assert!(d >= Duration::from_millis(300));
            assert!(d <= Duration::from_millis(500));
        }
    }

    #[test]
    fn test_checkpoint() {
        let mut cp = Checkpoint::new(Revision::new(100));

        assert!(cp.is_processed(Revision::new(50)));
        assert!(cp.is_processed(Revision::new(100)));
        assert!(!cp.is_processed(Revision::new(101)));

        cp.advance(Revision::new(150));
        assert!(cp.is_processed(Revision::new(150)));

        cp.advance(Revision::new(120));
        assert_eq!(cp.revision, Revision::new(150));
    }
}
