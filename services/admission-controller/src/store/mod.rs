//! Object store adapter.
//!
//! The store is the only synchronization primitive shared between
//! reconcilers. It offers:
//! - Versioned reads of workload and queue records
//! - All-or-nothing multi-record commits with per-record version
//!   preconditions (optimistic concurrency)
//! - An at-least-once change feed
//!
//! Two implementations ship: [`InMemoryStore`] for tests and single-process
//! deployments, and `db::PgStore` backed by Postgres.

mod memory;

pub use memory::InMemoryStore;

use std::sync::Arc;

use admitq_id::{ResourceVersion, WorkloadId};
use admitq_reconcile::ConflictAware;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::{QueueRecord, Workload};

pub type StoreResult<T> = Result<T, StoreError>;

pub type SharedStore = Arc<dyn ObjectStore>;

/// Object store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A write precondition failed (optimistic concurrency).
    #[error("version conflict on {key}")]
    Conflict { key: ObjectKey },

    /// The transaction itself is malformed.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// The store cannot be reached right now.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database failure other than connectivity.
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl ConflictAware for StoreError {
    fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Workload,
    Queue,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workload => "workload",
            Self::Queue => "queue",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "workload" => Some(Self::Workload),
            "queue" => Some(Self::Queue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub kind: Kind,
    pub name: String,
}

impl ObjectKey {
    pub fn workload(id: &WorkloadId) -> Self {
        Self {
            kind: Kind::Workload,
            name: id.to_string(),
        }
    }

    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            kind: Kind::Queue,
            name: name.into(),
        }
    }

    /// The workload ID, if this key names a workload.
    pub fn workload_id(&self) -> Option<WorkloadId> {
        match self.kind {
            Kind::Workload => self.name.parse().ok(),
            Kind::Queue => None,
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind.as_str(), self.name)
    }
}

/// A record together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub version: ResourceVersion,
    pub value: T,
}

impl<T> Versioned<T> {
    pub fn new(version: ResourceVersion, value: T) -> Self {
        Self { version, value }
    }
}

/// Write precondition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// The record must not exist.
    Absent,
    /// The record must exist at exactly this version.
    Version(ResourceVersion),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    Workload(Workload),
    Queue(QueueRecord),
}

impl Object {
    pub fn key(&self) -> ObjectKey {
        match self {
            Self::Workload(wl) => ObjectKey::workload(&wl.id),
            Self::Queue(queue) => ObjectKey::queue(queue.name.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    Put { object: Object, expect: Expect },
    Delete { key: ObjectKey, expect: ResourceVersion },
}

impl Write {
    pub fn key(&self) -> ObjectKey {
        match self {
            Self::Put { object, .. } => object.key(),
            Self::Delete { key, .. } => key.clone(),
        }
    }
}

/// A set of writes that commit together or not at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    writes: Vec<Write>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_workload(mut self, workload: Workload, expect: Expect) -> Self {
        self.writes.push(Write::Put {
            object: Object::Workload(workload),
            expect,
        });
        self
    }

    pub fn put_queue(mut self, queue: QueueRecord, expect: Expect) -> Self {
        self.writes.push(Write::Put {
            object: Object::Queue(queue),
            expect,
        });
        self
    }

    pub fn delete(mut self, key: ObjectKey, expect: ResourceVersion) -> Self {
        self.writes.push(Write::Delete { key, expect });
        self
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    pub fn into_writes(self) -> Vec<Write> {
        self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Reject empty transactions and transactions touching a key twice.
    pub fn validate(&self) -> StoreResult<()> {
        if self.writes.is_empty() {
            return Err(StoreError::InvalidTransaction("no writes".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for write in &self.writes {
            let key = write.key();
            if !seen.insert(key.clone()) {
                return Err(StoreError::InvalidTransaction(format!(
                    "{key} written more than once"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Upserted,
    Deleted,
}

/// Change notification. Delivery is at-least-once and may be coalesced;
/// consumers re-read the record rather than trusting the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: ObjectKey,
    pub version: ResourceVersion,
    pub change: Change,
}

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn get_workload(&self, id: &WorkloadId) -> StoreResult<Option<Versioned<Workload>>>;

    async fn list_workloads(&self) -> StoreResult<Vec<Versioned<Workload>>>;

    async fn get_queue(&self, name: &str) -> StoreResult<Option<Versioned<QueueRecord>>>;

    async fn list_queues(&self) -> StoreResult<Vec<Versioned<QueueRecord>>>;

    /// Apply every write or none. Returns the resulting version per write,
    /// in order (for deletes, the version that was removed).
    async fn commit(&self, txn: Transaction) -> StoreResult<Vec<ResourceVersion>>;

    /// Subscribe to the change feed.
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;

    async fn health_check(&self) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::resources;

    #[test]
    fn test_object_key_display_and_parse() {
        let id = WorkloadId::new();
        let key = ObjectKey::workload(&id);
        assert_eq!(key.to_string(), format!("workload/{id}"));
        assert_eq!(key.workload_id(), Some(id));
        assert_eq!(ObjectKey::queue("dev").workload_id(), None);
        assert_eq!(Kind::parse(Kind::Queue.as_str()), Some(Kind::Queue));
    }

    #[test]
    fn test_transaction_rejects_duplicate_keys() {
        let queue = QueueRecord::new("dev", resources([("cpu", 1)]));
        let txn = Transaction::new()
            .put_queue(queue.clone(), Expect::Absent)
            .put_queue(queue, Expect::Version(ResourceVersion::FIRST));
        assert!(matches!(
            txn.validate(),
            Err(StoreError::InvalidTransaction(_))
        ));
        assert!(Transaction::new().validate().is_err());
    }

    #[test]
    fn test_conflict_classification() {
        let conflict = StoreError::Conflict {
            key: ObjectKey::queue("dev"),
        };
        assert!(conflict.is_conflict());
        assert!(!StoreError::Unavailable("down".to_string()).is_conflict());
        assert!(StoreError::Unavailable("down".to_string()).is_unavailable());
    }
}
