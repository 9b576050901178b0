//! In-memory object store.
//!
//! Holds every record behind one mutex; commits validate all preconditions
//! before applying any write. Change events are published after the lock is
//! released.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use admitq_id::{ResourceVersion, WorkloadId};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use super::{
    Change, ChangeEvent, Expect, Kind, Object, ObjectKey, ObjectStore, StoreError, StoreResult,
    Transaction, Versioned, Write,
};
use crate::model::{QueueRecord, Workload};

const CHANGE_FEED_CAPACITY: usize = 1024;

struct Stored {
    version: ResourceVersion,
    object: Object,
}

#[derive(Default)]
struct Objects {
    live: BTreeMap<ObjectKey, Stored>,
    /// Last version of each deleted key. A recreated key continues from here.
    tombstones: HashMap<ObjectKey, ResourceVersion>,
}

pub struct InMemoryStore {
    objects: Mutex<Objects>,
    changes: broadcast::Sender<ChangeEvent>,
    available: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            objects: Mutex::new(Objects::default()),
            changes,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every operation fails with `Unavailable` until
    /// availability is restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store offline".to_string()))
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Objects> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn as_workload(stored: &Stored) -> Option<Versioned<Workload>> {
    match &stored.object {
        Object::Workload(wl) => Some(Versioned::new(stored.version, wl.clone())),
        Object::Queue(_) => None,
    }
}

fn as_queue(stored: &Stored) -> Option<Versioned<QueueRecord>> {
    match &stored.object {
        Object::Queue(queue) => Some(Versioned::new(stored.version, queue.clone())),
        Object::Workload(_) => None,
    }
}

fn check(current: Option<&Stored>, key: &ObjectKey, expect: Expect) -> StoreResult<()> {
    let ok = match (current, expect) {
        (None, Expect::Absent) => true,
        (Some(stored), Expect::Version(v)) => stored.version == v,
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(StoreError::Conflict { key: key.clone() })
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get_workload(&self, id: &WorkloadId) -> StoreResult<Option<Versioned<Workload>>> {
        self.ensure_available()?;
        Ok(self.lock().live.get(&ObjectKey::workload(id)).and_then(as_workload))
    }

    async fn list_workloads(&self) -> StoreResult<Vec<Versioned<Workload>>> {
        self.ensure_available()?;
        Ok(self
            .lock()
            .live
            .iter()
            .filter(|(key, _)| key.kind == Kind::Workload)
            .filter_map(|(_, stored)| as_workload(stored))
            .collect())
    }

    async fn get_queue(&self, name: &str) -> StoreResult<Option<Versioned<QueueRecord>>> {
        self.ensure_available()?;
        Ok(self.lock().live.get(&ObjectKey::queue(name)).and_then(as_queue))
    }

    async fn list_queues(&self) -> StoreResult<Vec<Versioned<QueueRecord>>> {
        self.ensure_available()?;
        Ok(self
            .lock()
            .live
            .iter()
            .filter(|(key, _)| key.kind == Kind::Queue)
            .filter_map(|(_, stored)| as_queue(stored))
            .collect())
    }

    async fn commit(&self, txn: Transaction) -> StoreResult<Vec<ResourceVersion>> {
        self.ensure_available()?;
        txn.validate()?;

        let mut events = Vec::with_capacity(txn.writes().len());
        let mut versions = Vec::with_capacity(txn.writes().len());
        {
            let mut objects = self.lock();

            for write in txn.writes() {
                let key = write.key();
                let expect = match write {
                    Write::Put { expect, .. } => *expect,
                    Write::Delete { expect, .. } => Expect::Version(*expect),
                };
                check(objects.live.get(&key), &key, expect)?;
            }

            for write in txn.into_writes() {
                match write {
                    Write::Put { object, .. } => {
                        let key = object.key();
                        let live = objects.live.get(&key).map(|stored| stored.version);
                        let version = live
                            .or_else(|| objects.tombstones.remove(&key))
                            .map_or(ResourceVersion::FIRST, |v| v.next());
                        objects.live.insert(key.clone(), Stored { version, object });
                        versions.push(version);
                        events.push(ChangeEvent {
                            key,
                            version,
                            change: Change::Upserted,
                        });
                    }
                    Write::Delete { key, expect } => {
                        objects.live.remove(&key);
                        objects.tombstones.insert(key.clone(), expect);
                        versions.push(expect);
                        events.push(ChangeEvent {
                            key,
                            version: expect,
                            change: Change::Deleted,
                        });
                    }
                }
            }
        }

        for event in events {
            debug!(key = %event.key, version = %event.version, change = ?event.change, "Committed");
            // No subscribers is fine.
            let _ = self.changes.send(event);
        }

        Ok(versions)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.ensure_available()
    }
}
