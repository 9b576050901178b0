//! Object store backed by the `objects` table.
//!
//! Every write runs inside one database transaction. Preconditions are
//! enforced in the `WHERE` clause of each statement: an update or delete that
//! touches zero rows means the expected version did not match, and the whole
//! transaction is rolled back as a conflict.

use std::time::Duration;

use admitq_id::{ResourceVersion, Revision, WorkloadId};
use admitq_reconcile::Checkpoint;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

use super::error::is_connectivity_error;
use crate::model::{QueueRecord, Workload};
use crate::store::{
    Change, ChangeEvent, Expect, Kind, Object, ObjectKey, ObjectStore, StoreError, StoreResult,
    Transaction, Versioned, Write,
};

const CHANGE_FEED_CAPACITY: usize = 1024;

/// Rows fetched per change-feed poll.
const CHANGE_FEED_BATCH: i64 = 500;

fn store_error(e: sqlx::Error) -> StoreError {
    if is_connectivity_error(&e) {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Database(e)
    }
}

fn version_from_db(raw: i64) -> ResourceVersion {
    ResourceVersion::new(u64::try_from(raw).unwrap_or_default())
}

fn version_to_db(version: ResourceVersion) -> i64 {
    i64::try_from(version.value()).unwrap_or(i64::MAX)
}

fn decode<T: DeserializeOwned>(row: &PgRow) -> StoreResult<Versioned<T>> {
    let version: i64 = row.try_get("version").map_err(store_error)?;
    let body: serde_json::Value = row.try_get("body").map_err(store_error)?;
    Ok(Versioned::new(version_from_db(version), serde_json::from_value(body)?))
}

fn encode(object: &Object) -> StoreResult<serde_json::Value> {
    Ok(match object {
        Object::Workload(wl) => serde_json::to_value(wl)?,
        Object::Queue(queue) => serde_json::to_value(queue)?,
    })
}

/// Postgres-backed object store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    changes: broadcast::Sender<ChangeEvent>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self { pool, changes }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Build the poller that feeds [`ObjectStore::subscribe`].
    ///
    /// The feed starts at the current head; earlier state is picked up by the
    /// consumers' startup resync.
    pub async fn change_feed(&self, interval: Duration) -> StoreResult<ChangeFeedPoller> {
        let head: Option<i64> = sqlx::query_scalar("SELECT MAX(revision) FROM objects")
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;

        Ok(ChangeFeedPoller {
            pool: self.pool.clone(),
            changes: self.changes.clone(),
            interval,
            checkpoint: Checkpoint::new(Revision::new(head.unwrap_or(0))),
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        key: &ObjectKey,
    ) -> StoreResult<Option<Versioned<T>>> {
        let row = sqlx::query(
            r#"
            SELECT version, body
            FROM objects
            WHERE kind = $1 AND name = $2 AND NOT deleted
            "#,
        )
        .bind(key.kind.as_str())
        .bind(&key.name)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.as_ref().map(decode).transpose()
    }

    async fn list<T: DeserializeOwned>(&self, kind: Kind) -> StoreResult<Vec<Versioned<T>>> {
        let rows = sqlx::query(
            r#"
            SELECT version, body
            FROM objects
            WHERE kind = $1 AND NOT deleted
            ORDER BY name
            "#,
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.iter().map(decode).collect()
    }

    async fn apply(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        write: &Write,
    ) -> StoreResult<Option<ResourceVersion>> {
        let version: Option<i64> = match write {
            Write::Put {
                object,
                expect: Expect::Absent,
            } => {
                let key = object.key();
                // A tombstone may be revived; its version keeps counting.
                sqlx::query_scalar(
                    r#"
                    INSERT INTO objects (kind, name, version, body)
                    VALUES ($1, $2, 1, $3)
                    ON CONFLICT (kind, name) DO UPDATE
                        SET version = objects.version + 1,
                            revision = nextval('objects_revision_seq'),
                            body = EXCLUDED.body,
                            deleted = FALSE,
                            updated_at = now()
                        WHERE objects.deleted
                    RETURNING version
                    "#,
                )
                .bind(key.kind.as_str())
                .bind(&key.name)
                .bind(encode(object)?)
                .fetch_optional(&mut **tx)
                .await
                .map_err(store_error)?
            }
            Write::Put {
                object,
                expect: Expect::Version(expected),
            } => {
                let key = object.key();
                sqlx::query_scalar(
                    r#"
                    UPDATE objects
                    SET version = version + 1,
                        revision = nextval('objects_revision_seq'),
                        body = $3,
                        updated_at = now()
                    WHERE kind = $1 AND name = $2 AND version = $4 AND NOT deleted
                    RETURNING version
                    "#,
                )
                .bind(key.kind.as_str())
                .bind(&key.name)
                .bind(encode(object)?)
                .bind(version_to_db(*expected))
                .fetch_optional(&mut **tx)
                .await
                .map_err(store_error)?
            }
            Write::Delete { key, expect } => sqlx::query_scalar(
                r#"
                UPDATE objects
                SET deleted = TRUE,
                    revision = nextval('objects_revision_seq'),
                    updated_at = now()
                WHERE kind = $1 AND name = $2 AND version = $3 AND NOT deleted
                RETURNING version
                "#,
            )
            .bind(key.kind.as_str())
            .bind(&key.name)
            .bind(version_to_db(*expect))
            .fetch_optional(&mut **tx)
            .await
            .map_err(store_error)?,
        };

        Ok(version.map(version_from_db))
    }
}

#[async_trait]
impl ObjectStore for PgStore {
    async fn get_workload(&self, id: &WorkloadId) -> StoreResult<Option<Versioned<Workload>>> {
        self.get(&ObjectKey::workload(id)).await
    }

    async fn list_workloads(&self) -> StoreResult<Vec<Versioned<Workload>>> {
        self.list(Kind::Workload).await
    }

    async fn get_queue(&self, name: &str) -> StoreResult<Option<Versioned<QueueRecord>>> {
        self.get(&ObjectKey::queue(name)).await
    }

    async fn list_queues(&self) -> StoreResult<Vec<Versioned<QueueRecord>>> {
        self.list(Kind::Queue).await
    }

    #[instrument(skip(self, txn), fields(writes = txn.writes().len()))]
    async fn commit(&self, txn: Transaction) -> StoreResult<Vec<ResourceVersion>> {
        txn.validate()?;

        // Lock rows in key order so concurrent commits cannot deadlock.
        let mut order: Vec<usize> = (0..txn.writes().len()).collect();
        order.sort_by_key(|&i| txn.writes()[i].key());

        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let mut versions = vec![ResourceVersion::FIRST; txn.writes().len()];
        for i in order {
            let write = &txn.writes()[i];
            match Self::apply(&mut tx, write).await? {
                Some(version) => versions[i] = version,
                None => {
                    // Dropping `tx` rolls back.
                    debug!(key = %write.key(), "Write precondition failed");
                    return Err(StoreError::Conflict { key: write.key() });
                }
            }
        }
        tx.commit().await.map_err(store_error)?;

        Ok(versions)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}

/// Tails `objects.revision` and publishes change events.
///
/// Revisions are allocated before commit, so a slow transaction can become
/// visible after a later revision was already delivered. Such events are
/// missed by the feed; consumers cover them with their periodic resync.
pub struct ChangeFeedPoller {
    pool: PgPool,
    changes: broadcast::Sender<ChangeEvent>,
    interval: Duration,
    checkpoint: Checkpoint,
}

impl ChangeFeedPoller {
    /// Run the poller until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            from_revision = %self.checkpoint.revision,
            "Starting change feed poller"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, "Change feed poll failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(
                            revision = %self.checkpoint.revision,
                            "Change feed poller shutting down"
                        );
                        break;
                    }
                }
            }
        }
    }

    /// Fetch and publish everything after the checkpoint. Returns the number
    /// of events published.
    pub async fn poll_once(&mut self) -> StoreResult<usize> {
        let mut published = 0;
        loop {
            let rows = sqlx::query(
                r#"
                SELECT kind, name, version, revision, deleted
                FROM objects
                WHERE revision > $1
                ORDER BY revision
                LIMIT $2
                "#,
            )
            .bind(self.checkpoint.revision.value())
            .bind(CHANGE_FEED_BATCH)
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;

            let batch = rows.len();
            for row in &rows {
                let kind: String = row.try_get("kind").map_err(store_error)?;
                let revision = Revision::new(row.try_get("revision").map_err(store_error)?);
                self.checkpoint.advance(revision);

                let Some(kind) = Kind::parse(&kind) else {
                    warn!(kind, "Unknown object kind in change feed");
                    continue;
                };
                let deleted: bool = row.try_get("deleted").map_err(store_error)?;
                let event = ChangeEvent {
                    key: ObjectKey {
                        kind,
                        name: row.try_get("name").map_err(store_error)?,
                    },
                    version: version_from_db(row.try_get("version").map_err(store_error)?),
                    change: if deleted {
                        Change::Deleted
                    } else {
                        Change::Upserted
                    },
                };
                // No receivers is fine; nobody is waiting yet.
                let _ = self.changes.send(event);
                published += 1;
            }

            if (batch as i64) < CHANGE_FEED_BATCH {
                break;
            }
        }

        if published > 0 {
            debug!(published, revision = %self.checkpoint.revision, "Change feed advanced");
        }
        Ok(published)
    }
}

/// Remove tombstones last touched more than `retention` ago.
pub(crate) async fn purge_tombstones(
    pool: &PgPool,
    retention: Duration,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        DELETE FROM objects
        WHERE deleted
          AND updated_at < now() - make_interval(secs => $1)
        "#,
    )
    .bind(retention.as_secs_f64())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
