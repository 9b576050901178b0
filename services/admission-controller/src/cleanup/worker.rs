use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::db::purge_tombstones;

#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    pub interval: Duration,
    /// How long deleted records stay visible to the change feed.
    pub tombstone_retention: Duration,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            tombstone_retention: Duration::from_secs(24 * 3600),
        }
    }
}

pub struct CleanupWorker {
    pool: PgPool,
    config: CleanupWorkerConfig,
}

impl CleanupWorker {
    pub fn new(pool: PgPool, config: CleanupWorkerConfig) -> Self {
        Self { pool, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            tombstone_retention_secs = self.config.tombstone_retention.as_secs(),
            "Starting cleanup worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cleanup().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Cleanup worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run one cleanup pass. Returns the number of rows removed.
    pub async fn run_cleanup(&self) -> u64 {
        match purge_tombstones(&self.pool, self.config.tombstone_retention).await {
            Ok(count) => {
                if count > 0 {
                    info!(deleted = count, "Purged object tombstones");
                }
                count
            }
            Err(e) => {
                error!(error = %e, "Failed to purge object tombstones");
                0
            }
        }
    }
}
