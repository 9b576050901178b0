//! Postgres backend for the object store.
//!
//! [`connect`] opens a pool and hands back a [`PgStore`] over the `objects`
//! table. [`ChangeFeedPoller`] tails that table's revision column, and
//! [`run_migrations`] creates it in dev setups.

mod error;
mod store;

pub use error::DbError;
pub use store::{ChangeFeedPoller, PgStore};
pub(crate) use store::purge_tombstones;

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

/// Where the `objects` schema lives relative to the working directory or
/// the crate.
const MIGRATIONS_DIR: &str = "migrations";

/// Connection settings for the Postgres store.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long a store call waits for a pooled connection before the store
    /// reports itself unavailable.
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/admitq".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl DbConfig {
    /// `DATABASE_URL`, `DB_MAX_CONNECTIONS`, `DB_MIN_CONNECTIONS`; unset or
    /// unparsable values keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let count = |name: &str, default: u32| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };

        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: count("DB_MAX_CONNECTIONS", defaults.max_connections),
            min_connections: count("DB_MIN_CONNECTIONS", defaults.min_connections),
            ..defaults
        }
    }
}

/// Open a connection pool and wrap it in a [`PgStore`].
pub async fn connect(config: &DbConfig) -> Result<PgStore, DbError> {
    info!(
        max_connections = config.max_connections,
        "Connecting object store to Postgres"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.database_url)
        .await
        .map_err(DbError::Connect)?;

    Ok(PgStore::new(pool))
}

/// Create or upgrade the `objects` table.
pub async fn run_migrations(store: &PgStore) -> Result<(), DbError> {
    let dir = migrations_dir().ok_or_else(|| DbError::MigrationDirNotFound {
        searched: migration_candidates()
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })?;

    let migrator = Migrator::new(dir.as_path())
        .await
        .map_err(DbError::Migration)?;
    migrator
        .run(store.pool())
        .await
        .map_err(DbError::Migration)?;

    info!(dir = %dir.display(), "Object store schema is current");
    Ok(())
}

fn migration_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from(MIGRATIONS_DIR),
        Path::new(env!("CARGO_MANIFEST_DIR")).join(MIGRATIONS_DIR),
    ]
}

fn migrations_dir() -> Option<PathBuf> {
    migration_candidates().into_iter().find(|dir| dir.is_dir())
}
