//! Postgres startup errors.

use thiserror::Error;

/// Failures while bringing up the Postgres store. Errors from store calls
/// themselves surface as `StoreError`.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("cannot reach postgres: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("objects schema migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    #[error("no migrations directory (searched {searched})")]
    MigrationDirNotFound { searched: String },
}

/// True for failures that mean "the database cannot be reached right now"
/// rather than "the query was wrong".
pub(crate) fn is_connectivity_error(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Protocol(_)
    )
}
