//! Process configuration.
//!
//! Everything comes from environment variables; queue records can
//! additionally be seeded from a TOML file at startup.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use admitq_reconcile::{ConflictRetry, DEFAULT_MAX_CONFLICT_ATTEMPTS, DEFAULT_RESYNC_INTERVAL};
use anyhow::Result;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::DbConfig;
use crate::model::{QueueRecord, ResourceList};
use crate::store::{Expect, SharedStore, StoreError, StoreResult, Transaction};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to read queue file {path}: {source}")]
    QueueFileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse queue file {path}: {source}")]
    QueueFileParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("queue file {path}: {reason}")]
    InvalidQueue { path: PathBuf, reason: String },
}

/// Which object store backs the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub store: StoreBackend,
    pub database: DbConfig,
    pub resync_interval: Duration,
    pub change_feed_interval: Duration,
    pub max_conflict_retries: u32,
    pub queues_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self::from_lookup(|var| std::env::var(var).ok())?)
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = parse_var(&lookup, "ADMITQ_LISTEN_ADDR", "127.0.0.1:8080")?;

        let log_level = lookup("ADMITQ_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let dev_mode = lookup("ADMITQ_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let store = match lookup("ADMITQ_STORE").as_deref().unwrap_or("memory") {
            "memory" => StoreBackend::Memory,
            "postgres" => StoreBackend::Postgres,
            other => {
                return Err(ConfigError::InvalidValue {
                    var: "ADMITQ_STORE",
                    value: other.to_string(),
                    reason: "expected 'memory' or 'postgres'".to_string(),
                })
            }
        };

        let resync_secs: u64 = parse_var(
            &lookup,
            "ADMITQ_RESYNC_INTERVAL_SECS",
            &DEFAULT_RESYNC_INTERVAL.as_secs().to_string(),
        )?;
        if resync_secs == 0 {
            return Err(ConfigError::InvalidValue {
                var: "ADMITQ_RESYNC_INTERVAL_SECS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let change_feed_ms: u64 = parse_var(&lookup, "ADMITQ_CHANGE_FEED_INTERVAL_MS", "250")?;

        let max_conflict_retries = parse_var(
            &lookup,
            "ADMITQ_MAX_CONFLICT_RETRIES",
            &DEFAULT_MAX_CONFLICT_ATTEMPTS.to_string(),
        )?;

        let queues_file = lookup("ADMITQ_QUEUES_FILE")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            store,
            database: DbConfig::from_env(),
            resync_interval: Duration::from_secs(resync_secs),
            change_feed_interval: Duration::from_millis(change_feed_ms.max(10)),
            max_conflict_retries,
            queues_file,
        })
    }

    pub fn conflict_retry(&self) -> ConflictRetry {
        ConflictRetry::new(self.max_conflict_retries)
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str, default: &str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let value = lookup(var).unwrap_or_else(|| default.to_string());
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        var,
        value: value.clone(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct QueueFile {
    #[serde(default)]
    queues: Vec<QueueSeed>,
}

#[derive(Debug, Deserialize)]
struct QueueSeed {
    name: String,
    capacity: ResourceList,
    #[serde(default)]
    admission_checks: Vec<String>,
}

/// Read queue definitions from a TOML file:
///
/// ```toml
/// [[queues]]
/// name = "research"
/// admission_checks = ["provisioning"]
/// capacity = { cpu = 64, memory_gb = 256 }
/// ```
pub fn load_queue_file(path: &Path) -> Result<Vec<QueueRecord>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::QueueFileRead {
        path: path.to_path_buf(),
        source,
    })?;
    let file: QueueFile = toml::from_str(&raw).map_err(|source| ConfigError::QueueFileParse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut seen = std::collections::HashSet::new();
    file.queues
        .into_iter()
        .map(|seed| {
            let invalid = |reason: String| ConfigError::InvalidQueue {
                path: path.to_path_buf(),
                reason,
            };
            if seed.name.trim().is_empty() {
                return Err(invalid("queue name must not be empty".to_string()));
            }
            if !seen.insert(seed.name.clone()) {
                return Err(invalid(format!("queue '{}' defined twice", seed.name)));
            }
            if let Some((resource, _)) = seed.capacity.iter().find(|(_, q)| **q < 0) {
                return Err(invalid(format!(
                    "queue '{}' has negative capacity for '{resource}'",
                    seed.name
                )));
            }
            Ok(QueueRecord::new(seed.name, seed.capacity)
                .with_admission_checks(seed.admission_checks))
        })
        .collect()
}

/// Create each queue that does not exist yet. Existing records (and their
/// reservations) are left alone. Returns the number of queues created.
pub async fn seed_queues(store: &SharedStore, queues: Vec<QueueRecord>) -> StoreResult<usize> {
    let mut created = 0;
    for queue in queues {
        let name = queue.name.clone();
        match store
            .commit(Transaction::new().put_queue(queue, Expect::Absent))
            .await
        {
            Ok(_) => {
                info!(queue = %name, "Queue created");
                created += 1;
            }
            Err(StoreError::Conflict { .. }) => {
                warn!(queue = %name, "Queue already exists, keeping stored definition");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::Arc;

    use super::*;
    use crate::model::resources;
    use crate::store::{InMemoryStore, ObjectStore};

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.resync_interval, Duration::from_secs(30));
        assert_eq!(config.max_conflict_retries, 16);
        assert!(!config.dev_mode);
        assert!(config.queues_file.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("ADMITQ_STORE", "postgres"),
            ("ADMITQ_DEV", "true"),
            ("ADMITQ_RESYNC_INTERVAL_SECS", "5"),
            ("ADMITQ_MAX_CONFLICT_RETRIES", "3"),
            ("ADMITQ_QUEUES_FILE", "/etc/admitq/queues.toml"),
        ]))
        .unwrap();
        assert_eq!(config.store, StoreBackend::Postgres);
        assert!(config.dev_mode);
        assert_eq!(config.resync_interval, Duration::from_secs(5));
        assert_eq!(config.conflict_retry().max_attempts, 3);
        assert_eq!(
            config.queues_file.as_deref(),
            Some(Path::new("/etc/admitq/queues.toml"))
        );
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let err = Config::from_lookup(lookup(&[("ADMITQ_STORE", "etcd")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var: "ADMITQ_STORE", .. }));

        let err = Config::from_lookup(lookup(&[("ADMITQ_LISTEN_ADDR", "nope")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                var: "ADMITQ_LISTEN_ADDR",
                ..
            }
        ));

        assert!(Config::from_lookup(lookup(&[("ADMITQ_RESYNC_INTERVAL_SECS", "0")])).is_err());
    }

    #[test]
    fn test_load_queue_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[[queues]]
name = "research"
admission_checks = ["provisioning"]
capacity = {{ cpu = 64, memory_gb = 256 }}

[[queues]]
name = "batch"
capacity = {{ cpu = 8 }}
"#
        )
        .unwrap();

        let queues = load_queue_file(file.path()).unwrap();
        assert_eq!(queues.len(), 2);
        assert_eq!(queues[0].name, "research");
        assert_eq!(queues[0].capacity, resources([("cpu", 64), ("memory_gb", 256)]));
        assert_eq!(queues[0].admission_checks, vec!["provisioning".to_string()]);
        assert!(queues[1].admission_checks.is_empty());
    }

    #[test]
    fn test_queue_file_rejects_duplicates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[[queues]]\nname = \"a\"\ncapacity = {{}}\n[[queues]]\nname = \"a\"\ncapacity = {{}}"
        )
        .unwrap();
        assert!(matches!(
            load_queue_file(file.path()),
            Err(ConfigError::InvalidQueue { .. })
        ));
    }

    #[tokio::test]
    async fn test_seed_keeps_existing_queues() {
        let store: SharedStore = Arc::new(InMemoryStore::new());
        let existing = QueueRecord::new("dev", resources([("cpu", 2)]));
        store
            .commit(Transaction::new().put_queue(existing.clone(), Expect::Absent))
            .await
            .unwrap();

        let created = seed_queues(
            &store,
            vec![
                QueueRecord::new("dev", resources([("cpu", 100)])),
                QueueRecord::new("prod", resources([("cpu", 4)])),
            ],
        )
        .await
        .unwrap();

        assert_eq!(created, 1);
        assert_eq!(store.get_queue("dev").await.unwrap().unwrap().value, existing);
        assert!(store.get_queue("prod").await.unwrap().is_some());
    }
}
