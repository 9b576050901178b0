//! Admission controller
//!
//! Serves the workload and verdict API and drives quota reservation,
//! eviction and requeue in the background.

use std::sync::Arc;

use admitq_controller::{
    api,
    cleanup::{CleanupWorker, CleanupWorkerConfig},
    clock::{SharedClock, SystemClock},
    config::{self, StoreBackend},
    db,
    requeue::RequeueTimer,
    scheduler::{SchedulerReconciler, SchedulerWorker},
    service::WorkloadService,
    state::AppState,
    store::{InMemoryStore, SharedStore},
};
use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to ADMITQ_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting admission controller");
    info!(
        listen_addr = %config.listen_addr,
        store = ?config.store,
        resync_interval_secs = config.resync_interval.as_secs(),
        max_conflict_retries = config.max_conflict_retries,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    let store: SharedStore = match config.store {
        StoreBackend::Memory => {
            warn!("Using in-memory store; state is lost on restart");
            Arc::new(InMemoryStore::new())
        }
        StoreBackend::Postgres => {
            let pg_store = match db::connect(&config.database).await {
                Ok(store) => store,
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };

            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                if let Err(e) = db::run_migrations(&pg_store).await {
                    error!(error = %e, "Failed to run migrations");
                    return Err(e.into());
                }
            }

            let change_feed = pg_store.change_feed(config.change_feed_interval).await?;
            workers.push((
                "change feed",
                tokio::spawn(change_feed.run(shutdown_rx.clone())),
            ));

            let cleanup_worker =
                CleanupWorker::new(pg_store.pool().clone(), CleanupWorkerConfig::default());
            workers.push((
                "cleanup worker",
                tokio::spawn({
                    let shutdown_rx = shutdown_rx.clone();
                    async move { cleanup_worker.run(shutdown_rx).await }
                }),
            ));

            Arc::new(pg_store)
        }
    };

    if let Some(path) = &config.queues_file {
        let queues = config::load_queue_file(path)?;
        let created = config::seed_queues(&store, queues).await?;
        info!(path = %path.display(), created, "Queue file applied");
    }

    let clock: SharedClock = Arc::new(SystemClock);
    let retry = config.conflict_retry();

    let requeue = RequeueTimer::new(store.clone(), clock.clone(), retry);
    workers.push((
        "requeue timer",
        tokio::spawn({
            let requeue = requeue.clone();
            let shutdown_rx = shutdown_rx.clone();
            async move { requeue.run(shutdown_rx).await }
        }),
    ));

    let reconciler = SchedulerReconciler::new(store.clone(), clock.clone(), requeue, retry);
    let scheduler_worker = SchedulerWorker::new(reconciler, store.clone(), config.resync_interval);
    workers.push((
        "scheduler worker",
        tokio::spawn({
            let shutdown_rx = shutdown_rx.clone();
            async move { scheduler_worker.run(shutdown_rx).await }
        }),
    ));

    let workloads = WorkloadService::new(store.clone(), clock, retry);
    let app = api::create_router(AppState::new(store, workloads));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    for (name, handle) in workers {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(worker = name, error = %e, "Worker did not shut down in time");
        }
    }

    info!("Admission controller shutdown complete");
    Ok(())
}
