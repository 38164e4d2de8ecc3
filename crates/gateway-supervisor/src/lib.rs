//! Supervisor loop: per-process housekeeping that is not
//! tied to servicing any single association or job. Recovers orphaned
//! leases left behind by a worker that died mid-transfer, sweeps scratch
//! files older than a horizon, and on shutdown releases every lease this
//! process still holds so another worker can pick the work back up
//! immediately rather than waiting out the lease: a `select!` between a
//! periodic tick and a shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use gateway_store::ObjectStore;
use tokio::sync::watch;

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Identifies this process as a lease holder; matches the `worker_id`
    /// the `gateway-queue` loop(s) in this process claim jobs under.
    pub worker_id: String,
    /// How often to run the lease-recovery and scratch sweeps.
    pub sweep_interval: Duration,
    /// Scratch files older than this are considered orphaned and removed.
    pub scratch_horizon: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("catalog error: {0}")]
    Catalog(#[from] gateway_catalog::CatalogError),
}

/// One sweep pass: recover expired leases, then remove stale scratch files.
/// Exposed separately from [`run`] so callers (tests, an operator CLI) can
/// trigger a pass without waiting on the interval.
pub async fn sweep_once(
    pool: &sqlx::PgPool,
    store: &ObjectStore,
    config: &SupervisorConfig,
) -> Result<(), SupervisorError> {
    let recovered = gateway_catalog::jobs::recover_expired_leases(pool).await?;
    if recovered > 0 {
        tracing::info!(recovered, "supervisor recovered orphaned job leases");
    }

    match store.sweep_scratch(config.scratch_horizon).await {
        Ok(swept) if swept > 0 => tracing::info!(swept, "supervisor swept orphan scratch files"),
        Ok(_) => {}
        Err(err) => tracing::warn!(%err, "supervisor scratch sweep failed"),
    }

    Ok(())
}

/// Runs the periodic sweep until `shutdown` publishes `true`, then releases
/// every lease this process's workers still hold (graceful drain) before
/// returning.
pub async fn run(
    pool: sqlx::PgPool,
    store: Arc<ObjectStore>,
    config: SupervisorConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SupervisorError> {
    tracing::info!(worker_id = %config.worker_id, interval = ?config.sweep_interval, "supervisor loop starting");
    let mut ticker = tokio::time::interval(config.sweep_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = sweep_once(&pool, &store, &config).await {
                    tracing::warn!(%err, "supervisor sweep failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!(worker_id = %config.worker_id, "supervisor draining: releasing held leases");
    let released = gateway_catalog::jobs::release_held_by(&pool, &config.worker_id).await?;
    if released > 0 {
        tracing::info!(released, "supervisor released in-progress leases on shutdown");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn sweep_once_clears_orphan_scratch_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let mut scratch = store.open_scratch("orphan-worker").await.unwrap();
        scratch.write_chunk(b"abandoned").await.unwrap();
        let handle = scratch.finish().await.unwrap();
        assert!(handle.path.exists());

        // Age the file by rewinding its mtime rather than sleeping past the horizon.
        let stale = std::time::SystemTime::now() - Duration::from_secs(3600);
        let file = std::fs::File::options().write(true).open(&handle.path).unwrap();
        file.set_modified(stale).unwrap();

        let swept = store.sweep_scratch(Duration::from_secs(60)).await.unwrap();
        assert_eq!(swept, 1);
        assert!(!handle.path.exists());
    }
}
