//! The Forwarder-side poll loop: claim a batch, hand each job to a
//! [`JobExecutor`], and apply the resulting state transition. A plain
//! interval loop, since this queue has a single task type.

use gateway_catalog::ClaimedJob;
use gateway_models::ErrorKind;
use std::sync::Arc;

use crate::backoff::BackoffPolicy;

/// What an executed job produced, already classified into the error
/// taxonomy if it failed.
pub enum ExecutionOutcome {
    Completed,
    Failed { kind: ErrorKind, detail: String },
}

/// Performs the actual transfer for one claimed job. Implemented by
/// `gateway-forwarder`; this crate only knows how to schedule and record
/// the outcome.
#[async_trait::async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    async fn execute(&self, job: &ClaimedJob) -> ExecutionOutcome;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub poll_interval: std::time::Duration,
    pub lease_duration: std::time::Duration,
    pub claim_batch_size: i64,
    pub backoff: BackoffPolicy,
}

/// Runs the claim/execute/transition loop until `shutdown` resolves.
pub async fn run(
    pool: sqlx::PgPool,
    executor: Arc<dyn JobExecutor>,
    config: WorkerConfig,
    shutdown: impl std::future::Future<Output = ()>,
) {
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = &mut shutdown => break,
        }

        let claimed = match gateway_catalog::jobs::claim_batch(
            &pool,
            &config.worker_id,
            config.claim_batch_size,
            chrono::Duration::from_std(config.lease_duration).unwrap_or(chrono::Duration::seconds(30)),
        )
        .await
        {
            Ok(jobs) => jobs,
            Err(err) => {
                tracing::error!(?err, "failed to claim forward jobs (will retry next tick)");
                continue;
            }
        };

        for job in claimed {
            let pool = pool.clone();
            let executor = executor.clone();
            let config = config.clone();
            tokio::spawn(async move {
                run_one(&pool, executor.as_ref(), &config, job).await;
            });
        }
    }
}

#[tracing::instrument(skip_all, fields(job_id = %job.job.id, destination = %job.destination.id))]
async fn run_one(pool: &sqlx::PgPool, executor: &dyn JobExecutor, config: &WorkerConfig, job: ClaimedJob) {
    let job_id = job.job.id;
    let attempts = job.job.attempts;

    let outcome = executor.execute(&job).await;

    let result = match outcome {
        ExecutionOutcome::Completed => gateway_catalog::jobs::mark_completed(pool, job_id).await,
        ExecutionOutcome::Failed { kind, detail } => {
            if kind.is_retryable() && !config.backoff.should_dead_letter(attempts) {
                let delay = config.backoff.delay(attempts, &mut rand::thread_rng());
                let next_eligible_at = chrono::Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                tracing::warn!(%kind, attempts, ?delay, "forward job failed, scheduling retry");
                gateway_catalog::jobs::mark_retry_scheduled(pool, job_id, next_eligible_at, kind.as_str(), &detail).await
            } else {
                tracing::warn!(%kind, attempts, "forward job failed permanently, dead-lettering");
                gateway_catalog::jobs::mark_dead_letter(pool, job_id, kind.as_str(), &detail).await
            }
        }
    };

    if let Err(err) = result {
        tracing::error!(?err, "failed to persist forward job outcome");
    }
}
