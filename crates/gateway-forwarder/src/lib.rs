//! Forwarder (SCU): drains the Job Queue by sending each
//! claimed instance's stored bytes, byte for byte, to its destination.
//! Implements [`gateway_queue::JobExecutor`]; the claim/retry/dead-letter
//! machinery lives in `gateway-queue`.

mod connection;
mod pool;
mod tls;
mod transfer;

use std::sync::Arc;
use std::time::Duration;

use gateway_catalog::ClaimedJob;
use gateway_queue::{ExecutionOutcome, JobExecutor};
use gateway_store::ObjectStore;

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub calling_ae_title: String,
    pub max_pdu_length: u32,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    /// How long an idle, reusable association is kept open for a later job
    /// to the same destination and (SOP Class, transfer syntax) pair.
    pub association_idle_timeout: Duration,
    /// Identifies this worker as the lease holder; must match the
    /// `worker_id` the claiming `gateway-queue` loop was configured with.
    pub worker_id: String,
    /// Lease duration to renew to on each heartbeat; must match the
    /// claiming loop's lease duration.
    pub lease_duration: chrono::Duration,
    /// How often a long-running C-STORE heartbeats its lease while
    /// streaming the data set.
    pub heartbeat_interval: Duration,
}

/// Forwards claimed jobs to their destinations, reusing an open association
/// across consecutive jobs that target the same destination with the same
/// (SOP Class, transfer syntax) pair.
pub struct Forwarder {
    config: ForwarderConfig,
    store: Arc<ObjectStore>,
    pool: pool::AssociationPool,
    db: sqlx::PgPool,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig, store: Arc<ObjectStore>, db: sqlx::PgPool) -> Self {
        let idle_timeout = config.association_idle_timeout;
        Forwarder { config, store, pool: pool::AssociationPool::new(idle_timeout), db }
    }
}

#[async_trait::async_trait]
impl JobExecutor for Forwarder {
    async fn execute(&self, job: &ClaimedJob) -> ExecutionOutcome {
        match transfer::forward(&self.config, &self.store, &self.pool, &self.db, job).await {
            Ok(()) => ExecutionOutcome::Completed,
            Err(err) => {
                let kind = err.kind();
                ExecutionOutcome::Failed { kind, detail: err.to_string() }
            }
        }
    }
}
