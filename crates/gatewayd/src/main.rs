//! `gatewayd`: the imaging gateway process. Wires the Receiver, Forwarder,
//! and Supervisor loops to a shared Postgres pool and object store, exposes
//! a loopback health/metrics endpoint, and drains in place on SIGINT. A
//! `clap::Parser` args struct with `env` fallbacks, a `tracing-subscriber`
//! `fmt` layer honoring `RUST_LOG`/`NO_COLOR`, a multi-thread runtime, and a
//! periodic database pool-stats log line.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use derivative::Derivative;
use futures::FutureExt;

const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
const SECONDARY_CAPTURE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.7";

/// `gatewayd` runs the DICOM imaging gateway: a C-STORE receiver, a
/// background forwarder, and the supervisor loop that keeps their shared
/// state consistent across restarts.
#[derive(Derivative, Parser)]
#[derivative(Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// URL of the Postgres catalog database.
    #[derivative(Debug = "ignore")]
    #[clap(long = "database", env = "DATABASE_URL")]
    database_url: String,
    /// Path to a CA certificate for the database connection.
    #[clap(long = "database-ca", env = "DATABASE_CA")]
    database_ca: Option<String>,

    /// Address the Receiver's DICOM SCP listens on.
    #[clap(long = "receiver-bind", env = "RECEIVER_BIND", default_value = "0.0.0.0:11112")]
    receiver_bind: SocketAddr,
    /// AE title the Receiver answers to.
    #[clap(long = "ae-title", env = "AE_TITLE", default_value = "GATEWAYSCP")]
    ae_title: String,
    /// SOP classes the Receiver accepts, comma-separated.
    #[clap(long = "sop-class", env = "SOP_CLASSES", value_delimiter = ',', default_values_t = vec![
        VERIFICATION_SOP_CLASS.to_string(),
        CT_IMAGE_STORAGE.to_string(),
        SECONDARY_CAPTURE_STORAGE.to_string(),
    ])]
    sop_classes: Vec<String>,
    /// Maximum PDU length the Receiver and Forwarder negotiate.
    #[clap(long = "max-pdu-length", env = "MAX_PDU_LENGTH", default_value_t = 16 * 1024)]
    max_pdu_length: u32,
    /// Maximum concurrent inbound associations the Receiver accepts.
    #[clap(long = "max-associations", env = "MAX_ASSOCIATIONS", default_value_t = 64)]
    max_associations: usize,

    /// Number of concurrent Forwarder worker loops in this process.
    #[clap(long = "forward-workers", env = "FORWARD_WORKERS", default_value_t = 4)]
    forward_workers: usize,
    /// How often each Forwarder worker polls for claimable jobs.
    #[clap(long = "poll-interval-ms", env = "POLL_INTERVAL_MS", default_value_t = 500)]
    poll_interval_ms: u64,
    /// How many jobs a single poll claims at once.
    #[clap(long = "claim-batch-size", env = "CLAIM_BATCH_SIZE", default_value_t = 8)]
    claim_batch_size: i64,
    /// Lease duration granted to a claimed job.
    #[clap(long = "lease-duration-secs", env = "LEASE_DURATION_SECS", default_value_t = 30)]
    lease_duration_secs: u64,
    /// Fraction of the lease duration between heartbeats during a transfer.
    #[clap(long = "heartbeat-fraction", env = "HEARTBEAT_FRACTION", default_value_t = 0.5)]
    heartbeat_fraction: f64,
    /// Base delay of the retry backoff curve.
    #[clap(long = "backoff-base-secs", env = "BACKOFF_BASE_SECS", default_value_t = 2)]
    backoff_base_secs: u64,
    /// Cap on the retry backoff curve.
    #[clap(long = "backoff-cap-secs", env = "BACKOFF_CAP_SECS", default_value_t = 300)]
    backoff_cap_secs: u64,
    /// Jitter band applied to each computed backoff delay.
    #[clap(long = "backoff-jitter", env = "BACKOFF_JITTER", default_value_t = 0.2)]
    backoff_jitter: f64,
    /// Attempts after which a job is dead-lettered instead of retried.
    #[clap(long = "max-attempts", env = "MAX_ATTEMPTS", default_value_t = 8)]
    max_attempts: i32,
    /// How long an idle, reusable association is kept open.
    #[clap(long = "association-idle-secs", env = "ASSOCIATION_IDLE_SECS", default_value_t = 60)]
    association_idle_secs: u64,

    /// Root directory of the object store's published and scratch trees.
    #[clap(long = "data-root", env = "DATA_ROOT")]
    data_root: String,
    /// Scratch files older than this are swept by the Supervisor.
    #[clap(long = "scratch-horizon-secs", env = "SCRATCH_HORIZON_SECS", default_value_t = 86_400)]
    scratch_horizon_secs: u64,
    /// How often the Supervisor runs its lease-recovery and scratch sweeps.
    #[clap(long = "sweep-interval-secs", env = "SWEEP_INTERVAL_SECS", default_value_t = 30)]
    sweep_interval_secs: u64,
    /// How long in-flight jobs are given to finish on shutdown before their
    /// leases are released for another worker to claim.
    #[clap(long = "drain-deadline-secs", env = "DRAIN_DEADLINE_SECS", default_value_t = 30)]
    drain_deadline_secs: u64,

    /// Loopback address for the liveness/readiness/metrics endpoint.
    #[clap(long = "health-bind", env = "HEALTH_BIND", default_value = "127.0.0.1:9090")]
    health_bind: SocketAddr,
}

fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(!matches!(std::env::var("NO_COLOR"), Ok(v) if v == "1"))
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let args = Args::parse();
    tracing::info!(?args, "gatewayd starting");

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let result = runtime.block_on(async_main(args));
    tracing::info!(?result, "gatewayd exiting");
    result
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let worker_id = format!(
        "{}-{}",
        std::env::var("HOSTNAME").unwrap_or_else(|_| "gatewayd".to_string()),
        uuid::Uuid::new_v4().simple(),
    );

    let mut pg_options: sqlx::postgres::PgConnectOptions =
        args.database_url.parse().context("parsing database URL")?;
    if let Some(ca) = &args.database_ca {
        pg_options = pg_options.ssl_mode(sqlx::postgres::PgSslMode::VerifyFull).ssl_root_cert(ca);
    } else {
        pg_options = pg_options.ssl_mode(sqlx::postgres::PgSslMode::Prefer);
    }
    let pool = sqlx::postgres::PgPoolOptions::new()
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(pg_options)
        .await
        .context("connecting to database")?;

    let pool_stats = pool.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(120));
        loop {
            interval.tick().await;
            tracing::info!(
                total_connections = pool_stats.size(),
                idle_connections = pool_stats.num_idle(),
                "db connection pool stats"
            );
        }
    });

    let store = Arc::new(gateway_store::ObjectStore::new(&args.data_root));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let ctrl_c = tokio::signal::ctrl_c().map(|_| ());

    let receiver_config = gateway_receiver::ReceiverConfig {
        ae_title: args.ae_title.clone(),
        bind_addr: args.receiver_bind,
        supported_sop_classes: args.sop_classes.clone(),
        max_pdu_length: args.max_pdu_length,
        max_associations: args.max_associations,
    };
    let receiver_task = tokio::spawn(gateway_receiver::run(
        receiver_config,
        pool.clone(),
        store.clone(),
        shutdown_rx.clone(),
    ));

    let lease_duration = Duration::from_secs(args.lease_duration_secs);
    let forwarder = Arc::new(gateway_forwarder::Forwarder::new(
        gateway_forwarder::ForwarderConfig {
            calling_ae_title: args.ae_title.clone(),
            max_pdu_length: args.max_pdu_length,
            connect_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(30),
            association_idle_timeout: Duration::from_secs(args.association_idle_secs),
            worker_id: worker_id.clone(),
            lease_duration: chrono::Duration::from_std(lease_duration).unwrap_or(chrono::Duration::seconds(30)),
            heartbeat_interval: lease_duration.mul_f64(args.heartbeat_fraction.clamp(0.1, 0.9)),
        },
        store.clone(),
        pool.clone(),
    ));

    let worker_config = gateway_queue::WorkerConfig {
        worker_id: worker_id.clone(),
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        lease_duration,
        claim_batch_size: args.claim_batch_size,
        backoff: gateway_queue::BackoffPolicy {
            base: Duration::from_secs(args.backoff_base_secs),
            cap: Duration::from_secs(args.backoff_cap_secs),
            jitter: args.backoff_jitter,
            max_attempts: args.max_attempts,
        },
    };
    let mut worker_tasks = Vec::with_capacity(args.forward_workers);
    for _ in 0..args.forward_workers {
        let pool = pool.clone();
        let forwarder = forwarder.clone() as Arc<dyn gateway_queue::JobExecutor>;
        let worker_config = worker_config.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        worker_tasks.push(tokio::spawn(async move {
            gateway_queue::run(pool, forwarder, worker_config, async move {
                let _ = shutdown_rx.wait_for(|v| *v).await;
            })
            .await;
        }));
    }

    let supervisor_task = tokio::spawn(gateway_supervisor::run(
        pool.clone(),
        store.clone(),
        gateway_supervisor::SupervisorConfig {
            worker_id: worker_id.clone(),
            sweep_interval: Duration::from_secs(args.sweep_interval_secs),
            scratch_horizon: Duration::from_secs(args.scratch_horizon_secs),
        },
        shutdown_rx.clone(),
    ));

    let health_listener = tokio::net::TcpListener::bind(args.health_bind)
        .await
        .context("failed to bind health endpoint")?;
    tracing::info!(addr = %args.health_bind, "health endpoint listening");
    let health_router = health::router(pool.clone());
    let mut health_shutdown_rx = shutdown_rx.clone();
    let health_server = axum::serve(health_listener, health_router).with_graceful_shutdown(async move {
        let _ = health_shutdown_rx.wait_for(|v| *v).await;
    });

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("shutdown signal received, draining");
        }
        result = receiver_task => {
            tracing::error!(?result, "receiver task exited unexpectedly");
        }
    }
    let _ = shutdown_tx.send(true);

    let drain_deadline = Duration::from_secs(args.drain_deadline_secs);
    let drain = async {
        let _ = health_server.await;
        for task in worker_tasks {
            let _ = task.await;
        }
        let _ = supervisor_task.await;
    };
    if tokio::time::timeout(drain_deadline, drain).await.is_err() {
        tracing::warn!("drain deadline exceeded, in-flight jobs' leases will be recovered by the next supervisor sweep");
    }

    Ok(())
}

mod health {
    use axum::extract::State;
    use axum::routing::get;
    use axum::{Json, Router};

    pub fn router(pool: sqlx::PgPool) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .route("/readyz", get(readyz))
            .route("/metrics", get(metrics))
            .with_state(pool)
    }

    async fn healthz() -> &'static str {
        "ok"
    }

    async fn readyz(State(pool): State<sqlx::PgPool>) -> (axum::http::StatusCode, &'static str) {
        match sqlx::query("SELECT 1").execute(&pool).await {
            Ok(_) => (axum::http::StatusCode::OK, "ready"),
            Err(_) => (axum::http::StatusCode::SERVICE_UNAVAILABLE, "database unreachable"),
        }
    }

    #[derive(serde::Serialize)]
    struct Metrics {
        jobs_by_status: std::collections::HashMap<String, i64>,
    }

    async fn metrics(State(pool): State<sqlx::PgPool>) -> Json<Metrics> {
        let counts = gateway_catalog::jobs::counts_by_status(&pool).await.unwrap_or_default();
        let jobs_by_status = counts
            .into_iter()
            .map(|(status, count)| (serde_json::to_value(status).unwrap().as_str().unwrap().to_string(), count))
            .collect();
        Json(Metrics { jobs_by_status })
    }
}
