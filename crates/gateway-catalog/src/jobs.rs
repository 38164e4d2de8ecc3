//! ForwardJob state machine storage. This module only performs the SQL
//! described by the state machine; backoff computation and
//! the poll/claim loop live in `gateway-queue`, which is layered on top of
//! these functions.

use crate::{DestinationRow, InstanceRow};
use gateway_models::JobStatus;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ForwardJobRow {
    pub id: uuid::Uuid,
    pub instance_uid: String,
    pub destination_id: uuid::Uuid,
    pub status: JobStatus,
    pub attempts: i32,
    pub priority: i32,
    pub next_eligible_at: chrono::DateTime<chrono::Utc>,
    pub lease_holder: Option<String>,
    pub lease_expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error_kind: Option<String>,
    pub last_error_detail: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// A claimed job with enough context to perform the forward without a
/// further round trip: the instance to send and the destination to send it
/// to.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: ForwardJobRow,
    pub instance: InstanceRow,
    pub destination: DestinationRow,
}

/// Claims up to `limit` eligible jobs for `worker_id`. Per-destination
/// concurrency is capped at `concurrency_limit` in-progress jobs: each
/// destination's remaining headroom is computed once up front, then ranked
/// candidates for that destination are admitted only up to that headroom, so
/// a single batch can never push a destination over its limit even when the
/// batch size exceeds the limit itself.
pub async fn claim_batch(
    pool: &sqlx::PgPool,
    worker_id: &str,
    limit: i64,
    lease_duration: chrono::Duration,
) -> crate::Result<Vec<ClaimedJob>> {
    let rows = sqlx::query_as!(
        ForwardJobRow,
        r#"
        WITH capacity AS (
            SELECT
                d.id AS destination_id,
                d.concurrency_limit - count(ij.id) FILTER (WHERE ij.status = 'in_progress') AS available
            FROM destinations d
            LEFT JOIN forward_jobs ij ON ij.destination_id = d.id
            WHERE d.enabled
            GROUP BY d.id, d.concurrency_limit
        ),
        ranked AS (
            SELECT
                fj.id, fj.priority, fj.next_eligible_at,
                row_number() OVER (
                    PARTITION BY fj.destination_id
                    ORDER BY fj.priority DESC, fj.next_eligible_at ASC, fj.id ASC
                ) AS rn,
                c.available
            FROM forward_jobs fj
            JOIN capacity c ON c.destination_id = fj.destination_id
            WHERE fj.status IN ('pending', 'retry_scheduled')
              AND fj.next_eligible_at <= now()
        ),
        eligible AS (
            SELECT id, priority, next_eligible_at FROM ranked WHERE rn <= available
        ),
        candidates AS (
            SELECT fj.id
            FROM forward_jobs fj
            JOIN eligible e ON e.id = fj.id
            ORDER BY e.priority DESC, e.next_eligible_at ASC, fj.id ASC
            LIMIT $1
            FOR UPDATE OF fj SKIP LOCKED
        )
        UPDATE forward_jobs SET
            status = 'in_progress',
            lease_holder = $2,
            lease_expires_at = now() + $3,
            attempts = attempts + 1
        WHERE id IN (SELECT id FROM candidates)
        RETURNING
            id, instance_uid, destination_id,
            status as "status: JobStatus",
            attempts, priority, next_eligible_at, lease_holder, lease_expires_at,
            last_error_kind, last_error_detail, created_at, finished_at
        "#,
        limit,
        worker_id,
        sqlx::postgres::types::PgInterval::try_from(lease_duration).map_err(crate::CatalogError::Interval)?,
    )
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let instance_uids: Vec<String> = rows.iter().map(|r| r.instance_uid.clone()).collect();
    let destination_ids: Vec<uuid::Uuid> = rows.iter().map(|r| r.destination_id).collect();

    let instances = sqlx::query_as!(
        InstanceRow,
        r#"
        SELECT instance_uid, series_uid, study_uid, sop_class_uid, transfer_syntax_uid,
               byte_length, content_hash, storage_path, received_at
        FROM instances WHERE instance_uid = ANY($1)
        "#,
        &instance_uids,
    )
    .fetch_all(pool)
    .await?;
    let destinations = crate::destinations::get_many(pool, &destination_ids).await?;

    let mut claimed = Vec::with_capacity(rows.len());
    for job in rows {
        let Some(instance) = instances.iter().find(|i| i.instance_uid == job.instance_uid).cloned() else {
            continue;
        };
        let Some(destination) = destinations.iter().find(|d| d.id == job.destination_id).cloned() else {
            continue;
        };
        claimed.push(ClaimedJob { job, instance, destination });
    }
    Ok(claimed)
}

/// Extends a job's lease if `worker_id` still holds it. Returns `false` if
/// the lease was lost to another worker or the job is no longer in
/// progress, signalling the caller to abort the transfer.
pub async fn heartbeat(
    pool: &sqlx::PgPool,
    job_id: uuid::Uuid,
    worker_id: &str,
    lease_duration: chrono::Duration,
) -> crate::Result<bool> {
    let result = sqlx::query!(
        r#"
        UPDATE forward_jobs
        SET lease_expires_at = now() + $3
        WHERE id = $1 AND lease_holder = $2 AND status = 'in_progress'
        "#,
        job_id,
        worker_id,
        sqlx::postgres::types::PgInterval::try_from(lease_duration).map_err(crate::CatalogError::Interval)?,
    )
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_completed(pool: &sqlx::PgPool, job_id: uuid::Uuid) -> crate::Result<()> {
    sqlx::query!(
        r#"
        UPDATE forward_jobs
        SET status = 'completed', finished_at = now(), lease_holder = NULL, lease_expires_at = NULL
        WHERE id = $1
        "#,
        job_id,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_retry_scheduled(
    pool: &sqlx::PgPool,
    job_id: uuid::Uuid,
    next_eligible_at: chrono::DateTime<chrono::Utc>,
    error_kind: &str,
    error_detail: &str,
) -> crate::Result<()> {
    sqlx::query!(
        r#"
        UPDATE forward_jobs
        SET status = 'retry_scheduled',
            next_eligible_at = $2,
            lease_holder = NULL,
            lease_expires_at = NULL,
            last_error_kind = $3,
            last_error_detail = $4
        WHERE id = $1
        "#,
        job_id,
        next_eligible_at,
        error_kind,
        truncate_detail(error_detail),
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_dead_letter(
    pool: &sqlx::PgPool,
    job_id: uuid::Uuid,
    error_kind: &str,
    error_detail: &str,
) -> crate::Result<()> {
    sqlx::query!(
        r#"
        UPDATE forward_jobs
        SET status = 'dead_letter',
            finished_at = now(),
            lease_holder = NULL,
            lease_expires_at = NULL,
            last_error_kind = $2,
            last_error_detail = $3
        WHERE id = $1
        "#,
        job_id,
        error_kind,
        truncate_detail(error_detail),
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Returns any in-progress job whose lease has expired to `pending`,
/// regardless of which worker last held it. Returns the number of rows
/// recovered.
pub async fn recover_expired_leases(pool: &sqlx::PgPool) -> crate::Result<u64> {
    let result = sqlx::query!(
        r#"
        UPDATE forward_jobs
        SET status = 'pending', lease_holder = NULL, lease_expires_at = NULL
        WHERE status = 'in_progress' AND lease_expires_at < now()
        "#,
    )
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Returns every in-progress job still leased to `worker_id` to pending:
/// used when a worker is shutting down and has jobs it could not finish
/// before the drain deadline. Returns the number of rows released.
pub async fn release_held_by(pool: &sqlx::PgPool, worker_id: &str) -> crate::Result<u64> {
    let result = sqlx::query!(
        r#"
        UPDATE forward_jobs
        SET status = 'pending', lease_holder = NULL, lease_expires_at = NULL
        WHERE status = 'in_progress' AND lease_holder = $1
        "#,
        worker_id,
    )
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Operator verb: dead-letter -> pending. Does not reset the attempt
/// counter. `job_ids` of `None` retries every dead-lettered job.
pub async fn retry(pool: &sqlx::PgPool, job_ids: Option<&[uuid::Uuid]>) -> crate::Result<u64> {
    let result = match job_ids {
        Some(ids) => {
            sqlx::query!(
                r#"
                UPDATE forward_jobs
                SET status = 'pending', next_eligible_at = now()
                WHERE status = 'dead_letter' AND id = ANY($1)
                "#,
                ids,
            )
            .execute(pool)
            .await?
        }
        None => {
            sqlx::query!(
                r#"
                UPDATE forward_jobs
                SET status = 'pending', next_eligible_at = now()
                WHERE status = 'dead_letter'
                "#,
            )
            .execute(pool)
            .await?
        }
    };
    Ok(result.rows_affected())
}

/// Operator verb: non-terminal -> canceled.
pub async fn cancel(pool: &sqlx::PgPool, job_ids: &[uuid::Uuid]) -> crate::Result<u64> {
    let result = sqlx::query!(
        r#"
        UPDATE forward_jobs
        SET status = 'canceled', finished_at = now(), lease_holder = NULL, lease_expires_at = NULL
        WHERE id = ANY($1)
          AND status NOT IN ('completed', 'dead_letter', 'canceled')
        "#,
        job_ids,
    )
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Operator verb: create fresh ForwardJobs for every (instance, destination)
/// pair of a study. These are new rows with fresh attempt counts, never
/// edits of historical jobs.
pub async fn replay(
    pool: &sqlx::PgPool,
    study_uid: &str,
    destination_ids: Option<&[uuid::Uuid]>,
) -> crate::Result<Vec<uuid::Uuid>> {
    let rows = match destination_ids {
        Some(ids) => {
            sqlx::query_scalar!(
                r#"
                INSERT INTO forward_jobs (instance_uid, destination_id)
                SELECT i.instance_uid, d.id
                FROM instances i
                CROSS JOIN destinations d
                WHERE i.study_uid = $1 AND d.id = ANY($2)
                RETURNING id
                "#,
                study_uid,
                ids,
            )
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_scalar!(
                r#"
                INSERT INTO forward_jobs (instance_uid, destination_id)
                SELECT i.instance_uid, d.id
                FROM instances i
                CROSS JOIN destinations d
                WHERE i.study_uid = $1 AND d.enabled
                RETURNING id
                "#,
                study_uid,
            )
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows)
}

/// Read model for the operator surface: jobs currently dead-lettered,
/// optionally filtered to one destination.
pub async fn list_dead_letter(
    pool: &sqlx::PgPool,
    destination_id: Option<uuid::Uuid>,
    limit: i64,
) -> crate::Result<Vec<ForwardJobRow>> {
    let rows = sqlx::query_as!(
        ForwardJobRow,
        r#"
        SELECT
            id, instance_uid, destination_id,
            status as "status: JobStatus",
            attempts, priority, next_eligible_at, lease_holder, lease_expires_at,
            last_error_kind, last_error_detail, created_at, finished_at
        FROM forward_jobs
        WHERE status = 'dead_letter'
          AND ($1::uuid IS NULL OR destination_id = $1)
        ORDER BY finished_at DESC
        LIMIT $2
        "#,
        destination_id,
        limit,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Read model for the operator surface: count of jobs still queued for a
/// destination.
pub async fn destination_backlog(pool: &sqlx::PgPool, destination_id: uuid::Uuid) -> crate::Result<i64> {
    let count = sqlx::query_scalar!(
        r#"
        SELECT count(*) as "count!"
        FROM forward_jobs
        WHERE destination_id = $1 AND status IN ('pending', 'retry_scheduled')
        "#,
        destination_id,
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Read model for the operator metrics endpoint: job counts grouped by
/// status.
pub async fn counts_by_status(pool: &sqlx::PgPool) -> crate::Result<Vec<(JobStatus, i64)>> {
    let rows = sqlx::query!(
        r#"
        SELECT status as "status: JobStatus", count(*) as "count!"
        FROM forward_jobs
        GROUP BY status
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| (r.status, r.count)).collect())
}

/// Truncates an error detail string so a verbose transport error can never
/// blow out the `last_error_detail` column.
fn truncate_detail(detail: &str) -> &str {
    const MAX: usize = 4096;
    if detail.len() <= MAX {
        detail
    } else {
        let mut end = MAX;
        while !detail.is_char_boundary(end) {
            end -= 1;
        }
        &detail[..end]
    }
}
