//! Append-only audit trail of association-level ingest outcomes.

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IngestEventRow {
    pub id: uuid::Uuid,
    pub association_id: String,
    pub peer_ae: String,
    pub instance_uid: Option<String>,
    pub result: String,
    pub byte_count: i64,
    pub detail: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

pub struct NewIngestEvent<'a> {
    pub association_id: &'a str,
    pub peer_ae: &'a str,
    pub instance_uid: Option<&'a str>,
    pub result: &'a str,
    pub byte_count: i64,
    pub detail: Option<&'a str>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

pub async fn record(pool: &sqlx::PgPool, event: NewIngestEvent<'_>) -> crate::Result<uuid::Uuid> {
    let id = sqlx::query_scalar!(
        r#"
        INSERT INTO ingest_events
            (association_id, peer_ae, instance_uid, result, byte_count, detail, started_at, finished_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id
        "#,
        event.association_id,
        event.peer_ae,
        event.instance_uid,
        event.result,
        event.byte_count,
        event.detail,
        event.started_at,
        event.finished_at,
    )
    .fetch_one(pool)
    .await?;
    Ok(id)
}
