//! Instance records: created exactly once on first successful receipt,
//! never mutated thereafter.

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceRow {
    pub instance_uid: String,
    pub series_uid: String,
    pub study_uid: String,
    pub sop_class_uid: String,
    pub transfer_syntax_uid: String,
    pub byte_length: i64,
    pub content_hash: String,
    pub storage_path: String,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

pub async fn get(pool: &sqlx::PgPool, instance_uid: &str) -> crate::Result<Option<InstanceRow>> {
    let row = sqlx::query_as!(
        InstanceRow,
        r#"
        SELECT instance_uid, series_uid, study_uid, sop_class_uid, transfer_syntax_uid,
               byte_length, content_hash, storage_path, received_at
        FROM instances
        WHERE instance_uid = $1
        "#,
        instance_uid,
    )
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Read the existing row for `instance_uid`, if any, within an in-flight
/// transaction. Used by [`crate::admit::admit`] to decide idempotence.
pub async fn get_for_update(
    txn: &mut sqlx::PgConnection,
    instance_uid: &str,
) -> crate::Result<Option<InstanceRow>> {
    let row = sqlx::query_as!(
        InstanceRow,
        r#"
        SELECT instance_uid, series_uid, study_uid, sop_class_uid, transfer_syntax_uid,
               byte_length, content_hash, storage_path, received_at
        FROM instances
        WHERE instance_uid = $1
        FOR UPDATE
        "#,
        instance_uid,
    )
    .fetch_optional(&mut *txn)
    .await?;
    Ok(row)
}
