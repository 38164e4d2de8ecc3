//! Study aggregates: materialized on first instance, counters advance only.

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StudyRow {
    pub study_uid: String,
    pub patient_id: Option<String>,
    pub accession_number: Option<String>,
    pub first_received_at: chrono::DateTime<chrono::Utc>,
    pub last_received_at: chrono::DateTime<chrono::Utc>,
    pub instance_count: i64,
    pub byte_count: i64,
}

pub async fn get(pool: &sqlx::PgPool, study_uid: &str) -> crate::Result<Option<StudyRow>> {
    let row = sqlx::query_as!(
        StudyRow,
        r#"
        SELECT study_uid, patient_id, accession_number, first_received_at,
               last_received_at, instance_count, byte_count
        FROM studies
        WHERE study_uid = $1
        "#,
        study_uid,
    )
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Derived aggregate status of a study. There is no
/// stored "study failed" row; this is computed on read from the terminal
/// state of every forward job belonging to the study's instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StudyAggregateStatus {
    /// At least one forward job has not yet reached a terminal state.
    InProgress,
    /// Every forward job completed successfully.
    Completed,
    /// Every forward job is terminal, but at least one succeeded and at
    /// least one did not (dead-letter or canceled).
    CompletedWithFailures,
    /// Every forward job is terminal and none completed successfully.
    Failed,
    /// The study has no forward jobs at all (no enabled destination
    /// matched any of its instances).
    NoDestinations,
}

pub async fn study_status(
    pool: &sqlx::PgPool,
    study_uid: &str,
) -> crate::Result<Option<StudyAggregateStatus>> {
    let study_exists = sqlx::query_scalar!(
        r#"SELECT EXISTS(SELECT 1 FROM studies WHERE study_uid = $1) as "exists!""#,
        study_uid,
    )
    .fetch_one(pool)
    .await?;
    if !study_exists {
        return Ok(None);
    }

    let counts = sqlx::query!(
        r#"
        SELECT
            count(*) FILTER (WHERE fj.status NOT IN ('completed', 'dead_letter', 'canceled')) as "non_terminal!",
            count(*) FILTER (WHERE fj.status = 'completed') as "completed!",
            count(*) as "total!"
        FROM forward_jobs fj
        JOIN instances i ON i.instance_uid = fj.instance_uid
        WHERE i.study_uid = $1
        "#,
        study_uid,
    )
    .fetch_one(pool)
    .await?;

    let status = if counts.total == 0 {
        StudyAggregateStatus::NoDestinations
    } else if counts.non_terminal > 0 {
        StudyAggregateStatus::InProgress
    } else if counts.completed == counts.total {
        StudyAggregateStatus::Completed
    } else if counts.completed == 0 {
        StudyAggregateStatus::Failed
    } else {
        StudyAggregateStatus::CompletedWithFailures
    };
    Ok(Some(status))
}
