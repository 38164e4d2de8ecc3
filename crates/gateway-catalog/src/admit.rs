//! Admit: the single write path by which a newly published Instance enters
//! the Catalog and fans out into ForwardJobs. Runs as one transaction that
//! locks destinations, then the study, then the series, in that fixed
//! order, to avoid deadlocking against a concurrent Admit for a sibling
//! instance of the same study.

use gateway_models::forwarding_rule::InstanceMetadata;

use crate::instances::InstanceRow;

pub struct AdmitRequest<'a> {
    pub instance_uid: &'a str,
    pub series_uid: &'a str,
    pub study_uid: &'a str,
    pub sop_class_uid: &'a str,
    pub transfer_syntax_uid: &'a str,
    pub modality: Option<&'a str>,
    pub called_ae: &'a str,
    pub labels: &'a [String],
    pub patient_id: Option<&'a str>,
    pub accession_number: Option<&'a str>,
    pub byte_length: i64,
    pub content_hash: &'a str,
    pub storage_path: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// A new Instance row was created and matching ForwardJobs were
    /// scheduled.
    Admitted { forward_jobs_created: usize },
    /// An Instance with this UID already existed with a matching content
    /// hash; no new row or jobs were created.
    AlreadyAdmitted,
    /// An Instance with this UID already existed with a *different* content
    /// hash. The caller must reject the object; nothing was written.
    HashConflict,
}

pub async fn admit(pool: &sqlx::PgPool, req: AdmitRequest<'_>) -> crate::Result<AdmitOutcome> {
    let mut txn = pool.begin().await?;

    if let Some(existing) = crate::instances::get_for_update(&mut txn, req.instance_uid).await? {
        txn.commit().await?;
        return Ok(if existing.content_hash == req.content_hash {
            AdmitOutcome::AlreadyAdmitted
        } else {
            AdmitOutcome::HashConflict
        });
    }

    // Lock order: destinations, then study, then series. Every Admit takes
    // this same order, so two concurrent Admits for different instances of
    // the same study can never deadlock against each other.
    let destinations = crate::destinations::list_enabled_for_update(&mut txn).await?;

    let now = now(&mut txn).await?;

    sqlx::query!(
        r#"
        INSERT INTO studies (study_uid, patient_id, accession_number, first_received_at, last_received_at, instance_count, byte_count)
        VALUES ($1, $2, $3, $4, $4, 1, $5)
        ON CONFLICT (study_uid) DO UPDATE SET
            last_received_at = excluded.last_received_at,
            instance_count = studies.instance_count + 1,
            byte_count = studies.byte_count + excluded.byte_count
        "#,
        req.study_uid,
        req.patient_id,
        req.accession_number,
        now,
        req.byte_length,
    )
    .execute(&mut *txn)
    .await?;

    sqlx::query!(
        r#"
        INSERT INTO series (series_uid, study_uid, modality, instance_count)
        VALUES ($1, $2, $3, 1)
        ON CONFLICT (series_uid) DO UPDATE SET
            instance_count = series.instance_count + 1
        "#,
        req.series_uid,
        req.study_uid,
        req.modality,
    )
    .execute(&mut *txn)
    .await?;

    sqlx::query_as!(
        InstanceRow,
        r#"
        INSERT INTO instances
            (instance_uid, series_uid, study_uid, sop_class_uid, transfer_syntax_uid,
             byte_length, content_hash, storage_path, received_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING instance_uid, series_uid, study_uid, sop_class_uid, transfer_syntax_uid,
                  byte_length, content_hash, storage_path, received_at
        "#,
        req.instance_uid,
        req.series_uid,
        req.study_uid,
        req.sop_class_uid,
        req.transfer_syntax_uid,
        req.byte_length,
        req.content_hash,
        req.storage_path,
        now,
    )
    .fetch_one(&mut *txn)
    .await?;

    let metadata = InstanceMetadata {
        modality: req.modality,
        sop_class_uid: req.sop_class_uid,
        called_ae: req.called_ae,
        labels: req.labels,
    };

    let matched: Vec<_> = destinations.iter().filter(|d| d.forwarding_rule.matches(&metadata)).collect();

    for destination in &matched {
        sqlx::query!(
            r#"INSERT INTO forward_jobs (instance_uid, destination_id) VALUES ($1, $2)"#,
            req.instance_uid,
            destination.id,
        )
        .execute(&mut *txn)
        .await?;
        sqlx::query!("SELECT pg_notify('forward_job_ready', $1)", destination.id.to_string())
            .execute(&mut *txn)
            .await?;
    }

    let created = matched.len();
    txn.commit().await?;
    Ok(AdmitOutcome::Admitted { forward_jobs_created: created })
}

async fn now(txn: &mut sqlx::PgConnection) -> crate::Result<chrono::DateTime<chrono::Utc>> {
    let row = sqlx::query_scalar!(r#"SELECT now() as "now!""#).fetch_one(&mut *txn).await?;
    Ok(row)
}
