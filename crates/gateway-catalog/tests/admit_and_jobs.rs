//! Integration tests against a real PostgreSQL instance, mirroring the
//! teacher's `agent-sql/tests` layout. Requires `DATABASE_URL` to point at a
//! database migrated with `migrations/0001_init.sql`; `#[serial_test::serial]`
//! because every test shares the same `destinations`/`forward_jobs` tables.

use gateway_catalog::admit::{admit, AdmitOutcome, AdmitRequest};
use gateway_models::ForwardingRule;

async fn pool() -> sqlx::PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for catalog integration tests");
    sqlx::PgPool::connect(&url).await.expect("connect to test database")
}

fn unique_uid(prefix: &str) -> String {
    format!("1.2.840.{prefix}.{}", uuid::Uuid::new_v4().simple())
}

async fn make_destination(pool: &sqlx::PgPool, rule: ForwardingRule) -> uuid::Uuid {
    make_destination_with_limit(pool, rule, 4).await
}

async fn make_destination_with_limit(pool: &sqlx::PgPool, rule: ForwardingRule, concurrency_limit: i32) -> uuid::Uuid {
    sqlx::query_scalar!(
        r#"
        INSERT INTO destinations (name, ae_title, host, port, forwarding_rule, concurrency_limit)
        VALUES ($1, 'TESTPEER', '127.0.0.1', 11112, $2, $3)
        RETURNING id
        "#,
        format!("test-dest-{}", uuid::Uuid::new_v4()),
        sqlx::types::Json(rule) as _,
        concurrency_limit,
    )
    .fetch_one(pool)
    .await
    .expect("insert destination")
}

#[tokio::test]
#[serial_test::serial]
async fn admit_creates_instance_and_matching_forward_job() {
    let pool = pool().await;
    let destination_id = make_destination(&pool, ForwardingRule {
        modality: Some(vec!["CT".into()]),
        ..Default::default()
    })
    .await;

    let study_uid = unique_uid("1");
    let series_uid = format!("{study_uid}.1");
    let instance_uid = format!("{series_uid}.1");
    let labels = Vec::new();

    let req = AdmitRequest {
        instance_uid: &instance_uid,
        series_uid: &series_uid,
        study_uid: &study_uid,
        sop_class_uid: "1.2.840.10008.5.1.4.1.1.2",
        transfer_syntax_uid: "1.2.840.10008.1.2.1",
        modality: Some("CT"),
        called_ae: "TESTCALLED",
        labels: &labels,
        patient_id: Some("PATIENT1"),
        accession_number: None,
        byte_length: 1_048_960,
        content_hash: "deadbeef",
        storage_path: "unused-in-this-test",
    };

    let outcome = admit(&pool, req).await.expect("admit");
    assert_eq!(outcome, AdmitOutcome::Admitted { forward_jobs_created: 1 });

    let study = gateway_catalog::studies::get(&pool, &study_uid).await.unwrap().expect("study row");
    assert_eq!(study.instance_count, 1);
    assert_eq!(study.byte_count, 1_048_960);

    let backlog = gateway_catalog::jobs::destination_backlog(&pool, destination_id).await.unwrap();
    assert_eq!(backlog, 1);
}

#[tokio::test]
#[serial_test::serial]
async fn admit_is_idempotent_on_matching_hash_and_conflicts_on_mismatch() {
    let pool = pool().await;
    let study_uid = unique_uid("2");
    let series_uid = format!("{study_uid}.1");
    let instance_uid = format!("{series_uid}.1");
    let labels = Vec::new();

    let base_req = || AdmitRequest {
        instance_uid: &instance_uid,
        series_uid: &series_uid,
        study_uid: &study_uid,
        sop_class_uid: "1.2.840.10008.5.1.4.1.1.2",
        transfer_syntax_uid: "1.2.840.10008.1.2.1",
        modality: Some("MR"),
        called_ae: "TESTCALLED",
        labels: &labels,
        patient_id: None,
        accession_number: None,
        byte_length: 512,
        content_hash: "abc123",
        storage_path: "unused",
    };

    let first = admit(&pool, base_req()).await.unwrap();
    assert_eq!(first, AdmitOutcome::Admitted { forward_jobs_created: 0 });

    let second = admit(&pool, base_req()).await.unwrap();
    assert_eq!(second, AdmitOutcome::AlreadyAdmitted);

    let mut conflicting = base_req();
    conflicting.content_hash = "different-hash";
    let third = admit(&pool, conflicting).await.unwrap();
    assert_eq!(third, AdmitOutcome::HashConflict);

    let study = gateway_catalog::studies::get(&pool, &study_uid).await.unwrap().unwrap();
    assert_eq!(study.instance_count, 1, "idempotent re-admission must not double-count");
}

#[tokio::test]
#[serial_test::serial]
async fn claim_complete_and_dead_letter_round_trip() {
    let pool = pool().await;
    let destination_id = make_destination(&pool, ForwardingRule::default()).await;

    let study_uid = unique_uid("3");
    let series_uid = format!("{study_uid}.1");
    let instance_uid = format!("{series_uid}.1");
    let labels = Vec::new();

    admit(&pool, AdmitRequest {
        instance_uid: &instance_uid,
        series_uid: &series_uid,
        study_uid: &study_uid,
        sop_class_uid: "1.2.840.10008.5.1.4.1.1.2",
        transfer_syntax_uid: "1.2.840.10008.1.2.1",
        modality: Some("US"),
        called_ae: "TESTCALLED",
        labels: &labels,
        patient_id: None,
        accession_number: None,
        byte_length: 10,
        content_hash: "h",
        storage_path: "unused",
    })
    .await
    .unwrap();

    let claimed = gateway_catalog::jobs::claim_batch(&pool, "worker-1", 10, chrono::Duration::seconds(30))
        .await
        .unwrap();
    let job = claimed.into_iter().find(|j| j.job.destination_id == destination_id).expect("claimed job");
    assert_eq!(job.job.attempts, 1);
    assert_eq!(job.instance.instance_uid, instance_uid);

    gateway_catalog::jobs::mark_dead_letter(&pool, job.job.id, "peer-reject-context", "association rejected")
        .await
        .unwrap();

    let dead = gateway_catalog::jobs::list_dead_letter(&pool, Some(destination_id), 10).await.unwrap();
    assert!(dead.iter().any(|j| j.id == job.job.id));

    let retried = gateway_catalog::jobs::retry(&pool, Some(&[job.job.id])).await.unwrap();
    assert_eq!(retried, 1);

    let backlog = gateway_catalog::jobs::destination_backlog(&pool, destination_id).await.unwrap();
    assert_eq!(backlog, 1);
}

#[tokio::test]
#[serial_test::serial]
async fn claim_batch_never_exceeds_a_destinations_concurrency_limit() {
    let pool = pool().await;
    let destination_id = make_destination_with_limit(&pool, ForwardingRule::default(), 1).await;

    let study_uid = unique_uid("4");
    for i in 0..8 {
        let series_uid = format!("{study_uid}.{i}");
        let instance_uid = format!("{series_uid}.1");
        admit(&pool, AdmitRequest {
            instance_uid: &instance_uid,
            series_uid: &series_uid,
            study_uid: &study_uid,
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.2",
            transfer_syntax_uid: "1.2.840.10008.1.2.1",
            modality: Some("CT"),
            called_ae: "TESTCALLED",
            labels: &Vec::new(),
            patient_id: None,
            accession_number: None,
            byte_length: 10,
            content_hash: "h",
            storage_path: "unused",
        })
        .await
        .unwrap();
    }

    let claimed = gateway_catalog::jobs::claim_batch(&pool, "worker-1", 10, chrono::Duration::seconds(30))
        .await
        .unwrap();
    let for_destination = claimed.iter().filter(|j| j.job.destination_id == destination_id).count();
    assert_eq!(for_destination, 1, "a single batch must not exceed the destination's concurrency_limit");

    let second_claim = gateway_catalog::jobs::claim_batch(&pool, "worker-2", 10, chrono::Duration::seconds(30))
        .await
        .unwrap();
    assert!(
        second_claim.iter().all(|j| j.job.destination_id != destination_id),
        "destination is already at its concurrency_limit, no further jobs should be claimable"
    );
}
