//! End-to-end smoke test: the Forwarder sends a stored object, byte for
//! byte, to a real `dicom-ul` server association acting as the peer SCP.

use std::sync::Arc;
use std::time::Duration;

use dicom_core::{dicom_value, DataElement, PrimitiveValue, Tag, VR};
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_ul::association::server::ServerAssociationOptions;
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};
use gateway_catalog::{ClaimedJob, DestinationRow, ForwardJobRow};
use gateway_dimse::{CStoreRequest, CStoreResponse};
use gateway_models::{ForwardingRule, JobStatus, TlsPolicy};
use gateway_queue::JobExecutor;

const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

fn unique_uid(prefix: &str) -> String {
    format!("1.2.840.{prefix}.{}", uuid::Uuid::new_v4().simple())
}

fn build_object_bytes(study_uid: &str, series_uid: &str, instance_uid: &str) -> Vec<u8> {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(Tag(0x0008, 0x0060), VR::CS, dicom_value!(Strs, ["CT"])));
    obj.put(DataElement::new(Tag(0x0020, 0x000D), VR::UI, PrimitiveValue::from(study_uid)));
    obj.put(DataElement::new(Tag(0x0020, 0x000E), VR::UI, PrimitiveValue::from(series_uid)));
    obj.put(DataElement::new(Tag(0x0008, 0x0018), VR::UI, PrimitiveValue::from(instance_uid)));
    obj.put(DataElement::new(Tag(0x0008, 0x0016), VR::UI, PrimitiveValue::from(CT_IMAGE_STORAGE)));

    let file_object = obj
        .with_meta(
            FileMetaTableBuilder::default()
                .transfer_syntax(IMPLICIT_VR_LE)
                .media_storage_sop_class_uid(CT_IMAGE_STORAGE)
                .media_storage_sop_instance_uid(instance_uid),
        )
        .unwrap();

    let mut bytes = Vec::new();
    file_object.write_all(&mut bytes).unwrap();
    bytes
}

/// A minimal mock SCP: accepts one association, answers exactly one
/// C-STORE with the given status, and hands the received bytes back to
/// the caller via the returned channel.
async fn start_mock_scp(status: u16) -> (std::net::SocketAddr, tokio::sync::oneshot::Receiver<Vec<u8>>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let (socket, _peer) = listener.accept().await.unwrap();
        let options = ServerAssociationOptions::new()
            .accept_any()
            .ae_title("PEERSCP")
            .with_transfer_syntax(IMPLICIT_VR_LE)
            .with_abstract_syntax(CT_IMAGE_STORAGE);
        let mut association = options.establish_async(socket).await.unwrap();

        let Pdu::PData { data } = association.receive().await.unwrap() else {
            panic!("expected C-STORE command PDU");
        };
        let pc_id = data[0].presentation_context_id;
        let request = CStoreRequest::decode(&data[0].data).unwrap();

        let mut received = Vec::new();
        {
            use tokio::io::AsyncReadExt;
            let mut reader = association.receive_pdata();
            reader.read_to_end(&mut received).await.unwrap();
        }
        let _ = tx.send(received);

        let response = CStoreResponse {
            affected_sop_class_uid: request.affected_sop_class_uid,
            affected_sop_instance_uid: request.affected_sop_instance_uid,
            message_id_being_responded_to: request.message_id,
            status,
        };
        association
            .send(&Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: pc_id,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: response.encode(),
                }],
            })
            .await
            .unwrap();

        if association.receive().await.unwrap() == Pdu::ReleaseRQ {
            association.send(&Pdu::ReleaseRP).await.unwrap();
        }
    });

    (addr, rx)
}

async fn pool() -> sqlx::PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for forwarder integration tests");
    sqlx::PgPool::connect(&url).await.expect("connect to test database")
}

fn destination(addr: std::net::SocketAddr) -> DestinationRow {
    DestinationRow {
        id: uuid::Uuid::new_v4(),
        name: "peer".to_string(),
        ae_title: "PEERSCP".to_string(),
        host: addr.ip().to_string(),
        port: addr.port() as i32,
        tls_policy: TlsPolicy::None,
        enabled: true,
        forwarding_rule: ForwardingRule::default(),
        concurrency_limit: 1,
        verify_on_connect: false,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn forwards_stored_bytes_unchanged_to_peer() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(gateway_store::ObjectStore::new(dir.path()));

    let study_uid = unique_uid("200");
    let series_uid = format!("{study_uid}.1");
    let instance_uid = format!("{series_uid}.1");
    let object_bytes = build_object_bytes(&study_uid, &series_uid, &instance_uid);

    {
        let mut scratch = store.open_scratch("TESTSCP").await.unwrap();
        scratch.write_chunk(&object_bytes).await.unwrap();
        let handle = scratch.finish().await.unwrap();
        store.publish(handle, &study_uid, &series_uid, &instance_uid).await.unwrap();
    }

    let (addr, received_rx) = start_mock_scp(0x0000).await;

    let forwarder = gateway_forwarder::Forwarder::new(
        gateway_forwarder::ForwarderConfig {
            calling_ae_title: "GATEWAYSCU".to_string(),
            max_pdu_length: 16384,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(5),
            association_idle_timeout: Duration::from_secs(30),
            worker_id: "test-worker".to_string(),
            lease_duration: chrono::Duration::seconds(30),
            heartbeat_interval: Duration::from_secs(30),
        },
        store.clone(),
        pool().await,
    );

    let job = ClaimedJob {
        job: ForwardJobRow {
            id: uuid::Uuid::new_v4(),
            instance_uid: instance_uid.clone(),
            destination_id: uuid::Uuid::new_v4(),
            status: JobStatus::InProgress,
            attempts: 0,
            priority: 0,
            next_eligible_at: chrono::Utc::now(),
            lease_holder: Some("test-worker".to_string()),
            lease_expires_at: Some(chrono::Utc::now() + chrono::Duration::seconds(30)),
            last_error_kind: None,
            last_error_detail: None,
            created_at: chrono::Utc::now(),
            finished_at: None,
        },
        instance: gateway_catalog::InstanceRow {
            instance_uid: instance_uid.clone(),
            series_uid: series_uid.clone(),
            study_uid: study_uid.clone(),
            sop_class_uid: CT_IMAGE_STORAGE.to_string(),
            transfer_syntax_uid: IMPLICIT_VR_LE.to_string(),
            byte_length: object_bytes.len() as i64,
            content_hash: "unused-in-this-test".to_string(),
            storage_path: "unused-in-this-test".to_string(),
            received_at: chrono::Utc::now(),
        },
        destination: destination(addr),
    };

    let outcome = forwarder.execute(&job).await;
    match outcome {
        gateway_queue::ExecutionOutcome::Completed => {}
        gateway_queue::ExecutionOutcome::Failed { kind, detail } => {
            panic!("expected the transfer to complete, got {kind:?}: {detail}");
        }
    }

    let received = received_rx.await.unwrap();
    assert_eq!(received, object_bytes, "forwarded bytes must match the stored bytes exactly");
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_failure_status_is_reported_as_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(gateway_store::ObjectStore::new(dir.path()));

    let study_uid = unique_uid("201");
    let series_uid = format!("{study_uid}.1");
    let instance_uid = format!("{series_uid}.1");
    let object_bytes = build_object_bytes(&study_uid, &series_uid, &instance_uid);

    {
        let mut scratch = store.open_scratch("TESTSCP").await.unwrap();
        scratch.write_chunk(&object_bytes).await.unwrap();
        let handle = scratch.finish().await.unwrap();
        store.publish(handle, &study_uid, &series_uid, &instance_uid).await.unwrap();
    }

    let (addr, _received_rx) = start_mock_scp(0xA700).await;

    let forwarder = gateway_forwarder::Forwarder::new(
        gateway_forwarder::ForwarderConfig {
            calling_ae_title: "GATEWAYSCU".to_string(),
            max_pdu_length: 16384,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(5),
            association_idle_timeout: Duration::from_secs(30),
            worker_id: "test-worker".to_string(),
            lease_duration: chrono::Duration::seconds(30),
            heartbeat_interval: Duration::from_secs(30),
        },
        store.clone(),
        pool().await,
    );

    let job = ClaimedJob {
        job: ForwardJobRow {
            id: uuid::Uuid::new_v4(),
            instance_uid: instance_uid.clone(),
            destination_id: uuid::Uuid::new_v4(),
            status: JobStatus::InProgress,
            attempts: 0,
            priority: 0,
            next_eligible_at: chrono::Utc::now(),
            lease_holder: Some("test-worker".to_string()),
            lease_expires_at: Some(chrono::Utc::now() + chrono::Duration::seconds(30)),
            last_error_kind: None,
            last_error_detail: None,
            created_at: chrono::Utc::now(),
            finished_at: None,
        },
        instance: gateway_catalog::InstanceRow {
            instance_uid: instance_uid.clone(),
            series_uid,
            study_uid,
            sop_class_uid: CT_IMAGE_STORAGE.to_string(),
            transfer_syntax_uid: IMPLICIT_VR_LE.to_string(),
            byte_length: object_bytes.len() as i64,
            content_hash: "unused-in-this-test".to_string(),
            storage_path: "unused-in-this-test".to_string(),
            received_at: chrono::Utc::now(),
        },
        destination: destination(addr),
    };

    match forwarder.execute(&job).await {
        gateway_queue::ExecutionOutcome::Failed { kind, .. } => {
            assert_eq!(kind, gateway_models::ErrorKind::PeerStatusFailure);
        }
        gateway_queue::ExecutionOutcome::Completed => panic!("expected a failure outcome"),
    }
}
