//! Per-association lifecycle: negotiate, then for each C-STORE request
//! stream bytes to the object store, admit, and answer; answer C-ECHO
//! independently and without touching storage or the catalog. A single
//! object's failure does not close the association.

use std::sync::Arc;

use dicom_ul::association::server::ServerAssociationOptions;
use dicom_ul::association::Association as _;
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};
use gateway_catalog::admit::{self, AdmitOutcome, AdmitRequest};
use gateway_catalog::events::{self, NewIngestEvent};
use gateway_dimse::{CEchoRequest, CEchoResponse, CStoreRequest, CStoreResponse};
use gateway_store::{ObjectStore, PublishOutcome};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::{metadata, ReceiverConfig};

const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

/// DICOM status: success (PS3.7 Annex C).
const STATUS_SUCCESS: u16 = 0x0000;
/// DICOM status: C-STORE failure, "cannot understand" — used as a catch-all
/// when the received object cannot be admitted.
const STATUS_CANNOT_UNDERSTAND: u16 = 0xC000;

#[derive(Debug, thiserror::Error)]
pub enum AssociationError {
    #[error("DICOM upper-layer error: {0}")]
    Ul(#[from] dicom_ul::association::Error),
    #[error("command set codec error: {0}")]
    Command(#[from] gateway_dimse::CommandError),
}

/// Runs one accepted association to completion: negotiates presentation
/// contexts, then services C-STORE and C-ECHO requests until the peer
/// releases or aborts.
pub async fn handle_association(
    socket: TcpStream,
    peer_addr: std::net::SocketAddr,
    config: Arc<ReceiverConfig>,
    pool: sqlx::PgPool,
    store: Arc<ObjectStore>,
) -> Result<(), AssociationError> {
    let mut options = ServerAssociationOptions::new()
        .accept_called_ae_title()
        .ae_title(&config.ae_title)
        .max_pdu_length(config.max_pdu_length)
        .with_transfer_syntax(IMPLICIT_VR_LE)
        .with_transfer_syntax(EXPLICIT_VR_LE);
    for sop_class in &config.supported_sop_classes {
        options = options.with_abstract_syntax(sop_class.as_str());
    }

    let mut association = options.establish_async(socket).await?;
    let association_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(%peer_addr, %association_id, peer_ae = association.peer_ae_title(), "association accepted");

    loop {
        match association.receive().await? {
            Pdu::PData { data } => {
                for value in data {
                    if value.value_type != PDataValueType::Command {
                        tracing::warn!(%association_id, "ignoring stray data PDV outside a command exchange");
                        continue;
                    }
                    handle_command(
                        &mut association,
                        &association_id,
                        &config,
                        &pool,
                        &store,
                        value,
                    )
                    .await?;
                }
            }
            Pdu::ReleaseRQ => {
                association.send(&Pdu::ReleaseRP).await?;
                tracing::info!(%association_id, "association released");
                break;
            }
            Pdu::AbortRQ { .. } => {
                tracing::info!(%association_id, "association aborted by peer");
                break;
            }
            other => {
                tracing::warn!(%association_id, pdu = %other.short_description(), "unexpected PDU, aborting");
                association.abort().await?;
                break;
            }
        }
    }

    Ok(())
}

type Association = dicom_ul::association::server::AsyncServerAssociation<TcpStream>;

async fn handle_command(
    association: &mut Association,
    association_id: &str,
    config: &ReceiverConfig,
    pool: &sqlx::PgPool,
    store: &ObjectStore,
    value: PDataValue,
) -> Result<(), AssociationError> {
    let presentation_context_id = value.presentation_context_id;
    let peer_ae = association.peer_ae_title().to_string();

    match gateway_dimse::peek_command_field(&value.data)? {
        gateway_dimse::C_ECHO_RQ => {
            let request = CEchoRequest::decode(&value.data)?;
            tracing::info!(%association_id, %peer_ae, "C-ECHO received");
            let response = CEchoResponse {
                affected_sop_class_uid: request.affected_sop_class_uid,
                message_id_being_responded_to: request.message_id,
                status: STATUS_SUCCESS,
            };
            send_command(association, presentation_context_id, &response.encode()).await?;
        }
        gateway_dimse::C_STORE_RQ => {
            let request = CStoreRequest::decode(&value.data)?;
            let started_at = chrono::Utc::now();
            let outcome = receive_object(association, config, pool, store, &request).await;

            let (status, instance_uid, byte_count, result, detail) = match &outcome {
                Ok(admitted) => (
                    STATUS_SUCCESS,
                    Some(request.affected_sop_instance_uid.clone()),
                    admitted.byte_length,
                    "success",
                    None,
                ),
                Err(err) => {
                    tracing::warn!(%association_id, %peer_ae, %err, "C-STORE failed");
                    // The instance was never admitted on this path, so
                    // `instances` has no matching row; recording one here
                    // would violate `ingest_events`'s foreign key.
                    (STATUS_CANNOT_UNDERSTAND, None, 0, "receive-failure", Some(err.to_string()))
                }
            };

            let _ = events::record(
                pool,
                NewIngestEvent {
                    association_id,
                    peer_ae: &peer_ae,
                    instance_uid: instance_uid.as_deref(),
                    result,
                    byte_count,
                    detail: detail.as_deref(),
                    started_at,
                    finished_at: chrono::Utc::now(),
                },
            )
            .await;

            let response = CStoreResponse {
                affected_sop_class_uid: request.affected_sop_class_uid,
                affected_sop_instance_uid: request.affected_sop_instance_uid,
                message_id_being_responded_to: request.message_id,
                status,
            };
            send_command(association, presentation_context_id, &response.encode()).await?;
        }
        other => {
            tracing::warn!(%association_id, command_field = format!("{other:#06X}"), "unsupported command, ignoring");
        }
    }

    Ok(())
}

async fn send_command(
    association: &mut Association,
    presentation_context_id: u8,
    encoded: &[u8],
) -> Result<(), AssociationError> {
    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: encoded.to_vec(),
            }],
        })
        .await?;
    Ok(())
}

struct Admitted {
    byte_length: i64,
}

#[derive(Debug, thiserror::Error)]
enum ReceiveError {
    #[error("storage error: {0}")]
    Store(#[from] gateway_store::StoreError),
    #[error("header extraction error: {0}")]
    Metadata(#[from] metadata::MetadataError),
    #[error("catalog error: {0}")]
    Catalog(#[from] gateway_catalog::CatalogError),
    #[error("object already stored under this instance UID with a different content hash")]
    HashConflict,
    #[error("I/O error streaming data set: {0}")]
    Io(#[from] std::io::Error),
    #[error("command Affected SOP Instance UID {command} does not match the dataset's {dataset}")]
    SopInstanceUidMismatch { command: String, dataset: String },
}

/// Streams the data set for one C-STORE request to the Object Store,
/// extracts Catalog metadata from the published bytes, and admits the
/// instance. On any failure after the scratch file is opened, it is
/// unlinked; the association itself is left open for the caller to answer
/// with a failure status and continue.
async fn receive_object(
    association: &mut Association,
    config: &ReceiverConfig,
    pool: &sqlx::PgPool,
    store: &ObjectStore,
    request: &CStoreRequest,
) -> Result<Admitted, ReceiveError> {
    let mut writer = store.open_scratch(&config.ae_title).await?;
    let mut reader = association.receive_pdata();
    let mut buf = [0u8; 64 * 1024];
    let write_result: std::io::Result<()> = async {
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_chunk(&buf[..n]).await?;
        }
        Ok(())
    }
    .await;

    let handle = match write_result {
        Ok(()) => writer.finish().await?,
        Err(err) => {
            writer.abort().await?;
            return Err(ReceiveError::Io(err));
        }
    };

    let extracted = match metadata::extract(handle.path.clone()).await {
        Ok(extracted) => extracted,
        Err(err) => {
            let _ = tokio::fs::remove_file(&handle.path).await;
            return Err(ReceiveError::Metadata(err));
        }
    };
    if extracted.sop_instance_uid != request.affected_sop_instance_uid {
        let _ = tokio::fs::remove_file(&handle.path).await;
        return Err(ReceiveError::SopInstanceUidMismatch {
            command: request.affected_sop_instance_uid.clone(),
            dataset: extracted.sop_instance_uid,
        });
    }

    let byte_length = handle.byte_length as i64;
    let content_hash = handle.content_hash.clone();
    let publish_outcome = store
        .publish(handle, &extracted.study_uid, &extracted.series_uid, &extracted.sop_instance_uid)
        .await?;
    if matches!(publish_outcome, PublishOutcome::IdempotentDuplicate) {
        tracing::info!(instance_uid = %extracted.sop_instance_uid, "duplicate object, treating as idempotent success");
    }

    let storage_path = store
        .final_path(&extracted.study_uid, &extracted.series_uid, &extracted.sop_instance_uid)
        .to_string_lossy()
        .into_owned();

    let labels: Vec<String> = Vec::new();
    let outcome = admit::admit(
        pool,
        AdmitRequest {
            instance_uid: &extracted.sop_instance_uid,
            series_uid: &extracted.series_uid,
            study_uid: &extracted.study_uid,
            sop_class_uid: &extracted.sop_class_uid,
            transfer_syntax_uid: &extracted.transfer_syntax_uid,
            modality: extracted.modality.as_deref(),
            called_ae: &config.ae_title,
            labels: &labels,
            patient_id: extracted.patient_id.as_deref(),
            accession_number: extracted.accession_number.as_deref(),
            byte_length,
            content_hash: &content_hash,
            storage_path: &storage_path,
        },
    )
    .await?;

    match outcome {
        AdmitOutcome::Admitted { .. } | AdmitOutcome::AlreadyAdmitted => Ok(Admitted { byte_length }),
        AdmitOutcome::HashConflict => Err(ReceiveError::HashConflict),
    }
}
