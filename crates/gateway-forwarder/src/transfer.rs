//! Per-job transfer: resolve the destination, get an
//! association, send the stored bytes as a C-STORE, and classify the
//! outcome. Every fault is resolved to a [`ForwardError`] before it crosses
//! back into `gateway-queue`'s job-state machine.

use gateway_catalog::{ClaimedJob, DestinationRow};
use gateway_dimse::{CEchoRequest, CEchoResponse, CStoreRequest, CStoreResponse, Priority, StatusClass};
use gateway_models::ErrorKind;
use gateway_store::ObjectStore;

use crate::connection::{self, OpenAssociation};
use crate::pool::AssociationPool;
use crate::ForwarderConfig;

const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("failed to read stored object: {0}")]
    Storage(#[from] std::io::Error),
    #[error("association could not be established: {0}")]
    Connect(#[from] connection::ConnectError),
    #[error("DICOM upper-layer error: {0}")]
    Ul(#[from] dicom_ul::association::Error),
    #[error("command set codec error: {0}")]
    Command(#[from] gateway_dimse::CommandError),
    #[error("peer returned C-STORE failure status {status:#06X}")]
    PeerStatusFailure { status: u16 },
    #[error("peer did not accept {sop_class_uid} in transfer syntax {transfer_syntax_uid}; no transcoding is performed")]
    TransferSyntaxRejected { sop_class_uid: String, transfer_syntax_uid: String },
    #[error("association reported an unexpected PDU in response to C-STORE")]
    UnexpectedResponse,
    #[error("I/O error streaming dataset to peer: {0}")]
    Transfer(std::io::Error),
    #[error("job lease was lost to another worker mid-transfer")]
    LeaseLost,
    #[error("failed to heartbeat job lease: {0}")]
    Catalog(#[from] gateway_catalog::CatalogError),
}

impl ForwardError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ForwardError::Storage(_) => ErrorKind::StorageIo,
            ForwardError::Connect(connection::ConnectError::Ul(err)) => classify_ul_error(err),
            ForwardError::Ul(err) => classify_ul_error(err),
            ForwardError::Command(_) => ErrorKind::Validation,
            ForwardError::PeerStatusFailure { .. } => ErrorKind::PeerStatusFailure,
            ForwardError::TransferSyntaxRejected { .. } => ErrorKind::PeerRejectContext,
            ForwardError::UnexpectedResponse => ErrorKind::NetworkTransient,
            ForwardError::Transfer(_) => ErrorKind::NetworkTransient,
            ForwardError::LeaseLost => ErrorKind::LeaseLost,
            ForwardError::Catalog(_) => ErrorKind::CatalogUnavailable,
        }
    }
}

fn classify_ul_error(err: &dicom_ul::association::Error) -> ErrorKind {
    use dicom_ul::association::Error;
    use dicom_ul::pdu::AssociationRJResult;
    match err {
        Error::Rejected { association_rj, .. } => match association_rj.result {
            AssociationRJResult::Transient => ErrorKind::NetworkTransient,
            AssociationRJResult::Permanent => ErrorKind::PeerRejectAssociation,
        },
        Error::NoAcceptedPresentationContexts { .. } => ErrorKind::PeerRejectContext,
        Error::Connect { .. } | Error::Timeout { .. } | Error::WireSend { .. } | Error::WireRead { .. } => {
            ErrorKind::NetworkTransient
        }
        _ => ErrorKind::NetworkTransient,
    }
}

/// Executes one claimed job: read the stored bytes, get an association
/// (fresh or pooled), send the C-STORE, and interpret the response.
pub async fn forward(
    config: &ForwarderConfig,
    store: &ObjectStore,
    pool: &AssociationPool,
    db: &sqlx::PgPool,
    job: &ClaimedJob,
) -> Result<(), ForwardError> {
    let instance = &job.instance;
    let destination = &job.destination;

    let mut file = store
        .open_read(&instance.study_uid, &instance.series_uid, &instance.instance_uid)
        .await?;

    let cached = pool
        .checkout(destination.id, &instance.sop_class_uid, &instance.transfer_syntax_uid)
        .await;
    let (mut association, freshly_opened) = match cached {
        Some(assoc) => (assoc, false),
        None => {
            let assoc = connection::connect(
                destination,
                &config.calling_ae_title,
                config.max_pdu_length,
                config.connect_timeout,
                config.io_timeout,
                &instance.sop_class_uid,
                &instance.transfer_syntax_uid,
            )
            .await?;
            (assoc, true)
        }
    };

    if freshly_opened {
        tracing::debug!(destination = %destination.name, peer_ae_title = %association.peer_ae_title(), "opened association");
        if destination.verify_on_connect {
            verify_on_connect(&mut association, destination).await;
        }
    }

    let pc_id = match association
        .presentation_contexts()
        .iter()
        .find(|pc| pc.abstract_syntax == instance.sop_class_uid)
    {
        Some(pc) => pc.id,
        None => {
            let _ = association.abort().await;
            return Err(ForwardError::TransferSyntaxRejected {
                sop_class_uid: instance.sop_class_uid.clone(),
                transfer_syntax_uid: instance.transfer_syntax_uid.clone(),
            });
        }
    };

    let sop_class_uid = instance.sop_class_uid.clone();
    let result = send_c_store(config, db, job.job.id, &mut association, pc_id, &instance.instance_uid, &sop_class_uid, &mut file).await;

    match result {
        Ok(()) => {
            pool.checkin(destination.id, &instance.sop_class_uid, &instance.transfer_syntax_uid, association).await;
            Ok(())
        }
        Err(err) => {
            let _ = association.abort().await;
            Err(err)
        }
    }
}

/// Issues a C-ECHO-RQ as a connectivity probe on a freshly opened
/// association. Its outcome never blocks the C-STORE attempt that follows;
/// only the result is logged.
async fn verify_on_connect(association: &mut OpenAssociation, destination: &DestinationRow) {
    let pc_id = match association
        .presentation_contexts()
        .iter()
        .find(|pc| pc.abstract_syntax == VERIFICATION_SOP_CLASS)
    {
        Some(pc) => pc.id,
        None => {
            tracing::debug!(destination = %destination.name, "skipping verify_on_connect: verification SOP class not negotiated");
            return;
        }
    };

    let request = CEchoRequest { affected_sop_class_uid: VERIFICATION_SOP_CLASS.to_string(), message_id: 1 };
    let outcome: Result<CEchoResponse, ForwardError> = async {
        send_pdu(association, pc_id, &request.encode()).await?;
        let bytes = receive_command(association).await?;
        Ok(CEchoResponse::decode(&bytes)?)
    }
    .await;

    match outcome {
        Ok(response) if gateway_dimse::classify(response.status) == StatusClass::Success => {
            tracing::info!(destination = %destination.name, "verify_on_connect: C-ECHO succeeded");
        }
        Ok(response) => {
            tracing::warn!(destination = %destination.name, status = response.status, "verify_on_connect: C-ECHO returned non-success status");
        }
        Err(err) => {
            tracing::warn!(destination = %destination.name, %err, "verify_on_connect: C-ECHO failed, proceeding with C-STORE regardless");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn send_c_store(
    config: &ForwarderConfig,
    db: &sqlx::PgPool,
    job_id: uuid::Uuid,
    association: &mut OpenAssociation,
    pc_id: u8,
    sop_instance_uid: &str,
    sop_class_uid: &str,
    file: &mut tokio::fs::File,
) -> Result<(), ForwardError> {
    let request = CStoreRequest {
        affected_sop_class_uid: sop_class_uid.to_string(),
        affected_sop_instance_uid: sop_instance_uid.to_string(),
        message_id: 1,
        priority: Priority::Medium,
    };
    send_pdu(association, pc_id, &request.encode()).await?;
    stream_with_heartbeat(config, db, job_id, association, pc_id, file).await?;

    let response_bytes = receive_command(association).await?;
    let response = CStoreResponse::decode(&response_bytes)?;

    match gateway_dimse::classify(response.status) {
        StatusClass::Success | StatusClass::Warning => Ok(()),
        StatusClass::Pending | StatusClass::Failure => Err(ForwardError::PeerStatusFailure { status: response.status }),
    }
}

/// Streams the data set while periodically renewing the job's lease: long
/// transfers would otherwise outlive the lease a `gateway-queue` worker
/// claimed it under, and a second worker would pick
/// the job back up while this one is still sending it. If the lease turns
/// out to have been lost, the transfer is abandoned rather than completed
/// against a peer that a different worker may also now be writing to.
async fn stream_with_heartbeat(
    config: &ForwarderConfig,
    db: &sqlx::PgPool,
    job_id: uuid::Uuid,
    association: &mut OpenAssociation,
    pc_id: u8,
    file: &mut tokio::fs::File,
) -> Result<(), ForwardError> {
    let mut ticker = tokio::time::interval(config.heartbeat_interval);
    ticker.tick().await;

    let copy = association.stream_dataset(pc_id, file);
    tokio::pin!(copy);
    loop {
        tokio::select! {
            result = &mut copy => return result.map_err(ForwardError::Transfer),
            _ = ticker.tick() => {
                let held = gateway_catalog::jobs::heartbeat(db, job_id, &config.worker_id, config.lease_duration).await?;
                if !held {
                    return Err(ForwardError::LeaseLost);
                }
            }
        }
    }
}

async fn send_pdu(association: &mut OpenAssociation, pc_id: u8, encoded: &[u8]) -> Result<(), ForwardError> {
    use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};
    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: encoded.to_vec(),
            }],
        })
        .await?;
    Ok(())
}

async fn receive_command(association: &mut OpenAssociation) -> Result<Vec<u8>, ForwardError> {
    use dicom_ul::pdu::Pdu;
    match association.receive().await? {
        Pdu::PData { data } => Ok(data.into_iter().next().map(|v| v.data).unwrap_or_default()),
        _ => Err(ForwardError::UnexpectedResponse),
    }
}
