//! Association lifecycle for the forwarding path: one
//! association proposes exactly one presentation context, for the stored
//! instance's own transfer syntax, since the core never transcodes. TLS is
//! negotiated per the destination's policy; `Opportunistic` tries TLS first
//! and falls back to plain TCP if the handshake itself fails.

use std::time::Duration;

use dicom_ul::association::client::{AsyncTlsStream, ClientAssociationOptions};
use dicom_ul::association::Association;
use dicom_ul::pdu::{Pdu, PresentationContextNegotiated};
use gateway_catalog::DestinationRow;
use gateway_models::TlsPolicy;
use tokio::net::TcpStream;

use crate::tls;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("association request rejected or transport error: {0}")]
    Ul(#[from] dicom_ul::association::Error),
}

/// A client association over either a plain or a TLS-wrapped TCP stream.
/// Forwarding code only ever sees this enum, never the concrete stream type.
pub enum OpenAssociation {
    Plain(Box<dicom_ul::association::client::AsyncClientAssociation<TcpStream>>),
    Tls(Box<dicom_ul::association::client::AsyncClientAssociation<AsyncTlsStream>>),
}

impl OpenAssociation {
    pub fn peer_ae_title(&self) -> &str {
        match self {
            OpenAssociation::Plain(a) => a.peer_ae_title(),
            OpenAssociation::Tls(a) => a.peer_ae_title(),
        }
    }

    pub fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        match self {
            OpenAssociation::Plain(a) => a.presentation_contexts(),
            OpenAssociation::Tls(a) => a.presentation_contexts(),
        }
    }

    pub async fn send(&mut self, pdu: &Pdu) -> Result<(), dicom_ul::association::Error> {
        match self {
            OpenAssociation::Plain(a) => a.send(pdu).await,
            OpenAssociation::Tls(a) => a.send(pdu).await,
        }
    }

    pub async fn receive(&mut self) -> Result<Pdu, dicom_ul::association::Error> {
        match self {
            OpenAssociation::Plain(a) => a.receive().await,
            OpenAssociation::Tls(a) => a.receive().await,
        }
    }

    /// Streams `file`'s remaining bytes as the data set of the presentation
    /// context `pc_id`, exactly as read, then closes the P-Data exchange.
    pub async fn stream_dataset(
        &mut self,
        pc_id: u8,
        file: &mut tokio::fs::File,
    ) -> std::io::Result<()> {
        match self {
            OpenAssociation::Plain(a) => {
                let mut writer = a.send_pdata(pc_id);
                tokio::io::copy(file, &mut writer).await?;
                writer.finish().await
            }
            OpenAssociation::Tls(a) => {
                let mut writer = a.send_pdata(pc_id);
                tokio::io::copy(file, &mut writer).await?;
                writer.finish().await
            }
        }
    }

    pub async fn release(self) -> Result<(), dicom_ul::association::Error> {
        match self {
            OpenAssociation::Plain(a) => a.release().await,
            OpenAssociation::Tls(a) => a.release().await,
        }
    }

    pub async fn abort(self) -> Result<(), dicom_ul::association::Error> {
        match self {
            OpenAssociation::Plain(a) => a.abort().await,
            OpenAssociation::Tls(a) => a.abort().await,
        }
    }
}

/// Opens a fresh association to `destination`, proposing a single
/// presentation context for `(sop_class_uid, transfer_syntax_uid)`.
pub async fn connect(
    destination: &DestinationRow,
    calling_ae_title: &str,
    max_pdu_length: u32,
    connect_timeout: Duration,
    io_timeout: Duration,
    sop_class_uid: &str,
    transfer_syntax_uid: &str,
) -> Result<OpenAssociation, ConnectError> {
    let addr = (destination.host.as_str(), destination.port as u16);
    let options = ClientAssociationOptions::new()
        .calling_ae_title(calling_ae_title)
        .called_ae_title(destination.ae_title.as_str())
        .with_presentation_context(sop_class_uid, vec![transfer_syntax_uid])
        .max_pdu_length(max_pdu_length)
        .connection_timeout(connect_timeout)
        .read_timeout(io_timeout)
        .write_timeout(io_timeout);

    match destination.tls_policy {
        TlsPolicy::None => Ok(OpenAssociation::Plain(Box::new(options.establish_async(addr).await?))),
        TlsPolicy::Required => {
            let tls_options = options.clone().tls_config(tls::client_config()).server_name(&destination.host);
            Ok(OpenAssociation::Tls(Box::new(tls_options.establish_tls_async(addr).await?)))
        }
        TlsPolicy::Opportunistic => {
            let tls_options = options.clone().tls_config(tls::client_config()).server_name(&destination.host);
            match tls_options.establish_tls_async(addr).await {
                Ok(assoc) => Ok(OpenAssociation::Tls(Box::new(assoc))),
                Err(err) => {
                    tracing::info!(destination = %destination.name, %err, "opportunistic TLS failed, falling back to plain TCP");
                    Ok(OpenAssociation::Plain(Box::new(options.establish_async(addr).await?)))
                }
            }
        }
    }
}
