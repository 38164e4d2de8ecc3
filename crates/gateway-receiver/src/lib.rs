//! Receiver (SCP): terminates inbound DICOM associations on
//! a configured port and AE title, streams each C-STORE object to the
//! Object Store with byte preservation, admits it into the Catalog, and
//! fans out ForwardJobs. Answers C-ECHO independently of any object
//! transfer, touching neither the Object Store nor the Catalog.

mod association;
mod metadata;

pub use association::{handle_association, AssociationError};
pub use metadata::{ExtractedMetadata, MetadataError};

use std::net::SocketAddr;
use std::sync::Arc;

use gateway_store::ObjectStore;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Receiver configuration: bind address, AE title, and
/// association limits. Restart-only; not hot-reloaded.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub ae_title: String,
    pub bind_addr: SocketAddr,
    pub supported_sop_classes: Vec<String>,
    pub max_pdu_length: u32,
    pub max_associations: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Binds `config.bind_addr` and accepts associations until `shutdown`
/// publishes `true`, one task per association, bounded by
/// `config.max_associations`: a `select!` between `accept()` and the
/// shutdown signal, connections gated by a counting semaphore.
pub async fn run(
    config: ReceiverConfig,
    pool: sqlx::PgPool,
    store: Arc<ObjectStore>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ReceiverError> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, ae_title = %config.ae_title, "receiver listening");

    let config = Arc::new(config);
    let connection_limit = Arc::new(tokio::sync::Semaphore::new(config.max_associations));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(%err, "failed to accept connection");
                        continue;
                    }
                };
                let _ = socket.set_nodelay(true);

                let permit = match connection_limit.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!(%peer_addr, "rejecting association: at max_associations");
                        continue;
                    }
                };

                let pool = pool.clone();
                let store = store.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(err) = association::handle_association(socket, peer_addr, config, pool, store).await {
                        tracing::warn!(%peer_addr, %err, "association ended with an error");
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("receiver shutting down, no longer accepting associations");
                    break;
                }
            }
        }
    }

    Ok(())
}
