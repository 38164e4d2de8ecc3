//! Catalog: the authoritative relational state of
//! studies, series, instances, destinations, forward jobs, and the ingest
//! audit trail. Every cross-component coordination point in the gateway
//! goes through this crate; no in-process queue survives a restart.

pub mod admit;
pub mod destinations;
pub mod events;
pub mod instances;
pub mod jobs;
pub mod studies;

pub use admit::{admit, AdmitOutcome, AdmitRequest};
pub use destinations::DestinationRow;
pub use events::IngestEventRow;
pub use instances::InstanceRow;
pub use jobs::{ClaimedJob, ForwardJobRow};
pub use studies::{StudyAggregateStatus, StudyRow};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    /// An instance with the same UID already exists but its content hash
    /// does not match what was just received.
    #[error("instance {instance_uid} already exists with a different content hash")]
    HashConflict { instance_uid: String },
    #[error("lease duration out of range for a Postgres interval: {0}")]
    Interval(sqlx::error::BoxDynError),
}

pub type Result<T> = std::result::Result<T, CatalogError>;
