//! Shared types for the imaging gateway: queue/error taxonomies and the
//! forwarding-rule predicate, used by every other crate in the workspace.

pub mod forwarding_rule;

pub use forwarding_rule::{ForwardingRule, InstanceMetadata};

/// Status of a [`ForwardJob`](https://example.invalid) row, per its state
/// machine: pending jobs are claimed into progress, progress resolves to
/// completion, a scheduled retry, or dead-letter, and any non-terminal
/// status can be canceled.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    RetryScheduled,
    Completed,
    DeadLetter,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::DeadLetter | JobStatus::Canceled
        )
    }
}

/// Per-destination TLS requirement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[sqlx(type_name = "tls_policy", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TlsPolicy {
    None,
    Opportunistic,
    Required,
}

/// The error-kind taxonomy. Every fault that crosses a
/// job-state or C-STORE-response boundary is classified into one of these
/// before it is recorded; raw transport/library errors never leak past.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Validation,
    StorageIo,
    CatalogConflict,
    CatalogUnavailable,
    PeerRejectAssociation,
    PeerRejectContext,
    PeerStatusFailure,
    PeerStatusWarning,
    NetworkTransient,
    LeaseLost,
    Canceled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::StorageIo => "storage-io",
            ErrorKind::CatalogConflict => "catalog-conflict",
            ErrorKind::CatalogUnavailable => "catalog-unavailable",
            ErrorKind::PeerRejectAssociation => "peer-reject-association",
            ErrorKind::PeerRejectContext => "peer-reject-context",
            ErrorKind::PeerStatusFailure => "peer-status-failure",
            ErrorKind::PeerStatusWarning => "peer-status-warning",
            ErrorKind::NetworkTransient => "network-transient",
            ErrorKind::LeaseLost => "lease-lost",
            ErrorKind::Canceled => "canceled",
        }
    }

    /// Whether a job failing with this error kind should be retried
    /// (subject to max-attempts) or dead-lettered immediately.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkTransient | ErrorKind::CatalogUnavailable | ErrorKind::StorageIo
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a Supervisor/Forwarder/Receiver worker for lease ownership and
/// scratch-area partitioning: `<host>-<pid>-<run id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn generate(host: &str) -> Self {
        WorkerId(format!("{host}-{}-{}", std::process::id(), uuid::Uuid::new_v4()))
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for WorkerId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(WorkerId(s.to_string()))
    }
}
