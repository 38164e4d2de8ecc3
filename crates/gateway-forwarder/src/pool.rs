//! Association reuse cache: keyed by the destination and
//! the exact (SOP Class, transfer syntax) pair an association negotiated,
//! since a single association's presentation contexts cannot be extended
//! after A-ASSOCIATE. A job that needs a pair not already cached opens a
//! fresh association; a finished job hands its association back for the
//! next job to reuse, subject to an idle timeout checked on checkout.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::connection::OpenAssociation;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    destination_id: uuid::Uuid,
    sop_class_uid: String,
    transfer_syntax_uid: String,
}

struct Idle {
    association: OpenAssociation,
    parked_at: Instant,
}

pub struct AssociationPool {
    idle_timeout: Duration,
    entries: Mutex<HashMap<PoolKey, Idle>>,
}

impl AssociationPool {
    pub fn new(idle_timeout: Duration) -> Self {
        AssociationPool { idle_timeout, entries: Mutex::new(HashMap::new()) }
    }

    /// Takes a still-fresh cached association for this key, if any. Stale
    /// entries are dropped (and aborted) rather than handed out.
    pub async fn checkout(
        &self,
        destination_id: uuid::Uuid,
        sop_class_uid: &str,
        transfer_syntax_uid: &str,
    ) -> Option<OpenAssociation> {
        let key = PoolKey {
            destination_id,
            sop_class_uid: sop_class_uid.to_string(),
            transfer_syntax_uid: transfer_syntax_uid.to_string(),
        };
        let mut entries = self.entries.lock().await;
        let idle = entries.remove(&key)?;
        if idle.parked_at.elapsed() >= self.idle_timeout {
            tokio::spawn(async move {
                let _ = idle.association.release().await;
            });
            return None;
        }
        Some(idle.association)
    }

    /// Parks a still-open association for a later job to reuse.
    pub async fn checkin(
        &self,
        destination_id: uuid::Uuid,
        sop_class_uid: &str,
        transfer_syntax_uid: &str,
        association: OpenAssociation,
    ) {
        let key = PoolKey {
            destination_id,
            sop_class_uid: sop_class_uid.to_string(),
            transfer_syntax_uid: transfer_syntax_uid.to_string(),
        };
        let mut entries = self.entries.lock().await;
        if let Some(previous) = entries.insert(key, Idle { association, parked_at: Instant::now() }) {
            tokio::spawn(async move {
                let _ = previous.association.release().await;
            });
        }
    }
}
