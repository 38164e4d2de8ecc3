//! Object Store: a content-preserving filesystem layout
//! that owns every received DICOM object as an opaque byte blob, addressed
//! by (study UID, series UID, instance UID).
//!
//! Nothing in this crate parses DICOM. The bytes that arrive are the bytes
//! that are written, byte for byte, including the 128-byte preamble and the
//! "DICM" magic; this crate's only job is to make that durable and give it
//! back unchanged.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The final path already holds a different object under the same UID.
    #[error("instance {instance_uid} already stored with a different content hash")]
    HashConflict { instance_uid: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of [`ObjectStore::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The scratch file was renamed into place as a new object.
    Published,
    /// An object already existed at the final path with a matching hash;
    /// the scratch file was discarded and this is treated as success.
    IdempotentDuplicate,
}

/// A scratch-area write in progress: bytes are hashed as they are written
/// so that finishing the write requires no re-read of the file.
pub struct ScratchWriter {
    path: PathBuf,
    file: tokio::fs::File,
    hasher: Sha256,
    len: u64,
}

/// A completed, durable scratch write, ready to be published.
pub struct ScratchHandle {
    pub path: PathBuf,
    pub byte_length: u64,
    pub content_hash: String,
}

impl ScratchWriter {
    pub async fn write_chunk(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.file.write_all(buf).await?;
        self.hasher.update(buf);
        self.len += buf.len() as u64;
        Ok(())
    }

    /// Flushes and fsyncs the scratch file's bytes and returns a handle
    /// describing what was written. Does not yet make the object visible
    /// under its final path; call [`ObjectStore::publish`] for that.
    pub async fn finish(mut self) -> std::io::Result<ScratchHandle> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(ScratchHandle {
            path: self.path,
            byte_length: self.len,
            content_hash: hex::encode(self.hasher.finalize()),
        })
    }

    /// Abandons the write and removes the scratch file, e.g. because the
    /// association or association-object failed before `finish`.
    pub async fn abort(self) -> std::io::Result<()> {
        drop(self.file);
        tokio::fs::remove_file(&self.path).await
    }
}

/// Owns the `<data-root>/storage` and `<data-root>/tmp` trees.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    data_root: PathBuf,
}

impl ObjectStore {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        ObjectStore {
            data_root: data_root.into(),
        }
    }

    fn storage_root(&self) -> PathBuf {
        self.data_root.join("storage").join("studies")
    }

    fn tmp_root(&self, worker_id: &str) -> PathBuf {
        self.data_root.join("tmp").join(sanitize(worker_id))
    }

    /// Path of a published instance. Callers may assume immutability once
    /// this path exists.
    pub fn final_path(&self, study_uid: &str, series_uid: &str, instance_uid: &str) -> PathBuf {
        self.storage_root()
            .join(sanitize(study_uid))
            .join(sanitize(series_uid))
            .join(sanitize(instance_uid))
    }

    /// Allocates a fresh scratch file in this worker's partition of the
    /// scratch area, ready to receive streamed bytes.
    pub async fn open_scratch(&self, worker_id: &str) -> std::io::Result<ScratchWriter> {
        let dir = self.tmp_root(worker_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(uuid_like_name());
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        set_owner_only_permissions(&path).await?;
        Ok(ScratchWriter {
            path,
            file,
            hasher: Sha256::new(),
            len: 0,
        })
    }

    /// Durable publish: rename the scratch file atomically into its final
    /// path, then fsync the file
    /// and its containing directory. If an object already sits at the final
    /// path, treat a matching hash as idempotent success and a mismatching
    /// one as a conflict, leaving both files in place for the caller to
    /// report.
    pub async fn publish(
        &self,
        handle: ScratchHandle,
        study_uid: &str,
        series_uid: &str,
        instance_uid: &str,
    ) -> Result<PublishOutcome> {
        let final_path = self.final_path(study_uid, series_uid, instance_uid);

        if let Some(existing_hash) = hash_if_exists(&final_path).await? {
            tokio::fs::remove_file(&handle.path).await?;
            if existing_hash == handle.content_hash {
                return Ok(PublishOutcome::IdempotentDuplicate);
            }
            return Err(StoreError::HashConflict {
                instance_uid: instance_uid.to_string(),
            });
        }

        let parent = final_path.parent().expect("final_path has a parent");
        tokio::fs::create_dir_all(parent).await?;

        tokio::fs::rename(&handle.path, &final_path).await?;

        let file = tokio::fs::File::open(&final_path).await?;
        file.sync_all().await?;
        sync_dir(parent).await?;

        Ok(PublishOutcome::Published)
    }

    /// Opens a published instance for streaming reads (the Forwarder's path
    /// to the exact bytes it retransmits).
    pub async fn open_read(&self, study_uid: &str, series_uid: &str, instance_uid: &str) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::open(self.final_path(study_uid, series_uid, instance_uid)).await
    }

    /// Removes scratch files older than `horizon` across all worker
    /// partitions. Invoked by the Supervisor; never touches the published
    /// tree.
    pub async fn sweep_scratch(&self, horizon: std::time::Duration) -> std::io::Result<usize> {
        let tmp_root = self.data_root.join("tmp");
        let mut swept = 0;
        let mut worker_dirs = match tokio::fs::read_dir(&tmp_root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let now = std::time::SystemTime::now();
        while let Some(worker_dir) = worker_dirs.next_entry().await? {
            if !worker_dir.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(worker_dir.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let modified = entry.metadata().await?.modified()?;
                let age = now.duration_since(modified).unwrap_or_default();
                if age >= horizon {
                    tokio::fs::remove_file(entry.path()).await?;
                    swept += 1;
                }
            }
        }
        Ok(swept)
    }
}

async fn hash_if_exists(path: &Path) -> std::io::Result<Option<String>> {
    use tokio::io::AsyncReadExt;

    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Some(hex::encode(hasher.finalize())))
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
async fn set_owner_only_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn set_owner_only_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn uuid_like_name() -> String {
    // A random scratch filename; collisions are astronomically unlikely and
    // `create_new` makes them detectable regardless.
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Restricts a UID to filesystem-safe characters. DICOM UIDs are dotted
/// decimal strings ([0-9.]) by standard, but this defensively rejects
/// anything that could escape the intended directory.
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "_".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn publish_then_read_round_trips_bytes() {
        let (_dir, store) = store();
        let payload = b"some DICOM-shaped bytes";

        let mut writer = store.open_scratch("worker-a").await.unwrap();
        writer.write_chunk(payload).await.unwrap();
        let handle = writer.finish().await.unwrap();
        assert_eq!(handle.byte_length, payload.len() as u64);

        let outcome = store
            .publish(handle, "1.2.3.S", "1.2.3.S.1", "1.2.3.S.1.1")
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Published);

        use tokio::io::AsyncReadExt;
        let mut file = store
            .open_read("1.2.3.S", "1.2.3.S.1", "1.2.3.S.1.1")
            .await
            .unwrap();
        let mut read_back = Vec::new();
        file.read_to_end(&mut read_back).await.unwrap();
        assert_eq!(read_back, payload);
    }

    #[tokio::test]
    async fn duplicate_publish_with_matching_hash_is_idempotent() {
        let (_dir, store) = store();
        let payload = b"identical bytes";

        for _ in 0..2 {
            let mut writer = store.open_scratch("worker-a").await.unwrap();
            writer.write_chunk(payload).await.unwrap();
            let handle = writer.finish().await.unwrap();
            store
                .publish(handle, "1.2.3.S", "1.2.3.S.1", "1.2.3.S.1.2")
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn duplicate_publish_with_differing_hash_conflicts() {
        let (_dir, store) = store();

        let mut writer = store.open_scratch("worker-a").await.unwrap();
        writer.write_chunk(b"first version").await.unwrap();
        let handle = writer.finish().await.unwrap();
        store
            .publish(handle, "1.2.3.S", "1.2.3.S.1", "1.2.3.S.1.3")
            .await
            .unwrap();

        let mut writer = store.open_scratch("worker-a").await.unwrap();
        writer.write_chunk(b"different version!!").await.unwrap();
        let handle = writer.finish().await.unwrap();
        let err = store
            .publish(handle, "1.2.3.S", "1.2.3.S.1", "1.2.3.S.1.3")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::HashConflict { .. }));
    }

    #[tokio::test]
    async fn sweep_scratch_removes_only_old_orphans() {
        let (_dir, store) = store();
        let writer = store.open_scratch("worker-a").await.unwrap();
        let handle = writer.finish().await.unwrap();
        assert!(tokio::fs::metadata(&handle.path).await.is_ok());

        let swept = store.sweep_scratch(std::time::Duration::from_secs(3600)).await.unwrap();
        assert_eq!(swept, 0);
        assert!(tokio::fs::metadata(&handle.path).await.is_ok());

        let swept = store.sweep_scratch(std::time::Duration::ZERO).await.unwrap();
        assert_eq!(swept, 1);
        assert!(tokio::fs::metadata(&handle.path).await.is_err());
    }

    #[test]
    fn sanitize_rejects_path_traversal() {
        assert_eq!(sanitize(".."), "_");
        assert_eq!(sanitize("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize("1.2.840.10008.5.1.4.1.1.2"), "1.2.840.10008.5.1.4.1.1.2");
    }
}
