//! Durable object storage for derived artifacts and uploaded masters.
//!
//! The pipeline consumes storage through the [`ObjectStore`] trait; the
//! filesystem implementation below is the default deployment. Artifact keys
//! are content-addressed (`{track_id}/{artifact_key}/{checksum}.{ext}`) so a
//! duplicate write from a retried job that lost a race is a harmless orphan.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid storage key: {0}")]
    InvalidKey(String),
}

/// Durable object storage.
///
/// `put` returns a locator that `get`/`delete` accept later. For the
/// filesystem store the locator is the key itself.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, StorageError>;

    async fn get(&self, locator: &str) -> Result<Vec<u8>, StorageError>;

    async fn delete(&self, locator: &str) -> Result<(), StorageError>;
}

/// SHA-256 checksum of a byte slice, hex encoded.
pub fn checksum_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Canonical storage key for a derived artifact.
pub fn artifact_object_key(track_id: &str, artifact_key: &str, checksum: &str, ext: &str) -> String {
    format!("{}/{}/{}.{}", track_id, artifact_key, checksum, ext)
}

/// Reject keys that could escape the storage root.
fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty()
        || key.starts_with('/')
        || key.contains('\0')
        || key.split('/').any(|c| c.is_empty() || c == "." || c == "..")
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Filesystem-backed object store rooted at the media directory.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Absolute path of a stored object.
    pub fn path_of(&self, locator: &str) -> PathBuf {
        self.root.join(locator)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, StorageError> {
        validate_key(key)?;
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        }

        let mut file = fs::File::create(&path)
            .await
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        file.write_all(bytes)
            .await
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;

        Ok(key.to_string())
    }

    async fn get(&self, locator: &str) -> Result<Vec<u8>, StorageError> {
        validate_key(locator)?;
        let path = self.root.join(locator);
        if !path.exists() {
            return Err(StorageError::NotFound(locator.to_string()));
        }
        fs::read(&path)
            .await
            .map_err(|e| StorageError::ReadFailed(e.to_string()))
    }

    async fn delete(&self, locator: &str) -> Result<(), StorageError> {
        validate_key(locator)?;
        let path = self.root.join(locator);
        if path.exists() {
            fs::remove_file(&path)
                .await
                .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        }
        Ok(())
    }
}

/// In-memory object store, for tests and ephemeral deployments.
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, StorageError> {
        validate_key(key)?;
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes.to_vec());
        Ok(key.to_string())
    }

    async fn get(&self, locator: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .lock()
            .unwrap()
            .get(locator)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(locator.to_string()))
    }

    async fn delete(&self, locator: &str) -> Result<(), StorageError> {
        self.objects.lock().unwrap().remove(locator);
        Ok(())
    }
}

/// Persist an uploaded master file under `masters/{track_id}/`, named by a
/// fresh UUID so re-uploads never clobber each other.
pub async fn save_master(
    media_root: &Path,
    track_id: &str,
    extension: &str,
    bytes: &[u8],
) -> Result<PathBuf, StorageError> {
    validate_key(track_id)?;
    validate_key(extension)?;

    let dir = media_root.join("masters").join(track_id);
    fs::create_dir_all(&dir)
        .await
        .map_err(|e| StorageError::WriteFailed(e.to_string()))?;

    let path = dir.join(format!("{}.{}", uuid::Uuid::new_v4(), extension));
    fs::write(&path, bytes)
        .await
        .map_err(|e| StorageError::WriteFailed(e.to_string()))?;

    Ok(path)
}
