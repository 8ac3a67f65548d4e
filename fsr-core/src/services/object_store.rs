//! Object storage for audio evidence
//!
//! `put` acknowledges only after the bytes are durable under their final
//! key. The filesystem store writes to a temporary name and renames, so a
//! failed or interrupted upload never leaves a truncated object behind a
//! valid key.

use async_trait::async_trait;
use fsr_common::{Error, Result};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tokio::sync::RwLock;

/// Acknowledgement of a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectAck {
    pub key: String,
    pub size_bytes: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key`, replacing any previous object
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<ObjectAck>;

    /// Whether an object exists under `key` right now
    async fn exists(&self, key: &str) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Locator recorded in the audio attachment
    fn url_for(&self, key: &str) -> String;
}

fn validate_key(key: &str) -> Result<()> {
    let path = Path::new(key);
    let safe = !key.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(())
    } else {
        Err(Error::Validation(format!("Invalid object key: {}", key)))
    }
}

/// Objects stored as files under `<root>/objects`
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<ObjectAck> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::TransientUpload(format!("Create {} failed: {}", parent.display(), e))
            })?;
        }

        let temp_path = path.with_extension("part");
        let write = async {
            tokio::fs::write(&temp_path, bytes).await?;
            let file = tokio::fs::OpenOptions::new().write(true).open(&temp_path).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp_path, &path).await
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(Error::TransientUpload(format!("Store {} failed: {}", key, e)));
        }

        tracing::debug!(key, size_bytes = bytes.len(), "Stored object");
        Ok(ObjectAck {
            key: key.to_string(),
            size_bytes: bytes.len() as u64,
        })
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("Object {}", key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", fsr_common::config::OBJECTS_DIR, key)
    }
}

/// In-process object store
///
/// Used for ephemeral servers and as the base of fault-injecting stores
/// in tests.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop an object out from under the record store
    pub async fn remove(&self, key: &str) -> bool {
        self.objects.write().await.remove(key).is_some()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<ObjectAck> {
        validate_key(key)?;
        self.objects
            .write()
            .await
            .insert(key.to_string(), bytes.to_vec());
        Ok(ObjectAck {
            key: key.to_string(),
            size_bytes: bytes.len() as u64,
        })
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Object {}", key)))
    }

    fn url_for(&self, key: &str) -> String {
        format!("memory://{}", key)
    }
}
