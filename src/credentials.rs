//! Storage for the paired account's opaque credential blob, so a restart can
//! reconnect without scanning a new challenge. The blob's format belongs to
//! the transport; it is stored byte for byte.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Mutex;

const BLOB_FILE: &str = "session.blob";

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Credential storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<Vec<u8>>, CredentialError>;
    async fn save(&self, blob: &[u8]) -> Result<(), CredentialError>;
    /// Forget stored credentials (e.g. after the remote side rejected them)
    async fn clear(&self) -> Result<(), CredentialError>;
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Vec<u8>>> {
        self.blob.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<Vec<u8>>, CredentialError> {
        Ok(self.slot().clone())
    }

    async fn save(&self, blob: &[u8]) -> Result<(), CredentialError> {
        *self.slot() = Some(blob.to_vec());
        Ok(())
    }

    async fn clear(&self) -> Result<(), CredentialError> {
        self.slot().take();
        Ok(())
    }
}

/// Keeps the blob in a file inside a dedicated directory
#[derive(Debug, Clone)]
pub struct DirCredentialStore {
    dir: PathBuf,
}

impl DirCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self) -> PathBuf {
        self.dir.join(BLOB_FILE)
    }
}

#[async_trait]
impl CredentialStore for DirCredentialStore {
    async fn load(&self) -> Result<Option<Vec<u8>>, CredentialError> {
        match tokio::fs::read(self.path()).await {
            Ok(blob) if blob.is_empty() => Ok(None),
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, blob: &[u8]) -> Result<(), CredentialError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        // Write-then-rename: readers never observe a partial blob
        let tmp = self.dir.join(format!("{}.tmp", BLOB_FILE));
        tokio::fs::write(&tmp, blob).await?;
        tokio::fs::rename(&tmp, self.path()).await?;
        tracing::debug!("Stored session credentials in {}", self.dir.display());
        Ok(())
    }

    async fn clear(&self) -> Result<(), CredentialError> {
        match tokio::fs::remove_file(self.path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dir_store_round_trip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirCredentialStore::new(dir.path().join("auth"));

        assert_eq!(store.load().await.unwrap(), None);
        store.save(b"opaque-session").await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(b"opaque-session".to_vec()));

        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
        // Clearing twice is fine
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryCredentialStore::new();
        store.save(b"x").await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(b"x".to_vec()));
        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }
}
