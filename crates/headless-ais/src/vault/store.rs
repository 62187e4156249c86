//! Credential persistence abstraction.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::Credential;
use crate::error::VaultError;

/// Where the encrypted credential lives. Holds at most one entry.
#[async_trait]
pub trait VaultStore: Send + Sync {
    async fn read(&self) -> Result<Option<Credential>, VaultError>;

    async fn write(&self, credential: &Credential) -> Result<(), VaultError>;

    /// Remove the entry. Removing an absent entry is not an error.
    async fn remove(&self) -> Result<(), VaultError>;
}

/// In-memory store, lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryVaultStore {
    entry: Mutex<Option<Credential>>,
}

impl MemoryVaultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VaultStore for MemoryVaultStore {
    async fn read(&self) -> Result<Option<Credential>, VaultError> {
        Ok(self.entry.lock().clone())
    }

    async fn write(&self, credential: &Credential) -> Result<(), VaultError> {
        *self.entry.lock() = Some(credential.clone());
        Ok(())
    }

    async fn remove(&self) -> Result<(), VaultError> {
        self.entry.lock().take();
        Ok(())
    }
}

/// JSON file store.
///
/// Writes go to a sibling temp file which is then renamed over the target, so
/// a crash never leaves a half-written credential behind.
#[derive(Debug, Clone)]
pub struct FileVaultStore {
    path: PathBuf,
}

impl FileVaultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl VaultStore for FileVaultStore {
    async fn read(&self) -> Result<Option<Credential>, VaultError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, credential: &Credential) -> Result<(), VaultError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(credential)?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            VaultError::Storage(format!("cannot replace {}: {e}", self.path.display()))
        })?;
        debug!(path = %self.path.display(), "Persisted credential");
        Ok(())
    }

    async fn remove(&self) -> Result<(), VaultError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Credential {
        Credential {
            identifier: "110000000".to_string(),
            ciphertext: vec![1; 16],
            iv: vec![2; 16],
        }
    }

    #[tokio::test]
    async fn file_store_persists_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileVaultStore::new(dir.path().join("nested").join("credential.json"));

        assert!(store.read().await.unwrap().is_none());
        store.write(&sample()).await.unwrap();
        assert_eq!(store.read().await.unwrap(), Some(sample()));
        assert!(!store.temp_path().exists());

        store.remove().await.unwrap();
        store.remove().await.unwrap();
        assert!(store.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_persists_base64_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileVaultStore::new(dir.path().join("credential.json"));
        store.write(&sample()).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw["identifier"], "110000000");
        assert_eq!(raw["iv"], "AgICAgICAgICAgICAgICAg==");
    }

    #[tokio::test]
    async fn corrupt_file_is_a_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileVaultStore::new(dir.path().join("credential.json"));
        tokio::fs::write(store.path(), b"{").await.unwrap();
        assert!(matches!(store.read().await, Err(VaultError::Json(_))));
    }
}
