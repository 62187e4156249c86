use std::fmt;
use std::path::Path;

use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::VaultError;

/// Device-local vault key. Never serialized, never transmitted.
#[derive(Clone, PartialEq, Eq)]
pub struct VaultKey([u8; 32]);

impl VaultKey {
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(hex_key: &str) -> Result<Self, VaultError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| VaultError::KeyUnavailable(format!("key is not hex: {e}")))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            VaultError::KeyUnavailable(format!("key must be 32 bytes, got {}", b.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Load the key from a hex file, creating one when the file does not exist.
    ///
    /// A file that exists but cannot be parsed is an error: replacing it would
    /// silently orphan the stored credential.
    pub async fn load_or_create(path: &Path) -> Result<Self, VaultError> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Self::from_hex(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = Self::generate();
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                write_private(path, hex::encode(key.0).as_bytes()).await?;
                info!(path = %path.display(), "Created new vault key");
                Ok(key)
            }
            Err(e) => Err(VaultError::KeyUnavailable(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VaultKey(<redacted>)")
    }
}

/// Create `path` readable by the owner only; it is never visible with wider
/// permissions. Fails if the file already exists.
async fn write_private(path: &Path, contents: &[u8]) -> Result<(), VaultError> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    Ok(())
}
