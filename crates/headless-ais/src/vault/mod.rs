//! Credential vault.
//!
//! The account secret is kept only as AES-256-CBC ciphertext under a
//! device-local key. It is decrypted on demand by the login state machine and
//! the plaintext is dropped as soon as the login form has been submitted.

mod crypto;
mod key;
mod store;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::VaultError;

pub use key::VaultKey;
pub use store::{FileVaultStore, MemoryVaultStore, VaultStore};

/// Encrypted credential as persisted on the device.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub identifier: String,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identifier", &self.identifier)
            .field("ciphertext_len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

/// A decrypted credential. Debug output never shows the secret.
pub struct UnlockedCredential {
    pub identifier: String,
    pub secret: String,
}

impl fmt::Debug for UnlockedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnlockedCredential")
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .finish()
    }
}

mod b64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(de::Error::custom)
    }
}

/// Encrypts, persists and unlocks the single stored credential.
pub struct CredentialVault {
    /// `None` when the device key could not be loaded; every unlock then fails
    /// as unusable.
    key: Option<VaultKey>,
    store: Arc<dyn VaultStore>,
}

impl CredentialVault {
    pub fn new(key: VaultKey, store: Arc<dyn VaultStore>) -> Self {
        Self {
            key: Some(key),
            store,
        }
    }

    /// A vault whose key is unavailable. Stored credentials stay on disk until
    /// unlocked (and then cleared) or explicitly removed.
    pub fn without_key(store: Arc<dyn VaultStore>) -> Self {
        Self { key: None, store }
    }

    /// Ephemeral vault with a random key, for tests and one-shot sessions.
    pub fn in_memory() -> Self {
        Self::new(VaultKey::generate(), Arc::new(MemoryVaultStore::new()))
    }

    fn key(&self) -> Result<&VaultKey, VaultError> {
        self.key
            .as_ref()
            .ok_or_else(|| VaultError::KeyUnavailable("no device key loaded".to_string()))
    }

    /// Encrypt and persist `secret`, replacing any previous entry.
    #[instrument(skip(self, secret))]
    pub async fn store(&self, identifier: &str, secret: &str) -> Result<Credential, VaultError> {
        let (ciphertext, iv) = crypto::encrypt(self.key()?.as_bytes(), secret.as_bytes())?;
        let credential = Credential {
            identifier: identifier.to_string(),
            ciphertext,
            iv: iv.to_vec(),
        };
        self.store.write(&credential).await?;
        info!("Stored encrypted credential");
        Ok(credential)
    }

    /// Decrypt a credential. Any failure means the credential is unusable.
    pub fn unlock(&self, credential: &Credential) -> Result<String, VaultError> {
        let plaintext = crypto::decrypt(
            self.key()?.as_bytes(),
            &credential.ciphertext,
            &credential.iv,
        )?;
        String::from_utf8(plaintext)
            .map_err(|_| VaultError::Decryption("plaintext is not UTF-8".to_string()))
    }

    pub async fn load(&self) -> Result<Option<Credential>, VaultError> {
        self.store.read().await
    }

    /// Load and decrypt the stored credential.
    ///
    /// An entry that cannot be parsed or decrypted is removed before the error
    /// is returned.
    pub async fn unlock_stored(&self) -> Result<Option<UnlockedCredential>, VaultError> {
        let credential = match self.store.read().await {
            Ok(Some(credential)) => credential,
            Ok(None) => return Ok(None),
            Err(err @ VaultError::Json(_)) => {
                warn!(error = %err, "Stored credential is corrupt, clearing");
                self.clear().await?;
                return Err(VaultError::Decryption(err.to_string()));
            }
            Err(err) => return Err(err),
        };

        match self.unlock(&credential) {
            Ok(secret) => Ok(Some(UnlockedCredential {
                identifier: credential.identifier,
                secret,
            })),
            Err(err) if err.is_unusable() => {
                warn!(
                    identifier = %credential.identifier,
                    error = %err,
                    "Stored credential cannot be decrypted, clearing"
                );
                self.clear().await?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn clear(&self) -> Result<(), VaultError> {
        self.store.remove().await?;
        info!("Cleared stored credential");
        Ok(())
    }
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault")
            .field("has_key", &self.key.is_some())
            .finish_non_exhaustive()
    }
}
