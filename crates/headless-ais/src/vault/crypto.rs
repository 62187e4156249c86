//! AES-256-CBC with PKCS#7 padding.

use aes::Aes256;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};

use crate::error::VaultError;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const IV_LEN: usize = 16;

/// Encrypt `plaintext` under `key` with a freshly generated IV.
///
/// Returns `(ciphertext, iv)`.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<(Vec<u8>, [u8; IV_LEN]), VaultError> {
    let iv: [u8; IV_LEN] = rand::random();
    let enc = Aes256CbcEnc::new_from_slices(key, &iv)
        .map_err(|e| VaultError::KeyUnavailable(format!("invalid key length: {e}")))?;
    Ok((enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext), iv))
}

pub fn decrypt(key: &[u8; 32], ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>, VaultError> {
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(VaultError::Decryption(format!(
            "ciphertext length {} is not a positive multiple of the block size",
            ciphertext.len()
        )));
    }
    let dec = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| VaultError::Decryption(format!("iv must be {IV_LEN} bytes, got {}", iv.len())))?;
    dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| VaultError::Decryption(format!("invalid padding: {e}")))
}
