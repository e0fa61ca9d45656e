// 🔐 Sensitive Field Protection - reversible encryption of identifying values
//
// AES-256-GCM with a random nonce per value. The protected form is
// base64(nonce || ciphertext || tag), so the same plaintext protects to a
// different string every time.

use crate::error::{Result, VaultError};
use aws_lc_rs::aead::{Aad, Nonce, RandomizedNonceKey, AES_256_GCM, NONCE_LEN};
use base64::{prelude::BASE64_STANDARD, Engine};
use std::fmt;

pub const KEY_LEN: usize = 32;

/// Run-scoped protection key.
///
/// Built once when a pipeline starts and lent read-only to every worker.
/// Values protected with a generated key cannot be revealed after the
/// context is dropped unless [`ProtectionContext::export_key`] was kept.
pub struct ProtectionContext {
    key: RandomizedNonceKey,
    key_bytes: [u8; KEY_LEN],
}

impl ProtectionContext {
    /// Fresh key from the system RNG.
    pub fn generate() -> Result<Self> {
        let mut key_bytes = [0u8; KEY_LEN];
        aws_lc_rs::rand::fill(&mut key_bytes)
            .map_err(|_| VaultError::Protection("failed to generate key material".to_string()))?;
        Self::from_bytes(key_bytes)
    }

    /// Key supplied by configuration, base64 encoded.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|e| VaultError::Protection(format!("protection key is not base64: {}", e)))?;

        let key_bytes: [u8; KEY_LEN] = decoded.as_slice().try_into().map_err(|_| {
            VaultError::Protection(format!(
                "protection key must be {} bytes, got {}",
                KEY_LEN,
                decoded.len()
            ))
        })?;

        Self::from_bytes(key_bytes)
    }

    fn from_bytes(key_bytes: [u8; KEY_LEN]) -> Result<Self> {
        let key = RandomizedNonceKey::new(&AES_256_GCM, &key_bytes)
            .map_err(|_| VaultError::Protection("invalid AES-256-GCM key".to_string()))?;
        Ok(ProtectionContext { key, key_bytes })
    }

    /// Base64 form of the key, for configuration.
    pub fn export_key(&self) -> String {
        BASE64_STANDARD.encode(self.key_bytes)
    }

    pub fn protect(&self, plain: &str) -> Result<String> {
        let mut in_out = plain.as_bytes().to_vec();
        let nonce = self
            .key
            .seal_in_place_append_tag(Aad::empty(), &mut in_out)
            .map_err(|_| VaultError::Protection("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(nonce.as_ref());
        sealed.extend_from_slice(&in_out);

        Ok(BASE64_STANDARD.encode(sealed))
    }

    pub fn reveal(&self, protected: &str) -> Result<String> {
        let sealed = BASE64_STANDARD
            .decode(protected.trim())
            .map_err(|e| VaultError::Protection(format!("protected value is not base64: {}", e)))?;

        if sealed.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(VaultError::Protection(
                "protected value is too short".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| VaultError::Protection("invalid nonce".to_string()))?;

        let mut in_out = ciphertext.to_vec();
        let plain = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| {
                VaultError::Protection("value was not protected with this key".to_string())
            })?;

        String::from_utf8(plain.to_vec())
            .map_err(|e| VaultError::Protection(format!("revealed value is not UTF-8: {}", e)))
    }
}

impl fmt::Debug for ProtectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectionContext")
            .field("algorithm", &"AES-256-GCM")
            .finish_non_exhaustive()
    }
}
