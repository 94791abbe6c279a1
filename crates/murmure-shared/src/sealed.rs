//! Device-bound sealing of small secrets.
//!
//! Format: `"v1:" + base64(iv(12) || AES-256-GCM ciphertext)`. The format is
//! frozen; payloads without the prefix or with an IV of any other length are
//! rejected outright.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::constants::{SEALED_BLOB_IV_LEN, SEALED_BLOB_PREFIX};

#[derive(Error, Debug)]
pub enum SealError {
    #[error("sealed blob missing version prefix")]
    MissingPrefix,

    #[error("sealed blob base64 invalid")]
    Base64,

    #[error("sealed blob truncated")]
    Truncated,

    #[error("unsealing failed")]
    Unseal,

    #[error("sealing failed")]
    Seal,

    #[error("key file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device key encryption key. Never leaves the device; everything persisted
/// in sealed form is wrapped by it.
#[derive(ZeroizeOnDrop)]
pub struct DeviceKek([u8; 32]);

impl DeviceKek {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Load the key file, creating it (0600) with fresh random bytes on first
    /// run.
    pub fn load_or_create(path: &std::path::Path) -> Result<Self, SealError> {
        if path.exists() {
            let raw = std::fs::read(path)?;
            let bytes: [u8; 32] = raw
                .as_slice()
                .try_into()
                .map_err(|_| SealError::Truncated)?;
            return Ok(Self(bytes));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        std::fs::write(path, bytes)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }

        Ok(Self(bytes))
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<String, SealError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0));

        let mut iv = [0u8; SEALED_BLOB_IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let ct = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| SealError::Seal)?;

        let mut framed = Vec::with_capacity(SEALED_BLOB_IV_LEN + ct.len());
        framed.extend_from_slice(&iv);
        framed.extend_from_slice(&ct);

        Ok(format!("{SEALED_BLOB_PREFIX}{}", B64.encode(&framed)))
    }

    pub fn open(&self, sealed: &str) -> Result<Zeroizing<Vec<u8>>, SealError> {
        let b64 = sealed
            .strip_prefix(SEALED_BLOB_PREFIX)
            .ok_or(SealError::MissingPrefix)?;
        let framed = B64.decode(b64).map_err(|_| SealError::Base64)?;
        if framed.len() <= SEALED_BLOB_IV_LEN {
            return Err(SealError::Truncated);
        }

        let (iv, ct) = framed.split_at(SEALED_BLOB_IV_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0));
        cipher
            .decrypt(Nonce::from_slice(iv), ct)
            .map(Zeroizing::new)
            .map_err(|_| SealError::Unseal)
    }
}
