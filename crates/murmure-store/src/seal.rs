//! Store key management.
//!
//! The store's master passphrase is 32 random bytes generated on first open.
//! It is never written in the clear: the key file holds the passphrase sealed
//! under the device KEK, optionally wrapped first by a user PIN through
//! scrypt (memory-hard, N=2^15 r=8 p=1 dkLen=32). The scrypt parameters are
//! persisted next to the wrap so they can evolve without breaking old files.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use murmure_shared::constants::{PIN_KDF_DK_LEN, PIN_KDF_LOG_N, PIN_KDF_P, PIN_KDF_R};
use murmure_shared::DeviceKek;

use crate::error::{Result, StoreError};

const PIN_WRAP_NONCE_LEN: usize = 24;

/// Unlocked master passphrase. Reserved for page-level store encryption;
/// the buffer zeroizes on drop.
pub struct StoreKey(Zeroizing<[u8; 32]>);

impl StoreKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    v: u32,
    /// Device-sealed passphrase (possibly PIN-wrapped first).
    sealed: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pin: Option<PinParams>,
}

/// scrypt parameters of the PIN wrap. Recorded next to the wrap so they can
/// evolve without breaking old key files, and mirrored into the preference
/// namespace when PIN mode is on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinParams {
    pub salt: String,
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
}

/// The PIN KDF parameters recorded in the key file, if PIN mode is enabled.
pub fn pin_kdf_params(path: &std::path::Path) -> Result<Option<PinParams>> {
    if !path.exists() {
        return Ok(None);
    }
    let json = std::fs::read_to_string(path)?;
    let file: KeyFile =
        serde_json::from_str(&json).map_err(|e| StoreError::KeyFile(e.to_string()))?;
    Ok(file.pin)
}

/// Load the store key, creating it on first run.
///
/// `pin` must be `Some` iff the key file is PIN-wrapped (or is being created
/// in PIN mode).
pub fn load_or_create_store_key(
    path: &std::path::Path,
    kek: &DeviceKek,
    pin: Option<&str>,
) -> Result<StoreKey> {
    if path.exists() {
        return unlock_store_key(path, kek, pin);
    }

    let mut passphrase = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut *passphrase);

    let (payload, pin_params) = match pin {
        None => (Zeroizing::new(passphrase.to_vec()), None),
        Some(pin) => {
            let mut salt = [0u8; 16];
            OsRng.fill_bytes(&mut salt);
            let params = PinParams {
                salt: B64.encode(salt),
                log_n: PIN_KDF_LOG_N,
                r: PIN_KDF_R,
                p: PIN_KDF_P,
            };
            (
                Zeroizing::new(pin_wrap(&passphrase[..], pin, &params)?),
                Some(params),
            )
        }
    };

    let sealed = kek.seal(&payload)?;
    let file = KeyFile {
        v: 1,
        sealed,
        pin: pin_params,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string(&file).map_err(|e| StoreError::KeyFile(e.to_string()))?;
    std::fs::write(path, json)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }

    Ok(StoreKey(passphrase))
}

fn unlock_store_key(
    path: &std::path::Path,
    kek: &DeviceKek,
    pin: Option<&str>,
) -> Result<StoreKey> {
    let json = std::fs::read_to_string(path)?;
    let file: KeyFile =
        serde_json::from_str(&json).map_err(|e| StoreError::KeyFile(e.to_string()))?;
    if file.v != 1 {
        return Err(StoreError::KeyFile(format!("unknown key file v{}", file.v)));
    }

    let payload = kek.open(&file.sealed)?;

    let passphrase: Zeroizing<Vec<u8>> = match (&file.pin, pin) {
        (None, _) => Zeroizing::new(payload.to_vec()),
        (Some(_), None) => return Err(StoreError::PinRequired),
        (Some(params), Some(pin)) => pin_unwrap(&payload, pin, params)?,
    };

    let bytes: [u8; 32] = passphrase
        .as_slice()
        .try_into()
        .map_err(|_| StoreError::KeyFile("passphrase length".into()))?;
    Ok(StoreKey(Zeroizing::new(bytes)))
}

fn derive_pin_key(pin: &str, params: &PinParams) -> Result<Zeroizing<[u8; 32]>> {
    let salt = B64
        .decode(&params.salt)
        .map_err(|_| StoreError::KeyFile("pin salt".into()))?;
    let scrypt_params = scrypt::Params::new(params.log_n, params.r, params.p, PIN_KDF_DK_LEN)
        .map_err(|e| StoreError::KeyFile(e.to_string()))?;

    let mut key = Zeroizing::new([0u8; 32]);
    scrypt::scrypt(pin.as_bytes(), &salt, &scrypt_params, key.as_mut())
        .map_err(|e| StoreError::KeyFile(e.to_string()))?;
    Ok(key)
}

fn pin_wrap(passphrase: &[u8], pin: &str, params: &PinParams) -> Result<Vec<u8>> {
    let key = derive_pin_key(pin, params)?;
    let cipher = XChaCha20Poly1305::new((&*key).into());

    let mut nonce = [0u8; PIN_WRAP_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let mut ct = cipher
        .encrypt(XNonce::from_slice(&nonce), passphrase)
        .map_err(|_| StoreError::KeyFile("pin wrap".into()))?;

    let mut out = Vec::with_capacity(PIN_WRAP_NONCE_LEN + ct.len());
    out.extend_from_slice(&nonce);
    out.append(&mut ct);
    Ok(out)
}

fn pin_unwrap(wrapped: &[u8], pin: &str, params: &PinParams) -> Result<Zeroizing<Vec<u8>>> {
    if wrapped.len() <= PIN_WRAP_NONCE_LEN {
        return Err(StoreError::KeyFile("pin wrap truncated".into()));
    }
    let (nonce, ct) = wrapped.split_at(PIN_WRAP_NONCE_LEN);

    let key = derive_pin_key(pin, params)?;
    let cipher = XChaCha20Poly1305::new((&*key).into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ct)
        .map(Zeroizing::new)
        .map_err(|_| StoreError::WrongPin)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kek() -> DeviceKek {
        DeviceKek::from_bytes([0x11; 32])
    }

    #[test]
    fn create_then_unlock_without_pin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.key");

        let first = load_or_create_store_key(&path, &kek(), None).unwrap();
        let second = load_or_create_store_key(&path, &kek(), None).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn pin_mode_requires_pin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.key");

        let created = load_or_create_store_key(&path, &kek(), Some("1234")).unwrap();

        assert!(matches!(
            load_or_create_store_key(&path, &kek(), None),
            Err(StoreError::PinRequired)
        ));
        assert!(matches!(
            load_or_create_store_key(&path, &kek(), Some("9999")),
            Err(StoreError::WrongPin)
        ));

        let unlocked = load_or_create_store_key(&path, &kek(), Some("1234")).unwrap();
        assert_eq!(created.as_bytes(), unlocked.as_bytes());
    }

    #[test]
    fn pin_params_readable_without_unlocking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.key");

        assert!(pin_kdf_params(&path).unwrap().is_none());

        load_or_create_store_key(&path, &kek(), None).unwrap();
        assert!(pin_kdf_params(&path).unwrap().is_none());

        let pin_path = dir.path().join("store-pin.key");
        load_or_create_store_key(&pin_path, &kek(), Some("1234")).unwrap();
        let params = pin_kdf_params(&pin_path).unwrap().unwrap();
        assert_eq!(params.log_n, PIN_KDF_LOG_N);
        assert_eq!(params.r, PIN_KDF_R);
        assert_eq!(params.p, PIN_KDF_P);
        assert!(!params.salt.is_empty());
    }

    #[test]
    fn wrong_device_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.key");

        load_or_create_store_key(&path, &kek(), None).unwrap();
        let other = DeviceKek::from_bytes([0x22; 32]);
        assert!(load_or_create_store_key(&path, &other, None).is_err());
    }
}
