//! Persistence of the primary hidden-service key.
//!
//! `hidden_service_key.enc` holds the `ED25519-V3` key blob sealed under the
//! device KEK as `"v1:" + base64(iv(12) || ct)`. The format is frozen; a file
//! without the prefix fails to unseal and is treated as absent after a warn.

use std::path::Path;

use murmure_shared::DeviceKek;
use tracing::warn;
use zeroize::Zeroizing;

use crate::error::Result;

pub const HS_KEY_FILE: &str = "hidden_service_key.enc";

/// Load the sealed key, if a valid file exists.
pub fn load_hs_key(path: &Path, kek: &DeviceKek) -> Result<Option<Zeroizing<String>>> {
    if !path.exists() {
        return Ok(None);
    }

    let sealed = std::fs::read_to_string(path)?;
    match kek.open(sealed.trim()) {
        Ok(plain) => {
            let key = String::from_utf8(plain.to_vec())
                .map(Zeroizing::new)
                .map_err(|_| murmure_shared::SealError::Unseal)?;
            Ok(Some(key))
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "discarding unreadable hidden-service key");
            Ok(None)
        }
    }
}

/// Seal and persist freshly issued key material (0600).
pub fn store_hs_key(path: &Path, kek: &DeviceKek, key_material: &str) -> Result<()> {
    let sealed = kek.seal(key_material.as_bytes())?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, sealed)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }

    Ok(())
}

pub fn delete_hs_key(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kek() -> DeviceKek {
        DeviceKek::from_bytes([0x33; 32])
    }

    #[test]
    fn store_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(HS_KEY_FILE);

        store_hs_key(&path, &kek(), "AAAbbbCCC0123456789").unwrap();
        let loaded = load_hs_key(&path, &kek()).unwrap().unwrap();
        assert_eq!(loaded.as_str(), "AAAbbbCCC0123456789");
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_hs_key(&dir.path().join(HS_KEY_FILE), &kek())
            .unwrap()
            .is_none());
    }

    #[test]
    fn unreadable_file_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(HS_KEY_FILE);
        std::fs::write(&path, "not a sealed blob").unwrap();
        assert!(load_hs_key(&path, &kek()).unwrap().is_none());
    }

    #[test]
    fn delete_is_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(HS_KEY_FILE);
        delete_hs_key(&path).unwrap();

        store_hs_key(&path, &kek(), "k").unwrap();
        delete_hs_key(&path).unwrap();
        assert!(!path.exists());
    }
}
