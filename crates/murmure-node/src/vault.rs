//! Identity vault.
//!
//! Generates the device key ring on first run and serves it afterwards. The
//! secret ring is sealed under the device KEK before it ever reaches the
//! store; unsealing happens on demand at the crypto boundary and the
//! plaintext is dropped (and zeroized) immediately after use.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;
use zeroize::Zeroizing;

use murmure_shared::keyring::KeyRing;
use murmure_shared::types::OnionAddress;
use murmure_shared::DeviceKek;
use murmure_store::{Database, Identity};

use crate::error::{NodeError, Result};
use crate::util::now_ms;

pub struct IdentityVault {
    db: Arc<Mutex<Database>>,
    kek: Arc<DeviceKek>,
}

impl IdentityVault {
    pub fn new(db: Arc<Mutex<Database>>, kek: Arc<DeviceKek>) -> Self {
        Self { db, kek }
    }

    /// Return the active identity, generating one on first run.
    pub async fn ensure_identity(&self) -> Result<Identity> {
        let db = self.db.lock().await;
        if let Some(identity) = db.active_identity()? {
            return Ok(identity);
        }

        let ring = KeyRing::generate();
        let secret = ring.secret_ring_bytes();
        let sealed_secret_ring = self.kek.seal(&secret)?;

        let identity = Identity {
            fingerprint: ring.fingerprint(),
            onion: None,
            public_ring: ring.public_ring().to_bytes(),
            sealed_secret_ring,
            is_active: true,
            created_at: now_ms(),
        };
        db.insert_identity(&identity)?;

        info!(fingerprint = identity.fingerprint.short(), "generated device identity");
        Ok(identity)
    }

    pub async fn active_identity(&self) -> Result<Option<Identity>> {
        Ok(self.db.lock().await.active_identity()?)
    }

    /// Bind a published onion. Re-binding the same onion is a no-op; any
    /// valid v3 onion replaces the previous one. Invalid input fails before
    /// the store is touched.
    pub async fn bind_onion(&self, onion: &str) -> Result<Identity> {
        let onion = OnionAddress::parse(onion)?;

        let db = self.db.lock().await;
        let identity = db.active_identity()?.ok_or(NodeError::NoIdentity)?;
        Ok(db.bind_identity_onion(&identity.fingerprint, &onion)?)
    }

    pub async fn has_valid_onion(&self) -> bool {
        matches!(
            self.db.lock().await.active_identity(),
            Ok(Some(Identity { onion: Some(_), .. }))
        )
    }

    /// Decrypt the sealed secret ring for one crypto operation. The returned
    /// buffer zeroizes on drop; callers must not cache it.
    pub fn unseal_secret_ring(&self, identity: &Identity) -> Result<Zeroizing<Vec<u8>>> {
        Ok(self.kek.open(&identity.sealed_secret_ring)?)
    }
}
