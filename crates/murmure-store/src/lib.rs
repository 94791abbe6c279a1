pub mod contacts;
pub mod database;
pub mod identities;
pub mod invites;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod seal;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
pub use seal::{load_or_create_store_key, pin_kdf_params, PinParams, StoreKey};

#[cfg(test)]
pub(crate) mod test_support {
    use murmure_shared::exchange::ContactDraft;
    use murmure_shared::keyring::KeyRing;
    use murmure_shared::types::OnionAddress;
    use murmure_shared::DeviceKek;

    use crate::database::Database;
    use crate::seal::load_or_create_store_key;

    pub fn open_test_db() -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let kek = DeviceKek::from_bytes([0x42; 32]);
        let key = load_or_create_store_key(&dir.path().join("store.key"), &kek, None).unwrap();
        let db = Database::open_at(&dir.path().join("test.db"), &key).unwrap();
        (db, dir)
    }

    pub fn test_onion(fill: char) -> String {
        format!("{}.onion", fill.to_string().repeat(56))
    }

    pub fn draft_for(ring: &KeyRing, onion: Option<&str>) -> ContactDraft {
        ContactDraft {
            fingerprint: ring.fingerprint(),
            onion: onion.map(|o| OnionAddress::parse(o).unwrap()),
            public_ring: ring.public_ring().to_bytes(),
        }
    }
}
