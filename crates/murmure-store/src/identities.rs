use rusqlite::{params, OptionalExtension};

use murmure_shared::types::{Fingerprint, OnionAddress};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Identity;

impl Database {
    pub fn insert_identity(&self, identity: &Identity) -> Result<()> {
        self.conn().execute(
            "INSERT INTO identities
                 (fingerprint, onion, public_ring, sealed_secret_ring, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                identity.fingerprint.as_str(),
                identity
                    .onion
                    .as_ref()
                    .map(|o| o.authority())
                    .unwrap_or_default(),
                identity.public_ring,
                identity.sealed_secret_ring,
                identity.is_active as i64,
                identity.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn active_identity(&self) -> Result<Option<Identity>> {
        self.conn()
            .query_row(
                "SELECT fingerprint, onion, public_ring, sealed_secret_ring, is_active, created_at
                 FROM identities WHERE is_active = 1 LIMIT 1",
                [],
                row_to_identity,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    /// Bind a published onion to the identity. Binding the same onion again
    /// is a no-op; a different one replaces the previous binding.
    pub fn bind_identity_onion(
        &self,
        fingerprint: &Fingerprint,
        onion: &OnionAddress,
    ) -> Result<Identity> {
        let affected = self.conn().execute(
            "UPDATE identities SET onion = ?2 WHERE fingerprint = ?1",
            params![fingerprint.as_str(), onion.authority()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }

        self.conn()
            .query_row(
                "SELECT fingerprint, onion, public_ring, sealed_secret_ring, is_active, created_at
                 FROM identities WHERE fingerprint = ?1",
                params![fingerprint.as_str()],
                row_to_identity,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }
}

fn row_to_identity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Identity> {
    let fp_str: String = row.get(0)?;
    let onion_str: String = row.get(1)?;

    let fingerprint = Fingerprint::parse(&fp_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let onion = if onion_str.is_empty() {
        None
    } else {
        Some(OnionAddress::parse(&onion_str).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?)
    };

    Ok(Identity {
        fingerprint,
        onion,
        public_ring: row.get(2)?,
        sealed_secret_ring: row.get(3)?,
        is_active: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
    })
}
