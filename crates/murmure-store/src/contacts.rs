//! Contact rows: TOFU insert, pinned-field protection, pending-change
//! reconciliation.
//!
//! `upsert_merge_safe` is the only write path an imported contact may take,
//! and it runs as a single transaction so the TOFU/pending decision is atomic
//! with respect to concurrent readers.

use rusqlite::{params, OptionalExtension};

use murmure_shared::exchange::ContactDraft;
use murmure_shared::types::{ChangeState, Fingerprint, OnionAddress, TrustLevel};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Contact, UpsertOutcome};

impl Database {
    pub fn contact_by_fp(&self, fingerprint: &Fingerprint) -> Result<Option<Contact>> {
        self.conn()
            .query_row(
                &format!("{SELECT_CONTACT} WHERE fingerprint = ?1"),
                params![fingerprint.as_str()],
                row_to_contact,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("{SELECT_CONTACT} ORDER BY created_at ASC"))?;
        let rows = stmt.query_map([], row_to_contact)?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row?);
        }
        Ok(contacts)
    }

    /// Merge an imported contact without ever weakening established trust.
    ///
    /// - unknown fingerprint: insert as Unverified (TOFU).
    /// - known + identical fields: no-op.
    /// - known + Unverified: refresh the differing fields in place.
    /// - known + Verified: pinned fields stay; divergence lands in the
    ///   pending slots and flips `change_state`.
    pub fn upsert_merge_safe(&self, draft: &ContactDraft, now: i64) -> Result<UpsertOutcome> {
        let tx = self.conn().unchecked_transaction()?;

        let existing = tx
            .query_row(
                &format!("{SELECT_CONTACT} WHERE fingerprint = ?1"),
                params![draft.fingerprint.as_str()],
                row_to_contact,
            )
            .optional()?;

        let outcome = match existing {
            None => {
                tx.execute(
                    "INSERT INTO contacts
                         (fingerprint, onion, public_ring, display_name, trust_level,
                          change_state, pending_onion, pending_public_ring, created_at)
                     VALUES (?1, ?2, ?3, NULL, ?4, ?5, NULL, NULL, ?6)",
                    params![
                        draft.fingerprint.as_str(),
                        draft.onion.as_ref().map(|o| o.authority()),
                        draft.public_ring,
                        TrustLevel::Unverified.as_str(),
                        ChangeState::None.as_str(),
                        now,
                    ],
                )?;
                UpsertOutcome::Inserted
            }
            Some(existing) => {
                let key_changed = draft.public_ring != existing.public_ring;
                // A card without an onion makes no claim about the address.
                let onion_changed = match &draft.onion {
                    None => false,
                    Some(incoming) => existing.onion.as_ref() != Some(incoming),
                };

                if !key_changed && !onion_changed {
                    UpsertOutcome::NoChange
                } else if existing.trust_level != TrustLevel::Verified {
                    tx.execute(
                        "UPDATE contacts SET
                             onion = COALESCE(?2, onion),
                             public_ring = ?3,
                             change_state = ?4,
                             pending_onion = NULL,
                             pending_public_ring = NULL
                         WHERE fingerprint = ?1",
                        params![
                            existing.fingerprint.as_str(),
                            draft.onion.as_ref().map(|o| o.authority()),
                            draft.public_ring,
                            ChangeState::None.as_str(),
                        ],
                    )?;
                    UpsertOutcome::UpdatedUnverified
                } else {
                    let mut state = existing.change_state;
                    if key_changed {
                        state = state.with_key_changed();
                    }
                    if onion_changed {
                        state = state.with_onion_changed();
                    }
                    tx.execute(
                        "UPDATE contacts SET
                             change_state = ?2,
                             pending_onion = COALESCE(?3, pending_onion),
                             pending_public_ring = COALESCE(?4, pending_public_ring)
                         WHERE fingerprint = ?1",
                        params![
                            existing.fingerprint.as_str(),
                            state.as_str(),
                            if onion_changed {
                                draft.onion.as_ref().map(|o| o.authority())
                            } else {
                                None
                            },
                            if key_changed {
                                Some(&draft.public_ring)
                            } else {
                                None
                            },
                        ],
                    )?;
                    UpsertOutcome::PendingApproval {
                        key_changed,
                        onion_changed,
                    }
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Promote the pending fields into the pinned ones. Trust level is
    /// preserved.
    pub fn approve_pending(&self, fingerprint: &Fingerprint) -> Result<Contact> {
        let tx = self.conn().unchecked_transaction()?;
        let affected = tx.execute(
            "UPDATE contacts SET
                 onion = COALESCE(pending_onion, onion),
                 public_ring = COALESCE(pending_public_ring, public_ring),
                 pending_onion = NULL,
                 pending_public_ring = NULL,
                 change_state = ?2
             WHERE fingerprint = ?1",
            params![fingerprint.as_str(), ChangeState::None.as_str()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        let contact = tx.query_row(
            &format!("{SELECT_CONTACT} WHERE fingerprint = ?1"),
            params![fingerprint.as_str()],
            row_to_contact,
        )?;
        tx.commit()?;
        Ok(contact)
    }

    /// Discard the pending fields, leaving the pinned ones intact.
    pub fn reject_pending(&self, fingerprint: &Fingerprint) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE contacts SET
                 pending_onion = NULL,
                 pending_public_ring = NULL,
                 change_state = ?2
             WHERE fingerprint = ?1",
            params![fingerprint.as_str(), ChangeState::None.as_str()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn mark_verified(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.set_trust(fingerprint, TrustLevel::Verified)
    }

    pub fn mark_unverified(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.set_trust(fingerprint, TrustLevel::Unverified)
    }

    fn set_trust(&self, fingerprint: &Fingerprint, level: TrustLevel) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE contacts SET trust_level = ?2 WHERE fingerprint = ?1",
            params![fingerprint.as_str(), level.as_str()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn set_display_name(&self, fingerprint: &Fingerprint, name: Option<&str>) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE contacts SET display_name = ?2 WHERE fingerprint = ?1",
            params![fingerprint.as_str(), name],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Onion-only TOFU-or-pending flow, used by inbound `addr_update` and the
    /// `sender_onion` hint. Composes `change_state` so a pending key change
    /// survives.
    pub fn apply_onion_tofu_or_pending(
        &self,
        fingerprint: &Fingerprint,
        new_onion: &OnionAddress,
    ) -> Result<UpsertOutcome> {
        let tx = self.conn().unchecked_transaction()?;

        let existing = tx
            .query_row(
                &format!("{SELECT_CONTACT} WHERE fingerprint = ?1"),
                params![fingerprint.as_str()],
                row_to_contact,
            )
            .optional()?;
        let existing = existing.ok_or(StoreError::NotFound)?;

        let outcome = if existing.onion.as_ref() == Some(new_onion) {
            UpsertOutcome::NoChange
        } else if existing.trust_level != TrustLevel::Verified {
            tx.execute(
                "UPDATE contacts SET onion = ?2, pending_onion = NULL WHERE fingerprint = ?1",
                params![fingerprint.as_str(), new_onion.authority()],
            )?;
            UpsertOutcome::UpdatedUnverified
        } else {
            let state = existing.change_state.with_onion_changed();
            tx.execute(
                "UPDATE contacts SET pending_onion = ?2, change_state = ?3 WHERE fingerprint = ?1",
                params![
                    fingerprint.as_str(),
                    new_onion.authority(),
                    state.as_str()
                ],
            )?;
            UpsertOutcome::PendingApproval {
                key_changed: false,
                onion_changed: true,
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    pub fn delete_contact(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM contacts WHERE fingerprint = ?1",
            params![fingerprint.as_str()],
        )?;
        Ok(affected > 0)
    }
}

const SELECT_CONTACT: &str = "SELECT fingerprint, onion, public_ring, display_name, trust_level,
        change_state, pending_onion, pending_public_ring, created_at
 FROM contacts";

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    let fp_str: String = row.get(0)?;
    let fingerprint = Fingerprint::parse(&fp_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let onion = parse_onion_col(row, 1)?;
    let trust: String = row.get(4)?;
    let change: String = row.get(5)?;
    let pending_onion = parse_onion_col(row, 6)?;

    Ok(Contact {
        fingerprint,
        onion,
        public_ring: row.get(2)?,
        display_name: row.get(3)?,
        trust_level: TrustLevel::from_db(&trust),
        change_state: ChangeState::from_db(&change),
        pending_onion,
        pending_public_ring: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn parse_onion_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<OnionAddress>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => OnionAddress::parse(&s).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{draft_for, open_test_db, test_onion};
    use murmure_shared::keyring::KeyRing;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn first_sight_inserts_unverified() {
        let (db, _dir) = open_test_db();
        let ring = KeyRing::generate();
        let draft = draft_for(&ring, Some(&test_onion('a')));

        assert_eq!(
            db.upsert_merge_safe(&draft, NOW).unwrap(),
            UpsertOutcome::Inserted
        );

        let contact = db.contact_by_fp(&draft.fingerprint).unwrap().unwrap();
        assert_eq!(contact.trust_level, TrustLevel::Unverified);
        assert_eq!(contact.change_state, ChangeState::None);
        assert!(contact.display_name.is_none());
    }

    #[test]
    fn identical_import_is_nochange() {
        let (db, _dir) = open_test_db();
        let ring = KeyRing::generate();
        let draft = draft_for(&ring, Some(&test_onion('a')));

        db.upsert_merge_safe(&draft, NOW).unwrap();
        assert_eq!(
            db.upsert_merge_safe(&draft, NOW).unwrap(),
            UpsertOutcome::NoChange
        );
    }

    #[test]
    fn unverified_contact_refreshes_in_place() {
        let (db, _dir) = open_test_db();
        let ring = KeyRing::generate();
        db.upsert_merge_safe(&draft_for(&ring, Some(&test_onion('a'))), NOW)
            .unwrap();

        let moved = draft_for(&ring, Some(&test_onion('b')));
        assert_eq!(
            db.upsert_merge_safe(&moved, NOW).unwrap(),
            UpsertOutcome::UpdatedUnverified
        );

        let contact = db.contact_by_fp(&moved.fingerprint).unwrap().unwrap();
        assert_eq!(contact.onion.unwrap().authority(), test_onion('b'));
        assert!(contact.pending_onion.is_none());
        assert_eq!(contact.trust_level, TrustLevel::Unverified);
    }

    #[test]
    fn verified_contact_never_loses_pinned_fields() {
        let (db, _dir) = open_test_db();
        let ring = KeyRing::generate();
        let pinned = draft_for(&ring, Some(&test_onion('a')));
        db.upsert_merge_safe(&pinned, NOW).unwrap();
        db.mark_verified(&pinned.fingerprint).unwrap();

        // Same fingerprint but a different ring: craft a draft bypassing the
        // cross-check (what a hostile import would look like post-validation).
        let other_ring = KeyRing::generate();
        let hostile = ContactDraft {
            fingerprint: pinned.fingerprint.clone(),
            onion: pinned.onion.clone(),
            public_ring: other_ring.public_ring().to_bytes(),
        };

        assert_eq!(
            db.upsert_merge_safe(&hostile, NOW).unwrap(),
            UpsertOutcome::PendingApproval {
                key_changed: true,
                onion_changed: false
            }
        );

        let contact = db.contact_by_fp(&pinned.fingerprint).unwrap().unwrap();
        assert_eq!(contact.public_ring, pinned.public_ring);
        assert_eq!(
            contact.pending_public_ring.as_deref(),
            Some(hostile.public_ring.as_slice())
        );
        assert_eq!(contact.change_state, ChangeState::KeyChanged);
        assert_eq!(contact.trust_level, TrustLevel::Verified);
    }

    #[test]
    fn approve_pending_promotes_and_keeps_trust() {
        let (db, _dir) = open_test_db();
        let ring = KeyRing::generate();
        let pinned = draft_for(&ring, Some(&test_onion('a')));
        db.upsert_merge_safe(&pinned, NOW).unwrap();
        db.mark_verified(&pinned.fingerprint).unwrap();

        let other_ring = KeyRing::generate();
        let incoming = ContactDraft {
            fingerprint: pinned.fingerprint.clone(),
            onion: Some(OnionAddress::parse(&test_onion('b')).unwrap()),
            public_ring: other_ring.public_ring().to_bytes(),
        };
        db.upsert_merge_safe(&incoming, NOW).unwrap();

        let approved = db.approve_pending(&pinned.fingerprint).unwrap();
        assert_eq!(approved.public_ring, incoming.public_ring);
        assert_eq!(approved.onion.unwrap().authority(), test_onion('b'));
        assert_eq!(approved.change_state, ChangeState::None);
        assert!(approved.pending_public_ring.is_none());
        assert_eq!(approved.trust_level, TrustLevel::Verified);
    }

    #[test]
    fn reject_pending_keeps_pinned() {
        let (db, _dir) = open_test_db();
        let ring = KeyRing::generate();
        let pinned = draft_for(&ring, Some(&test_onion('a')));
        db.upsert_merge_safe(&pinned, NOW).unwrap();
        db.mark_verified(&pinned.fingerprint).unwrap();

        let other_ring = KeyRing::generate();
        db.upsert_merge_safe(
            &ContactDraft {
                fingerprint: pinned.fingerprint.clone(),
                onion: pinned.onion.clone(),
                public_ring: other_ring.public_ring().to_bytes(),
            },
            NOW,
        )
        .unwrap();

        db.reject_pending(&pinned.fingerprint).unwrap();
        let contact = db.contact_by_fp(&pinned.fingerprint).unwrap().unwrap();
        assert_eq!(contact.public_ring, pinned.public_ring);
        assert!(contact.pending_public_ring.is_none());
        assert_eq!(contact.change_state, ChangeState::None);
    }

    #[test]
    fn onion_update_composes_with_pending_key() {
        let (db, _dir) = open_test_db();
        let ring = KeyRing::generate();
        let pinned = draft_for(&ring, Some(&test_onion('a')));
        db.upsert_merge_safe(&pinned, NOW).unwrap();
        db.mark_verified(&pinned.fingerprint).unwrap();

        // Land a pending key change first.
        let other_ring = KeyRing::generate();
        db.upsert_merge_safe(
            &ContactDraft {
                fingerprint: pinned.fingerprint.clone(),
                onion: pinned.onion.clone(),
                public_ring: other_ring.public_ring().to_bytes(),
            },
            NOW,
        )
        .unwrap();

        let new_onion = OnionAddress::parse(&test_onion('c')).unwrap();
        assert_eq!(
            db.apply_onion_tofu_or_pending(&pinned.fingerprint, &new_onion)
                .unwrap(),
            UpsertOutcome::PendingApproval {
                key_changed: false,
                onion_changed: true
            }
        );

        let contact = db.contact_by_fp(&pinned.fingerprint).unwrap().unwrap();
        assert_eq!(contact.change_state, ChangeState::Both);
        assert_eq!(contact.pending_onion.unwrap(), new_onion);
        assert!(contact.pending_public_ring.is_some());
        assert_eq!(contact.onion, pinned.onion);
    }

    #[test]
    fn onion_update_tofu_for_unverified() {
        let (db, _dir) = open_test_db();
        let ring = KeyRing::generate();
        let draft = draft_for(&ring, Some(&test_onion('a')));
        db.upsert_merge_safe(&draft, NOW).unwrap();

        let new_onion = OnionAddress::parse(&test_onion('d')).unwrap();
        assert_eq!(
            db.apply_onion_tofu_or_pending(&draft.fingerprint, &new_onion)
                .unwrap(),
            UpsertOutcome::UpdatedUnverified
        );
        let contact = db.contact_by_fp(&draft.fingerprint).unwrap().unwrap();
        assert_eq!(contact.onion.unwrap(), new_onion);
    }
}
