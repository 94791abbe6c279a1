//! Contact manager: the trust-aware surface over the contact table.
//!
//! Every import entry point (file, share intent, QR scan, manual entry,
//! invite acceptance) funnels through [`ContactManager::import`] with a
//! validated [`ContactDraft`], so all of them obey the same canonicalization
//! and TOFU/pinning rules.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use murmure_shared::exchange::ContactDraft;
use murmure_shared::types::{Fingerprint, OnionAddress};
use murmure_store::{Contact, Database, StoreError, UpsertOutcome};

use crate::error::{NodeError, Result};
use crate::util::now_ms;

pub struct ContactManager {
    db: Arc<Mutex<Database>>,
}

impl ContactManager {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Contact>> {
        Ok(self.db.lock().await.contact_by_fp(fingerprint)?)
    }

    pub async fn list(&self) -> Result<Vec<Contact>> {
        Ok(self.db.lock().await.list_contacts()?)
    }

    /// Merge a validated draft under the TOFU/pinning rules.
    pub async fn import(&self, draft: &ContactDraft) -> Result<UpsertOutcome> {
        let outcome = self
            .db
            .lock()
            .await
            .upsert_merge_safe(draft, now_ms())?;

        match &outcome {
            UpsertOutcome::Inserted => {
                info!(fingerprint = draft.fingerprint.short(), "contact added (TOFU)");
            }
            UpsertOutcome::PendingApproval {
                key_changed,
                onion_changed,
            } => {
                info!(
                    fingerprint = draft.fingerprint.short(),
                    key_changed, onion_changed, "pinned contact diverged; pending approval"
                );
            }
            _ => {}
        }
        Ok(outcome)
    }

    pub async fn approve_pending(&self, fingerprint: &Fingerprint) -> Result<Contact> {
        let contact = self.db.lock().await.approve_pending(fingerprint)?;
        info!(fingerprint = fingerprint.short(), "pending change approved");
        Ok(contact)
    }

    pub async fn reject_pending(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.db.lock().await.reject_pending(fingerprint)?;
        info!(fingerprint = fingerprint.short(), "pending change rejected");
        Ok(())
    }

    pub async fn mark_verified(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.db.lock().await.mark_verified(fingerprint)?;
        info!(fingerprint = fingerprint.short(), "contact verified");
        Ok(())
    }

    pub async fn mark_unverified(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.db.lock().await.mark_unverified(fingerprint)?;
        Ok(())
    }

    pub async fn set_display_name(
        &self,
        fingerprint: &Fingerprint,
        name: Option<&str>,
    ) -> Result<()> {
        Ok(self.db.lock().await.set_display_name(fingerprint, name)?)
    }

    /// Inbound onion update: TOFU refresh for unverified contacts, pending
    /// slot for pinned ones. Unknown senders are ignored (the pipeline's
    /// allowlist runs first; the hint path is best-effort).
    pub async fn apply_inbound_onion_update(
        &self,
        sender_fp: &Fingerprint,
        new_onion: &OnionAddress,
    ) -> Result<Option<UpsertOutcome>> {
        match self
            .db
            .lock()
            .await
            .apply_onion_tofu_or_pending(sender_fp, new_onion)
        {
            Ok(outcome) => {
                debug!(
                    fingerprint = sender_fp.short(),
                    outcome = ?outcome,
                    "inbound onion update applied"
                );
                Ok(Some(outcome))
            }
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(NodeError::Store(e)),
        }
    }
}
