//! Inbound envelope pipeline.
//!
//! Checks run strictly in order: shape, recipient, allowlist, replay, then
//! crypto. The cheap allowlist and replay checks come before decryption so
//! unknown senders cannot burn CPU or grow the nonce tables.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use murmure_shared::codec::SealedCodec;
use murmure_shared::constants::{
    CLOCK_SKEW_TOLERANCE_MS, ENVELOPE_VERSION, MAX_BODY_CHARS, MAX_MSG_ID_LEN, MAX_NONCE_LEN,
};
use murmure_shared::envelope::{
    CipherBlob, Envelope, InnerAddrUpdate, InnerMessage, TYPE_ADDR_UPDATE, TYPE_MSG,
};
use murmure_shared::types::{Direction, Fingerprint, MessageStatus, OnionAddress, TrustLevel};
use murmure_shared::CodecError;
use murmure_store::{Database, Identity, StoredMessage};

use crate::contacts::ContactManager;
use crate::error::{ErrorCode, Rejection};
use crate::replay::ReplayGuard;
use crate::util::now_ms;
use crate::vault::IdentityVault;

pub struct InboundPipeline {
    db: Arc<Mutex<Database>>,
    vault: Arc<IdentityVault>,
    contacts: Arc<ContactManager>,
    replay: Arc<ReplayGuard>,
    codec: Arc<dyn SealedCodec>,
    strict_verified: bool,
    debug: bool,
}

impl InboundPipeline {
    pub fn new(
        db: Arc<Mutex<Database>>,
        vault: Arc<IdentityVault>,
        contacts: Arc<ContactManager>,
        replay: Arc<ReplayGuard>,
        codec: Arc<dyn SealedCodec>,
        strict_verified: bool,
        debug: bool,
    ) -> Self {
        Self {
            db,
            vault,
            contacts,
            replay,
            codec,
            strict_verified,
            debug,
        }
    }

    /// Run the full pipeline. `Ok` carries the accepted `msg_id`.
    pub async fn handle(&self, envelope: &Envelope) -> Result<String, Rejection> {
        // 1. envelope shape
        let (sender_fp, recipient_fp) = self.check_shape(envelope)?;
        let reject =
            |code: ErrorCode| Rejection::with_msg_id(code, envelope.msg_id.clone());

        // 2. recipient must be this device
        let identity = match self.vault.active_identity().await {
            Ok(Some(identity)) => identity,
            Ok(None) => return Err(reject(ErrorCode::LocalIdentityMissing)),
            Err(e) => return Err(internal(e, &envelope.msg_id)),
        };
        if recipient_fp != identity.fingerprint {
            return Err(reject(ErrorCode::RecipientNotSelf));
        }

        // 3. allowlist (a device always trusts itself)
        let is_self = sender_fp == identity.fingerprint;
        let sender_ring = if is_self {
            identity.public_ring.clone()
        } else {
            let contact = match self.contacts.get(&sender_fp).await {
                Ok(Some(contact)) => contact,
                Ok(None) => return Err(reject(ErrorCode::SenderNotAllowed)),
                Err(e) => return Err(internal(e, &envelope.msg_id)),
            };
            if self.strict_verified && contact.trust_level != TrustLevel::Verified {
                return Err(reject(ErrorCode::SenderNotVerified));
            }
            contact.public_ring
        };

        // 4. replay window, before any expensive crypto
        if !self.replay.check_and_insert(sender_fp.as_str(), &envelope.nonce) {
            debug!(sender = sender_fp.short(), "replayed nonce rejected");
            return Err(reject(ErrorCode::ReplayDetected));
        }

        // 5. decrypt + verify
        let plaintext = self
            .open_payload(envelope, &identity, &sender_ring, is_self)
            .map_err(|code| reject(code))?;

        // 6/7. inner structure + type dispatch
        match envelope.kind.as_str() {
            TYPE_MSG => {
                self.handle_chat_message(envelope, &sender_fp, &identity, &plaintext, is_self)
                    .await
            }
            TYPE_ADDR_UPDATE => {
                self.handle_addr_update(envelope, &sender_fp, &plaintext)
                    .await
            }
            _ => Err(reject(ErrorCode::InvalidType)),
        }
    }

    fn check_shape(&self, envelope: &Envelope) -> Result<(Fingerprint, Fingerprint), Rejection> {
        let bad = || Rejection::with_msg_id(ErrorCode::BadRequest, envelope.msg_id.clone());

        if envelope.v != ENVELOPE_VERSION {
            return Err(bad());
        }
        if envelope.msg_id.is_empty() || envelope.msg_id.len() > MAX_MSG_ID_LEN {
            return Err(Rejection::new(ErrorCode::BadRequest));
        }
        if envelope.nonce.is_empty() || envelope.nonce.len() > MAX_NONCE_LEN {
            return Err(bad());
        }

        let debug_plain_allowed = self.debug && envelope.debug_plaintext.is_some();
        if envelope.payload_pgp.trim().is_empty() && !debug_plain_allowed {
            return Err(bad());
        }

        if envelope.created_at <= 0
            || envelope.created_at > now_ms() + CLOCK_SKEW_TOLERANCE_MS
        {
            return Err(bad());
        }

        let sender_fp = Fingerprint::parse(&envelope.sender_fp).map_err(|_| bad())?;
        let recipient_fp = Fingerprint::parse(&envelope.recipient_fp).map_err(|_| bad())?;
        Ok((sender_fp, recipient_fp))
    }

    fn open_payload(
        &self,
        envelope: &Envelope,
        identity: &Identity,
        sender_ring: &[u8],
        is_self: bool,
    ) -> Result<Vec<u8>, ErrorCode> {
        // Debug loopback: plaintext rides next to an empty sealed slot, and
        // only for this device talking to itself.
        if envelope.payload_pgp.trim().is_empty() {
            return match (&envelope.debug_plaintext, self.debug && is_self) {
                (Some(plain), true) => Ok(plain.as_bytes().to_vec()),
                _ => Err(ErrorCode::BadRequest),
            };
        }

        let secret = self
            .vault
            .unseal_secret_ring(identity)
            .map_err(|_| ErrorCode::CryptoDecryptFail)?;

        self.codec
            .decrypt_and_verify(sender_ring, &secret, envelope.payload_pgp.trim())
            .map_err(|e| match e {
                CodecError::SignatureInvalid => ErrorCode::SenderUnknown,
                CodecError::NoMatchingRecipient => ErrorCode::RecipientUnknown,
                _ => ErrorCode::CryptoDecryptFail,
            })
    }

    async fn handle_chat_message(
        &self,
        envelope: &Envelope,
        sender_fp: &Fingerprint,
        identity: &Identity,
        plaintext: &[u8],
        is_self: bool,
    ) -> Result<String, Rejection> {
        let reject = |code: ErrorCode| Rejection::with_msg_id(code, envelope.msg_id.clone());

        let inner: InnerMessage = serde_json::from_slice(plaintext)
            .map_err(|_| reject(ErrorCode::PlaintextJsonInvalid))?;

        if inner.v != ENVELOPE_VERSION {
            return Err(reject(ErrorCode::UnsupportedVersion));
        }
        if inner.msg_id != envelope.msg_id {
            return Err(reject(ErrorCode::MsgIdMismatch));
        }
        match Fingerprint::parse(&inner.conv_id) {
            Ok(conv) if conv == *sender_fp => {}
            _ => return Err(reject(ErrorCode::ConvIdMismatch)),
        }
        if inner.body.chars().count() > MAX_BODY_CHARS {
            return Err(reject(ErrorCode::BodyTooLarge));
        }

        // Best-effort onion refresh from the sender's own hint.
        if !is_self {
            if let Some(hint) = &inner.sender_onion {
                match OnionAddress::parse(hint) {
                    Ok(onion) => {
                        if let Err(e) = self
                            .contacts
                            .apply_inbound_onion_update(sender_fp, &onion)
                            .await
                        {
                            warn!(error = %e, "sender onion hint not applied");
                        }
                    }
                    Err(_) => debug!(sender = sender_fp.short(), "ignoring malformed onion hint"),
                }
            }
        }

        let now = now_ms();
        let plaintext_json = serde_json::json!({ "body": inner.body }).to_string();
        let row = StoredMessage {
            id: envelope.msg_id.clone(),
            msg_id: envelope.msg_id.clone(),
            kind: TYPE_MSG.to_string(),
            conv_id: sender_fp.clone(),
            direction: Direction::In,
            sender_fp: sender_fp.clone(),
            recipient_fp: identity.fingerprint.clone(),
            created_at: envelope.created_at,
            server_received_at: now,
            status: MessageStatus::Received,
            attempt_count: 0,
            last_error: None,
            next_retry_at: 0,
            ciphertext: CipherBlob::inbound(envelope.payload_pgp.trim(), plaintext_json).render(),
        };

        let inserted = self
            .db
            .lock()
            .await
            .insert_message_if_absent(&row)
            .map_err(|e| internal(e, &envelope.msg_id))?;
        if !inserted {
            debug!(msg_id = %envelope.msg_id, "duplicate message id, row untouched");
        }

        Ok(envelope.msg_id.clone())
    }

    async fn handle_addr_update(
        &self,
        envelope: &Envelope,
        sender_fp: &Fingerprint,
        plaintext: &[u8],
    ) -> Result<String, Rejection> {
        let reject = |code: ErrorCode| Rejection::with_msg_id(code, envelope.msg_id.clone());

        let inner: InnerAddrUpdate = serde_json::from_slice(plaintext)
            .map_err(|_| reject(ErrorCode::PlaintextJsonInvalid))?;

        if inner.v != ENVELOPE_VERSION {
            return Err(reject(ErrorCode::UnsupportedVersion));
        }
        if inner.kind != TYPE_ADDR_UPDATE {
            return Err(reject(ErrorCode::InvalidType));
        }
        if inner.msg_id != envelope.msg_id {
            return Err(reject(ErrorCode::MsgIdMismatch));
        }
        match Fingerprint::parse(&inner.conv_id) {
            Ok(conv) if conv == *sender_fp => {}
            _ => return Err(reject(ErrorCode::ConvIdMismatch)),
        }

        let new_onion =
            OnionAddress::parse(&inner.new_onion).map_err(|_| reject(ErrorCode::BadRequest))?;

        self.contacts
            .apply_inbound_onion_update(sender_fp, &new_onion)
            .await
            .map_err(|e| internal(e, &envelope.msg_id))?;

        // Address updates are control traffic; nothing lands in the chat.
        Ok(envelope.msg_id.clone())
    }
}

fn internal(e: impl std::fmt::Display, msg_id: &str) -> Rejection {
    warn!(error = %e, "inbound pipeline internal error");
    Rejection::with_msg_id(ErrorCode::Internal, msg_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{node_fixture, node_fixture_with, NodeFixture};
    use murmure_shared::codec::RingCodec;
    use murmure_shared::exchange::ContactDraft;
    use murmure_shared::keyring::KeyRing;

    fn onion(fill: char) -> String {
        format!("{}.onion", fill.to_string().repeat(56))
    }

    async fn register_peer(fx: &NodeFixture, peer: &KeyRing, verified: bool) {
        let draft = ContactDraft {
            fingerprint: peer.fingerprint(),
            onion: Some(OnionAddress::parse(&onion('z')).unwrap()),
            public_ring: peer.public_ring().to_bytes(),
        };
        fx.contacts.import(&draft).await.unwrap();
        if verified {
            fx.contacts.mark_verified(&peer.fingerprint()).await.unwrap();
        }
    }

    /// Seal `inner` as `signer` would, addressed to `recipient_ring`.
    fn sealed_envelope(
        signer: &KeyRing,
        recipient_ring: &[u8],
        kind: &str,
        sender_fp: &str,
        recipient_fp: &str,
        msg_id: &str,
        nonce: &str,
        inner: &serde_json::Value,
    ) -> Envelope {
        let payload = RingCodec::new()
            .encrypt_and_sign(
                inner.to_string().as_bytes(),
                recipient_ring,
                &signer.public_ring().to_bytes(),
                &signer.secret_ring_bytes(),
            )
            .unwrap();

        Envelope {
            v: 1,
            kind: kind.to_string(),
            msg_id: msg_id.to_string(),
            sender_fp: sender_fp.to_string(),
            recipient_fp: recipient_fp.to_string(),
            created_at: now_ms(),
            nonce: nonce.to_string(),
            payload_pgp: payload,
            debug_plaintext: None,
        }
    }

    fn chat_inner(msg_id: &str, conv_id: &str, body: &str) -> serde_json::Value {
        serde_json::json!({
            "v": 1,
            "msg_id": msg_id,
            "conv_id": conv_id,
            "body": body,
        })
    }

    #[tokio::test]
    async fn verified_peer_message_is_stored() {
        let fx = node_fixture();
        let identity = fx.vault.ensure_identity().await.unwrap();
        let peer = KeyRing::generate();
        register_peer(&fx, &peer, true).await;

        let peer_fp = peer.fingerprint();
        let inner = chat_inner("m-1", peer_fp.as_str(), "bonjour");
        let env = sealed_envelope(
            &peer,
            &identity.public_ring,
            TYPE_MSG,
            peer_fp.as_str(),
            identity.fingerprint.as_str(),
            "m-1",
            "nonce-1",
            &inner,
        );

        assert_eq!(fx.pipeline.handle(&env).await.unwrap(), "m-1");

        let row = fx.db.lock().await.message_by_db_id("m-1").unwrap();
        assert_eq!(row.direction, Direction::In);
        assert_eq!(row.status, MessageStatus::Received);
        assert_eq!(row.conv_id, peer_fp);
        assert!(row.server_received_at > 0);

        let blob = CipherBlob::parse(&row.ciphertext).unwrap();
        let pt: serde_json::Value =
            serde_json::from_str(blob.plaintext_json.as_deref().unwrap()).unwrap();
        assert_eq!(pt["body"], "bonjour");
    }

    #[tokio::test]
    async fn unknown_sender_is_rejected_without_persisting() {
        let fx = node_fixture();
        let identity = fx.vault.ensure_identity().await.unwrap();
        let stranger = KeyRing::generate();

        let fp = stranger.fingerprint();
        let inner = chat_inner("m-2", fp.as_str(), "hello?");
        let env = sealed_envelope(
            &stranger,
            &identity.public_ring,
            TYPE_MSG,
            fp.as_str(),
            identity.fingerprint.as_str(),
            "m-2",
            "nonce-2",
            &inner,
        );

        let rejection = fx.pipeline.handle(&env).await.unwrap_err();
        assert_eq!(rejection.code, ErrorCode::SenderNotAllowed);
        assert_eq!(rejection.status, 403);
        assert!(fx.db.lock().await.message_by_db_id("m-2").is_err());
    }

    #[tokio::test]
    async fn unverified_sender_blocked_in_strict_mode() {
        let fx = node_fixture();
        let identity = fx.vault.ensure_identity().await.unwrap();
        let peer = KeyRing::generate();
        register_peer(&fx, &peer, false).await;

        let fp = peer.fingerprint();
        let inner = chat_inner("m-3", fp.as_str(), "hi");
        let env = sealed_envelope(
            &peer,
            &identity.public_ring,
            TYPE_MSG,
            fp.as_str(),
            identity.fingerprint.as_str(),
            "m-3",
            "nonce-3",
            &inner,
        );

        let rejection = fx.pipeline.handle(&env).await.unwrap_err();
        assert_eq!(rejection.code, ErrorCode::SenderNotVerified);
    }

    #[tokio::test]
    async fn unverified_sender_allowed_when_strict_off() {
        let fx = node_fixture_with(false, false);
        let identity = fx.vault.ensure_identity().await.unwrap();
        let peer = KeyRing::generate();
        register_peer(&fx, &peer, false).await;

        let fp = peer.fingerprint();
        let inner = chat_inner("m-4", fp.as_str(), "hi");
        let env = sealed_envelope(
            &peer,
            &identity.public_ring,
            TYPE_MSG,
            fp.as_str(),
            identity.fingerprint.as_str(),
            "m-4",
            "nonce-4",
            &inner,
        );

        assert!(fx.pipeline.handle(&env).await.is_ok());
    }

    #[tokio::test]
    async fn replayed_nonce_is_rejected_once_stored() {
        let fx = node_fixture();
        let identity = fx.vault.ensure_identity().await.unwrap();
        let peer = KeyRing::generate();
        register_peer(&fx, &peer, true).await;

        let fp = peer.fingerprint();
        let inner = chat_inner("m-5", fp.as_str(), "first");
        let env = sealed_envelope(
            &peer,
            &identity.public_ring,
            TYPE_MSG,
            fp.as_str(),
            identity.fingerprint.as_str(),
            "m-5",
            "nonce-5",
            &inner,
        );

        assert!(fx.pipeline.handle(&env).await.is_ok());
        let rejection = fx.pipeline.handle(&env).await.unwrap_err();
        assert_eq!(rejection.code, ErrorCode::ReplayDetected);
        assert_eq!(rejection.status, 422);

        let rows = fx
            .db
            .lock()
            .await
            .list_conversation(&fp, 10, 0)
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn recipient_must_be_self() {
        let fx = node_fixture();
        fx.vault.ensure_identity().await.unwrap();
        let peer = KeyRing::generate();
        register_peer(&fx, &peer, true).await;

        let other = KeyRing::generate();
        let fp = peer.fingerprint();
        let inner = chat_inner("m-6", fp.as_str(), "misdirected");
        let env = sealed_envelope(
            &peer,
            &other.public_ring().to_bytes(),
            TYPE_MSG,
            fp.as_str(),
            other.fingerprint().as_str(),
            "m-6",
            "nonce-6",
            &inner,
        );

        let rejection = fx.pipeline.handle(&env).await.unwrap_err();
        assert_eq!(rejection.code, ErrorCode::RecipientNotSelf);
        assert_eq!(rejection.status, 401);
    }

    #[tokio::test]
    async fn missing_identity_is_422() {
        let fx = node_fixture();
        let peer = KeyRing::generate();
        let fp = peer.fingerprint();
        let env = Envelope {
            v: 1,
            kind: TYPE_MSG.to_string(),
            msg_id: "m-7".into(),
            sender_fp: fp.to_string(),
            recipient_fp: "A".repeat(40),
            created_at: now_ms(),
            nonce: "nonce-7".into(),
            payload_pgp: "QUJD".into(),
            debug_plaintext: None,
        };

        let rejection = fx.pipeline.handle(&env).await.unwrap_err();
        assert_eq!(rejection.code, ErrorCode::LocalIdentityMissing);
    }

    #[tokio::test]
    async fn impostor_signature_maps_to_sender_unknown() {
        let fx = node_fixture();
        let identity = fx.vault.ensure_identity().await.unwrap();
        let peer = KeyRing::generate();
        register_peer(&fx, &peer, true).await;

        // Signed by mallory, claiming to be the registered peer.
        let mallory = KeyRing::generate();
        let fp = peer.fingerprint();
        let inner = chat_inner("m-8", fp.as_str(), "forged");
        let env = sealed_envelope(
            &mallory,
            &identity.public_ring,
            TYPE_MSG,
            fp.as_str(),
            identity.fingerprint.as_str(),
            "m-8",
            "nonce-8",
            &inner,
        );

        let rejection = fx.pipeline.handle(&env).await.unwrap_err();
        assert_eq!(rejection.code, ErrorCode::SenderUnknown);
        assert_eq!(rejection.status, 401);
    }

    #[tokio::test]
    async fn shape_violations_are_bad_request() {
        let fx = node_fixture();
        let identity = fx.vault.ensure_identity().await.unwrap();
        let peer = KeyRing::generate();
        register_peer(&fx, &peer, true).await;

        let fp = peer.fingerprint();
        let inner = chat_inner("m-9", fp.as_str(), "x");
        let good = sealed_envelope(
            &peer,
            &identity.public_ring,
            TYPE_MSG,
            fp.as_str(),
            identity.fingerprint.as_str(),
            "m-9",
            "nonce-9",
            &inner,
        );

        let mut wrong_version = good.clone();
        wrong_version.v = 2;
        assert_eq!(
            fx.pipeline.handle(&wrong_version).await.unwrap_err().code,
            ErrorCode::BadRequest
        );

        let mut empty_msg_id = good.clone();
        empty_msg_id.msg_id = String::new();
        assert_eq!(
            fx.pipeline.handle(&empty_msg_id).await.unwrap_err().code,
            ErrorCode::BadRequest
        );

        let mut long_msg_id = good.clone();
        long_msg_id.msg_id = "x".repeat(MAX_MSG_ID_LEN + 1);
        assert_eq!(
            fx.pipeline.handle(&long_msg_id).await.unwrap_err().code,
            ErrorCode::BadRequest
        );

        let mut long_nonce = good.clone();
        long_nonce.nonce = "n".repeat(MAX_NONCE_LEN + 1);
        assert_eq!(
            fx.pipeline.handle(&long_nonce).await.unwrap_err().code,
            ErrorCode::BadRequest
        );

        let mut bad_fp = good.clone();
        bad_fp.sender_fp = "Z".repeat(40);
        assert_eq!(
            fx.pipeline.handle(&bad_fp).await.unwrap_err().code,
            ErrorCode::BadRequest
        );

        let mut short_fp = good.clone();
        short_fp.sender_fp = "A".repeat(39);
        assert_eq!(
            fx.pipeline.handle(&short_fp).await.unwrap_err().code,
            ErrorCode::BadRequest
        );
    }

    #[tokio::test]
    async fn created_at_skew_boundary() {
        let fx = node_fixture();
        let identity = fx.vault.ensure_identity().await.unwrap();
        let peer = KeyRing::generate();
        register_peer(&fx, &peer, true).await;

        let fp = peer.fingerprint();
        let inner = chat_inner("m-10", fp.as_str(), "future");
        let mut env = sealed_envelope(
            &peer,
            &identity.public_ring,
            TYPE_MSG,
            fp.as_str(),
            identity.fingerprint.as_str(),
            "m-10",
            "nonce-10",
            &inner,
        );

        // exactly at the tolerance: accepted (now only advances meanwhile)
        env.created_at = now_ms() + CLOCK_SKEW_TOLERANCE_MS;
        assert!(fx.pipeline.handle(&env).await.is_ok());

        // far beyond: rejected
        let inner = chat_inner("m-11", fp.as_str(), "far future");
        let mut env = sealed_envelope(
            &peer,
            &identity.public_ring,
            TYPE_MSG,
            fp.as_str(),
            identity.fingerprint.as_str(),
            "m-11",
            "nonce-11",
            &inner,
        );
        env.created_at = now_ms() + CLOCK_SKEW_TOLERANCE_MS + 60_000;
        assert_eq!(
            fx.pipeline.handle(&env).await.unwrap_err().code,
            ErrorCode::BadRequest
        );

        // non-positive: rejected
        let mut env_zero = env.clone();
        env_zero.msg_id = "m-12".into();
        env_zero.created_at = 0;
        assert_eq!(
            fx.pipeline.handle(&env_zero).await.unwrap_err().code,
            ErrorCode::BadRequest
        );
    }

    #[tokio::test]
    async fn body_length_boundary() {
        let fx = node_fixture();
        let identity = fx.vault.ensure_identity().await.unwrap();
        let peer = KeyRing::generate();
        register_peer(&fx, &peer, true).await;
        let fp = peer.fingerprint();

        let inner = chat_inner("m-13", fp.as_str(), &"a".repeat(MAX_BODY_CHARS));
        let env = sealed_envelope(
            &peer,
            &identity.public_ring,
            TYPE_MSG,
            fp.as_str(),
            identity.fingerprint.as_str(),
            "m-13",
            "nonce-13",
            &inner,
        );
        assert!(fx.pipeline.handle(&env).await.is_ok());

        let inner = chat_inner("m-14", fp.as_str(), &"a".repeat(MAX_BODY_CHARS + 1));
        let env = sealed_envelope(
            &peer,
            &identity.public_ring,
            TYPE_MSG,
            fp.as_str(),
            identity.fingerprint.as_str(),
            "m-14",
            "nonce-14",
            &inner,
        );
        assert_eq!(
            fx.pipeline.handle(&env).await.unwrap_err().code,
            ErrorCode::BodyTooLarge
        );
    }

    #[tokio::test]
    async fn inner_mismatches_are_named() {
        let fx = node_fixture();
        let identity = fx.vault.ensure_identity().await.unwrap();
        let peer = KeyRing::generate();
        register_peer(&fx, &peer, true).await;
        let fp = peer.fingerprint();

        // inner msg_id disagrees with the outer one
        let inner = chat_inner("other-id", fp.as_str(), "x");
        let env = sealed_envelope(
            &peer,
            &identity.public_ring,
            TYPE_MSG,
            fp.as_str(),
            identity.fingerprint.as_str(),
            "m-15",
            "nonce-15",
            &inner,
        );
        assert_eq!(
            fx.pipeline.handle(&env).await.unwrap_err().code,
            ErrorCode::MsgIdMismatch
        );

        // conv_id that is not the sender
        let inner = chat_inner("m-16", &"B".repeat(40), "x");
        let env = sealed_envelope(
            &peer,
            &identity.public_ring,
            TYPE_MSG,
            fp.as_str(),
            identity.fingerprint.as_str(),
            "m-16",
            "nonce-16",
            &inner,
        );
        assert_eq!(
            fx.pipeline.handle(&env).await.unwrap_err().code,
            ErrorCode::ConvIdMismatch
        );
    }

    #[tokio::test]
    async fn unknown_type_is_invalid() {
        let fx = node_fixture();
        let identity = fx.vault.ensure_identity().await.unwrap();
        let peer = KeyRing::generate();
        register_peer(&fx, &peer, true).await;
        let fp = peer.fingerprint();

        let inner = chat_inner("m-17", fp.as_str(), "x");
        let env = sealed_envelope(
            &peer,
            &identity.public_ring,
            "presence",
            fp.as_str(),
            identity.fingerprint.as_str(),
            "m-17",
            "nonce-17",
            &inner,
        );
        assert_eq!(
            fx.pipeline.handle(&env).await.unwrap_err().code,
            ErrorCode::InvalidType
        );
    }

    #[tokio::test]
    async fn addr_update_moves_onion_without_chat_row() {
        // strict mode off so an unverified contact can TOFU-refresh
        let fx = node_fixture_with(false, false);
        let identity = fx.vault.ensure_identity().await.unwrap();
        let peer = KeyRing::generate();
        register_peer(&fx, &peer, false).await;
        let fp = peer.fingerprint();

        let fresh = onion('q');
        let inner = serde_json::json!({
            "v": 1,
            "type": "addr_update",
            "msg_id": "m-18",
            "sender_fp": fp.as_str(),
            "recipient_fp": identity.fingerprint.as_str(),
            "conv_id": fp.as_str(),
            "ts": now_ms() / 1000,
            "nonce": "nonce-18",
            "new_onion": fresh,
        });

        let env = sealed_envelope(
            &peer,
            &identity.public_ring,
            TYPE_ADDR_UPDATE,
            fp.as_str(),
            identity.fingerprint.as_str(),
            "m-18",
            "nonce-18",
            &inner,
        );
        assert!(fx.pipeline.handle(&env).await.is_ok());

        let contact = fx.contacts.get(&fp).await.unwrap().unwrap();
        assert_eq!(contact.onion.unwrap().authority(), fresh);
        assert!(fx.db.lock().await.message_by_db_id("m-18").is_err());
    }

    #[tokio::test]
    async fn sender_onion_hint_lands_in_pending_for_verified_peer() {
        let fx = node_fixture();
        let identity = fx.vault.ensure_identity().await.unwrap();
        let peer = KeyRing::generate();
        register_peer(&fx, &peer, true).await;
        let fp = peer.fingerprint();

        let hint = onion('w');
        let inner = serde_json::json!({
            "v": 1,
            "msg_id": "m-19",
            "conv_id": fp.as_str(),
            "body": "moved",
            "sender_onion": hint,
        });
        let env = sealed_envelope(
            &peer,
            &identity.public_ring,
            TYPE_MSG,
            fp.as_str(),
            identity.fingerprint.as_str(),
            "m-19",
            "nonce-19",
            &inner,
        );
        assert!(fx.pipeline.handle(&env).await.is_ok());

        let contact = fx.contacts.get(&fp).await.unwrap().unwrap();
        // pinned onion untouched, divergence parked as pending
        assert_eq!(contact.onion.unwrap().authority(), onion('z'));
        assert_eq!(contact.pending_onion.unwrap().authority(), hint);
    }
}
