//! Outbound sender.
//!
//! Builds, seals and delivers envelopes. The delivery row is always persisted
//! as `Queued` before the first byte goes out, so an interruption can never
//! lose an accepted send; transitions to `SentOk` or `Failed` happen exactly
//! once, before the outcome is returned.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use murmure_shared::codec::SealedCodec;
use murmure_shared::constants::{
    ENVELOPE_VERSION, MAX_PAYLOAD_B64_BYTES, NONCE_RANDOM_BYTES,
};
use murmure_shared::envelope::{
    CipherBlob, Envelope, InnerAddrUpdate, InnerMessage, TYPE_ADDR_UPDATE, TYPE_MSG,
};
use murmure_shared::types::{
    Direction, Fingerprint, MessageStatus, OnionAddress, TrustLevel,
};
use murmure_store::{Database, Identity, StoredMessage};

use crate::contacts::ContactManager;
use crate::error::{NodeError, Result};
use crate::util::{now_ms, random_token};
use crate::vault::IdentityVault;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
const LOOPBACK_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_BASE_DELAY_MS: i64 = 2_000;
const RETRY_BACKOFF_CAP_SHIFT: u32 = 5;

/// Tagged result of one delivery attempt. `Queued*` variants leave the row
/// retryable; `Failed*` variants are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    QueuedLocalNotReady,
    QueuedTorNotReady,
    QueuedHttpFail(u16),
    FailedMissingAddress,
    FailedBadAddress,
    FailedBlockedDirectHttp,
    FailedCryptoError,
    FailedContactNotVerified,
}

/// Where an address string routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportRoute {
    Onion(String),
    Direct(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    Missing,
    Ambiguous,
    BadFormat,
}

/// Classify a stored peer address. No scheme is ever accepted; anything that
/// smuggles a path, query, fragment or userinfo is ambiguous rather than
/// guessable.
pub fn resolve_transport(raw: &str) -> std::result::Result<TransportRoute, ResolveError> {
    let addr = raw.trim();
    if addr.is_empty() {
        return Err(ResolveError::Missing);
    }
    if addr.contains("://") || addr.contains(['/', '?', '#', '@']) {
        return Err(ResolveError::Ambiguous);
    }

    match OnionAddress::parse(addr) {
        Ok(onion) => return Ok(TransportRoute::Onion(onion.authority())),
        // A host that claims .onion but does not parse is broken, not clearnet.
        Err(_) if addr.to_ascii_lowercase().contains(".onion") => {
            return Err(ResolveError::BadFormat)
        }
        Err(_) => {}
    }

    let (host, port) = match addr.rsplit_once(':') {
        Some((h, p)) => match p.parse::<u16>() {
            Ok(p) if p > 0 => (h, Some(p)),
            _ => return Err(ResolveError::BadFormat),
        },
        None => (addr, None),
    };
    let _ = port;

    let host_ok = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if !host_ok {
        return Err(ResolveError::BadFormat);
    }

    // Looks like a clearnet host. Only debug builds may use it.
    Ok(TransportRoute::Direct(addr.to_string()))
}

pub struct OutboundSender {
    db: Arc<Mutex<Database>>,
    vault: Arc<IdentityVault>,
    contacts: Arc<ContactManager>,
    codec: Arc<dyn SealedCodec>,
    /// SOCKS-aware client, present only while the transport is ready.
    socks_client: StdMutex<Option<reqwest::Client>>,
    /// Local ingress port, present only while the ingress is up.
    loopback_port: StdMutex<Option<u16>>,
    loopback_client: reqwest::Client,
    debug: bool,
}

impl OutboundSender {
    pub fn new(
        db: Arc<Mutex<Database>>,
        vault: Arc<IdentityVault>,
        contacts: Arc<ContactManager>,
        codec: Arc<dyn SealedCodec>,
        debug: bool,
    ) -> Result<Self> {
        let loopback_client = reqwest::Client::builder()
            .timeout(LOOPBACK_TIMEOUT)
            .build()?;

        Ok(Self {
            db,
            vault,
            contacts,
            codec,
            socks_client: StdMutex::new(None),
            loopback_port: StdMutex::new(None),
            loopback_client,
            debug,
        })
    }

    /// Attach the SOCKS endpoint published by the orchestrator.
    pub fn attach_socks_client(&self, host: &str, port: u16) -> Result<()> {
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(format!("socks5h://{host}:{port}"))?)
            .timeout(HTTP_TIMEOUT)
            .build()?;
        *self.socks_client.lock().expect("socks slot") = Some(client);
        debug!(host, port, "socks client attached");
        Ok(())
    }

    pub fn detach_socks_client(&self) {
        *self.socks_client.lock().expect("socks slot") = None;
        debug!("socks client detached");
    }

    pub fn set_loopback_port(&self, port: Option<u16>) {
        *self.loopback_port.lock().expect("loopback slot") = port;
    }

    /// Send a chat message. `to == self` routes through the local ingress so
    /// notes-to-self exercise the same pipeline as peer traffic.
    pub async fn send_message(&self, to: &Fingerprint, body: &str) -> Result<SendOutcome> {
        let identity = self
            .vault
            .active_identity()
            .await?
            .ok_or(NodeError::NoIdentity)?;

        let msg_id = Uuid::new_v4().to_string();
        let nonce = random_token(NONCE_RANDOM_BYTES);
        let created_at = now_ms();

        let inner = InnerMessage {
            v: ENVELOPE_VERSION,
            msg_id: msg_id.clone(),
            conv_id: identity.fingerprint.to_string(),
            body: body.to_string(),
            sender_onion: identity.onion.as_ref().map(|o| o.authority()),
        };
        let inner_json = serde_json::to_vec(&inner)
            .map_err(|e| NodeError::Other(format!("inner message encode: {e}")))?;

        if identity.fingerprint == *to {
            return self
                .dispatch_note_to_self(&identity, &msg_id, &nonce, created_at, &inner_json)
                .await;
        }

        let contact = self.contacts.get(to).await?.ok_or(NodeError::ContactNotFound)?;
        if contact.trust_level != TrustLevel::Verified {
            return Ok(SendOutcome::FailedContactNotVerified);
        }

        let payload = match self.seal(&identity, &contact.public_ring, &inner_json) {
            Some(payload) => payload,
            None => return Ok(SendOutcome::FailedCryptoError),
        };

        let row = outbound_row(
            &msg_id,
            TYPE_MSG,
            to,
            &identity.fingerprint,
            to,
            created_at,
            &payload,
        );
        self.db.lock().await.insert_message_if_absent(&row)?;

        let envelope = outer_envelope(TYPE_MSG, &msg_id, &identity.fingerprint, to, created_at, &nonce, &payload);
        let address = contact.onion.as_ref().map(|o| o.authority()).unwrap_or_default();
        self.deliver(&row.id, &address, &envelope).await
    }

    /// Notify a verified peer that this device's onion changed.
    pub async fn send_addr_update(
        &self,
        to: &Fingerprint,
        new_onion: &OnionAddress,
    ) -> Result<SendOutcome> {
        let identity = self
            .vault
            .active_identity()
            .await?
            .ok_or(NodeError::NoIdentity)?;

        let contact = self.contacts.get(to).await?.ok_or(NodeError::ContactNotFound)?;
        if contact.trust_level != TrustLevel::Verified {
            return Ok(SendOutcome::FailedContactNotVerified);
        }

        let msg_id = Uuid::new_v4().to_string();
        let nonce = random_token(NONCE_RANDOM_BYTES);
        let created_at = now_ms();

        let inner = InnerAddrUpdate {
            v: ENVELOPE_VERSION,
            kind: TYPE_ADDR_UPDATE.to_string(),
            msg_id: msg_id.clone(),
            sender_fp: identity.fingerprint.to_string(),
            recipient_fp: to.to_string(),
            conv_id: identity.fingerprint.to_string(),
            ts: created_at / 1000,
            nonce: nonce.clone(),
            new_onion: new_onion.authority(),
            old_onion: identity.onion.as_ref().map(|o| o.authority()),
        };
        let inner_json = serde_json::to_vec(&inner)
            .map_err(|e| NodeError::Other(format!("addr update encode: {e}")))?;

        let payload = match self.seal(&identity, &contact.public_ring, &inner_json) {
            Some(payload) => payload,
            None => return Ok(SendOutcome::FailedCryptoError),
        };

        let row = outbound_row(
            &msg_id,
            TYPE_ADDR_UPDATE,
            to,
            &identity.fingerprint,
            to,
            created_at,
            &payload,
        );
        self.db.lock().await.insert_message_if_absent(&row)?;

        let envelope = outer_envelope(
            TYPE_ADDR_UPDATE,
            &msg_id,
            &identity.fingerprint,
            to,
            created_at,
            &nonce,
            &payload,
        );
        let address = contact.onion.as_ref().map(|o| o.authority()).unwrap_or_default();
        self.deliver(&row.id, &address, &envelope).await
    }

    /// Re-attempt a queued outbound row: same payload and timestamps, fresh
    /// nonce.
    pub async fn retry(&self, row: &StoredMessage) -> Result<SendOutcome> {
        let identity = self
            .vault
            .active_identity()
            .await?
            .ok_or(NodeError::NoIdentity)?;

        let blob = CipherBlob::parse(&row.ciphertext)
            .ok_or_else(|| NodeError::Other("unparseable ciphertext column".into()))?;

        let nonce = random_token(NONCE_RANDOM_BYTES);
        let envelope = outer_envelope(
            &row.kind,
            &row.msg_id,
            &identity.fingerprint,
            &row.recipient_fp,
            row.created_at,
            &nonce,
            &blob.payload_b64,
        );

        if row.recipient_fp == identity.fingerprint {
            return self.post_loopback(&row.id, &envelope).await;
        }

        let contact = self
            .contacts
            .get(&row.recipient_fp)
            .await?
            .ok_or(NodeError::ContactNotFound)?;
        let address = contact.onion.as_ref().map(|o| o.authority()).unwrap_or_default();
        self.deliver(&row.id, &address, &envelope).await
    }

    async fn dispatch_note_to_self(
        &self,
        identity: &Identity,
        msg_id: &str,
        nonce: &str,
        created_at: i64,
        inner_json: &[u8],
    ) -> Result<SendOutcome> {
        // Sealed to our own ring so the loopback ingress can decrypt it.
        let payload = match self.seal(identity, &identity.public_ring, inner_json) {
            Some(payload) => payload,
            None => return Ok(SendOutcome::FailedCryptoError),
        };

        let row = outbound_row(
            msg_id,
            TYPE_MSG,
            &identity.fingerprint,
            &identity.fingerprint,
            &identity.fingerprint,
            created_at,
            &payload,
        );
        self.db.lock().await.insert_message_if_absent(&row)?;

        let envelope = outer_envelope(
            TYPE_MSG,
            msg_id,
            &identity.fingerprint,
            &identity.fingerprint,
            created_at,
            nonce,
            &payload,
        );
        self.post_loopback(&row.id, &envelope).await
    }

    /// Seal and sign; any failure (or an out-of-bounds payload) collapses to
    /// `None`, which callers report as `FailedCryptoError`.
    fn seal(&self, identity: &Identity, recipient_ring: &[u8], plaintext: &[u8]) -> Option<String> {
        let secret = match self.vault.unseal_secret_ring(identity) {
            Ok(secret) => secret,
            Err(e) => {
                warn!(error = %e, "secret ring unavailable for send");
                return None;
            }
        };

        let payload = match self.codec.encrypt_and_sign(
            plaintext,
            recipient_ring,
            &identity.public_ring,
            &secret,
        ) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "envelope sealing failed");
                return None;
            }
        };

        let payload: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
        if payload.is_empty() || payload.len() > MAX_PAYLOAD_B64_BYTES {
            warn!(len = payload.len(), "sealed payload out of bounds");
            return None;
        }
        Some(payload)
    }

    async fn deliver(
        &self,
        db_id: &str,
        address: &str,
        envelope: &Envelope,
    ) -> Result<SendOutcome> {
        match resolve_transport(address) {
            Err(ResolveError::Missing) => {
                self.mark_failed(db_id, "MISSING_ADDRESS").await?;
                Ok(SendOutcome::FailedMissingAddress)
            }
            Err(ResolveError::Ambiguous) | Err(ResolveError::BadFormat) => {
                self.mark_failed(db_id, "BAD_ADDRESS").await?;
                Ok(SendOutcome::FailedBadAddress)
            }
            Ok(TransportRoute::Onion(authority)) => {
                let client = self.socks_client.lock().expect("socks slot").clone();
                match client {
                    None => {
                        self.mark_retry(db_id, "TOR_NOT_READY").await?;
                        Ok(SendOutcome::QueuedTorNotReady)
                    }
                    Some(client) => {
                        self.post(&client, db_id, &authority, envelope).await
                    }
                }
            }
            Ok(TransportRoute::Direct(authority)) => {
                if self.debug {
                    let client = self.loopback_client.clone();
                    self.post(&client, db_id, &authority, envelope).await
                } else {
                    self.mark_failed(db_id, "BLOCKED_DIRECT_HTTP").await?;
                    Ok(SendOutcome::FailedBlockedDirectHttp)
                }
            }
        }
    }

    async fn post_loopback(&self, db_id: &str, envelope: &Envelope) -> Result<SendOutcome> {
        let port = *self.loopback_port.lock().expect("loopback slot");
        let Some(port) = port else {
            self.mark_retry(db_id, "LOCAL_NOT_READY").await?;
            return Ok(SendOutcome::QueuedLocalNotReady);
        };

        let client = self.loopback_client.clone();
        self.post(&client, db_id, &format!("127.0.0.1:{port}"), envelope)
            .await
    }

    async fn post(
        &self,
        client: &reqwest::Client,
        db_id: &str,
        authority: &str,
        envelope: &Envelope,
    ) -> Result<SendOutcome> {
        let url = format!("http://{authority}/v1/messages");
        debug!(url = %url, msg_id = %envelope.msg_id, "posting envelope");

        match client.post(&url).json(envelope).send().await {
            Ok(response) if response.status().is_success() => {
                self.db.lock().await.mark_message_sent(db_id, now_ms())?;
                info!(msg_id = %envelope.msg_id, "envelope delivered");
                Ok(SendOutcome::Sent)
            }
            Ok(response) => {
                let code = response.status().as_u16();
                self.mark_retry(db_id, &format!("HTTP_{code}")).await?;
                Ok(SendOutcome::QueuedHttpFail(code))
            }
            Err(e) => {
                debug!(error = %e, "envelope post failed at transport level");
                self.mark_retry(db_id, "HTTP_0").await?;
                Ok(SendOutcome::QueuedHttpFail(0))
            }
        }
    }

    async fn mark_failed(&self, db_id: &str, code: &str) -> Result<()> {
        self.db.lock().await.mark_message_failed(db_id, code)?;
        Ok(())
    }

    async fn mark_retry(&self, db_id: &str, code: &str) -> Result<()> {
        let db = self.db.lock().await;
        let attempts = db
            .message_by_db_id(db_id)
            .map(|m| m.attempt_count)
            .unwrap_or(0);
        let shift = (attempts + 1).min(RETRY_BACKOFF_CAP_SHIFT);
        let next_retry_at = now_ms() + (RETRY_BASE_DELAY_MS << shift);
        db.mark_message_retry(db_id, code, next_retry_at)?;
        Ok(())
    }
}

fn outbound_row(
    msg_id: &str,
    kind: &str,
    conv_id: &Fingerprint,
    sender_fp: &Fingerprint,
    recipient_fp: &Fingerprint,
    created_at: i64,
    payload: &str,
) -> StoredMessage {
    StoredMessage {
        id: StoredMessage::outbound_db_id(msg_id),
        msg_id: msg_id.to_string(),
        kind: kind.to_string(),
        conv_id: conv_id.clone(),
        direction: Direction::Out,
        sender_fp: sender_fp.clone(),
        recipient_fp: recipient_fp.clone(),
        created_at,
        server_received_at: 0,
        status: MessageStatus::Queued,
        attempt_count: 0,
        last_error: None,
        next_retry_at: 0,
        ciphertext: CipherBlob::outbound(payload).render(),
    }
}

fn outer_envelope(
    kind: &str,
    msg_id: &str,
    sender_fp: &Fingerprint,
    recipient_fp: &Fingerprint,
    created_at: i64,
    nonce: &str,
    payload: &str,
) -> Envelope {
    Envelope {
        v: ENVELOPE_VERSION,
        kind: kind.to_string(),
        msg_id: msg_id.to_string(),
        sender_fp: sender_fp.to_string(),
        recipient_fp: recipient_fp.to_string(),
        created_at,
        nonce: nonce.to_string(),
        payload_pgp: payload.to_string(),
        debug_plaintext: None,
    }
}
