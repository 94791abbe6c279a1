//! One-shot invite protocol.
//!
//! Server half: token-gated acceptance served from the ephemeral invite
//! onion. Client half: fetch a peer's acceptance payload over SOCKS and fold
//! it into the contact table through the common draft validator.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use murmure_shared::constants::{
    INVITE_PATH_PREFIX, INVITE_RESPONSE_VERSION, INVITE_TOKEN_BYTES, INVITE_TTL_MS,
};
use murmure_shared::exchange::{is_valid_invite_token, ContactDraft, InviteDescriptor};
use murmure_store::{Database, Invite, UpsertOutcome};

use crate::contacts::ContactManager;
use crate::error::{ErrorCode, NodeError, Rejection, Result};
use crate::util::{now_ms, random_token};
use crate::vault::IdentityVault;

/// The v=2 acceptance body returned to the first caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteAcceptResponse {
    pub v: u32,
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: String,
    pub protocol: String,
    pub fingerprint: String,
    pub primary_onion: String,
    pub pub_b64: String,
    pub pub_fmt: String,
    pub ts: i64,
}

pub struct InviteRegistry {
    db: Arc<Mutex<Database>>,
    vault: Arc<IdentityVault>,
}

impl InviteRegistry {
    pub fn new(db: Arc<Mutex<Database>>, vault: Arc<IdentityVault>) -> Self {
        Self { db, vault }
    }

    /// Mint a fresh one-shot token with the fixed TTL.
    pub async fn create_invite(&self) -> Result<Invite> {
        let now = now_ms();
        let invite = Invite {
            token: random_token(INVITE_TOKEN_BYTES),
            created_at: now,
            expires_at: now + INVITE_TTL_MS,
            used_at: None,
            consumer: None,
        };
        self.db.lock().await.insert_invite(&invite)?;
        info!(expires_at = invite.expires_at, "invite minted");
        Ok(invite)
    }

    /// Serve `GET /invite/<token>`: at most one caller ever receives 200.
    pub async fn accept(&self, token: &str) -> std::result::Result<InviteAcceptResponse, Rejection> {
        if !is_valid_invite_token(token) {
            return Err(Rejection::new(ErrorCode::NotFound));
        }

        let identity = match self.vault.active_identity().await {
            Ok(Some(identity)) => identity,
            Ok(None) => return Err(Rejection::new(ErrorCode::NoIdentity)),
            Err(_) => return Err(Rejection::new(ErrorCode::Internal)),
        };
        let Some(onion) = identity.onion.as_ref() else {
            return Err(Rejection::new(ErrorCode::NoOnion));
        };

        let now = now_ms();
        let db = self.db.lock().await;

        let invite = match db.invite_by_token(token) {
            Ok(Some(invite)) => invite,
            Ok(None) => return Err(Rejection::new(ErrorCode::NotFound)),
            Err(_) => return Err(Rejection::new(ErrorCode::Internal)),
        };
        if invite.is_used() {
            return Err(Rejection::new(ErrorCode::InviteUsed));
        }
        if invite.is_expired(now) {
            return Err(Rejection::new(ErrorCode::InviteExpired));
        }

        // The conditional update is the only winner selection; everything
        // above is a fast path for better error codes.
        match db.mark_used_if_valid(token, now) {
            Ok(true) => {}
            Ok(false) => return Err(Rejection::new(ErrorCode::InviteUsed)),
            Err(_) => return Err(Rejection::new(ErrorCode::Internal)),
        }

        debug!("invite consumed");
        Ok(InviteAcceptResponse {
            v: INVITE_RESPONSE_VERSION,
            ok: true,
            kind: "invite_accept".to_string(),
            protocol: "ec2".to_string(),
            fingerprint: identity.fingerprint.to_string(),
            primary_onion: onion.authority(),
            pub_b64: B64.encode(&identity.public_ring),
            pub_fmt: "pgp".to_string(),
            ts: now,
        })
    }

    pub async fn purge_dead(&self) -> Result<usize> {
        Ok(self.db.lock().await.purge_dead_invites(now_ms())?)
    }

    pub async fn live_count(&self) -> Result<i64> {
        Ok(self.db.lock().await.count_live_invites(now_ms())?)
    }
}

/// Client half: redeem a scanned `ec2|<onion>|<token>` descriptor through the
/// SOCKS proxy and import the returned contact.
pub async fn accept_remote_invite(
    descriptor: &InviteDescriptor,
    socks_client: &reqwest::Client,
    contacts: &ContactManager,
) -> Result<(ContactDraft, UpsertOutcome)> {
    let url = format!(
        "http://{}{}{}",
        descriptor.onion.authority(),
        INVITE_PATH_PREFIX,
        descriptor.token
    );
    debug!(url = %url, "redeeming invite");

    let response = socks_client.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(NodeError::InviteRejected(match response.status().as_u16() {
            404 => ErrorCode::NotFound,
            409 => ErrorCode::InviteUsed,
            410 => ErrorCode::InviteExpired,
            _ => ErrorCode::Internal,
        }));
    }

    let body: InviteAcceptResponse = response.json().await?;
    if body.v != INVITE_RESPONSE_VERSION || !body.ok || body.kind != "invite_accept" {
        return Err(NodeError::InviteRejected(ErrorCode::BadRequest));
    }

    let public_ring = B64
        .decode(body.pub_b64.trim())
        .map_err(|_| NodeError::InviteRejected(ErrorCode::BadRequest))?;
    let draft = ContactDraft::validate(
        &body.fingerprint,
        Some(body.primary_onion.as_str()),
        public_ring,
    )?;

    let outcome = contacts.import(&draft).await?;
    info!(fingerprint = draft.fingerprint.short(), "invite redeemed");
    Ok((draft, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::node_fixture;

    #[tokio::test]
    async fn accept_requires_identity_and_onion() {
        let fx = node_fixture();
        let registry = InviteRegistry::new(fx.db.clone(), fx.vault.clone());

        let invite = registry.create_invite().await.unwrap();
        let err = registry.accept(&invite.token).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NoIdentity);

        fx.vault.ensure_identity().await.unwrap();
        let err = registry.accept(&invite.token).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NoOnion);
    }

    #[tokio::test]
    async fn accept_is_one_shot() {
        let fx = node_fixture();
        let registry = InviteRegistry::new(fx.db.clone(), fx.vault.clone());

        fx.vault.ensure_identity().await.unwrap();
        fx.vault
            .bind_onion(&format!("{}.onion", "p".repeat(56)))
            .await
            .unwrap();

        let invite = registry.create_invite().await.unwrap();

        let accepted = registry.accept(&invite.token).await.unwrap();
        assert_eq!(accepted.v, 2);
        assert!(accepted.ok);
        assert_eq!(accepted.kind, "invite_accept");
        assert_eq!(accepted.protocol, "ec2");
        assert_eq!(accepted.primary_onion, format!("{}.onion", "p".repeat(56)));

        let err = registry.accept(&invite.token).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InviteUsed);
        assert_eq!(err.status, 409);
    }

    #[tokio::test]
    async fn unknown_and_malformed_tokens_are_not_found() {
        let fx = node_fixture();
        let registry = InviteRegistry::new(fx.db.clone(), fx.vault.clone());
        fx.vault.ensure_identity().await.unwrap();
        fx.vault
            .bind_onion(&format!("{}.onion", "p".repeat(56)))
            .await
            .unwrap();

        let err = registry.accept("short").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);

        let err = registry
            .accept(&"a".repeat(30))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
        assert_eq!(err.status, 404);
    }

    #[tokio::test]
    async fn expired_invite_is_gone() {
        let fx = node_fixture();
        let registry = InviteRegistry::new(fx.db.clone(), fx.vault.clone());
        fx.vault.ensure_identity().await.unwrap();
        fx.vault
            .bind_onion(&format!("{}.onion", "p".repeat(56)))
            .await
            .unwrap();

        // Insert an invite that is already past its expiry.
        let token = random_token(INVITE_TOKEN_BYTES);
        fx.db
            .lock()
            .await
            .insert_invite(&Invite {
                token: token.clone(),
                created_at: 1,
                expires_at: 2,
                used_at: None,
                consumer: None,
            })
            .unwrap();

        let err = registry.accept(&token).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InviteExpired);
        assert_eq!(err.status, 410);
    }

    #[tokio::test]
    async fn purge_drops_dead_invites() {
        let fx = node_fixture();
        let registry = InviteRegistry::new(fx.db.clone(), fx.vault.clone());
        fx.vault.ensure_identity().await.unwrap();
        fx.vault
            .bind_onion(&format!("{}.onion", "p".repeat(56)))
            .await
            .unwrap();

        let live = registry.create_invite().await.unwrap();
        let used = registry.create_invite().await.unwrap();
        registry.accept(&used.token).await.unwrap();

        assert_eq!(registry.live_count().await.unwrap(), 1);
        assert_eq!(registry.purge_dead().await.unwrap(), 1);
        assert!(fx
            .db
            .lock()
            .await
            .invite_by_token(&live.token)
            .unwrap()
            .is_some());
    }
}
