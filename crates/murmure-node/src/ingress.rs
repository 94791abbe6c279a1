//! Local ingress: the loopback HTTP surface the hidden service forwards to.
//!
//! Binds an OS-assigned port on 127.0.0.1 and exposes exactly the routes in
//! the table below; everything else is a hard 404. All responses share the
//! `{"v":1,"ok":…}` JSON envelope.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::Deserialize;
use tokio::sync::{oneshot, watch};
use tracing::{error, info};

use murmure_shared::constants::MAX_INGRESS_BODY_BYTES;
use murmure_shared::envelope::Envelope;
use murmure_shared::exchange::{decode_contact_card, encode_contact_card, ContactDraft};
use murmure_store::UpsertOutcome;
use murmure_tor::TorState;

use crate::contacts::ContactManager;
use crate::error::{ErrorCode, Rejection, Result};
use crate::inbound::InboundPipeline;
use crate::invite::InviteRegistry;
use crate::vault::IdentityVault;

#[derive(Clone)]
pub struct IngressState {
    pub pipeline: Arc<InboundPipeline>,
    pub invites: Arc<InviteRegistry>,
    pub contacts: Arc<ContactManager>,
    pub vault: Arc<IdentityVault>,
    pub tor_state: watch::Receiver<TorState>,
    pub port: u16,
    pub debug: bool,
}

pub struct IngressHandle {
    pub port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl IngressHandle {
    /// Stop the server and wait for the port to be released.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
        info!(port = self.port, "ingress stopped");
    }
}

pub fn build_router(state: IngressState) -> Router {
    let mut router = Router::new()
        .route("/v1/health", get(health))
        .route("/invite/{token}", get(invite_accept))
        .route("/v1/messages", post(inbound_message))
        .route("/v1/contact_import", post(contact_import));

    if state.debug {
        router = router
            .route("/v1/debug/state", get(debug_state))
            .route("/v1/debug/identity", get(debug_identity));
    }

    // A wrong method on a known path is just as outside the table as an
    // unknown path; both hard-404 with the JSON envelope.
    router
        .fallback(not_found)
        .method_not_allowed_fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_INGRESS_BODY_BYTES))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind 127.0.0.1 on an ephemeral port and serve until shut down.
pub async fn start_ingress(mut state: IngressState) -> Result<IngressHandle> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    state.port = port;

    let app = build_router(state);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(e) = serve.await {
            error!(error = %e, "ingress server failed");
        }
    });

    info!(port, "ingress listening on loopback");
    Ok(IngressHandle {
        port,
        shutdown: Some(shutdown_tx),
        task,
    })
}

fn ok_response(mut extra: serde_json::Value) -> Response {
    if let Some(obj) = extra.as_object_mut() {
        obj.insert("v".into(), 1.into());
        obj.insert("ok".into(), true.into());
    }
    Json(extra).into_response()
}

fn reject_response(rejection: &Rejection) -> Response {
    let status =
        StatusCode::from_u16(rejection.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = serde_json::json!({
        "v": 1,
        "ok": false,
        "code": rejection.code.as_str(),
    });
    if let Some(msg_id) = &rejection.msg_id {
        body["msg_id"] = serde_json::Value::String(msg_id.clone());
    }
    (status, Json(body)).into_response()
}

fn code_response(code: ErrorCode) -> Response {
    reject_response(&Rejection::new(code))
}

async fn health(State(state): State<IngressState>) -> Response {
    let tor = state.tor_state.borrow().clone();
    let status = if tor.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = serde_json::json!({
        "v": 1,
        "ok": tor.is_ready(),
        "state": tor.tag(),
        "port": state.port,
    });
    (status, Json(body)).into_response()
}

async fn invite_accept(
    State(state): State<IngressState>,
    Path(token): Path<String>,
) -> Response {
    match state.invites.accept(&token).await {
        Ok(accepted) => Json(accepted).into_response(),
        Err(rejection) => reject_response(&rejection),
    }
}

async fn inbound_message(State(state): State<IngressState>, body: Bytes) -> Response {
    let envelope: Envelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(_) => return code_response(ErrorCode::BadRequest),
    };

    match state.pipeline.handle(&envelope).await {
        Ok(msg_id) => ok_response(serde_json::json!({ "msg_id": msg_id })),
        Err(rejection) => reject_response(&rejection),
    }
}

/// A contact arrives either as an `ec1|…` card (file, QR, share sheet) or as
/// explicit fields (manual entry). Both shapes end in the same validator.
#[derive(Deserialize)]
struct ContactImportRequest {
    #[serde(default)]
    card: Option<String>,
    #[serde(default)]
    fingerprint: Option<String>,
    #[serde(default)]
    onion: Option<String>,
    #[serde(default)]
    pub_b64: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

async fn contact_import(State(state): State<IngressState>, body: Bytes) -> Response {
    let request: ContactImportRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return code_response(ErrorCode::BadRequest),
    };

    let draft = match (&request.card, &request.fingerprint, &request.pub_b64) {
        (Some(card), _, _) => match decode_contact_card(card) {
            Ok(draft) => draft,
            Err(_) => return code_response(ErrorCode::BadRequest),
        },
        (None, Some(fingerprint), Some(pub_b64)) => {
            let public_ring = match B64.decode(pub_b64.trim()) {
                Ok(ring) => ring,
                Err(_) => return code_response(ErrorCode::BadRequest),
            };
            match ContactDraft::validate(fingerprint, request.onion.as_deref(), public_ring) {
                Ok(draft) => draft,
                Err(_) => return code_response(ErrorCode::BadRequest),
            }
        }
        _ => return code_response(ErrorCode::BadRequest),
    };

    // Importing the device's own identity as a contact is always a mistake.
    if let Ok(Some(identity)) = state.vault.active_identity().await {
        if identity.fingerprint == draft.fingerprint {
            return code_response(ErrorCode::SelfContactNotAllowed);
        }
    }

    let outcome = match state.contacts.import(&draft).await {
        Ok(outcome) => outcome,
        Err(_) => return code_response(ErrorCode::Internal),
    };

    if let Some(name) = request.display_name.as_deref() {
        let _ = state
            .contacts
            .set_display_name(&draft.fingerprint, Some(name))
            .await;
    }

    ok_response(serde_json::json!({
        "fingerprint": draft.fingerprint.as_str(),
        "outcome": outcome_tag(&outcome),
    }))
}

fn outcome_tag(outcome: &UpsertOutcome) -> &'static str {
    match outcome {
        UpsertOutcome::Inserted => "inserted",
        UpsertOutcome::NoChange => "no_change",
        UpsertOutcome::UpdatedUnverified => "updated_unverified",
        UpsertOutcome::PendingApproval { .. } => "pending_approval",
    }
}

async fn debug_state(State(state): State<IngressState>) -> Response {
    let tor = state.tor_state.borrow().clone();
    ok_response(serde_json::json!({
        "state": tor.tag(),
        "onion": tor.onion(),
        "port": state.port,
    }))
}

async fn debug_identity(State(state): State<IngressState>) -> Response {
    match state.vault.active_identity().await {
        Ok(Some(identity)) => {
            let card = identity.onion.as_ref().and_then(|onion| {
                encode_contact_card(&identity.fingerprint, onion, &identity.public_ring).ok()
            });
            ok_response(serde_json::json!({
                "fingerprint": identity.fingerprint.as_str(),
                "onion": identity.onion.as_ref().map(|o| o.authority()),
                "pub_b64": B64.encode(&identity.public_ring),
                "card": card,
            }))
        }
        Ok(None) => code_response(ErrorCode::NoIdentity),
        Err(_) => code_response(ErrorCode::Internal),
    }
}

async fn not_found() -> Response {
    code_response(ErrorCode::NotFound)
}
