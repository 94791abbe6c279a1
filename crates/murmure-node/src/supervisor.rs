//! Service supervisor.
//!
//! One ordered boot sequence produces all reachability; a generation counter
//! makes stale boots self-cancel, so at most one runtime is ever effective.
//! A watchdog reboots with exponential backoff whenever readiness is lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, error, info, warn};

use murmure_shared::exchange::InviteDescriptor;
use murmure_store::UpsertOutcome;

use crate::context::NodeContext;
use crate::error::{NodeError, Result};
use crate::ingress::{start_ingress, IngressHandle, IngressState};
use crate::invite::accept_remote_invite;
use crate::util::now_ms;

const BOOT_BOOTSTRAP_BUDGET: Duration = Duration::from_secs(180);
const INGRESS_START_TIMEOUT: Duration = Duration::from_secs(5);
const WATCHDOG_BACKOFF_MIN: Duration = Duration::from_secs(2);
const WATCHDOG_BACKOFF_MAX: Duration = Duration::from_secs(30);
const INVITE_GC_INTERVAL: Duration = Duration::from_secs(60);
const RETRY_SWEEP_INTERVAL: Duration = Duration::from_secs(15);
const RETRY_SWEEP_BATCH: u32 = 16;
const MAX_SEND_ATTEMPTS: u32 = 10;

pub struct Supervisor {
    ctx: Arc<NodeContext>,
    boot_id: AtomicU64,
    ingress: Mutex<Option<IngressHandle>>,
}

impl Supervisor {
    pub fn new(ctx: Arc<NodeContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            boot_id: AtomicU64::new(0),
            ingress: Mutex::new(None),
        })
    }

    /// Run boot + watchdog forever. Returns only if this supervisor is
    /// superseded.
    pub async fn run(self: Arc<Self>) {
        self.spawn_invite_gc();
        self.spawn_retry_sweep();
        if self.ctx.config.debug {
            self.spawn_snapshot_writer();
        }

        let mut backoff = WATCHDOG_BACKOFF_MIN;
        loop {
            match self.boot().await {
                Ok(()) => {
                    backoff = WATCHDOG_BACKOFF_MIN;
                    self.wait_for_readiness_loss().await;
                    warn!("readiness lost, scheduling reboot");
                }
                Err(NodeError::BootSuperseded) => {
                    debug!("boot superseded, watchdog yielding");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "boot failed");
                }
            }

            sleep(backoff).await;
            backoff = (backoff * 2).min(WATCHDOG_BACKOFF_MAX);
        }
    }

    /// The single ordered boot sequence.
    pub async fn boot(&self) -> Result<()> {
        let my_id = self.boot_id.fetch_add(1, Ordering::SeqCst) + 1;
        let ctx = &self.ctx;

        info!(boot = my_id, step = "ensure_identity", "boot");
        ctx.vault.ensure_identity().await?;
        self.ensure_current(my_id)?;

        info!(boot = my_id, step = "detach_sender", "boot");
        ctx.sender.detach_socks_client();
        ctx.sender.set_loopback_port(None);

        info!(boot = my_id, step = "start_or_reset_transport", "boot");
        let prefs = ctx.prefs.load();
        ctx.tor.set_onion_hint(prefs.last_onion.clone()).await;
        ctx.tor.begin_boot().await;
        // A reboot may find the previous control client still attached even
        // though readiness is gone; tear it down rather than trust it.
        ctx.tor.reconnect().await?;
        self.ensure_current(my_id)?;

        info!(boot = my_id, step = "await_bootstrap", "boot");
        let (socks_host, socks_port) = ctx.tor.await_ready(BOOT_BOOTSTRAP_BUDGET).await?;
        self.ensure_current(my_id)?;

        info!(boot = my_id, step = "start_local_ingress", "boot");
        self.stop_ingress().await;
        let state = IngressState {
            pipeline: ctx.pipeline.clone(),
            invites: ctx.invites.clone(),
            contacts: ctx.contacts.clone(),
            vault: ctx.vault.clone(),
            tor_state: ctx.tor.subscribe(),
            port: 0,
            debug: ctx.config.debug,
        };
        let handle = timeout(INGRESS_START_TIMEOUT, start_ingress(state))
            .await
            .map_err(|_| NodeError::Other("ingress start timed out".into()))??;
        let local_port = handle.port;
        *self.ingress.lock().await = Some(handle);
        self.ensure_current(my_id)?;

        info!(boot = my_id, step = "ensure_hidden_service", "boot");
        let onion = ctx
            .tor
            .ensure_hidden_service(local_port, ctx.config.virtual_port)
            .await?;
        self.ensure_current(my_id)?;

        info!(boot = my_id, step = "bind_onion", "boot");
        ctx.vault.bind_onion(&onion.authority()).await?;

        info!(boot = my_id, step = "attach_sender", "boot");
        ctx.sender.attach_socks_client(&socks_host, socks_port)?;
        ctx.sender.set_loopback_port(Some(local_port));

        if let Err(e) = ctx.prefs.update(|p| p.last_onion = Some(onion.authority())) {
            warn!(error = %e, "could not persist last onion");
        }

        info!(boot = my_id, onion = %onion, port = local_port, "READY");
        Ok(())
    }

    fn ensure_current(&self, my_id: u64) -> Result<()> {
        if self.boot_id.load(Ordering::SeqCst) != my_id {
            return Err(NodeError::BootSuperseded);
        }
        Ok(())
    }

    async fn wait_for_readiness_loss(&self) {
        let mut rx = self.ctx.tor.subscribe();
        loop {
            if rx.changed().await.is_err() {
                return;
            }
            if !rx.borrow().is_ready() {
                return;
            }
        }
    }

    async fn stop_ingress(&self) {
        if let Some(handle) = self.ingress.lock().await.take() {
            handle.shutdown().await;
        }
    }

    /// Full teardown, releasing the ingress port and the transport.
    pub async fn shutdown(&self) {
        // Invalidate every in-flight boot first.
        self.boot_id.fetch_add(1, Ordering::SeqCst);
        self.ctx.sender.detach_socks_client();
        self.ctx.sender.set_loopback_port(None);
        self.stop_ingress().await;
        if let Err(e) = self.ctx.tor.stop_service().await {
            warn!(error = %e, "transport teardown failed");
        }
        info!("supervisor shut down");
    }

    /// Mint an invite and make sure the ephemeral invite onion is published.
    pub async fn create_invite(&self) -> Result<InviteDescriptor> {
        let local_port = self
            .ingress
            .lock()
            .await
            .as_ref()
            .map(|h| h.port)
            .ok_or_else(|| NodeError::Other("ingress not running".into()))?;

        let onion = self
            .ctx
            .tor
            .ensure_invite_hidden_service(local_port, self.ctx.config.virtual_port)
            .await?;
        let invite = self.ctx.invites.create_invite().await?;

        Ok(InviteDescriptor {
            onion,
            token: invite.token,
        })
    }

    /// Redeem a scanned invite descriptor against the remote peer.
    pub async fn accept_invite(&self, code: &str) -> Result<UpsertOutcome> {
        let descriptor = InviteDescriptor::decode(code)?;

        let state = self.ctx.tor.current_state();
        let (socks_host, socks_port) = state
            .socks()
            .ok_or_else(|| NodeError::Other("transport not ready".into()))?;

        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(format!(
                "socks5h://{socks_host}:{socks_port}"
            ))?)
            .timeout(Duration::from_secs(60))
            .build()?;

        let (_, outcome) = accept_remote_invite(&descriptor, &client, &self.ctx.contacts).await?;
        Ok(outcome)
    }

    fn spawn_invite_gc(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(INVITE_GC_INTERVAL);
            loop {
                tick.tick().await;

                match this.ctx.invites.purge_dead().await {
                    Ok(purged) if purged > 0 => debug!(purged, "invite GC"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "invite GC failed"),
                }

                match this.ctx.invites.live_count().await {
                    Ok(0) => this.ctx.tor.drop_invite_hidden_service().await,
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "invite count failed"),
                }
            }
        });
    }

    fn spawn_retry_sweep(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(RETRY_SWEEP_INTERVAL);
            loop {
                tick.tick().await;

                if !this.ctx.tor.current_state().is_ready() {
                    continue;
                }

                let due = match this
                    .ctx
                    .db
                    .lock()
                    .await
                    .queued_outbound_due(now_ms(), RETRY_SWEEP_BATCH)
                {
                    Ok(due) => due,
                    Err(e) => {
                        warn!(error = %e, "retry sweep query failed");
                        continue;
                    }
                };

                for row in due {
                    if row.attempt_count >= MAX_SEND_ATTEMPTS {
                        warn!(msg_id = %row.msg_id, "giving up after max attempts");
                        let _ = this
                            .ctx
                            .db
                            .lock()
                            .await
                            .mark_message_failed(&row.id, "MAX_RETRIES_EXCEEDED");
                        continue;
                    }
                    match this.ctx.sender.retry(&row).await {
                        Ok(outcome) => debug!(msg_id = %row.msg_id, ?outcome, "retry attempt"),
                        Err(e) => warn!(msg_id = %row.msg_id, error = %e, "retry errored"),
                    }
                }
            }
        });
    }

    fn spawn_snapshot_writer(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut rx = this.ctx.tor.subscribe();
            loop {
                let state = rx.borrow().clone();
                let port = this.ingress.lock().await.as_ref().map(|h| h.port);
                let snapshot = RuntimeSnapshot::from_state(&state, port);

                let path = this.ctx.config.runtime_snapshot_path();
                if let Ok(json) = serde_json::to_string_pretty(&snapshot) {
                    if let Err(e) = std::fs::write(&path, json) {
                        warn!(error = %e, "runtime snapshot write failed");
                    }
                }

                if rx.changed().await.is_err() {
                    return;
                }
            }
        });
    }
}

/// Debug-only `runtime.json` contents.
#[derive(Debug, Serialize)]
struct RuntimeSnapshot {
    v: u32,
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    onion: Option<String>,
    #[serde(rename = "localPort", skip_serializing_if = "Option::is_none")]
    local_port: Option<u16>,
    #[serde(rename = "socksHost", skip_serializing_if = "Option::is_none")]
    socks_host: Option<String>,
    #[serde(rename = "socksPort", skip_serializing_if = "Option::is_none")]
    socks_port: Option<u16>,
    #[serde(rename = "errorCode", skip_serializing_if = "Option::is_none")]
    error_code: Option<&'static str>,
    #[serde(rename = "errorDetail", skip_serializing_if = "Option::is_none")]
    error_detail: Option<String>,
    ts: i64,
}

impl RuntimeSnapshot {
    fn from_state(state: &murmure_tor::TorState, port: Option<u16>) -> Self {
        let (error_code, error_detail) = match state {
            murmure_tor::TorState::Error { code, detail, .. } => {
                (Some(code.as_str()), Some(detail.clone()))
            }
            _ => (None, None),
        };

        Self {
            v: 1,
            state: state.tag(),
            onion: state.onion().map(str::to_string),
            local_port: port,
            socks_host: state.socks().map(|(h, _)| h.to_string()),
            socks_port: state.socks().map(|(_, p)| p),
            error_code,
            error_detail,
            ts: now_ms(),
        }
    }
}
