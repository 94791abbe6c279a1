//! Transport orchestrator.
//!
//! Owns the external tor runtime (spawned or already running), the control
//! channel, and the observable [`TorState`]. The primary hidden service key
//! survives restarts in sealed form; the invite service is always ephemeral.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use murmure_shared::types::OnionAddress;
use murmure_shared::DeviceKek;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::control::ControlClient;
use crate::error::{Result, TorError};
use crate::hs_keys;
use crate::state::{TorErrorCode, TorState};

/// Bootstrap progress poll cadence.
const BOOTSTRAP_POLL_INTERVAL: Duration = Duration::from_millis(750);

/// Bootstrap budget used when the orchestrator restarts itself.
const AUTO_RESET_BOOTSTRAP_BUDGET: Duration = Duration::from_secs(120);

/// Default descriptor upload budget for both the primary and the invite
/// service.
const DEFAULT_HS_PUBLISH_TIMEOUT: Duration = Duration::from_secs(120);

const CONTROL_CONNECT_ATTEMPTS: u32 = 20;
const CONTROL_CONNECT_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct TorConfig {
    /// Root for the runtime directory and the sealed hidden-service key.
    pub data_dir: PathBuf,
    pub control_addr: String,
    pub socks_host: String,
    pub socks_port: u16,
    /// When set, the orchestrator spawns and owns the tor process itself;
    /// otherwise it attaches to an already-running runtime.
    pub tor_binary: Option<PathBuf>,
    /// Control auth cookie for externally managed runtimes.
    pub cookie_path: Option<PathBuf>,
    pub hs_publish_timeout: Duration,
}

impl TorConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            control_addr: "127.0.0.1:9051".to_string(),
            socks_host: "127.0.0.1".to_string(),
            socks_port: 9050,
            tor_binary: None,
            cookie_path: None,
            hs_publish_timeout: DEFAULT_HS_PUBLISH_TIMEOUT,
        }
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.data_dir.join("tor-runtime")
    }

    pub fn hs_key_path(&self) -> PathBuf {
        self.data_dir.join(hs_keys::HS_KEY_FILE)
    }
}

struct InviteService {
    onion: OnionAddress,
    service_id: String,
}

#[derive(Default)]
struct Inner {
    control: Option<Arc<ControlClient>>,
    child: Option<tokio::process::Child>,
    primary_service_id: Option<String>,
    invite: Option<InviteService>,
    /// One automatic wipe-and-restart per boot, no more.
    auto_reset_done: bool,
    onion_hint: Option<String>,
}

pub struct TorOrchestrator {
    config: TorConfig,
    kek: Arc<DeviceKek>,
    state_tx: watch::Sender<TorState>,
    inner: Mutex<Inner>,
}

impl TorOrchestrator {
    pub fn new(config: TorConfig, kek: Arc<DeviceKek>) -> Self {
        let (state_tx, _) = watch::channel(TorState::Stopped);
        Self {
            config,
            kek,
            state_tx,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TorState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> TorState {
        self.state_tx.borrow().clone()
    }

    /// Seed the last-known onion for UI display before the service is
    /// reachable again.
    pub async fn set_onion_hint(&self, hint: Option<String>) {
        self.inner.lock().await.onion_hint = hint;
    }

    pub async fn onion_hint(&self) -> Option<String> {
        self.inner.lock().await.onion_hint.clone()
    }

    fn publish(&self, state: TorState) {
        debug!(state = state.tag(), "transport state");
        self.state_tx.send_replace(state);
    }

    /// Begin a fresh boot: arm the one-shot auto reset again.
    pub async fn begin_boot(&self) {
        self.inner.lock().await.auto_reset_done = false;
    }

    pub async fn start(&self) -> Result<()> {
        if self.inner.lock().await.control.is_some() {
            debug!("transport already started");
            return Ok(());
        }

        self.publish(TorState::Starting);

        if let Some(binary) = &self.config.tor_binary {
            let runtime_dir = self.config.runtime_dir();
            std::fs::create_dir_all(&runtime_dir)?;

            info!(binary = %binary.display(), "spawning transport runtime");
            let child = tokio::process::Command::new(binary)
                .arg("--ControlPort")
                .arg(&self.config.control_addr)
                .arg("--SocksPort")
                .arg(format!(
                    "{}:{}",
                    self.config.socks_host, self.config.socks_port
                ))
                .arg("--DataDirectory")
                .arg(&runtime_dir)
                .arg("--CookieAuthentication")
                .arg("0")
                .kill_on_drop(true)
                .spawn()?;
            self.inner.lock().await.child = Some(child);
        }

        let control = self.connect_control().await?;
        if let Err(e) = async {
            control.authenticate(self.read_cookie().as_deref()).await?;
            control.watch_hs_desc().await
        }
        .await
        {
            let hint = self.inner.lock().await.onion_hint.clone();
            self.publish(TorState::Error {
                code: TorErrorCode::ControlUnavailable,
                detail: e.to_string(),
                recoverable: true,
                onion_hint: hint,
            });
            return Err(e);
        }
        self.inner.lock().await.control = Some(control);

        Ok(())
    }

    async fn connect_control(&self) -> Result<Arc<ControlClient>> {
        let mut last_err = None;
        for attempt in 0..CONTROL_CONNECT_ATTEMPTS {
            match ControlClient::connect(&self.config.control_addr).await {
                Ok(client) => return Ok(Arc::new(client)),
                Err(e) => {
                    if attempt + 1 < CONTROL_CONNECT_ATTEMPTS {
                        sleep(CONTROL_CONNECT_BACKOFF).await;
                    }
                    last_err = Some(e);
                }
            }
        }

        let err = last_err.unwrap_or_else(|| TorError::ControlUnavailable("unreachable".into()));
        let hint = self.inner.lock().await.onion_hint.clone();
        self.publish(TorState::Error {
            code: TorErrorCode::ControlUnavailable,
            detail: err.to_string(),
            recoverable: true,
            onion_hint: hint,
        });
        Err(err)
    }

    fn read_cookie(&self) -> Option<Vec<u8>> {
        let path = self
            .config
            .cookie_path
            .clone()
            .unwrap_or_else(|| self.config.runtime_dir().join("control_auth_cookie"));
        std::fs::read(path).ok()
    }

    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.control = None;
        inner.invite = None;
        inner.primary_service_id = None;

        if let Some(mut child) = inner.child.take() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill transport runtime");
            }
        }

        drop(inner);
        self.publish(TorState::Stopped);
        Ok(())
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    /// Full teardown: ephemeral services first, then the runtime.
    pub async fn stop_service(&self) -> Result<()> {
        self.drop_invite_hidden_service().await;
        self.stop().await
    }

    /// Poll bootstrap progress until `PROGRESS=100 TAG=done` or the budget
    /// runs out.
    pub async fn await_ready(&self, budget: Duration) -> Result<(String, u16)> {
        let control = self.control().await?;
        let deadline = Instant::now() + budget;

        loop {
            match control.bootstrap_phase().await {
                Ok(phase) => {
                    self.publish(TorState::Bootstrapping {
                        progress: phase.progress,
                        tag: phase.tag.clone(),
                        summary: phase.summary.clone(),
                    });

                    if phase.progress >= 100 && phase.tag == "done" {
                        let socks = (self.config.socks_host.clone(), self.config.socks_port);
                        self.publish(TorState::TransportReady {
                            socks_host: socks.0.clone(),
                            socks_port: socks.1,
                        });
                        info!("transport bootstrapped");
                        return Ok(socks);
                    }
                }
                Err(e) => {
                    let hint = self.inner.lock().await.onion_hint.clone();
                    self.publish(TorState::Error {
                        code: TorErrorCode::ControlUnavailable,
                        detail: e.to_string(),
                        recoverable: true,
                        onion_hint: hint,
                    });
                    return Err(e);
                }
            }

            if Instant::now() + BOOTSTRAP_POLL_INTERVAL > deadline {
                let hint = self.inner.lock().await.onion_hint.clone();
                self.publish(TorState::Error {
                    code: TorErrorCode::BootstrapTimeout,
                    detail: format!("bootstrap incomplete after {budget:?}"),
                    recoverable: true,
                    onion_hint: hint,
                });
                return Err(TorError::BootstrapTimeout(budget));
            }
            sleep(BOOTSTRAP_POLL_INTERVAL).await;
        }
    }

    /// Publish the primary hidden service, reusing the sealed key when one
    /// exists. A descriptor-upload timeout triggers one automatic
    /// wipe-and-restart per boot before giving up.
    pub async fn ensure_hidden_service(
        &self,
        local_port: u16,
        virtual_port: u16,
    ) -> Result<OnionAddress> {
        match self.publish_primary(local_port, virtual_port).await {
            Ok(onion) => Ok(onion),
            Err(TorError::HsPublishTimeout(budget)) => {
                let reset_now = {
                    let mut inner = self.inner.lock().await;
                    if inner.auto_reset_done {
                        false
                    } else {
                        inner.auto_reset_done = true;
                        true
                    }
                };
                if !reset_now {
                    return Err(TorError::HsPublishTimeout(budget));
                }

                warn!("descriptor upload timed out; wiping transport state and restarting once");
                self.reset_transport_only().await?;
                self.start().await?;
                self.await_ready(AUTO_RESET_BOOTSTRAP_BUDGET).await?;
                self.publish_primary(local_port, virtual_port).await
            }
            Err(e) => Err(e),
        }
    }

    async fn publish_primary(&self, local_port: u16, virtual_port: u16) -> Result<OnionAddress> {
        let control = self.control().await?;

        let key_path = self.config.hs_key_path();
        let stored = hs_keys::load_hs_key(&key_path, &self.kek)?;
        let key_spec = match &stored {
            Some(key) => format!("ED25519-V3:{}", key.as_str()),
            None => "NEW:ED25519-V3".to_string(),
        };

        let reply = control
            .add_onion(&key_spec, virtual_port, local_port, false)
            .await?;
        if let Some(private_key) = &reply.private_key {
            hs_keys::store_hs_key(&key_path, &self.kek, private_key)?;
        }

        let onion = OnionAddress::parse(&format!("{}.onion", reply.service_id))
            .map_err(|e| TorError::CommandFailed(format!("bad service id: {e}")))?;

        self.publish(TorState::HiddenServicePublishing {
            onion: onion.authority(),
        });

        let uploaded = control.register_desc_waiter(&reply.service_id);
        match timeout(self.config.hs_publish_timeout, uploaded).await {
            Ok(Ok(())) => {
                let mut inner = self.inner.lock().await;
                inner.primary_service_id = Some(reply.service_id.clone());
                inner.onion_hint = Some(onion.authority());
                drop(inner);

                self.publish(TorState::Ready {
                    onion: onion.authority(),
                    socks_host: self.config.socks_host.clone(),
                    socks_port: self.config.socks_port,
                });
                info!(onion = %onion, "hidden service published");
                Ok(onion)
            }
            _ => {
                control.clear_desc_waiter(&reply.service_id);
                let hint = self.inner.lock().await.onion_hint.clone();
                self.publish(TorState::Error {
                    code: TorErrorCode::HsPublishTimeout,
                    detail: format!("no descriptor upload within {:?}", self.config.hs_publish_timeout),
                    recoverable: true,
                    onion_hint: hint,
                });
                Err(TorError::HsPublishTimeout(self.config.hs_publish_timeout))
            }
        }
    }

    /// Publish (or return the memoized) ephemeral invite service. Its key is
    /// discarded by the runtime and never touches disk.
    pub async fn ensure_invite_hidden_service(
        &self,
        local_port: u16,
        virtual_port: u16,
    ) -> Result<OnionAddress> {
        if let Some(invite) = &self.inner.lock().await.invite {
            return Ok(invite.onion.clone());
        }

        let control = self.control().await?;
        let reply = control
            .add_onion("NEW:ED25519-V3", virtual_port, local_port, true)
            .await?;

        let onion = OnionAddress::parse(&format!("{}.onion", reply.service_id))
            .map_err(|e| TorError::CommandFailed(format!("bad service id: {e}")))?;

        let uploaded = control.register_desc_waiter(&reply.service_id);
        match timeout(self.config.hs_publish_timeout, uploaded).await {
            Ok(Ok(())) => {
                info!(onion = %onion, "invite service published");
                self.inner.lock().await.invite = Some(InviteService {
                    onion: onion.clone(),
                    service_id: reply.service_id,
                });
                Ok(onion)
            }
            _ => {
                control.clear_desc_waiter(&reply.service_id);
                let _ = control.del_onion(&reply.service_id).await;
                Err(TorError::HsPublishTimeout(self.config.hs_publish_timeout))
            }
        }
    }

    /// Best-effort removal of the ephemeral invite service.
    pub async fn drop_invite_hidden_service(&self) {
        let (control, invite) = {
            let mut inner = self.inner.lock().await;
            (inner.control.clone(), inner.invite.take())
        };

        if let (Some(control), Some(invite)) = (control, invite) {
            if let Err(e) = control.del_onion(&invite.service_id).await {
                warn!(error = %e, "DEL_ONION for invite service failed");
            } else {
                info!(onion = %invite.onion, "invite service dropped");
            }
        }
    }

    /// Wipe everything transport-owned: sealed key, runtime directory, onion
    /// hint. Identity and store are untouched.
    pub async fn reset_transport_only(&self) -> Result<()> {
        self.stop().await?;

        hs_keys::delete_hs_key(&self.config.hs_key_path())?;

        let runtime_dir = self.config.runtime_dir();
        if runtime_dir.exists() {
            std::fs::remove_dir_all(&runtime_dir)?;
        }

        self.inner.lock().await.onion_hint = None;
        self.publish(TorState::Stopped);
        Ok(())
    }

    async fn control(&self) -> Result<Arc<ControlClient>> {
        self.inner
            .lock()
            .await
            .control
            .clone()
            .ok_or_else(|| TorError::ControlUnavailable("transport not started".into()))
    }
}
