//! Line-oriented client for the transport's control channel.
//!
//! One reader task demuxes the stream: asynchronous `650 HS_DESC` events
//! complete registered descriptor waiters, everything else is a command
//! reply. Commands are serialized behind one lock so request/reply pairing
//! can never interleave.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace, warn};

use crate::error::{Result, TorError};

/// Parsed `status/bootstrap-phase` answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPhase {
    pub progress: u8,
    pub tag: String,
    pub summary: String,
}

#[derive(Debug, Clone)]
pub struct AddOnionReply {
    pub service_id: String,
    /// Key material after the `ED25519-V3:` prefix; present only for
    /// `NEW:` requests without DiscardPK.
    pub private_key: Option<String>,
}

struct CommandIo {
    writer: OwnedWriteHalf,
    reply_rx: mpsc::UnboundedReceiver<String>,
}

pub struct ControlClient {
    io: Mutex<CommandIo>,
    desc_waiters: Arc<StdMutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl ControlClient {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TorError::ControlUnavailable(e.to_string()))?;
        let (read_half, writer) = stream.into_split();

        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let desc_waiters: Arc<StdMutex<HashMap<String, oneshot::Sender<()>>>> =
            Arc::new(StdMutex::new(HashMap::new()));

        let waiters = desc_waiters.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        trace!(line = %line, "control line");
                        if line.starts_with("650 ") {
                            handle_event(&line, &waiters);
                        } else if reply_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("control channel closed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "control channel read failed");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            io: Mutex::new(CommandIo { writer, reply_rx }),
            desc_waiters,
        })
    }

    /// Cookie authentication when a cookie is supplied, NULL auth otherwise.
    pub async fn authenticate(&self, cookie: Option<&[u8]>) -> Result<()> {
        let cmd = match cookie {
            Some(bytes) => format!("AUTHENTICATE {}", hex::encode(bytes)),
            None => "AUTHENTICATE".to_string(),
        };
        self.command(&cmd).await?;
        Ok(())
    }

    pub async fn watch_hs_desc(&self) -> Result<()> {
        self.command("SETEVENTS HS_DESC").await?;
        Ok(())
    }

    pub async fn bootstrap_phase(&self) -> Result<BootstrapPhase> {
        let lines = self.command("GETINFO status/bootstrap-phase").await?;
        lines
            .iter()
            .find_map(|l| parse_bootstrap_line(l))
            .ok_or_else(|| TorError::CommandFailed("unparseable bootstrap phase".into()))
    }

    /// `ADD_ONION <key_spec> Port=<virtual>,127.0.0.1:<local>`.
    pub async fn add_onion(
        &self,
        key_spec: &str,
        virtual_port: u16,
        local_port: u16,
        discard_pk: bool,
    ) -> Result<AddOnionReply> {
        let mut cmd = format!("ADD_ONION {key_spec}");
        if discard_pk {
            cmd.push_str(" Flags=DiscardPK");
        }
        cmd.push_str(&format!(" Port={virtual_port},127.0.0.1:{local_port}"));

        let lines = self.command(&cmd).await?;
        parse_add_onion_reply(&lines)
    }

    pub async fn del_onion(&self, service_id: &str) -> Result<()> {
        self.command(&format!("DEL_ONION {service_id}")).await?;
        Ok(())
    }

    /// Register interest in the next successful descriptor upload for a
    /// service. Re-registering the same id replaces the stale waiter.
    pub fn register_desc_waiter(&self, service_id: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.desc_waiters
            .lock()
            .expect("desc waiter lock")
            .insert(service_id.to_string(), tx);
        rx
    }

    pub fn clear_desc_waiter(&self, service_id: &str) {
        self.desc_waiters
            .lock()
            .expect("desc waiter lock")
            .remove(service_id);
    }

    async fn command(&self, cmd: &str) -> Result<Vec<String>> {
        let mut io = self.io.lock().await;

        io.writer
            .write_all(format!("{cmd}\r\n").as_bytes())
            .await
            .map_err(|e| TorError::ControlUnavailable(e.to_string()))?;
        io.writer
            .flush()
            .await
            .map_err(|e| TorError::ControlUnavailable(e.to_string()))?;

        let mut lines = Vec::new();
        loop {
            let line = io
                .reply_rx
                .recv()
                .await
                .ok_or_else(|| TorError::ControlUnavailable("reader gone".into()))?;
            let is_final = line.len() >= 4 && line.as_bytes()[3] == b' ';
            lines.push(line);
            if is_final {
                break;
            }
        }

        let final_line = lines.last().expect("at least the final line");
        if !final_line.starts_with("250") {
            return Err(TorError::CommandFailed(final_line.clone()));
        }
        Ok(lines)
    }
}

fn handle_event(line: &str, waiters: &StdMutex<HashMap<String, oneshot::Sender<()>>>) {
    let mut parts = line.split_whitespace();
    let _code = parts.next();
    if parts.next() != Some("HS_DESC") {
        return;
    }
    let action = parts.next().unwrap_or_default();
    let address = parts.next().unwrap_or_default();

    // Only a successful upload counts; FAILED lines leave the waiter armed.
    if action != "UPLOADED" {
        return;
    }

    if let Some(tx) = waiters.lock().expect("desc waiter lock").remove(address) {
        debug!(service = %address, "descriptor uploaded");
        let _ = tx.send(());
    }
}

fn parse_bootstrap_line(line: &str) -> Option<BootstrapPhase> {
    let idx = line.find("PROGRESS=")?;
    let rest = &line[idx..];

    let progress = scan_field(rest, "PROGRESS=")?.parse().ok()?;
    let tag = scan_field(rest, "TAG=")?.to_string();
    let summary = scan_quoted(rest, "SUMMARY=").unwrap_or_default();

    Some(BootstrapPhase {
        progress,
        tag,
        summary,
    })
}

fn scan_field<'a>(haystack: &'a str, key: &str) -> Option<&'a str> {
    let start = haystack.find(key)? + key.len();
    let rest = &haystack[start..];
    Some(rest.split_whitespace().next().unwrap_or(rest))
}

fn scan_quoted(haystack: &str, key: &str) -> Option<String> {
    let start = haystack.find(key)? + key.len();
    let rest = &haystack[start..];
    let inner = rest.strip_prefix('"')?;
    let end = inner.find('"')?;
    Some(inner[..end].to_string())
}

fn parse_add_onion_reply(lines: &[String]) -> Result<AddOnionReply> {
    let mut service_id = None;
    let mut private_key = None;

    for line in lines {
        let body = line
            .strip_prefix("250-")
            .or_else(|| line.strip_prefix("250+"))
            .unwrap_or(line);
        if let Some(id) = body.strip_prefix("ServiceID=") {
            service_id = Some(id.trim().to_string());
        } else if let Some(key) = body.strip_prefix("PrivateKey=") {
            private_key = key.trim().strip_prefix("ED25519-V3:").map(str::to_string);
        }
    }

    Ok(AddOnionReply {
        service_id: service_id
            .ok_or_else(|| TorError::CommandFailed("ADD_ONION reply missing ServiceID".into()))?,
        private_key,
    })
}
