//! Orchestrator flows against a scripted control endpoint: bootstrap,
//! publication, key reuse, the ephemeral invite service, and the one-shot
//! wipe-and-restart after a descriptor-upload timeout.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use murmure_shared::DeviceKek;
use murmure_tor::{TorConfig, TorErrorCode, TorError, TorOrchestrator, TorState};

const SERVICE_ID: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

/// Minimal scripted control endpoint. Answers the command grammar the
/// orchestrator speaks; optionally confirms descriptor uploads shortly after
/// each ADD_ONION.
async fn spawn_mock_control(
    confirm_uploads: bool,
) -> (String, Arc<Mutex<Vec<String>>>, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let commands = Arc::new(Mutex::new(Vec::new()));
    let connections = Arc::new(AtomicUsize::new(0));

    let cmds = commands.clone();
    let conns = connections.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            conns.fetch_add(1, Ordering::SeqCst);

            let cmds = cmds.clone();
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();

                while let Ok(Some(line)) = lines.next_line().await {
                    cmds.lock().await.push(line.clone());

                    if line.starts_with("AUTHENTICATE")
                        || line.starts_with("SETEVENTS")
                        || line.starts_with("DEL_ONION")
                    {
                        if write.write_all(b"250 OK\r\n").await.is_err() {
                            return;
                        }
                    } else if line.starts_with("GETINFO status/bootstrap-phase") {
                        let reply = "250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY=\"Done\"\r\n250 OK\r\n";
                        if write.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    } else if line.starts_with("ADD_ONION") {
                        let mut reply = format!("250-ServiceID={SERVICE_ID}\r\n");
                        if line.contains("NEW:ED25519-V3") && !line.contains("DiscardPK") {
                            reply.push_str("250-PrivateKey=ED25519-V3:bWF0ZXJpYWw\r\n");
                        }
                        reply.push_str("250 OK\r\n");
                        if write.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }

                        if confirm_uploads {
                            // give the client a moment to arm its waiter
                            tokio::time::sleep(Duration::from_millis(250)).await;
                            let event =
                                format!("650 HS_DESC UPLOADED {SERVICE_ID} UNKNOWN $D1R\r\n");
                            if write.write_all(event.as_bytes()).await.is_err() {
                                return;
                            }
                        }
                    } else if write.write_all(b"552 Unrecognized command\r\n").await.is_err() {
                        return;
                    }

                    let _ = write.flush().await;
                }
            });
        }
    });

    (addr, commands, connections)
}

fn config_for(dir: &std::path::Path, control_addr: &str) -> TorConfig {
    let mut config = TorConfig::new(dir.to_path_buf());
    config.control_addr = control_addr.to_string();
    config
}

#[tokio::test]
async fn bootstrap_publish_and_key_reuse() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, commands, _) = spawn_mock_control(true).await;
    let kek = Arc::new(DeviceKek::from_bytes([5u8; 32]));
    let config = config_for(dir.path(), &addr);

    let orch = TorOrchestrator::new(config.clone(), kek.clone());
    orch.start().await.unwrap();

    let (socks_host, socks_port) = orch.await_ready(Duration::from_secs(5)).await.unwrap();
    assert_eq!(socks_host, "127.0.0.1");
    assert_eq!(socks_port, 9050);

    let onion = orch.ensure_hidden_service(12345, 80).await.unwrap();
    assert_eq!(onion.authority(), format!("{SERVICE_ID}.onion"));
    assert!(orch.current_state().is_ready());
    assert!(config.hs_key_path().exists());

    {
        let cmds = commands.lock().await;
        let add = cmds
            .iter()
            .find(|c| c.starts_with("ADD_ONION"))
            .expect("one ADD_ONION");
        assert!(add.contains("NEW:ED25519-V3"));
        assert!(add.contains("Port=80,127.0.0.1:12345"));
    }

    orch.stop().await.unwrap();
    assert_eq!(orch.current_state(), TorState::Stopped);

    // a second boot supplies the sealed key instead of requesting a new one
    let orch2 = TorOrchestrator::new(config, kek);
    orch2.start().await.unwrap();
    orch2.await_ready(Duration::from_secs(5)).await.unwrap();
    orch2.ensure_hidden_service(12345, 80).await.unwrap();

    let cmds = commands.lock().await;
    let add_onions: Vec<&String> = cmds.iter().filter(|c| c.starts_with("ADD_ONION")).collect();
    assert_eq!(add_onions.len(), 2);
    assert!(add_onions[1].contains("ED25519-V3:bWF0ZXJpYWw"));
    assert!(!add_onions[1].contains("NEW:"));
}

#[tokio::test]
async fn invite_service_is_ephemeral_and_memoized() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, commands, _) = spawn_mock_control(true).await;
    let kek = Arc::new(DeviceKek::from_bytes([6u8; 32]));
    let config = config_for(dir.path(), &addr);

    let orch = TorOrchestrator::new(config.clone(), kek);
    orch.start().await.unwrap();
    orch.await_ready(Duration::from_secs(5)).await.unwrap();

    let onion = orch.ensure_invite_hidden_service(9999, 80).await.unwrap();
    let again = orch.ensure_invite_hidden_service(9999, 80).await.unwrap();
    assert_eq!(onion, again);

    orch.drop_invite_hidden_service().await;

    let cmds = commands.lock().await;
    let add_onions: Vec<&String> = cmds.iter().filter(|c| c.starts_with("ADD_ONION")).collect();
    assert_eq!(add_onions.len(), 1, "memoized service published once");
    assert!(add_onions[0].contains("Flags=DiscardPK"));
    assert!(cmds.iter().any(|c| c.starts_with("DEL_ONION")));

    // nothing of the invite service ever touches disk
    assert!(!config.hs_key_path().exists());
}

#[tokio::test]
async fn publish_timeout_wipes_and_restarts_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, commands, connections) = spawn_mock_control(false).await;
    let kek = Arc::new(DeviceKek::from_bytes([7u8; 32]));
    let mut config = config_for(dir.path(), &addr);
    config.hs_publish_timeout = Duration::from_millis(200);

    let orch = TorOrchestrator::new(config.clone(), kek);
    orch.begin_boot().await;
    orch.start().await.unwrap();
    orch.await_ready(Duration::from_secs(5)).await.unwrap();

    let err = orch.ensure_hidden_service(4321, 80).await.unwrap_err();
    assert!(matches!(err, TorError::HsPublishTimeout(_)));

    // one original attempt plus exactly one post-reset attempt
    let cmds = commands.lock().await;
    let add_onions: Vec<&String> = cmds.iter().filter(|c| c.starts_with("ADD_ONION")).collect();
    assert_eq!(add_onions.len(), 2);
    // the wipe deleted the first key, so the retry had to mint a fresh one
    assert!(add_onions[1].contains("NEW:ED25519-V3"));
    drop(cmds);
    assert_eq!(connections.load(Ordering::SeqCst), 2);

    match orch.current_state() {
        TorState::Error { code, .. } => assert_eq!(code, TorErrorCode::HsPublishTimeout),
        other => panic!("expected error state, got {other:?}"),
    }
}
