//! Wire formats. The JSON layouts here are bit-compatible with deployed
//! peers and must not change shape.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};

pub const TYPE_MSG: &str = "msg";
pub const TYPE_ADDR_UPDATE: &str = "addr_update";

/// Outer envelope carried in `POST /v1/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub msg_id: String,
    pub sender_fp: String,
    pub recipient_fp: String,
    pub created_at: i64,
    pub nonce: String,
    #[serde(default)]
    pub payload_pgp: String,
    /// Debug-only plaintext channel; ignored outside debug builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_plaintext: Option<String>,
}

/// Inner chat message, visible only after decrypt+verify.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerMessage {
    pub v: u32,
    pub msg_id: String,
    /// Always the sender's fingerprint (the sender writes its own).
    pub conv_id: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_onion: Option<String>,
}

/// Inner address-update notice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerAddrUpdate {
    pub v: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub msg_id: String,
    pub sender_fp: String,
    pub recipient_fp: String,
    pub conv_id: String,
    pub ts: i64,
    pub nonce: String,
    pub new_onion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_onion: Option<String>,
}

/// The stored ciphertext column.
///
/// Outbound rows carry only the sealed payload; inbound rows additionally
/// carry the decrypted body JSON so the UI can render without touching the
/// crypto boundary. The sealed slot stays authoritative either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherBlob {
    pub payload_b64: String,
    pub plaintext_json: Option<String>,
}

impl CipherBlob {
    pub fn outbound(payload_b64: impl Into<String>) -> Self {
        Self {
            payload_b64: payload_b64.into(),
            plaintext_json: None,
        }
    }

    pub fn inbound(payload_b64: impl Into<String>, plaintext_json: impl Into<String>) -> Self {
        Self {
            payload_b64: payload_b64.into(),
            plaintext_json: Some(plaintext_json.into()),
        }
    }

    /// `v1|pgp=<b64>` or `v1|pgp=<b64>|pt=<b64(json)>`.
    pub fn render(&self) -> String {
        match &self.plaintext_json {
            Some(json) => format!(
                "v1|pgp={}|pt={}",
                self.payload_b64,
                B64.encode(json.as_bytes())
            ),
            None => format!("v1|pgp={}", self.payload_b64),
        }
    }

    pub fn parse(column: &str) -> Option<Self> {
        let rest = column.strip_prefix("v1|pgp=")?;
        match rest.split_once("|pt=") {
            None => Some(Self {
                payload_b64: rest.to_string(),
                plaintext_json: None,
            }),
            Some((payload, pt_b64)) => {
                let json = B64.decode(pt_b64).ok()?;
                Some(Self {
                    payload_b64: payload.to_string(),
                    plaintext_json: Some(String::from_utf8(json).ok()?),
                })
            }
        }
    }
}
