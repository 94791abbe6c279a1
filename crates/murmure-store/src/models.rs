use murmure_shared::types::{
    ChangeState, Direction, Fingerprint, MessageStatus, OnionAddress, TrustLevel,
};

/// The device identity row. Exactly one row has `is_active = true`.
#[derive(Debug, Clone)]
pub struct Identity {
    pub fingerprint: Fingerprint,
    /// Empty until the first hidden-service publish.
    pub onion: Option<OnionAddress>,
    pub public_ring: Vec<u8>,
    /// Device-sealed secret ring (`"v1:"` blob). Never stored in the clear.
    pub sealed_secret_ring: String,
    pub is_active: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct Contact {
    pub fingerprint: Fingerprint,
    pub onion: Option<OnionAddress>,
    pub public_ring: Vec<u8>,
    /// Local label only; never transmitted, never part of a trust decision.
    pub display_name: Option<String>,
    pub trust_level: TrustLevel,
    pub change_state: ChangeState,
    pub pending_onion: Option<OnionAddress>,
    pub pending_public_ring: Option<Vec<u8>>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// Database id: the protocol `msg_id` for inbound rows, `OUT:<msg_id>`
    /// for outbound rows so a self-message never collides with its echo.
    pub id: String,
    pub msg_id: String,
    /// Envelope type this row rode in on (`msg` / `addr_update`).
    pub kind: String,
    pub conv_id: Fingerprint,
    pub direction: Direction,
    pub sender_fp: Fingerprint,
    pub recipient_fp: Fingerprint,
    pub created_at: i64,
    /// 0 when never set.
    pub server_received_at: i64,
    pub status: MessageStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub next_retry_at: i64,
    /// `v1|pgp=…` column; authoritative payload.
    pub ciphertext: String,
}

impl StoredMessage {
    pub const OUTBOUND_ID_PREFIX: &'static str = "OUT:";

    pub fn outbound_db_id(msg_id: &str) -> String {
        format!("{}{msg_id}", Self::OUTBOUND_ID_PREFIX)
    }
}

#[derive(Debug, Clone)]
pub struct Invite {
    pub token: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub used_at: Option<i64>,
    pub consumer: Option<String>,
}

impl Invite {
    pub fn is_used(&self) -> bool {
        self.used_at.is_some()
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// What `upsert_merge_safe` decided, in one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    NoChange,
    UpdatedUnverified,
    PendingApproval {
        key_changed: bool,
        onion_changed: bool,
    },
}
