//! v001 -- Initial schema creation.
//!
//! Creates the four core tables: `identities`, `contacts`, `messages`, and
//! `invites`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Identities (exactly one active row per device)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS identities (
    fingerprint        TEXT PRIMARY KEY NOT NULL,  -- 40 upper-hex
    onion              TEXT NOT NULL DEFAULT '',   -- empty before first publish
    public_ring        BLOB NOT NULL,
    sealed_secret_ring TEXT NOT NULL,              -- device-sealed "v1:" blob
    is_active          INTEGER NOT NULL DEFAULT 1, -- boolean 0/1
    created_at         INTEGER NOT NULL            -- unix millis
);

-- ----------------------------------------------------------------
-- Contacts (pinned identity fields + pending divergence slots)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS contacts (
    fingerprint         TEXT PRIMARY KEY NOT NULL,
    onion               TEXT,
    public_ring         BLOB NOT NULL,
    display_name        TEXT,                      -- local label, never sent
    trust_level         TEXT NOT NULL DEFAULT 'unverified',
    change_state        TEXT NOT NULL DEFAULT 'none',
    pending_onion       TEXT,
    pending_public_ring BLOB,
    created_at          INTEGER NOT NULL
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id                 TEXT PRIMARY KEY NOT NULL,  -- msg_id or OUT:<msg_id>
    msg_id             TEXT NOT NULL,
    kind               TEXT NOT NULL DEFAULT 'msg',-- 'msg' / 'addr_update'
    conv_id            TEXT NOT NULL,              -- peer fp (self fp for notes)
    direction          TEXT NOT NULL,              -- 'in' / 'out'
    sender_fp          TEXT NOT NULL,
    recipient_fp       TEXT NOT NULL,
    created_at         INTEGER NOT NULL,
    server_received_at INTEGER NOT NULL DEFAULT 0,
    status             TEXT NOT NULL,
    ciphertext         TEXT NOT NULL               -- v1|pgp=... column
);

CREATE INDEX IF NOT EXISTS idx_messages_conv ON messages(conv_id);

-- ----------------------------------------------------------------
-- Invites (one-shot tokens)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS invites (
    token      TEXT PRIMARY KEY NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    used_at    INTEGER,
    consumer   TEXT
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
