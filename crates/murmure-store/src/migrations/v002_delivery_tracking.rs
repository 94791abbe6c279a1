//! v002 -- Delivery tracking columns on `messages`.
//!
//! Adds retry bookkeeping for the outbound sender: attempt counter, last
//! error code, and the earliest time the next attempt may run.

use rusqlite::Connection;

const UP_SQL: &str = r#"
ALTER TABLE messages ADD COLUMN attempt_count INTEGER NOT NULL DEFAULT 0;
ALTER TABLE messages ADD COLUMN last_error    TEXT;
ALTER TABLE messages ADD COLUMN next_retry_at INTEGER NOT NULL DEFAULT 0;

CREATE INDEX IF NOT EXISTS idx_messages_status_retry
    ON messages(status, next_retry_at);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
