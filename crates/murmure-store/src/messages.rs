use rusqlite::{params, OptionalExtension};

use murmure_shared::types::{Direction, Fingerprint, MessageStatus};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::StoredMessage;

impl Database {
    /// Insert keyed by the database id; a duplicate id is a no-op.
    ///
    /// Returns whether a row was actually written, so the caller can tell a
    /// first delivery from a replayed one.
    pub fn insert_message_if_absent(&self, message: &StoredMessage) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO messages
                 (id, msg_id, kind, conv_id, direction, sender_fp, recipient_fp,
                  created_at, server_received_at, status, attempt_count,
                  last_error, next_retry_at, ciphertext)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                message.id,
                message.msg_id,
                message.kind,
                message.conv_id.as_str(),
                message.direction.as_str(),
                message.sender_fp.as_str(),
                message.recipient_fp.as_str(),
                message.created_at,
                message.server_received_at,
                message.status.as_str(),
                message.attempt_count,
                message.last_error,
                message.next_retry_at,
                message.ciphertext,
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn message_by_db_id(&self, id: &str) -> Result<StoredMessage> {
        self.conn()
            .query_row(
                &format!("{SELECT_MESSAGE} WHERE id = ?1"),
                params![id],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Conversation listing, newest first by `max(server_received_at,
    /// created_at)`.
    pub fn list_conversation(
        &self,
        conv_id: &Fingerprint,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_MESSAGE}
             WHERE conv_id = ?1
             ORDER BY MAX(server_received_at, created_at) DESC
             LIMIT ?2 OFFSET ?3"
        ))?;

        let rows = stmt.query_map(params![conv_id.as_str(), limit, offset], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Queued → SentOk, exactly once.
    pub fn mark_message_sent(&self, id: &str, now: i64) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = ?2, server_received_at = ?3
             WHERE id = ?1 AND status = ?4",
            params![
                id,
                MessageStatus::SentOk.as_str(),
                now,
                MessageStatus::Queued.as_str(),
            ],
        )?;
        Ok(affected > 0)
    }

    /// Terminal failure; the row never retries.
    pub fn mark_message_failed(&self, id: &str, error_code: &str) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = ?2, last_error = ?3 WHERE id = ?1",
            params![id, MessageStatus::Failed.as_str(), error_code],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Keep the row Queued and record the attempt for the retry sweep.
    pub fn mark_message_retry(
        &self,
        id: &str,
        error_code: &str,
        next_retry_at: i64,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE messages SET
                 status = ?2,
                 attempt_count = attempt_count + 1,
                 last_error = ?3,
                 next_retry_at = ?4
             WHERE id = ?1",
            params![id, MessageStatus::Queued.as_str(), error_code, next_retry_at],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Outbound rows due for another delivery attempt.
    pub fn queued_outbound_due(&self, now: i64, limit: u32) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_MESSAGE}
             WHERE direction = 'out' AND status = ?1 AND next_retry_at <= ?2
             ORDER BY next_retry_at ASC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(
            params![MessageStatus::Queued.as_str(), now, limit],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

const SELECT_MESSAGE: &str = "SELECT id, msg_id, kind, conv_id, direction, sender_fp, recipient_fp,
        created_at, server_received_at, status, attempt_count, last_error,
        next_retry_at, ciphertext
 FROM messages";

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let conv_str: String = row.get(3)?;
    let sender_str: String = row.get(5)?;
    let recipient_str: String = row.get(6)?;

    let conv_id = parse_fp(&conv_str, 3)?;
    let sender_fp = parse_fp(&sender_str, 5)?;
    let recipient_fp = parse_fp(&recipient_str, 6)?;

    let direction: String = row.get(4)?;
    let status: String = row.get(9)?;

    Ok(StoredMessage {
        id: row.get(0)?,
        msg_id: row.get(1)?,
        kind: row.get(2)?,
        conv_id,
        direction: Direction::from_db(&direction),
        sender_fp,
        recipient_fp,
        created_at: row.get(7)?,
        server_received_at: row.get(8)?,
        status: MessageStatus::from_db(&status),
        attempt_count: row.get(10)?,
        last_error: row.get(11)?,
        next_retry_at: row.get(12)?,
        ciphertext: row.get(13)?,
    })
}

fn parse_fp(s: &str, idx: usize) -> rusqlite::Result<Fingerprint> {
    Fingerprint::parse(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}
