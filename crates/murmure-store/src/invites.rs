use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Invite;

impl Database {
    pub fn insert_invite(&self, invite: &Invite) -> Result<()> {
        self.conn().execute(
            "INSERT INTO invites (token, created_at, expires_at, used_at, consumer)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                invite.token,
                invite.created_at,
                invite.expires_at,
                invite.used_at,
                invite.consumer,
            ],
        )?;
        Ok(())
    }

    pub fn invite_by_token(&self, token: &str) -> Result<Option<Invite>> {
        self.conn()
            .query_row(
                "SELECT token, created_at, expires_at, used_at, consumer
                 FROM invites WHERE token = ?1",
                params![token],
                row_to_invite,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    /// Consume the invite, at most once.
    ///
    /// The conditional UPDATE is the whole race arbiter: only a row that
    /// exists, is unused and is unexpired can transition, so exactly one
    /// concurrent caller observes `true`.
    pub fn mark_used_if_valid(&self, token: &str, now: i64) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE invites SET used_at = ?2
             WHERE token = ?1 AND used_at IS NULL AND expires_at > ?2",
            params![token, now],
        )?;
        Ok(affected == 1)
    }

    /// Drop used and expired invites. Returns how many were removed.
    pub fn purge_dead_invites(&self, now: i64) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM invites WHERE used_at IS NOT NULL OR expires_at <= ?1",
            params![now],
        )?;
        Ok(affected)
    }

    pub fn count_live_invites(&self, now: i64) -> Result<i64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM invites WHERE used_at IS NULL AND expires_at > ?1",
            params![now],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn row_to_invite(row: &rusqlite::Row<'_>) -> rusqlite::Result<Invite> {
    Ok(Invite {
        token: row.get(0)?,
        created_at: row.get(1)?,
        expires_at: row.get(2)?,
        used_at: row.get(3)?,
        consumer: row.get(4)?,
    })
}
