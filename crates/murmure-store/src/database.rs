//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation.
//!
//! Note: SQLCipher (encrypted SQLite) requires OpenSSL at build time. For
//! environments where OpenSSL is unavailable, we fall back to plain SQLite
//! with application-layer sealing of sensitive fields: the identity secret
//! ring is device-sealed before it reaches a column, and the master
//! passphrase from [`crate::seal`] is reserved for page-level encryption.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;
use crate::seal::StoreKey;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the default application database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/murmure/murmure.db`
    /// - macOS:   `~/Library/Application Support/org.murmure.murmure/murmure.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\murmure\murmure\data\murmure.db`
    pub fn new(store_key: &StoreKey) -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("org", "murmure", "murmure").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("murmure.db");

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path, store_key)
    }

    /// Open (or create) a database at an explicit path.
    ///
    /// This is useful for tests and for embedding the store inside custom
    /// directory layouts.
    pub fn open_at(path: &Path, _store_key: &StoreKey) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Recommended SQLite settings.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // Run schema migrations.
        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    ///
    /// Callers should prefer the typed CRUD helpers, but direct access is
    /// occasionally needed for transactions or ad-hoc queries.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}
