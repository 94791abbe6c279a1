use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Could not determine application data directory")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record not found")]
    NotFound,

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Key file error: {0}")]
    KeyFile(String),

    #[error("PIN required to unlock the store")]
    PinRequired,

    #[error("Wrong PIN")]
    WrongPin,

    #[error("Seal error: {0}")]
    Seal(#[from] murmure_shared::SealError),

    #[error("Corrupt column: {0}")]
    CorruptColumn(&'static str),
}

pub type Result<T> = std::result::Result<T, StoreError>;
