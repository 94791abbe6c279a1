use thiserror::Error;

#[derive(Error, Debug)]
pub enum TorError {
    #[error("control channel unavailable: {0}")]
    ControlUnavailable(String),

    #[error("control command failed: {0}")]
    CommandFailed(String),

    #[error("bootstrap did not complete within {0:?}")]
    BootstrapTimeout(std::time::Duration),

    #[error("hidden service descriptor not uploaded within {0:?}")]
    HsPublishTimeout(std::time::Duration),

    #[error("sealed hidden-service key rejected: {0}")]
    SealedKey(#[from] murmure_shared::SealError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("boot superseded by a newer generation")]
    Superseded,
}

pub type Result<T> = std::result::Result<T, TorError>;
