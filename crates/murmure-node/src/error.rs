use thiserror::Error;

/// Stable wire codes. These strings are part of the protocol surface and
/// must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // validation
    BadRequest,
    UnsupportedVersion,
    InvalidType,
    BodyTooLarge,
    PayloadTooLarge,
    MsgIdMismatch,
    ConvIdMismatch,
    // authorization
    RecipientNotSelf,
    SenderNotAllowed,
    SenderNotVerified,
    SenderUnknown,
    // semantic conflict
    ReplayDetected,
    RecipientUnknown,
    SelfContactNotAllowed,
    LocalIdentityMissing,
    InviteExpired,
    InviteUsed,
    NoIdentity,
    NoOnion,
    NotFound,
    // crypto
    CryptoDecryptFail,
    PgpEncryptFail,
    PlaintextJsonInvalid,
    // catch-all
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::UnsupportedVersion => "UNSUPPORTED_VERSION",
            Self::InvalidType => "INVALID_TYPE",
            Self::BodyTooLarge => "BODY_TOO_LARGE",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::MsgIdMismatch => "MSG_ID_MISMATCH",
            Self::ConvIdMismatch => "CONV_ID_MISMATCH",
            Self::RecipientNotSelf => "RECIPIENT_NOT_SELF",
            Self::SenderNotAllowed => "SENDER_NOT_ALLOWED",
            Self::SenderNotVerified => "SENDER_NOT_VERIFIED",
            Self::SenderUnknown => "SENDER_UNKNOWN",
            Self::ReplayDetected => "REPLAY_DETECTED",
            Self::RecipientUnknown => "RECIPIENT_UNKNOWN",
            Self::SelfContactNotAllowed => "SELF_CONTACT_NOT_ALLOWED",
            Self::LocalIdentityMissing => "LOCAL_IDENTITY_MISSING",
            Self::InviteExpired => "INVITE_EXPIRED",
            Self::InviteUsed => "INVITE_USED",
            Self::NoIdentity => "NO_IDENTITY",
            Self::NoOnion => "NO_ONION",
            Self::NotFound => "NOT_FOUND",
            Self::CryptoDecryptFail => "CRYPTO_DECRYPT_FAIL",
            Self::PgpEncryptFail => "PGP_ENCRYPT_FAIL",
            Self::PlaintextJsonInvalid => "PLAINTEXT_JSON_INVALID",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest
            | Self::UnsupportedVersion
            | Self::InvalidType
            | Self::BodyTooLarge
            | Self::MsgIdMismatch
            | Self::ConvIdMismatch
            | Self::CryptoDecryptFail
            | Self::PgpEncryptFail
            | Self::PlaintextJsonInvalid => 400,
            Self::PayloadTooLarge => 413,
            Self::RecipientNotSelf | Self::SenderUnknown => 401,
            Self::SenderNotAllowed | Self::SenderNotVerified => 403,
            Self::NotFound => 404,
            Self::InviteUsed => 409,
            Self::InviteExpired => 410,
            Self::ReplayDetected
            | Self::RecipientUnknown
            | Self::SelfContactNotAllowed
            | Self::LocalIdentityMissing
            | Self::NoIdentity
            | Self::NoOnion => 422,
            Self::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A structured request rejection: HTTP status plus a stable code, never
/// sensitive detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: u16,
    pub code: ErrorCode,
    pub msg_id: Option<String>,
}

impl Rejection {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            status: code.http_status(),
            code,
            msg_id: None,
        }
    }

    pub fn with_msg_id(code: ErrorCode, msg_id: impl Into<String>) -> Self {
        Self {
            status: code.http_status(),
            code,
            msg_id: Some(msg_id.into()),
        }
    }
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("store error: {0}")]
    Store(#[from] murmure_store::StoreError),

    #[error("transport error: {0}")]
    Tor(#[from] murmure_tor::TorError),

    #[error("seal error: {0}")]
    Seal(#[from] murmure_shared::SealError),

    #[error("invalid onion: {0}")]
    InvalidOnion(#[from] murmure_shared::AddressError),

    #[error("exchange error: {0}")]
    Exchange(#[from] murmure_shared::ExchangeError),

    #[error("codec error: {0}")]
    Codec(#[from] murmure_shared::CodecError),

    #[error("no active identity")]
    NoIdentity,

    #[error("contact not found")]
    ContactNotFound,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invite rejected: {0}")]
    InviteRejected(ErrorCode),

    #[error("boot superseded by a newer generation")]
    BootSuperseded,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, NodeError>;
