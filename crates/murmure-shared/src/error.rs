use thiserror::Error;

#[derive(Error, Debug)]
pub enum AddressError {
    #[error("fingerprint must be 40 hex chars, got {0}")]
    BadFingerprintLength(usize),

    #[error("fingerprint contains non-hex characters")]
    BadFingerprintChars,

    #[error("empty onion address")]
    EmptyOnion,

    #[error("onion address missing .onion suffix")]
    MissingOnionSuffix,

    #[error("onion host must be 56 base32 chars, got {0}")]
    BadOnionHostLength(usize),

    #[error("onion host contains characters outside a-z2-7")]
    BadOnionHostChars,

    #[error("invalid onion port: {0}")]
    BadOnionPort(String),
}

#[derive(Error, Debug)]
pub enum KeyRingError {
    #[error("invalid ring bytes")]
    InvalidRingBytes,

    #[error("unsupported ring version {0}")]
    UnsupportedRingVersion(u8),

    #[error("signature verification failed")]
    SignatureInvalid,
}

/// Failures of the sealed-envelope codec boundary.
///
/// The variants are deliberately coarse: the inbound pipeline maps them onto
/// stable wire codes and nothing more detailed may leak to a remote peer.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("no matching recipient key")]
    NoMatchingRecipient,

    #[error("malformed sealed payload")]
    Malformed,

    #[error("encryption failed")]
    EncryptFailed,
}

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("unknown exchange format")]
    UnknownFormat,

    #[error("truncated payload")]
    Truncated,

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("unsupported card version {0}")]
    UnsupportedVersion(u8),

    #[error("base64 decode error")]
    Base64,

    #[error("decompression failed")]
    Decompress,

    #[error("invalid invite token")]
    BadToken,

    #[error("address error: {0}")]
    Address(#[from] AddressError),
}
