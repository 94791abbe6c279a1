/// Outer envelope protocol version
pub const ENVELOPE_VERSION: u32 = 1;

/// Invite acceptance response version
pub const INVITE_RESPONSE_VERSION: u32 = 2;

/// Invite exchange protocol tag (`ec2|<onion>|<token>`)
pub const INVITE_PROTOCOL: &str = "ec2";

/// HTTP path prefix for invite acceptance
pub const INVITE_PATH_PREFIX: &str = "/invite/";

/// Invite lifetime before expiry (10 minutes)
pub const INVITE_TTL_MS: i64 = 10 * 60 * 1000;

/// Maximum message id length in chars
pub const MAX_MSG_ID_LEN: usize = 128;

/// Maximum nonce length in chars
pub const MAX_NONCE_LEN: usize = 256;

/// Maximum chat body length in chars
pub const MAX_BODY_CHARS: usize = 500;

/// Ingress request body cap (64 KiB)
pub const MAX_INGRESS_BODY_BYTES: usize = 64 * 1024;

/// Sealed payload base64 cap (2x the ingress body cap)
pub const MAX_PAYLOAD_B64_BYTES: usize = 2 * MAX_INGRESS_BODY_BYTES;

/// Accepted clock skew on inbound `created_at` (5 minutes ahead of local now)
pub const CLOCK_SKEW_TOLERANCE_MS: i64 = 5 * 60 * 1000;

/// Per-sender replay window size (recent nonces kept)
pub const REPLAY_WINDOW_PER_SENDER: usize = 10_000;

/// Random bytes behind an outbound nonce (url-safe base64, no padding)
pub const NONCE_RANDOM_BYTES: usize = 18;

/// Random bytes behind an invite token (url-safe base64, no padding)
pub const INVITE_TOKEN_BYTES: usize = 24;

/// Invite token length bounds in chars
pub const INVITE_TOKEN_MIN_LEN: usize = 22;
pub const INVITE_TOKEN_MAX_LEN: usize = 128;

/// Sentinel prefix on device-sealed blobs (`"v1:" + b64(iv || ct)`)
pub const SEALED_BLOB_PREFIX: &str = "v1:";

/// AES-GCM IV length inside sealed blobs
pub const SEALED_BLOB_IV_LEN: usize = 12;

/// scrypt parameters for the optional PIN wrap (N=2^15, r=8, p=1, 32-byte key)
pub const PIN_KDF_LOG_N: u8 = 15;
pub const PIN_KDF_R: u32 = 8;
pub const PIN_KDF_P: u32 = 1;
pub const PIN_KDF_DK_LEN: usize = 32;

/// Key derivation contexts (BLAKE3 domain separation)
pub const KDF_CONTEXT_SESSION_WRAP: &str = "murmure-session-wrap-v1";
pub const KDF_CONTEXT_KEY_ID: &str = "murmure-key-id-v1";
