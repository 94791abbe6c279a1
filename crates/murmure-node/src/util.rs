use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// URL-safe base64 (no padding) over `n` random bytes.
pub fn random_token(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_urlsafe_and_sized() {
        let token = random_token(18);
        assert_eq!(token.len(), 24);
        assert!(token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-'));
    }

    #[test]
    fn invite_sized_token_passes_shape_check() {
        let token = random_token(24);
        assert!(murmure_shared::exchange::is_valid_invite_token(&token));
    }
}
