//! Sealed-envelope codec boundary.
//!
//! The node core never touches message crypto directly; it hands ring bytes
//! and payloads to a [`SealedCodec`] and maps the coarse error kinds onto
//! wire codes. [`RingCodec`] is the built-in implementation.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

use crate::constants::{KDF_CONTEXT_KEY_ID, KDF_CONTEXT_SESSION_WRAP};
use crate::error::CodecError;
use crate::keyring::{KeyRing, PublicRing};

/// Seals and opens signed, encrypted payloads.
///
/// `encrypt_and_sign` must wrap the session key to the sender's own
/// encryption key in addition to the recipient's, so a device can re-open its
/// own outbound blobs from the store.
pub trait SealedCodec: Send + Sync {
    fn encrypt_and_sign(
        &self,
        plaintext: &[u8],
        recipient_pub_ring: &[u8],
        sender_pub_ring: &[u8],
        sender_secret_ring: &[u8],
    ) -> Result<String, CodecError>;

    fn decrypt_and_verify(
        &self,
        sender_pub_ring: &[u8],
        recipient_secret_ring: &[u8],
        payload_b64: &str,
    ) -> Result<Vec<u8>, CodecError>;
}

const SEALED_MAGIC: &[u8; 3] = b"SE1";
const SEALED_VERSION: u8 = 1;
const KEY_ID_LEN: usize = 8;
const NONCE_LEN: usize = 24;
const WRAPPED_KEY_LEN: usize = 32 + 16;
const SIGNATURE_LEN: usize = 64;

/// Ephemeral-x25519 sealed envelope with an embedded ed25519 signature.
///
/// Layout: `"SE1" | ver | eph_pub(32) | n(u8) | n * (key_id(8) | nonce(24) |
/// wrapped_key(48)) | body_nonce(24) | ct(sig(64) || plaintext, +16 tag)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RingCodec;

impl RingCodec {
    pub fn new() -> Self {
        Self
    }
}

impl SealedCodec for RingCodec {
    fn encrypt_and_sign(
        &self,
        plaintext: &[u8],
        recipient_pub_ring: &[u8],
        sender_pub_ring: &[u8],
        sender_secret_ring: &[u8],
    ) -> Result<String, CodecError> {
        let recipient =
            PublicRing::from_bytes(recipient_pub_ring).map_err(|_| CodecError::EncryptFailed)?;
        let sender_pub =
            PublicRing::from_bytes(sender_pub_ring).map_err(|_| CodecError::EncryptFailed)?;
        let sender =
            KeyRing::from_secret_ring_bytes(sender_secret_ring).map_err(|_| CodecError::EncryptFailed)?;

        let mut eph_seed = [0u8; 32];
        OsRng.fill_bytes(&mut eph_seed);
        let eph_secret = x25519_dalek::StaticSecret::from(eph_seed);
        eph_seed.zeroize();
        let eph_public = x25519_dalek::PublicKey::from(&eph_secret);

        let mut session_key = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(session_key.as_mut());

        // Session key goes to the recipient and always back to the sender.
        let mut recipients = vec![*recipient.encryption_key()];
        if sender_pub.encryption_key().as_bytes() != recipient.encryption_key().as_bytes() {
            recipients.push(*sender_pub.encryption_key());
        }

        let mut out = Vec::with_capacity(256 + plaintext.len());
        out.extend_from_slice(SEALED_MAGIC);
        out.push(SEALED_VERSION);
        out.extend_from_slice(eph_public.as_bytes());
        out.push(recipients.len() as u8);

        for target in &recipients {
            let shared = eph_secret.diffie_hellman(target);
            let wrap_key = derive_wrap_key(shared.as_bytes());

            let mut nonce = [0u8; NONCE_LEN];
            OsRng.fill_bytes(&mut nonce);

            let cipher = XChaCha20Poly1305::new((&*wrap_key).into());
            let wrapped = cipher
                .encrypt(XNonce::from_slice(&nonce), &session_key[..])
                .map_err(|_| CodecError::EncryptFailed)?;

            out.extend_from_slice(&key_id(target));
            out.extend_from_slice(&nonce);
            out.extend_from_slice(&wrapped);
        }

        let signature = sender.sign(plaintext);
        let mut body = Zeroizing::new(Vec::with_capacity(SIGNATURE_LEN + plaintext.len()));
        body.extend_from_slice(&signature.to_bytes());
        body.extend_from_slice(plaintext);

        let mut body_nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut body_nonce);
        let cipher = XChaCha20Poly1305::new((&*session_key).into());
        let body_ct = cipher
            .encrypt(XNonce::from_slice(&body_nonce), body.as_slice())
            .map_err(|_| CodecError::EncryptFailed)?;

        out.extend_from_slice(&body_nonce);
        out.extend_from_slice(&body_ct);

        Ok(B64.encode(&out))
    }

    fn decrypt_and_verify(
        &self,
        sender_pub_ring: &[u8],
        recipient_secret_ring: &[u8],
        payload_b64: &str,
    ) -> Result<Vec<u8>, CodecError> {
        let sender =
            PublicRing::from_bytes(sender_pub_ring).map_err(|_| CodecError::Malformed)?;
        let recipient = KeyRing::from_secret_ring_bytes(recipient_secret_ring)
            .map_err(|_| CodecError::Malformed)?;

        let raw = B64.decode(payload_b64).map_err(|_| CodecError::Malformed)?;
        if raw.len() < 3 + 1 + 32 + 1 || &raw[..3] != SEALED_MAGIC || raw[3] != SEALED_VERSION {
            return Err(CodecError::Malformed);
        }

        let mut eph_pub = [0u8; 32];
        eph_pub.copy_from_slice(&raw[4..36]);
        let eph_public = x25519_dalek::PublicKey::from(eph_pub);
        let n = raw[36] as usize;

        let stanza_len = KEY_ID_LEN + NONCE_LEN + WRAPPED_KEY_LEN;
        let stanzas_end = 37 + n * stanza_len;
        if n == 0 || raw.len() < stanzas_end + NONCE_LEN + SIGNATURE_LEN {
            return Err(CodecError::Malformed);
        }

        let own_public = x25519_dalek::PublicKey::from(recipient.encryption_secret());
        let own_id = key_id(&own_public);

        let mut wrapped_for_us: Option<(&[u8], &[u8])> = None;
        for i in 0..n {
            let start = 37 + i * stanza_len;
            let stanza = &raw[start..start + stanza_len];
            if stanza[..KEY_ID_LEN] == own_id {
                let nonce = &stanza[KEY_ID_LEN..KEY_ID_LEN + NONCE_LEN];
                let wrapped = &stanza[KEY_ID_LEN + NONCE_LEN..];
                wrapped_for_us = Some((nonce, wrapped));
                break;
            }
        }
        let (wrap_nonce, wrapped) = wrapped_for_us.ok_or(CodecError::NoMatchingRecipient)?;

        let shared = recipient.encryption_secret().diffie_hellman(&eph_public);
        let wrap_key = derive_wrap_key(shared.as_bytes());
        let cipher = XChaCha20Poly1305::new((&*wrap_key).into());
        let session_key = Zeroizing::new(
            cipher
                .decrypt(XNonce::from_slice(wrap_nonce), wrapped)
                .map_err(|_| CodecError::Malformed)?,
        );
        if session_key.len() != 32 {
            return Err(CodecError::Malformed);
        }

        let body_nonce = &raw[stanzas_end..stanzas_end + NONCE_LEN];
        let body_ct = &raw[stanzas_end + NONCE_LEN..];

        let cipher = XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&session_key));
        let body = Zeroizing::new(
            cipher
                .decrypt(XNonce::from_slice(body_nonce), body_ct)
                .map_err(|_| CodecError::Malformed)?,
        );
        if body.len() < SIGNATURE_LEN {
            return Err(CodecError::Malformed);
        }

        let sig_bytes: [u8; SIGNATURE_LEN] = body[..SIGNATURE_LEN]
            .try_into()
            .map_err(|_| CodecError::Malformed)?;
        let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        let plaintext = &body[SIGNATURE_LEN..];

        sender
            .verify(plaintext, &signature)
            .map_err(|_| CodecError::SignatureInvalid)?;

        Ok(plaintext.to_vec())
    }
}

fn derive_wrap_key(shared: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    Zeroizing::new(blake3::derive_key(KDF_CONTEXT_SESSION_WRAP, shared))
}

fn key_id(public: &x25519_dalek::PublicKey) -> [u8; KEY_ID_LEN] {
    let digest = blake3::derive_key(KDF_CONTEXT_KEY_ID, public.as_bytes());
    let mut id = [0u8; KEY_ID_LEN];
    id.copy_from_slice(&digest[..KEY_ID_LEN]);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rings() -> (KeyRing, KeyRing) {
        (KeyRing::generate(), KeyRing::generate())
    }

    #[test]
    fn seal_open_roundtrip() {
        let (alice, bob) = rings();
        let codec = RingCodec::new();

        let sealed = codec
            .encrypt_and_sign(
                b"bonjour",
                &bob.public_ring().to_bytes(),
                &alice.public_ring().to_bytes(),
                &alice.secret_ring_bytes(),
            )
            .unwrap();

        let opened = codec
            .decrypt_and_verify(
                &alice.public_ring().to_bytes(),
                &bob.secret_ring_bytes(),
                &sealed,
            )
            .unwrap();
        assert_eq!(opened, b"bonjour");
    }

    #[test]
    fn sender_can_open_own_payload() {
        let (alice, bob) = rings();
        let codec = RingCodec::new();

        let sealed = codec
            .encrypt_and_sign(
                b"archive copy",
                &bob.public_ring().to_bytes(),
                &alice.public_ring().to_bytes(),
                &alice.secret_ring_bytes(),
            )
            .unwrap();

        let opened = codec
            .decrypt_and_verify(
                &alice.public_ring().to_bytes(),
                &alice.secret_ring_bytes(),
                &sealed,
            )
            .unwrap();
        assert_eq!(opened, b"archive copy");
    }

    #[test]
    fn wrong_recipient_is_distinguished() {
        let (alice, bob) = rings();
        let eve = KeyRing::generate();
        let codec = RingCodec::new();

        let sealed = codec
            .encrypt_and_sign(
                b"not for eve",
                &bob.public_ring().to_bytes(),
                &alice.public_ring().to_bytes(),
                &alice.secret_ring_bytes(),
            )
            .unwrap();

        assert!(matches!(
            codec.decrypt_and_verify(
                &alice.public_ring().to_bytes(),
                &eve.secret_ring_bytes(),
                &sealed,
            ),
            Err(CodecError::NoMatchingRecipient)
        ));
    }

    #[test]
    fn wrong_sender_fails_signature() {
        let (alice, bob) = rings();
        let mallory = KeyRing::generate();
        let codec = RingCodec::new();

        let sealed = codec
            .encrypt_and_sign(
                b"signed by alice",
                &bob.public_ring().to_bytes(),
                &alice.public_ring().to_bytes(),
                &alice.secret_ring_bytes(),
            )
            .unwrap();

        assert!(matches!(
            codec.decrypt_and_verify(
                &mallory.public_ring().to_bytes(),
                &bob.secret_ring_bytes(),
                &sealed,
            ),
            Err(CodecError::SignatureInvalid)
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        let (alice, bob) = rings();
        let codec = RingCodec::new();
        assert!(matches!(
            codec.decrypt_and_verify(
                &alice.public_ring().to_bytes(),
                &bob.secret_ring_bytes(),
                "bm90IGEgc2VhbGVkIHBheWxvYWQ=",
            ),
            Err(CodecError::Malformed)
        ));
        assert!(matches!(
            codec.decrypt_and_verify(
                &alice.public_ring().to_bytes(),
                &bob.secret_ring_bytes(),
                "not base64 at all!!!",
            ),
            Err(CodecError::Malformed)
        ));
    }
}
