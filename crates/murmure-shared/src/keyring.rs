//! Device key ring: an ed25519 signing primary with an x25519 encryption
//! subkey. The two roles are never interchangeable.
//!
//! Ring serializations are versioned and stable; peers exchange public rings
//! as opaque bytes inside contact cards and invite responses.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::KeyRingError;
use crate::types::Fingerprint;

const PUBLIC_RING_MAGIC: &[u8; 3] = b"MP1";
const SECRET_RING_MAGIC: &[u8; 3] = b"MS1";
const RING_VERSION: u8 = 1;
const RING_LEN: usize = 3 + 1 + 32 + 32;

/// Public half of a key ring.
#[derive(Clone)]
pub struct PublicRing {
    verifying: VerifyingKey,
    encryption: x25519_dalek::PublicKey,
}

impl PublicRing {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RING_LEN);
        out.extend_from_slice(PUBLIC_RING_MAGIC);
        out.push(RING_VERSION);
        out.extend_from_slice(self.verifying.as_bytes());
        out.extend_from_slice(self.encryption.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyRingError> {
        let (ver_key, enc_key) = split_ring(bytes, PUBLIC_RING_MAGIC)?;
        let verifying =
            VerifyingKey::from_bytes(&ver_key).map_err(|_| KeyRingError::InvalidRingBytes)?;
        Ok(Self {
            verifying,
            encryption: x25519_dalek::PublicKey::from(enc_key),
        })
    }

    /// Fingerprint is derived from the primary (signing) key alone.
    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint_of_primary(self.verifying.as_bytes())
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying
    }

    pub fn encryption_key(&self) -> &x25519_dalek::PublicKey {
        &self.encryption
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), KeyRingError> {
        self.verifying
            .verify(message, signature)
            .map_err(|_| KeyRingError::SignatureInvalid)
    }
}

/// Full key ring with secret material. Secrets zeroize on drop via the
/// underlying dalek types; byte exports are wrapped in [`Zeroizing`].
pub struct KeyRing {
    signing: SigningKey,
    encryption: x25519_dalek::StaticSecret,
}

impl KeyRing {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let encryption = x25519_dalek::StaticSecret::from(seed);
        Self {
            signing,
            encryption,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint_of_primary(self.signing.verifying_key().as_bytes())
    }

    pub fn public_ring(&self) -> PublicRing {
        PublicRing {
            verifying: self.signing.verifying_key(),
            encryption: x25519_dalek::PublicKey::from(&self.encryption),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    pub fn encryption_secret(&self) -> &x25519_dalek::StaticSecret {
        &self.encryption
    }

    pub fn secret_ring_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Vec::with_capacity(RING_LEN);
        out.extend_from_slice(SECRET_RING_MAGIC);
        out.push(RING_VERSION);
        out.extend_from_slice(self.signing.as_bytes());
        out.extend_from_slice(self.encryption.as_bytes());
        Zeroizing::new(out)
    }

    pub fn from_secret_ring_bytes(bytes: &[u8]) -> Result<Self, KeyRingError> {
        let (seed, enc) = split_ring(bytes, SECRET_RING_MAGIC)?;
        Ok(Self {
            signing: SigningKey::from_bytes(&seed),
            encryption: x25519_dalek::StaticSecret::from(enc),
        })
    }
}

fn split_ring(bytes: &[u8], magic: &[u8; 3]) -> Result<([u8; 32], [u8; 32]), KeyRingError> {
    if bytes.len() != RING_LEN || &bytes[..3] != magic {
        return Err(KeyRingError::InvalidRingBytes);
    }
    if bytes[3] != RING_VERSION {
        return Err(KeyRingError::UnsupportedRingVersion(bytes[3]));
    }
    let mut a = [0u8; 32];
    let mut b = [0u8; 32];
    a.copy_from_slice(&bytes[4..36]);
    b.copy_from_slice(&bytes[36..68]);
    Ok((a, b))
}

// 40 hex chars = first 20 bytes of SHA-256 over the primary public key.
fn fingerprint_of_primary(primary_pub: &[u8]) -> Fingerprint {
    let digest = Sha256::digest(primary_pub);
    let hex40 = hex::encode(&digest[..20]).to_ascii_uppercase();
    Fingerprint::parse(&hex40).expect("derived fingerprint is canonical")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_produces_canonical_fingerprint() {
        let ring = KeyRing::generate();
        let fp = ring.fingerprint();
        assert_eq!(fp.as_str().len(), 40);
        assert_eq!(fp, ring.public_ring().fingerprint());
    }

    #[test]
    fn public_ring_roundtrip() {
        let ring = KeyRing::generate();
        let public = ring.public_ring();
        let restored = PublicRing::from_bytes(&public.to_bytes()).unwrap();
        assert_eq!(restored.fingerprint(), public.fingerprint());
        assert_eq!(
            restored.encryption_key().as_bytes(),
            public.encryption_key().as_bytes()
        );
    }

    #[test]
    fn secret_ring_roundtrip() {
        let ring = KeyRing::generate();
        let bytes = ring.secret_ring_bytes();
        let restored = KeyRing::from_secret_ring_bytes(&bytes).unwrap();
        assert_eq!(restored.fingerprint(), ring.fingerprint());
    }

    #[test]
    fn sign_verify() {
        let ring = KeyRing::generate();
        let sig = ring.sign(b"attestation");
        assert!(ring.public_ring().verify(b"attestation", &sig).is_ok());
        assert!(ring.public_ring().verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn malformed_rings_rejected() {
        assert!(PublicRing::from_bytes(b"garbage").is_err());
        let ring = KeyRing::generate();
        let mut bytes = ring.public_ring().to_bytes();
        bytes[3] = 9;
        assert!(matches!(
            PublicRing::from_bytes(&bytes),
            Err(KeyRingError::UnsupportedRingVersion(9))
        ));
    }
}
