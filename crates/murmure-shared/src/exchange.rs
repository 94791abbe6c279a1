//! Contact exchange codecs: the `ec1` contact card (QR / file / share sheet)
//! and the `ec2` invite descriptor, plus the single draft validator every
//! import entry point converges on.

use std::io::{Read, Write};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use crate::constants::{INVITE_PROTOCOL, INVITE_TOKEN_MAX_LEN, INVITE_TOKEN_MIN_LEN};
use crate::error::ExchangeError;
use crate::keyring::PublicRing;
use crate::types::{Fingerprint, OnionAddress};

const CARD_PREFIX: &str = "ec1|";
const CARD_MAGIC: &[u8; 3] = b"EC1";
const CARD_VERSION: u8 = 1;
const CHECKSUM_LEN: usize = 4;

/// A contact as imported, before any trust decision.
///
/// File import, share intents, QR scans, manual entry and invite acceptance
/// all produce one of these and go through [`ContactDraft::validate`]; no
/// entry point gets its own validation rules.
#[derive(Debug, Clone)]
pub struct ContactDraft {
    pub fingerprint: Fingerprint,
    pub onion: Option<OnionAddress>,
    pub public_ring: Vec<u8>,
}

impl ContactDraft {
    /// Canonicalize and cross-check the draft. The declared fingerprint must
    /// match the one derived from the public ring.
    pub fn validate(
        fingerprint: &str,
        onion: Option<&str>,
        public_ring: Vec<u8>,
    ) -> Result<Self, ExchangeError> {
        let fingerprint = Fingerprint::parse(fingerprint)?;
        let onion = match onion {
            Some(s) if !s.trim().is_empty() => Some(OnionAddress::parse(s)?),
            _ => None,
        };
        let ring = PublicRing::from_bytes(&public_ring)
            .map_err(|_| ExchangeError::UnknownFormat)?;
        if ring.fingerprint() != fingerprint {
            return Err(ExchangeError::ChecksumMismatch);
        }
        Ok(Self {
            fingerprint,
            onion,
            public_ring,
        })
    }
}

/// Encode a contact card: `ec1|<base64url(EC1 binary)>`.
pub fn encode_contact_card(
    fingerprint: &Fingerprint,
    onion: &OnionAddress,
    public_ring: &[u8],
) -> Result<String, ExchangeError> {
    let fp = fingerprint.as_str().as_bytes();
    let onion = onion.authority().into_bytes();

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(public_ring)
        .map_err(|_| ExchangeError::Decompress)?;
    let compressed = encoder.finish().map_err(|_| ExchangeError::Decompress)?;

    let mut payload = Vec::with_capacity(16 + fp.len() + onion.len() + compressed.len());
    payload.extend_from_slice(CARD_MAGIC);
    payload.push(CARD_VERSION);
    payload.extend_from_slice(&(fp.len() as u16).to_be_bytes());
    payload.extend_from_slice(fp);
    payload.extend_from_slice(&(onion.len() as u16).to_be_bytes());
    payload.extend_from_slice(&onion);
    payload.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
    payload.extend_from_slice(&compressed);

    let digest = Sha256::digest(&payload);
    payload.extend_from_slice(&digest[..CHECKSUM_LEN]);

    Ok(format!("{CARD_PREFIX}{}", URL_SAFE_NO_PAD.encode(&payload)))
}

/// Decode and fully validate an `ec1` contact card.
pub fn decode_contact_card(card: &str) -> Result<ContactDraft, ExchangeError> {
    let b64 = card
        .trim()
        .strip_prefix(CARD_PREFIX)
        .ok_or(ExchangeError::UnknownFormat)?;
    let raw = URL_SAFE_NO_PAD
        .decode(b64)
        .map_err(|_| ExchangeError::Base64)?;

    if raw.len() < 4 + CHECKSUM_LEN || &raw[..3] != CARD_MAGIC {
        return Err(ExchangeError::UnknownFormat);
    }
    if raw[3] != CARD_VERSION {
        return Err(ExchangeError::UnsupportedVersion(raw[3]));
    }

    let (payload, checksum) = raw.split_at(raw.len() - CHECKSUM_LEN);
    let digest = Sha256::digest(payload);
    if digest[..CHECKSUM_LEN] != *checksum {
        return Err(ExchangeError::ChecksumMismatch);
    }

    let mut cursor = 4usize;
    let fp = read_chunk_u16(payload, &mut cursor)?;
    let onion = read_chunk_u16(payload, &mut cursor)?;
    let compressed = read_chunk_u32(payload, &mut cursor)?;
    if cursor != payload.len() {
        return Err(ExchangeError::Truncated);
    }

    let mut public_ring = Vec::new();
    ZlibDecoder::new(compressed)
        .read_to_end(&mut public_ring)
        .map_err(|_| ExchangeError::Decompress)?;

    let fp = std::str::from_utf8(fp).map_err(|_| ExchangeError::UnknownFormat)?;
    let onion = std::str::from_utf8(onion).map_err(|_| ExchangeError::UnknownFormat)?;
    ContactDraft::validate(fp, Some(onion), public_ring)
}

fn read_chunk_u16<'a>(buf: &'a [u8], cursor: &mut usize) -> Result<&'a [u8], ExchangeError> {
    if buf.len() < *cursor + 2 {
        return Err(ExchangeError::Truncated);
    }
    let len = u16::from_be_bytes([buf[*cursor], buf[*cursor + 1]]) as usize;
    *cursor += 2;
    read_exact(buf, cursor, len)
}

fn read_chunk_u32<'a>(buf: &'a [u8], cursor: &mut usize) -> Result<&'a [u8], ExchangeError> {
    if buf.len() < *cursor + 4 {
        return Err(ExchangeError::Truncated);
    }
    let len = u32::from_be_bytes([
        buf[*cursor],
        buf[*cursor + 1],
        buf[*cursor + 2],
        buf[*cursor + 3],
    ]) as usize;
    *cursor += 4;
    read_exact(buf, cursor, len)
}

fn read_exact<'a>(buf: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8], ExchangeError> {
    if buf.len() < *cursor + len {
        return Err(ExchangeError::Truncated);
    }
    let out = &buf[*cursor..*cursor + len];
    *cursor += len;
    Ok(out)
}

/// One-shot invite descriptor: `ec2|<onion>|<token>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteDescriptor {
    pub onion: OnionAddress,
    pub token: String,
}

impl InviteDescriptor {
    pub fn encode(&self) -> String {
        format!("{INVITE_PROTOCOL}|{}|{}", self.onion.authority(), self.token)
    }

    pub fn decode(input: &str) -> Result<Self, ExchangeError> {
        let mut parts = input.trim().splitn(3, '|');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(proto), Some(onion), Some(token)) if proto == INVITE_PROTOCOL => {
                if !is_valid_invite_token(token) {
                    return Err(ExchangeError::BadToken);
                }
                Ok(Self {
                    onion: OnionAddress::parse(onion)?,
                    token: token.to_string(),
                })
            }
            _ => Err(ExchangeError::UnknownFormat),
        }
    }
}

/// `^[A-Za-z0-9_-]{22,128}$`
pub fn is_valid_invite_token(token: &str) -> bool {
    (INVITE_TOKEN_MIN_LEN..=INVITE_TOKEN_MAX_LEN).contains(&token.len())
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
