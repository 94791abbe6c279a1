use serde::{Deserialize, Serialize};

use crate::error::AddressError;

// Device identity = 40-hex fingerprint over the primary public key.
// Canonical form is trimmed, whitespace-stripped, uppercase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let canonical: String = input
            .trim()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();

        if canonical.len() != 40 {
            return Err(AddressError::BadFingerprintLength(canonical.len()));
        }
        if !canonical.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddressError::BadFingerprintChars);
        }
        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Canonical v3 onion address: 56 base32 chars + `.onion`, optional port.
///
/// No scheme, no path, no query. The host is always stored lowercase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct OnionAddress {
    host: String,
    port: Option<u16>,
}

const ONION_SUFFIX: &str = ".onion";
const ONION_HOST_LEN: usize = 56;

impl OnionAddress {
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let s = input.trim().to_ascii_lowercase();
        if s.is_empty() {
            return Err(AddressError::EmptyOnion);
        }

        let (hostpart, port) = match s.rsplit_once(':') {
            Some((h, p)) if h.ends_with(ONION_SUFFIX) => {
                if p.starts_with('0') || p.is_empty() || p.len() > 5 {
                    return Err(AddressError::BadOnionPort(p.to_string()));
                }
                let port: u16 = p
                    .parse()
                    .map_err(|_| AddressError::BadOnionPort(p.to_string()))?;
                if port == 0 {
                    return Err(AddressError::BadOnionPort(p.to_string()));
                }
                (h.to_string(), Some(port))
            }
            _ => (s.clone(), None),
        };

        let base = hostpart
            .strip_suffix(ONION_SUFFIX)
            .ok_or(AddressError::MissingOnionSuffix)?;

        if base.len() != ONION_HOST_LEN {
            return Err(AddressError::BadOnionHostLength(base.len()));
        }
        if !base
            .chars()
            .all(|c| c.is_ascii_lowercase() || ('2'..='7').contains(&c))
        {
            return Err(AddressError::BadOnionHostChars);
        }

        Ok(Self {
            host: hostpart,
            port,
        })
    }

    /// Host including the `.onion` suffix, without port.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// `host[:port]`, the wire/storage form.
    pub fn authority(&self) -> String {
        match self.port {
            Some(p) => format!("{}:{}", self.host, p),
            None => self.host.clone(),
        }
    }
}

impl std::fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.authority())
    }
}

impl TryFrom<String> for OnionAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<OnionAddress> for String {
    fn from(value: OnionAddress) -> Self {
        value.authority()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustLevel {
    Unverified,
    Verified,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unverified => "unverified",
            Self::Verified => "verified",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "verified" => Self::Verified,
            _ => Self::Unverified,
        }
    }
}

/// Divergence observed on a pinned (Verified) contact, awaiting user action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeState {
    None,
    KeyChanged,
    OnionChanged,
    Both,
}

impl ChangeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::KeyChanged => "key_changed",
            Self::OnionChanged => "onion_changed",
            Self::Both => "both",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "key_changed" => Self::KeyChanged,
            "onion_changed" => Self::OnionChanged,
            "both" => Self::Both,
            _ => Self::None,
        }
    }

    pub fn with_key_changed(self) -> Self {
        match self {
            Self::None | Self::KeyChanged => Self::KeyChanged,
            Self::OnionChanged | Self::Both => Self::Both,
        }
    }

    pub fn with_onion_changed(self) -> Self {
        match self {
            Self::None | Self::OnionChanged => Self::OnionChanged,
            Self::KeyChanged | Self::Both => Self::Both,
        }
    }

    pub fn key_changed(&self) -> bool {
        matches!(self, Self::KeyChanged | Self::Both)
    }

    pub fn onion_changed(&self) -> bool {
        matches!(self, Self::OnionChanged | Self::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "out" => Self::Out,
            _ => Self::In,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Queued,
    SentOk,
    Failed,
    Received,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::SentOk => "sent_ok",
            Self::Failed => "failed",
            Self::Received => "received",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "sent_ok" => Self::SentOk,
            "failed" => Self::Failed,
            "received" => Self::Received,
            _ => Self::Queued,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_canonicalizes() {
        let fp = Fingerprint::parse("  ab12 cd34 ef56 ab12 cd34 ef56 ab12 cd34 ef56 ab12 ").unwrap();
        assert_eq!(fp.as_str(), "AB12CD34EF56AB12CD34EF56AB12CD34EF56AB12");
    }

    #[test]
    fn fingerprint_exact_length_only() {
        assert!(Fingerprint::parse(&"A".repeat(40)).is_ok());
        assert!(Fingerprint::parse(&"A".repeat(39)).is_err());
        assert!(Fingerprint::parse(&"A".repeat(41)).is_err());
        assert!(Fingerprint::parse(&"G".repeat(40)).is_err());
    }

    #[test]
    fn onion_parse_roundtrip() {
        let host = format!("{}.onion", "a".repeat(56));
        let addr = OnionAddress::parse(&host).unwrap();
        assert_eq!(addr.authority(), host);
        assert_eq!(addr.port(), None);

        let with_port = OnionAddress::parse(&format!("{host}:8080")).unwrap();
        assert_eq!(with_port.port(), Some(8080));
    }

    #[test]
    fn onion_uppercases_are_canonicalized() {
        let addr = OnionAddress::parse(&format!("{}.ONION", "A".repeat(56))).unwrap();
        assert_eq!(addr.host(), format!("{}.onion", "a".repeat(56)));
    }

    #[test]
    fn onion_rejects_bad_shapes() {
        assert!(OnionAddress::parse(&format!("{}.onion", "a".repeat(55))).is_err());
        assert!(OnionAddress::parse(&format!("{}.onion", "a".repeat(57))).is_err());
        assert!(OnionAddress::parse(&format!("{}.onion", "1".repeat(56))).is_err());
        assert!(OnionAddress::parse(&format!("{}.onion:0", "a".repeat(56))).is_err());
        assert!(OnionAddress::parse(&format!("{}.onion:65536", "a".repeat(56))).is_err());
        assert!(OnionAddress::parse(&format!("{}.onion:08", "a".repeat(56))).is_err());
        assert!(OnionAddress::parse("example.com").is_err());
        assert!(OnionAddress::parse("").is_err());
    }

    #[test]
    fn onion_port_bounds() {
        let host = format!("{}.onion", "b".repeat(56));
        assert_eq!(
            OnionAddress::parse(&format!("{host}:1")).unwrap().port(),
            Some(1)
        );
        assert_eq!(
            OnionAddress::parse(&format!("{host}:65535")).unwrap().port(),
            Some(65535)
        );
    }

    #[test]
    fn change_state_composes() {
        assert_eq!(ChangeState::None.with_key_changed(), ChangeState::KeyChanged);
        assert_eq!(
            ChangeState::KeyChanged.with_onion_changed(),
            ChangeState::Both
        );
        assert_eq!(
            ChangeState::OnionChanged.with_onion_changed(),
            ChangeState::OnionChanged
        );
        assert_eq!(ChangeState::Both.with_key_changed(), ChangeState::Both);
    }
}
