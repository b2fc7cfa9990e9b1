use crate::error::{OciError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

const SHA256_PREFIX: &str = "sha256:";
const SHA256_HEX_LEN: usize = 64;

/// A validated `sha256:<hex>` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    /// Parse a digest string, rejecting anything that is not lowercase
    /// `sha256:` followed by 64 hex characters.
    pub fn parse(raw: &str) -> Result<Self> {
        let hex = raw
            .strip_prefix(SHA256_PREFIX)
            .ok_or_else(|| OciError::InvalidDigest(format!("unsupported algorithm: {raw}")))?;
        if hex.len() != SHA256_HEX_LEN {
            return Err(OciError::InvalidDigest(format!(
                "expected {SHA256_HEX_LEN} hex characters: {raw}"
            )));
        }
        if !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(OciError::InvalidDigest(format!("non-hex characters: {raw}")));
        }
        Ok(Self(raw.to_string()))
    }

    /// Digest of `data`.
    pub fn sha256(data: &[u8]) -> Self {
        Self::from_sha256_bytes(&Sha256::digest(data))
    }

    /// Wrap a raw 32-byte SHA-256 output.
    pub fn from_sha256_bytes(bytes: &[u8]) -> Self {
        Self(format!("{SHA256_PREFIX}{}", hex_encode(bytes)))
    }

    /// The hex portion, used as the on-disk file name.
    pub fn hex(&self) -> &str {
        &self.0[SHA256_PREFIX.len()..]
    }

    pub fn algorithm(&self) -> &str {
        "sha256"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Digest::parse(&raw).map_err(serde::de::Error::custom)
    }
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_empty_input() {
        let d = Digest::sha256(b"");
        assert_eq!(
            d.as_str(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(d.hex().len(), 64);
    }

    #[test]
    fn parse_accepts_computed_digest() {
        let d = Digest::sha256(b"hello world");
        assert_eq!(Digest::parse(d.as_str()).unwrap(), d);
    }

    #[test]
    fn parse_rejects_other_algorithms() {
        let raw = format!("sha512:{}", "a".repeat(64));
        assert!(Digest::parse(&raw).is_err());
    }

    #[test]
    fn parse_rejects_bad_length_and_case() {
        assert!(Digest::parse("sha256:deadbeef").is_err());
        let upper = format!("sha256:{}", "A".repeat(64));
        assert!(Digest::parse(&upper).is_err());
    }

    #[test]
    fn serde_uses_string_form() {
        let d = Digest::sha256(b"x");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{}\"", d));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
        assert!(serde_json::from_str::<Digest>("\"sha256:nothex\"").is_err());
    }
}
