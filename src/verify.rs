//! Digest verification for fetched and cached chunks.

use std::fmt;
use std::str::FromStr;

use lazysnap_oci::Digest;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::error::{Error, VerificationError};

/// When cached chunks are re-verified.
///
/// There is deliberately no `Default`: every caller chooses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerifyPolicy {
    /// Re-verify on every read, cache hits included.
    Always,
    /// Verify when bytes arrive from a remote source; trust cache hits.
    OnFetchOnly,
}

impl VerifyPolicy {
    /// Whether bytes served from the local store must be re-hashed.
    pub fn verifies_cache_hits(self) -> bool {
        matches!(self, VerifyPolicy::Always)
    }
}

impl fmt::Display for VerifyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyPolicy::Always => write!(f, "always"),
            VerifyPolicy::OnFetchOnly => write!(f, "on-fetch-only"),
        }
    }
}

impl FromStr for VerifyPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(VerifyPolicy::Always),
            "on-fetch-only" => Ok(VerifyPolicy::OnFetchOnly),
            other => Err(Error::Config(format!(
                "unknown verification policy {other:?} (expected always or on-fetch-only)"
            ))),
        }
    }
}

/// `true` when `bytes` hash to `expected`.
pub fn verify(bytes: &[u8], expected: &Digest) -> bool {
    let actual = Digest::sha256(bytes);
    actual.as_str().as_bytes().ct_eq(expected.as_str().as_bytes()).into()
}

/// Like [`verify`], but returns the mismatch as an error.
pub fn check(bytes: &[u8], expected: &Digest) -> Result<(), VerificationError> {
    let actual = Digest::sha256(bytes);
    if actual.as_str().as_bytes().ct_eq(expected.as_str().as_bytes()).into() {
        Ok(())
    } else {
        Err(VerificationError {
            expected: expected.clone(),
            actual,
        })
    }
}
