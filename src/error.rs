//! Error types for lazysnap

use std::fmt;
use std::sync::Arc;

use lazysnap_oci::{Digest, OciError};
use thiserror::Error;

/// Result type alias using lazysnap Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in lazysnap operations.
///
/// Every variant is `Clone` so a single fetch outcome can be handed to all
/// readers waiting on the same chunk.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// A layer blob is unreadable, malformed, or does not match its digest
    #[error("Build error: {0}")]
    Build(String),

    /// I/O failure in the local artifact store
    #[error("Store error: {0}")]
    Store(String),

    /// The artifact is not present in the local store
    #[error("Not found: {0}")]
    NotFound(Digest),

    /// Every remote source failed
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Content does not match its declared digest
    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// Mount table errors
    #[error("Mount error: {0}")]
    Mount(String),

    /// Filesystem view errors (bad path, wrong file type)
    #[error("Filesystem error: {0}")]
    Fs(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors outside the store
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(Arc<serde_json::Error>),

    /// OCI plumbing errors
    #[error("OCI error: {0}")]
    Oci(Arc<OciError>),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serde(Arc::new(e))
    }
}

impl From<OciError> for Error {
    fn from(e: OciError) -> Self {
        Error::Oci(Arc::new(e))
    }
}

impl Error {
    /// `true` for the expected-absent case handled locally by the read path.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// One failed attempt against a single source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub source: String,
    pub cause: String,
}

/// Aggregated failure of every source tried for one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    pub blob: Digest,
    pub failures: Vec<SourceFailure>,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fetch error: all sources failed for {}", self.blob)?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.source, failure.cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for FetchError {}

/// Fetched or cached bytes whose digest does not match.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Verification error: expected {expected}, got {actual}")]
pub struct VerificationError {
    pub expected: Digest,
    pub actual: Digest,
}
