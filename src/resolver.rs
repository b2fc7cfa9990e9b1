//! Remote range resolution with mirror fallback.
//!
//! Every [`Resolver::fetch`] starts at the primary source and walks the
//! mirrors in priority order until one returns exactly the requested bytes.
//! Nothing is remembered between calls, so a primary that recovers is used
//! again on the very next fetch.

use std::sync::Arc;
use std::time::Duration;

use lazysnap_oci::{ClientOptions, Descriptor, ImageRef, RegistryClient};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{FetchError, Result, SourceFailure};

/// Default per-attempt timeout.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// A remote that can serve byte ranges of a layer's decompressed stream.
#[async_trait::async_trait]
pub trait RangeFetcher: Send + Sync {
    /// Label used in logs and [`SourceFailure`]s.
    fn name(&self) -> &str;

    async fn fetch_range(&self, layer: &Descriptor, offset: u64, length: u64) -> Result<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// Registry source
// ---------------------------------------------------------------------------

/// An OCI registry (or mirror) serving one repository.
pub struct RegistrySource {
    name: String,
    image: ImageRef,
    client: RegistryClient,
}

impl RegistrySource {
    pub fn new(image: ImageRef, options: ClientOptions) -> Result<Self> {
        let client = RegistryClient::with_options(options)?;
        Ok(Self {
            name: image.registry.clone(),
            image,
            client,
        })
    }

    pub fn image(&self) -> &ImageRef {
        &self.image
    }
}

#[async_trait::async_trait]
impl RangeFetcher for RegistrySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_range(&self, layer: &Descriptor, offset: u64, length: u64) -> Result<Vec<u8>> {
        Ok(self
            .client
            .fetch_decompressed_range(&self.image, layer, offset, length)
            .await?)
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub struct Resolver {
    /// Primary first, then mirrors in priority order.
    sources: Vec<Arc<dyn RangeFetcher>>,
    timeout: Duration,
}

impl Resolver {
    pub fn new(primary: Arc<dyn RangeFetcher>) -> Self {
        Self {
            sources: vec![primary],
            timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    /// Append a mirror after the ones already configured.
    pub fn with_mirror(mut self, mirror: Arc<dyn RangeFetcher>) -> Self {
        self.sources.push(mirror);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Source names in the order they are tried.
    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Fetch `length` bytes at `offset` of `layer`'s decompressed stream.
    pub async fn fetch(&self, layer: &Descriptor, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut failures = Vec::new();

        for (rank, source) in self.sources.iter().enumerate() {
            let cause = match timeout(self.timeout, source.fetch_range(layer, offset, length)).await
            {
                Ok(Ok(bytes)) if bytes.len() as u64 == length => {
                    if rank > 0 {
                        info!(
                            source = source.name(),
                            digest = %layer.digest,
                            "range served by mirror",
                        );
                    } else {
                        debug!(source = source.name(), digest = %layer.digest, offset, length, "range fetched");
                    }
                    return Ok(bytes);
                }
                Ok(Ok(bytes)) => format!("short response: got {} of {} bytes", bytes.len(), length),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "timed out after {}",
                    humantime::format_duration(self.timeout)
                ),
            };

            warn!(
                source = source.name(),
                digest = %layer.digest,
                offset,
                length,
                %cause,
                "range fetch failed",
            );
            failures.push(SourceFailure {
                source: source.name().to_string(),
                cause,
            });
        }

        Err(FetchError {
            blob: layer.digest.clone(),
            failures,
        }
        .into())
    }
}
