use crate::digest::Digest;
use crate::error::{OciError, Result};
use crate::layer::{push_decompressor, Compression};
use crate::manifest::{
    self, Descriptor, ImageIndex, OciManifest, Platform, MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
};
use reqwest::header::{ACCEPT, AUTHORIZATION, RANGE, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use std::io::Write;
use tracing::{debug, info};

/// Size of each ranged request when walking a compressed blob prefix.
const COMPRESSED_FETCH_CHUNK: u64 = 1 << 20;

// ---------------------------------------------------------------------------
// ImageRef
// ---------------------------------------------------------------------------

/// A parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry hostname (e.g. "registry-1.docker.io").
    pub registry: String,
    /// Repository path (e.g. "library/alpine").
    pub repository: String,
    /// Tag or digest reference (e.g. "latest" or "sha256:abc123").
    pub reference: String,
}

impl ImageRef {
    /// Parse a raw image reference string.
    ///
    /// Supported formats:
    /// - `alpine:latest`
    /// - `ubuntu`
    /// - `ghcr.io/foo/bar:v1`
    /// - `my.registry.io/org/repo@sha256:abc123`
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(OciError::Registry("empty image reference".to_string()));
        }

        // Split off the reference (tag or digest).
        let (name_part, reference) = if let Some(at_pos) = raw.find('@') {
            (&raw[..at_pos], raw[at_pos + 1..].to_string())
        } else if let Some(colon_pos) = raw.rfind(':') {
            // A tag colon always comes after the last '/', otherwise it
            // belongs to a "host:port" prefix.
            let after_last_slash = raw.rfind('/').map(|p| p + 1).unwrap_or(0);
            if colon_pos > after_last_slash {
                (&raw[..colon_pos], raw[colon_pos + 1..].to_string())
            } else {
                (raw, "latest".to_string())
            }
        } else {
            (raw, "latest".to_string())
        };

        // A first component containing a dot or a colon is a registry host.
        let (registry, repository) = if let Some(slash_pos) = name_part.find('/') {
            let first = &name_part[..slash_pos];
            if first.contains('.') || first.contains(':') || first == "localhost" {
                (first.to_string(), name_part[slash_pos + 1..].to_string())
            } else {
                ("registry-1.docker.io".to_string(), name_part.to_string())
            }
        } else {
            (
                "registry-1.docker.io".to_string(),
                format!("library/{}", name_part),
            )
        };

        let repository = if registry == "registry-1.docker.io" && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    /// The same repository served by a different host (used for mirrors).
    pub fn with_registry(&self, registry: &str) -> Self {
        Self {
            registry: registry.to_string(),
            repository: self.repository.clone(),
            reference: self.reference.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// RegistryClient
// ---------------------------------------------------------------------------

/// Username/password pair for registries that require basic auth.
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        Self {
            username: self.username.clone(),
            password: SecretString::from(self.password.expose_secret().to_string()),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    /// Parse a `user:password` pair as accepted by `--user`.
    pub fn parse(raw: &str) -> Result<Self> {
        let (username, password) = raw
            .split_once(':')
            .ok_or_else(|| OciError::Registry("credentials must be user:password".to_string()))?;
        Ok(Self {
            username: username.to_string(),
            password: SecretString::from(password.to_string()),
        })
    }
}

/// Connection options for a single registry host.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Force plain HTTP (insecure mirrors).
    pub plain_http: bool,
    pub credentials: Option<Credentials>,
}

/// Low-level OCI Distribution HTTP client.
pub struct RegistryClient {
    client: reqwest::Client,
    options: ClientOptions,
}

/// Return the base URL scheme for a registry host.
/// Localhost and loopback registries default to HTTP; everything else to HTTPS.
fn registry_scheme(registry: &str, plain_http: bool) -> &'static str {
    if plain_http {
        return "http";
    }
    let host = registry.split(':').next().unwrap_or(registry);
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        "http"
    } else {
        "https"
    }
}

impl RegistryClient {
    pub fn new() -> Result<Self> {
        Self::with_options(ClientOptions::default())
    }

    pub fn with_options(options: ClientOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("lazysnap-oci/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, options })
    }

    // -- public API ---------------------------------------------------------

    /// Fetch the manifest (or image index) for `image_ref`.
    pub async fn fetch_manifest(&self, image_ref: &ImageRef) -> Result<ManifestResponse> {
        let url = self.url(image_ref, "manifests", &image_ref.reference);

        let accept = [
            MEDIA_TYPE_OCI_INDEX,
            MEDIA_TYPE_DOCKER_MANIFEST_LIST,
            MEDIA_TYPE_OCI_MANIFEST,
            MEDIA_TYPE_DOCKER_MANIFEST,
        ]
        .join(", ");

        let body = self
            .authenticated_get(&url, image_ref, Some(&accept), None)
            .await?;

        // Peek at the response to decide which type to deserialize.
        let raw: serde_json::Value = serde_json::from_slice(&body)?;
        let media_type = raw.get("mediaType").and_then(|v| v.as_str()).unwrap_or("");

        if manifest::is_index_media_type(media_type) || raw.get("manifests").is_some() {
            let idx: ImageIndex = serde_json::from_value(raw)?;
            Ok(ManifestResponse::Index(idx))
        } else {
            let m: OciManifest = serde_json::from_value(raw)?;
            Ok(ManifestResponse::Manifest(m))
        }
    }

    /// Fetch a single manifest by its digest (used after resolving an index).
    pub async fn fetch_manifest_by_digest(
        &self,
        image_ref: &ImageRef,
        digest: &Digest,
    ) -> Result<OciManifest> {
        let url = self.url(image_ref, "manifests", digest.as_str());
        let accept = [MEDIA_TYPE_OCI_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST].join(", ");

        let body = self
            .authenticated_get(&url, image_ref, Some(&accept), None)
            .await?;

        let m: OciManifest = serde_json::from_slice(&body)?;
        Ok(m)
    }

    /// Resolve an image reference to a concrete [`OciManifest`] by first
    /// fetching the manifest (which may be an index) and selecting the
    /// platform-appropriate entry if needed.
    pub async fn resolve_manifest(
        &self,
        image_ref: &ImageRef,
        platform: &Platform,
    ) -> Result<OciManifest> {
        match self.fetch_manifest(image_ref).await? {
            ManifestResponse::Manifest(m) => Ok(m),
            ManifestResponse::Index(idx) => {
                let desc = idx.select_platform(platform)?;
                info!(
                    digest = %desc.digest,
                    "resolved platform {}/{}",
                    platform.os,
                    platform.architecture,
                );
                self.fetch_manifest_by_digest(image_ref, &desc.digest).await
            }
        }
    }

    /// Download a whole blob and verify it against `digest`.
    pub async fn fetch_blob(&self, image_ref: &ImageRef, digest: &Digest) -> Result<Vec<u8>> {
        let url = self.url(image_ref, "blobs", digest.as_str());
        info!(%digest, "downloading blob");
        let data = self.authenticated_get(&url, image_ref, None, None).await?;

        let actual = Digest::sha256(&data);
        if &actual != digest {
            return Err(OciError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(data)
    }

    /// Fetch `length` bytes of the raw blob starting at `offset`.
    pub async fn fetch_blob_range(
        &self,
        image_ref: &ImageRef,
        digest: &Digest,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let url = self.url(image_ref, "blobs", digest.as_str());
        debug!(%digest, offset, length, "fetching blob range");
        let data = self
            .authenticated_get(&url, image_ref, None, Some((offset, length)))
            .await?;
        if data.len() as u64 != length {
            return Err(OciError::ShortRead {
                url,
                wanted: length,
                got: data.len() as u64,
            });
        }
        Ok(data)
    }

    /// Fetch `length` bytes of the layer's *decompressed* tar stream starting
    /// at `offset`.
    ///
    /// Uncompressed layers map directly onto a ranged request. Compressed
    /// layers are walked from the start in ranged pieces through a push
    /// decoder; transfer stops once the window is complete, so only the blob
    /// prefix covering the window is downloaded.
    pub async fn fetch_decompressed_range(
        &self,
        image_ref: &ImageRef,
        layer: &Descriptor,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>> {
        let compression = Compression::from_media_type(&layer.media_type);
        if compression == Compression::None {
            return self
                .fetch_blob_range(image_ref, &layer.digest, offset, length)
                .await;
        }

        let mut decoder = push_decompressor(compression, WindowSink::new(offset, length))?;
        let mut pos = 0u64;
        while pos < layer.size && !decoder.sink().is_complete() {
            let want = COMPRESSED_FETCH_CHUNK.min(layer.size - pos);
            let piece = self
                .fetch_blob_range(image_ref, &layer.digest, pos, want)
                .await?;
            decoder.write_all(&piece)?;
            decoder.flush()?;
            pos += want;
        }

        let sink = decoder.sink();
        if !sink.is_complete() {
            return Err(OciError::ShortRead {
                url: self.url(image_ref, "blobs", layer.digest.as_str()),
                wanted: length,
                got: sink.out.len() as u64,
            });
        }
        debug!(
            digest = %layer.digest,
            offset,
            length,
            compressed_bytes = pos,
            "decompressed window fetched",
        );
        Ok(sink.out.clone())
    }

    // -- internals ----------------------------------------------------------

    fn url(&self, image_ref: &ImageRef, kind: &str, reference: &str) -> String {
        let scheme = registry_scheme(&image_ref.registry, self.options.plain_http);
        format!(
            "{}://{}/v2/{}/{}/{}",
            scheme, image_ref.registry, image_ref.repository, kind, reference,
        )
    }

    fn request(&self, url: &str, accept: Option<&str>, range: Option<(u64, u64)>) -> RequestBuilder {
        let mut req = self.client.get(url);
        if let Some(a) = accept {
            req = req.header(ACCEPT, a);
        }
        if let Some((offset, length)) = range {
            req = req.header(RANGE, format!("bytes={}-{}", offset, offset + length - 1));
        }
        req
    }

    /// Perform a GET with anonymous-then-token auth flow.  Basic credentials
    /// are used either directly (Basic challenge) or to obtain the token.
    async fn authenticated_get(
        &self,
        url: &str,
        image_ref: &ImageRef,
        accept: Option<&str>,
        range: Option<(u64, u64)>,
    ) -> Result<Vec<u8>> {
        let resp = self.request(url, accept, range).send().await?;

        let resp = if resp.status() == StatusCode::UNAUTHORIZED {
            let www_auth = resp
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();

            let retry = self.request(url, accept, range);
            let retry = if www_auth.to_ascii_lowercase().starts_with("basic") {
                let creds = self.options.credentials.as_ref().ok_or_else(|| {
                    OciError::Registry(format!("{} requires credentials", image_ref.registry))
                })?;
                retry.basic_auth(&creds.username, Some(creds.password.expose_secret()))
            } else {
                let token = self.fetch_bearer_token(&www_auth, image_ref).await?;
                retry.header(AUTHORIZATION, format!("Bearer {}", token))
            };
            retry.send().await?
        } else {
            resp
        };

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(OciError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(OciError::Registry(format!(
                "GET {} returned {}: {}",
                url, status, body
            )));
        }

        let body = resp.bytes().await?.to_vec();
        match range {
            // Server ignored the Range header and sent the whole blob.
            Some((offset, length)) if status == StatusCode::OK => {
                let start = (offset as usize).min(body.len());
                let end = (offset.saturating_add(length) as usize).min(body.len());
                Ok(body[start..end].to_vec())
            }
            _ => Ok(body),
        }
    }

    /// Parse a `www-authenticate: Bearer realm="…",service="…",scope="…"`
    /// header and fetch a token.
    async fn fetch_bearer_token(&self, www_auth: &str, image_ref: &ImageRef) -> Result<String> {
        let realm = extract_param(www_auth, "realm").unwrap_or_default();
        let service = extract_param(www_auth, "service").unwrap_or_default();
        let scope = extract_param(www_auth, "scope")
            .unwrap_or_else(|| format!("repository:{}:pull", image_ref.repository));

        if realm.is_empty() {
            return Err(OciError::Registry(
                "www-authenticate header missing realm".to_string(),
            ));
        }

        let token_url = format!("{}?service={}&scope={}", realm, service, scope);
        debug!(%token_url, "fetching bearer token");

        let mut req = self.client.get(&token_url);
        if let Some(creds) = &self.options.credentials {
            req = req.basic_auth(&creds.username, Some(creds.password.expose_secret()));
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(OciError::Registry(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let body: serde_json::Value = resp.json().await?;
        let token = body
            .get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| OciError::Registry("token response missing token field".to_string()))?;

        Ok(token.to_string())
    }
}

// ---------------------------------------------------------------------------
// ManifestResponse
// ---------------------------------------------------------------------------

/// The result of fetching a manifest endpoint: either a single manifest or
/// an image index that must be further resolved.
pub enum ManifestResponse {
    Manifest(OciManifest),
    Index(ImageIndex),
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Collects the `[skip, skip + want)` window of everything written to it and
/// discards the rest.
struct WindowSink {
    skip: u64,
    want: u64,
    seen: u64,
    out: Vec<u8>,
}

impl WindowSink {
    fn new(skip: u64, want: u64) -> Self {
        Self {
            skip,
            want,
            seen: 0,
            out: Vec::with_capacity(want as usize),
        }
    }

    fn is_complete(&self) -> bool {
        self.out.len() as u64 == self.want
    }
}

impl Write for WindowSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let start = self.seen;
        let end = start + buf.len() as u64;
        let lo = start.max(self.skip);
        let hi = end.min(self.skip + self.want);
        if lo < hi {
            let from = (lo - start) as usize;
            let to = (hi - start) as usize;
            self.out.extend_from_slice(&buf[from..to]);
        }
        self.seen = end;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Extract a parameter value from a `www-authenticate` header.
/// E.g. `extract_param(header, "realm")` returns the value of `realm="…"`.
fn extract_param(header: &str, param: &str) -> Option<String> {
    let search = format!("{}=\"", param);
    if let Some(start) = header.find(&search) {
        let value_start = start + search.len();
        if let Some(end) = header[value_start..].find('"') {
            return Some(header[value_start..value_start + end].to_string());
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
