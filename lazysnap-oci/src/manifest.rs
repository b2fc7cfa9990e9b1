use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::{OciError, Result};

// ---------------------------------------------------------------------------
// OCI Image Manifest
// ---------------------------------------------------------------------------

/// An OCI image manifest (application/vnd.oci.image.manifest.v1+json or
/// application/vnd.docker.distribution.manifest.v2+json).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// A content-addressable descriptor used in both manifests and image indexes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,

    pub digest: Digest,

    pub size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    /// Descriptor for a layer blob without platform information.
    pub fn layer(digest: Digest, size: u64, media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            platform: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Target platform for a manifest inside an image index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Build a `Platform` matching the current host.
    pub fn host() -> Self {
        Self {
            architecture: host_arch().to_string(),
            os: "linux".to_string(),
            variant: None,
        }
    }
}

/// Map Rust `std::env::consts::ARCH` values to OCI / Docker platform strings.
fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        "s390x" => "s390x",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Image Index (fat manifest)
// ---------------------------------------------------------------------------

/// An OCI image index (application/vnd.oci.image.index.v1+json or
/// application/vnd.docker.distribution.manifest.list.v2+json).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    /// Select the descriptor whose platform matches the given target.
    pub fn select_platform(&self, target: &Platform) -> Result<&Descriptor> {
        self.manifests
            .iter()
            .find(|d| {
                if let Some(ref p) = d.platform {
                    p.architecture == target.architecture
                        && p.os == target.os
                        && (target.variant.is_none() || p.variant == target.variant)
                } else {
                    false
                }
            })
            .ok_or_else(|| {
                OciError::Manifest(format!(
                    "no manifest found for platform {}/{}",
                    target.os, target.architecture,
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// Media type constants
// ---------------------------------------------------------------------------

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

pub const MEDIA_TYPE_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
pub const MEDIA_TYPE_DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Returns `true` when `media_type` is an image index / manifest list.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

/// Returns `true` when `media_type` is a single image manifest.
pub fn is_manifest_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_MANIFEST || media_type == MEDIA_TYPE_DOCKER_MANIFEST
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
