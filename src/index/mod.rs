//! Sparse index artifacts.
//!
//! An [`ImageIndex`] lists an image's layers in order. Small layers are
//! *eager*: their raw blob sits in the artifact store under the layer digest.
//! Everything else is *lazy* and points at a [`SpanTable`] describing where
//! each file's bytes live inside the layer's decompressed tar stream, cut
//! into digest-addressed spans.
//!
//! Both artifacts are encoded with `serde_json` from structs with a fixed
//! field order and ordered collections only, so a rebuild over identical
//! layers yields byte-identical artifacts.

pub mod builder;

use lazysnap_oci::{Digest, TocEntry};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use builder::{
    DirLayerSource, IndexBuilder, MemoryLayerSource, RawLayerSource, RegistryLayerSource,
};

/// Media type of the top-level index artifact.
pub const INDEX_MEDIA_TYPE: &str = "application/vnd.lazysnap.index.v1+json";

/// Media type of a per-layer span table artifact.
pub const SPAN_TABLE_MEDIA_TYPE: &str = "application/vnd.lazysnap.spantable.v1+json";

/// Default upper bound on the length of a single span (4 MiB).
pub const DEFAULT_SPAN_SIZE: u64 = 4 * 1024 * 1024;

const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Image index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageIndex {
    pub schema_version: u32,
    pub media_type: String,
    /// Layers strictly smaller than this were stored eagerly.
    pub min_layer_size: u64,
    pub span_size: u64,
    /// Bottom-most layer first.
    pub layers: Vec<LayerEntry>,
}

/// One layer of the image and how its content is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerEntry {
    pub digest: Digest,
    pub size: u64,
    pub media_type: String,
    #[serde(flatten)]
    pub mode: LayerMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LayerMode {
    /// Raw blob stored locally under the layer digest.
    Eager,
    /// Content stays remote; the span table is stored locally.
    Lazy { span_table: Digest },
}

impl LayerEntry {
    pub fn is_eager(&self) -> bool {
        matches!(self.mode, LayerMode::Eager)
    }
}

impl ImageIndex {
    pub fn new(min_layer_size: u64, span_size: u64, layers: Vec<LayerEntry>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            media_type: INDEX_MEDIA_TYPE.to_string(),
            min_layer_size,
            span_size,
            layers,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and sanity-check an index artifact.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let index: ImageIndex = serde_json::from_slice(bytes)?;
        if index.media_type != INDEX_MEDIA_TYPE {
            return Err(Error::Build(format!(
                "not an image index: media type {:?}",
                index.media_type
            )));
        }
        if index.schema_version != SCHEMA_VERSION {
            return Err(Error::Build(format!(
                "unsupported index schema version {}",
                index.schema_version
            )));
        }
        Ok(index)
    }
}

// ---------------------------------------------------------------------------
// Span table
// ---------------------------------------------------------------------------

/// A contiguous slice of one regular file's data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub path: String,
    /// Offset of the span within the file.
    pub file_offset: u64,
    pub length: u64,
    /// Offset of the span within the decompressed layer stream.
    pub layer_offset: u64,
    /// Digest of exactly `length` bytes at `layer_offset`.
    pub digest: Digest,
}

impl Span {
    pub fn layer_end(&self) -> u64 {
        self.layer_offset + self.length
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanTable {
    pub media_type: String,
    pub layer: Digest,
    pub layer_media_type: String,
    pub span_size: u64,
    /// Every tar entry of the layer, in archive order.
    pub entries: Vec<TocEntry>,
    /// Ordered by `layer_offset`, non-overlapping.
    pub spans: Vec<Span>,
}

impl SpanTable {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a span table and check its ordering invariants.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let table: SpanTable = serde_json::from_slice(bytes)?;
        if table.media_type != SPAN_TABLE_MEDIA_TYPE {
            return Err(Error::Build(format!(
                "not a span table: media type {:?}",
                table.media_type
            )));
        }
        table.validate()?;
        Ok(table)
    }

    fn validate(&self) -> Result<()> {
        let mut end = 0u64;
        for span in &self.spans {
            if span.length == 0 || span.length > self.span_size {
                return Err(Error::Build(format!(
                    "span at {} of {} has invalid length {}",
                    span.layer_offset, self.layer, span.length
                )));
            }
            if span.layer_offset < end {
                return Err(Error::Build(format!(
                    "overlapping or unordered span at {} in {}",
                    span.layer_offset, self.layer
                )));
            }
            end = span.layer_end();
        }
        Ok(())
    }

    /// Spans overlapping the layer-stream range `[start, end)`.
    pub fn spans_in(&self, start: u64, end: u64) -> &[Span] {
        if start >= end {
            return &[];
        }
        let first = self.spans.partition_point(|s| s.layer_end() <= start);
        let last = self.spans.partition_point(|s| s.layer_offset < end);
        if first >= last {
            &[]
        } else {
            &self.spans[first..last]
        }
    }
}
