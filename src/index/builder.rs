//! Builds sparse indexes from raw layer blobs.

use std::collections::HashMap;
use std::path::PathBuf;

use lazysnap_oci::layer::{decompress, scan_tar};
use lazysnap_oci::{
    ClientOptions, Descriptor, Digest, EntryKind, ImageRef, Platform, RegistryClient,
};
use tracing::{debug, info};

use super::{
    ImageIndex, LayerEntry, LayerMode, Span, SpanTable, DEFAULT_SPAN_SIZE, SPAN_TABLE_MEDIA_TYPE,
};
use crate::error::{Error, Result};
use crate::store::ArtifactStore;
use crate::verify;

/// Supplies the raw (possibly compressed) bytes of a layer blob at build
/// time.
#[async_trait::async_trait]
pub trait RawLayerSource: Send + Sync {
    async fn read(&self, digest: &Digest) -> Result<Vec<u8>>;
}

/// Layer blobs stored as `<dir>/<hex>`, the layout of an OCI image-layout
/// `blobs/sha256` directory.
pub struct DirLayerSource {
    dir: PathBuf,
}

impl DirLayerSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait::async_trait]
impl RawLayerSource for DirLayerSource {
    async fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.dir.join(digest.hex())).await?)
    }
}

/// Layer blobs downloaded whole from the image's registry.
pub struct RegistryLayerSource {
    image: ImageRef,
    client: RegistryClient,
}

impl RegistryLayerSource {
    pub fn new(image: ImageRef, options: ClientOptions) -> Result<Self> {
        Ok(Self {
            image,
            client: RegistryClient::with_options(options)?,
        })
    }

    /// Layers of the image's manifest for `platform`, bottom-up.
    pub async fn layers(&self, platform: &Platform) -> Result<Vec<Descriptor>> {
        let manifest = self.client.resolve_manifest(&self.image, platform).await?;
        debug!(
            image = %self.image.repository,
            layers = manifest.layers.len(),
            "resolved manifest",
        );
        Ok(manifest.layers)
    }
}

#[async_trait::async_trait]
impl RawLayerSource for RegistryLayerSource {
    async fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        Ok(self.client.fetch_blob(&self.image, digest).await?)
    }
}

/// Layer blobs held in memory.
#[derive(Default)]
pub struct MemoryLayerSource {
    blobs: HashMap<Digest, Vec<u8>>,
}

impl MemoryLayerSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a blob and return its digest.
    pub fn insert(&mut self, data: Vec<u8>) -> Digest {
        let digest = Digest::sha256(&data);
        self.blobs.insert(digest.clone(), data);
        digest
    }

    /// Add a blob under an arbitrary digest, whether or not it matches.
    pub fn insert_as(&mut self, digest: Digest, data: Vec<u8>) {
        self.blobs.insert(digest, data);
    }
}

#[async_trait::async_trait]
impl RawLayerSource for MemoryLayerSource {
    async fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| Error::NotFound(digest.clone()))
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct IndexBuilder<'a> {
    store: &'a ArtifactStore,
    source: &'a dyn RawLayerSource,
    span_size: u64,
}

impl<'a> IndexBuilder<'a> {
    pub fn new(store: &'a ArtifactStore, source: &'a dyn RawLayerSource) -> Self {
        Self {
            store,
            source,
            span_size: DEFAULT_SPAN_SIZE,
        }
    }

    pub fn span_size(mut self, span_size: u64) -> Self {
        self.span_size = span_size;
        self
    }

    /// Build and store the index for `layers` (bottom-most first). Layers
    /// smaller than `min_layer_size` are stored eagerly.
    ///
    /// Returns the digest of the index artifact.
    pub async fn build(&self, layers: &[Descriptor], min_layer_size: u64) -> Result<Digest> {
        if self.span_size == 0 {
            return Err(Error::Config("span size must be greater than zero".into()));
        }

        let mut entries = Vec::with_capacity(layers.len());
        for layer in layers {
            let raw = self
                .source
                .read(&layer.digest)
                .await
                .map_err(|e| Error::Build(format!("layer {} unreadable: {e}", layer.digest)))?;
            if raw.len() as u64 != layer.size {
                return Err(Error::Build(format!(
                    "layer {} is {} bytes, descriptor says {}",
                    layer.digest,
                    raw.len(),
                    layer.size
                )));
            }
            if !verify::verify(&raw, &layer.digest) {
                return Err(Error::Build(format!(
                    "layer {} does not match its digest (got {})",
                    layer.digest,
                    Digest::sha256(&raw)
                )));
            }

            let mode = if layer.size < min_layer_size {
                // Unpacked at mount time; reject unreadable archives now.
                let layer_desc = layer.clone();
                let raw = tokio::task::spawn_blocking(move || {
                    check_layer(&layer_desc, &raw).map(|()| raw)
                })
                .await
                .map_err(|e| Error::Build(format!("indexing task panicked: {e}")))??;
                self.store.put_verified(&layer.digest, &raw).await?;
                debug!(digest = %layer.digest, size = layer.size, "stored eager layer");
                LayerMode::Eager
            } else {
                let layer_desc = layer.clone();
                let span_size = self.span_size;
                // Decompressing and hashing is CPU-bound.
                let table = tokio::task::spawn_blocking(move || {
                    span_table_for(&layer_desc, &raw, span_size)
                })
                .await
                .map_err(|e| Error::Build(format!("indexing task panicked: {e}")))??;
                let span_count = table.spans.len();
                let span_table = self.store.put(&table.to_bytes()?).await?;
                debug!(
                    digest = %layer.digest,
                    %span_table,
                    spans = span_count,
                    "stored span table",
                );
                LayerMode::Lazy { span_table }
            };

            entries.push(LayerEntry {
                digest: layer.digest.clone(),
                size: layer.size,
                media_type: layer.media_type.clone(),
                mode,
            });
        }

        let index = ImageIndex::new(min_layer_size, self.span_size, entries);
        let digest = self.store.put(&index.to_bytes()?).await?;
        info!(
            %digest,
            layers = index.layers.len(),
            eager = index.layers.iter().filter(|l| l.is_eager()).count(),
            "built sparse index",
        );
        Ok(digest)
    }
}

/// Decompress `raw` and walk its entries without keeping them.
fn check_layer(layer: &Descriptor, raw: &[u8]) -> Result<()> {
    let build_err = |e: lazysnap_oci::OciError| Error::Build(format!("layer {}: {e}", layer.digest));

    let stream = decompress(&layer.media_type, raw).map_err(build_err)?;
    scan_tar(&stream).map_err(build_err)?;
    Ok(())
}

/// Decompress `raw`, walk its entries and cut every regular file into spans
/// of at most `span_size` bytes.
fn span_table_for(layer: &Descriptor, raw: &[u8], span_size: u64) -> Result<SpanTable> {
    let build_err = |e: lazysnap_oci::OciError| Error::Build(format!("layer {}: {e}", layer.digest));

    let stream = decompress(&layer.media_type, raw).map_err(build_err)?;
    let entries = scan_tar(&stream).map_err(build_err)?;

    let mut spans = Vec::new();
    for entry in entries.iter().filter(|e| e.kind == EntryKind::File) {
        let mut file_offset = 0u64;
        while file_offset < entry.size {
            let length = span_size.min(entry.size - file_offset);
            let layer_offset = entry.offset + file_offset;
            let start = layer_offset as usize;
            let chunk = stream.get(start..start + length as usize).ok_or_else(|| {
                Error::Build(format!(
                    "layer {}: data of {} runs past end of stream",
                    layer.digest, entry.path
                ))
            })?;
            spans.push(Span {
                path: entry.path.clone(),
                file_offset,
                length,
                layer_offset,
                digest: Digest::sha256(chunk),
            });
            file_offset += length;
        }
    }

    Ok(SpanTable {
        media_type: SPAN_TABLE_MEDIA_TYPE.to_string(),
        layer: layer.digest.clone(),
        layer_media_type: layer.media_type.clone(),
        span_size,
        entries,
        spans,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazysnap_oci::manifest::{MEDIA_TYPE_LAYER_GZIP, MEDIA_TYPE_LAYER_TAR};
    use std::io::Write;

    fn tar_of(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for &(name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_path(name).unwrap();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(1_700_000_000);
            header.set_cksum();
            builder.append(&header, data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn spans_cover_file_data_in_bounded_pieces() {
        let big: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let tar = tar_of(&[("a", b"hello"), ("dir/big", &big[..]), ("empty", b"")]);
        let desc = Descriptor::layer(Digest::sha256(&tar), tar.len() as u64, MEDIA_TYPE_LAYER_TAR);

        let table = span_table_for(&desc, &tar, 1000).unwrap();
        assert_eq!(table.entries.len(), 3);
        // "a" → 1 span, "dir/big" → 3 spans, "empty" → none.
        assert_eq!(table.spans.len(), 4);

        let big_spans: Vec<_> = table.spans.iter().filter(|s| s.path == "dir/big").collect();
        assert_eq!(
            big_spans.iter().map(|s| s.length).collect::<Vec<_>>(),
            vec![1000, 1000, 500]
        );
        for s in &table.spans {
            let bytes = &tar[s.layer_offset as usize..s.layer_end() as usize];
            assert_eq!(Digest::sha256(bytes), s.digest);
        }
        assert!(table.spans.windows(2).all(|w| w[0].layer_end() <= w[1].layer_offset));
    }

    #[test]
    fn offsets_address_the_decompressed_stream() {
        let tar = tar_of(&[("etc/motd", b"welcome")]);
        let blob = gzip(&tar);
        let desc = Descriptor::layer(Digest::sha256(&blob), blob.len() as u64, MEDIA_TYPE_LAYER_GZIP);

        let table = span_table_for(&desc, &blob, DEFAULT_SPAN_SIZE).unwrap();
        let s = &table.spans[0];
        assert_eq!(&tar[s.layer_offset as usize..s.layer_end() as usize], b"welcome");
    }

    #[tokio::test]
    async fn small_layers_are_eager_and_large_ones_lazy() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().to_path_buf());
        let mut source = MemoryLayerSource::new();

        let small = tar_of(&[("s", b"small")]);
        let large = tar_of(&[("l", &[9u8; 8192][..])]);
        let small_d = source.insert(small.clone());
        let large_d = source.insert(large.clone());
        let layers = vec![
            Descriptor::layer(small_d.clone(), small.len() as u64, MEDIA_TYPE_LAYER_TAR),
            Descriptor::layer(large_d.clone(), large.len() as u64, MEDIA_TYPE_LAYER_TAR),
        ];

        let threshold = small.len() as u64 + 1;
        let digest = IndexBuilder::new(&store, &source)
            .build(&layers, threshold)
            .await
            .unwrap();

        let index = ImageIndex::from_bytes(&store.get(&digest).await.unwrap()).unwrap();
        assert_eq!(index.min_layer_size, threshold);
        assert!(index.layers[0].is_eager());
        assert_eq!(store.get(&small_d).await.unwrap(), small);

        match &index.layers[1].mode {
            LayerMode::Lazy { span_table } => {
                let table = SpanTable::from_bytes(&store.get(span_table).await.unwrap()).unwrap();
                assert_eq!(table.layer, large_d);
                assert_eq!(table.spans.len(), 1);
            }
            LayerMode::Eager => panic!("large layer must be lazy"),
        }
        // The lazy layer blob itself is never stored.
        assert!(!store.has(&large_d).await);
    }

    #[tokio::test]
    async fn digest_mismatch_is_a_build_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().to_path_buf());
        let mut source = MemoryLayerSource::new();
        let tar = tar_of(&[("x", b"x")]);
        let claimed = Digest::sha256(b"something else");
        source.insert_as(claimed.clone(), tar.clone());

        let layers = vec![Descriptor::layer(claimed, tar.len() as u64, MEDIA_TYPE_LAYER_TAR)];
        let err = IndexBuilder::new(&store, &source)
            .build(&layers, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Build(_)), "{err}");
    }

    #[tokio::test]
    async fn unreadable_and_malformed_layers_fail() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().to_path_buf());
        let mut source = MemoryLayerSource::new();

        let missing = vec![Descriptor::layer(Digest::sha256(b"nope"), 4, MEDIA_TYPE_LAYER_TAR)];
        let err = IndexBuilder::new(&store, &source)
            .build(&missing, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Build(_)), "{err}");

        let junk = b"definitely not gzip".to_vec();
        let d = source.insert(junk.clone());
        let layers = vec![Descriptor::layer(d, junk.len() as u64, MEDIA_TYPE_LAYER_GZIP)];
        let err = IndexBuilder::new(&store, &source)
            .build(&layers, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Build(_)), "{err}");
    }

    #[tokio::test]
    async fn malformed_eager_layer_fails_and_is_not_stored() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().to_path_buf());
        let mut source = MemoryLayerSource::new();

        let junk = b"definitely not gzip".to_vec();
        let d = source.insert(junk.clone());
        let layers = vec![Descriptor::layer(d.clone(), junk.len() as u64, MEDIA_TYPE_LAYER_GZIP)];
        let err = IndexBuilder::new(&store, &source)
            .build(&layers, u64::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Build(_)), "{err}");
        assert!(!store.has(&d).await);

        // A valid tar is still stored eagerly.
        let tar = tar_of(&[("a", b"hello")]);
        let d = source.insert(tar.clone());
        let layers = vec![Descriptor::layer(d.clone(), tar.len() as u64, MEDIA_TYPE_LAYER_TAR)];
        IndexBuilder::new(&store, &source)
            .build(&layers, u64::MAX)
            .await
            .unwrap();
        assert!(store.has(&d).await);
    }

    #[tokio::test]
    async fn dir_source_reads_by_hex_name() {
        let tmp = tempfile::tempdir().unwrap();
        let d = Digest::sha256(b"blob");
        std::fs::write(tmp.path().join(d.hex()), b"blob").unwrap();

        let source = DirLayerSource::new(tmp.path());
        assert_eq!(source.read(&d).await.unwrap(), b"blob");
        assert!(source.read(&Digest::sha256(b"other")).await.is_err());
    }
}
