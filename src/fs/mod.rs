//! Lazy filesystem view over a sparse index.
//!
//! A [`LazyFs`] answers metadata queries from the merged tree built at mount
//! time and serves file data span by span. Each span request moves through
//! the same states: it is looked up in the artifact store and, if absent,
//! fetched through the [`Resolver`], verified against the span's digest and
//! written through to the store. Bytes that fail verification never reach a
//! reader and are never cached.

mod tree;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{try_join_all, FutureExt};
use lazysnap_oci::layer::{decompress, scan_tar};
use lazysnap_oci::{Descriptor, Digest, EntryKind};
use tracing::{debug, info};

use crate::coalesce::FetchGroup;
use crate::error::{Error, Result};
use crate::index::{ImageIndex, LayerMode, Span, SpanTable};
use crate::resolver::Resolver;
use crate::store::ArtifactStore;
use crate::verify::{self, VerifyPolicy};

pub use tree::{DirEntry, Metadata};
use tree::{DataRef, Tree};

/// Counters for the read path of one view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    /// Spans served from the local store.
    pub cache_hits: u64,
    /// Spans fetched from a remote source.
    pub remote_fetches: u64,
}

#[derive(Default)]
struct Counters {
    cache_hits: AtomicU64,
    remote_fetches: AtomicU64,
}

enum LayerContent {
    /// Decompressed stream of an eager layer, held in memory.
    Eager(Arc<Vec<u8>>),
    Lazy(Arc<SpanTable>),
}

struct MountedLayer {
    descriptor: Descriptor,
    content: LayerContent,
}

pub struct LazyFs {
    index_digest: Digest,
    index: ImageIndex,
    layers: Vec<MountedLayer>,
    tree: Tree,
    store: Arc<ArtifactStore>,
    resolver: Arc<Resolver>,
    flights: Arc<FetchGroup>,
    policy: VerifyPolicy,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for LazyFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyFs")
            .field("index_digest", &self.index_digest)
            .field("layers", &self.layers.len())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl LazyFs {
    /// Load the index at `index_digest` and build the merged view.
    ///
    /// Eager layers are read from the store here; no remote source is
    /// contacted.
    pub async fn open(
        index_digest: &Digest,
        store: Arc<ArtifactStore>,
        resolver: Arc<Resolver>,
        flights: Arc<FetchGroup>,
        policy: VerifyPolicy,
    ) -> Result<Self> {
        let index = ImageIndex::from_bytes(&store.get(index_digest).await?)?;

        let mut layers = Vec::with_capacity(index.layers.len());
        let mut tree = Tree::new();
        for (i, layer) in index.layers.iter().enumerate() {
            let descriptor = Descriptor::layer(layer.digest.clone(), layer.size, &layer.media_type);
            let (content, entries) = match &layer.mode {
                LayerMode::Eager => {
                    let raw = store.get(&layer.digest).await?;
                    if policy.verifies_cache_hits() {
                        verify::check(&raw, &layer.digest)?;
                    }
                    let media_type = layer.media_type.clone();
                    let (stream, entries) = tokio::task::spawn_blocking(move || {
                        let stream = decompress(&media_type, &raw)?;
                        let entries = scan_tar(&stream)?;
                        Ok::<_, lazysnap_oci::OciError>((stream, entries))
                    })
                    .await
                    .map_err(|e| Error::Mount(format!("layer scan task panicked: {e}")))??;
                    (LayerContent::Eager(Arc::new(stream)), entries)
                }
                LayerMode::Lazy { span_table } => {
                    let table = SpanTable::from_bytes(&store.get(span_table).await?)?;
                    if table.layer != layer.digest {
                        return Err(Error::Mount(format!(
                            "span table {} describes {}, expected {}",
                            span_table, table.layer, layer.digest
                        )));
                    }
                    let entries = table.entries.clone();
                    (LayerContent::Lazy(Arc::new(table)), entries)
                }
            };
            tree.apply_layer(i, &entries);
            layers.push(MountedLayer {
                descriptor,
                content,
            });
        }

        info!(
            index = %index_digest,
            layers = layers.len(),
            %policy,
            "opened lazy view",
        );
        Ok(Self {
            index_digest: index_digest.clone(),
            index,
            layers,
            tree,
            store,
            resolver,
            flights,
            policy,
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn index_digest(&self) -> &Digest {
        &self.index_digest
    }

    pub fn index(&self) -> &ImageIndex {
        &self.index
    }

    pub fn policy(&self) -> VerifyPolicy {
        self.policy
    }

    pub fn stats(&self) -> ReadStats {
        ReadStats {
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            remote_fetches: self.counters.remote_fetches.load(Ordering::Relaxed),
        }
    }

    // -- metadata -----------------------------------------------------------

    /// Metadata of `path`, not following a final symlink.
    pub fn stat(&self, path: &str) -> Result<Metadata> {
        let resolved = self.tree.resolve(path, false)?;
        Ok(self.node(&resolved)?.meta.clone())
    }

    /// Entries of the directory at `path`, sorted by name.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let resolved = self.tree.resolve(path, true)?;
        let node = self.node(&resolved)?;
        if !node.meta.is_dir() {
            return Err(Error::Fs(format!("not a directory: {path}")));
        }
        Ok(node
            .children
            .iter()
            .map(|(name, child)| DirEntry {
                name: name.clone(),
                kind: child.meta.kind,
            })
            .collect())
    }

    /// Target of the symlink at `path`.
    pub fn read_link(&self, path: &str) -> Result<String> {
        let resolved = self.tree.resolve(path, false)?;
        let meta = &self.node(&resolved)?.meta;
        match (&meta.kind, &meta.link_target) {
            (EntryKind::Symlink, Some(target)) => Ok(target.clone()),
            _ => Err(Error::Fs(format!("not a symlink: {path}"))),
        }
    }

    // -- data ---------------------------------------------------------------

    /// Read up to `len` bytes of the file at `path` starting at `offset`.
    /// Reads past the end of the file are truncated.
    pub async fn read(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        let resolved = self.tree.resolve(path, true)?;
        let node = self.node(&resolved)?;
        let data = match (&node.meta.kind, node.data) {
            (EntryKind::File, Some(data)) => data,
            (EntryKind::File, None) => return Ok(Vec::new()),
            (EntryKind::Dir, _) => return Err(Error::Fs(format!("is a directory: {path}"))),
            _ => return Err(Error::Fs(format!("not a regular file: {path}"))),
        };

        let size = node.meta.size;
        if offset >= size || len == 0 {
            return Ok(Vec::new());
        }
        let len = len.min(size - offset);
        self.read_stream(data, offset, len).await
    }

    /// Read the whole file at `path`.
    pub async fn read_to_end(&self, path: &str) -> Result<Vec<u8>> {
        self.read(path, 0, u64::MAX).await
    }

    /// Materialize the whole view under `dest`.
    ///
    /// Hard links are written as independent copies; device nodes and
    /// FIFOs are skipped.
    pub async fn export_to(&self, dest: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dest).await?;
        let mut files = 0usize;

        for (path, node) in self.tree.walk() {
            if path.is_empty() {
                continue;
            }
            let target = dest.join(&path);
            match node.meta.kind {
                EntryKind::Dir => tokio::fs::create_dir_all(&target).await?,
                EntryKind::File | EntryKind::Hardlink => {
                    let bytes = match node.data {
                        Some(data) if node.meta.size > 0 => {
                            self.read_stream(data, 0, node.meta.size).await?
                        }
                        _ => Vec::new(),
                    };
                    tokio::fs::write(&target, bytes).await?;
                    files += 1;
                }
                EntryKind::Symlink => {
                    let link = node.meta.link_target.as_deref().unwrap_or_default();
                    tokio::fs::symlink(link, &target).await?;
                }
                EntryKind::Char | EntryKind::Block | EntryKind::Fifo => {
                    debug!(%path, "skipping special file on export");
                }
            }
        }

        info!(index = %self.index_digest, dest = %dest.display(), files, "exported view");
        Ok(())
    }

    // -- internals ----------------------------------------------------------

    fn node(&self, resolved: &str) -> Result<&tree::Node> {
        self.tree
            .get(resolved)
            .ok_or_else(|| Error::Fs(format!("no such file or directory: {resolved}")))
    }

    /// Read `len` bytes at `offset` of the file whose data starts at `data`.
    async fn read_stream(&self, data: DataRef, offset: u64, len: u64) -> Result<Vec<u8>> {
        let layer = self
            .layers
            .get(data.layer)
            .ok_or_else(|| Error::Fs(format!("layer {} not mounted", data.layer)))?;
        let start = data.offset + offset;
        let end = start + len;

        match &layer.content {
            LayerContent::Eager(stream) => stream
                .get(start as usize..end as usize)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| {
                    Error::Fs(format!(
                        "range {start}..{end} outside layer {}",
                        layer.descriptor.digest
                    ))
                }),
            LayerContent::Lazy(table) => {
                let spans = table.spans_in(start, end);
                // One concurrent sub-request per span; any failure fails the
                // whole read.
                let chunks = try_join_all(
                    spans
                        .iter()
                        .map(|span| self.fetch_span(&layer.descriptor, span)),
                )
                .await?;

                let mut out = Vec::with_capacity(len as usize);
                for (span, chunk) in spans.iter().zip(&chunks) {
                    let from = start.max(span.layer_offset) - span.layer_offset;
                    let to = end.min(span.layer_end()) - span.layer_offset;
                    let piece = chunk.get(from as usize..to as usize).ok_or_else(|| {
                        Error::Fs(format!("chunk {} is shorter than its span", span.digest))
                    })?;
                    out.extend_from_slice(piece);
                }
                if out.len() as u64 != len {
                    return Err(Error::Fs(format!(
                        "span table of {} does not cover {start}..{end}",
                        layer.descriptor.digest
                    )));
                }
                Ok(out)
            }
        }
    }

    /// Return the verified bytes of one span, from the store when present,
    /// otherwise from a (coalesced) remote fetch.
    async fn fetch_span(&self, layer: &Descriptor, span: &Span) -> Result<Arc<[u8]>> {
        if let Some(bytes) = cached(&self.store, span, self.policy).await? {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(bytes);
        }

        let store = self.store.clone();
        let resolver = self.resolver.clone();
        let counters = self.counters.clone();
        let policy = self.policy;
        let layer = layer.clone();
        let span = span.clone();
        let key = span.digest.clone();

        self.flights
            .run(&key, move || {
                async move {
                    // Another flight may have filled the store meanwhile.
                    if let Some(bytes) = cached(&store, &span, policy).await? {
                        counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(bytes);
                    }

                    let bytes = resolver
                        .fetch(&layer, span.layer_offset, span.length)
                        .await?;
                    counters.remote_fetches.fetch_add(1, Ordering::Relaxed);
                    store.put_verified(&span.digest, &bytes).await?;
                    debug!(
                        layer = %layer.digest,
                        path = %span.path,
                        offset = span.file_offset,
                        length = span.length,
                        "span fetched and verified",
                    );
                    Ok(Arc::from(bytes))
                }
                .boxed()
            })
            .await
    }
}

/// Look the span's chunk up in the store, re-verifying under
/// [`VerifyPolicy::Always`]. A chunk of the wrong length is rejected under
/// either policy.
async fn cached(
    store: &ArtifactStore,
    span: &Span,
    policy: VerifyPolicy,
) -> Result<Option<Arc<[u8]>>> {
    match store.get(&span.digest).await {
        Ok(bytes) => {
            if bytes.len() as u64 != span.length || policy.verifies_cache_hits() {
                verify::check(&bytes, &span.digest)?;
            }
            Ok(Some(Arc::from(bytes)))
        }
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
