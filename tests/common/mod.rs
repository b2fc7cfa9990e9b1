//! Shared fixtures: in-memory layer tarballs and a stub remote that serves
//! decompressed ranges straight from the blobs it was given.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lazysnap::index::MemoryLayerSource;
use lazysnap::resolver::{RangeFetcher, Resolver};
use lazysnap::store::ArtifactStore;
use lazysnap::verify::VerifyPolicy;
use lazysnap::{Error, Snapshotter};
use lazysnap_oci::layer::decompress;
use lazysnap_oci::manifest::{MEDIA_TYPE_LAYER_GZIP, MEDIA_TYPE_LAYER_TAR, MEDIA_TYPE_LAYER_ZSTD};
use lazysnap_oci::{Descriptor, Digest};

// ──────────────────────────────────────────────────────────────────────────────
// Layer tarballs
// ──────────────────────────────────────────────────────────────────────────────

pub struct LayerBuilder {
    builder: tar::Builder<Vec<u8>>,
}

impl LayerBuilder {
    pub fn new() -> Self {
        Self {
            builder: tar::Builder::new(Vec::new()),
        }
    }

    fn header(kind: tar::EntryType, mode: u32, size: u64) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(kind);
        header.set_mode(mode);
        header.set_size(size);
        header.set_mtime(1_700_000_000);
        header.set_uid(0);
        header.set_gid(0);
        header
    }

    pub fn dir(mut self, path: &str) -> Self {
        let mut header = Self::header(tar::EntryType::Directory, 0o755, 0);
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .unwrap();
        self
    }

    pub fn file(mut self, path: &str, data: &[u8]) -> Self {
        let mut header = Self::header(tar::EntryType::Regular, 0o644, data.len() as u64);
        self.builder.append_data(&mut header, path, data).unwrap();
        self
    }

    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        let mut header = Self::header(tar::EntryType::Symlink, 0o777, 0);
        self.builder.append_link(&mut header, path, target).unwrap();
        self
    }

    pub fn hardlink(mut self, path: &str, target: &str) -> Self {
        let mut header = Self::header(tar::EntryType::Link, 0o644, 0);
        self.builder.append_link(&mut header, path, target).unwrap();
        self
    }

    /// `.wh.<name>` inside `dir`.
    pub fn whiteout(self, dir: &str, name: &str) -> Self {
        let path = if dir.is_empty() {
            format!(".wh.{name}")
        } else {
            format!("{dir}/.wh.{name}")
        };
        self.file(&path, b"")
    }

    pub fn opaque(self, dir: &str) -> Self {
        self.file(&format!("{dir}/.wh..wh..opq"), b"")
    }

    pub fn tar(self) -> Vec<u8> {
        self.builder.into_inner().unwrap()
    }

    pub fn gzip(self) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&self.tar()).unwrap();
        enc.finish().unwrap()
    }

    pub fn zstd(self) -> Vec<u8> {
        zstd::encode_all(&self.tar()[..], 3).unwrap()
    }
}

pub fn tar_layer(blob: &[u8]) -> Descriptor {
    Descriptor::layer(Digest::sha256(blob), blob.len() as u64, MEDIA_TYPE_LAYER_TAR)
}

pub fn gzip_layer(blob: &[u8]) -> Descriptor {
    Descriptor::layer(Digest::sha256(blob), blob.len() as u64, MEDIA_TYPE_LAYER_GZIP)
}

pub fn zstd_layer(blob: &[u8]) -> Descriptor {
    Descriptor::layer(Digest::sha256(blob), blob.len() as u64, MEDIA_TYPE_LAYER_ZSTD)
}

/// Deterministic incompressible bytes (xorshift), so spans hash differently
/// and compressed layers stay large.
pub fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut x = 0x9e37_79b9u32 ^ seed.wrapping_mul(0x85eb_ca6b);
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            x as u8
        })
        .collect()
}

// ──────────────────────────────────────────────────────────────────────────────
// Stub remote
// ──────────────────────────────────────────────────────────────────────────────

/// Serves decompressed ranges of the layers it holds. Counts calls and can
/// be told to corrupt, fail or stall.
pub struct BlobRemote {
    name: String,
    /// Decompressed stream per layer digest.
    streams: HashMap<Digest, Vec<u8>>,
    calls: AtomicUsize,
    corrupt: AtomicBool,
    down: AtomicBool,
    delay: Duration,
}

impl BlobRemote {
    pub fn new(name: &str, layers: &[(&Descriptor, &[u8])]) -> Self {
        let streams = layers
            .iter()
            .map(|(desc, blob)| {
                (
                    desc.digest.clone(),
                    decompress(&desc.media_type, blob).unwrap(),
                )
            })
            .collect();
        Self {
            name: name.to_string(),
            streams,
            calls: AtomicUsize::new(0),
            corrupt: AtomicBool::new(false),
            down: AtomicBool::new(false),
            delay: Duration::ZERO,
        }
    }

    /// Hold every response for `delay` so concurrent readers overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_corrupt(&self, corrupt: bool) {
        self.corrupt.store(corrupt, Ordering::SeqCst);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl RangeFetcher for BlobRemote {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_range(
        &self,
        layer: &Descriptor,
        offset: u64,
        length: u64,
    ) -> lazysnap::Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::Store(format!("{} is down", self.name)));
        }
        let stream = self
            .streams
            .get(&layer.digest)
            .ok_or_else(|| Error::NotFound(layer.digest.clone()))?;
        let mut bytes = stream[offset as usize..(offset + length) as usize].to_vec();
        if self.corrupt.load(Ordering::SeqCst) {
            if let Some(first) = bytes.first_mut() {
                *first ^= 0xff;
            }
        }
        Ok(bytes)
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Wiring
// ──────────────────────────────────────────────────────────────────────────────

pub fn source_for(blobs: &[&[u8]]) -> Arc<MemoryLayerSource> {
    let mut source = MemoryLayerSource::new();
    for blob in blobs {
        source.insert(blob.to_vec());
    }
    Arc::new(source)
}

pub fn snapshotter(
    root: &Path,
    policy: VerifyPolicy,
    source: Arc<MemoryLayerSource>,
    remote: Arc<dyn RangeFetcher>,
    span_size: u64,
) -> Snapshotter {
    Snapshotter::new(Arc::new(ArtifactStore::new(root.to_path_buf())), policy)
        .with_layer_source(source)
        .with_resolver(Arc::new(Resolver::new(remote)))
        .with_span_size(span_size)
}

/// Recursively compare two directory trees: names, kinds, file contents and
/// symlink targets.
pub fn assert_same_tree(expected: &Path, actual: &Path) {
    let mut want = listing(expected);
    let mut got = listing(actual);
    want.sort();
    got.sort();
    assert_eq!(want, got, "tree mismatch");
}

fn listing(root: &Path) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            let rel = path
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .into_owned();
            let meta = std::fs::symlink_metadata(&path).unwrap();
            let desc = if meta.file_type().is_symlink() {
                format!("symlink -> {}", std::fs::read_link(&path).unwrap().display())
            } else if meta.is_dir() {
                stack.push(path.clone());
                "dir".to_string()
            } else {
                let data = std::fs::read(&path).unwrap();
                format!("file {}", Digest::sha256(&data))
            };
            out.push((rel, desc));
        }
    }
    out
}
