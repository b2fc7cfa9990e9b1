//! Content-addressed artifact store.
//!
//! Layout: `<root>/content/blobs/sha256/<hex>`, with writes staged under
//! `<root>/content/ingest/` and renamed into place. Index artifacts, span
//! tables, eager layer blobs and fetched chunks all live here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lazysnap_oci::Digest;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::verify;

pub struct ArtifactStore {
    root: PathBuf,
    /// Per-digest write locks; an entry lives only while a write is pending.
    locks: Mutex<HashMap<Digest, Arc<tokio::sync::Mutex<()>>>>,
    writes: AtomicU64,
}

impl ArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            locks: Mutex::new(HashMap::new()),
            writes: AtomicU64::new(0),
        }
    }

    /// Directory that holds all blobs: `<root>/content/blobs/sha256/`.
    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("content").join("blobs").join("sha256")
    }

    fn ingest_dir(&self) -> PathBuf {
        self.root.join("content").join("ingest")
    }

    /// Return the on-disk path for `digest` (whether or not it exists).
    pub fn path_of(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir().join(digest.hex())
    }

    /// Check whether an artifact for `digest` exists.
    pub async fn has(&self, digest: &Digest) -> bool {
        fs::try_exists(self.path_of(digest)).await.unwrap_or(false)
    }

    /// Store `data`, returning its digest. Storing content that is already
    /// present is a no-op.
    pub async fn put(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::sha256(data);
        self.install(&digest, data).await?;
        Ok(digest)
    }

    /// Store `data` under `expected`, rejecting content that does not hash
    /// to it.
    pub async fn put_verified(&self, expected: &Digest, data: &[u8]) -> Result<()> {
        verify::check(data, expected)?;
        self.install(expected, data).await
    }

    /// Read the artifact for `digest`. An absent artifact is
    /// [`Error::NotFound`]; any other failure is [`Error::Store`].
    pub async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.path_of(digest);
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(digest.clone()))
            }
            Err(e) => Err(store_err("read", &path, e)),
        }
    }

    /// All stored digests in sorted order.
    pub async fn list(&self) -> Result<Vec<Digest>> {
        let dir = self.blobs_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(store_err("list", &dir, e)),
        };

        let mut digests = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| store_err("list", &dir, e))?
        {
            let name = entry.file_name();
            if let Ok(d) = Digest::parse(&format!("sha256:{}", name.to_string_lossy())) {
                digests.push(d);
            }
        }
        digests.sort();
        Ok(digests)
    }

    /// Number of artifacts physically written by this instance.
    pub fn physical_writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Return a reference to the store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn install(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        let lock = self.digest_lock(digest);
        let result = {
            let _guard = lock.lock().await;
            self.install_locked(digest, data).await
        };
        drop(lock);
        self.release_lock(digest);
        result
    }

    async fn install_locked(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        let path = self.path_of(digest);
        if self.has(digest).await {
            debug!(%digest, "artifact already present");
            return Ok(());
        }

        let blobs = self.blobs_dir();
        let ingest = self.ingest_dir();
        fs::create_dir_all(&blobs)
            .await
            .map_err(|e| store_err("create", &blobs, e))?;
        fs::create_dir_all(&ingest)
            .await
            .map_err(|e| store_err("create", &ingest, e))?;

        // Unique staging name so that concurrent writers in other processes
        // never share a partial file.
        let staging = ingest.join(format!("{}.{}", digest.hex(), Uuid::now_v7()));
        if let Err(e) = fs::write(&staging, data).await {
            let _ = fs::remove_file(&staging).await;
            return Err(store_err("write", &staging, e));
        }
        if let Err(e) = fs::rename(&staging, &path).await {
            let _ = fs::remove_file(&staging).await;
            return Err(store_err("commit", &path, e));
        }

        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(%digest, size = data.len(), path = %path.display(), "stored artifact");
        Ok(())
    }

    fn digest_lock(&self, digest: &Digest) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(digest.clone()).or_default().clone()
    }

    fn release_lock(&self, digest: &Digest) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(lock) = locks.get(digest) {
            // Only the map's own handle is left: nobody else is waiting.
            if Arc::strong_count(lock) == 1 {
                locks.remove(digest);
            }
        }
    }
}

fn store_err(action: &str, path: &Path, e: std::io::Error) -> Error {
    Error::Store(format!("{action} {}: {e}", path.display()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
