//! Mount table: the engine entry points.
//!
//! [`Snapshotter`] builds indexes, opens lazy views for snapshot IDs and
//! hands them to a [`MountRegistrar`], which stands in for whatever actually
//! exposes a filesystem to a container runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use lazysnap_oci::{Descriptor, Digest};
use tracing::{debug, info};

use crate::coalesce::FetchGroup;
use crate::error::{Error, Result};
use crate::fs::LazyFs;
use crate::index::{IndexBuilder, RawLayerSource, DEFAULT_SPAN_SIZE};
use crate::resolver::Resolver;
use crate::store::ArtifactStore;
use crate::verify::VerifyPolicy;

/// Receives views as they are mounted and unmounted.
#[async_trait::async_trait]
pub trait MountRegistrar: Send + Sync {
    async fn register(&self, snapshot_id: &str, fs: Arc<LazyFs>) -> Result<()>;
    async fn unregister(&self, snapshot_id: &str) -> Result<()>;
}

/// Registrar that only remembers what it was given.
#[derive(Default)]
pub struct InMemoryRegistrar {
    mounts: Mutex<HashMap<String, Arc<LazyFs>>>,
}

impl InMemoryRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, snapshot_id: &str) -> Option<Arc<LazyFs>> {
        self.lock().get(snapshot_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<LazyFs>>> {
        self.mounts.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait::async_trait]
impl MountRegistrar for InMemoryRegistrar {
    async fn register(&self, snapshot_id: &str, fs: Arc<LazyFs>) -> Result<()> {
        self.lock().insert(snapshot_id.to_string(), fs);
        Ok(())
    }

    async fn unregister(&self, snapshot_id: &str) -> Result<()> {
        self.lock().remove(snapshot_id);
        Ok(())
    }
}

/// One mounted snapshot.
#[derive(Clone)]
pub struct MountRecord {
    pub snapshot_id: String,
    pub index_digest: Digest,
    pub fs: Arc<LazyFs>,
    pub mounted_at: SystemTime,
}

impl std::fmt::Debug for MountRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountRecord")
            .field("snapshot_id", &self.snapshot_id)
            .field("index_digest", &self.index_digest)
            .field("mounted_at", &self.mounted_at)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Snapshotter
// ---------------------------------------------------------------------------

pub struct Snapshotter {
    store: Arc<ArtifactStore>,
    policy: VerifyPolicy,
    span_size: u64,
    resolver: Option<Arc<Resolver>>,
    layer_source: Option<Arc<dyn RawLayerSource>>,
    registrar: Arc<dyn MountRegistrar>,
    flights: Arc<FetchGroup>,
    mounts: Mutex<HashMap<String, MountRecord>>,
    /// Serializes mount/unmount per snapshot ID.
    id_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Snapshotter {
    pub fn new(store: Arc<ArtifactStore>, policy: VerifyPolicy) -> Self {
        Self {
            store,
            policy,
            span_size: DEFAULT_SPAN_SIZE,
            resolver: None,
            layer_source: None,
            registrar: Arc::new(InMemoryRegistrar::new()),
            flights: Arc::new(FetchGroup::new()),
            mounts: Mutex::new(HashMap::new()),
            id_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_layer_source(mut self, source: Arc<dyn RawLayerSource>) -> Self {
        self.layer_source = Some(source);
        self
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn MountRegistrar>) -> Self {
        self.registrar = registrar;
        self
    }

    pub fn with_span_size(mut self, span_size: u64) -> Self {
        self.span_size = span_size;
        self
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn policy(&self) -> VerifyPolicy {
        self.policy
    }

    /// Build and store a sparse index for `layers`; returns its digest.
    pub async fn build_index(&self, layers: &[Descriptor], min_layer_size: u64) -> Result<Digest> {
        let source = self
            .layer_source
            .as_deref()
            .ok_or_else(|| Error::Build("no layer source configured".into()))?;
        IndexBuilder::new(&self.store, source)
            .span_size(self.span_size)
            .build(layers, min_layer_size)
            .await
    }

    /// Mount the index at `index_digest` as `snapshot_id`.
    ///
    /// Re-mounting the same index under the same ID returns the existing
    /// view; a different index under a mounted ID is an error.
    pub async fn open_mount(&self, snapshot_id: &str, index_digest: &Digest) -> Result<Arc<LazyFs>> {
        let lock = self.id_lock(snapshot_id);
        let result = {
            let _guard = lock.lock().await;
            self.open_mount_locked(snapshot_id, index_digest).await
        };
        drop(lock);
        self.release_id_lock(snapshot_id);
        result
    }

    async fn open_mount_locked(
        &self,
        snapshot_id: &str,
        index_digest: &Digest,
    ) -> Result<Arc<LazyFs>> {
        if let Some(existing) = self.record(snapshot_id) {
            if &existing.index_digest == index_digest {
                debug!(snapshot_id, "already mounted");
                return Ok(existing.fs);
            }
            return Err(Error::Mount(format!(
                "{snapshot_id} is already mounted with index {}",
                existing.index_digest
            )));
        }

        let resolver = self
            .resolver
            .clone()
            .ok_or_else(|| Error::Mount("no remote resolver configured".into()))?;
        let fs = Arc::new(
            LazyFs::open(
                index_digest,
                self.store.clone(),
                resolver,
                self.flights.clone(),
                self.policy,
            )
            .await?,
        );
        self.registrar.register(snapshot_id, fs.clone()).await?;

        self.lock_mounts().insert(
            snapshot_id.to_string(),
            MountRecord {
                snapshot_id: snapshot_id.to_string(),
                index_digest: index_digest.clone(),
                fs: fs.clone(),
                mounted_at: SystemTime::now(),
            },
        );
        info!(snapshot_id, index = %index_digest, "mounted snapshot");
        Ok(fs)
    }

    /// Remove the mount for `snapshot_id`.
    pub async fn unmount(&self, snapshot_id: &str) -> Result<()> {
        let lock = self.id_lock(snapshot_id);
        let result = {
            let _guard = lock.lock().await;
            self.unmount_locked(snapshot_id).await
        };
        drop(lock);
        self.release_id_lock(snapshot_id);
        result
    }

    async fn unmount_locked(&self, snapshot_id: &str) -> Result<()> {
        if self.record(snapshot_id).is_none() {
            return Err(Error::Mount(format!("{snapshot_id} is not mounted")));
        }
        self.registrar.unregister(snapshot_id).await?;
        self.lock_mounts().remove(snapshot_id);
        info!(snapshot_id, "unmounted snapshot");
        Ok(())
    }

    /// Current mounts, ordered by snapshot ID.
    pub fn mounts(&self) -> Vec<MountRecord> {
        let mut records: Vec<MountRecord> = self.lock_mounts().values().cloned().collect();
        records.sort_by(|a, b| a.snapshot_id.cmp(&b.snapshot_id));
        records
    }

    fn record(&self, snapshot_id: &str) -> Option<MountRecord> {
        self.lock_mounts().get(snapshot_id).cloned()
    }

    fn lock_mounts(&self) -> std::sync::MutexGuard<'_, HashMap<String, MountRecord>> {
        self.mounts.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn id_lock(&self, snapshot_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.id_locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(snapshot_id.to_string()).or_default().clone()
    }

    fn release_id_lock(&self, snapshot_id: &str) {
        let mut locks = self.id_locks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(lock) = locks.get(snapshot_id) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(snapshot_id);
            }
        }
    }

    #[cfg(test)]
    fn id_lock_count(&self) -> usize {
        self.id_locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}
