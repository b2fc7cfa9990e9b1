//! lazysnap: On-demand Remote Snapshot Engine
//!
//! Serves container filesystems without downloading whole layer blobs up
//! front. A sparse index records where every file's bytes live inside each
//! layer; reads fetch only the spans they touch, verify them against their
//! digests, and cache them in a content-addressed store.
//!
//! # Key Features
//!
//! - **Sparse Indexes**: Small layers stored eagerly, large ones cut into spans
//! - **Verified Reads**: Every fetched span is checked before it reaches a reader
//! - **Mirror Fallback**: Primary registry first, configured mirrors after
//! - **Fetch Coalescing**: Concurrent readers of one span share a single fetch
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lazysnap::prelude::*;
//! use lazysnap::index::RegistryLayerSource;
//! use lazysnap_oci::{ImageRef, Platform};
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::with_policy(VerifyPolicy::Always);
//!     let image = ImageRef::parse("registry.example.com/library/alpine:3.20")?;
//!     let source = RegistryLayerSource::new(image.clone(), config.client_options_for(&image, None))?;
//!     let layers = source.layers(&Platform::host()).await?;
//!
//!     let snapshotter = Snapshotter::new(
//!         Arc::new(ArtifactStore::new(config.root_path.clone())),
//!         config.policy(),
//!     )
//!     .with_layer_source(Arc::new(source))
//!     .with_resolver(Arc::new(config.resolver_for(&image, None)?));
//!
//!     let index = snapshotter
//!         .build_index(&layers, config.build.min_layer_size)
//!         .await?;
//!     let fs = snapshotter.open_mount("alpine", &index).await?;
//!
//!     let os_release = fs.read_to_end("/etc/os-release").await?;
//!     println!("{}", String::from_utf8_lossy(&os_release));
//!     Ok(())
//! }
//! ```

// Engine
pub mod coalesce;
pub mod error;
pub mod fs;
pub mod index;
pub mod mount;
pub mod resolver;
pub mod store;
pub mod verify;

// Ambient
pub mod config;

// Re-exports for convenience
pub use error::{Error, FetchError, Result, SourceFailure, VerificationError};
pub use fs::LazyFs;
pub use lazysnap_oci::Digest;
pub use mount::Snapshotter;

// Prelude for common imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::fs::{LazyFs, Metadata, ReadStats};
    pub use crate::index::{ImageIndex, RawLayerSource};
    pub use crate::mount::{InMemoryRegistrar, MountRegistrar, Snapshotter};
    pub use crate::resolver::{RangeFetcher, Resolver};
    pub use crate::store::ArtifactStore;
    pub use crate::verify::VerifyPolicy;
    pub use lazysnap_oci::{Descriptor, Digest};
}
