//! OCI plumbing for lazysnap.
//!
//! Digests, manifest types, layer decompression and tar scanning, a
//! reference unpacker, and an OCI Distribution client that can fetch byte
//! ranges of a layer's decompressed stream.

pub mod digest;
pub mod error;
pub mod layer;
pub mod manifest;
pub mod registry;
pub mod unpack;

pub use digest::Digest;
pub use error::{OciError, Result};
pub use layer::{EntryKind, TocEntry};
pub use manifest::{Descriptor, OciManifest, Platform};
pub use registry::{ClientOptions, Credentials, ImageRef, RegistryClient};
