//! Index builds are deterministic: the same layers produce byte-identical
//! artifacts, in any store, every time.
//!
//! ```bash
//! cargo test --test reproducible_build
//! ```

mod common;

use std::sync::Arc;

use common::{gzip_layer, noise, source_for, tar_layer, LayerBuilder};
use lazysnap::index::{ImageIndex, IndexBuilder, LayerMode, SpanTable};
use lazysnap::store::ArtifactStore;
use lazysnap::verify::VerifyPolicy;
use lazysnap::{Error, Snapshotter};
use lazysnap_oci::Descriptor;

fn layers() -> (Vec<Vec<u8>>, Vec<Descriptor>) {
    let base = LayerBuilder::new()
        .dir("bin")
        .file("bin/app", &noise(50_000, 3))
        .file("bin/helper", &noise(9_000, 4))
        .symlink("bin/app-latest", "app")
        .gzip();
    let config = LayerBuilder::new()
        .file("etc/app.conf", b"threads = 4\n")
        .tar();
    let descs = vec![gzip_layer(&base), tar_layer(&config)];
    (vec![base, config], descs)
}

/// Just above the config layer, so only the base layer is lazy.
fn min_layer_size(descs: &[Descriptor]) -> u64 {
    descs[1].size + 1
}

async fn build_in(root: &std::path::Path) -> (ArtifactStore, lazysnap::Digest) {
    let (blobs, descs) = layers();
    let refs: Vec<&[u8]> = blobs.iter().map(Vec::as_slice).collect();
    let source = source_for(&refs);
    let store = ArtifactStore::new(root.to_path_buf());
    let digest = IndexBuilder::new(&store, source.as_ref())
        .span_size(8192)
        .build(&descs, min_layer_size(&descs))
        .await
        .unwrap();
    (store, digest)
}

#[tokio::test]
async fn separate_stores_produce_identical_artifacts() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();

    let (store_a, index_a) = build_in(a.path()).await;
    let (store_b, index_b) = build_in(b.path()).await;

    assert_eq!(index_a, index_b);
    let listed = store_a.list().await.unwrap();
    assert_eq!(listed, store_b.list().await.unwrap());
    for digest in &listed {
        assert_eq!(
            store_a.get(digest).await.unwrap(),
            store_b.get(digest).await.unwrap()
        );
    }
}

#[tokio::test]
async fn rebuilding_in_place_writes_nothing_new() {
    let dir = tempfile::tempdir().unwrap();
    let (store, first) = build_in(dir.path()).await;
    let before = store.list().await.unwrap();
    let writes = store.physical_writes();

    let (blobs, descs) = layers();
    let refs: Vec<&[u8]> = blobs.iter().map(Vec::as_slice).collect();
    let source = source_for(&refs);
    let second = IndexBuilder::new(&store, source.as_ref())
        .span_size(8192)
        .build(&descs, min_layer_size(&descs))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(before, store.list().await.unwrap());
    assert_eq!(store.physical_writes(), writes);
}

#[tokio::test]
async fn index_records_modes_and_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let (store, digest) = build_in(dir.path()).await;

    let index = ImageIndex::from_bytes(&store.get(&digest).await.unwrap()).unwrap();
    assert_eq!(index.min_layer_size, index.layers[1].size + 1);
    assert_eq!(index.span_size, 8192);
    assert_eq!(index.layers.len(), 2);

    // Layers are only copied into the store when eager.
    let LayerMode::Lazy { span_table } = &index.layers[0].mode else {
        panic!("base layer should be lazy");
    };
    assert!(index.layers[1].is_eager());
    assert!(store.has(&index.layers[1].digest).await);
    assert!(!store.has(&index.layers[0].digest).await);

    let table = SpanTable::from_bytes(&store.get(span_table).await.unwrap()).unwrap();
    assert_eq!(table.layer, index.layers[0].digest);
    // 50_000 bytes in 8 KiB spans plus 9_000 bytes in two.
    assert_eq!(table.spans.len(), 7 + 2);
    for span in &table.spans {
        assert!(!store.has(&span.digest).await);
        assert!(span.length <= 8192);
    }
}

#[tokio::test]
async fn build_rejects_a_layer_with_the_wrong_digest() {
    let dir = tempfile::tempdir().unwrap();
    let (blobs, mut descs) = layers();
    descs[1].digest = lazysnap::Digest::sha256(b"not the config layer");

    let refs: Vec<&[u8]> = blobs.iter().map(Vec::as_slice).collect();
    let mut source = lazysnap::index::MemoryLayerSource::new();
    for (desc, blob) in descs.iter().zip(&refs) {
        source.insert_as(desc.digest.clone(), blob.to_vec());
    }

    let snap = Snapshotter::new(
        Arc::new(ArtifactStore::new(dir.path().to_path_buf())),
        VerifyPolicy::Always,
    )
    .with_layer_source(Arc::new(source));
    let err = snap.build_index(&descs, 1).await.unwrap_err();
    assert!(matches!(err, Error::Build(_)), "{err}");
}
