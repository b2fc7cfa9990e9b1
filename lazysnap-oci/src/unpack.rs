use crate::error::Result;
use crate::layer::decompressor;
use std::fs;
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// A layer blob held in memory together with its media type.
#[derive(Debug, Clone, Copy)]
pub struct LayerBlob<'a> {
    pub media_type: &'a str,
    pub data: &'a [u8],
}

/// Extract the given layers (bottom-up order) into `dest`, producing a merged
/// root filesystem.  This is the fully-materialized reference a lazily served
/// view must match.  Returns the path to the rootfs directory.
pub fn unpack_layers(layers: &[LayerBlob<'_>], dest: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dest)?;

    for (i, layer) in layers.iter().enumerate() {
        info!(
            layer = i,
            media_type = %layer.media_type,
            size = layer.data.len(),
            "unpacking layer",
        );
        unpack_single_layer(layer, dest)?;
    }

    Ok(dest.to_path_buf())
}

// ---------------------------------------------------------------------------
// Single layer extraction
// ---------------------------------------------------------------------------

fn unpack_single_layer(layer: &LayerBlob<'_>, dest: &Path) -> Result<()> {
    let reader = decompressor(layer.media_type, layer.data)?;
    let mut archive = Archive::new(reader);
    // Do not preserve permissions bits that could block later access.
    archive.set_preserve_permissions(false);

    // Hard links whose target hasn't been extracted yet; retry after the
    // main pass.
    let mut deferred_hardlinks: Vec<(PathBuf, PathBuf)> = Vec::new();

    // We need to handle whiteouts ourselves, so iterate entries manually.
    for entry_result in archive.entries()? {
        let mut entry = entry_result?;
        let rel_path = entry.path()?.into_owned();

        let file_name = match rel_path.file_name() {
            Some(n) => n.to_string_lossy().to_string(),
            None => {
                // A root-level entry (e.g. "./") – just ensure the dir exists.
                let target = dest.join(&rel_path);
                if entry.header().entry_type().is_dir() {
                    fs::create_dir_all(&target)?;
                }
                continue;
            }
        };

        // --- Opaque whiteout: delete everything in the parent directory that
        //     was placed by *earlier* layers. ---
        if is_opaque_whiteout(&file_name) {
            let parent = dest.join(rel_path.parent().unwrap_or_else(|| Path::new("")));
            if parent.exists() {
                clear_directory(&parent)?;
            }
            continue;
        }

        // --- Regular whiteout: delete the named entry. ---
        if let Some(hidden) = whiteout_target(&file_name) {
            let target = dest
                .join(rel_path.parent().unwrap_or_else(|| Path::new("")))
                .join(hidden);
            if target.symlink_metadata().is_ok() {
                if target.is_dir() && !target.is_symlink() {
                    fs::remove_dir_all(&target)?;
                } else {
                    fs::remove_file(&target)?;
                }
                debug!(path = %target.display(), "applied whiteout");
            }
            continue;
        }

        // --- Hard links: the target may not be extracted yet. ---
        if entry.header().entry_type() == tar::EntryType::Link {
            if let Ok(Some(link_name)) = entry.header().link_name() {
                let link_target = dest.join(link_name);
                let link_path = dest.join(&rel_path);
                if link_target.exists() {
                    if let Some(parent) = link_path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    // Remove stale entry if present.
                    let _ = fs::remove_file(&link_path);
                    fs::hard_link(&link_target, &link_path)?;
                } else {
                    deferred_hardlinks.push((link_path, link_target));
                }
                continue;
            }
        }

        // --- Normal file / directory / symlink ---
        let target = dest.join(&rel_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
    }

    // Retry deferred hard links now that all regular entries are on disk.
    for (link_path, link_target) in &deferred_hardlinks {
        if link_target.exists() {
            if let Some(parent) = link_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let _ = fs::remove_file(link_path);
            fs::hard_link(link_target, link_path)?;
            debug!(
                link = %link_path.display(),
                target = %link_target.display(),
                "created deferred hard link",
            );
        } else {
            warn!(
                link = %link_path.display(),
                target = %link_target.display(),
                "hard link target still missing after full pass; skipping",
            );
        }
    }

    Ok(())
}

/// Remove all entries inside `dir` but keep the directory itself.
fn clear_directory(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Whiteout detection helpers (shared with the lazy filesystem view)
// ---------------------------------------------------------------------------

const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
const WHITEOUT_PREFIX: &str = ".wh.";

/// Returns `true` if `name` is an OCI whiteout marker (`.wh.<name>`).
pub fn is_whiteout(name: &str) -> bool {
    name.starts_with(WHITEOUT_PREFIX) && name != OPAQUE_WHITEOUT
}

/// Returns `true` if `name` is an opaque whiteout marker.
pub fn is_opaque_whiteout(name: &str) -> bool {
    name == OPAQUE_WHITEOUT
}

/// Given a whiteout filename (`.wh.foo`), return the name it hides (`foo`).
pub fn whiteout_target(name: &str) -> Option<&str> {
    if is_whiteout(name) {
        name.strip_prefix(WHITEOUT_PREFIX)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
