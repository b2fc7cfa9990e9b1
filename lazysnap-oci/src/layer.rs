use crate::error::{OciError, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Component, Path};
use tar::{Archive, EntryType};
use tracing::warn;

const XATTR_PAX_PREFIX: &str = "SCHILY.xattr.";

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

/// Compression applied to a layer blob, derived from its media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Compression {
    /// Map an OCI / Docker layer media type to its compression.
    /// Unknown media types fall back to gzip, the registry default.
    pub fn from_media_type(media_type: &str) -> Self {
        if media_type.contains("gzip") {
            Compression::Gzip
        } else if media_type.contains("zstd") {
            Compression::Zstd
        } else if media_type.contains("tar") && !media_type.contains('+') {
            Compression::None
        } else {
            warn!(media_type, "unknown compression; assuming gzip");
            Compression::Gzip
        }
    }
}

/// Return a `Read`er that decompresses `data` according to the OCI media type.
pub fn decompressor<'a>(media_type: &str, data: &'a [u8]) -> Result<Box<dyn Read + 'a>> {
    match Compression::from_media_type(media_type) {
        Compression::Gzip => Ok(Box::new(GzDecoder::new(data))),
        Compression::Zstd => {
            let decoder = zstd::Decoder::new(data)
                .map_err(|e| OciError::Layer(format!("zstd init: {}", e)))?;
            Ok(Box::new(decoder))
        }
        Compression::None => Ok(Box::new(data)),
    }
}

/// Fully decompress a layer blob into its tar stream.
pub fn decompress(media_type: &str, data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    decompressor(media_type, data)?
        .read_to_end(&mut out)
        .map_err(|e| OciError::Layer(format!("decompress {}: {}", media_type, e)))?;
    Ok(out)
}

/// Push-style decompressor: compressed bytes are written in, decompressed
/// bytes come out into `sink`. Used when a blob arrives in ranged pieces.
pub fn push_decompressor<'a, W: Write + Send + 'a>(
    compression: Compression,
    sink: W,
) -> Result<Box<dyn PushDecoder<W> + Send + 'a>> {
    match compression {
        Compression::Gzip => Ok(Box::new(flate2::write::GzDecoder::new(sink))),
        Compression::Zstd => {
            let decoder = zstd::stream::write::Decoder::new(sink)
                .map_err(|e| OciError::Layer(format!("zstd init: {}", e)))?;
            Ok(Box::new(decoder))
        }
        Compression::None => Ok(Box::new(Passthrough(sink))),
    }
}

/// A `Write` that decodes into an inner sink which can be inspected between
/// writes.
pub trait PushDecoder<W>: Write {
    fn sink(&self) -> &W;
}

impl<W: Write> PushDecoder<W> for flate2::write::GzDecoder<W> {
    fn sink(&self) -> &W {
        self.get_ref()
    }
}

impl<W: Write> PushDecoder<W> for zstd::stream::write::Decoder<'static, W> {
    fn sink(&self) -> &W {
        self.get_ref()
    }
}

struct Passthrough<W>(W);

impl<W: Write> Write for Passthrough<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write> PushDecoder<W> for Passthrough<W> {
    fn sink(&self) -> &W {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Table of contents
// ---------------------------------------------------------------------------

/// Kind of a tar entry as exposed by the filesystem view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Hardlink,
    Char,
    Block,
    Fifo,
}

/// Metadata for one tar entry, in archive order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocEntry {
    /// Normalized relative path ("" is the layer root).
    pub path: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
    /// Size of the file data (0 for everything but regular files).
    pub size: u64,
    /// Offset of the file data within the decompressed tar stream.
    pub offset: u64,
    /// Symlink target (verbatim) or hardlink target (normalized).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devmajor: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devminor: Option<u32>,
    /// Extended attributes from PAX `SCHILY.xattr.*` records. Ordered so
    /// that encoding is reproducible.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

impl TocEntry {
    /// Final path component, or `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        if self.path.is_empty() {
            None
        } else {
            Some(self.path.rsplit('/').next().unwrap_or(&self.path))
        }
    }
}

/// Walk a decompressed tar stream and return its table of contents.
///
/// Fails on malformed archives, paths escaping the root, and GNU sparse
/// entries (their data is not contiguous in the stream).
pub fn scan_tar(tar_stream: &[u8]) -> Result<Vec<TocEntry>> {
    let mut archive = Archive::new(tar_stream);
    let mut toc = Vec::new();

    for entry_result in archive.entries().map_err(malformed)? {
        let mut entry = entry_result.map_err(malformed)?;
        let raw_path = entry.path().map_err(malformed)?.into_owned();
        let path = normalize_path(&raw_path)?;

        let header = entry.header();
        let kind = match header.entry_type() {
            EntryType::Regular | EntryType::Continuous => EntryKind::File,
            EntryType::Directory => EntryKind::Dir,
            EntryType::Symlink => EntryKind::Symlink,
            EntryType::Link => EntryKind::Hardlink,
            EntryType::Char => EntryKind::Char,
            EntryType::Block => EntryKind::Block,
            EntryType::Fifo => EntryKind::Fifo,
            EntryType::GNUSparse => {
                return Err(OciError::Layer(format!(
                    "sparse tar entry not supported: {}",
                    raw_path.display()
                )))
            }
            EntryType::XGlobalHeader => continue,
            other => {
                return Err(OciError::Layer(format!(
                    "unsupported tar entry type {:?}: {}",
                    other,
                    raw_path.display()
                )))
            }
        };

        // Writers commonly leave these fields blank; read blank as zero.
        let mode = header.mode().unwrap_or(0);
        let uid = header.uid().unwrap_or(0);
        let gid = header.gid().unwrap_or(0);
        let mtime = header.mtime().unwrap_or(0);
        // Device numbers only mean something for device nodes and are blank
        // in most other headers.
        let (devmajor, devminor) = match kind {
            EntryKind::Char | EntryKind::Block => (
                header.device_major().ok().flatten(),
                header.device_minor().ok().flatten(),
            ),
            _ => (None, None),
        };

        let link_target = match kind {
            EntryKind::Symlink => entry
                .link_name()
                .map_err(malformed)?
                .map(|p| p.to_string_lossy().into_owned()),
            EntryKind::Hardlink => match entry.link_name().map_err(malformed)? {
                Some(p) => Some(normalize_path(&p)?),
                None => None,
            },
            _ => None,
        };

        let (size, offset) = if kind == EntryKind::File {
            (entry.size(), entry.raw_file_position())
        } else {
            (0, 0)
        };

        let mut xattrs = BTreeMap::new();
        if let Some(extensions) = entry.pax_extensions().map_err(malformed)? {
            for ext in extensions {
                let ext = ext.map_err(malformed)?;
                if let Ok(key) = ext.key() {
                    if let Some(name) = key.strip_prefix(XATTR_PAX_PREFIX) {
                        xattrs.insert(name.to_string(), ext.value_bytes().to_vec());
                    }
                }
            }
        }

        toc.push(TocEntry {
            path,
            kind,
            mode,
            uid,
            gid,
            mtime,
            size,
            offset,
            link_target,
            devmajor,
            devminor,
            xattrs,
        });
    }

    Ok(toc)
}

/// Normalize an archive path: drop `.` and leading `/`, reject `..`.
pub fn normalize_path(path: &Path) -> Result<String> {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(OciError::Layer(format!(
                    "path escapes layer root: {}",
                    path.display()
                )))
            }
        }
    }
    Ok(parts.join("/"))
}

fn malformed(e: std::io::Error) -> OciError {
    OciError::Layer(format!("malformed tar archive: {}", e))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression as GzLevel;

    fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for &(name, data) in entries {
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
        let mut enc = GzEncoder::new(Vec::new(), GzLevel::fast());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn compression_from_media_type() {
        assert_eq!(
            Compression::from_media_type("application/vnd.oci.image.layer.v1.tar+gzip"),
            Compression::Gzip
        );
        assert_eq!(
            Compression::from_media_type("application/vnd.oci.image.layer.v1.tar+zstd"),
            Compression::Zstd
        );
        assert_eq!(
            Compression::from_media_type("application/vnd.oci.image.layer.v1.tar"),
            Compression::None
        );
        assert_eq!(
            Compression::from_media_type("application/vnd.docker.image.rootfs.diff.tar.gzip"),
            Compression::Gzip
        );
    }

    #[test]
    fn decompress_gzip_round_trip() {
        let tar = build_tar(&[("a.txt", b"alpha")]);
        let out = decompress("application/vnd.oci.image.layer.v1.tar+gzip", &gzip(&tar)).unwrap();
        assert_eq!(out, tar);
    }

    #[test]
    fn decompress_garbage_gzip_fails() {
        let err = decompress("application/vnd.oci.image.layer.v1.tar+gzip", b"not gzip").unwrap_err();
        assert!(err.to_string().contains("decompress"), "{err}");
    }

    #[test]
    fn scan_records_offsets_of_file_data() {
        let tar = build_tar(&[("etc/hostname", b"box\n"), ("./usr/bin/tool", b"#!/bin/sh\n")]);
        let toc = scan_tar(&tar).unwrap();
        assert_eq!(toc.len(), 2);

        assert_eq!(toc[0].path, "etc/hostname");
        assert_eq!(toc[0].kind, EntryKind::File);
        assert_eq!(toc[0].size, 4);
        let off = toc[0].offset as usize;
        assert_eq!(&tar[off..off + 4], b"box\n");

        assert_eq!(toc[1].path, "usr/bin/tool");
        let off = toc[1].offset as usize;
        assert_eq!(&tar[off..off + 10], b"#!/bin/sh\n");
        assert_eq!(toc[1].file_name(), Some("tool"));
    }

    #[test]
    fn scan_links_and_dirs() {
        let mut builder = tar::Builder::new(Vec::new());

        let mut dir = tar::Header::new_gnu();
        dir.set_path("bin/").unwrap();
        dir.set_entry_type(EntryType::Directory);
        dir.set_mode(0o755);
        dir.set_size(0);
        dir.set_cksum();
        builder.append(&dir, &[][..]).unwrap();

        let mut sym = tar::Header::new_gnu();
        sym.set_path("bin/sh").unwrap();
        sym.set_entry_type(EntryType::Symlink);
        sym.set_link_name("busybox").unwrap();
        sym.set_size(0);
        sym.set_cksum();
        builder.append(&sym, &[][..]).unwrap();

        let mut hard = tar::Header::new_gnu();
        hard.set_path("bin/ash").unwrap();
        hard.set_entry_type(EntryType::Link);
        hard.set_link_name("./bin/busybox").unwrap();
        hard.set_size(0);
        hard.set_cksum();
        builder.append(&hard, &[][..]).unwrap();

        let tar = builder.into_inner().unwrap();
        let toc = scan_tar(&tar).unwrap();

        assert_eq!(toc[0].kind, EntryKind::Dir);
        assert_eq!(toc[0].path, "bin");
        assert_eq!(toc[1].kind, EntryKind::Symlink);
        assert_eq!(toc[1].link_target.as_deref(), Some("busybox"));
        assert_eq!(toc[2].kind, EntryKind::Hardlink);
        assert_eq!(toc[2].link_target.as_deref(), Some("bin/busybox"));
    }

    #[test]
    fn scan_accepts_blank_numeric_fields() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_path("etc/motd").unwrap();
        header.set_size(3);
        header.set_cksum();
        builder.append(&header, &b"hi\n"[..]).unwrap();
        let tar = builder.into_inner().unwrap();

        let toc = scan_tar(&tar).unwrap();
        assert_eq!(toc.len(), 1);
        assert_eq!(toc[0].kind, EntryKind::File);
        assert_eq!((toc[0].uid, toc[0].gid, toc[0].mode), (0, 0, 0));
        assert_eq!((toc[0].devmajor, toc[0].devminor), (None, None));
    }

    #[test]
    fn scan_keeps_device_numbers_of_device_nodes() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_path("dev/null").unwrap();
        header.set_entry_type(EntryType::Char);
        header.set_mode(0o666);
        header.set_size(0);
        header.set_device_major(1).unwrap();
        header.set_device_minor(3).unwrap();
        header.set_cksum();
        builder.append(&header, &[][..]).unwrap();
        let tar = builder.into_inner().unwrap();

        let toc = scan_tar(&tar).unwrap();
        assert_eq!(toc[0].kind, EntryKind::Char);
        assert_eq!((toc[0].devmajor, toc[0].devminor), (Some(1), Some(3)));
    }

    #[test]
    fn scan_rejects_truncated_archive() {
        let tar = build_tar(&[("big.bin", &[7u8; 4096])]);
        assert!(scan_tar(&tar[..700]).is_err());
    }

    #[test]
    fn normalize_rejects_parent_components() {
        assert!(normalize_path(Path::new("../etc/passwd")).is_err());
        assert_eq!(normalize_path(Path::new("./a/./b/")).unwrap(), "a/b");
        assert_eq!(normalize_path(Path::new("/")).unwrap(), "");
    }

    #[test]
    fn push_decoder_matches_pull_decoder() {
        let tar = build_tar(&[("x", &[1u8; 10_000])]);
        let compressed = gzip(&tar);
        let mut dec = push_decompressor(Compression::Gzip, Vec::new()).unwrap();
        for piece in compressed.chunks(97) {
            dec.write_all(piece).unwrap();
        }
        dec.flush().unwrap();
        assert_eq!(dec.sink(), &tar);
    }
}
