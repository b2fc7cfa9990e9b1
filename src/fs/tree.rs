//! Merged directory tree of a lazily mounted image.
//!
//! Layers are applied bottom-up with the same rules as the reference
//! unpacker: entries are processed in archive order, an opaque whiteout
//! clears what its directory holds at that point, a `.wh.<name>` marker
//! removes `<name>`, and hard links copy their target node (deferred to the
//! end of the layer when the target has not appeared yet).

use std::collections::{BTreeMap, VecDeque};

use lazysnap_oci::unpack::{is_opaque_whiteout, whiteout_target};
use lazysnap_oci::{EntryKind, TocEntry};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const MAX_SYMLINK_HOPS: usize = 40;

/// `lstat`-style metadata of one entry in the view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
    pub size: u64,
    pub link_target: Option<String>,
    pub devmajor: Option<u32>,
    pub devminor: Option<u32>,
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

impl Metadata {
    fn implicit_dir() -> Self {
        Self {
            kind: EntryKind::Dir,
            mode: 0o755,
            uid: 0,
            gid: 0,
            mtime: 0,
            size: 0,
            link_target: None,
            devmajor: None,
            devminor: None,
            xattrs: BTreeMap::new(),
        }
    }

    fn from_entry(entry: &TocEntry) -> Self {
        Self {
            kind: entry.kind,
            mode: entry.mode,
            uid: entry.uid,
            gid: entry.gid,
            mtime: entry.mtime,
            size: entry.size,
            link_target: entry.link_target.clone(),
            devmajor: entry.devmajor,
            devminor: entry.devminor,
            xattrs: entry.xattrs.clone(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }
}

/// A directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// Where a regular file's bytes live: a layer of the index and an offset in
/// that layer's decompressed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DataRef {
    pub layer: usize,
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub meta: Metadata,
    pub data: Option<DataRef>,
    pub children: BTreeMap<String, Node>,
}

impl Node {
    fn dir(meta: Metadata) -> Self {
        Self {
            meta,
            data: None,
            children: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Tree {
    root: Node,
}

impl Tree {
    pub fn new() -> Self {
        Self {
            root: Node::dir(Metadata::implicit_dir()),
        }
    }

    /// Apply one layer's table of contents on top of the current tree.
    pub fn apply_layer(&mut self, layer: usize, entries: &[TocEntry]) {
        let mut deferred: Vec<(&str, &str)> = Vec::new();

        for entry in entries {
            let Some(name) = entry.file_name() else {
                // The layer root ("./").
                if entry.kind == EntryKind::Dir {
                    self.root.meta = Metadata::from_entry(entry);
                }
                continue;
            };
            let parent = parent_of(&entry.path);

            if is_opaque_whiteout(name) {
                if let Some(dir) = self.get_mut(parent) {
                    dir.children.clear();
                }
                continue;
            }
            if let Some(hidden) = whiteout_target(name) {
                if self.remove(&join(parent, hidden)) {
                    debug!(layer, path = %join(parent, hidden), "applied whiteout");
                }
                continue;
            }

            if entry.kind == EntryKind::Hardlink {
                let Some(target) = entry.link_target.as_deref() else {
                    warn!(layer, path = %entry.path, "hard link without target; skipping");
                    continue;
                };
                if !self.link(&entry.path, target) {
                    deferred.push((&entry.path, target));
                }
                continue;
            }

            let data = (entry.kind == EntryKind::File).then_some(DataRef {
                layer,
                offset: entry.offset,
            });
            self.insert(
                &entry.path,
                Node {
                    meta: Metadata::from_entry(entry),
                    data,
                    children: BTreeMap::new(),
                },
            );
        }

        for (path, target) in deferred {
            if !self.link(path, target) {
                warn!(
                    layer,
                    link = path,
                    target,
                    "hard link target still missing after full pass; skipping",
                );
            }
        }
    }

    /// Look up `path` without following symlinks.
    pub fn get(&self, path: &str) -> Option<&Node> {
        let mut node = &self.root;
        for part in components(path) {
            node = node.children.get(part)?;
        }
        Some(node)
    }

    /// Canonical path of `path`, following symlinks in every component and,
    /// when `follow_last` is set, in the final one too.
    pub fn resolve(&self, path: &str, follow_last: bool) -> Result<String> {
        let mut pending: VecDeque<String> = components(path).map(str::to_string).collect();
        let mut resolved: Vec<String> = Vec::new();
        let mut hops = 0;

        while let Some(part) = pending.pop_front() {
            if part == ".." {
                resolved.pop();
                continue;
            }
            resolved.push(part);
            let current = resolved.join("/");
            let node = self
                .get(&current)
                .ok_or_else(|| Error::Fs(format!("no such file or directory: {path}")))?;

            if node.meta.is_symlink() && (follow_last || !pending.is_empty()) {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(Error::Fs(format!("too many levels of symbolic links: {path}")));
                }
                let target = node.meta.link_target.clone().unwrap_or_default();
                resolved.pop();
                if target.starts_with('/') {
                    resolved.clear();
                }
                for part in components(&target).rev() {
                    pending.push_front(part.to_string());
                }
            } else if !node.meta.is_dir() && !pending.is_empty() {
                return Err(Error::Fs(format!("not a directory: {current}")));
            }
        }
        Ok(resolved.join("/"))
    }

    /// Depth-first, parents before children. Paths are relative; the root
    /// is `""`.
    pub fn walk(&self) -> Vec<(String, &Node)> {
        let mut out = Vec::new();
        let mut stack = vec![(String::new(), &self.root)];
        while let Some((path, node)) = stack.pop() {
            for (name, child) in node.children.iter().rev() {
                stack.push((join(&path, name), child));
            }
            out.push((path, node));
        }
        out
    }

    fn get_mut(&mut self, path: &str) -> Option<&mut Node> {
        let mut node = &mut self.root;
        for part in components(path) {
            node = node.children.get_mut(part)?;
        }
        Some(node)
    }

    fn insert(&mut self, path: &str, new: Node) {
        let parts: Vec<&str> = components(path).collect();
        let Some((name, parents)) = parts.split_last() else {
            return;
        };

        let mut dir = &mut self.root;
        for part in parents {
            let child = dir
                .children
                .entry((*part).to_string())
                .or_insert_with(|| Node::dir(Metadata::implicit_dir()));
            if !child.meta.is_dir() {
                *child = Node::dir(Metadata::implicit_dir());
            }
            dir = child;
        }

        // Re-declaring a directory updates it in place.
        let merge = new.meta.is_dir()
            && matches!(dir.children.get(*name), Some(existing) if existing.meta.is_dir());
        match dir.children.get_mut(*name) {
            Some(existing) if merge => existing.meta = new.meta,
            _ => {
                dir.children.insert((*name).to_string(), new);
            }
        }
    }

    fn remove(&mut self, path: &str) -> bool {
        let parent = parent_of(path);
        let Some(name) = components(path).last() else {
            return false;
        };
        match self.get_mut(parent) {
            Some(dir) => dir.children.remove(name).is_some(),
            None => false,
        }
    }

    /// Point `path` at a copy of `target`. Returns `false` if the target is
    /// absent or is a directory.
    fn link(&mut self, path: &str, target: &str) -> bool {
        let node = match self.get(target) {
            Some(node) if !node.meta.is_dir() => node.clone(),
            _ => return false,
        };
        self.insert(path, node);
        true
    }
}

fn components(path: &str) -> impl DoubleEndedIterator<Item = &str> {
    path.split('/').filter(|p| !p.is_empty() && *p != ".")
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}
