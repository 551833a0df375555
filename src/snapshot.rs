use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::error::{Error, IoResultExt, Result};
use crate::hash::{self, Digest};
use crate::patch_format::{EntryKind, ModeBits};
use crate::util;

/// One item of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub relative_path: String,
    pub kind: EntryKind,
    /// Byte length; zero for directories and symlinks.
    pub size: u64,
    /// File bytes digest, or the link target digest for symlinks. `None` for directories.
    pub content_hash: Option<Digest>,
    pub mode_bits: ModeBits,
    /// Link target. `Some` exactly when `kind` is `Symlink`.
    pub link_target: Option<String>,
}

/// Ordered snapshot of a tree: parents precede children, siblings sorted by name.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Single digest over every entry's path, kind, mode and content hash, in order.
    pub fn tree_digest(&self) -> Digest {
        let mut hasher = blake3::Hasher::new();
        for entry in &self.entries {
            hasher.update(&(entry.relative_path.len() as u32).to_le_bytes());
            hasher.update(entry.relative_path.as_bytes());
            hasher.update(&[entry.kind.to_byte(), entry.mode_bits.to_byte()]);
            hasher.update(entry.content_hash.unwrap_or(Digest::ZERO).as_bytes());
        }
        hasher.finalize().into()
    }

    pub fn get(&self, relative_path: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.relative_path == relative_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    /// Descend through directory symlinks instead of recording the links.
    pub follow_symlinks: bool,
    pub cancel: CancelToken,
}

/// Snapshot `root` without following symlinks.
pub fn snapshot(root: &Path) -> Result<Manifest> {
    snapshot_with(root, &SnapshotOptions::default())
}

enum Pending {
    File { path: PathBuf, size: u64, mode_bits: ModeBits },
    Directory,
    Symlink { target: String },
}

/// Walk a directory tree and produce its manifest.
/// The walk is sequential; file hashing runs on the rayon pool and is collected
/// back in walk order.
pub fn snapshot_with(root: &Path, options: &SnapshotOptions) -> Result<Manifest> {
    let meta = fs::metadata(root).with_path(root)?;
    if !meta.is_dir() {
        return Err(Error::Io {
            path: root.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
        });
    }
    let root = root.canonicalize().with_path(root)?;

    let mut pending: Vec<(String, Pending)> = Vec::new();
    let walker = WalkDir::new(&root)
        .min_depth(1)
        .follow_links(options.follow_symlinks)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(|e| walk_error(&root, e))?;
        let full_path = entry.path();
        let relative = util::relative_key(&root, full_path)?;

        let file_type = entry.file_type();
        let item = if file_type.is_dir() {
            Pending::Directory
        } else if file_type.is_symlink() {
            let target = fs::read_link(full_path).with_path(full_path)?;
            let target = util::link_target_string(full_path, &target)?;
            Pending::Symlink { target }
        } else if file_type.is_file() {
            let meta = entry.metadata().map_err(|e| walk_error(&root, e))?;
            Pending::File {
                path: full_path.to_path_buf(),
                size: meta.len(),
                mode_bits: util::mode_bits_of(&meta),
            }
        } else {
            warn!(path = %full_path.display(), "skipping special file");
            continue;
        };
        pending.push((relative, item));
    }

    options.cancel.check(0)?;

    let entries = pending
        .into_par_iter()
        .map(|(relative_path, item)| -> Result<ManifestEntry> {
            Ok(match item {
                Pending::Directory => ManifestEntry {
                    relative_path,
                    kind: EntryKind::Directory,
                    size: 0,
                    content_hash: None,
                    mode_bits: ModeBits::Plain,
                    link_target: None,
                },
                Pending::Symlink { target } => ManifestEntry {
                    relative_path,
                    kind: EntryKind::Symlink,
                    size: 0,
                    content_hash: Some(hash::hash_bytes(target.as_bytes())),
                    mode_bits: ModeBits::Plain,
                    link_target: Some(target),
                },
                Pending::File { path, size, mode_bits } => {
                    options.cancel.check(0)?;
                    ManifestEntry {
                        relative_path,
                        kind: EntryKind::RegularFile,
                        size,
                        content_hash: Some(hash::hash_file(&path)?),
                        mode_bits,
                        link_target: None,
                    }
                }
            })
        })
        .collect::<Result<Vec<_>>>()?;

    debug!(root = %root.display(), entries = entries.len(), "snapshot complete");
    Ok(Manifest { entries })
}

fn walk_error(root: &Path, err: walkdir::Error) -> Error {
    let path = err.path().unwrap_or(root).to_path_buf();
    if let Some(ancestor) = err.loop_ancestor() {
        return Error::SymlinkLoop {
            path,
            ancestor: ancestor.to_path_buf(),
        };
    }
    Error::Io {
        path,
        source: std::io::Error::from(err),
    }
}
