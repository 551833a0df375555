use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::codec;
use crate::error::{Error, IoResultExt, Result};
use crate::hash::{self, Digest};
use crate::patch_format::{ApplyReport, DiffOperation, EntryKind, PatchDocument};
use crate::snapshot::{self, SnapshotOptions};
use crate::util;
use crate::verify;

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Check the target against the old tree digest before touching it, and
    /// against the new tree digest afterwards.
    pub verify: bool,
    pub cancel: CancelToken,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            verify: true,
            cancel: CancelToken::default(),
        }
    }
}

enum Outcome {
    Applied,
    /// The result of the operation was already in place.
    Skipped,
}

/// Apply the patch file at `patch_path` to `target_root`.
pub fn apply_patch(target_root: &Path, patch_path: &Path, verify: bool) -> Result<ApplyReport> {
    let options = ApplyOptions {
        verify,
        ..Default::default()
    };
    apply_patch_with(target_root, patch_path, &options)
}

pub fn apply_patch_with(
    target_root: &Path,
    patch_path: &Path,
    options: &ApplyOptions,
) -> Result<ApplyReport> {
    let len = fs::metadata(patch_path).with_path(patch_path)?.len();
    if len == 0 {
        return Err(Error::Format(format!("empty patch file: {}", patch_path.display())));
    }
    // mmap the patch; payloads are copied out during decode
    let raw = util::mmap_file(patch_path)?;
    let patch = codec::decode(&raw)?;
    drop(raw);
    info!(
        target = %target_root.display(),
        patch = %patch_path.display(),
        operations = patch.operations.len(),
        verify = options.verify,
        "applying patch"
    );
    apply(target_root, &patch, options)
}

/// Replay a decoded patch onto `target_root`, in stored order.
pub fn apply(target_root: &Path, patch: &PatchDocument, options: &ApplyOptions) -> Result<ApplyReport> {
    let mut walk = SnapshotOptions::default();
    if options.verify {
        let target = target_root.canonicalize().with_path(target_root)?;
        let (actual, matched_walk) = target_digest(&target, patch)?;
        walk = matched_walk;
        if actual != patch.old_tree_digest {
            if actual == patch.new_tree_digest {
                info!(target = %target.display(), "target already matches the patched tree");
                return Ok(ApplyReport {
                    already_applied: true,
                    ..Default::default()
                });
            }
            return Err(Error::Precondition {
                expected: patch.old_tree_digest,
                actual,
                differing: verify::precondition_mismatches(&target, patch),
            });
        }
    } else {
        fs::create_dir_all(target_root).with_path(target_root)?;
    }
    let target = target_root.canonicalize().with_path(target_root)?;
    let relinked = relinked_paths(patch);

    let mut report = ApplyReport::default();
    for (index, op) in patch.operations.iter().enumerate() {
        options.cancel.check(index)?;
        match apply_operation(&target, patch, op, &relinked) {
            Ok(Outcome::Applied) => {
                debug!(index, path = op.path(), tag = op.tag(), "applied");
                report.applied.record(op);
            }
            Ok(Outcome::Skipped) => {
                debug!(index, path = op.path(), "already in place");
                report.skipped += 1;
            }
            Err(Error::Io { path, source }) => {
                return Err(Error::Apply {
                    path,
                    failed: index,
                    applied: index,
                    source,
                })
            }
            Err(other) => return Err(other),
        }
    }

    if options.verify {
        let actual = snapshot::snapshot_with(&target, &walk)?.tree_digest();
        if actual != patch.new_tree_digest {
            report.mismatched_paths = verify::postcondition_mismatches(&target, patch);
            warn!(
                mismatched = report.mismatched_paths.len(),
                "patched tree failed verification"
            );
            return Err(Error::Verification {
                expected: patch.new_tree_digest,
                actual,
                report: Box::new(report),
            });
        }
    }

    info!(
        applied = report.total_applied(),
        skipped = report.skipped,
        "patch applied"
    );
    Ok(report)
}

/// Digest of the target and the walk that produced it.
///
/// Patches created with `follow_symlinks` carry digests of a link-following
/// walk. When the plain walk matches neither side of the patch and the tree
/// has symlinks, a following walk is tried as well.
fn target_digest(target: &Path, patch: &PatchDocument) -> Result<(Digest, SnapshotOptions)> {
    let known = |d: Digest| d == patch.old_tree_digest || d == patch.new_tree_digest;

    let plain = SnapshotOptions::default();
    let manifest = snapshot::snapshot_with(target, &plain)?;
    let digest = manifest.tree_digest();
    if known(digest) || !manifest.entries.iter().any(|e| e.kind == EntryKind::Symlink) {
        return Ok((digest, plain));
    }

    let following = SnapshotOptions {
        follow_symlinks: true,
        ..Default::default()
    };
    match snapshot::snapshot_with(target, &following) {
        Ok(m) if known(m.tree_digest()) => {
            debug!("target matches with symlinks followed");
            Ok((m.tree_digest(), following))
        }
        _ => Ok((digest, plain)),
    }
}

/// Paths whose symlink is replaced later in the patch, mapped to the new target.
fn relinked_paths(patch: &PatchDocument) -> HashMap<&str, &str> {
    patch
        .operations
        .iter()
        .filter_map(|op| match op {
            DiffOperation::AddSymlink { path, target } => Some((path.as_str(), target.as_str())),
            _ => None,
        })
        .collect()
}

fn apply_operation(
    root: &Path,
    patch: &PatchDocument,
    op: &DiffOperation,
    relinked: &HashMap<&str, &str>,
) -> Result<Outcome> {
    if let DiffOperation::MoveFile { from_path, .. } = op {
        util::ensure_within(root, &util::target_path(root, from_path))?;
    }
    util::ensure_within(root, &util::target_path(root, op.path()))?;

    match op {
        DiffOperation::AddDirectory { path, .. } => {
            let full = util::target_path(root, path);
            match fs::symlink_metadata(&full) {
                Ok(meta) if meta.is_dir() => Ok(Outcome::Skipped),
                Ok(_) => Err(Error::Io {
                    path: full,
                    source: std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "a non-directory is in the way",
                    ),
                }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    fs::create_dir_all(&full).with_path(&full)?;
                    Ok(Outcome::Applied)
                }
                Err(e) => Err(e).with_path(&full),
            }
        }

        DiffOperation::AddFile {
            path,
            mode_bits,
            payload_ref,
        } => {
            let full = util::target_path(root, path);
            let expected = patch
                .payload_checksums
                .get(payload_ref.index())
                .copied()
                .ok_or_else(|| Error::Format(format!("payload {} out of range", payload_ref.0)))?;
            if file_hash(&full)? == Some(expected) {
                util::set_mode_bits(&full, *mode_bits)?;
                return Ok(Outcome::Skipped);
            }
            let data = patch.payload(*payload_ref)?;
            ensure_parent(&full)?;
            util::write_atomic(&full, &data, *mode_bits)?;
            Ok(Outcome::Applied)
        }

        DiffOperation::ModifyFile {
            path,
            mode_bits,
            payload_ref,
            old_hash,
            new_hash,
        } => {
            let full = util::target_path(root, path);
            let current = file_hash(&full)?;
            if current == Some(*new_hash) {
                util::set_mode_bits(&full, *mode_bits)?;
                return Ok(Outcome::Skipped);
            }
            if current != Some(*old_hash) {
                warn!(path = %path, "file differs from the patch's old version; overwriting");
            }
            let data = patch.payload(*payload_ref)?;
            ensure_parent(&full)?;
            util::write_atomic(&full, &data, *mode_bits)?;
            Ok(Outcome::Applied)
        }

        DiffOperation::MoveFile {
            from_path,
            to_path,
            mode_bits,
        } => {
            let from = util::target_path(root, from_path);
            let to = util::target_path(root, to_path);
            match fs::symlink_metadata(&from) {
                Ok(_) => {
                    ensure_parent(&to)?;
                    fs::rename(&from, &to).with_path(&from)?;
                    util::set_mode_bits(&to, *mode_bits)?;
                    Ok(Outcome::Applied)
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // a previous run already moved it
                    if fs::symlink_metadata(&to).is_ok_and(|m| m.is_file()) {
                        util::set_mode_bits(&to, *mode_bits)?;
                        Ok(Outcome::Skipped)
                    } else {
                        Err(e).with_path(&from)
                    }
                }
                Err(e) => Err(e).with_path(&from),
            }
        }

        DiffOperation::AddSymlink { path, target } => {
            let full = util::target_path(root, path);
            if util::read_link_target(&full).as_deref() == Some(target.as_str()) {
                return Ok(Outcome::Skipped);
            }
            ensure_parent(&full)?;
            util::symlink_atomic(&full, target)?;
            Ok(Outcome::Applied)
        }

        DiffOperation::DeletePath { path, kind } => {
            let full = util::target_path(root, path);
            let meta = match fs::symlink_metadata(&full) {
                Ok(meta) => meta,
                Err(e) if is_missing(&e) => return Ok(Outcome::Skipped),
                Err(e) => return Err(e).with_path(&full),
            };
            if kind_of(&meta) != *kind {
                // the old entry is gone and its replacement is in place
                return Ok(Outcome::Skipped);
            }
            if let Some(new_target) = relinked.get(path.as_str()) {
                if util::read_link_target(&full).as_deref() == Some(*new_target) {
                    return Ok(Outcome::Skipped);
                }
            }
            if meta.is_dir() {
                // children were deleted by earlier operations
                fs::remove_dir(&full).with_path(&full)?;
            } else {
                fs::remove_file(&full).with_path(&full)?;
            }
            Ok(Outcome::Applied)
        }

        DiffOperation::ChmodOnly { path, mode_bits } => {
            let full = util::target_path(root, path);
            if util::set_mode_bits(&full, *mode_bits)? {
                Ok(Outcome::Applied)
            } else {
                Ok(Outcome::Skipped)
            }
        }
    }
}

/// Digest of the regular file at `path`, `None` if absent or not a file.
fn file_hash(path: &Path) -> Result<Option<Digest>> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_file() => hash::hash_file(path).map(Some),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_path(path),
    }
}

fn kind_of(meta: &fs::Metadata) -> EntryKind {
    if meta.file_type().is_symlink() {
        EntryKind::Symlink
    } else if meta.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::RegularFile
    }
}

/// Absent, or shadowed by a file where a parent directory used to be.
fn is_missing(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
    )
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_path(parent)?;
    }
    Ok(())
}
