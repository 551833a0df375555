//! Per-path checks that name what differs when a tree digest does not match.
//!
//! A patch records only tree digests, not full manifests, so these checks cover
//! the paths the patch touches. Drift in untouched paths changes the digest
//! without showing up here.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use crate::hash::{self, Digest};
use crate::patch_format::{DiffOperation, EntryKind, ModeBits, PatchDocument, PayloadRef};
use crate::util;

/// Cap on paths listed in precondition and verification errors.
pub const MAX_REPORTED_PATHS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expect {
    Absent,
    Kind(EntryKind),
    File {
        hash: Option<Digest>,
        mode: Option<ModeBits>,
    },
    Symlink(String),
}

/// Paths whose current state contradicts what the patch expects to find.
pub fn precondition_mismatches(root: &Path, patch: &PatchDocument) -> Vec<String> {
    let mut deleted: HashSet<&str> = HashSet::new();
    let mut expectations: Vec<(&str, Expect)> = Vec::new();

    for op in &patch.operations {
        match op {
            DiffOperation::DeletePath { path, kind } => {
                deleted.insert(path);
                expectations.push((path.as_str(), Expect::Kind(*kind)));
            }
            DiffOperation::ModifyFile { path, old_hash, .. } => {
                expectations.push((
                    path.as_str(),
                    Expect::File {
                        hash: Some(*old_hash),
                        mode: None,
                    },
                ));
            }
            DiffOperation::MoveFile {
                from_path, to_path, ..
            } => {
                expectations.push((from_path.as_str(), Expect::File { hash: None, mode: None }));
                if !deleted.contains(to_path.as_str()) {
                    expectations.push((to_path.as_str(), Expect::Absent));
                }
            }
            DiffOperation::ChmodOnly { path, .. } => {
                expectations.push((path.as_str(), Expect::File { hash: None, mode: None }));
            }
            DiffOperation::AddFile { path, .. }
            | DiffOperation::AddDirectory { path, .. }
            | DiffOperation::AddSymlink { path, .. } => {
                if !deleted.contains(path.as_str()) {
                    expectations.push((path.as_str(), Expect::Absent));
                }
            }
        }
    }

    collect_mismatches(root, expectations.into_iter())
}

/// Paths whose state after apply differs from what the patch produces.
pub fn postcondition_mismatches(root: &Path, patch: &PatchDocument) -> Vec<String> {
    let mut expectations: BTreeMap<&str, Expect> = BTreeMap::new();
    let checksum = |r: PayloadRef| patch.payload_checksums.get(r.index()).copied();

    for op in &patch.operations {
        match op {
            DiffOperation::DeletePath { path, .. } => {
                expectations.insert(path, Expect::Absent);
            }
            DiffOperation::MoveFile {
                from_path,
                to_path,
                mode_bits,
            } => {
                expectations.insert(from_path, Expect::Absent);
                expectations.insert(
                    to_path,
                    Expect::File {
                        hash: None,
                        mode: Some(*mode_bits),
                    },
                );
            }
            DiffOperation::AddFile {
                path,
                mode_bits,
                payload_ref,
            } => {
                expectations.insert(
                    path,
                    Expect::File {
                        hash: checksum(*payload_ref),
                        mode: Some(*mode_bits),
                    },
                );
            }
            DiffOperation::ModifyFile {
                path,
                mode_bits,
                new_hash,
                ..
            } => {
                expectations.insert(
                    path,
                    Expect::File {
                        hash: Some(*new_hash),
                        mode: Some(*mode_bits),
                    },
                );
            }
            DiffOperation::AddDirectory { path, .. } => {
                expectations.insert(path, Expect::Kind(EntryKind::Directory));
            }
            DiffOperation::AddSymlink { path, target } => {
                expectations.insert(path, Expect::Symlink(target.clone()));
            }
            DiffOperation::ChmodOnly { path, mode_bits } => {
                let hash = match expectations.get(path.as_str()) {
                    Some(Expect::File { hash, .. }) => *hash,
                    _ => None,
                };
                expectations.insert(
                    path,
                    Expect::File {
                        hash,
                        mode: Some(*mode_bits),
                    },
                );
            }
        }
    }

    collect_mismatches(root, expectations.into_iter())
}

fn collect_mismatches<'a>(
    root: &Path,
    expectations: impl Iterator<Item = (&'a str, Expect)>,
) -> Vec<String> {
    let mut mismatched = Vec::new();
    for (path, expect) in expectations {
        if mismatched.len() >= MAX_REPORTED_PATHS {
            break;
        }
        if !matches_expectation(&util::target_path(root, path), &expect) {
            mismatched.push(path.to_string());
        }
    }
    mismatched
}

fn matches_expectation(full: &Path, expect: &Expect) -> bool {
    let meta = match fs::symlink_metadata(full) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return *expect == Expect::Absent,
        Err(_) => return false,
    };
    match expect {
        Expect::Absent => false,
        Expect::Kind(EntryKind::Directory) => meta.is_dir(),
        Expect::Kind(EntryKind::RegularFile) => meta.is_file(),
        Expect::Kind(EntryKind::Symlink) => meta.file_type().is_symlink(),
        Expect::Symlink(target) => {
            meta.file_type().is_symlink()
                && util::read_link_target(full).is_some_and(|t| t == *target)
        }
        Expect::File { hash, mode } => {
            if !meta.is_file() {
                return false;
            }
            if let Some(mode) = mode {
                if util::mode_bits_of(&meta) != *mode {
                    return false;
                }
            }
            match hash {
                Some(expected) => hash::hash_file(full).is_ok_and(|actual| actual == *expected),
                None => true,
            }
        }
    }
}
