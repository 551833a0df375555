use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::hash::Digest;
use crate::patch_format::{DiffOperation, EntryKind, PayloadRef};
use crate::snapshot::{Manifest, ManifestEntry};
use crate::util;

/// Content that must be shipped in the patch, one per unique digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSource {
    pub digest: Digest,
    /// Path in the new tree to read the bytes from.
    pub relative_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct Diff {
    /// Operations in canonical replay order.
    pub operations: Vec<DiffOperation>,
    /// Indexed by the `PayloadRef`s used in `operations`.
    pub payloads: Vec<PayloadSource>,
}

#[derive(Default)]
struct PayloadPlan {
    by_digest: HashMap<Digest, PayloadRef>,
    sources: Vec<PayloadSource>,
}

impl PayloadPlan {
    fn reference(&mut self, entry: &ManifestEntry) -> PayloadRef {
        let digest = entry.content_hash.unwrap_or(Digest::ZERO);
        if let Some(existing) = self.by_digest.get(&digest) {
            return *existing;
        }
        let payload_ref = PayloadRef(self.sources.len() as u32);
        self.sources.push(PayloadSource {
            digest,
            relative_path: entry.relative_path.clone(),
        });
        self.by_digest.insert(digest, payload_ref);
        payload_ref
    }
}

/// Compare two manifests and produce the operations turning `old` into `new`.
///
/// Emit order: deletions (deepest first), moves, directory additions
/// (shallowest first), file and symlink additions, modifications, chmod-only.
pub fn diff(old: &Manifest, new: &Manifest) -> Diff {
    let old_map: HashMap<&str, &ManifestEntry> = old
        .entries
        .iter()
        .map(|e| (e.relative_path.as_str(), e))
        .collect();
    let new_map: HashMap<&str, &ManifestEntry> = new
        .entries
        .iter()
        .map(|e| (e.relative_path.as_str(), e))
        .collect();

    let mut deletions: Vec<&ManifestEntry> = Vec::new();
    let mut additions: Vec<&ManifestEntry> = Vec::new();
    let mut modifications: Vec<(&ManifestEntry, &ManifestEntry)> = Vec::new();
    let mut chmods: Vec<&ManifestEntry> = Vec::new();
    // paths present on both sides never take part in move detection
    let mut in_both: HashSet<&str> = HashSet::new();

    for old_entry in &old.entries {
        let path = old_entry.relative_path.as_str();
        let Some(new_entry) = new_map.get(path).copied() else {
            deletions.push(old_entry);
            continue;
        };
        in_both.insert(path);

        if old_entry.kind != new_entry.kind {
            deletions.push(old_entry);
            additions.push(new_entry);
            continue;
        }

        match old_entry.kind {
            EntryKind::RegularFile => {
                if old_entry.content_hash != new_entry.content_hash {
                    modifications.push((old_entry, new_entry));
                } else if old_entry.mode_bits != new_entry.mode_bits {
                    chmods.push(new_entry);
                }
            }
            EntryKind::Symlink => {
                if old_entry.content_hash != new_entry.content_hash {
                    deletions.push(old_entry);
                    additions.push(new_entry);
                }
            }
            EntryKind::Directory => {}
        }
    }

    for new_entry in &new.entries {
        if !old_map.contains_key(new_entry.relative_path.as_str()) {
            additions.push(new_entry);
        }
    }

    let (moves, moved_from, moved_to) = detect_moves(&deletions, &additions, &in_both);
    deletions.retain(|e| !moved_from.contains(e.relative_path.as_str()));
    additions.retain(|e| !moved_to.contains(e.relative_path.as_str()));

    let mut operations = Vec::new();
    let mut plan = PayloadPlan::default();

    deletions.sort_by(|a, b| {
        util::depth(&b.relative_path)
            .cmp(&util::depth(&a.relative_path))
            .then_with(|| a.relative_path.cmp(&b.relative_path))
    });
    for entry in &deletions {
        operations.push(DiffOperation::DeletePath {
            path: entry.relative_path.clone(),
            kind: entry.kind,
        });
    }

    for (from, to) in &moves {
        operations.push(DiffOperation::MoveFile {
            from_path: from.relative_path.clone(),
            to_path: to.relative_path.clone(),
            mode_bits: to.mode_bits,
        });
    }

    let (mut dir_adds, mut other_adds): (Vec<&ManifestEntry>, Vec<&ManifestEntry>) = additions
        .into_iter()
        .partition(|e| e.kind == EntryKind::Directory);

    dir_adds.sort_by(|a, b| {
        util::depth(&a.relative_path)
            .cmp(&util::depth(&b.relative_path))
            .then_with(|| a.relative_path.cmp(&b.relative_path))
    });
    for entry in &dir_adds {
        operations.push(DiffOperation::AddDirectory {
            path: entry.relative_path.clone(),
            mode_bits: entry.mode_bits,
        });
    }

    other_adds.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    for entry in &other_adds {
        match &entry.link_target {
            Some(target) => {
                operations.push(DiffOperation::AddSymlink {
                    path: entry.relative_path.clone(),
                    target: target.clone(),
                });
            }
            None => operations.push(DiffOperation::AddFile {
                path: entry.relative_path.clone(),
                mode_bits: entry.mode_bits,
                payload_ref: plan.reference(entry),
            }),
        }
    }

    modifications.sort_by(|a, b| a.1.relative_path.cmp(&b.1.relative_path));
    for (old_entry, new_entry) in &modifications {
        operations.push(DiffOperation::ModifyFile {
            path: new_entry.relative_path.clone(),
            mode_bits: new_entry.mode_bits,
            payload_ref: plan.reference(new_entry),
            old_hash: old_entry.content_hash.unwrap_or(Digest::ZERO),
            new_hash: new_entry.content_hash.unwrap_or(Digest::ZERO),
        });
    }

    chmods.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    for entry in &chmods {
        operations.push(DiffOperation::ChmodOnly {
            path: entry.relative_path.clone(),
            mode_bits: entry.mode_bits,
        });
    }

    debug!(
        operations = operations.len(),
        payloads = plan.sources.len(),
        moves = moves.len(),
        "diff complete"
    );

    Diff {
        operations,
        payloads: plan.sources,
    }
}

type Moves<'a> = (
    Vec<(&'a ManifestEntry, &'a ManifestEntry)>,
    HashSet<&'a str>,
    HashSet<&'a str>,
);

/// Pair deleted and added regular files sharing a content hash.
/// Candidates on each side are taken in ascending path order, so the k-th old
/// path with a given hash pairs with the k-th new path with that hash.
fn detect_moves<'a>(
    deletions: &[&'a ManifestEntry],
    additions: &[&'a ManifestEntry],
    in_both: &HashSet<&str>,
) -> Moves<'a> {
    let deleted_dirs: HashSet<&str> = deletions
        .iter()
        .filter(|e| e.kind == EntryKind::Directory)
        .map(|e| e.relative_path.as_str())
        .collect();

    // A source inside a directory that is deleted would be gone before moves run.
    let mut sources: Vec<&ManifestEntry> = deletions
        .iter()
        .copied()
        .filter(|e| e.kind == EntryKind::RegularFile)
        .filter(|e| !in_both.contains(e.relative_path.as_str()))
        .filter(|e| !util::ancestors(&e.relative_path).any(|a| deleted_dirs.contains(a)))
        .collect();
    sources.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    let mut by_hash: HashMap<Digest, VecDeque<&ManifestEntry>> = HashMap::new();
    for source in sources {
        if let Some(hash) = source.content_hash {
            by_hash.entry(hash).or_default().push_back(source);
        }
    }

    let mut targets: Vec<&ManifestEntry> = additions
        .iter()
        .copied()
        .filter(|e| e.kind == EntryKind::RegularFile)
        .filter(|e| !in_both.contains(e.relative_path.as_str()))
        .collect();
    targets.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    let mut moves = Vec::new();
    let mut moved_from = HashSet::new();
    let mut moved_to = HashSet::new();
    for target in targets {
        let Some(hash) = target.content_hash else {
            continue;
        };
        if let Some(source) = by_hash.get_mut(&hash).and_then(|q| q.pop_front()) {
            moved_from.insert(source.relative_path.as_str());
            moved_to.insert(target.relative_path.as_str());
            moves.push((source, target));
        }
    }

    (moves, moved_from, moved_to)
}
