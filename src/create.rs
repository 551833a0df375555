use rayon::prelude::*;
use std::path::Path;
use tracing::info;

use crate::cancel::CancelToken;
use crate::codec;
use crate::diff;
use crate::error::{Error, IoResultExt, Result};
use crate::hash;
use crate::patch_format::{Compression, ModeBits, OperationCounts, PatchSummary};
use crate::snapshot::{self, SnapshotOptions};
use crate::util;

#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// `-1` stores payloads uncompressed; `0..=22` is forwarded to zstd.
    pub compression_level: i32,
    /// Descend through directory symlinks instead of recording the links.
    pub follow_symlinks: bool,
    pub cancel: CancelToken,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            compression_level: 3,
            follow_symlinks: false,
            cancel: CancelToken::default(),
        }
    }
}

/// Create a patch file by comparing old_root and new_root.
pub fn create_patch(
    old_root: &Path,
    new_root: &Path,
    output: &Path,
    compression_level: i32,
) -> Result<PatchSummary> {
    let options = CreateOptions {
        compression_level,
        ..Default::default()
    };
    create_patch_with(old_root, new_root, output, &options)
}

pub fn create_patch_with(
    old_root: &Path,
    new_root: &Path,
    output: &Path,
    options: &CreateOptions,
) -> Result<PatchSummary> {
    // reject a bad level before walking anything
    Compression::zstd(options.compression_level)?;

    // Stage 1: snapshot both trees concurrently
    let snapshot_options = SnapshotOptions {
        follow_symlinks: options.follow_symlinks,
        cancel: options.cancel.clone(),
    };
    let (old_manifest, new_manifest) = rayon::join(
        || snapshot::snapshot_with(old_root, &snapshot_options),
        || snapshot::snapshot_with(new_root, &snapshot_options),
    );
    let old_manifest = old_manifest?;
    let new_manifest = new_manifest?;
    options.cancel.check(0)?;

    // Stage 2: diff
    let diff = diff::diff(&old_manifest, &new_manifest);

    // Stage 3: read payload bytes, confirming nothing changed since the snapshot
    let new_root = new_root.canonicalize().with_path(new_root)?;
    let payloads: Vec<Vec<u8>> = diff
        .payloads
        .par_iter()
        .map(|source| -> Result<Vec<u8>> {
            options.cancel.check(0)?;
            let full = util::target_path(&new_root, &source.relative_path);
            let data = util::read_file(&full)?;
            if hash::hash_bytes(&data) != source.digest {
                return Err(Error::SourceChanged { path: full });
            }
            Ok(data)
        })
        .collect::<Result<_>>()?;
    options.cancel.check(0)?;

    // Stage 4: encode and write
    let bytes = codec::encode(
        &diff.operations,
        &payloads,
        old_manifest.tree_digest(),
        new_manifest.tree_digest(),
        options.compression_level,
    )?;
    util::write_atomic(output, &bytes, ModeBits::Plain)?;

    let summary = PatchSummary {
        operations: OperationCounts::from_operations(&diff.operations),
        payload_count: diff.payloads.len(),
        patch_size: bytes.len() as u64,
    };
    info!(
        output = %output.display(),
        operations = summary.operations.total(),
        payloads = summary.payload_count,
        bytes = summary.patch_size,
        "patch created"
    );
    Ok(summary)
}
