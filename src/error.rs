use std::path::PathBuf;

use crate::hash::Digest;
use crate::patch_format::ApplyReport;

/// Errors produced by the patch engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An operation failed mid-apply. `applied` operations completed before it,
    /// so re-running the same patch resumes from operation `failed`.
    #[error("operation {failed} failed at {path} ({applied} operations applied): {source}")]
    Apply {
        path: PathBuf,
        failed: usize,
        applied: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("symlink loop at {path} (points back to {ancestor})")]
    SymlinkLoop { path: PathBuf, ancestor: PathBuf },

    #[error("malformed patch: {0}")]
    Format(String),

    #[error("corrupt patch: payload {payload} digest is {actual}, expected {expected}")]
    CorruptPatch {
        payload: usize,
        expected: Digest,
        actual: Digest,
    },

    #[error("corrupt patch: payload {payload} failed to decompress: {source}")]
    Decompress {
        payload: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("target does not match the patch's old tree (digest {actual}, expected {expected}); differing paths: {differing:?}")]
    Precondition {
        expected: Digest,
        actual: Digest,
        differing: Vec<String>,
    },

    #[error("patched tree does not match the patch's new tree (digest {actual}, expected {expected}); mismatched paths: {:?}", .report.mismatched_paths)]
    Verification {
        expected: Digest,
        actual: Digest,
        report: Box<ApplyReport>,
    },

    #[error("payload {payload} failed to compress: {source}")]
    Compress {
        payload: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("refusing to touch {path}: it resolves outside the target through a symlink")]
    OutsideTarget { path: PathBuf },

    #[error("cannot record {path} in a patch: {reason}")]
    UnsupportedPath { path: PathBuf, reason: &'static str },

    #[error("unsupported compression algorithm tag: {0}")]
    UnsupportedCompression(u8),

    #[error("invalid compression level {0} (expected -1..=22)")]
    InvalidCompressionLevel(i32),

    #[error("source file changed while creating the patch: {path}")]
    SourceChanged { path: PathBuf },

    #[error("cancelled after {completed} operations")]
    Cancelled { completed: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Index of the last operation that completed before an apply aborted.
    pub fn last_applied_index(&self) -> Option<usize> {
        match self {
            Error::Apply { applied, .. } | Error::Cancelled { completed: applied } => {
                applied.checked_sub(1)
            }
            _ => None,
        }
    }
}

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
