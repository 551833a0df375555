//! Create and apply verifiable patches between two directory trees.
//!
//! A patch is built from two snapshots: [`snapshot()`] walks each tree into a
//! [`Manifest`], [`diff()`] turns the pair into canonically ordered
//! [`DiffOperation`]s (detecting moves by content hash), and [`codec`] writes
//! them with deduplicated, zstd-compressed payloads. [`apply_patch`] replays
//! the operations with staged writes, optionally checking the target against
//! the recorded old and new tree digests.

pub mod apply;
pub mod cancel;
pub mod codec;
pub mod create;
pub mod diff;
pub mod error;
pub mod hash;
pub mod patch_format;
pub mod snapshot;
pub mod util;
pub mod verify;

pub use apply::{apply, apply_patch, apply_patch_with, ApplyOptions};
pub use cancel::CancelToken;
pub use create::{create_patch, create_patch_with, CreateOptions};
pub use diff::{diff, Diff, PayloadSource};
pub use error::{Error, Result};
pub use hash::Digest;
pub use patch_format::{
    ApplyReport, Compression, CompressionAlgorithm, DiffOperation, EntryKind, ModeBits,
    OperationCounts, PatchDocument, PatchSummary, PayloadRef,
};
pub use snapshot::{snapshot, snapshot_with, Manifest, ManifestEntry, SnapshotOptions};
