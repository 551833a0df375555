use serde::Serialize;

use crate::hash::Digest;

pub const MAGIC: &[u8; 4] = b"DPCH";
pub const FORMAT_VERSION: u16 = 1;

/// Highest level accepted by the zstd backend.
pub const MAX_COMPRESSION_LEVEL: i32 = 22;
/// Level that stores payloads without compression.
pub const STORE_LEVEL: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    RegularFile,
    Directory,
    Symlink,
}

impl EntryKind {
    pub fn to_byte(self) -> u8 {
        match self {
            EntryKind::RegularFile => 0,
            EntryKind::Directory => 1,
            EntryKind::Symlink => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(EntryKind::RegularFile),
            1 => Some(EntryKind::Directory),
            2 => Some(EntryKind::Symlink),
            _ => None,
        }
    }
}

/// Minimal permission signal carried through a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ModeBits {
    #[default]
    Plain,
    Executable,
}

impl ModeBits {
    pub fn to_byte(self) -> u8 {
        match self {
            ModeBits::Plain => 0,
            ModeBits::Executable => 1,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ModeBits::Plain),
            1 => Some(ModeBits::Executable),
            _ => None,
        }
    }

    pub fn is_executable(self) -> bool {
        self == ModeBits::Executable
    }
}

/// Index into a patch's payload table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PayloadRef(pub u32);

impl PayloadRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOperation {
    AddFile {
        path: String,
        mode_bits: ModeBits,
        payload_ref: PayloadRef,
    },
    AddDirectory {
        path: String,
        mode_bits: ModeBits,
    },
    AddSymlink {
        path: String,
        target: String,
    },
    DeletePath {
        path: String,
        kind: EntryKind,
    },
    ModifyFile {
        path: String,
        mode_bits: ModeBits,
        payload_ref: PayloadRef,
        old_hash: Digest,
        new_hash: Digest,
    },
    MoveFile {
        from_path: String,
        to_path: String,
        mode_bits: ModeBits,
    },
    ChmodOnly {
        path: String,
        mode_bits: ModeBits,
    },
}

impl DiffOperation {
    /// Wire tag; also the variant discriminant.
    pub fn tag(&self) -> u8 {
        match self {
            DiffOperation::AddFile { .. } => 0,
            DiffOperation::AddDirectory { .. } => 1,
            DiffOperation::AddSymlink { .. } => 2,
            DiffOperation::DeletePath { .. } => 3,
            DiffOperation::ModifyFile { .. } => 4,
            DiffOperation::MoveFile { .. } => 5,
            DiffOperation::ChmodOnly { .. } => 6,
        }
    }

    /// The path this operation leaves behind (the destination for moves).
    pub fn path(&self) -> &str {
        match self {
            DiffOperation::AddFile { path, .. }
            | DiffOperation::AddDirectory { path, .. }
            | DiffOperation::AddSymlink { path, .. }
            | DiffOperation::DeletePath { path, .. }
            | DiffOperation::ModifyFile { path, .. }
            | DiffOperation::ChmodOnly { path, .. } => path,
            DiffOperation::MoveFile { to_path, .. } => to_path,
        }
    }

    pub fn payload_ref(&self) -> Option<PayloadRef> {
        match self {
            DiffOperation::AddFile { payload_ref, .. }
            | DiffOperation::ModifyFile { payload_ref, .. } => Some(*payload_ref),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    None,
    Zstd,
}

impl CompressionAlgorithm {
    pub fn to_byte(self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Zstd => 1,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(CompressionAlgorithm::None),
            1 => Some(CompressionAlgorithm::Zstd),
            _ => None,
        }
    }
}

/// Algorithm plus level, as recorded in the patch header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compression {
    pub algorithm: CompressionAlgorithm,
    pub level: i8,
}

impl Compression {
    /// zstd at `level`; `-1` stores payloads as-is.
    pub fn zstd(level: i32) -> crate::Result<Self> {
        if !(STORE_LEVEL..=MAX_COMPRESSION_LEVEL).contains(&level) {
            return Err(crate::Error::InvalidCompressionLevel(level));
        }
        Ok(Self {
            algorithm: CompressionAlgorithm::Zstd,
            level: level as i8,
        })
    }

    pub fn is_stored(&self) -> bool {
        self.algorithm == CompressionAlgorithm::None || self.level < 0
    }
}

/// A fully decoded patch file.
#[derive(Debug, Clone)]
pub struct PatchDocument {
    pub magic: [u8; 4],
    pub format_version: u16,
    pub compression: Compression,
    pub old_tree_digest: Digest,
    pub new_tree_digest: Digest,
    pub operations: Vec<DiffOperation>,
    /// Compressed blobs, indexed by `PayloadRef`.
    pub payload_table: Vec<Vec<u8>>,
    /// Digest of each payload's uncompressed content.
    pub payload_checksums: Vec<Digest>,
    /// Set by `codec::decode` once every payload matched its checksum.
    pub(crate) payloads_verified: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OperationCounts {
    pub files_added: usize,
    pub directories_added: usize,
    pub symlinks_added: usize,
    pub paths_deleted: usize,
    pub files_modified: usize,
    pub files_moved: usize,
    pub chmod_only: usize,
}

impl OperationCounts {
    pub fn record(&mut self, op: &DiffOperation) {
        match op {
            DiffOperation::AddFile { .. } => self.files_added += 1,
            DiffOperation::AddDirectory { .. } => self.directories_added += 1,
            DiffOperation::AddSymlink { .. } => self.symlinks_added += 1,
            DiffOperation::DeletePath { .. } => self.paths_deleted += 1,
            DiffOperation::ModifyFile { .. } => self.files_modified += 1,
            DiffOperation::MoveFile { .. } => self.files_moved += 1,
            DiffOperation::ChmodOnly { .. } => self.chmod_only += 1,
        }
    }

    pub fn from_operations(ops: &[DiffOperation]) -> Self {
        let mut counts = Self::default();
        for op in ops {
            counts.record(op);
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.files_added
            + self.directories_added
            + self.symlinks_added
            + self.paths_deleted
            + self.files_modified
            + self.files_moved
            + self.chmod_only
    }
}

/// Result of `create_patch`.
#[derive(Debug, Clone, Serialize)]
pub struct PatchSummary {
    pub operations: OperationCounts,
    pub payload_count: usize,
    pub patch_size: u64,
}

/// Result of `apply_patch`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    /// Counts of operations that changed the tree.
    pub applied: OperationCounts,
    /// Operations that found their result already in place.
    pub skipped: usize,
    /// Target already matched the new tree; nothing was replayed.
    pub already_applied: bool,
    /// Paths that failed post-apply verification.
    pub mismatched_paths: Vec<String>,
}

impl ApplyReport {
    pub fn total_applied(&self) -> usize {
        self.applied.total()
    }
}
