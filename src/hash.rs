use std::fmt;
use std::io::Read;
use std::path::Path;

use crate::error::{IoResultExt, Result};

/// BLAKE3 digest used for change detection, move detection and verification.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    pub const LEN: usize = 32;

    /// zero digest, stands in for "no content" (directories)
    pub const ZERO: Digest = Digest([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

impl From<blake3::Hash> for Digest {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..12])
    }
}

/// Compute the BLAKE3 digest of a byte slice.
pub fn hash_bytes(data: &[u8]) -> Digest {
    blake3::hash(data).into()
}

/// Stream-hash a file.
/// Uses a 256 KB BufReader to reduce syscall overhead vs the default 8 KB.
pub fn hash_file(path: &Path) -> Result<Digest> {
    let file = std::fs::File::open(path).with_path(path)?;
    let reader = std::io::BufReader::with_capacity(256 * 1024, file);
    hash_reader(reader).with_path(path)
}

/// Stream-hash anything readable.
pub fn hash_reader<R: Read>(mut reader: R) -> std::io::Result<Digest> {
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut reader, &mut hasher)?;
    Ok(hasher.finalize().into())
}
