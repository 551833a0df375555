use rayon::prelude::*;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::hash::{self, Digest};
use crate::patch_format::{
    Compression, CompressionAlgorithm, DiffOperation, EntryKind, ModeBits, PatchDocument,
    PayloadRef, FORMAT_VERSION, MAGIC,
};
use crate::util;

const TAG_ADD_FILE: u8 = 0;
const TAG_ADD_DIRECTORY: u8 = 1;
const TAG_ADD_SYMLINK: u8 = 2;
const TAG_DELETE_PATH: u8 = 3;
const TAG_MODIFY_FILE: u8 = 4;
const TAG_MOVE_FILE: u8 = 5;
const TAG_CHMOD_ONLY: u8 = 6;

/// Compress one payload with the header's algorithm and level.
pub fn compress(data: &[u8], compression: Compression) -> std::io::Result<Vec<u8>> {
    if compression.is_stored() {
        return Ok(data.to_vec());
    }
    zstd::bulk::compress(data, compression.level as i32)
}

fn decompress(blob: &[u8], compression: Compression) -> std::io::Result<Vec<u8>> {
    if compression.is_stored() {
        return Ok(blob.to_vec());
    }
    zstd::stream::decode_all(blob)
}

/// Serialize a patch.
///
/// `payloads` is indexed by the `PayloadRef`s in `operations`. Payloads with
/// identical content are stored once and every reference is redirected to
/// the first copy.
pub fn encode<P>(
    operations: &[DiffOperation],
    payloads: &[P],
    old_tree_digest: Digest,
    new_tree_digest: Digest,
    level: i32,
) -> Result<Vec<u8>>
where
    P: AsRef<[u8]> + Sync,
{
    let compression = Compression::zstd(level)?;

    for op in operations {
        if let Some(r) = op.payload_ref() {
            if r.index() >= payloads.len() {
                return Err(Error::Format(format!(
                    "operation on {} references missing payload {}",
                    op.path(),
                    r.0
                )));
            }
        }
    }

    let digests: Vec<Digest> = payloads
        .par_iter()
        .map(|p| hash::hash_bytes(p.as_ref()))
        .collect();

    let mut first_by_digest: HashMap<Digest, u32> = HashMap::new();
    let mut remap: Vec<u32> = Vec::with_capacity(payloads.len());
    let mut kept: Vec<usize> = Vec::new();
    for (i, digest) in digests.iter().enumerate() {
        let next = kept.len() as u32;
        let index = *first_by_digest.entry(*digest).or_insert_with(|| {
            kept.push(i);
            next
        });
        remap.push(index);
    }

    let blobs: Vec<Vec<u8>> = kept
        .par_iter()
        .enumerate()
        .map(|(payload, &i)| {
            compress(payloads[i].as_ref(), compression)
                .map_err(|source| Error::Compress { payload, source })
        })
        .collect::<Result<_>>()?;

    let mut w = Writer::default();
    w.bytes(MAGIC);
    w.u16(FORMAT_VERSION);
    w.u8(compression.algorithm.to_byte());
    w.u8(compression.level as u8);
    w.bytes(old_tree_digest.as_bytes());
    w.bytes(new_tree_digest.as_bytes());

    w.u32(count(operations.len(), "operations")?);
    for op in operations {
        write_operation(&mut w, op, &remap)?;
    }

    w.u32(count(kept.len(), "payloads")?);
    for &i in &kept {
        w.bytes(digests[i].as_bytes());
    }
    for blob in &blobs {
        w.u64(blob.len() as u64);
        w.bytes(blob);
    }

    debug!(
        operations = operations.len(),
        payloads = kept.len(),
        deduplicated = payloads.len() - kept.len(),
        bytes = w.buf.len(),
        "patch encoded"
    );
    Ok(w.buf)
}

/// Parse a patch and verify every payload against its checksum.
pub fn decode(bytes: &[u8]) -> Result<PatchDocument> {
    let mut r = Reader::new(bytes);

    let magic = r.take(MAGIC.len()).map_err(|_| bad_magic())?;
    if magic != MAGIC {
        return Err(bad_magic());
    }
    let format_version = r.u16()?;
    if format_version != FORMAT_VERSION {
        return Err(Error::Format(format!(
            "unsupported format version {format_version} (expected {FORMAT_VERSION})"
        )));
    }
    let algorithm_tag = r.u8()?;
    let algorithm = CompressionAlgorithm::from_byte(algorithm_tag)
        .ok_or(Error::UnsupportedCompression(algorithm_tag))?;
    let level = r.u8()? as i8;
    let compression = Compression { algorithm, level };

    let old_tree_digest = r.digest()?;
    let new_tree_digest = r.digest()?;

    let op_count = r.u32()? as usize;
    let mut operations = Vec::with_capacity(op_count.min(r.remaining()));
    for _ in 0..op_count {
        operations.push(read_operation(&mut r)?);
    }

    let payload_count = r.u32()? as usize;
    let mut payload_checksums = Vec::with_capacity(payload_count.min(r.remaining() / Digest::LEN));
    for _ in 0..payload_count {
        payload_checksums.push(r.digest()?);
    }
    let mut payload_table = Vec::with_capacity(payload_count.min(r.remaining() / 8));
    for _ in 0..payload_count {
        let len = r.u64()?;
        let len = usize::try_from(len)
            .map_err(|_| Error::Format(format!("payload length {len} too large")))?;
        payload_table.push(r.take(len)?.to_vec());
    }
    if r.remaining() != 0 {
        return Err(Error::Format(format!(
            "{} trailing bytes after payload table",
            r.remaining()
        )));
    }

    for op in &operations {
        if let Some(p) = op.payload_ref() {
            if p.index() >= payload_count {
                return Err(Error::Format(format!(
                    "operation on {} references payload {} of {payload_count}",
                    op.path(),
                    p.0
                )));
            }
        }
    }

    let document = PatchDocument {
        magic: *MAGIC,
        format_version,
        compression,
        old_tree_digest,
        new_tree_digest,
        operations,
        payload_table,
        payload_checksums,
        payloads_verified: false,
    };

    (0..payload_count)
        .into_par_iter()
        .try_for_each(|i| document.verify_payload(i))?;
    let document = PatchDocument {
        payloads_verified: true,
        ..document
    };

    debug!(
        operations = document.operations.len(),
        payloads = payload_count,
        "patch decoded"
    );
    Ok(document)
}

impl PatchDocument {
    /// Decompress a payload. Documents that did not come from [`decode`] also
    /// have the content checked against its recorded digest.
    pub fn payload(&self, payload_ref: PayloadRef) -> Result<Vec<u8>> {
        let index = payload_ref.index();
        let (blob, expected) = self.payload_entry(index)?;
        let data = decompress(blob, self.compression)
            .map_err(|source| Error::Decompress { payload: index, source })?;
        if !self.payloads_verified {
            check_digest(index, *expected, hash::hash_bytes(&data))?;
        }
        Ok(data)
    }

    /// Stream-decompress a payload into the hasher without buffering it.
    fn verify_payload(&self, index: usize) -> Result<()> {
        let (blob, expected) = self.payload_entry(index)?;
        let actual = if self.compression.is_stored() {
            hash::hash_bytes(blob)
        } else {
            zstd::stream::read::Decoder::new(blob.as_slice())
                .and_then(hash::hash_reader)
                .map_err(|source| Error::Decompress { payload: index, source })?
        };
        check_digest(index, *expected, actual)
    }

    fn payload_entry(&self, index: usize) -> Result<(&Vec<u8>, &Digest)> {
        self.payload_table
            .get(index)
            .zip(self.payload_checksums.get(index))
            .ok_or_else(|| Error::Format(format!("payload {index} out of range")))
    }
}

fn check_digest(payload: usize, expected: Digest, actual: Digest) -> Result<()> {
    if actual != expected {
        return Err(Error::CorruptPatch {
            payload,
            expected,
            actual,
        });
    }
    Ok(())
}

fn bad_magic() -> Error {
    Error::Format("bad magic: not a dirpatch file".to_string())
}

fn count(n: usize, what: &str) -> Result<u32> {
    u32::try_from(n).map_err(|_| Error::Format(format!("too many {what}: {n}")))
}

fn write_operation(w: &mut Writer, op: &DiffOperation, remap: &[u32]) -> Result<()> {
    w.u8(op.tag());
    match op {
        DiffOperation::AddFile {
            path,
            mode_bits,
            payload_ref,
        } => {
            w.string(path)?;
            w.u8(mode_bits.to_byte());
            w.u32(remap[payload_ref.index()]);
        }
        DiffOperation::AddDirectory { path, mode_bits } => {
            w.string(path)?;
            w.u8(mode_bits.to_byte());
        }
        DiffOperation::AddSymlink { path, target } => {
            w.string(path)?;
            w.string(target)?;
        }
        DiffOperation::DeletePath { path, kind } => {
            w.string(path)?;
            w.u8(kind.to_byte());
        }
        DiffOperation::ModifyFile {
            path,
            mode_bits,
            payload_ref,
            old_hash,
            new_hash,
        } => {
            w.string(path)?;
            w.u8(mode_bits.to_byte());
            w.u32(remap[payload_ref.index()]);
            w.bytes(old_hash.as_bytes());
            w.bytes(new_hash.as_bytes());
        }
        DiffOperation::MoveFile {
            from_path,
            to_path,
            mode_bits,
        } => {
            w.string(from_path)?;
            w.string(to_path)?;
            w.u8(mode_bits.to_byte());
        }
        DiffOperation::ChmodOnly { path, mode_bits } => {
            w.string(path)?;
            w.u8(mode_bits.to_byte());
        }
    }
    Ok(())
}

fn read_operation(r: &mut Reader<'_>) -> Result<DiffOperation> {
    let tag = r.u8()?;
    let op = match tag {
        TAG_ADD_FILE => DiffOperation::AddFile {
            path: r.path()?,
            mode_bits: r.mode()?,
            payload_ref: PayloadRef(r.u32()?),
        },
        TAG_ADD_DIRECTORY => DiffOperation::AddDirectory {
            path: r.path()?,
            mode_bits: r.mode()?,
        },
        TAG_ADD_SYMLINK => {
            let path = r.path()?;
            let target = r.string()?;
            if target.is_empty() {
                return Err(Error::Format(format!("empty symlink target for {path}")));
            }
            DiffOperation::AddSymlink { path, target }
        }
        TAG_DELETE_PATH => {
            let path = r.path()?;
            let kind_byte = r.u8()?;
            let kind = EntryKind::from_byte(kind_byte)
                .ok_or_else(|| Error::Format(format!("unknown entry kind {kind_byte}")))?;
            DiffOperation::DeletePath { path, kind }
        }
        TAG_MODIFY_FILE => DiffOperation::ModifyFile {
            path: r.path()?,
            mode_bits: r.mode()?,
            payload_ref: PayloadRef(r.u32()?),
            old_hash: r.digest()?,
            new_hash: r.digest()?,
        },
        TAG_MOVE_FILE => DiffOperation::MoveFile {
            from_path: r.path()?,
            to_path: r.path()?,
            mode_bits: r.mode()?,
        },
        TAG_CHMOD_ONLY => DiffOperation::ChmodOnly {
            path: r.path()?,
            mode_bits: r.mode()?,
        },
        other => return Err(Error::Format(format!("unknown operation tag {other}"))),
    };
    Ok(op)
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.bytes(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }

    fn string(&mut self, s: &str) -> Result<()> {
        self.u32(count(s.len(), "bytes in string")?);
        self.bytes(s.as_bytes());
        Ok(())
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(Error::Format(format!(
                "truncated patch: need {n} bytes at offset {}, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn digest(&mut self) -> Result<Digest> {
        Ok(Digest::from_bytes(self.array()?))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::Format(format!("non-UTF-8 string at offset {}", self.pos - len)))
    }

    fn path(&mut self) -> Result<String> {
        let path = self.string()?;
        util::validate_patch_path(&path)?;
        Ok(path)
    }

    fn mode(&mut self) -> Result<ModeBits> {
        let b = self.u8()?;
        ModeBits::from_byte(b).ok_or_else(|| Error::Format(format!("unknown mode byte {b}")))
    }
}
