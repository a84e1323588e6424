#![forbid(unsafe_code)]
//! Block patches: compact replayable diffs and their wire codec.
//!
//! Every patch is encoded as a fixed big-endian header followed by an
//! operation-specific payload:
//!
//! ```text
//! u16 total_length
//! u64 block_id
//! u64 block_seq
//! u32 patch_counter
//! u8  operation_code   0=copy, 1=move, 2=leaf-remove, 3=leaf-erase-presence
//! ```

use smallvec::SmallVec;

use crate::primitives::bytes::{be, buf::Cursor};
use crate::types::{BlockId, BlockSeq, PatchCounter, PatchworkError, Result, Timestamp};

/// Per-block patch catalog.
pub mod catalog;
/// Leaf layout used by the leaf-removal patch kinds.
pub mod leaf;
/// On-disk patch log region.
pub mod log;

pub use catalog::PatchCatalog;
pub use log::{PatchLog, PatchLogStats, ReclaimHost, ReclaimOutcome};

/// Length of the fixed patch header.
pub const PATCH_HEADER_LEN: usize = 23;
/// Largest encoded patch.
pub const MAX_PATCH_LEN: usize = u16::MAX as usize;

const OP_COPY: u8 = 0;
const OP_MOVE: u8 = 1;
const OP_LEAF_REMOVE: u8 = 2;
const OP_LEAF_ERASE: u8 = 3;

/// Leaf keys are at most 255 bytes; most fit inline.
pub type LeafKey = SmallVec<[u8; 32]>;

/// Operation carried by a [`Patch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PatchOp {
    /// Copies `data` into the block at `dest_offset`.
    Copy {
        /// First byte written.
        dest_offset: u16,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// Moves `len` bytes within the block; ranges may overlap.
    Move {
        /// First byte of the destination range.
        dest_offset: u16,
        /// First byte of the source range.
        src_offset: u16,
        /// Number of bytes moved.
        len: u16,
    },
    /// Removes a leaf entry and records its deletion timestamp.
    LeafRemove {
        /// Deletion time recorded for the key.
        timestamp: Timestamp,
        /// Key to remove, at most 255 bytes.
        key: LeafKey,
    },
    /// Removes a leaf entry without recording history.
    LeafErasePresence {
        /// Key to remove, at most 255 bytes.
        key: LeafKey,
    },
}

impl PatchOp {
    /// Builds a copy of `data` to `dest_offset`, rejecting payloads that do
    /// not fit one encoded patch.
    pub fn copy(dest_offset: u16, data: &[u8]) -> Result<Self> {
        if PATCH_HEADER_LEN + 4 + data.len() > MAX_PATCH_LEN {
            return Err(PatchworkError::Invalid("copy patch payload too large"));
        }
        Ok(PatchOp::Copy {
            dest_offset,
            data: data.to_vec(),
        })
    }

    /// Builds a move of `len` bytes from `src_offset` to `dest_offset`.
    pub fn move_bytes(dest_offset: u16, src_offset: u16, len: u16) -> Self {
        PatchOp::Move {
            dest_offset,
            src_offset,
            len,
        }
    }

    /// Builds a history-free leaf removal of `key`.
    pub fn leaf_erase_presence(key: &[u8]) -> Result<Self> {
        check_key(key)?;
        Ok(PatchOp::LeafErasePresence {
            key: LeafKey::from_slice(key),
        })
    }

    fn code(&self) -> u8 {
        match self {
            PatchOp::Copy { .. } => OP_COPY,
            PatchOp::Move { .. } => OP_MOVE,
            PatchOp::LeafRemove { .. } => OP_LEAF_REMOVE,
            PatchOp::LeafErasePresence { .. } => OP_LEAF_ERASE,
        }
    }
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.len() > u8::MAX as usize {
        return Err(PatchworkError::Invalid("leaf key longer than 255 bytes"));
    }
    Ok(())
}

/// One replayable mutation of one block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Patch {
    /// Block the patch mutates.
    pub block_id: BlockId,
    /// Base version of the block this patch applies on top of.
    pub block_seq: BlockSeq,
    /// Position within the run of patches on `block_seq`, starting at 1.
    pub counter: PatchCounter,
    /// The diff itself.
    pub op: PatchOp,
}

impl Patch {
    /// Wraps `op` for `block_id`. The operation is checked by
    /// [`Patch::validate`] before it is applied or encoded.
    pub fn new(block_id: BlockId, block_seq: BlockSeq, counter: PatchCounter, op: PatchOp) -> Self {
        Self {
            block_id,
            block_seq,
            counter,
            op,
        }
    }

    /// Builds a leaf-removal patch whose timestamp is `max(block_timestamp, timestamp)`.
    pub fn leaf_remove(
        block_id: BlockId,
        block_seq: BlockSeq,
        counter: PatchCounter,
        block_timestamp: Timestamp,
        timestamp: Timestamp,
        key: &[u8],
    ) -> Result<Self> {
        check_key(key)?;
        Ok(Self::new(
            block_id,
            block_seq,
            counter,
            PatchOp::LeafRemove {
                timestamp: block_timestamp.max(timestamp),
                key: LeafKey::from_slice(key),
            },
        ))
    }

    /// Size of the operation payload written after the header.
    pub fn data_size(&self) -> usize {
        match &self.op {
            PatchOp::Copy { data, .. } => 4 + data.len(),
            PatchOp::Move { .. } => 6,
            PatchOp::LeafRemove { key, .. } => 8 + 1 + key.len(),
            PatchOp::LeafErasePresence { key } => 1 + key.len(),
        }
    }

    /// Bytes written by [`Patch::encode`].
    pub fn serialized_size(&self) -> usize {
        PATCH_HEADER_LEN + self.data_size()
    }

    /// Checks that the patch can be encoded: leaf keys fit their one-byte
    /// length and the whole record fits its `u16` length prefix.
    pub fn validate(&self) -> Result<()> {
        match &self.op {
            PatchOp::LeafRemove { key, .. } | PatchOp::LeafErasePresence { key } => {
                check_key(key)?
            }
            PatchOp::Copy { .. } | PatchOp::Move { .. } => {}
        }
        if self.serialized_size() > MAX_PATCH_LEN {
            return Err(PatchworkError::Invalid("patch larger than its length prefix"));
        }
        Ok(())
    }

    /// Appends the encoded patch to `dst`; nothing is written when the patch
    /// fails [`Patch::validate`].
    pub fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        self.validate()?;
        let start = dst.len();
        be::push_u16(dst, self.serialized_size() as u16);
        be::push_u64(dst, self.block_id.0);
        be::push_u64(dst, self.block_seq.0);
        be::push_u32(dst, self.counter.0);
        dst.push(self.op.code());
        self.encode_data(dst);
        debug_assert_eq!(dst.len() - start, self.serialized_size());
        Ok(())
    }

    fn encode_data(&self, dst: &mut Vec<u8>) {
        match &self.op {
            PatchOp::Copy { dest_offset, data } => {
                be::push_u16(dst, *dest_offset);
                be::push_u16(dst, data.len() as u16);
                dst.extend_from_slice(data);
            }
            PatchOp::Move {
                dest_offset,
                src_offset,
                len,
            } => {
                be::push_u16(dst, *dest_offset);
                be::push_u16(dst, *src_offset);
                be::push_u16(dst, *len);
            }
            PatchOp::LeafRemove { timestamp, key } => {
                be::push_u64(dst, timestamp.0);
                dst.push(key.len() as u8);
                dst.extend_from_slice(key);
            }
            PatchOp::LeafErasePresence { key } => {
                dst.push(key.len() as u8);
                dst.extend_from_slice(key);
            }
        }
    }

    /// Encodes the patch into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.serialized_size());
        self.encode(&mut out)?;
        Ok(out)
    }

    /// Decodes the patch at the front of `src` and returns it with its encoded length.
    pub fn decode(src: &[u8]) -> Result<(Self, usize)> {
        if src.len() < PATCH_HEADER_LEN {
            return Err(PatchworkError::Corruption("patch header truncated"));
        }
        let total = be::get_u16(src, 0) as usize;
        if total < PATCH_HEADER_LEN || total > src.len() {
            return Err(PatchworkError::Corruption("patch length out of range"));
        }
        let mut cur = Cursor::new(&src[2..total]);
        let block_id = BlockId(cur.u64("patch block id")?);
        let block_seq = BlockSeq(cur.u64("patch block seq")?);
        let counter = PatchCounter(cur.u32("patch counter")?);
        let op = match cur.u8("patch op")? {
            OP_COPY => {
                let dest_offset = cur.u16("copy patch truncated")?;
                let n = cur.u16("copy patch truncated")? as usize;
                let data = cur.take(n, "copy patch truncated")?.to_vec();
                PatchOp::Copy { dest_offset, data }
            }
            OP_MOVE => PatchOp::Move {
                dest_offset: cur.u16("move patch truncated")?,
                src_offset: cur.u16("move patch truncated")?,
                len: cur.u16("move patch truncated")?,
            },
            OP_LEAF_REMOVE => {
                let timestamp = Timestamp(cur.u64("leaf remove patch truncated")?);
                let n = cur.u8("leaf remove patch truncated")? as usize;
                let key = LeafKey::from_slice(cur.take(n, "leaf remove patch truncated")?);
                PatchOp::LeafRemove { timestamp, key }
            }
            OP_LEAF_ERASE => {
                let n = cur.u8("leaf erase patch truncated")? as usize;
                let key = LeafKey::from_slice(cur.take(n, "leaf erase patch truncated")?);
                PatchOp::LeafErasePresence { key }
            }
            _ => return Err(PatchworkError::Corruption("unknown patch op")),
        };
        if cur.remaining() != 0 {
            return Err(PatchworkError::Corruption("patch length mismatch"));
        }
        Ok((
            Self {
                block_id,
                block_seq,
                counter,
                op,
            },
            total,
        ))
    }

    /// Applies the diff to a block buffer.
    pub fn apply_to_buf(&self, buf: &mut [u8]) -> Result<()> {
        self.validate()?;
        match &self.op {
            PatchOp::Copy { dest_offset, data } => {
                let start = *dest_offset as usize;
                let end = start + data.len();
                if end > buf.len() {
                    return Err(PatchworkError::Corruption("copy patch out of range"));
                }
                buf[start..end].copy_from_slice(data);
            }
            PatchOp::Move {
                dest_offset,
                src_offset,
                len,
            } => {
                let src = *src_offset as usize;
                let dest = *dest_offset as usize;
                let len = *len as usize;
                if src + len > buf.len() || dest + len > buf.len() {
                    return Err(PatchworkError::Corruption("move patch out of range"));
                }
                buf.copy_within(src..src + len, dest);
            }
            PatchOp::LeafRemove { timestamp, key } => {
                leaf::remove(buf, key, *timestamp)?;
            }
            PatchOp::LeafErasePresence { key } => {
                leaf::erase_presence(buf, key)?;
            }
        }
        Ok(())
    }
}
