#![forbid(unsafe_code)]
//! Compact leaf-node layout used by the leaf-removal patch kinds.
//!
//! A leaf starts with a 16-byte header followed by packed entries:
//!
//! ```text
//! [0..4)   magic selecting the value kind
//! [4..12)  block timestamp (u64)
//! [12..14) entry count, live and deleted (u16)
//! [14..16) end of used bytes (u16)
//! ```
//!
//! Each entry is `tag u8, key_len u8, key`, then the encoded value when the
//! tag is live or a u64 deletion timestamp when it is deleted.

use crate::primitives::bytes::be;
use crate::types::{PatchworkError, Result, Timestamp};

/// Magic, leaf timestamp, entry count and free offset.
pub const LEAF_HEADER_LEN: usize = 16;
const TAG_LIVE: u8 = 0;
const TAG_DELETED: u8 = 1;
const BLOB_REF_LEN: usize = 24;

/// Closed set of value encodings a leaf can hold, selected by the header magic.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValueKind {
    /// `u8 len, bytes`
    Short,
    /// `flags u32, exptime u32, u16 len, bytes`
    Memcached,
    /// Fixed 24-byte reference into an external blob store.
    BlobRef,
}

impl ValueKind {
    /// Header magic identifying this value kind.
    pub fn magic(self) -> [u8; 4] {
        match self {
            ValueKind::Short => *b"LFsv",
            ValueKind::Memcached => *b"LFmc",
            ValueKind::BlobRef => *b"LFbr",
        }
    }

    /// Resolves a header magic; unknown magics are corruption.
    pub fn from_magic(magic: &[u8]) -> Result<Self> {
        match magic {
            b"LFsv" => Ok(ValueKind::Short),
            b"LFmc" => Ok(ValueKind::Memcached),
            b"LFbr" => Ok(ValueKind::BlobRef),
            _ => Err(PatchworkError::Corruption("unknown leaf value magic")),
        }
    }

    /// Size of the encoded value at the start of `src`.
    pub fn value_len(self, src: &[u8]) -> Result<usize> {
        let len = match self {
            ValueKind::Short => {
                let n = *src
                    .first()
                    .ok_or(PatchworkError::Corruption("leaf value truncated"))?;
                1 + n as usize
            }
            ValueKind::Memcached => {
                if src.len() < 10 {
                    return Err(PatchworkError::Corruption("leaf value truncated"));
                }
                10 + be::get_u16(src, 8) as usize
            }
            ValueKind::BlobRef => BLOB_REF_LEN,
        };
        if len > src.len() {
            return Err(PatchworkError::Corruption("leaf value truncated"));
        }
        Ok(len)
    }

    fn encode_value(self, value: &[u8], dst: &mut Vec<u8>) -> Result<()> {
        match self {
            ValueKind::Short => {
                let n = u8::try_from(value.len())
                    .map_err(|_| PatchworkError::Invalid("short value too long"))?;
                dst.push(n);
            }
            ValueKind::Memcached => {
                let n = u16::try_from(value.len())
                    .map_err(|_| PatchworkError::Invalid("memcached value too long"))?;
                be::push_u32(dst, 0);
                be::push_u32(dst, 0);
                be::push_u16(dst, n);
            }
            ValueKind::BlobRef => {
                if value.len() != BLOB_REF_LEN {
                    return Err(PatchworkError::Invalid("blob reference must be 24 bytes"));
                }
            }
        }
        dst.extend_from_slice(value);
        Ok(())
    }

    fn decode_value(self, src: &[u8]) -> Vec<u8> {
        match self {
            ValueKind::Short => src[1..].to_vec(),
            ValueKind::Memcached => src[10..].to_vec(),
            ValueKind::BlobRef => src.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct EntrySpan {
    start: usize,
    end: usize,
    tag: u8,
    value_start: usize,
}

/// Formats `buf` as an empty leaf of the given kind.
pub fn init(buf: &mut [u8], kind: ValueKind, timestamp: Timestamp) -> Result<()> {
    if buf.len() < LEAF_HEADER_LEN || buf.len() > u16::MAX as usize + 1 {
        return Err(PatchworkError::Invalid("buffer size unsuitable for a leaf"));
    }
    buf.fill(0);
    buf[0..4].copy_from_slice(&kind.magic());
    be::put_u64(buf, 4, timestamp.0);
    be::put_u16(buf, 12, 0);
    be::put_u16(buf, 14, LEAF_HEADER_LEN as u16);
    Ok(())
}

/// Value kind of the leaf in `buf`.
pub fn value_kind(buf: &[u8]) -> Result<ValueKind> {
    if buf.len() < LEAF_HEADER_LEN {
        return Err(PatchworkError::Corruption("leaf shorter than header"));
    }
    ValueKind::from_magic(&buf[0..4])
}

/// Leaf timestamp, the newest deletion recorded in it.
pub fn timestamp(buf: &[u8]) -> Result<Timestamp> {
    value_kind(buf)?;
    Ok(Timestamp(be::get_u64(buf, 4)))
}

/// Number of entries, live and deleted.
pub fn entry_count(buf: &[u8]) -> Result<u16> {
    value_kind(buf)?;
    Ok(be::get_u16(buf, 12))
}

fn used_end(buf: &[u8]) -> Result<usize> {
    let end = be::get_u16(buf, 14) as usize;
    if end < LEAF_HEADER_LEN || end > buf.len() {
        return Err(PatchworkError::Corruption("leaf used-end out of range"));
    }
    Ok(end)
}

fn find(buf: &[u8], kind: ValueKind, key: &[u8]) -> Result<Option<EntrySpan>> {
    let end = used_end(buf)?;
    let mut off = LEAF_HEADER_LEN;
    while off < end {
        if off + 2 > end {
            return Err(PatchworkError::Corruption("leaf entry truncated"));
        }
        let tag = buf[off];
        let key_len = buf[off + 1] as usize;
        let key_start = off + 2;
        let value_start = key_start + key_len;
        if value_start > end {
            return Err(PatchworkError::Corruption("leaf key truncated"));
        }
        let value_len = match tag {
            TAG_LIVE => kind.value_len(&buf[value_start..end])?,
            TAG_DELETED => 8,
            _ => return Err(PatchworkError::Corruption("leaf entry tag")),
        };
        let entry_end = value_start + value_len;
        if entry_end > end {
            return Err(PatchworkError::Corruption("leaf entry truncated"));
        }
        if &buf[key_start..value_start] == key {
            return Ok(Some(EntrySpan {
                start: off,
                end: entry_end,
                tag,
                value_start,
            }));
        }
        off = entry_end;
    }
    Ok(None)
}

fn cut(buf: &mut [u8], span: EntrySpan) -> Result<()> {
    let end = used_end(buf)?;
    let len = span.end - span.start;
    buf.copy_within(span.end..end, span.start);
    buf[end - len..end].fill(0);
    be::put_u16(buf, 14, (end - len) as u16);
    let count = be::get_u16(buf, 12);
    be::put_u16(buf, 12, count.saturating_sub(1));
    Ok(())
}

fn append(buf: &mut [u8], entry: &[u8]) -> Result<bool> {
    let end = used_end(buf)?;
    if end + entry.len() > buf.len() {
        return Ok(false);
    }
    buf[end..end + entry.len()].copy_from_slice(entry);
    be::put_u16(buf, 14, (end + entry.len()) as u16);
    let count = be::get_u16(buf, 12);
    be::put_u16(buf, 12, count + 1);
    Ok(true)
}

fn key_len(key: &[u8]) -> Result<u8> {
    u8::try_from(key.len()).map_err(|_| PatchworkError::Invalid("leaf key longer than 255 bytes"))
}

/// Inserts or replaces `key`. Fails with `Invalid` when the leaf has no room.
pub fn insert(buf: &mut [u8], key: &[u8], value: &[u8]) -> Result<()> {
    let kind = value_kind(buf)?;
    let mut entry = Vec::with_capacity(2 + key.len() + value.len() + 10);
    entry.push(TAG_LIVE);
    entry.push(key_len(key)?);
    entry.extend_from_slice(key);
    kind.encode_value(value, &mut entry)?;
    let existing = find(buf, kind, key)?;
    let free = buf.len() - used_end(buf)?;
    let reclaimed = existing.map(|span| span.end - span.start).unwrap_or(0);
    if entry.len() > free + reclaimed {
        return Err(PatchworkError::Invalid("leaf full"));
    }
    if let Some(span) = existing {
        cut(buf, span)?;
    }
    append(buf, &entry)?;
    Ok(())
}

/// Returns the decoded value of a live entry.
pub fn lookup(buf: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
    let kind = value_kind(buf)?;
    match find(buf, kind, key)? {
        Some(span) if span.tag == TAG_LIVE => {
            Ok(Some(kind.decode_value(&buf[span.value_start..span.end])))
        }
        _ => Ok(None),
    }
}

/// Deletion timestamp recorded for `key`, if its removal history is present.
pub fn deleted_at(buf: &[u8], key: &[u8]) -> Result<Option<Timestamp>> {
    let kind = value_kind(buf)?;
    match find(buf, kind, key)? {
        Some(span) if span.tag == TAG_DELETED => {
            Ok(Some(Timestamp(be::get_u64(buf, span.value_start))))
        }
        _ => Ok(None),
    }
}

/// Removes a live entry and records its deletion at `ts`.
///
/// The block timestamp becomes `max(block timestamp, ts)` whether or not the
/// key was present. History is dropped when the leaf has no room for it.
pub fn remove(buf: &mut [u8], key: &[u8], ts: Timestamp) -> Result<bool> {
    let kind = value_kind(buf)?;
    let block_ts = be::get_u64(buf, 4);
    be::put_u64(buf, 4, block_ts.max(ts.0));
    let span = match find(buf, kind, key)? {
        Some(span) if span.tag == TAG_LIVE => span,
        _ => return Ok(false),
    };
    cut(buf, span)?;
    let mut tombstone = Vec::with_capacity(2 + key.len() + 8);
    tombstone.push(TAG_DELETED);
    tombstone.push(key_len(key)?);
    tombstone.extend_from_slice(key);
    be::push_u64(&mut tombstone, ts.0);
    append(buf, &tombstone)?;
    Ok(true)
}

/// Removes every trace of `key` without recording history.
pub fn erase_presence(buf: &mut [u8], key: &[u8]) -> Result<bool> {
    let kind = value_kind(buf)?;
    match find(buf, kind, key)? {
        Some(span) => {
            cut(buf, span)?;
            Ok(true)
        }
        None => Ok(false),
    }
}
