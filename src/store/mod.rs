#![forbid(unsafe_code)]
//! Block storage layer consumed by the write-back coordinator.
//!
//! The coordinator only needs two things from storage: a read-only snapshot
//! to fetch base copies of blocks, and a batched write entry point that
//! reports placement and durability through callbacks. Two implementations
//! are provided: [`MemBlockStore`] keeps blocks in memory and can inject
//! failures, [`FileBlockStore`] persists fixed-size slots in one file.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

use crate::primitives::bytes::be;
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{block_crc32, BlockId, BlockSeq, PatchworkError, Recency, Result};

/// Scheduling hint forwarded with every write batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoPriority {
    /// Background writes.
    Low,
    /// Regular write-back.
    #[default]
    Normal,
    /// Writes other work is waiting on.
    High,
}

/// Base copy of a block as stored.
#[derive(Clone, Debug)]
pub struct StoredBlock {
    /// Base version of the stored copy.
    pub block_seq: BlockSeq,
    /// Recency stamp written with the block.
    pub recency: Recency,
    /// Block contents.
    pub data: Arc<[u8]>,
}

/// Read-only view used to fetch base copies without blocking writers.
pub trait ReadSnapshot: Send + Sync {
    /// Returns the stored copy of `id`, or `None` if absent or deleted.
    fn read_block(&self, id: BlockId) -> Result<Option<StoredBlock>>;
}

/// One entry of a write batch.
#[derive(Clone, Debug)]
pub enum BlockWrite {
    /// Full content write tagged with the new base version.
    Full {
        /// Target block.
        block_id: BlockId,
        /// Base version the stored copy will carry.
        block_seq: BlockSeq,
        /// Complete block contents.
        data: Arc<[u8]>,
        /// Recency stamp stored with the block.
        recency: Recency,
    },
    /// Recency-only update; content is unchanged.
    Touch {
        /// Target block.
        block_id: BlockId,
        /// New recency stamp.
        recency: Recency,
    },
    /// Deletes the block, optionally zeroing its stored bytes.
    Tombstone {
        /// Target block.
        block_id: BlockId,
        /// Overwrite the stored contents with zeroes.
        write_zeroed: bool,
    },
}

impl BlockWrite {
    /// Block the write targets.
    pub fn block_id(&self) -> BlockId {
        match self {
            BlockWrite::Full { block_id, .. }
            | BlockWrite::Touch { block_id, .. }
            | BlockWrite::Tombstone { block_id, .. } => *block_id,
        }
    }
}

/// Where a write landed, reported once the batch is readable from storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// Full write placed under a new base version.
    Written {
        /// Written block.
        block_id: BlockId,
        /// Base version now stored.
        block_seq: BlockSeq,
    },
    /// Recency update placed.
    Touched {
        /// Touched block.
        block_id: BlockId,
    },
    /// Tombstone placed.
    Deleted {
        /// Deleted block.
        block_id: BlockId,
    },
}

/// Invoked once every write of a batch is placed.
pub type PlacedCallback = Box<dyn FnOnce(Vec<Placement>) + Send>;
/// Invoked once the batch, and every batch before it, is durable.
pub type DurableCallback = Box<dyn FnOnce() + Send>;

/// Storage collaborator.
pub trait BlockStore: Send + Sync {
    /// Size of every block in bytes.
    fn block_size(&self) -> usize;

    /// Opens a consistent read view of the stored blocks.
    fn begin_snapshot(&self) -> Result<Box<dyn ReadSnapshot>>;

    /// Largest base version stored for any block.
    fn max_block_seq(&self) -> Result<BlockSeq>;

    /// Submits a batch. On error neither callback runs.
    ///
    /// Implementations may invoke the callbacks before returning; callers
    /// must not hold locks the callbacks take.
    fn write(
        &self,
        writes: Vec<BlockWrite>,
        priority: IoPriority,
        on_placed: PlacedCallback,
        on_durable: DurableCallback,
    ) -> Result<()>;
}

fn placements(writes: &[BlockWrite]) -> Vec<Placement> {
    writes
        .iter()
        .map(|write| match write {
            BlockWrite::Full {
                block_id,
                block_seq,
                ..
            } => Placement::Written {
                block_id: *block_id,
                block_seq: *block_seq,
            },
            BlockWrite::Touch { block_id, .. } => Placement::Touched {
                block_id: *block_id,
            },
            BlockWrite::Tombstone { block_id, .. } => Placement::Deleted {
                block_id: *block_id,
            },
        })
        .collect()
}

fn check_size(block_size: usize, data: &[u8]) -> Result<()> {
    if data.len() != block_size {
        return Err(PatchworkError::InvalidOwned(format!(
            "block write of {} bytes, expected {block_size}",
            data.len()
        )));
    }
    Ok(())
}

/// Counters kept by the stores for tests and tooling.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Write batches accepted.
    pub batches: u64,
    /// Full block writes.
    pub full_writes: u64,
    /// Recency-only writes.
    pub touches: u64,
    /// Tombstones written.
    pub tombstones: u64,
}

impl StoreStats {
    fn record(&mut self, writes: &[BlockWrite]) {
        self.batches += 1;
        for write in writes {
            match write {
                BlockWrite::Full { .. } => self.full_writes += 1,
                BlockWrite::Touch { .. } => self.touches += 1,
                BlockWrite::Tombstone { .. } => self.tombstones += 1,
            }
        }
    }
}

#[derive(Default)]
struct MemState {
    blocks: HashMap<BlockId, StoredBlock>,
    fail_writes: u32,
    hold_durability: bool,
    held: Vec<DurableCallback>,
    stats: StoreStats,
}

/// In-memory [`BlockStore`] with failure injection and manual durability.
#[derive(Clone)]
pub struct MemBlockStore {
    block_size: usize,
    state: Arc<Mutex<MemState>>,
}

struct MemSnapshot {
    blocks: HashMap<BlockId, StoredBlock>,
}

impl ReadSnapshot for MemSnapshot {
    fn read_block(&self, id: BlockId) -> Result<Option<StoredBlock>> {
        Ok(self.blocks.get(&id).cloned())
    }
}

impl MemBlockStore {
    /// Creates an empty store for blocks of `block_size` bytes.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            state: Arc::new(Mutex::new(MemState::default())),
        }
    }

    /// Makes the next `n` write batches fail with an I/O error.
    pub fn fail_next_writes(&self, n: u32) {
        self.state.lock().fail_writes = n;
    }

    /// While held, durability callbacks queue until [`MemBlockStore::release_durability`].
    pub fn hold_durability(&self, hold: bool) {
        self.state.lock().hold_durability = hold;
    }

    /// Runs every queued durability callback in submission order.
    pub fn release_durability(&self) {
        let held = {
            let mut state = self.state.lock();
            state.hold_durability = false;
            std::mem::take(&mut state.held)
        };
        for callback in held {
            callback();
        }
    }

    /// Stored copy of `id`, ignoring durability.
    pub fn stored(&self, id: BlockId) -> Option<StoredBlock> {
        self.state.lock().blocks.get(&id).cloned()
    }

    /// Counters of accepted writes.
    pub fn stats(&self) -> StoreStats {
        self.state.lock().stats
    }
}

impl BlockStore for MemBlockStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn begin_snapshot(&self) -> Result<Box<dyn ReadSnapshot>> {
        Ok(Box::new(MemSnapshot {
            blocks: self.state.lock().blocks.clone(),
        }))
    }

    fn max_block_seq(&self) -> Result<BlockSeq> {
        Ok(self
            .state
            .lock()
            .blocks
            .values()
            .map(|b| b.block_seq)
            .max()
            .unwrap_or_default())
    }

    fn write(
        &self,
        writes: Vec<BlockWrite>,
        _priority: IoPriority,
        on_placed: PlacedCallback,
        on_durable: DurableCallback,
    ) -> Result<()> {
        let durable_now = {
            let mut state = self.state.lock();
            if state.fail_writes > 0 {
                state.fail_writes -= 1;
                return Err(PatchworkError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "injected write failure",
                )));
            }
            for write in &writes {
                if let BlockWrite::Full { data, .. } = write {
                    check_size(self.block_size, data)?;
                }
            }
            for write in &writes {
                match write {
                    BlockWrite::Full {
                        block_id,
                        block_seq,
                        data,
                        recency,
                    } => {
                        state.blocks.insert(
                            *block_id,
                            StoredBlock {
                                block_seq: *block_seq,
                                recency: *recency,
                                data: Arc::clone(data),
                            },
                        );
                    }
                    BlockWrite::Touch { block_id, recency } => {
                        if let Some(block) = state.blocks.get_mut(block_id) {
                            block.recency = *recency;
                        }
                    }
                    BlockWrite::Tombstone { block_id, .. } => {
                        state.blocks.remove(block_id);
                    }
                }
            }
            state.stats.record(&writes);
            !state.hold_durability
        };
        on_placed(placements(&writes));
        if durable_now {
            on_durable();
        } else {
            self.state.lock().held.push(on_durable);
        }
        Ok(())
    }
}

const SLOT_HEADER_LEN: usize = 32;
const SLOT_MAGIC: [u8; 4] = *b"PWBK";
const FLAG_DELETED: u16 = 1;

struct FileStoreInner {
    io: Arc<dyn FileIo>,
    block_size: usize,
    write_lock: Mutex<()>,
    max_seq: Mutex<BlockSeq>,
    stats: Mutex<StoreStats>,
}

impl FileStoreInner {
    fn slot_len(&self) -> usize {
        SLOT_HEADER_LEN + self.block_size
    }

    /// Byte range of the slot for `id`, or `None` past the addressable file.
    fn slot_range(&self, id: BlockId) -> Option<(u64, u64)> {
        let len = self.slot_len() as u64;
        let offset = id.0.checked_mul(len)?;
        Some((offset, offset.checked_add(len)?))
    }

    fn read_slot(&self, id: BlockId) -> Result<Option<StoredBlock>> {
        let Some((offset, end)) = self.slot_range(id) else {
            return Ok(None);
        };
        if end > self.io.len()? {
            return Ok(None);
        }
        let mut buf = vec![0u8; self.slot_len()];
        self.io.read_at(offset, &mut buf)?;
        decode_slot(id, &buf)
    }

    fn write_slot(&self, id: BlockId, flags: u16, seq: BlockSeq, recency: Recency, data: &[u8]) -> Result<()> {
        let Some((offset, _)) = self.slot_range(id) else {
            return Err(PatchworkError::Invalid("block id beyond file store range"));
        };
        let mut buf = vec![0u8; self.slot_len()];
        buf[0..4].copy_from_slice(&SLOT_MAGIC);
        be::put_u16(&mut buf, 4, flags);
        be::put_u64(&mut buf, 8, seq.0);
        be::put_u64(&mut buf, 16, recency.0);
        buf[SLOT_HEADER_LEN..].copy_from_slice(data);
        let crc = block_crc32(id.0, 0, &[&buf]);
        be::put_u32(&mut buf, 28, crc);
        self.io.write_at(offset, &buf)
    }
}

fn decode_slot(id: BlockId, buf: &[u8]) -> Result<Option<StoredBlock>> {
    if buf[..SLOT_HEADER_LEN].iter().all(|b| *b == 0) {
        return Ok(None);
    }
    if buf[0..4] != SLOT_MAGIC {
        return Err(PatchworkError::Corruption("block slot magic mismatch"));
    }
    let stored_crc = be::get_u32(buf, 28);
    let mut check = buf.to_vec();
    be::put_u32(&mut check, 28, 0);
    if block_crc32(id.0, 0, &[&check]) != stored_crc {
        return Err(PatchworkError::Corruption("block slot crc mismatch"));
    }
    if be::get_u16(buf, 4) & FLAG_DELETED != 0 {
        return Ok(None);
    }
    Ok(Some(StoredBlock {
        block_seq: BlockSeq(be::get_u64(buf, 8)),
        recency: Recency(be::get_u64(buf, 16)),
        data: Arc::from(&buf[SLOT_HEADER_LEN..]),
    }))
}

/// File-backed [`BlockStore`]; block `n` lives in slot `n` of the file.
#[derive(Clone)]
pub struct FileBlockStore {
    inner: Arc<FileStoreInner>,
}

struct FileSnapshot {
    inner: Arc<FileStoreInner>,
}

impl ReadSnapshot for FileSnapshot {
    fn read_block(&self, id: BlockId) -> Result<Option<StoredBlock>> {
        let _guard = self.inner.write_lock.lock();
        self.inner.read_slot(id)
    }
}

impl FileBlockStore {
    /// Opens or creates the store file at `path`.
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        Self::with_io(Arc::new(StdFileIo::open(path)?), block_size)
    }

    /// Opens a store over any [`FileIo`], scanning it for the largest base version.
    pub fn with_io(io: Arc<dyn FileIo>, block_size: usize) -> Result<Self> {
        let inner = FileStoreInner {
            io,
            block_size,
            write_lock: Mutex::new(()),
            max_seq: Mutex::new(BlockSeq(0)),
            stats: Mutex::new(StoreStats::default()),
        };
        let slots = inner.io.len()? / inner.slot_len() as u64;
        let mut max_seq = BlockSeq(0);
        let mut buf = vec![0u8; inner.slot_len()];
        for slot in 0..slots {
            inner.io.read_at(slot * inner.slot_len() as u64, &mut buf)?;
            if buf[..SLOT_HEADER_LEN].iter().all(|b| *b == 0) {
                continue;
            }
            max_seq = max_seq.max(BlockSeq(be::get_u64(&buf, 8)));
        }
        *inner.max_seq.lock() = max_seq;
        debug!(slots, max_seq = max_seq.0, "store.file.open");
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Counters of accepted writes.
    pub fn stats(&self) -> StoreStats {
        *self.inner.stats.lock()
    }
}

impl BlockStore for FileBlockStore {
    fn block_size(&self) -> usize {
        self.inner.block_size
    }

    fn begin_snapshot(&self) -> Result<Box<dyn ReadSnapshot>> {
        Ok(Box::new(FileSnapshot {
            inner: Arc::clone(&self.inner),
        }))
    }

    fn max_block_seq(&self) -> Result<BlockSeq> {
        Ok(*self.inner.max_seq.lock())
    }

    fn write(
        &self,
        writes: Vec<BlockWrite>,
        _priority: IoPriority,
        on_placed: PlacedCallback,
        on_durable: DurableCallback,
    ) -> Result<()> {
        {
            let _guard = self.inner.write_lock.lock();
            let zeroes = vec![0u8; self.inner.block_size];
            for write in &writes {
                match write {
                    BlockWrite::Full {
                        block_id,
                        block_seq,
                        data,
                        recency,
                    } => {
                        check_size(self.inner.block_size, data)?;
                        self.inner
                            .write_slot(*block_id, 0, *block_seq, *recency, data)?;
                        let mut max_seq = self.inner.max_seq.lock();
                        *max_seq = (*max_seq).max(*block_seq);
                    }
                    BlockWrite::Touch { block_id, recency } => {
                        if let Some(block) = self.inner.read_slot(*block_id)? {
                            self.inner.write_slot(
                                *block_id,
                                0,
                                block.block_seq,
                                *recency,
                                &block.data,
                            )?;
                        }
                    }
                    BlockWrite::Tombstone {
                        block_id,
                        write_zeroed,
                    } => {
                        let existing = self.inner.read_slot(*block_id)?;
                        let (seq, data) = match &existing {
                            Some(block) if !*write_zeroed => (block.block_seq, &block.data[..]),
                            Some(block) => (block.block_seq, &zeroes[..]),
                            None => (BlockSeq(0), &zeroes[..]),
                        };
                        self.inner
                            .write_slot(*block_id, FLAG_DELETED, seq, Recency(0), data)?;
                    }
                }
            }
            self.inner.io.sync_all()?;
            self.inner.stats.lock().record(&writes);
        }
        on_placed(placements(&writes));
        on_durable();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn full(id: u64, seq: u64, fill: u8, size: usize) -> BlockWrite {
        BlockWrite::Full {
            block_id: BlockId(id),
            block_seq: BlockSeq(seq),
            data: Arc::from(vec![fill; size]),
            recency: Recency(seq),
        }
    }

    #[test]
    fn mem_store_holds_durability_until_released() {
        let store = MemBlockStore::new(16);
        store.hold_durability(true);
        let durable = Arc::new(AtomicUsize::new(0));
        let placed = Arc::new(AtomicUsize::new(0));
        for seq in 1..=2 {
            let durable = Arc::clone(&durable);
            let placed = Arc::clone(&placed);
            store
                .write(
                    vec![full(1, seq, seq as u8, 16)],
                    IoPriority::Normal,
                    Box::new(move |p| {
                        placed.fetch_add(p.len(), Ordering::SeqCst);
                    }),
                    Box::new(move || {
                        durable.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .unwrap();
        }
        assert_eq!(placed.load(Ordering::SeqCst), 2);
        assert_eq!(durable.load(Ordering::SeqCst), 0);
        store.release_durability();
        assert_eq!(durable.load(Ordering::SeqCst), 2);
        assert_eq!(store.stored(BlockId(1)).unwrap().block_seq, BlockSeq(2));
        assert_eq!(store.max_block_seq().unwrap(), BlockSeq(2));
    }

    #[test]
    fn mem_store_injected_failure_skips_callbacks() {
        let store = MemBlockStore::new(16);
        store.fail_next_writes(1);
        let err = store
            .write(
                vec![full(1, 1, 1, 16)],
                IoPriority::High,
                Box::new(|_| panic!("placed after failure")),
                Box::new(|| panic!("durable after failure")),
            )
            .unwrap_err();
        assert!(matches!(err, PatchworkError::Io(_)));
        assert!(store.stored(BlockId(1)).is_none());
    }

    #[test]
    fn file_store_persists_and_tombstones() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.db");
        {
            let store = FileBlockStore::open(&path, 64).unwrap();
            store
                .write(
                    vec![full(3, 7, 0xAB, 64), full(1, 5, 0x01, 64)],
                    IoPriority::Normal,
                    Box::new(|_| {}),
                    Box::new(|| {}),
                )
                .unwrap();
            store
                .write(
                    vec![
                        BlockWrite::Touch {
                            block_id: BlockId(3),
                            recency: Recency(99),
                        },
                        BlockWrite::Tombstone {
                            block_id: BlockId(1),
                            write_zeroed: true,
                        },
                    ],
                    IoPriority::Low,
                    Box::new(|_| {}),
                    Box::new(|| {}),
                )
                .unwrap();
            assert_eq!(store.stats().touches, 1);
        }
        let store = FileBlockStore::open(&path, 64).unwrap();
        assert_eq!(store.max_block_seq().unwrap(), BlockSeq(7));
        let snapshot = store.begin_snapshot().unwrap();
        let block = snapshot.read_block(BlockId(3)).unwrap().unwrap();
        assert_eq!(block.block_seq, BlockSeq(7));
        assert_eq!(block.recency, Recency(99));
        assert!(block.data.iter().all(|b| *b == 0xAB));
        assert!(snapshot.read_block(BlockId(1)).unwrap().is_none());
        assert!(snapshot.read_block(BlockId(40)).unwrap().is_none());
    }

    #[test]
    fn file_store_rejects_ids_past_addressable_range() {
        let dir = tempdir().unwrap();
        let store = FileBlockStore::open(dir.path().join("blocks.db"), 64).unwrap();
        let far = BlockId(u64::MAX / 16);
        let snapshot = store.begin_snapshot().unwrap();
        assert!(snapshot.read_block(far).unwrap().is_none());
        let err = store
            .write(
                vec![full(far.0, 1, 0x11, 64)],
                IoPriority::Normal,
                Box::new(|_| panic!("placed out of range")),
                Box::new(|| panic!("durable out of range")),
            )
            .unwrap_err();
        assert!(matches!(err, PatchworkError::Invalid(_)));
        store
            .write(
                vec![BlockWrite::Tombstone {
                    block_id: BlockId(u64::MAX),
                    write_zeroed: false,
                }],
                IoPriority::Normal,
                Box::new(|_| panic!("placed out of range")),
                Box::new(|| panic!("durable out of range")),
            )
            .unwrap_err();
    }
}
