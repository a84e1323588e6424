#![forbid(unsafe_code)]
//! Bounded on-disk region that persists serialized patches.
//!
//! The region is `log_blocks + 1` blocks long. Block 0 holds the region
//! header; log blocks follow. Each log block starts with a 24-byte header:
//!
//! ```text
//! [0..4)   magic "PWLB"
//! [4..6)   format version
//! [6..8)   reserved, zero
//! [8..16)  log sequence (age stamp, larger is newer)
//! [16..20) payload bytes in use
//! [20..24) crc32 over slot index, salt, header (crc zeroed) and payload
//! ```
//!
//! A log block whose header is all zero is free.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};

use super::Patch;
use crate::primitives::bytes::be;
use crate::primitives::io::FileIo;
use crate::types::{block_crc32, BlockId, BlockSeq, PatchworkError, Result};

const REGION_MAGIC: [u8; 4] = *b"PWLG";
const BLOCK_MAGIC: [u8; 4] = *b"PWLB";
const FORMAT_VERSION: u16 = 1;
/// Length of the region header stored in block 0.
pub const REGION_HEADER_LEN: usize = 36;
/// Length of the header at the start of every log block.
pub const LOG_BLOCK_HEADER_LEN: usize = 24;

/// Static configuration persisted in the region header and checked on reopen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogConfig {
    /// Size of every log block, equal to the cache block size.
    pub block_size: u32,
    /// Number of log blocks after the header block.
    pub log_blocks: u32,
    /// Admission limit the region was created for.
    pub max_dirty_blocks: u64,
}

/// Decoded region header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionHeader {
    /// Geometry the region was created with.
    pub config: LogConfig,
    /// Random value binding log block checksums to this region.
    pub salt: u64,
}

impl RegionHeader {
    fn encode(&self) -> [u8; REGION_HEADER_LEN] {
        let mut buf = [0u8; REGION_HEADER_LEN];
        buf[0..4].copy_from_slice(&REGION_MAGIC);
        be::put_u16(&mut buf, 4, FORMAT_VERSION);
        be::put_u32(&mut buf, 8, self.config.block_size);
        be::put_u32(&mut buf, 12, self.config.log_blocks);
        be::put_u64(&mut buf, 16, self.config.max_dirty_blocks);
        be::put_u64(&mut buf, 24, self.salt);
        let crc = block_crc32(0, 0, &[&buf[..32]]);
        be::put_u32(&mut buf, 32, crc);
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < REGION_HEADER_LEN {
            return Err(PatchworkError::Corruption("patch log header truncated"));
        }
        if src[0..4] != REGION_MAGIC {
            return Err(PatchworkError::Corruption("patch log magic mismatch"));
        }
        if be::get_u16(src, 4) != FORMAT_VERSION {
            return Err(PatchworkError::Corruption("patch log version mismatch"));
        }
        if src[6..8] != [0, 0] {
            return Err(PatchworkError::Corruption(
                "patch log reserved header bytes non-zero",
            ));
        }
        if block_crc32(0, 0, &[&src[..32]]) != be::get_u32(src, 32) {
            return Err(PatchworkError::Corruption("patch log header crc mismatch"));
        }
        Ok(Self {
            config: LogConfig {
                block_size: be::get_u32(src, 8),
                log_blocks: be::get_u32(src, 12),
                max_dirty_blocks: be::get_u64(src, 16),
            },
            salt: be::get_u64(src, 24),
        })
    }
}

/// Reads and validates the region header.
pub fn read_region_header(io: &dyn FileIo) -> Result<RegionHeader> {
    let mut buf = [0u8; REGION_HEADER_LEN];
    io.read_at(0, &mut buf)?;
    RegionHeader::decode(&buf)
}

/// Contents of one occupied log block as found on disk.
#[derive(Clone, Debug)]
pub struct LogBlockView {
    /// Index of the log block within the region.
    pub slot: usize,
    /// Age stamp; lower values were filled first.
    pub log_seq: u64,
    pub used: usize,
    /// Patches in the order they were appended.
    pub patches: Vec<Patch>,
}

/// Reads every occupied log block of the region described by `header`.
pub fn scan_region(io: &dyn FileIo, header: &RegionHeader) -> Result<Vec<LogBlockView>> {
    let block_size = header.config.block_size as usize;
    let mut buf = vec![0u8; block_size];
    let mut views = Vec::new();
    for slot in 0..header.config.log_blocks as usize {
        io.read_at(slot_offset(slot, block_size), &mut buf)?;
        if buf[..LOG_BLOCK_HEADER_LEN].iter().all(|b| *b == 0) {
            continue;
        }
        if buf[0..4] != BLOCK_MAGIC {
            return Err(PatchworkError::Corruption("patch log block magic mismatch"));
        }
        if be::get_u16(&buf, 4) != FORMAT_VERSION {
            return Err(PatchworkError::Corruption("patch log block version mismatch"));
        }
        let log_seq = be::get_u64(&buf, 8);
        let used = be::get_u32(&buf, 16) as usize;
        if LOG_BLOCK_HEADER_LEN + used > block_size {
            return Err(PatchworkError::Corruption("patch log block used out of range"));
        }
        let stored_crc = be::get_u32(&buf, 20);
        be::put_u32(&mut buf, 20, 0);
        let payload_end = LOG_BLOCK_HEADER_LEN + used;
        if block_crc32(slot as u64, header.salt, &[&buf[..payload_end]]) != stored_crc {
            return Err(PatchworkError::Corruption("patch log block crc mismatch"));
        }
        let mut patches = Vec::new();
        let mut off = LOG_BLOCK_HEADER_LEN;
        while off < payload_end {
            let (patch, len) = Patch::decode(&buf[off..payload_end])?;
            patches.push(patch);
            off += len;
        }
        views.push(LogBlockView {
            slot,
            log_seq,
            used,
            patches,
        });
    }
    Ok(views)
}

fn slot_offset(slot: usize, block_size: usize) -> u64 {
    ((slot + 1) * block_size) as u64
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SlotState {
    Free,
    Active,
    Sealed,
    /// Reclaimed, waiting for the cycle that folded its patches to become durable.
    PendingFree,
}

#[derive(Debug)]
struct LogSlot {
    state: SlotState,
    log_seq: u64,
    entries: Vec<(BlockId, BlockSeq)>,
    /// Header plus payload; present while active or not yet flushed.
    buf: Option<Vec<u8>>,
    used: usize,
    dirty: bool,
}

impl LogSlot {
    fn free() -> Self {
        Self {
            state: SlotState::Free,
            log_seq: 0,
            entries: Vec::new(),
            buf: None,
            used: 0,
            dirty: false,
        }
    }
}

/// Callbacks the log uses while reclaiming blocks that still hold live patches.
pub trait ReclaimHost {
    /// Whether patches of `block` written against `seq` are still needed.
    fn is_live(&self, block: BlockId, seq: BlockSeq) -> bool;
    /// Forces a full write of `block` so its logged patches become obsolete.
    fn fold(&mut self, block: BlockId) -> Result<()>;
}

/// Log blocks reclaimed in one call and the blocks folded to free them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReclaimOutcome {
    /// Log blocks now pending free.
    pub slots: Vec<usize>,
    /// Blocks forced to a full write.
    pub folded: Vec<BlockId>,
}

impl ReclaimOutcome {
    /// Accumulates another outcome into this one.
    pub fn merge(&mut self, other: ReclaimOutcome) {
        self.slots.extend(other.slots);
        self.folded.extend(other.folded);
    }
}

/// Occupancy counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PatchLogStats {
    /// Log blocks in the region.
    pub log_blocks: usize,
    /// Log blocks ready for new patches.
    pub free: usize,
    /// Log blocks holding patches.
    pub occupied: usize,
    /// Reclaimed log blocks waiting for their cycle to be durable.
    pub pending_free: usize,
    /// Payload bytes across occupied log blocks.
    pub bytes_used: usize,
    /// Patches that did not fit.
    pub store_failures: u64,
}

/// Bounded, reusable on-disk patch log.
pub struct PatchLog {
    io: Arc<dyn FileIo>,
    header: RegionHeader,
    slots: Vec<LogSlot>,
    free: VecDeque<usize>,
    active: Option<usize>,
    next_log_seq: u64,
    store_failures: u64,
}

impl PatchLog {
    /// Opens the region, creating and preallocating it when empty.
    pub fn open(io: Arc<dyn FileIo>, config: LogConfig) -> Result<Self> {
        let block_size = config.block_size as usize;
        if block_size < REGION_HEADER_LEN.max(LOG_BLOCK_HEADER_LEN + super::PATCH_HEADER_LEN) {
            return Err(PatchworkError::Invalid("patch log block size too small"));
        }
        if config.log_blocks == 0 {
            return Err(PatchworkError::Invalid("patch log needs at least one block"));
        }
        let header = if io.len()? == 0 {
            let header = RegionHeader {
                config,
                salt: rand::random::<u64>(),
            };
            let total = (config.log_blocks as u64 + 1) * config.block_size as u64;
            io.set_len(total)?;
            io.write_at(0, &header.encode())?;
            io.sync_all()?;
            debug!(
                block_size = config.block_size,
                log_blocks = config.log_blocks,
                "patch_log.create"
            );
            header
        } else {
            let header = read_region_header(io.as_ref())?;
            if header.config != config {
                return Err(PatchworkError::InvalidOwned(format!(
                    "patch log was created with {:?}, opened with {:?}",
                    header.config, config
                )));
            }
            header
        };
        let slots = (0..config.log_blocks).map(|_| LogSlot::free()).collect();
        Ok(Self {
            io,
            header,
            slots,
            free: (0..config.log_blocks as usize).collect(),
            active: None,
            next_log_seq: 1,
            store_failures: 0,
        })
    }

    /// Geometry of the open region.
    pub fn config(&self) -> LogConfig {
        self.header.config
    }

    fn block_size(&self) -> usize {
        self.header.config.block_size as usize
    }

    fn capacity(&self) -> usize {
        self.block_size() - LOG_BLOCK_HEADER_LEN
    }

    /// Loads every logged patch, oldest log block first, and rebuilds the slot table.
    pub fn recover(&mut self) -> Result<Vec<Patch>> {
        let mut views = scan_region(self.io.as_ref(), &self.header)?;
        views.sort_by_key(|view| view.log_seq);
        let mut patches = Vec::new();
        self.free.clear();
        self.active = None;
        for slot in &mut self.slots {
            *slot = LogSlot::free();
        }
        for view in views {
            let slot = &mut self.slots[view.slot];
            slot.state = SlotState::Sealed;
            slot.log_seq = view.log_seq;
            slot.used = view.used;
            slot.entries = view
                .patches
                .iter()
                .map(|p| (p.block_id, p.block_seq))
                .collect();
            self.next_log_seq = self.next_log_seq.max(view.log_seq + 1);
            patches.extend(view.patches);
        }
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.state == SlotState::Free {
                self.free.push_back(idx);
            }
        }
        debug!(
            patches = patches.len(),
            occupied = self.slots.len() - self.free.len(),
            "patch_log.recover"
        );
        Ok(patches)
    }

    /// Highest block sequence id referenced by any logged patch.
    pub fn max_block_seq(&self) -> BlockSeq {
        self.slots
            .iter()
            .flat_map(|slot| slot.entries.iter().map(|(_, seq)| *seq))
            .max()
            .unwrap_or_default()
    }

    /// Appends `patch`; returns false when no log block has room for it.
    pub fn store(&mut self, patch: &Patch) -> bool {
        let mut encoded = Vec::with_capacity(patch.serialized_size());
        if patch.encode(&mut encoded).is_err() {
            self.store_failures += 1;
            warn!(block = %patch.block_id, "patch_log.store.unencodable");
            return false;
        }
        let size = encoded.len();
        if size > self.capacity() {
            self.store_failures += 1;
            return false;
        }
        let fits = self
            .active
            .map(|idx| self.slots[idx].used + size <= self.capacity())
            .unwrap_or(false);
        if !fits {
            if let Some(idx) = self.active.take() {
                let slot = &mut self.slots[idx];
                slot.state = SlotState::Sealed;
                if !slot.dirty {
                    slot.buf = None;
                }
            }
            let Some(idx) = self.free.pop_front() else {
                self.store_failures += 1;
                warn!(
                    block = %patch.block_id,
                    failures = self.store_failures,
                    "patch_log.store.full"
                );
                return false;
            };
            let block_size = self.block_size();
            let slot = &mut self.slots[idx];
            slot.state = SlotState::Active;
            slot.log_seq = self.next_log_seq;
            slot.entries.clear();
            slot.used = 0;
            slot.buf = Some(vec![0u8; block_size]);
            self.next_log_seq += 1;
            self.active = Some(idx);
        }
        let Some(idx) = self.active else {
            return false;
        };
        let slot = &mut self.slots[idx];
        let Some(buf) = slot.buf.as_mut() else {
            return false;
        };
        let start = LOG_BLOCK_HEADER_LEN + slot.used;
        buf[start..start + size].copy_from_slice(&encoded);
        slot.used += size;
        slot.entries.push((patch.block_id, patch.block_seq));
        slot.dirty = true;
        true
    }

    /// Writes every dirty log block and syncs the region.
    pub fn flush(&mut self) -> Result<()> {
        let salt = self.header.salt;
        let block_size = self.block_size();
        let mut written = 0usize;
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if !slot.dirty {
                continue;
            }
            let Some(buf) = slot.buf.as_mut() else {
                slot.dirty = false;
                continue;
            };
            buf[0..4].copy_from_slice(&BLOCK_MAGIC);
            be::put_u16(buf, 4, FORMAT_VERSION);
            buf[6..8].fill(0);
            be::put_u64(buf, 8, slot.log_seq);
            be::put_u32(buf, 16, slot.used as u32);
            be::put_u32(buf, 20, 0);
            let payload_end = LOG_BLOCK_HEADER_LEN + slot.used;
            let crc = block_crc32(idx as u64, salt, &[&buf[..payload_end]]);
            be::put_u32(buf, 20, crc);
            self.io.write_at(slot_offset(idx, block_size), buf)?;
            slot.dirty = false;
            if slot.state != SlotState::Active {
                slot.buf = None;
            }
            written += 1;
        }
        if written > 0 {
            self.io.sync_all()?;
            debug!(blocks = written, "patch_log.flush");
        }
        Ok(())
    }

    fn occupied_by_age(&self) -> Vec<usize> {
        let mut occupied: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot.state, SlotState::Active | SlotState::Sealed))
            .map(|(idx, _)| idx)
            .collect();
        occupied.sort_by_key(|idx| self.slots[*idx].log_seq);
        occupied
    }

    /// Reclaims the `n` oldest occupied log blocks.
    ///
    /// Blocks still referenced by live patches are folded through `host`
    /// first. Reclaimed log blocks stay pending until [`PatchLog::release`].
    pub fn reclaim_oldest(&mut self, n: usize, host: &mut dyn ReclaimHost) -> Result<ReclaimOutcome> {
        let mut outcome = ReclaimOutcome::default();
        for idx in self.occupied_by_age().into_iter().take(n) {
            let mut entries = std::mem::take(&mut self.slots[idx].entries);
            entries.sort_unstable();
            entries.dedup();
            for (block, seq) in entries {
                if host.is_live(block, seq) && !outcome.folded.contains(&block) {
                    host.fold(block)?;
                    outcome.folded.push(block);
                }
            }
            if self.active == Some(idx) {
                self.active = None;
            }
            let slot = &mut self.slots[idx];
            slot.state = SlotState::PendingFree;
            slot.buf = None;
            slot.dirty = false;
            slot.used = 0;
            outcome.slots.push(idx);
        }
        if !outcome.slots.is_empty() {
            debug!(
                slots = outcome.slots.len(),
                folded = outcome.folded.len(),
                "patch_log.reclaim"
            );
        }
        Ok(outcome)
    }

    /// Reclaims oldest blocks until at least `n` blocks are free or pending free.
    pub fn compact_oldest(&mut self, n: usize, host: &mut dyn ReclaimHost) -> Result<ReclaimOutcome> {
        let target = n.min(self.slots.len());
        let mut outcome = ReclaimOutcome::default();
        loop {
            let available = self.free.len() + self.pending_count();
            if available >= target || self.occupied_by_age().is_empty() {
                break;
            }
            outcome.merge(self.reclaim_oldest(target - available, host)?);
        }
        Ok(outcome)
    }

    fn pending_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state == SlotState::PendingFree)
            .count()
    }

    /// Returns reclaimed log blocks to the free list.
    pub fn release(&mut self, slots: &[usize]) {
        for &idx in slots {
            if let Some(slot) = self.slots.get_mut(idx) {
                if slot.state == SlotState::PendingFree {
                    *slot = LogSlot::free();
                    self.free.push_back(idx);
                }
            }
        }
    }

    /// Current occupancy.
    pub fn stats(&self) -> PatchLogStats {
        let mut stats = PatchLogStats {
            log_blocks: self.slots.len(),
            store_failures: self.store_failures,
            ..PatchLogStats::default()
        };
        for slot in &self.slots {
            match slot.state {
                SlotState::Free => stats.free += 1,
                SlotState::Active | SlotState::Sealed => {
                    stats.occupied += 1;
                    stats.bytes_used += slot.used;
                }
                SlotState::PendingFree => stats.pending_free += 1,
            }
        }
        stats
    }
}
