#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::cache::BlockHandle;
use crate::types::{BlockId, BlockSeq, PatchCounter};

/// Write-back bookkeeping for one cached block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirtyEntry {
    /// Cache slot holding the block's buffer.
    pub handle: BlockHandle,
    /// Base version the block's pending patches apply on top of.
    pub block_seq: BlockSeq,
    /// Counter of the newest patch created against `block_seq`.
    pub patch_counter: PatchCounter,
    /// Counter of the newest patch persisted in the patch log.
    pub last_materialized: PatchCounter,
    /// Content changed since the last cycle collected the block.
    pub dirty: bool,
    /// Recency changed since the last cycle collected the block.
    pub recency_dirty: bool,
    /// The next write of this block must be a full write.
    pub needs_full_flush: bool,
    /// A full write of this block has been submitted but not placed.
    pub pending_write: bool,
}

impl DirtyEntry {
    /// Entry for a block loaded from storage whose catalog ends at `counter`.
    pub fn clean(handle: BlockHandle, block_seq: BlockSeq, counter: PatchCounter) -> Self {
        Self {
            handle,
            block_seq,
            patch_counter: counter,
            last_materialized: counter,
            dirty: false,
            recency_dirty: false,
            needs_full_flush: false,
            pending_write: false,
        }
    }

    /// Entry for a freshly created block; its first write is a full one.
    pub fn created(handle: BlockHandle, block_seq: BlockSeq) -> Self {
        Self {
            dirty: true,
            needs_full_flush: true,
            ..Self::clean(handle, block_seq, PatchCounter(0))
        }
    }

    /// Nothing pending; the block may be evicted.
    pub fn is_clean(&self) -> bool {
        !(self.dirty || self.recency_dirty || self.needs_full_flush || self.pending_write)
    }
}

/// Per-block flags plus the ordered set of blocks awaiting write-back.
///
/// A block is in the dirty set iff its entry is dirty or recency-dirty.
#[derive(Debug, Default)]
pub struct DirtyTracker {
    entries: FxHashMap<BlockId, DirtyEntry>,
    dirty_set: BTreeSet<BlockId>,
    tombstones: BTreeMap<BlockId, bool>,
    readahead_reject: FxHashSet<BlockId>,
}

impl DirtyTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `id`, replacing any previous entry.
    pub fn track(&mut self, id: BlockId, entry: DirtyEntry) {
        self.entries.insert(id, entry);
        self.sync_membership(id);
    }

    /// Forgets the block and removes it from the dirty set.
    pub fn untrack(&mut self, id: BlockId) -> Option<DirtyEntry> {
        self.dirty_set.remove(&id);
        self.entries.remove(&id)
    }

    /// Entry of a tracked block.
    pub fn get(&self, id: BlockId) -> Option<&DirtyEntry> {
        self.entries.get(&id)
    }

    /// Mutable access; callers must follow up with [`DirtyTracker::sync_membership`]
    /// after changing the dirty flags.
    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut DirtyEntry> {
        self.entries.get_mut(&id)
    }

    /// Brings dirty-set membership in line with the entry's flags.
    pub fn sync_membership(&mut self, id: BlockId) {
        match self.entries.get(&id) {
            Some(entry) if entry.dirty || entry.recency_dirty => {
                self.dirty_set.insert(id);
            }
            _ => {
                self.dirty_set.remove(&id);
            }
        }
    }

    /// Marks content dirty; returns true if the block just joined the dirty set.
    pub fn set_dirty(&mut self, id: BlockId) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        entry.dirty = true;
        self.dirty_set.insert(id)
    }

    /// Marks the recency stamp dirty; returns true if the block just joined the dirty set.
    pub fn set_recency_dirty(&mut self, id: BlockId) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        entry.recency_dirty = true;
        self.dirty_set.insert(id)
    }

    /// Flags the block for a full write on the next cycle.
    pub fn set_needs_full_flush(&mut self, id: BlockId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.needs_full_flush = true;
            entry.dirty = true;
            self.dirty_set.insert(id);
        }
    }

    /// Forgets the block and queues a tombstone for the next cycle.
    ///
    /// Read-ahead copies of the block are rejected until the tombstone is placed.
    pub fn mark_deleted(&mut self, id: BlockId, write_zeroed: bool) -> Option<DirtyEntry> {
        let entry = self.untrack(id);
        let zeroed = self.tombstones.entry(id).or_insert(false);
        *zeroed |= write_zeroed;
        self.readahead_reject.insert(id);
        entry
    }

    /// Drops a queued tombstone when the block is created again before it was written.
    pub fn cancel_tombstone(&mut self, id: BlockId) -> bool {
        if self.tombstones.remove(&id).is_some() {
            self.readahead_reject.remove(&id);
            true
        } else {
            false
        }
    }

    /// Drains the queued tombstones with their zeroing flags.
    pub fn take_tombstones(&mut self) -> Vec<(BlockId, bool)> {
        std::mem::take(&mut self.tombstones).into_iter().collect()
    }

    /// Clears the read-ahead rejection once a tombstone is placed.
    pub fn tombstone_placed(&mut self, id: BlockId) {
        if !self.tombstones.contains_key(&id) {
            self.readahead_reject.remove(&id);
        }
    }

    /// Whether read-ahead copies of `id` must be refused.
    pub fn rejects_readahead(&self, id: BlockId) -> bool {
        self.readahead_reject.contains(&id)
    }

    /// Dirty blocks in id order.
    pub fn dirty_ids(&self) -> Vec<BlockId> {
        self.dirty_set.iter().copied().collect()
    }

    /// Blocks in the dirty set plus queued tombstones.
    pub fn dirty_count(&self) -> usize {
        self.dirty_set.len() + self.tombstones.len()
    }

    /// Whether a cycle would have anything to write.
    pub fn has_work(&self) -> bool {
        !self.dirty_set.is_empty() || !self.tombstones.is_empty()
    }

    /// Number of tracked blocks.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}
