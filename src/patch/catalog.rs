#![forbid(unsafe_code)]

use rustc_hash::FxHashMap;

use super::Patch;
use crate::types::{BlockId, BlockSeq, PatchCounter, Result};

#[derive(Debug, Default)]
struct CatalogEntry {
    patches: Vec<Patch>,
    serialized_size: usize,
}

/// In-memory, per-block ordered list of pending patches.
///
/// Patches of one block are kept in (sequence id, counter) order, which is
/// also the order they were created in.
#[derive(Debug, Default)]
pub struct PatchCatalog {
    entries: FxHashMap<BlockId, CatalogEntry>,
    total_size: usize,
}

impl PatchCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a patch; it must sort after every patch of its block.
    pub fn add(&mut self, patch: Patch) {
        let size = patch.serialized_size();
        let entry = self.entries.entry(patch.block_id).or_default();
        debug_assert!(entry
            .patches
            .last()
            .map(|last| (last.block_seq, last.counter) < (patch.block_seq, patch.counter))
            .unwrap_or(true));
        entry.serialized_size += size;
        entry.patches.push(patch);
        self.total_size += size;
    }

    /// Drops every patch whose sequence id is below `threshold`.
    pub fn filter_before(&mut self, block: BlockId, threshold: BlockSeq) {
        self.retain(block, |p| p.block_seq >= threshold);
    }

    /// Drops every patch whose sequence id is above `seq`.
    pub fn discard_after(&mut self, block: BlockId, seq: BlockSeq) {
        self.retain(block, |p| p.block_seq <= seq);
    }

    fn retain(&mut self, block: BlockId, keep: impl Fn(&Patch) -> bool) {
        let Some(entry) = self.entries.get_mut(&block) else {
            return;
        };
        let mut removed = 0usize;
        entry.patches.retain(|p| {
            if keep(p) {
                true
            } else {
                removed += p.serialized_size();
                false
            }
        });
        entry.serialized_size -= removed;
        self.total_size -= removed;
        if entry.patches.is_empty() {
            self.entries.remove(&block);
        }
    }

    /// Applies every patch of `block` in order; returns whether any applied.
    pub fn replay(&self, block: BlockId, buf: &mut [u8]) -> Result<bool> {
        let Some(entry) = self.entries.get(&block) else {
            return Ok(false);
        };
        for patch in &entry.patches {
            patch.apply_to_buf(buf)?;
        }
        Ok(!entry.patches.is_empty())
    }

    /// Whether `block` has any pending patch.
    pub fn has_patches(&self, block: BlockId) -> bool {
        self.entries.contains_key(&block)
    }

    /// Whether any patch of `block` was written against base version `seq`.
    pub fn has_run(&self, block: BlockId, seq: BlockSeq) -> bool {
        self.entries
            .get(&block)
            .map(|entry| entry.patches.iter().any(|p| p.block_seq == seq))
            .unwrap_or(false)
    }

    /// Counter of the newest patch of `block`, or 0 when it has none.
    pub fn last_materialized_counter_or_zero(&self, block: BlockId) -> PatchCounter {
        self.entries
            .get(&block)
            .and_then(|entry| entry.patches.last())
            .map(|p| p.counter)
            .unwrap_or_default()
    }

    /// Patches of `block` in replay order.
    pub fn patches_for(&self, block: BlockId) -> &[Patch] {
        self.entries
            .get(&block)
            .map(|entry| entry.patches.as_slice())
            .unwrap_or(&[])
    }

    /// Forgets every patch of `block`.
    pub fn drop_block(&mut self, block: BlockId) {
        if let Some(entry) = self.entries.remove(&block) {
            self.total_size -= entry.serialized_size;
        }
    }

    /// Encoded size of the patches of `block`.
    pub fn serialized_size(&self, block: BlockId) -> usize {
        self.entries
            .get(&block)
            .map(|entry| entry.serialized_size)
            .unwrap_or(0)
    }

    /// Encoded size of every patch in the catalog.
    pub fn total_serialized_size(&self) -> usize {
        self.total_size
    }

    /// Blocks with at least one patch.
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.entries.keys().copied().collect()
    }

    /// Checks ordering of the patches of `block` from `starting_seq` on.
    ///
    /// Sequence ids never decrease and are never below `starting_seq`; within
    /// one sequence id the counters run 1, 2, 3, ... without gaps.
    ///
    /// # Panics
    ///
    /// Panics when the list violates either rule.
    pub fn verify(&self, block: BlockId, starting_seq: BlockSeq) {
        let mut run: Option<(BlockSeq, PatchCounter)> = None;
        for patch in self.patches_for(block) {
            assert!(
                patch.block_seq >= starting_seq,
                "block {block}: patch seq {} below {starting_seq}",
                patch.block_seq
            );
            let expected = match run {
                Some((seq, counter)) if seq == patch.block_seq => counter.next(),
                Some((seq, _)) => {
                    assert!(
                        patch.block_seq > seq,
                        "block {block}: patch seq {} after {seq}",
                        patch.block_seq
                    );
                    PatchCounter(1)
                }
                None => PatchCounter(1),
            };
            assert_eq!(
                patch.counter, expected,
                "block {block}: counter gap in seq {}",
                patch.block_seq
            );
            run = Some((patch.block_seq, patch.counter));
        }
        let sum: usize = self
            .patches_for(block)
            .iter()
            .map(Patch::serialized_size)
            .sum();
        assert_eq!(sum, self.serialized_size(block), "block {block}: size total");
    }
}
