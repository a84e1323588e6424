#![forbid(unsafe_code)]
//! Buffer table owning the in-memory copies of cached blocks.
//!
//! Write-back bookkeeping never owns block memory; it holds a
//! [`BlockHandle`] whose generation is checked on every use, so a handle to
//! an evicted block fails instead of aliasing the slot's next occupant.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::patch::PatchCatalog;
use crate::store::ReadSnapshot;
use crate::types::{BlockId, BlockSeq, PatchworkError, Recency, Result};

/// Shared, lockable block contents.
pub type BlockBuf = Arc<RwLock<Box<[u8]>>>;

/// Generation-checked reference to a cache slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct CachedBlock {
    id: BlockId,
    data: BlockBuf,
    recency: Recency,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    block: Option<CachedBlock>,
}

/// Arena of cached block buffers indexed by block id.
#[derive(Debug)]
pub struct BlockCache {
    block_size: usize,
    slots: Vec<Slot>,
    free: Vec<u32>,
    index: FxHashMap<BlockId, BlockHandle>,
}

impl BlockCache {
    /// Creates an empty cache for blocks of `block_size` bytes.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            slots: Vec::new(),
            free: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    /// Number of cached blocks.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns true if no block is cached.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Handle of `id` if it is cached.
    pub fn lookup(&self, id: BlockId) -> Option<BlockHandle> {
        self.index.get(&id).copied()
    }

    /// Adds a block; fails if it is already cached or has the wrong size.
    pub fn insert(&mut self, id: BlockId, data: Box<[u8]>, recency: Recency) -> Result<BlockHandle> {
        if data.len() != self.block_size {
            return Err(PatchworkError::Invalid("cached block has wrong size"));
        }
        if self.index.contains_key(&id) {
            return Err(PatchworkError::InvalidOwned(format!(
                "block {id} already cached"
            )));
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.block = Some(CachedBlock {
            id,
            data: Arc::new(RwLock::new(data)),
            recency,
        });
        let handle = BlockHandle {
            index,
            generation: slot.generation,
        };
        self.index.insert(id, handle);
        Ok(handle)
    }

    fn get(&self, handle: BlockHandle) -> Result<&CachedBlock> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.block.as_ref())
            .ok_or(PatchworkError::NotFound)
    }

    /// Shared buffer of a cached block.
    pub fn buffer(&self, handle: BlockHandle) -> Result<BlockBuf> {
        Ok(Arc::clone(&self.get(handle)?.data))
    }

    /// Block id behind `handle`.
    pub fn id_of(&self, handle: BlockHandle) -> Result<BlockId> {
        Ok(self.get(handle)?.id)
    }

    /// Recency stamp of a cached block.
    pub fn recency(&self, handle: BlockHandle) -> Result<Recency> {
        Ok(self.get(handle)?.recency)
    }

    /// Updates the recency stamp written by the next touch.
    pub fn set_recency(&mut self, handle: BlockHandle, recency: Recency) -> Result<()> {
        self.get(handle)?;
        if let Some(block) = self.slots[handle.index as usize].block.as_mut() {
            block.recency = recency;
        }
        Ok(())
    }

    /// Copies the current contents of a cached block.
    pub fn snapshot(&self, handle: BlockHandle) -> Result<Arc<[u8]>> {
        let data = self.buffer(handle)?;
        let guard = data.read();
        Ok(Arc::from(&guard[..]))
    }

    /// Drops a block and invalidates every handle to it.
    pub fn remove(&mut self, handle: BlockHandle) -> Result<BlockId> {
        let id = self.id_of(handle)?;
        let slot = &mut self.slots[handle.index as usize];
        slot.block = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.index.remove(&id);
        Ok(id)
    }
}

/// Base copy of a block rebuilt from storage plus its pending patches.
#[derive(Debug)]
pub struct LoadedBlock {
    /// Block contents with every kept patch applied.
    pub data: Box<[u8]>,
    /// Base version read from storage.
    pub block_seq: BlockSeq,
    /// Stored recency stamp.
    pub recency: Recency,
    /// Whether any patch was applied.
    pub replayed: bool,
}

/// Reads `id` through `snapshot` and replays the catalog on top of it.
///
/// Patches older than the stored version are dropped from the catalog first.
pub fn load_block(
    snapshot: &dyn ReadSnapshot,
    catalog: &mut PatchCatalog,
    id: BlockId,
) -> Result<Option<LoadedBlock>> {
    let Some(stored) = snapshot.read_block(id)? else {
        return Ok(None);
    };
    catalog.filter_before(id, stored.block_seq);
    let mut data: Box<[u8]> = Box::from(&stored.data[..]);
    let replayed = catalog.replay(id, &mut data)?;
    Ok(Some(LoadedBlock {
        data,
        block_seq: stored.block_seq,
        recency: stored.recency,
        replayed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{Patch, PatchOp};
    use crate::store::{BlockStore, BlockWrite, IoPriority, MemBlockStore};
    use crate::types::PatchCounter;

    #[test]
    fn stale_handle_is_rejected() {
        let mut cache = BlockCache::new(8);
        let first = cache
            .insert(BlockId(1), vec![1u8; 8].into_boxed_slice(), Recency(1))
            .unwrap();
        assert_eq!(cache.id_of(first).unwrap(), BlockId(1));
        cache.remove(first).unwrap();
        let second = cache
            .insert(BlockId(2), vec![2u8; 8].into_boxed_slice(), Recency(1))
            .unwrap();
        assert!(matches!(cache.buffer(first), Err(PatchworkError::NotFound)));
        assert_eq!(cache.snapshot(second).unwrap()[0], 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn duplicate_and_wrong_size_inserts_fail() {
        let mut cache = BlockCache::new(8);
        cache
            .insert(BlockId(1), vec![0u8; 8].into_boxed_slice(), Recency(0))
            .unwrap();
        assert!(cache
            .insert(BlockId(1), vec![0u8; 8].into_boxed_slice(), Recency(0))
            .is_err());
        assert!(cache
            .insert(BlockId(2), vec![0u8; 4].into_boxed_slice(), Recency(0))
            .is_err());
    }

    #[test]
    fn load_replays_current_run_only() {
        let store = MemBlockStore::new(8);
        store
            .write(
                vec![BlockWrite::Full {
                    block_id: BlockId(1),
                    block_seq: BlockSeq(2),
                    data: Arc::from(vec![0u8; 8]),
                    recency: Recency(4),
                }],
                IoPriority::Normal,
                Box::new(|_| {}),
                Box::new(|| {}),
            )
            .unwrap();
        let mut catalog = PatchCatalog::new();
        catalog.add(Patch::new(
            BlockId(1),
            BlockSeq(1),
            PatchCounter(1),
            PatchOp::copy(0, &[9]).unwrap(),
        ));
        catalog.add(Patch::new(
            BlockId(1),
            BlockSeq(2),
            PatchCounter(1),
            PatchOp::copy(1, &[7]).unwrap(),
        ));
        let snapshot = store.begin_snapshot().unwrap();
        let loaded = load_block(snapshot.as_ref(), &mut catalog, BlockId(1))
            .unwrap()
            .unwrap();
        assert!(loaded.replayed);
        assert_eq!(&loaded.data[..2], &[0, 7]);
        assert_eq!(loaded.recency, Recency(4));
        assert_eq!(catalog.patches_for(BlockId(1)).len(), 1);
        assert!(load_block(snapshot.as_ref(), &mut catalog, BlockId(5))
            .unwrap()
            .is_none());
    }
}
