//! Patch-based write-back for a block cache.
//!
//! Small in-place mutations of cached blocks are recorded as patches and
//! persisted to a bounded on-disk patch log instead of rewriting whole
//! blocks. Flush cycles decide per block whether to log patches or write
//! the block in full, and hand write batches to a pluggable [`BlockStore`].
//! On restart, logged patches newer than each stored block are replayed.

#![warn(missing_docs)]

pub mod cache;
pub mod logging;
pub mod patch;
pub mod primitives;
pub mod store;
pub mod types;
pub mod writeback;

pub use patch::{Patch, PatchCatalog, PatchLog, PatchOp};
pub use store::{BlockStore, FileBlockStore, IoPriority, MemBlockStore, StoredBlock};
pub use types::{BlockId, BlockSeq, PatchCounter, PatchworkError, Recency, Result, Timestamp};
pub use writeback::{
    FlushTimer, SyncTicket, WriteTxn, Writeback, WritebackOptions, WritebackStats,
};
