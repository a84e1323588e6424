#![forbid(unsafe_code)]
//! Identifiers, error types, and checksums shared by every layer.

use std::fmt;
use std::io;

mod checksum;

pub use checksum::block_crc32;

/// Identifier of a fixed-size block managed by the cache.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct BlockId(pub u64);

/// Version of a block's base copy; patches are tagged with the version they apply on top of.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct BlockSeq(pub u64);

/// Position of a patch inside one sequence run (first patch is 1).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PatchCounter(pub u32);

/// Logical timestamp stored in leaf blocks and leaf-removal patches.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Timestamp(pub u64);

/// Access-recency stamp recorded for a block by the storage layer.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Recency(pub u64);

impl BlockSeq {
    /// Returns the following sequence id.
    pub fn next(self) -> Self {
        BlockSeq(self.0 + 1)
    }
}

impl PatchCounter {
    /// Returns the following counter value.
    pub fn next(self) -> Self {
        PatchCounter(self.0 + 1)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PatchCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BlockId {
    fn from(value: u64) -> Self {
        BlockId(value)
    }
}

/// Errors surfaced by the write-back subsystem.
#[derive(thiserror::Error, Debug)]
pub enum PatchworkError {
    /// Underlying file or device failure.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// On-disk or in-memory data failed validation; never retried.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Invalid argument with a formatted description.
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// Configuration could not be parsed or failed validation.
    #[error("config: {0}")]
    Config(String),
    /// Requested block is not present.
    #[error("not found")]
    NotFound,
    /// The coordinator is shutting down and no longer schedules syncs.
    #[error("write-back is shutting down")]
    ShuttingDown,
    /// An earlier fatal failure stopped the coordinator.
    #[error("write-back poisoned: {0}")]
    Poisoned(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PatchworkError>;

/// Duplicates an error so it can be delivered to several waiters.
pub fn clone_error(err: &PatchworkError) -> PatchworkError {
    match err {
        PatchworkError::Io(io_err) => {
            PatchworkError::Io(io::Error::new(io_err.kind(), io_err.to_string()))
        }
        PatchworkError::Corruption(msg) => PatchworkError::Corruption(msg),
        PatchworkError::Invalid(msg) => PatchworkError::Invalid(msg),
        PatchworkError::InvalidOwned(msg) => PatchworkError::InvalidOwned(msg.clone()),
        PatchworkError::Config(msg) => PatchworkError::Config(msg.clone()),
        PatchworkError::NotFound => PatchworkError::NotFound,
        PatchworkError::ShuttingDown => PatchworkError::ShuttingDown,
        PatchworkError::Poisoned(msg) => PatchworkError::Poisoned(msg.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_error_preserves_io_kind() {
        let err = PatchworkError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "short"));
        match clone_error(&err) {
            PatchworkError::Io(inner) => assert_eq!(inner.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn seq_and_counter_advance() {
        assert_eq!(BlockSeq(4).next(), BlockSeq(5));
        assert_eq!(PatchCounter(0).next(), PatchCounter(1));
    }
}
