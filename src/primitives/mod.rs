//! Low-level primitives shared by the patch, store, and write-back layers.
//!
//! Includes big-endian byte helpers, positional I/O, and the drain lock and
//! completion tickets used to coordinate writers with flush cycles.

/// Byte-level encoding helpers and a checked read cursor.
pub mod bytes;

/// Drain lock and completion tickets.
pub mod concurrency;

/// Positional file I/O abstractions.
pub mod io;
