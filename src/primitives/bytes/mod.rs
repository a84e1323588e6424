#![forbid(unsafe_code)]
//! Fixed-width big-endian encoding and a checked read cursor for wire formats.

pub mod be {
    //! Big-endian put helpers that append to a growing buffer or write in place.

    /// Appends a big-endian u16.
    pub fn push_u16(dst: &mut Vec<u8>, v: u16) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends a big-endian u32.
    pub fn push_u32(dst: &mut Vec<u8>, v: u32) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends a big-endian u64.
    pub fn push_u64(dst: &mut Vec<u8>, v: u64) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Writes a big-endian u16 at `off`.
    pub fn put_u16(dst: &mut [u8], off: usize, v: u16) {
        dst[off..off + 2].copy_from_slice(&v.to_be_bytes());
    }

    /// Writes a big-endian u32 at `off`.
    pub fn put_u32(dst: &mut [u8], off: usize, v: u32) {
        dst[off..off + 4].copy_from_slice(&v.to_be_bytes());
    }

    /// Writes a big-endian u64 at `off`.
    pub fn put_u64(dst: &mut [u8], off: usize, v: u64) {
        dst[off..off + 8].copy_from_slice(&v.to_be_bytes());
    }

    /// Reads a big-endian u16 at `off`; the caller guarantees the range is in bounds.
    pub fn get_u16(src: &[u8], off: usize) -> u16 {
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(&src[off..off + 2]);
        u16::from_be_bytes(bytes)
    }

    /// Reads a big-endian u32 at `off`; the caller guarantees the range is in bounds.
    pub fn get_u32(src: &[u8], off: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&src[off..off + 4]);
        u32::from_be_bytes(bytes)
    }

    /// Reads a big-endian u64 at `off`; the caller guarantees the range is in bounds.
    pub fn get_u64(src: &[u8], off: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&src[off..off + 8]);
        u64::from_be_bytes(bytes)
    }
}

pub mod buf {
    //! A slice-backed cursor that reports overreads as corruption.

    use core::fmt;

    use crate::types::{PatchworkError, Result};

    /// A cursor for reading bytes from a slice with offset tracking.
    pub struct Cursor<'a> {
        buf: &'a [u8],
        off: usize,
    }

    impl<'a> Cursor<'a> {
        /// Creates a new cursor starting at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Takes the next `n` bytes, failing with `what` if the slice is too short.
        pub fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .ok_or(PatchworkError::Corruption(what))?;
            if end > self.buf.len() {
                return Err(PatchworkError::Corruption(what));
            }
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        /// Reads one byte.
        pub fn u8(&mut self, what: &'static str) -> Result<u8> {
            Ok(self.take(1, what)?[0])
        }

        /// Reads a big-endian u16.
        pub fn u16(&mut self, what: &'static str) -> Result<u16> {
            Ok(super::be::get_u16(self.take(2, what)?, 0))
        }

        /// Reads a big-endian u32.
        pub fn u32(&mut self, what: &'static str) -> Result<u32> {
            Ok(super::be::get_u32(self.take(4, what)?, 0))
        }

        /// Reads a big-endian u64.
        pub fn u64(&mut self, what: &'static str) -> Result<u64> {
            Ok(super::be::get_u64(self.take(8, what)?, 0))
        }

        /// Current read offset.
        pub fn position(&self) -> usize {
            self.off
        }

        /// Returns the number of bytes remaining in the buffer.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }
    }

    impl<'a> fmt::Debug for Cursor<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Cursor")
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }
}
