#![forbid(unsafe_code)]

/// CRC32 of a stored block, bound to its slot index and the region salt so a
/// block copied into the wrong slot or another region fails validation.
pub fn block_crc32(slot: u64, salt: u64, chunks: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&slot.to_be_bytes());
    hasher.update(&salt.to_be_bytes());
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize()
}
