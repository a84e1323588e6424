#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use patchwork::primitives::io::{FileIo, StdFileIo};
use patchwork::store::BlockStore;
use patchwork::{
    BlockId, FileBlockStore, PatchOp, PatchworkError, Recency, Result, Writeback, WritebackOptions,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

const BLOCK: usize = 256;

fn options() -> WritebackOptions {
    WritebackOptions {
        block_size: BLOCK,
        flush_interval_ms: None,
        patch_log_blocks: 4,
        ..WritebackOptions::default()
    }
}

fn open_at(dir: &Path, options: WritebackOptions) -> Result<Writeback> {
    let store = FileBlockStore::open(dir.join("blocks.db"), options.block_size)?;
    let log = StdFileIo::open(dir.join("patches.log"))?;
    Writeback::open(Arc::new(store), Arc::new(log), options)
}

#[test]
fn unsynced_changes_are_lost_synced_ones_replay() -> Result<()> {
    let dir = tempdir()?;
    {
        let wb = open_at(dir.path(), options())?;
        let mut txn = wb.begin_write_transaction(2)?;
        txn.create_block(BlockId(0))?;
        txn.create_block(BlockId(1))?;
        txn.commit()?;
        wb.sync().wait()?;

        let mut txn = wb.begin_write_transaction(1)?;
        txn.apply_patch(BlockId(1), PatchOp::copy(10, b"durable")?)?;
        txn.commit()?;
        wb.sync().wait()?;

        let mut txn = wb.begin_write_transaction(1)?;
        txn.apply_patch(BlockId(1), PatchOp::copy(40, b"volatile")?)?;
        txn.commit()?;
    }
    let wb = open_at(dir.path(), options())?;
    let data = wb.read_block(BlockId(1))?;
    assert_eq!(&data[10..17], b"durable");
    assert!(data[40..48].iter().all(|b| *b == 0));
    assert!(wb.stats().catalog_bytes > 0);
    Ok(())
}

#[test]
fn patches_older_than_the_stored_version_are_dropped() -> Result<()> {
    let dir = tempdir()?;
    {
        let wb = open_at(dir.path(), options())?;
        let mut txn = wb.begin_write_transaction(1)?;
        txn.create_block(BlockId(2))?;
        txn.commit()?;
        wb.sync().wait()?;

        let mut txn = wb.begin_write_transaction(1)?;
        txn.apply_patch(BlockId(2), PatchOp::copy(0, b"stale")?)?;
        txn.commit()?;
        wb.sync().wait()?;

        let mut txn = wb.begin_write_transaction(1)?;
        txn.rewrite(BlockId(2), |buf| {
            buf.fill(0);
            buf[0..5].copy_from_slice(b"fresh");
            Ok(())
        })?;
        txn.commit()?;
        wb.sync().wait()?;
    }
    let wb = open_at(dir.path(), options())?;
    assert_eq!(wb.stats().catalog_bytes, 0);
    assert_eq!(&wb.read_block(BlockId(2))?[0..5], b"fresh");
    Ok(())
}

#[test]
fn block_sequence_resumes_above_everything_on_disk() -> Result<()> {
    let dir = tempdir()?;
    let before = {
        let wb = open_at(dir.path(), options())?;
        let mut txn = wb.begin_write_transaction(3)?;
        for id in 0..3 {
            txn.create_block(BlockId(id))?;
        }
        txn.commit()?;
        wb.sync().wait()?;
        wb.stats().next_block_seq
    };
    let store = FileBlockStore::open(dir.path().join("blocks.db"), BLOCK)?;
    let max = store.max_block_seq()?;
    assert!(max.0 < before);
    let wb = open_at(dir.path(), options())?;
    assert_eq!(wb.stats().next_block_seq, max.0 + 1);
    Ok(())
}

#[test]
fn deleted_blocks_stay_deleted_after_reopen() -> Result<()> {
    let dir = tempdir()?;
    {
        let wb = open_at(dir.path(), options())?;
        let mut txn = wb.begin_write_transaction(1)?;
        txn.create_block(BlockId(5))?;
        txn.commit()?;
        wb.sync().wait()?;
        let mut txn = wb.begin_write_transaction(1)?;
        txn.apply_patch(BlockId(5), PatchOp::copy(0, b"gone")?)?;
        txn.commit()?;
        wb.sync().wait()?;
        let mut txn = wb.begin_write_transaction(1)?;
        txn.delete_block(BlockId(5), true)?;
        txn.commit()?;
        wb.sync().wait()?;
        assert_eq!(wb.stats().tombstones, 1);
    }
    let wb = open_at(dir.path(), options())?;
    assert!(matches!(
        wb.read_block(BlockId(5)),
        Err(PatchworkError::NotFound)
    ));
    assert_eq!(wb.stats().catalog_bytes, 0);
    Ok(())
}

#[test]
fn reopening_with_a_different_geometry_fails() -> Result<()> {
    let dir = tempdir()?;
    drop(open_at(dir.path(), options())?);
    let other = WritebackOptions {
        patch_log_blocks: 8,
        ..options()
    };
    assert!(matches!(
        open_at(dir.path(), other),
        Err(PatchworkError::InvalidOwned(_))
    ));
    Ok(())
}

#[test]
fn corrupted_log_block_is_reported() -> Result<()> {
    let dir = tempdir()?;
    {
        let wb = open_at(dir.path(), options())?;
        let mut txn = wb.begin_write_transaction(1)?;
        txn.create_block(BlockId(0))?;
        txn.commit()?;
        wb.sync().wait()?;
        let mut txn = wb.begin_write_transaction(1)?;
        txn.apply_patch(BlockId(0), PatchOp::copy(0, &[1u8; 16])?)?;
        txn.commit()?;
        wb.sync().wait()?;
    }
    let log = StdFileIo::open(dir.path().join("patches.log"))?;
    let offset = (BLOCK + 30) as u64;
    let mut byte = [0u8; 1];
    log.read_at(offset, &mut byte)?;
    byte[0] ^= 0xFF;
    log.write_at(offset, &byte)?;
    log.sync_all()?;
    assert!(matches!(
        open_at(dir.path(), options()),
        Err(PatchworkError::Corruption(_))
    ));
    Ok(())
}

#[test]
fn random_workload_matches_model_across_reopens() -> Result<()> {
    for seed in [7u64, 1234, 0xC0FFEE] {
        let dir = tempdir()?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let blocks = 6u64;
        let mut model = vec![vec![0u8; BLOCK]; blocks as usize];
        let mut wb = open_at(dir.path(), options())?;
        {
            let mut txn = wb.begin_write_transaction(blocks as usize)?;
            for id in 0..blocks {
                txn.create_block(BlockId(id))?;
            }
            txn.commit()?;
        }
        for step in 0..300 {
            let id = rng.gen_range(0..blocks);
            let block = &mut model[id as usize];
            let mut txn = wb.begin_write_transaction(1)?;
            match rng.gen_range(0..10) {
                0..=4 => {
                    let len = rng.gen_range(1..=32usize);
                    let dest = rng.gen_range(0..=BLOCK - len);
                    let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                    block[dest..dest + len].copy_from_slice(&data);
                    txn.apply_patch(BlockId(id), PatchOp::copy(dest as u16, &data)?)?;
                }
                5 | 6 => {
                    let len = rng.gen_range(1..=64usize);
                    let src = rng.gen_range(0..=BLOCK - len);
                    let dest = rng.gen_range(0..=BLOCK - len);
                    block.copy_within(src..src + len, dest);
                    txn.apply_patch(
                        BlockId(id),
                        PatchOp::move_bytes(dest as u16, src as u16, len as u16),
                    )?;
                }
                7 => {
                    let value: u8 = rng.gen();
                    block.fill(value);
                    txn.rewrite(BlockId(id), |buf| {
                        buf.fill(value);
                        Ok(())
                    })?;
                }
                8 => txn.touch(BlockId(id), Recency(step))?,
                _ => {
                    txn.commit()?;
                    wb.sync().wait()?;
                    continue;
                }
            }
            txn.commit()?;
            if step % 60 == 59 {
                wb.sync().wait()?;
                drop(wb);
                wb = open_at(dir.path(), options())?;
                for (id, expected) in model.iter().enumerate() {
                    assert_eq!(
                        &wb.read_block(BlockId(id as u64))?,
                        expected,
                        "seed {seed} step {step} block {id}"
                    );
                }
            }
        }
    }
    Ok(())
}
