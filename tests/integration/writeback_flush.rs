#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use patchwork::patch::leaf::{self, ValueKind};
use patchwork::patch::LeafKey;
use patchwork::primitives::io::MemFileIo;
use patchwork::{
    BlockId, MemBlockStore, PatchOp, PatchworkError, Recency, Result, Timestamp, Writeback,
    WritebackOptions,
};

const BLOCK: usize = 512;

fn options() -> WritebackOptions {
    WritebackOptions {
        block_size: BLOCK,
        flush_interval_ms: None,
        patch_log_blocks: 8,
        ..WritebackOptions::default()
    }
}

fn open(store: &MemBlockStore, log: &MemFileIo, options: WritebackOptions) -> Result<Writeback> {
    Writeback::open(Arc::new(store.clone()), Arc::new(log.clone()), options)
}

fn create_blocks(wb: &Writeback, ids: impl IntoIterator<Item = u64>) -> Result<()> {
    let ids: Vec<u64> = ids.into_iter().collect();
    let mut txn = wb.begin_write_transaction(ids.len())?;
    for id in ids {
        txn.create_block(BlockId(id))?;
    }
    txn.commit()
}

#[test]
fn patches_reach_the_log_and_replay_after_reopen() -> Result<()> {
    let store = MemBlockStore::new(BLOCK);
    let log = MemFileIo::new();
    let wb = open(&store, &log, options())?;
    create_blocks(&wb, 1..=3)?;
    wb.sync().wait()?;
    assert_eq!(wb.stats().full_writes, 3);

    {
        let mut txn = wb.begin_write_transaction(3)?;
        for id in 1..=3u64 {
            txn.apply_patch(BlockId(id), PatchOp::copy(8, &[id as u8; 16])?)?;
            txn.apply_patch(BlockId(id), PatchOp::move_bytes(100, 8, 16))?;
        }
        txn.commit()?;
    }
    wb.sync().wait()?;
    let stats = wb.stats();
    assert_eq!(stats.full_writes, 3, "patched blocks must not be rewritten");
    assert_eq!(stats.patches_logged, 6);
    assert!(stats.log.occupied >= 1);

    // The store still holds the base versions.
    assert!(store.stored(BlockId(2)).unwrap().data.iter().all(|b| *b == 0));

    let reopened = open(&store, &log, options())?;
    for id in 1..=3u64 {
        let data = reopened.read_block(BlockId(id))?;
        assert_eq!(&data[8..24], &[id as u8; 16]);
        assert_eq!(&data[100..116], &[id as u8; 16]);
    }
    Ok(())
}

#[test]
fn full_patch_log_falls_back_to_full_writes() -> Result<()> {
    let store = MemBlockStore::new(BLOCK);
    let log = MemFileIo::new();
    let opts = WritebackOptions {
        patch_log_blocks: 1,
        initial_patch_ratio: 1,
        ..options()
    };
    let wb = open(&store, &log, opts.clone())?;
    create_blocks(&wb, 1..=8)?;
    wb.sync().wait()?;

    {
        let mut txn = wb.begin_write_transaction(8)?;
        for id in 1..=8u64 {
            txn.apply_patch(BlockId(id), PatchOp::copy(0, &[id as u8; 100])?)?;
        }
        txn.commit()?;
    }
    wb.sync().wait()?;
    let stats = wb.stats();
    // Three 127-byte patches fit in one 488-byte log block.
    assert_eq!(stats.patches_logged, 3);
    assert_eq!(stats.full_writes, 8 + 5);
    assert!(stats.log.store_failures >= 5);
    for id in 4..=8u64 {
        assert_eq!(store.stored(BlockId(id)).unwrap().data[0], id as u8);
    }
    assert_eq!(store.stored(BlockId(1)).unwrap().data[0], 0);

    // The next cycle reclaims the full log block and folds its blocks.
    {
        let mut txn = wb.begin_write_transaction(1)?;
        txn.apply_patch(BlockId(1), PatchOp::copy(200, &[0xAA; 4])?)?;
        txn.commit()?;
    }
    wb.sync().wait()?;
    let stats = wb.stats();
    assert_eq!(stats.full_writes, 8 + 5 + 3);
    assert_eq!(stats.log.free, 1);
    for id in 1..=3u64 {
        assert_eq!(store.stored(BlockId(id)).unwrap().data[0], id as u8);
    }
    assert_eq!(&store.stored(BlockId(1)).unwrap().data[200..204], &[0xAA; 4]);

    let reopened = open(&store, &log, opts)?;
    for id in 1..=8u64 {
        assert_eq!(reopened.read_block(BlockId(id))?[0], id as u8);
    }
    Ok(())
}

#[test]
fn sync_completes_only_after_durability() -> Result<()> {
    let store = MemBlockStore::new(BLOCK);
    let wb = open(&store, &MemFileIo::new(), options())?;
    store.hold_durability(true);
    create_blocks(&wb, [7])?;
    let ticket = wb.sync();
    let deadline = Instant::now() + Duration::from_secs(5);
    while store.stored(BlockId(7)).is_none() {
        assert!(Instant::now() < deadline, "write never placed");
        thread::sleep(Duration::from_millis(2));
    }
    assert!(ticket.wait_timeout(Duration::from_millis(50)).is_none());
    store.release_durability();
    ticket.wait()?;
    Ok(())
}

#[test]
fn overlapping_cycles_complete_in_order() -> Result<()> {
    let store = MemBlockStore::new(BLOCK);
    let opts = WritebackOptions {
        max_concurrent_flushes: 2,
        ..options()
    };
    let wb = open(&store, &MemFileIo::new(), opts)?;
    store.hold_durability(true);
    create_blocks(&wb, [1])?;
    let first = wb.sync();
    create_blocks(&wb, [2])?;
    let second = wb.sync();
    assert!(first.wait_timeout(Duration::from_millis(50)).is_none());
    assert!(second.wait_timeout(Duration::from_millis(50)).is_none());
    store.release_durability();
    first.wait()?;
    second.wait()?;
    assert!(store.stored(BlockId(2)).is_some());
    Ok(())
}

#[test]
fn failed_write_poisons_the_coordinator() -> Result<()> {
    let store = MemBlockStore::new(BLOCK);
    let wb = open(&store, &MemFileIo::new(), options())?;
    create_blocks(&wb, [1])?;
    store.fail_next_writes(1);
    match wb.sync().wait() {
        Err(PatchworkError::Poisoned(msg)) => assert!(msg.contains("injected")),
        other => panic!("expected poisoned sync, got {other:?}"),
    }
    assert!(wb.stats().poisoned);
    assert!(matches!(
        wb.begin_write_transaction(1),
        Err(PatchworkError::Poisoned(_))
    ));
    assert!(matches!(wb.sync().wait(), Err(PatchworkError::Poisoned(_))));
    Ok(())
}

#[test]
fn touch_writes_only_recency() -> Result<()> {
    let store = MemBlockStore::new(BLOCK);
    let wb = open(&store, &MemFileIo::new(), options())?;
    create_blocks(&wb, [4])?;
    wb.sync().wait()?;
    let before = store.stored(BlockId(4)).unwrap();
    {
        let mut txn = wb.begin_write_transaction(1)?;
        txn.touch(BlockId(4), Recency(42))?;
        txn.commit()?;
    }
    wb.sync().wait()?;
    let after = store.stored(BlockId(4)).unwrap();
    assert_eq!(after.recency, Recency(42));
    assert_eq!(after.block_seq, before.block_seq);
    assert_eq!(store.stats().touches, 1);
    Ok(())
}

#[test]
fn patient_syncs_wait_for_backlog_or_explicit_sync() -> Result<()> {
    let store = MemBlockStore::new(BLOCK);
    let opts = WritebackOptions {
        flush_waiting_threshold: 2,
        ..options()
    };
    let wb = open(&store, &MemFileIo::new(), opts)?;
    create_blocks(&wb, [1])?;
    let a = wb.sync_patiently();
    let b = wb.sync_patiently();
    assert!(a.wait_timeout(Duration::from_millis(50)).is_none());
    assert!(store.stored(BlockId(1)).is_none());
    let c = wb.sync_patiently();
    for ticket in [&a, &b, &c] {
        ticket.wait()?;
    }
    assert!(store.stored(BlockId(1)).is_some());

    create_blocks(&wb, [2])?;
    let d = wb.sync_patiently();
    wb.sync().wait()?;
    d.wait()?;
    assert!(store.stored(BlockId(2)).is_some());
    Ok(())
}

#[test]
fn sync_callbacks_run_once_durable() -> Result<()> {
    let store = MemBlockStore::new(BLOCK);
    let wb = open(&store, &MemFileIo::new(), options())?;
    create_blocks(&wb, [3])?;
    let (tx, rx) = std::sync::mpsc::channel();
    wb.sync_with(Box::new(move |outcome| {
        let _ = tx.send(outcome.is_ok());
    }));
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    Ok(())
}

#[test]
fn flush_timer_writes_back_without_explicit_sync() -> Result<()> {
    let store = MemBlockStore::new(BLOCK);
    let opts = WritebackOptions {
        flush_interval_ms: Some(20),
        ..options()
    };
    let wb = open(&store, &MemFileIo::new(), opts)?;
    let timer = wb.start_flush_timer().expect("interval configured");
    create_blocks(&wb, [9])?;
    let deadline = Instant::now() + Duration::from_secs(5);
    while store.stored(BlockId(9)).is_none() {
        assert!(Instant::now() < deadline, "timer never flushed");
        thread::sleep(Duration::from_millis(5));
    }
    drop(timer);
    Ok(())
}

#[test]
fn leaf_remove_survives_recovery() -> Result<()> {
    let store = MemBlockStore::new(BLOCK);
    let log = MemFileIo::new();
    let wb = open(&store, &log, options())?;
    let id = BlockId(11);
    {
        let mut txn = wb.begin_write_transaction(1)?;
        txn.create_block(id)?;
        txn.rewrite(id, |buf| {
            leaf::init(buf, ValueKind::Short, Timestamp(10))?;
            leaf::insert(buf, b"alpha", b"1")?;
            leaf::insert(buf, b"beta", b"2")
        })?;
        txn.commit()?;
    }
    wb.sync().wait()?;
    {
        let mut txn = wb.begin_write_transaction(1)?;
        txn.leaf_remove(id, Timestamp(5), b"alpha")?;
        txn.leaf_erase_presence(id, b"beta")?;
        txn.commit()?;
    }
    wb.sync().wait()?;
    assert_eq!(wb.stats().patches_logged, 2);

    let reopened = open(&store, &log, options())?;
    let data = reopened.read_block(id)?;
    assert_eq!(leaf::lookup(&data, b"alpha")?, None);
    assert_eq!(leaf::deleted_at(&data, b"alpha")?, Some(Timestamp(10)));
    assert_eq!(leaf::lookup(&data, b"beta")?, None);
    assert_eq!(leaf::deleted_at(&data, b"beta")?, None);
    Ok(())
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "{what}");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn commit_above_dirty_threshold_starts_a_flush() -> Result<()> {
    let store = MemBlockStore::new(BLOCK);
    let opts = WritebackOptions {
        flush_dirty_size: 2,
        ..options()
    };
    let wb = open(&store, &MemFileIo::new(), opts)?;
    create_blocks(&wb, [1, 2])?;
    thread::sleep(Duration::from_millis(50));
    assert!(store.stored(BlockId(1)).is_none());
    assert_eq!(wb.stats().dirty_blocks, 2);

    create_blocks(&wb, [3])?;
    wait_until("dirty threshold never flushed", || {
        (1..=3).all(|id| store.stored(BlockId(id)).is_some())
    });
    wait_until("cycle never completed", || wb.stats().cycles_completed == 1);
    assert_eq!(wb.stats().dirty_blocks, 0);
    Ok(())
}

#[test]
fn concurrency_limit_defers_the_next_cycle() -> Result<()> {
    let store = MemBlockStore::new(BLOCK);
    let opts = WritebackOptions {
        max_concurrent_flushes: 1,
        ..options()
    };
    let wb = open(&store, &MemFileIo::new(), opts)?;
    store.hold_durability(true);
    create_blocks(&wb, [1])?;
    let first = wb.sync();
    wait_until("first write never placed", || {
        store.stored(BlockId(1)).is_some()
    });

    create_blocks(&wb, [2])?;
    let second = wb.sync();
    assert!(second.wait_timeout(Duration::from_millis(50)).is_none());
    assert!(store.stored(BlockId(2)).is_none());
    assert_eq!(wb.stats().active_cycles, 1);
    assert_eq!(wb.stats().cycles_deferred, 0);

    store.release_durability();
    first.wait()?;
    second.wait()?;
    assert!(store.stored(BlockId(2)).is_some());
    let stats = wb.stats();
    assert_eq!(stats.cycles_deferred, 1);
    assert_eq!(stats.cycles_completed, 2);
    Ok(())
}

#[test]
fn sync_while_collecting_runs_a_separate_cycle() -> Result<()> {
    let store = MemBlockStore::new(BLOCK);
    let wb = open(&store, &MemFileIo::new(), options())?;
    create_blocks(&wb, [1])?;
    let (first, second) = {
        // An open transaction keeps the cycle from draining writers.
        let holder = wb.begin_write_transaction(0)?;
        let first = wb.sync();
        let second = wb.sync();
        assert_eq!(wb.stats().active_cycles, 1);
        assert!(store.stored(BlockId(1)).is_none());
        drop(holder);
        (first, second)
    };
    first.wait()?;
    second.wait()?;
    wait_until("deferred cycle never ran", || {
        let stats = wb.stats();
        stats.cycles_deferred == 1 && stats.active_cycles == 0
    });
    let stats = wb.stats();
    assert_eq!(stats.cycles_completed + stats.cycles_skipped, 2);
    assert!(store.stored(BlockId(1)).is_some());
    Ok(())
}

#[test]
fn oversized_leaf_key_is_rejected_and_log_stays_readable() -> Result<()> {
    let store = MemBlockStore::new(BLOCK);
    let log = MemFileIo::new();
    let wb = open(&store, &log, options())?;
    let id = BlockId(12);
    {
        let mut txn = wb.begin_write_transaction(1)?;
        txn.create_block(id)?;
        txn.rewrite(id, |buf| {
            leaf::init(buf, ValueKind::Short, Timestamp(1))?;
            leaf::insert(buf, b"k", b"v")
        })?;
        txn.commit()?;
    }
    wb.sync().wait()?;
    {
        let mut txn = wb.begin_write_transaction(1)?;
        let op = PatchOp::LeafErasePresence {
            key: LeafKey::from_vec(vec![b'k'; 300]),
        };
        assert!(matches!(
            txn.apply_patch(id, op),
            Err(PatchworkError::Invalid(_))
        ));
        assert!(txn.leaf_erase_presence(id, &[b'k'; 300]).is_err());
        txn.leaf_erase_presence(id, b"k")?;
        txn.commit()?;
    }
    wb.sync().wait()?;
    assert_eq!(wb.stats().patches_logged, 1);

    let reopened = open(&store, &log, options())?;
    assert_eq!(leaf::lookup(&reopened.read_block(id)?, b"k")?, None);
    Ok(())
}

#[test]
fn timer_tick_waits_for_an_idle_interval() -> Result<()> {
    let store = MemBlockStore::new(BLOCK);
    let opts = WritebackOptions {
        flush_interval_ms: Some(500),
        ..options()
    };
    let wb = open(&store, &MemFileIo::new(), opts)?;
    create_blocks(&wb, [5])?;
    wb.on_flush_timer();
    thread::sleep(Duration::from_millis(30));
    assert!(store.stored(BlockId(5)).is_none());
    assert_eq!(wb.stats().active_cycles, 0);

    thread::sleep(Duration::from_millis(520));
    wb.on_flush_timer();
    wait_until("idle tick never flushed", || {
        store.stored(BlockId(5)).is_some()
    });
    Ok(())
}
