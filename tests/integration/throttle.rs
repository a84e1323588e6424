#![allow(missing_docs)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use patchwork::primitives::io::MemFileIo;
use patchwork::{BlockId, MemBlockStore, PatchworkError, Result, Writeback, WritebackOptions};

fn open(store: &MemBlockStore, max_dirty_blocks: usize) -> Result<Writeback> {
    let options = WritebackOptions {
        block_size: 512,
        max_dirty_blocks,
        flush_interval_ms: None,
        patch_log_blocks: 4,
        ..WritebackOptions::default()
    };
    Writeback::open(Arc::new(store.clone()), Arc::new(MemFileIo::new()), options)
}

fn wait_for_queue(wb: &Writeback, len: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while wb.stats().throttled_waiting < len {
        assert!(Instant::now() < deadline, "admission queue never reached {len}");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn throttled_transaction_forces_a_flush() -> Result<()> {
    let store = MemBlockStore::new(512);
    let wb = open(&store, 4)?;
    {
        let mut txn = wb.begin_write_transaction(4)?;
        for id in 0..4 {
            txn.create_block(BlockId(id))?;
        }
        txn.commit()?;
    }
    assert!(wb.too_many_dirty_blocks());
    let txn = wb.begin_write_transaction(1)?;
    assert_eq!(wb.stats().throttled_txns, 1);
    assert!(store.stored(BlockId(3)).is_some());
    txn.commit()?;
    assert!(!wb.too_many_dirty_blocks());
    Ok(())
}

#[test]
fn queued_transactions_are_admitted_in_arrival_order() -> Result<()> {
    let store = MemBlockStore::new(512);
    let wb = open(&store, 2)?;
    let order = Mutex::new(Vec::new());
    thread::scope(|s| -> Result<()> {
        let holder = wb.begin_write_transaction(2)?;
        let mut handles = Vec::new();
        for (i, (name, expected)) in [("first", 2), ("second", 1)].into_iter().enumerate() {
            let wb = &wb;
            let order = &order;
            handles.push(s.spawn(move || -> Result<()> {
                let txn = wb.begin_write_transaction(expected)?;
                order.lock().unwrap().push(name);
                txn.commit()
            }));
            wait_for_queue(&wb, i + 1);
        }
        drop(holder);
        for handle in handles {
            handle.join().expect("thread join")?;
        }
        Ok(())
    })?;
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    assert_eq!(wb.stats().throttled_txns, 2);
    assert_eq!(wb.stats().expected_changes, 0);
    Ok(())
}

#[test]
fn shutdown_fails_throttled_transactions() -> Result<()> {
    let store = MemBlockStore::new(512);
    let wb = open(&store, 1)?;
    thread::scope(|s| -> Result<()> {
        let holder = wb.begin_write_transaction(1)?;
        let wb_ref = &wb;
        let waiting = s.spawn(move || wb_ref.begin_write_transaction(1).map(|_| ()));
        wait_for_queue(&wb, 1);
        wb.shutdown();
        match waiting.join().expect("thread join") {
            Err(PatchworkError::ShuttingDown) => {}
            other => panic!("expected shutdown error, got {other:?}"),
        }
        drop(holder);
        Ok(())
    })?;
    assert_eq!(wb.stats().throttled_waiting, 0);
    Ok(())
}

#[test]
fn dropped_transaction_releases_its_budget() -> Result<()> {
    let store = MemBlockStore::new(512);
    let wb = open(&store, 3)?;
    let txn = wb.begin_write_transaction(3)?;
    assert!(wb.too_many_dirty_blocks());
    drop(txn);
    assert!(!wb.too_many_dirty_blocks());
    assert_eq!(wb.stats().expected_changes, 0);
    Ok(())
}
