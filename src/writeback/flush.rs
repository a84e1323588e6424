#![forbid(unsafe_code)]
//! Flush cycles.
//!
//! A cycle runs on its own thread through a fixed sequence of phases:
//!
//! 1. `Start`: skip the cycle when there is nothing to write or acknowledge.
//! 2. `AcquireLock`: snapshot the store, compact the patch log, then take the
//!    drain lock exclusively so no transaction is mid-mutation.
//! 3. `PreparePatches`: persist each dirty block's unmaterialized patches to
//!    the log; blocks whose patches do not fit fall back to full writes.
//! 4. `AcquireBuffers`: build the write batch from copies of the buffers,
//!    then release the drain lock.
//! 5. `Write`: flush the patch log and submit the batch to the store.
//! 6. `UpdateIds`: on placement, drop patches made obsolete by the new base
//!    versions and let the next cycle start collecting.
//! 7. `Cleanup`: on durability, release reclaimed log blocks and complete
//!    the cycle's sync waiters.
//!
//! Cycles can overlap: the next one may start as soon as the previous one
//! has placed its writes.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::{CycleId, Inner, Shared, SyncReason, SyncWaiter};
use crate::patch::{PatchLog, ReclaimHost};
use crate::store::{BlockWrite, Placement, ReadSnapshot};
use crate::types::{clone_error, BlockId, BlockSeq, PatchCounter, PatchworkError, Result};

#[cfg(test)]
macro_rules! flush_test_log {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

#[cfg(not(test))]
macro_rules! flush_test_log {
    ($($arg:tt)*) => {
        if false {
            let _ = format_args!($($arg)*);
        }
    };
}

/// Phase a flush cycle is in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlushPhase {
    /// Deciding whether there is anything to do.
    Start,
    /// Compacting the patch log and draining writers.
    AcquireLock,
    /// Persisting unmaterialized patches to the log.
    PreparePatches,
    /// Building the write batch.
    AcquireBuffers,
    /// Flushing the log and submitting the batch.
    Write,
    /// Handling placement of the batch.
    UpdateIds,
    /// Handling durability of the batch.
    Cleanup,
}

impl FlushPhase {
    /// Name used in log events.
    pub fn as_str(self) -> &'static str {
        match self {
            FlushPhase::Start => "start",
            FlushPhase::AcquireLock => "acquire_lock",
            FlushPhase::PreparePatches => "prepare_patches",
            FlushPhase::AcquireBuffers => "acquire_buffers",
            FlushPhase::Write => "write",
            FlushPhase::UpdateIds => "update_ids",
            FlushPhase::Cleanup => "cleanup",
        }
    }
}

/// Bookkeeping for one in-flight cycle.
pub(crate) struct FlushCycle {
    pub id: CycleId,
    pub reason: SyncReason,
    pub phase: FlushPhase,
    pub started: Instant,
    pub waiters: Vec<SyncWaiter>,
    /// Log blocks reclaimed by this cycle, released once it is durable.
    pub reclaimed: Vec<usize>,
    /// Keeps the store's read view alive until the cycle is durable.
    pub snapshot: Option<Box<dyn ReadSnapshot>>,
    /// Writes submitted but not yet placed.
    pub outstanding: usize,
    /// Still holds the coordinator's collecting flag.
    pub collecting: bool,
}

impl FlushCycle {
    fn new(id: CycleId, reason: SyncReason) -> Self {
        Self {
            id,
            reason,
            phase: FlushPhase::Start,
            started: Instant::now(),
            waiters: Vec::new(),
            reclaimed: Vec::new(),
            snapshot: None,
            outstanding: 0,
            collecting: true,
        }
    }
}

/// Starts a cycle now, or records that one should start as soon as possible.
pub(crate) fn maybe_start_cycle(shared: &Arc<Shared>, inner: &mut Inner, reason: SyncReason) {
    let state = &mut inner.state;
    if state.shutting_down || state.last_error.is_some() {
        return;
    }
    if state.collecting || state.active_cycles >= shared.options.max_concurrent_flushes {
        if !state.start_next {
            debug!(
                reason = reason.as_str(),
                active = state.active_cycles,
                "writeback.sync.deferred"
            );
        }
        state.start_next = true;
        return;
    }
    state.collecting = true;
    state.start_next = false;
    state.active_cycles += 1;
    let id = state.next_cycle;
    state.next_cycle += 1;
    inner.cycles.insert(id, FlushCycle::new(id, reason));
    if reason == SyncReason::Deferred {
        inner.counters.cycles_deferred += 1;
    }
    debug!(cycle = id, reason = reason.as_str(), "writeback.sync.start");
    let shared = Arc::clone(shared);
    thread::spawn(move || run_cycle(shared, id));
}

fn start_deferred(shared: &Arc<Shared>, inner: &mut Inner) {
    if inner.state.start_next && !inner.state.collecting {
        inner.state.start_next = false;
        maybe_start_cycle(shared, inner, SyncReason::Deferred);
    }
}

fn run_cycle(shared: Arc<Shared>, id: CycleId) {
    if let Err(err) = drive(&shared, id) {
        fail_cycle(&shared, id, err);
    }
}

fn set_phase(inner: &mut Inner, id: CycleId, phase: FlushPhase) {
    if let Some(cycle) = inner.cycles.get_mut(&id) {
        cycle.phase = phase;
        debug!(
            cycle = id,
            reason = cycle.reason.as_str(),
            phase = phase.as_str(),
            "writeback.flush.phase"
        );
    }
}

fn drive(shared: &Arc<Shared>, id: CycleId) -> Result<()> {
    {
        let mut inner = shared.inner.lock();
        if !inner.has_work() {
            if inner.cycles.remove(&id).is_some() {
                inner.state.active_cycles -= 1;
            }
            inner.state.collecting = false;
            inner.state.start_next = false;
            inner.counters.cycles_skipped += 1;
            debug!(cycle = id, "writeback.flush.noop");
            shared.idle.notify_all();
            return Ok(());
        }
        set_phase(&mut inner, id, FlushPhase::AcquireLock);
    }

    let snapshot = shared.store.begin_snapshot()?;
    let reclaimed = {
        let mut inner = shared.inner.lock();
        let mut log = shared.log.lock();
        let mut target = (inner.tracker.dirty_count() / 8).max(1);
        if std::mem::take(&mut inner.state.patch_pressure) {
            target += (log.config().log_blocks as usize / 4).max(1);
        }
        let mut host = FoldHost {
            inner: &mut *inner,
            snapshot: snapshot.as_ref(),
        };
        let outcome = log.compact_oldest(target, &mut host)?;
        flush_test_log!(
            "[flush] cycle={} target={} reclaimed={:?} folded={:?}",
            id,
            target,
            outcome.slots,
            outcome.folded
        );
        outcome.slots
    };

    let exclusive = shared.drain.acquire_exclusive();
    let writes = {
        let mut inner = shared.inner.lock();
        set_phase(&mut inner, id, FlushPhase::PreparePatches);
        let mut waiters = std::mem::take(&mut inner.waiters);
        waiters.append(&mut inner.patient);
        let logged = {
            let mut log = shared.log.lock();
            prepare_patches(&mut inner, &mut log)
        };
        inner.counters.patches_logged += logged as u64;

        set_phase(&mut inner, id, FlushPhase::AcquireBuffers);
        let writes = acquire_buffers(&mut inner)?;
        inner.state.outstanding_writes += writes.len();
        if let Some(cycle) = inner.cycles.get_mut(&id) {
            cycle.waiters = waiters;
            cycle.reclaimed = reclaimed;
            cycle.snapshot = Some(snapshot);
            cycle.outstanding = writes.len();
        } else {
            return Err(PatchworkError::Invalid("flush cycle vanished"));
        }
        debug!(
            cycle = id,
            writes = writes.len(),
            patches = logged,
            "writeback.flush.collected"
        );
        shared.admission.notify_all();
        writes
    };
    drop(exclusive);

    set_phase(&mut shared.inner.lock(), id, FlushPhase::Write);
    shared.log.lock().flush()?;
    let placed = Arc::clone(shared);
    let durable = Arc::clone(shared);
    shared.store.write(
        writes,
        shared.options.io_priority,
        Box::new(move |placements| on_cycle_placed(&placed, id, placements)),
        Box::new(move || on_cycle_durable(&durable, id)),
    )
}

/// Persists every dirty block's unmaterialized patches; returns how many were stored.
fn prepare_patches(inner: &mut Inner, log: &mut PatchLog) -> usize {
    let mut logged = 0;
    for id in inner.tracker.dirty_ids() {
        let Some(entry) = inner.tracker.get(id) else {
            continue;
        };
        if entry.needs_full_flush || !entry.dirty {
            continue;
        }
        let (seq, materialized) = (entry.block_seq, entry.last_materialized);
        if cfg!(debug_assertions) {
            inner.catalog.verify(id, BlockSeq::default());
        }
        let patches = inner.catalog.patches_for(id);
        let mut start = patches.len();
        while start > 0 {
            let patch = &patches[start - 1];
            if patch.block_seq != seq || patch.counter <= materialized {
                break;
            }
            start -= 1;
        }
        let mut stored = materialized;
        let mut full = false;
        for patch in &patches[start..] {
            if !log.store(patch) {
                full = true;
                break;
            }
            stored = patch.counter;
            logged += 1;
        }
        if let Some(entry) = inner.tracker.get_mut(id) {
            entry.last_materialized = stored;
            if full {
                entry.needs_full_flush = true;
            }
        }
        if full {
            inner.state.patch_pressure = true;
            warn!(block = %id, "writeback.patch_log.full");
        }
    }
    logged
}

/// Builds the write batch: tombstones, then full writes, then touches.
fn acquire_buffers(inner: &mut Inner) -> Result<Vec<BlockWrite>> {
    let mut writes = Vec::new();
    for (block_id, write_zeroed) in inner.tracker.take_tombstones() {
        writes.push(BlockWrite::Tombstone {
            block_id,
            write_zeroed,
        });
        inner.counters.tombstones += 1;
    }
    let mut touches = Vec::new();
    for id in inner.tracker.dirty_ids() {
        let Some(entry) = inner.tracker.get(id).cloned() else {
            continue;
        };
        let recency = inner.cache.recency(entry.handle)?;
        if entry.needs_full_flush {
            let data = inner.cache.snapshot(entry.handle)?;
            let block_seq = inner.state.allocate_seq();
            writes.push(BlockWrite::Full {
                block_id: id,
                block_seq,
                data,
                recency,
            });
            inner.counters.full_writes += 1;
            if let Some(entry) = inner.tracker.get_mut(id) {
                entry.block_seq = block_seq;
                entry.patch_counter = PatchCounter(0);
                entry.last_materialized = PatchCounter(0);
                entry.needs_full_flush = false;
                entry.pending_write = true;
                entry.dirty = false;
                entry.recency_dirty = false;
            }
        } else {
            if entry.recency_dirty {
                touches.push(BlockWrite::Touch {
                    block_id: id,
                    recency,
                });
                inner.counters.touches += 1;
            }
            if let Some(entry) = inner.tracker.get_mut(id) {
                entry.dirty = false;
                entry.recency_dirty = false;
            }
        }
        inner.tracker.sync_membership(id);
    }
    writes.extend(touches);
    Ok(writes)
}

fn on_cycle_placed(shared: &Arc<Shared>, id: CycleId, placements: Vec<Placement>) {
    let mut inner = shared.inner.lock();
    set_phase(&mut inner, id, FlushPhase::UpdateIds);
    for placement in placements {
        match placement {
            Placement::Written {
                block_id,
                block_seq,
            } => {
                inner.catalog.filter_before(block_id, block_seq);
                if let Some(entry) = inner.tracker.get_mut(block_id) {
                    if entry.block_seq == block_seq {
                        entry.pending_write = false;
                    }
                }
            }
            Placement::Deleted { block_id } => inner.tracker.tombstone_placed(block_id),
            Placement::Touched { .. } => {}
        }
    }
    let (outstanding, collecting) = match inner.cycles.get_mut(&id) {
        Some(cycle) => (
            std::mem::take(&mut cycle.outstanding),
            std::mem::take(&mut cycle.collecting),
        ),
        None => (0, false),
    };
    inner.state.outstanding_writes = inner.state.outstanding_writes.saturating_sub(outstanding);
    if collecting {
        inner.state.collecting = false;
    }
    shared.admission.notify_all();
    start_deferred(shared, &mut inner);
}

fn on_cycle_durable(shared: &Arc<Shared>, id: CycleId) {
    let (waiters, snapshot) = {
        let mut inner = shared.inner.lock();
        set_phase(&mut inner, id, FlushPhase::Cleanup);
        let Some(mut cycle) = inner.cycles.remove(&id) else {
            return;
        };
        if cycle.outstanding > 0 {
            inner.state.outstanding_writes =
                inner.state.outstanding_writes.saturating_sub(cycle.outstanding);
        }
        if cycle.collecting {
            inner.state.collecting = false;
        }
        shared.log.lock().release(&cycle.reclaimed);
        inner.state.active_cycles -= 1;
        let elapsed = cycle.started.elapsed();
        inner.state.last_cycle = Some(elapsed);
        inner.counters.cycles_completed += 1;
        info!(
            cycle = cycle.id,
            reason = cycle.reason.as_str(),
            waiters = cycle.waiters.len(),
            released = cycle.reclaimed.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "writeback.flush.done"
        );
        shared.idle.notify_all();
        shared.admission.notify_all();
        start_deferred(shared, &mut inner);
        (std::mem::take(&mut cycle.waiters), cycle.snapshot.take())
    };
    drop(snapshot);
    for waiter in waiters {
        waiter.finish(Ok(()));
    }
}

/// Poisons the coordinator and fails every waiter that can no longer be served.
fn fail_cycle(shared: &Arc<Shared>, id: CycleId, err: PatchworkError) {
    warn!(cycle = id, error = %err, "writeback.flush.failed");
    let message = err.to_string();
    let waiters = {
        let mut inner = shared.inner.lock();
        if inner.state.last_error.is_none() {
            inner.state.last_error = Some(clone_error(&err));
        }
        let mut failed = Vec::new();
        if let Some(mut cycle) = inner.cycles.remove(&id) {
            inner.state.outstanding_writes =
                inner.state.outstanding_writes.saturating_sub(cycle.outstanding);
            if cycle.collecting {
                inner.state.collecting = false;
            }
            inner.state.active_cycles -= 1;
            failed.append(&mut cycle.waiters);
        }
        failed.append(&mut inner.waiters);
        failed.append(&mut inner.patient);
        inner.state.start_next = false;
        shared.admission.notify_all();
        shared.idle.notify_all();
        failed
    };
    for waiter in waiters {
        waiter.finish(Err(PatchworkError::Poisoned(message.clone())));
    }
}

/// Lets the patch log fold blocks whose patches live in a reclaimed log block.
struct FoldHost<'a> {
    inner: &'a mut Inner,
    snapshot: &'a dyn ReadSnapshot,
}

impl ReclaimHost for FoldHost<'_> {
    fn is_live(&self, block: BlockId, seq: BlockSeq) -> bool {
        self.inner.catalog.has_run(block, seq)
            && self
                .inner
                .tracker
                .get(block)
                .map(|entry| entry.block_seq == seq)
                .unwrap_or(true)
    }

    fn fold(&mut self, block: BlockId) -> Result<()> {
        if self.inner.cache.lookup(block).is_none()
            && self.inner.load_into_cache(self.snapshot, block)?.is_none()
        {
            self.inner.catalog.drop_block(block);
            return Ok(());
        }
        self.inner.tracker.set_needs_full_flush(block);
        debug!(block = %block, "writeback.fold");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_are_ordered() {
        let phases = [
            FlushPhase::Start,
            FlushPhase::AcquireLock,
            FlushPhase::PreparePatches,
            FlushPhase::AcquireBuffers,
            FlushPhase::Write,
            FlushPhase::UpdateIds,
            FlushPhase::Cleanup,
        ];
        assert!(phases.windows(2).all(|pair| pair[0] < pair[1]));
        let names: Vec<&str> = phases.iter().map(|p| p.as_str()).collect();
        assert_eq!(names[2], "prepare_patches");
        assert_eq!(names.len(), 7);
    }
}
