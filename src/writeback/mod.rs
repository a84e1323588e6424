#![forbid(unsafe_code)]
//! Write-back coordinator.
//!
//! Write transactions mutate cached blocks either through patches, which are
//! recorded in the [`PatchCatalog`] and later persisted to the [`PatchLog`],
//! or through full rewrites, which flag the block for a full write. The
//! coordinator throttles incoming transactions, decides when to start a
//! flush cycle, and owns the adaptive patch-vs-full-write ratio.
//!
//! Locks are always taken in this order: drain lock, coordinator state,
//! a block buffer, the patch log.

use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::cache::{load_block, BlockCache, BlockHandle};
use crate::patch::leaf;
use crate::patch::log::LogConfig;
use crate::patch::{Patch, PatchCatalog, PatchLog, PatchLogStats, PatchOp};
use crate::primitives::concurrency::{Completion, DrainLock, SharedDrainGuard};
use crate::primitives::io::FileIo;
use crate::store::{BlockStore, ReadSnapshot, StoredBlock};
use crate::types::{
    BlockId, BlockSeq, PatchCounter, PatchworkError, Recency, Result, Timestamp,
};

/// Per-block dirty flags and the tombstone queue.
pub mod dirty;
mod flush;
mod options;

pub use dirty::{DirtyEntry, DirtyTracker};
pub use flush::FlushPhase;
pub use options::{WritebackOptions, MAX_PATCH_RATIO, MIN_PATCH_RATIO};

use flush::{maybe_start_cycle, FlushCycle};

pub(crate) type CycleId = u64;

/// Callback form of a sync request.
pub type SyncCallback = Box<dyn FnOnce(Result<()>) + Send>;

pub(crate) enum SyncWaiter {
    Ticket(Arc<Completion<()>>),
    Callback(SyncCallback),
}

impl SyncWaiter {
    pub(crate) fn finish(self, outcome: Result<()>) {
        match self {
            SyncWaiter::Ticket(done) => done.finish(outcome),
            SyncWaiter::Callback(callback) => callback(outcome),
        }
    }
}

/// Handle to a pending sync; resolves once the covered data is durable.
pub struct SyncTicket {
    done: Arc<Completion<()>>,
}

impl SyncTicket {
    /// Blocks until the sync completes.
    pub fn wait(&self) -> Result<()> {
        self.done.wait()
    }

    /// Blocks up to `timeout`; `None` if the sync is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        self.done.wait_timeout(timeout)
    }

    /// Whether the sync has completed.
    pub fn is_done(&self) -> bool {
        self.done.is_done()
    }
}

/// What caused a flush cycle to be requested.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyncReason {
    /// [`Writeback::sync`] was called.
    Explicit,
    /// A commit left more dirty blocks than `flush_dirty_size`.
    DirtyThreshold,
    /// The flush timer fired with pending work.
    Timer,
    /// Too many patient syncs were waiting.
    PatientBacklog,
    /// A transaction was throttled at admission.
    Throttled,
    /// A sync arrived while no new cycle could start.
    Deferred,
}

impl SyncReason {
    /// Name used in log events.
    pub fn as_str(self) -> &'static str {
        match self {
            SyncReason::Explicit => "explicit",
            SyncReason::DirtyThreshold => "dirty_threshold",
            SyncReason::Timer => "timer",
            SyncReason::PatientBacklog => "patient_backlog",
            SyncReason::Throttled => "throttled",
            SyncReason::Deferred => "deferred",
        }
    }
}

/// Global throttling and scheduling state.
#[derive(Debug)]
pub(crate) struct WritebackState {
    pub max_dirty_blocks: usize,
    pub outstanding_writes: usize,
    pub expected_changes: usize,
    pub active_cycles: usize,
    /// A cycle is between its start and the placement of its writes.
    pub collecting: bool,
    /// A sync was requested while no new cycle could start.
    pub start_next: bool,
    /// A patch did not fit in the log during the last cycle.
    pub patch_pressure: bool,
    pub patch_ratio: u32,
    pub next_seq: BlockSeq,
    pub next_cycle: CycleId,
    pub shutting_down: bool,
    pub last_error: Option<PatchworkError>,
    /// Duration of the most recent completed cycle not yet seen by the timer.
    pub last_cycle: Option<Duration>,
    /// Last time a transaction committed.
    pub last_activity: Instant,
    next_ticket: u64,
    admission_queue: VecDeque<u64>,
}

impl WritebackState {
    pub fn new(max_dirty_blocks: usize, patch_ratio: u32, next_seq: BlockSeq) -> Self {
        Self {
            max_dirty_blocks,
            outstanding_writes: 0,
            expected_changes: 0,
            active_cycles: 0,
            collecting: false,
            start_next: false,
            patch_pressure: false,
            patch_ratio,
            next_seq,
            next_cycle: 1,
            shutting_down: false,
            last_error: None,
            last_cycle: None,
            last_activity: Instant::now(),
            next_ticket: 0,
            admission_queue: VecDeque::new(),
        }
    }

    pub fn too_many_dirty_blocks(&self, dirty_count: usize) -> bool {
        dirty_count + self.outstanding_writes + self.expected_changes >= self.max_dirty_blocks
    }

    pub fn allocate_seq(&mut self) -> BlockSeq {
        let seq = self.next_seq;
        self.next_seq = seq.next();
        seq
    }

    /// Moves the patch ratio toward patches when the last cycle finished
    /// within half the interval, and toward full writes when it overran.
    pub fn adjust_patch_ratio(&mut self, interval: Duration) {
        let Some(last) = self.last_cycle.take() else {
            return;
        };
        let before = self.patch_ratio;
        if last <= interval / 2 {
            self.patch_ratio = self.patch_ratio.saturating_sub(1).max(MIN_PATCH_RATIO);
        } else if last > interval {
            self.patch_ratio = (self.patch_ratio + 1).min(MAX_PATCH_RATIO);
        }
        if before != self.patch_ratio {
            debug!(
                from = before,
                to = self.patch_ratio,
                last_cycle_ms = last.as_millis() as u64,
                "writeback.patch_ratio.adjust"
            );
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Counters {
    pub cycles_completed: u64,
    pub cycles_skipped: u64,
    pub cycles_deferred: u64,
    pub patches_logged: u64,
    pub full_writes: u64,
    pub touches: u64,
    pub tombstones: u64,
    pub throttled_txns: u64,
}

pub(crate) struct Inner {
    pub state: WritebackState,
    pub tracker: DirtyTracker,
    pub catalog: PatchCatalog,
    pub cache: BlockCache,
    pub cycles: FxHashMap<CycleId, FlushCycle>,
    pub waiters: Vec<SyncWaiter>,
    pub patient: Vec<SyncWaiter>,
    pub counters: Counters,
}

impl Inner {
    fn check_poisoned(&self) -> Result<()> {
        match &self.state.last_error {
            Some(err) => Err(PatchworkError::Poisoned(err.to_string())),
            None => Ok(()),
        }
    }

    fn check_usable(&self) -> Result<()> {
        self.check_poisoned()?;
        if self.state.shutting_down {
            return Err(PatchworkError::ShuttingDown);
        }
        Ok(())
    }

    pub fn has_work(&self) -> bool {
        self.tracker.has_work() || !self.waiters.is_empty() || !self.patient.is_empty()
    }

    fn throttled(&self) -> bool {
        self.state.too_many_dirty_blocks(self.tracker.dirty_count())
    }

    /// Loads `id` through `snapshot` into the cache with a clean entry.
    pub fn load_into_cache(
        &mut self,
        snapshot: &dyn ReadSnapshot,
        id: BlockId,
    ) -> Result<Option<BlockHandle>> {
        if self.tracker.rejects_readahead(id) {
            return Ok(None);
        }
        let Some(loaded) = load_block(snapshot, &mut self.catalog, id)? else {
            return Ok(None);
        };
        let handle = self.cache.insert(id, loaded.data, loaded.recency)?;
        let counter = self.catalog.last_materialized_counter_or_zero(id);
        self.tracker
            .track(id, DirtyEntry::clean(handle, loaded.block_seq, counter));
        Ok(Some(handle))
    }

    fn ensure_cached(&mut self, store: &dyn BlockStore, id: BlockId) -> Result<BlockHandle> {
        if let Some(handle) = self.cache.lookup(id) {
            return Ok(handle);
        }
        if self.tracker.rejects_readahead(id) {
            return Err(PatchworkError::NotFound);
        }
        let snapshot = store.begin_snapshot()?;
        self.load_into_cache(snapshot.as_ref(), id)?
            .ok_or(PatchworkError::NotFound)
    }

    fn prefers_full_write(&self, id: BlockId, extra: usize, block_size: usize) -> bool {
        let budget = block_size / self.state.patch_ratio.max(MIN_PATCH_RATIO) as usize;
        self.catalog.serialized_size(id) + extra > budget
    }
}

pub(crate) struct Shared {
    pub store: Arc<dyn BlockStore>,
    pub log: Mutex<PatchLog>,
    pub drain: DrainLock,
    pub inner: Mutex<Inner>,
    /// Signalled whenever the admission predicate may have changed.
    pub admission: Condvar,
    /// Signalled whenever a cycle ends.
    pub idle: Condvar,
    pub options: WritebackOptions,
}

/// Point-in-time counters of the coordinator.
#[derive(Debug, Clone, Default)]
pub struct WritebackStats {
    /// Dirty blocks plus queued tombstones.
    pub dirty_blocks: usize,
    /// Blocks resident in the cache.
    pub cached_blocks: usize,
    /// Writes submitted to the store and not yet placed.
    pub outstanding_writes: usize,
    /// Changes announced by open transactions.
    pub expected_changes: usize,
    /// Flush cycles started and not yet durable.
    pub active_cycles: usize,
    /// Sync requests waiting for the next cycle.
    pub queued_syncs: usize,
    /// Patient sync requests waiting for any cycle.
    pub queued_patient_syncs: usize,
    /// Transactions blocked in admission.
    pub throttled_waiting: usize,
    /// Current patch-vs-full-write ratio.
    pub patch_ratio: u32,
    /// Encoded size of every patch held in the catalog.
    pub catalog_bytes: usize,
    /// Sequence id the next full write will receive.
    pub next_block_seq: u64,
    /// Cycles whose writes became durable.
    pub cycles_completed: u64,
    /// Cycles that found nothing to write.
    pub cycles_skipped: u64,
    /// Cycles started because a sync arrived while another cycle was busy.
    pub cycles_deferred: u64,
    /// Patches persisted to the patch log.
    pub patches_logged: u64,
    /// Full block writes submitted.
    pub full_writes: u64,
    /// Recency-only writes submitted.
    pub touches: u64,
    /// Tombstones submitted.
    pub tombstones: u64,
    /// Transactions that had to queue for admission.
    pub throttled_txns: u64,
    /// A failed cycle has poisoned the coordinator.
    pub poisoned: bool,
    /// Patch log occupancy.
    pub log: PatchLogStats,
}

/// Patch-based write-back coordinator for a block cache.
#[derive(Clone)]
pub struct Writeback {
    shared: Arc<Shared>,
}

impl Writeback {
    /// Opens the patch log, recovers logged patches and filters them against
    /// the base versions held by `store`.
    ///
    /// No background thread is started here. Interval syncs and patch ratio
    /// adjustment need [`Writeback::start_flush_timer`], or an embedder that
    /// calls [`Writeback::on_flush_timer`] from its own scheduler.
    pub fn open(
        store: Arc<dyn BlockStore>,
        log_io: Arc<dyn FileIo>,
        options: WritebackOptions,
    ) -> Result<Self> {
        options.validate()?;
        if store.block_size() != options.block_size {
            return Err(PatchworkError::InvalidOwned(format!(
                "store block size {} does not match configured {}",
                store.block_size(),
                options.block_size
            )));
        }
        let mut log = PatchLog::open(
            log_io,
            LogConfig {
                block_size: options.block_size as u32,
                log_blocks: options.patch_log_blocks,
                max_dirty_blocks: options.max_dirty_blocks as u64,
            },
        )?;
        let recovered = log.recover()?;
        let total = recovered.len();
        let mut by_block: BTreeMap<BlockId, Vec<Patch>> = BTreeMap::new();
        for patch in recovered {
            by_block.entry(patch.block_id).or_default().push(patch);
        }
        let snapshot = store.begin_snapshot()?;
        let mut catalog = PatchCatalog::new();
        for (id, mut patches) in by_block {
            let Some(stored) = snapshot.read_block(id)? else {
                continue;
            };
            patches.sort_by_key(|p| (p.block_seq, p.counter));
            for patch in patches {
                catalog.add(patch);
            }
            catalog.filter_before(id, stored.block_seq);
            // Runs newer than the stored version belong to writes that never landed.
            catalog.discard_after(id, stored.block_seq);
            catalog.verify(id, stored.block_seq);
        }
        let next_seq = store.max_block_seq()?.max(log.max_block_seq()).next();
        info!(
            recovered = total,
            kept = catalog.block_ids().len(),
            next_seq = next_seq.0,
            "writeback.open"
        );
        let inner = Inner {
            state: WritebackState::new(
                options.max_dirty_blocks,
                options.initial_patch_ratio,
                next_seq,
            ),
            tracker: DirtyTracker::new(),
            catalog,
            cache: BlockCache::new(options.block_size),
            cycles: FxHashMap::default(),
            waiters: Vec::new(),
            patient: Vec::new(),
            counters: Counters::default(),
        };
        Ok(Self {
            shared: Arc::new(Shared {
                store,
                log: Mutex::new(log),
                drain: DrainLock::new(),
                inner: Mutex::new(inner),
                admission: Condvar::new(),
                idle: Condvar::new(),
                options,
            }),
        })
    }

    /// Options the coordinator was opened with.
    pub fn options(&self) -> &WritebackOptions {
        &self.shared.options
    }

    /// Whether a new transaction would currently be throttled.
    pub fn too_many_dirty_blocks(&self) -> bool {
        self.shared.inner.lock().throttled()
    }

    /// Admits a write transaction that expects to dirty `expected_changes` blocks.
    ///
    /// Blocks while admission is throttled; queued transactions are admitted
    /// in arrival order. The returned transaction holds the drain lock in
    /// shared mode until it is committed or dropped.
    pub fn begin_write_transaction(&self, expected_changes: usize) -> Result<WriteTxn<'_>> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        inner.check_usable()?;
        if !inner.state.admission_queue.is_empty() || inner.throttled() {
            let ticket = inner.state.next_ticket;
            inner.state.next_ticket += 1;
            inner.state.admission_queue.push_back(ticket);
            inner.counters.throttled_txns += 1;
            warn!(
                ticket,
                dirty = inner.tracker.dirty_count(),
                outstanding = inner.state.outstanding_writes,
                expected = inner.state.expected_changes,
                "writeback.admission.throttled"
            );
            maybe_start_cycle(shared, &mut inner, SyncReason::Throttled);
            loop {
                if let Err(err) = inner.check_usable() {
                    inner.state.admission_queue.retain(|t| *t != ticket);
                    shared.admission.notify_all();
                    return Err(err);
                }
                if inner.state.admission_queue.front() == Some(&ticket) && !inner.throttled() {
                    inner.state.admission_queue.pop_front();
                    break;
                }
                shared.admission.wait(&mut inner);
            }
            shared.admission.notify_all();
        }
        inner.state.expected_changes += expected_changes;
        drop(inner);
        let drain = shared.drain.acquire_shared();
        Ok(WriteTxn {
            writeback: self,
            _drain: drain,
            expected: expected_changes,
            finished: false,
        })
    }

    fn enqueue_sync(&self, waiter: SyncWaiter, patient: bool) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        if let Err(err) = inner.check_usable() {
            drop(inner);
            waiter.finish(Err(err));
            return;
        }
        if patient {
            inner.patient.push(waiter);
            if inner.patient.len() > shared.options.flush_waiting_threshold {
                maybe_start_cycle(shared, &mut inner, SyncReason::PatientBacklog);
            }
        } else {
            inner.waiters.push(waiter);
            maybe_start_cycle(shared, &mut inner, SyncReason::Explicit);
        }
    }

    /// Starts a flush cycle and returns a ticket that resolves when every
    /// change committed so far is durable.
    pub fn sync(&self) -> SyncTicket {
        let done = Arc::new(Completion::new());
        self.enqueue_sync(SyncWaiter::Ticket(Arc::clone(&done)), false);
        SyncTicket { done }
    }

    /// Like [`Writeback::sync`] but reports completion through `callback`.
    pub fn sync_with(&self, callback: SyncCallback) {
        self.enqueue_sync(SyncWaiter::Callback(callback), false);
    }

    /// Like [`Writeback::sync`] but waits for a cycle started by another trigger.
    pub fn sync_patiently(&self) -> SyncTicket {
        let done = Arc::new(Completion::new());
        self.enqueue_sync(SyncWaiter::Ticket(Arc::clone(&done)), true);
        SyncTicket { done }
    }

    /// Like [`Writeback::sync_patiently`] but reports completion through `callback`.
    pub fn sync_patiently_with(&self, callback: SyncCallback) {
        self.enqueue_sync(SyncWaiter::Callback(callback), true);
    }

    /// Returns the current contents of a block, loading it if needed.
    pub fn read_block(&self, id: BlockId) -> Result<Vec<u8>> {
        let mut inner = self.shared.inner.lock();
        let handle = inner.ensure_cached(self.shared.store.as_ref(), id)?;
        let buf = inner.cache.buffer(handle)?;
        let data = buf.read();
        Ok(data.to_vec())
    }

    /// Offers a copy of a block read ahead of demand.
    ///
    /// The copy is rejected when the block is already cached, was deleted and
    /// the tombstone is not placed yet, or is older than pending patches.
    pub fn offer_readahead(&self, id: BlockId, block: StoredBlock) -> Result<bool> {
        let mut inner = self.shared.inner.lock();
        if inner.cache.lookup(id).is_some() || inner.tracker.rejects_readahead(id) {
            return Ok(false);
        }
        if block.data.len() != self.shared.options.block_size {
            return Err(PatchworkError::Invalid("read-ahead block has wrong size"));
        }
        inner.catalog.filter_before(id, block.block_seq);
        if inner
            .catalog
            .patches_for(id)
            .first()
            .map(|p| p.block_seq != block.block_seq)
            .unwrap_or(false)
        {
            return Ok(false);
        }
        let mut data: Box<[u8]> = Box::from(&block.data[..]);
        inner.catalog.replay(id, &mut data)?;
        let handle = inner.cache.insert(id, data, block.recency)?;
        let counter = inner.catalog.last_materialized_counter_or_zero(id);
        inner
            .tracker
            .track(id, DirtyEntry::clean(handle, block.block_seq, counter));
        Ok(true)
    }

    /// Drops a clean block from the cache; returns false if it is dirty or busy.
    pub fn evict(&self, id: BlockId) -> Result<bool> {
        let mut inner = self.shared.inner.lock();
        let Some(entry) = inner.tracker.get(id) else {
            return Ok(false);
        };
        if !entry.is_clean() {
            return Ok(false);
        }
        let handle = entry.handle;
        inner.cache.remove(handle)?;
        inner.tracker.untrack(id);
        Ok(true)
    }

    /// One tick of the flush timer: adjusts the patch ratio and starts a
    /// cycle when there is pending work and no transaction has committed for
    /// a whole interval.
    pub fn on_flush_timer(&self) {
        flush_timer_tick(&self.shared);
    }

    /// Spawns the periodic flush timer; `None` when no interval is configured.
    pub fn start_flush_timer(&self) -> Option<FlushTimer> {
        let interval = self.shared.options.flush_interval()?;
        Some(FlushTimer::spawn(Arc::downgrade(&self.shared), interval))
    }

    /// Current patch-vs-full-write ratio.
    pub fn patch_ratio(&self) -> u32 {
        self.shared.inner.lock().state.patch_ratio
    }

    /// Stops scheduling new cycles, waits for in-flight ones, and fails
    /// queued sync requests and throttled transactions with `ShuttingDown`.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        inner.state.shutting_down = true;
        inner.state.start_next = false;
        while inner.state.active_cycles > 0 {
            shared.idle.wait(&mut inner);
        }
        let mut waiters = std::mem::take(&mut inner.waiters);
        waiters.append(&mut inner.patient);
        shared.admission.notify_all();
        drop(inner);
        info!(failed_syncs = waiters.len(), "writeback.shutdown");
        for waiter in waiters {
            waiter.finish(Err(PatchworkError::ShuttingDown));
        }
    }

    /// Snapshot of the coordinator counters.
    pub fn stats(&self) -> WritebackStats {
        let inner = self.shared.inner.lock();
        let log = self.shared.log.lock().stats();
        WritebackStats {
            dirty_blocks: inner.tracker.dirty_count(),
            cached_blocks: inner.cache.len(),
            outstanding_writes: inner.state.outstanding_writes,
            expected_changes: inner.state.expected_changes,
            active_cycles: inner.state.active_cycles,
            queued_syncs: inner.waiters.len(),
            queued_patient_syncs: inner.patient.len(),
            throttled_waiting: inner.state.admission_queue.len(),
            patch_ratio: inner.state.patch_ratio,
            catalog_bytes: inner.catalog.total_serialized_size(),
            next_block_seq: inner.state.next_seq.0,
            cycles_completed: inner.counters.cycles_completed,
            cycles_skipped: inner.counters.cycles_skipped,
            cycles_deferred: inner.counters.cycles_deferred,
            patches_logged: inner.counters.patches_logged,
            full_writes: inner.counters.full_writes,
            touches: inner.counters.touches,
            tombstones: inner.counters.tombstones,
            throttled_txns: inner.counters.throttled_txns,
            poisoned: inner.state.last_error.is_some(),
            log,
        }
    }
}

fn flush_timer_tick(shared: &Arc<Shared>) {
    let mut inner = shared.inner.lock();
    if inner.state.shutting_down || inner.state.last_error.is_some() {
        return;
    }
    let Some(interval) = shared.options.flush_interval() else {
        return;
    };
    inner.state.adjust_patch_ratio(interval);
    if inner.has_work() && inner.state.last_activity.elapsed() >= interval {
        maybe_start_cycle(shared, &mut inner, SyncReason::Timer);
    }
}

enum TimerMessage {
    Trigger,
    Shutdown,
}

/// Background thread that ticks the flush timer at the configured interval.
///
/// Stops when dropped or when the coordinator is gone.
pub struct FlushTimer {
    sender: Sender<TimerMessage>,
    thread: Option<thread::JoinHandle<()>>,
}

impl FlushTimer {
    fn spawn(shared: Weak<Shared>, interval: Duration) -> Self {
        let (sender, receiver) = mpsc::channel();
        let thread = thread::spawn(move || Self::timer_loop(shared, receiver, interval));
        Self {
            sender,
            thread: Some(thread),
        }
    }

    /// Runs a tick now instead of waiting for the interval.
    pub fn trigger(&self) {
        let _ = self.sender.send(TimerMessage::Trigger);
    }

    fn timer_loop(shared: Weak<Shared>, receiver: Receiver<TimerMessage>, interval: Duration) {
        loop {
            match receiver.recv_timeout(interval) {
                Ok(TimerMessage::Trigger) | Err(mpsc::RecvTimeoutError::Timeout) => {
                    let Some(shared) = shared.upgrade() else {
                        break;
                    };
                    flush_timer_tick(&shared);
                }
                Ok(TimerMessage::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    break;
                }
            }
        }
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        let _ = self.sender.send(TimerMessage::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// An admitted write transaction.
///
/// Holds the drain lock in shared mode, so no flush cycle can snapshot
/// blocks while it is open. Dropping it without [`WriteTxn::commit`] releases
/// its admission budget without triggering a sync.
pub struct WriteTxn<'a> {
    writeback: &'a Writeback,
    _drain: SharedDrainGuard<'a>,
    expected: usize,
    finished: bool,
}

impl<'a> WriteTxn<'a> {
    fn shared(&self) -> &'a Shared {
        &self.writeback.shared
    }

    /// Adds a zero-filled block; its first write-back is a full write.
    pub fn create_block(&mut self, id: BlockId) -> Result<()> {
        let shared = self.shared();
        let mut inner = shared.inner.lock();
        inner.check_poisoned()?;
        if inner.cache.lookup(id).is_some() {
            return Err(PatchworkError::InvalidOwned(format!(
                "block {id} already exists"
            )));
        }
        inner.tracker.cancel_tombstone(id);
        inner.catalog.drop_block(id);
        let seq = inner.state.allocate_seq();
        let data = vec![0u8; shared.options.block_size].into_boxed_slice();
        let handle = inner.cache.insert(id, data, Recency::default())?;
        inner.tracker.track(id, DirtyEntry::created(handle, seq));
        debug!(block = %id, seq = seq.0, "writeback.block.create");
        Ok(())
    }

    fn mutate(
        &mut self,
        id: BlockId,
        build: impl FnOnce(BlockSeq, PatchCounter, &[u8]) -> Result<Patch>,
    ) -> Result<()> {
        let shared = self.shared();
        let mut inner = shared.inner.lock();
        inner.check_poisoned()?;
        let handle = inner.ensure_cached(shared.store.as_ref(), id)?;
        let Some(entry) = inner.tracker.get(id) else {
            return Err(PatchworkError::NotFound);
        };
        let (seq, counter, needs_full) =
            (entry.block_seq, entry.patch_counter.next(), entry.needs_full_flush);
        let buf = inner.cache.buffer(handle)?;
        let mut data = buf.write();
        let patch = build(seq, counter, &data)?;
        let full = needs_full
            || inner.prefers_full_write(id, patch.serialized_size(), shared.options.block_size);
        patch.apply_to_buf(&mut data)?;
        drop(data);
        if full {
            inner.tracker.set_needs_full_flush(id);
        } else {
            if let Some(entry) = inner.tracker.get_mut(id) {
                entry.patch_counter = counter;
            }
            inner.catalog.add(patch);
            inner.tracker.set_dirty(id);
        }
        Ok(())
    }

    /// Mutates a block in place through a patch.
    ///
    /// When the block already needs a full write, or its pending patches
    /// would exceed the current ratio budget, the change is applied directly
    /// and the block is flagged for a full write instead.
    pub fn apply_patch(&mut self, id: BlockId, op: PatchOp) -> Result<()> {
        self.mutate(id, |seq, counter, _| Ok(Patch::new(id, seq, counter, op)))
    }

    /// Removes a leaf entry, recording its deletion at `max(leaf timestamp, timestamp)`.
    pub fn leaf_remove(&mut self, id: BlockId, timestamp: Timestamp, key: &[u8]) -> Result<()> {
        self.mutate(id, |seq, counter, data| {
            Patch::leaf_remove(id, seq, counter, leaf::timestamp(data)?, timestamp, key)
        })
    }

    /// Removes a leaf entry without recording history.
    pub fn leaf_erase_presence(&mut self, id: BlockId, key: &[u8]) -> Result<()> {
        let op = PatchOp::leaf_erase_presence(key)?;
        self.mutate(id, |seq, counter, _| Ok(Patch::new(id, seq, counter, op)))
    }

    /// Rewrites a block wholesale; it will be written in full.
    pub fn rewrite(&mut self, id: BlockId, f: impl FnOnce(&mut [u8]) -> Result<()>) -> Result<()> {
        let shared = self.shared();
        let mut inner = shared.inner.lock();
        inner.check_poisoned()?;
        let handle = inner.ensure_cached(shared.store.as_ref(), id)?;
        let buf = inner.cache.buffer(handle)?;
        f(&mut buf.write())?;
        inner.tracker.set_needs_full_flush(id);
        Ok(())
    }

    /// Records an access; only the recency stamp is written back.
    pub fn touch(&mut self, id: BlockId, recency: Recency) -> Result<()> {
        let shared = self.shared();
        let mut inner = shared.inner.lock();
        inner.check_poisoned()?;
        let handle = inner.ensure_cached(shared.store.as_ref(), id)?;
        inner.cache.set_recency(handle, recency)?;
        inner.tracker.set_recency_dirty(id);
        Ok(())
    }

    /// Deletes a block; a tombstone is written by the next cycle.
    pub fn delete_block(&mut self, id: BlockId, write_zeroed: bool) -> Result<()> {
        let shared = self.shared();
        let mut inner = shared.inner.lock();
        inner.check_poisoned()?;
        if let Some(handle) = inner.cache.lookup(id) {
            inner.cache.remove(handle)?;
        }
        inner.catalog.drop_block(id);
        inner.tracker.mark_deleted(id, write_zeroed);
        debug!(block = %id, write_zeroed, "writeback.block.delete");
        Ok(())
    }

    /// Whether a patch of `extra_bytes` should be replaced by a full write.
    pub fn prefers_full_write(&self, id: BlockId, extra_bytes: usize) -> bool {
        let shared = self.shared();
        let inner = shared.inner.lock();
        let needs_full = inner
            .tracker
            .get(id)
            .map(|entry| entry.needs_full_flush)
            .unwrap_or(false);
        needs_full || inner.prefers_full_write(id, extra_bytes, shared.options.block_size)
    }

    /// Commits the transaction, starting a sync if the dirty count is above
    /// the configured threshold.
    pub fn commit(mut self) -> Result<()> {
        self.finish(true)
    }

    fn finish(&mut self, commit: bool) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let shared = &self.writeback.shared;
        let mut inner = shared.inner.lock();
        inner.state.expected_changes = inner.state.expected_changes.saturating_sub(self.expected);
        if commit {
            inner.state.last_activity = Instant::now();
        }
        shared.admission.notify_all();
        if commit && inner.tracker.dirty_count() > shared.options.flush_dirty_size {
            maybe_start_cycle(shared, &mut inner, SyncReason::DirtyThreshold);
        }
        inner.check_poisoned()
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        let _ = self.finish(false);
    }
}
