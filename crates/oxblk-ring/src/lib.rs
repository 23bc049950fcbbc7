#![forbid(unsafe_code)]
//! Ring-buffered write cache.
//!
//! A power-of-two ring of sector-sized entries with three cursors:
//!
//! - `mem`: producer head; host writes reserve and fill entries here.
//! - `subm`: submit cursor; the single drainer commits entries for device
//!   submission by advancing it.
//! - `sync`: persisted tail; the completion pipeline advances it strictly in
//!   ring order once device writes are durable.
//!
//! Cursors are monotonic `u64` positions; the entry index is the position
//! masked by the ring size. Invariants: `sync ≤ subm ≤ mem` and
//! `mem − sync ≤ capacity`. A slot is reusable only once `sync` has passed
//! it, which is also the point where the L2P can no longer reach it.
//!
//! Flush semantics ride on sync points: a preflush bio marks the current
//! `mem` position and is completed when `sync` reaches it.

use oxblk_error::{FtlError, Result};
use oxblk_types::{BlockId, DevPpa, WriteKind, ADDR_EMPTY};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::time::Duration;
use tracing::{debug, trace};

// ── Completion latch ────────────────────────────────────────────────────────

#[derive(Debug)]
struct SignalInner {
    state: StdMutex<Option<std::result::Result<(), String>>>,
    cv: Condvar,
}

/// One-shot completion latch handed out to flush and pad submitters.
///
/// Clones share the latch; the first `complete_*` wins and wakes all waiters.
#[derive(Debug, Clone)]
pub struct FlushSignal {
    inner: Arc<SignalInner>,
}

impl FlushSignal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                state: StdMutex::new(None),
                cv: Condvar::new(),
            }),
        }
    }

    pub fn complete_ok(&self) {
        self.complete(Ok(()));
    }

    pub fn complete_err(&self, msg: String) {
        self.complete(Err(msg));
    }

    fn complete(&self, outcome: std::result::Result<(), String>) {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.is_none() {
            *state = Some(outcome);
        }
        drop(state);
        self.inner.cv.notify_all();
    }

    /// Block until the latch fires.
    pub fn wait(&self) -> Result<()> {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if let Some(outcome) = state.as_ref() {
                return outcome.clone().map_err(FtlError::Media);
            }
            state = self
                .inner
                .cv
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Block until the latch fires or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(outcome) = state.as_ref() {
                return Some(outcome.clone().map_err(FtlError::Media));
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (next, timed_out) = self
                .inner
                .cv
                .wait_timeout(state, remaining)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state = next;
            if timed_out.timed_out() && state.is_none() {
                return None;
            }
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_some()
    }
}

impl Default for FlushSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ── GC buffer handle ────────────────────────────────────────────────────────

/// Shared buffer backing a GC relocation batch.
///
/// Each ring entry derived from the batch holds one clone; the data is freed
/// when the last entry drains through the sync cursor.
#[derive(Debug, Clone)]
pub struct GcBuf {
    data: Arc<Vec<u8>>,
}

impl GcBuf {
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
        }
    }

    /// Sector `idx` of the batch.
    #[must_use]
    pub fn sector(&self, idx: usize, sec_size: usize) -> &[u8] {
        &self.data[idx * sec_size..(idx + 1) * sec_size]
    }

    /// Live references, the batch's own handle included.
    #[must_use]
    pub fn refs(&self) -> usize {
        Arc::strong_count(&self.data)
    }
}

// ── Write context ───────────────────────────────────────────────────────────

/// Per-entry write context.
///
/// `paddr`/`ppa`/`blk` are stamped by the mapper at drain time; until then
/// the entry is addressable only as a cacheline. The sync backpointer
/// guarantees a single owner for each field at any stage, so no lock beyond
/// the entry mutex is needed.
#[derive(Debug, Clone)]
pub struct WriteCtx {
    pub lba: u64,
    pub kind: WriteKind,
    /// Completion latch for a preflush-carrying data bio; attached to the
    /// bio's last entry and fired when that entry syncs.
    pub flush: Option<FlushSignal>,
    /// Keeps the GC batch buffer alive until this entry drains.
    pub gc_ref: Option<GcBuf>,
    /// Block-local sector assigned at drain, `ADDR_EMPTY` before.
    pub paddr: u64,
    /// Device address assigned at drain.
    pub ppa: Option<DevPpa>,
    /// Owning block assigned at drain.
    pub blk: Option<BlockId>,
}

impl WriteCtx {
    #[must_use]
    pub fn user(lba: u64) -> Self {
        Self {
            lba,
            kind: WriteKind::User,
            flush: None,
            gc_ref: None,
            paddr: ADDR_EMPTY,
            ppa: None,
            blk: None,
        }
    }

    #[must_use]
    pub fn gc(lba: u64, buf: GcBuf) -> Self {
        Self {
            lba,
            kind: WriteKind::Gc,
            flush: None,
            gc_ref: Some(buf),
            paddr: ADDR_EMPTY,
            ppa: None,
            blk: None,
        }
    }
}

struct RbEntry {
    data: Box<[u8]>,
    w_ctx: WriteCtx,
    /// Monotonic position this entry was last filled for. Lets the drainer
    /// detect a reserved-but-not-yet-filled slot without a flag that would
    /// need clearing on reuse.
    seq: u64,
}

// ── Ring buffer ─────────────────────────────────────────────────────────────

struct SyncPointState {
    /// Position `sync` must reach to satisfy the latest preflush.
    point: Option<u64>,
    /// Dataless flush bios parked until `sync` reaches their position.
    waiters: Vec<(u64, FlushSignal)>,
}

/// The ring. One producer lock (host writers serialize reservations), one
/// reader lock (single drainer), one sync lock (completion ordering).
pub struct RingBuffer {
    entries: Vec<Mutex<RbEntry>>,
    size: u64,
    mask: u64,
    sec_size: usize,
    mem: AtomicU64,
    subm: AtomicU64,
    sync: AtomicU64,
    w_lock: Mutex<()>,
    r_lock: Mutex<()>,
    s_state: Mutex<SyncPointState>,
}

impl RingBuffer {
    /// Create a ring of `nr_entries` (power of two) sector-sized slots.
    pub fn new(nr_entries: u64, sec_size: usize) -> Result<Self> {
        if nr_entries == 0 || !nr_entries.is_power_of_two() {
            return Err(FtlError::Geometry(format!(
                "ring size must be a power of two, got {nr_entries}"
            )));
        }
        let entries = (0..nr_entries)
            .map(|_| {
                Mutex::new(RbEntry {
                    data: vec![0_u8; sec_size].into_boxed_slice(),
                    w_ctx: WriteCtx::user(ADDR_EMPTY),
                    seq: u64::MAX,
                })
            })
            .collect();
        debug!(target: "oxblk::rb", nr_entries, sec_size, "ring created");
        Ok(Self {
            entries,
            size: nr_entries,
            mask: nr_entries - 1,
            sec_size,
            mem: AtomicU64::new(0),
            subm: AtomicU64::new(0),
            sync: AtomicU64::new(0),
            w_lock: Mutex::new(()),
            r_lock: Mutex::new(()),
            s_state: Mutex::new(SyncPointState {
                point: None,
                waiters: Vec::new(),
            }),
        })
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn sec_size(&self) -> usize {
        self.sec_size
    }

    /// Entry index for a monotonic position.
    #[must_use]
    pub fn wrap(&self, pos: u64) -> u64 {
        pos & self.mask
    }

    /// Entries between the submit cursor and the producer head.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.mem.load(Ordering::Acquire) - self.subm.load(Ordering::Acquire)
    }

    /// Free slots.
    #[must_use]
    pub fn space(&self) -> u64 {
        self.size - (self.mem.load(Ordering::Acquire) - self.sync.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn mem_pos(&self) -> u64 {
        self.mem.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn subm_pos(&self) -> u64 {
        self.subm.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn sync_pos(&self) -> u64 {
        self.sync.load(Ordering::Acquire)
    }

    /// Reserve `nr_commit` entries if at least `nr_req` slots are free,
    /// returning the starting position. The asymmetry lets a caller probe
    /// for a whole batch before committing part of it.
    pub fn may_write(&self, nr_req: u64, nr_commit: u64) -> Option<u64> {
        let _w = self.w_lock.lock();
        let mem = self.mem.load(Ordering::Relaxed);
        let sync = self.sync.load(Ordering::Acquire);
        if self.size - (mem - sync) < nr_req {
            return None;
        }
        self.mem.store(mem + nr_commit, Ordering::Release);
        trace!(target: "oxblk::rb", pos = mem, nr_commit, "reserved");
        Some(mem)
    }

    /// Fill a reserved entry. Only the producer that reserved `pos` may call
    /// this, and exactly once per reservation.
    pub fn write_entry(&self, pos: u64, data: &[u8], w_ctx: WriteCtx) {
        debug_assert_eq!(data.len(), self.sec_size);
        let mut entry = self.entries[self.wrap(pos) as usize].lock();
        entry.data.copy_from_slice(data);
        entry.w_ctx = w_ctx;
        entry.seq = pos;
    }

    /// Take the single-drainer read session.
    pub fn read_session(&self) -> ReadSession<'_> {
        let guard = self.r_lock.lock();
        let avail = self.count();
        ReadSession {
            rb: self,
            _guard: guard,
            avail,
        }
    }

    /// Copy a committed entry's payload out for device submission, waiting
    /// (with a yield) for a producer that reserved but has not yet filled
    /// the slot.
    pub fn drain_entry_data(&self, pos: u64, dst: &mut [u8]) {
        debug_assert_eq!(dst.len(), self.sec_size);
        loop {
            let entry = self.entries[self.wrap(pos) as usize].lock();
            if entry.seq == pos {
                dst.copy_from_slice(&entry.data);
                return;
            }
            drop(entry);
            std::thread::yield_now();
        }
    }

    /// Run `f` against an entry's write context.
    pub fn with_ctx<R>(&self, pos: u64, f: impl FnOnce(&mut WriteCtx) -> R) -> R {
        let mut entry = self.entries[self.wrap(pos) as usize].lock();
        f(&mut entry.w_ctx)
    }

    /// Copy a cached sector into `dst` if the entry still belongs to `lba`.
    ///
    /// The caller must hold the L2P read-in-flight bit for `lba`; the LBA
    /// check is a second line of defense against a stale cacheline.
    #[must_use]
    pub fn cache_read(&self, line: u64, lba: u64, dst: &mut [u8]) -> bool {
        let entry = self.entries[line as usize].lock();
        if entry.w_ctx.lba != lba {
            return false;
        }
        dst.copy_from_slice(&entry.data);
        true
    }

    /// Locate the in-flight entry mapped to `ppa`, scanning the window
    /// between `sync` and `subm`. Used by write-failure recovery.
    #[must_use]
    pub fn sync_scan_entry(&self, ppa: DevPpa) -> Option<u64> {
        let sync = self.sync.load(Ordering::Acquire);
        let subm = self.subm.load(Ordering::Acquire);
        (sync..subm).find(|pos| {
            let entry = self.entries[self.wrap(*pos) as usize].lock();
            entry.w_ctx.ppa == Some(ppa)
        })
    }

    /// Open the sync session. Completion paths serialize on this to restore
    /// ring order before advancing the persisted tail.
    pub fn sync_session(&self) -> SyncSession<'_> {
        SyncSession {
            rb: self,
            guard: self.s_state.lock(),
        }
    }

    /// Install a sync point at the current producer head for a dataless
    /// preflush. Returns `false` (bio can complete immediately) when nothing
    /// is outstanding.
    pub fn sync_point_set(&self, signal: FlushSignal) -> bool {
        let mut state = self.s_state.lock();
        let mem = self.mem.load(Ordering::Acquire);
        if mem == self.sync.load(Ordering::Acquire) {
            return false;
        }
        state.point = Some(mem);
        state.waiters.push((mem, signal));
        debug!(target: "oxblk::rb", point = mem, "sync point set");
        true
    }

    /// Sectors that still need submission to satisfy the pending sync point.
    #[must_use]
    pub fn sync_point_count(&self) -> u64 {
        let state = self.s_state.lock();
        let subm = self.subm.load(Ordering::Acquire);
        state.point.map_or(0, |p| p.saturating_sub(subm))
    }

    /// Clear the sync point once a submitted batch covers it.
    pub fn sync_point_reset(&self, covered: u64) {
        let mut state = self.s_state.lock();
        if let Some(point) = state.point {
            if point <= covered {
                state.point = None;
            }
        }
    }
}

/// Single-drainer read session. Holding it excludes other drainers; commit
/// advances the submit cursor.
pub struct ReadSession<'a> {
    rb: &'a RingBuffer,
    _guard: MutexGuard<'a, ()>,
    avail: u64,
}

impl ReadSession<'_> {
    /// Entries available at session start.
    #[must_use]
    pub fn avail(&self) -> u64 {
        self.avail
    }

    /// Commit `n` entries for submission, returning their starting position.
    pub fn commit(&mut self, n: u64) -> u64 {
        debug_assert!(n <= self.avail);
        let pos = self.rb.subm.load(Ordering::Relaxed);
        self.rb.subm.store(pos + n, Ordering::Release);
        self.avail -= n;
        trace!(target: "oxblk::rb", pos, n, "read commit");
        pos
    }
}

/// Exclusive sync session; see [`RingBuffer::sync_session`].
pub struct SyncSession<'a> {
    rb: &'a RingBuffer,
    guard: MutexGuard<'a, SyncPointState>,
}

impl SyncSession<'_> {
    /// Current persisted tail.
    #[must_use]
    pub fn pos(&self) -> u64 {
        self.rb.sync.load(Ordering::Acquire)
    }

    /// Advance the persisted tail by `n`, waking any dataless flush bios
    /// whose sync point is now covered. Returns the new position.
    pub fn advance(&mut self, n: u64) -> u64 {
        let new = self.pos() + n;
        debug_assert!(new <= self.rb.subm.load(Ordering::Acquire));
        self.rb.sync.store(new, Ordering::Release);

        let fired = &mut self.guard.waiters;
        let mut i = 0;
        while i < fired.len() {
            if fired[i].0 <= new {
                let (pos, signal) = fired.swap_remove(i);
                trace!(target: "oxblk::rb", pos, sync = new, "flush sync point reached");
                signal.complete_ok();
            } else {
                i += 1;
            }
        }
        new
    }
}
