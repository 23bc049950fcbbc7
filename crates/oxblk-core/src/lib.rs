#![forbid(unsafe_code)]
//! Host-side flash translation layer over open-channel SSDs.
//!
//! The target exposes a flat logical sector space backed by raw erase
//! blocks. Writes land in a ring-buffered cache and complete immediately;
//! a dedicated drainer maps them round-robin across LUNs at device write
//! granularity and a completion pipeline commits durability strictly in
//! ring order. Reads blend cache hits with device reads. Grown-bad blocks
//! are recovered transparently, their live data re-issued through the same
//! write cache the collector uses.
//!
//! All shared state hangs off one [`FtlInner`] context passed explicitly to
//! the workers; nothing is ambient.

mod block;
mod complete;
mod drain;
mod l2p;
mod map;
mod provision;
mod read;
mod rlpg;
mod write;
mod ws;

pub use block::BlockState;
pub use oxblk_ring::{FlushSignal, GcBuf};
pub use rlpg::{decode as decode_recovery_page, RecoveryPage};
pub use write::WriteOutcome;

use block::BlockTable;
use l2p::L2pMap;
use oxblk_error::{FtlError, Result};
use oxblk_media::{DeviceOp, DeviceRq, MediaManager, SectorMeta};
use oxblk_ring::RingBuffer;
use oxblk_types::{BlockId, DevPpa, Geometry, Lba, Ppa, ADDR_EMPTY};
use parking_lot::Mutex;
use provision::Provisioner;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use write::WriteLimiter;
use ws::JobSender;

/// Tunables. Defaults match the original target's constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtlConfig {
    /// Ring-buffer entries; a power of two, at least `max_write_pgs`.
    pub ring_entries: u64,
    /// Admission cap on inflight write sectors.
    pub inflight_cap: u64,
    /// Pre-erased blocks kept per LUN.
    pub pool_queue_depth: usize,
    /// Free-block threshold below which a LUN enters emergency GC.
    pub emergency_free_blocks: usize,
    /// Drainer idle backoff in milliseconds.
    pub drain_idle_ms: u64,
    /// Provisioner timer period in milliseconds.
    pub prov_interval_ms: u64,
}

impl Default for FtlConfig {
    fn default() -> Self {
        Self {
            ring_entries: 1024,
            inflight_cap: 400_000,
            pool_queue_depth: 1,
            emergency_free_blocks: 2,
            drain_idle_ms: 2,
            prov_interval_ms: 10,
        }
    }
}

/// Monotonic counters, snapshotted with [`Ftl::metrics`].
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub buffered_writes: AtomicU64,
    pub gc_writes: AtomicU64,
    pub cache_hit_reads: AtomicU64,
    pub device_reads: AtomicU64,
    pub zero_fill_reads: AtomicU64,
    pub padded_secs: AtomicU64,
    pub requeues: AtomicU64,
    pub write_failures: AtomicU64,
    pub recovered_secs: AtomicU64,
    pub blocks_closed: AtomicU64,
    pub blocks_retired: AtomicU64,
    pub blocks_bad: AtomicU64,
}

/// Point-in-time metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtlMetrics {
    pub buffered_writes: u64,
    pub gc_writes: u64,
    pub cache_hit_reads: u64,
    pub device_reads: u64,
    pub zero_fill_reads: u64,
    pub padded_secs: u64,
    pub requeues: u64,
    pub write_failures: u64,
    pub recovered_secs: u64,
    pub blocks_closed: u64,
    pub blocks_retired: u64,
    pub blocks_bad: u64,
    pub inflight_writes: u64,
}

impl Counters {
    fn snapshot(&self, inflight: u64) -> FtlMetrics {
        FtlMetrics {
            buffered_writes: self.buffered_writes.load(Ordering::Relaxed),
            gc_writes: self.gc_writes.load(Ordering::Relaxed),
            cache_hit_reads: self.cache_hit_reads.load(Ordering::Relaxed),
            device_reads: self.device_reads.load(Ordering::Relaxed),
            zero_fill_reads: self.zero_fill_reads.load(Ordering::Relaxed),
            padded_secs: self.padded_secs.load(Ordering::Relaxed),
            requeues: self.requeues.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            recovered_secs: self.recovered_secs.load(Ordering::Relaxed),
            blocks_closed: self.blocks_closed.load(Ordering::Relaxed),
            blocks_retired: self.blocks_retired.load(Ordering::Relaxed),
            blocks_bad: self.blocks_bad.load(Ordering::Relaxed),
            inflight_writes: inflight,
        }
    }
}

/// Per-LUN block lists. Bad blocks drop off both lists; their state lives
/// on the block itself.
#[derive(Debug, Default)]
pub(crate) struct LunLists {
    pub open: Vec<BlockId>,
    pub closed: Vec<BlockId>,
}

impl LunLists {
    pub(crate) fn remove_open(&mut self, id: BlockId) -> bool {
        remove_id(&mut self.open, id)
    }

    pub(crate) fn remove_closed(&mut self, id: BlockId) -> bool {
        remove_id(&mut self.closed, id)
    }
}

fn remove_id(list: &mut Vec<BlockId>, id: BlockId) -> bool {
    match list.iter().position(|x| *x == id) {
        Some(idx) => {
            list.swap_remove(idx);
            true
        }
        None => false,
    }
}

#[derive(Debug)]
pub(crate) struct Lun {
    pub id: u32,
    /// Current open block the mapper appends to.
    pub cur: Mutex<Option<BlockId>>,
    pub lists: Mutex<LunLists>,
}

/// Wakeup latch for the worker threads.
pub(crate) struct Kick {
    flag: StdMutex<bool>,
    cv: Condvar,
}

impl Kick {
    fn new() -> Self {
        Self {
            flag: StdMutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn kick(&self) {
        let mut flag = self
            .flag
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *flag = true;
        drop(flag);
        self.cv.notify_all();
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) {
        let mut flag = self
            .flag
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !*flag {
            let (next, _) = self
                .cv
                .wait_timeout(flag, timeout)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            flag = next;
        }
        *flag = false;
    }
}

/// Process-wide shared state, passed explicitly to every worker.
pub(crate) struct FtlInner {
    pub geo: Geometry,
    pub cfg: FtlConfig,
    pub media: Arc<dyn MediaManager>,
    pub rb: RingBuffer,
    pub l2p: L2pMap,
    pub blocks: BlockTable,
    pub luns: Vec<Lun>,
    pub next_lun: AtomicU32,
    pub limiter: WriteLimiter,
    /// Out-of-order completions; manipulated only under the ring's sync
    /// session.
    pub pending: Mutex<Vec<complete::PendingCompletion>>,
    pub drain_kick: Kick,
    pub prov_kick: Kick,
    pub prov: Provisioner,
    pub ws: JobSender,
    pub stopping: AtomicBool,
    pub stats: Counters,
}

/// The translation layer. Owns its worker threads; call
/// [`Ftl::shutdown`] for a graceful teardown that pads and closes open
/// blocks.
pub struct Ftl {
    inner: Arc<FtlInner>,
    drain: Option<JoinHandle<()>>,
    prov: Option<JoinHandle<()>>,
    ws: Option<JoinHandle<()>>,
}

impl Ftl {
    pub fn new(media: Arc<dyn MediaManager>, cfg: FtlConfig) -> Result<Self> {
        let geo = media.geometry();
        if !rlpg::fits(&geo) {
            return Err(FtlError::Geometry(
                "recovery metadata does not fit the reserved last page".to_owned(),
            ));
        }
        if cfg.ring_entries < u64::from(geo.max_write_pgs) {
            return Err(FtlError::Geometry(format!(
                "ring of {} entries cannot hold a {}-sector write",
                cfg.ring_entries, geo.max_write_pgs
            )));
        }

        let rb = RingBuffer::new(cfg.ring_entries, geo.sec_size as usize)?;
        let luns = (0..geo.nr_luns)
            .map(|id| Lun {
                id,
                cur: Mutex::new(None),
                lists: Mutex::new(LunLists::default()),
            })
            .collect();

        let inner = Arc::new(FtlInner {
            rb,
            l2p: L2pMap::new(geo.nr_secs()),
            blocks: BlockTable::new(geo),
            luns,
            next_lun: AtomicU32::new(0),
            limiter: WriteLimiter::new(cfg.inflight_cap),
            pending: Mutex::new(Vec::new()),
            drain_kick: Kick::new(),
            prov_kick: Kick::new(),
            prov: Provisioner::new(geo.nr_luns, cfg.pool_queue_depth),
            ws: JobSender::default(),
            stopping: AtomicBool::new(false),
            stats: Counters::default(),
            media,
            geo,
            cfg,
        });

        // Fill the pools before the first write can reach the mapper.
        provision::provision_pass(&inner);

        let (tx, rx) = mpsc::channel();
        inner.ws.set(tx);

        let ws_inner = Arc::clone(&inner);
        let ws = std::thread::Builder::new()
            .name("oxblk-ws".to_owned())
            .spawn(move || ws::run(&ws_inner, rx))
            .map_err(FtlError::Io)?;
        let drain_inner = Arc::clone(&inner);
        let drain = std::thread::Builder::new()
            .name("oxblk-drain".to_owned())
            .spawn(move || drain::run(&drain_inner))
            .map_err(FtlError::Io)?;
        let prov_inner = Arc::clone(&inner);
        let prov = std::thread::Builder::new()
            .name("oxblk-prov".to_owned())
            .spawn(move || provision::run(&prov_inner))
            .map_err(FtlError::Io)?;

        info!(
            target: "oxblk::core",
            luns = inner.geo.nr_luns,
            nr_secs = inner.geo.nr_secs(),
            min_write = inner.geo.min_write_secs(),
            "target up"
        );
        Ok(Self {
            inner,
            drain: Some(drain),
            prov: Some(prov),
            ws: Some(ws),
        })
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.inner.geo
    }

    #[must_use]
    pub fn config(&self) -> &FtlConfig {
        &self.inner.cfg
    }

    /// Buffer a write. `Requeue` is backpressure, not failure: the caller
    /// retries. A preflush submission returns a [`FlushSignal`] that fires
    /// once everything up to the flush point is durable.
    pub fn submit_write(&self, lba: Lba, data: &[u8], preflush: bool) -> Result<WriteOutcome> {
        write::buffer_write(&self.inner, lba, data, preflush)
    }

    /// Write with a retry loop around backpressure.
    pub fn write(&self, lba: Lba, data: &[u8]) -> Result<()> {
        loop {
            match self.submit_write(lba, data, false) {
                Ok(_) => return Ok(()),
                Err(FtlError::Requeue) => {
                    self.inner.drain_kick.kick();
                    std::thread::yield_now();
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Flush: everything buffered so far is durable on return.
    pub fn flush(&self) -> Result<()> {
        match self.submit_write(Lba(0), &[], true)? {
            WriteOutcome::Done => Ok(()),
            WriteOutcome::Pending(signal) => signal.wait(),
        }
    }

    /// Read `out.len() / sec_size` sectors starting at `lba`. Unmapped
    /// sectors read as zeros.
    pub fn read(&self, lba: Lba, out: &mut [u8]) -> Result<()> {
        read::submit_read(&self.inner, lba, out)
    }

    /// Drop the mapping for a range of sectors.
    pub fn discard(&self, lba: Lba, nr_secs: u64) -> Result<()> {
        let end = lba
            .checked_add(nr_secs)
            .ok_or_else(|| FtlError::Malformed("discard range overflow".to_owned()))?;
        if end.0 > self.inner.geo.nr_secs() {
            return Err(FtlError::Malformed(format!(
                "discard range [{lba}, {end}) outside capacity {}",
                self.inner.geo.nr_secs()
            )));
        }
        let retire = self.inner.l2p.invalidate_range(lba, nr_secs, &self.inner.blocks);
        for blk in retire {
            complete::schedule_retire(&self.inner, blk);
        }
        Ok(())
    }

    /// Garbage-collector write path: a scattered LBA list ([`ADDR_EMPTY`]
    /// slots skipped) over a compact shared buffer. Admitted under
    /// emergency GC; `Requeue` still means retry.
    pub fn write_gc(&self, lba_list: &[u64], data: Vec<u8>) -> Result<()> {
        let sec_size = self.inner.geo.sec_size as usize;
        let live = lba_list.iter().filter(|l| **l != ADDR_EMPTY).count();
        if data.len() != live * sec_size {
            return Err(FtlError::Malformed(format!(
                "gc buffer {} bytes for {live} live sectors",
                data.len()
            )));
        }
        let buf = GcBuf::new(data);
        let entries: Vec<(u64, Option<DevPpa>)> =
            lba_list.iter().map(|lba| (*lba, None)).collect();
        write::write_list_to_cache(&self.inner, &entries, &buf)
    }

    #[must_use]
    pub fn metrics(&self) -> FtlMetrics {
        self.inner.stats.snapshot(self.inner.limiter.inflight())
    }

    /// Whether any LUN is rejecting user writes to let GC catch up.
    #[must_use]
    pub fn emergency_gc(&self) -> bool {
        self.inner.prov.any_emergency()
    }

    /// Current mapping of an LBA; introspection for tooling and tests.
    #[must_use]
    pub fn lookup(&self, lba: Lba) -> Ppa {
        self.inner.l2p.lookup(lba).ppa
    }

    /// Lifecycle state of a physical block; introspection for tooling and
    /// tests.
    #[must_use]
    pub fn block_state(&self, lun: u32, blk: u32) -> BlockState {
        self.inner.blocks.get(self.inner.geo.block_id(lun, blk)).state()
    }

    /// Invalidated sectors on a physical block, padding included.
    #[must_use]
    pub fn block_invalid(&self, lun: u32, blk: u32) -> u64 {
        self.inner
            .blocks
            .get(self.inner.geo.block_id(lun, blk))
            .lock()
            .nr_invalid
    }

    /// Graceful teardown: flush the ring, pad every open block up to its
    /// recovery page so it can close, return untouched blocks unpadded,
    /// and join the workers.
    pub fn shutdown(mut self) -> Result<()> {
        info!(target: "oxblk::core", "shutting down");
        self.flush()?;
        self.pad_open_blocks()?;
        self.stop_workers();

        // Hand pooled pre-erased blocks back.
        for lun in 0..self.inner.geo.nr_luns {
            while let Some(id) = self.inner.queues_pop(lun) {
                let block = self.inner.blocks.get(id);
                self.inner.media.put_blk(block.lun, block.blk);
            }
        }
        Ok(())
    }

    /// Pad partially written open blocks to closure; return empty ones.
    fn pad_open_blocks(&self) -> Result<()> {
        let inner = &self.inner;
        let geo = inner.geo;
        let min = u64::from(geo.min_write_secs());
        let max = u64::from(geo.max_write_pgs);
        let sec_size = geo.sec_size as usize;

        for lun in &inner.luns {
            let open: Vec<BlockId> = lun.lists.lock().open.clone();
            for blk_id in open {
                let block = inner.blocks.get(blk_id);
                let (free, untouched, skip) = {
                    let g = block.lock();
                    (
                        geo.nr_blk_dsecs() - g.cur_sec,
                        g.cur_sec == 0,
                        g.st != BlockState::Open,
                    )
                };
                if skip {
                    // Full/closing blocks finish on their own; bad blocks
                    // are the recovery worker's problem.
                    continue;
                }
                if untouched {
                    block.lock().st = BlockState::Free;
                    lun.lists.lock().remove_open(blk_id);
                    inner.media.put_blk(block.lun, block.blk);
                    continue;
                }

                debug!(
                    target: "oxblk::core",
                    blk = %blk_id,
                    secs = free,
                    "padding open block for close"
                );
                let mut remaining = free;
                while remaining > 0 {
                    let chunk = remaining.min(max);
                    let mut ppas = Vec::with_capacity(chunk as usize);
                    let mut metas: Vec<SectorMeta> = Vec::with_capacity(chunk as usize);
                    let mut left = chunk;
                    while left > 0 {
                        map::map_pad_group(inner, blk_id, &mut ppas, &mut metas)?;
                        left -= min;
                    }
                    let signal = FlushSignal::new();
                    let ctx = complete::RqCtx::Pad {
                        blk: blk_id,
                        signal: signal.clone(),
                    };
                    let rq = DeviceRq {
                        op: DeviceOp::Write,
                        ppas,
                        data: vec![0_u8; chunk as usize * sec_size],
                        meta: metas,
                    };
                    let cb_inner = Arc::clone(inner);
                    inner.media.submit_io(
                        rq,
                        Box::new(move |rq, status| {
                            complete::end_io_write(&cb_inner, rq, status, ctx);
                        }),
                    )?;
                    signal.wait()?;
                    remaining -= chunk;
                }
            }
        }

        // Close completions land on the media callback thread; wait for the
        // open lists to empty out.
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let busy = inner.luns.iter().any(|l| !l.lists.lock().open.is_empty());
            if !busy {
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(FtlError::Media(
                    "timed out waiting for open blocks to close".to_owned(),
                ));
            }
            std::thread::yield_now();
        }
    }

    fn stop_workers(&mut self) {
        self.inner.stopping.store(true, Ordering::Release);
        self.inner.drain_kick.kick();
        self.inner.prov_kick.kick();
        if let Some(handle) = self.drain.take() {
            if handle.join().is_err() {
                error!(target: "oxblk::core", "drainer panicked");
            }
        }
        if let Some(handle) = self.prov.take() {
            if handle.join().is_err() {
                error!(target: "oxblk::core", "provisioner panicked");
            }
        }
        self.inner.ws.close();
        if let Some(handle) = self.ws.take() {
            if handle.join().is_err() {
                error!(target: "oxblk::core", "block worker panicked");
            }
        }
    }
}

impl Drop for Ftl {
    fn drop(&mut self) {
        if self.drain.is_some() || self.prov.is_some() || self.ws.is_some() {
            self.stop_workers();
        }
    }
}

impl FtlInner {
    /// Pop a pooled block id; teardown helper.
    pub(crate) fn queues_pop(&self, lun: u32) -> Option<BlockId> {
        self.prov.pop_raw(lun)
    }
}
