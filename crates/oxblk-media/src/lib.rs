#![forbid(unsafe_code)]
//! Media-manager contract and the in-memory reference device.
//!
//! The [`MediaManager`] trait is the boundary between the translation layer
//! and whatever owns the raw flash: block ownership (get/put/erase/mark),
//! geometry, and asynchronous I/O submission with per-sector completion
//! status. [`RamMedia`] implements it over plain memory with a dedicated
//! completion thread and fault-injection hooks, standing in for a real
//! open-channel device in tests and the harness.

use oxblk_error::{FtlError, Result};
use oxblk_types::{DevPpa, Geometry, ADDR_EMPTY};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, trace, warn};

/// Direction of a device request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOp {
    Read,
    Write,
}

/// Per-sector out-of-band metadata written alongside the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorMeta {
    /// Owning LBA, or [`ADDR_EMPTY`] for padding sectors.
    pub lba: u64,
}

impl SectorMeta {
    pub const EMPTY: Self = Self { lba: ADDR_EMPTY };
}

/// A device request: scattered sector addresses plus a flat data buffer.
///
/// `data` is `ppas.len() * sec_size` bytes: the payload for writes, the
/// destination for reads (filled in before the completion callback runs).
#[derive(Debug)]
pub struct DeviceRq {
    pub op: DeviceOp,
    pub ppas: Vec<DevPpa>,
    pub data: Vec<u8>,
    /// One entry per sector for writes; empty for reads.
    pub meta: Vec<SectorMeta>,
}

/// Per-sector completion status. Bit `i` set means sector `i` failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoStatus {
    pub failed: u64,
}

impl IoStatus {
    pub const OK: Self = Self { failed: 0 };

    #[must_use]
    pub fn is_ok(self) -> bool {
        self.failed == 0
    }

    #[must_use]
    pub fn sector_failed(self, idx: usize) -> bool {
        idx < 64 && self.failed & (1 << idx) != 0
    }

    #[must_use]
    pub fn nr_failed(self) -> u32 {
        self.failed.count_ones()
    }
}

/// Completion callback; runs on the device's callback thread.
pub type IoDone = Box<dyn FnOnce(DeviceRq, IoStatus) + Send>;

/// Contract consumed from the media manager.
pub trait MediaManager: Send + Sync {
    fn geometry(&self) -> Geometry;

    /// Take ownership of a free block on `lun`, or `None` if the LUN is
    /// exhausted.
    fn get_blk(&self, lun: u32) -> Option<u32>;

    /// Return a block. Blocks previously marked bad are retired, not reused.
    fn put_blk(&self, lun: u32, blk: u32);

    /// Erase a block in place. On error the caller is expected to mark the
    /// block bad and retire it.
    fn erase_blk(&self, lun: u32, blk: u32) -> Result<()>;

    /// Flag the erase block containing `ppa` as grown-bad.
    fn mark_blk_bad(&self, ppa: DevPpa);

    /// Free blocks remaining on `lun` (excludes bad blocks).
    fn free_blocks(&self, lun: u32) -> usize;

    /// Submit an asynchronous request. `done` runs exactly once on the
    /// device callback thread with the request and its per-sector status.
    fn submit_io(&self, rq: DeviceRq, done: IoDone) -> Result<()>;
}

// ── In-memory device ────────────────────────────────────────────────────────

struct BlockStore {
    data: Vec<u8>,
    oob: Vec<u64>,
    written: Vec<bool>,
    erases: u64,
    bad: bool,
}

impl BlockStore {
    fn new(secs: usize, sec_size: usize) -> Self {
        Self {
            data: vec![0_u8; secs * sec_size],
            oob: vec![ADDR_EMPTY; secs],
            written: vec![false; secs],
            erases: 0,
            bad: false,
        }
    }

    fn erase(&mut self, secs: usize, sec_size: usize) {
        self.data = vec![0_u8; secs * sec_size];
        self.oob = vec![ADDR_EMPTY; secs];
        self.written = vec![false; secs];
        self.erases += 1;
    }
}

#[derive(Default)]
struct Faults {
    /// Packed PPAs whose next write fails (consumed on trigger).
    fail_write: HashSet<u64>,
    /// `(lun, blk)` pairs whose next erase fails (consumed on trigger).
    fail_erase: HashSet<(u32, u32)>,
}

struct MediaInner {
    geo: Geometry,
    free: Vec<Mutex<VecDeque<u32>>>,
    blocks: Vec<Mutex<BlockStore>>,
    faults: Mutex<Faults>,
}

enum Job {
    Io(DeviceRq, IoDone),
    Stop,
}

/// In-memory open-channel device.
///
/// All I/O completes on a dedicated callback thread, mirroring the
/// interrupt-context dispatch of a real driver. Writes and erases can be
/// made to fail once per injected address, which is how the grown-bad-block
/// paths are exercised.
pub struct RamMedia {
    inner: Arc<MediaInner>,
    tx: Sender<Job>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RamMedia {
    #[must_use]
    pub fn new(geo: Geometry) -> Arc<Self> {
        let secs = geo.secs_per_blk() as usize;
        let sec_size = geo.sec_size as usize;

        let free = (0..geo.nr_luns)
            .map(|_| Mutex::new((0..geo.blks_per_lun).collect::<VecDeque<u32>>()))
            .collect();
        let blocks = (0..geo.nr_blocks())
            .map(|_| Mutex::new(BlockStore::new(secs, sec_size)))
            .collect();

        let inner = Arc::new(MediaInner {
            geo,
            free,
            blocks,
            faults: Mutex::new(Faults::default()),
        });

        let (tx, rx) = mpsc::channel::<Job>();
        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("oxblk-media".to_owned())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    match job {
                        Job::Io(rq, done) => {
                            let status = worker_inner.execute(&rq);
                            let mut rq = rq;
                            if rq.op == DeviceOp::Read {
                                worker_inner.fill_read(&mut rq);
                            }
                            done(rq, status);
                        }
                        Job::Stop => break,
                    }
                }
            })
            .expect("spawn media worker");

        Arc::new(Self {
            inner,
            tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Fail the next write that touches `ppa`.
    pub fn fail_next_write(&self, ppa: DevPpa) {
        self.inner.faults.lock().fail_write.insert(ppa.packed());
    }

    /// Fail the next erase of `(lun, blk)`.
    pub fn fail_next_erase(&self, lun: u32, blk: u32) {
        self.inner.faults.lock().fail_erase.insert((lun, blk));
    }

    /// Raw sector contents, for test inspection.
    #[must_use]
    pub fn sector_data(&self, ppa: DevPpa) -> Vec<u8> {
        let inner = &self.inner;
        let sec_size = inner.geo.sec_size as usize;
        let store = inner.blocks[inner.block_index(ppa.lun(), ppa.blk())].lock();
        let off = inner.geo.paddr_of(ppa) as usize * sec_size;
        store.data[off..off + sec_size].to_vec()
    }

    /// OOB LBA of a sector, for test inspection.
    #[must_use]
    pub fn sector_lba(&self, ppa: DevPpa) -> u64 {
        let inner = &self.inner;
        let store = inner.blocks[inner.block_index(ppa.lun(), ppa.blk())].lock();
        store.oob[inner.geo.paddr_of(ppa) as usize]
    }

    /// Number of sectors written to `(lun, blk)` since the last erase.
    #[must_use]
    pub fn written_sectors(&self, lun: u32, blk: u32) -> usize {
        let store = self.inner.blocks[self.inner.block_index(lun, blk)].lock();
        store.written.iter().filter(|w| **w).count()
    }

    /// Erase count of `(lun, blk)`.
    #[must_use]
    pub fn erase_count(&self, lun: u32, blk: u32) -> u64 {
        self.inner.blocks[self.inner.block_index(lun, blk)].lock().erases
    }
}

impl Drop for RamMedia {
    fn drop(&mut self) {
        let _ = self.tx.send(Job::Stop);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl MediaInner {
    fn block_index(&self, lun: u32, blk: u32) -> usize {
        (lun * self.geo.blks_per_lun + blk) as usize
    }

    fn execute(&self, rq: &DeviceRq) -> IoStatus {
        match rq.op {
            DeviceOp::Write => self.execute_write(rq),
            DeviceOp::Read => IoStatus::OK,
        }
    }

    fn execute_write(&self, rq: &DeviceRq) -> IoStatus {
        let sec_size = self.geo.sec_size as usize;
        let mut failed = 0_u64;

        for (i, ppa) in rq.ppas.iter().enumerate() {
            let injected = self.faults.lock().fail_write.remove(&ppa.packed());
            if injected {
                warn!(
                    target: "oxblk::media",
                    ppa = %ppa,
                    sector = i,
                    "injected write failure"
                );
                failed |= 1 << i;
                continue;
            }

            let mut store = self.blocks[self.block_index(ppa.lun(), ppa.blk())].lock();
            let paddr = self.geo.paddr_of(*ppa) as usize;
            let off = paddr * sec_size;
            store.data[off..off + sec_size].copy_from_slice(&rq.data[i * sec_size..(i + 1) * sec_size]);
            store.oob[paddr] = rq.meta.get(i).map_or(ADDR_EMPTY, |m| m.lba);
            store.written[paddr] = true;
        }

        trace!(
            target: "oxblk::media",
            secs = rq.ppas.len(),
            failed = failed.count_ones(),
            "write executed"
        );
        IoStatus { failed }
    }

    fn fill_read(&self, rq: &mut DeviceRq) {
        let sec_size = self.geo.sec_size as usize;
        for i in 0..rq.ppas.len() {
            let ppa = rq.ppas[i];
            let store = self.blocks[self.block_index(ppa.lun(), ppa.blk())].lock();
            let off = self.geo.paddr_of(ppa) as usize * sec_size;
            rq.data[i * sec_size..(i + 1) * sec_size]
                .copy_from_slice(&store.data[off..off + sec_size]);
        }
    }
}

impl MediaManager for RamMedia {
    fn geometry(&self) -> Geometry {
        self.inner.geo
    }

    fn get_blk(&self, lun: u32) -> Option<u32> {
        let blk = self.inner.free[lun as usize].lock().pop_front();
        if let Some(blk) = blk {
            debug!(target: "oxblk::media", lun, blk, "get_blk");
        }
        blk
    }

    fn put_blk(&self, lun: u32, blk: u32) {
        let bad = self.inner.blocks[self.inner.block_index(lun, blk)].lock().bad;
        if bad {
            debug!(target: "oxblk::media", lun, blk, "put_blk: retiring bad block");
            return;
        }
        debug!(target: "oxblk::media", lun, blk, "put_blk");
        self.inner.free[lun as usize].lock().push_back(blk);
    }

    fn erase_blk(&self, lun: u32, blk: u32) -> Result<()> {
        let injected = self.inner.faults.lock().fail_erase.remove(&(lun, blk));
        if injected {
            error!(target: "oxblk::media", lun, blk, "injected erase failure");
            return Err(FtlError::Media(format!("erase failed: lun {lun} blk {blk}")));
        }

        let secs = self.inner.geo.secs_per_blk() as usize;
        let sec_size = self.inner.geo.sec_size as usize;
        self.inner.blocks[self.inner.block_index(lun, blk)]
            .lock()
            .erase(secs, sec_size);
        Ok(())
    }

    fn mark_blk_bad(&self, ppa: DevPpa) {
        warn!(target: "oxblk::media", ppa = %ppa, "marking block bad");
        self.inner.blocks[self.inner.block_index(ppa.lun(), ppa.blk())]
            .lock()
            .bad = true;
    }

    fn free_blocks(&self, lun: u32) -> usize {
        self.inner.free[lun as usize].lock().len()
    }

    fn submit_io(&self, rq: DeviceRq, done: IoDone) -> Result<()> {
        let sec_size = self.inner.geo.sec_size as usize;
        if rq.data.len() != rq.ppas.len() * sec_size {
            return Err(FtlError::Malformed(format!(
                "payload size mismatch: {} bytes for {} sectors",
                rq.data.len(),
                rq.ppas.len()
            )));
        }
        if rq.op == DeviceOp::Write && rq.meta.len() != rq.ppas.len() {
            return Err(FtlError::Malformed(format!(
                "metadata list mismatch: {} entries for {} sectors",
                rq.meta.len(),
                rq.ppas.len()
            )));
        }

        self.tx
            .send(Job::Io(rq, done))
            .map_err(|_| FtlError::Shutdown)
    }
}
