//! Background block worker.
//!
//! A channel-fed thread for work that must not run on the completion
//! threads: writing a closing block's recovery page, relocating data off a
//! grown-bad block, and retiring fully-invalid blocks back to the media
//! manager. The channel drains completely before the worker exits, so jobs
//! queued during teardown still run.

use crate::block::BlockState;
use crate::complete::{end_io_write, RqCtx};
use crate::{rlpg, write, FtlInner};
use oxblk_error::{FtlError, Result};
use oxblk_media::{DeviceOp, DeviceRq, SectorMeta};
use oxblk_ring::GcBuf;
use oxblk_types::{BlockId, DevPpa, ADDR_EMPTY};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc};
use tracing::{debug, error, info};

pub(crate) enum BlockJob {
    Close(BlockId),
    Recover(BlockId),
    Retire(BlockId),
}

/// Handle for queueing jobs; empty once the worker shuts down.
#[derive(Default)]
pub(crate) struct JobSender {
    tx: Mutex<Option<Sender<BlockJob>>>,
}

impl JobSender {
    pub(crate) fn set(&self, tx: Sender<BlockJob>) {
        *self.tx.lock() = Some(tx);
    }

    pub(crate) fn send(&self, job: BlockJob) {
        let guard = self.tx.lock();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(job);
        }
    }

    /// Drop the sender so the worker drains and exits.
    pub(crate) fn close(&self) {
        self.tx.lock().take();
    }
}

/// Thread body.
pub(crate) fn run(inner: &Arc<FtlInner>, rx: Receiver<BlockJob>) {
    debug!(target: "oxblk::ws", "block worker started");
    while let Ok(job) = rx.recv() {
        match job {
            BlockJob::Close(blk) => close_block(inner, blk),
            BlockJob::Recover(blk) => recover_block(inner, blk),
            BlockJob::Retire(blk) => retire_block(inner, blk),
        }
    }
    debug!(target: "oxblk::ws", "block worker stopped");
}

/// Write the recovery page into the block's last physical page.
fn close_block(inner: &Arc<FtlInner>, blk_id: BlockId) {
    let block = inner.blocks.get(blk_id);
    let data = {
        let mut g = block.lock();
        match g.st {
            BlockState::Open | BlockState::Full => {}
            // Bad blocks go through recovery; duplicate close requests are
            // dropped.
            _ => return,
        }
        g.st = BlockState::Closing;
        rlpg::encode(&g, rlpg::BLK_META_CLOSED, &inner.geo)
    };

    let min = u64::from(inner.geo.min_write_secs());
    let dsecs = inner.geo.nr_blk_dsecs();
    let ppas: Vec<DevPpa> = (0..min)
        .map(|i| inner.geo.dev_ppa(block.lun, block.blk, dsecs + i))
        .collect();
    let rq = DeviceRq {
        op: DeviceOp::Write,
        ppas,
        data,
        meta: vec![SectorMeta::EMPTY; min as usize],
    };

    debug!(target: "oxblk::ws", blk = %blk_id, "closing block");
    let ctx = RqCtx::Close { blk: blk_id };
    let cb_inner = Arc::clone(inner);
    if let Err(err) = inner.media.submit_io(
        rq,
        Box::new(move |rq, status| end_io_write(&cb_inner, rq, status, ctx)),
    ) {
        error!(target: "oxblk::ws", blk = %blk_id, %err, "recovery page submission failed");
    }
}

/// Relocate the still-valid sectors of a grown-bad block through the write
/// cache, then return the block to the media manager.
fn recover_block(inner: &Arc<FtlInner>, blk_id: BlockId) {
    let block = inner.blocks.get(blk_id);
    let geo = inner.geo;

    let victims: Vec<(u64, DevPpa)> = {
        let g = block.lock();
        (0..geo.nr_blk_dsecs())
            .filter(|p| {
                g.sync.test(*p) && !g.invalid.test(*p) && g.lba_list[*p as usize] != ADDR_EMPTY
            })
            .map(|p| {
                (
                    g.lba_list[p as usize],
                    geo.dev_ppa(block.lun, block.blk, p),
                )
            })
            .collect()
    };
    let live_lbas = inner.l2p.filter_mapped(&victims);
    let live: Vec<(u64, DevPpa)> = victims
        .into_iter()
        .filter(|(lba, _)| live_lbas.contains(lba))
        .collect();

    info!(
        target: "oxblk::ws",
        blk = %blk_id,
        live = live.len(),
        "recovering grown-bad block"
    );
    for chunk in live.chunks(geo.max_write_pgs as usize) {
        if let Err(err) = relocate_chunk(inner, chunk) {
            error!(target: "oxblk::ws", blk = %blk_id, %err, "relocation chunk failed");
        }
    }

    {
        let mut lists = inner.luns[block.lun as usize].lists.lock();
        lists.remove_open(blk_id);
        lists.remove_closed(blk_id);
    }
    inner.media.put_blk(block.lun, block.blk);
}

fn relocate_chunk(inner: &Arc<FtlInner>, chunk: &[(u64, DevPpa)]) -> Result<()> {
    let sec_size = inner.geo.sec_size as usize;
    let ppas: Vec<DevPpa> = chunk.iter().map(|(_, ppa)| *ppa).collect();

    let rq = DeviceRq {
        op: DeviceOp::Read,
        ppas,
        data: vec![0_u8; chunk.len() * sec_size],
        meta: Vec::new(),
    };
    let (tx, rx) = mpsc::channel();
    inner.media.submit_io(
        rq,
        Box::new(move |rq, status| {
            let _ = tx.send((rq, status));
        }),
    )?;
    let (rq, status) = rx.recv().map_err(|_| FtlError::Shutdown)?;
    if !status.is_ok() {
        return Err(FtlError::ReadFailed {
            failed: status.nr_failed(),
            total: chunk.len() as u32,
        });
    }

    let buf = GcBuf::new(rq.data);
    let entries: Vec<(u64, Option<DevPpa>)> =
        chunk.iter().map(|(lba, ppa)| (*lba, Some(*ppa))).collect();
    loop {
        match write::write_list_to_cache(inner, &entries, &buf) {
            Ok(()) => return Ok(()),
            Err(FtlError::Requeue) => {
                if inner.stopping.load(Ordering::Acquire) {
                    return Err(FtlError::Shutdown);
                }
                inner.drain_kick.kick();
                std::thread::yield_now();
            }
            Err(err) => return Err(err),
        }
    }
}

/// Return a fully-invalid closed block to the media manager.
fn retire_block(inner: &Arc<FtlInner>, blk_id: BlockId) {
    let block = inner.blocks.get(blk_id);
    {
        let mut g = block.lock();
        if g.st != BlockState::Closed {
            return;
        }
        g.st = BlockState::Retired;
    }
    inner.luns[block.lun as usize]
        .lists
        .lock()
        .remove_closed(blk_id);
    inner.media.put_blk(block.lun, block.blk);
    inner.stats.blocks_retired.fetch_add(1, Ordering::Relaxed);
    debug!(target: "oxblk::ws", blk = %blk_id, "block retired");
}
