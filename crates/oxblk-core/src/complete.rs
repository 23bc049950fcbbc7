//! Write-completion pipeline.
//!
//! Device completions arrive in any order; the persisted tail must advance
//! in ring order. A completion whose start position matches the sync cursor
//! commits immediately and then drains the pending queue for newly
//! contiguous neighbors; anything else parks in the queue.
//!
//! Committing an entry means: set its sector's sync bit on the owning block
//! (scheduling a close when the bitmap fills), publish the persisted L2P
//! mapping, fire its flush signal, and drop its GC reference, all before
//! the cursor moves past it, so the slot cannot be reused while the L2P can
//! still reach it.
//!
//! A `FAILWRITE` status splits the request: successful runs commit in order,
//! each failed sector is re-issued as a fresh minimum-sized request with a
//! new mapping, and the grown-bad block is queued for recovery.

use crate::block::BlockState;
use crate::ws::BlockJob;
use crate::{map, FtlInner};
use oxblk_error::{FtlError, Result};
use oxblk_media::{DeviceOp, DeviceRq, IoStatus};
use oxblk_ring::{FlushSignal, SyncSession};
use oxblk_types::{BlockId, DevPpa, Lba};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Per-request completion context.
pub(crate) enum RqCtx {
    /// Drained ring entries plus trailing padding.
    Ring {
        sentry: u64,
        nr_valid: u64,
        nr_padded: u64,
    },
    /// Recovery-page write closing a block.
    Close { blk: BlockId },
    /// Teardown padding, waited on synchronously.
    Pad { blk: BlockId, signal: FlushSignal },
}

/// A completion parked until the sync cursor reaches its start.
pub(crate) struct PendingCompletion {
    pub sentry: u64,
    pub nr_valid: u64,
}

pub(crate) fn schedule_close(inner: &FtlInner, blk: BlockId) {
    inner.ws.send(BlockJob::Close(blk));
}

pub(crate) fn schedule_retire(inner: &FtlInner, blk: BlockId) {
    inner.ws.send(BlockJob::Retire(blk));
}

/// Device write completion entry point; runs on the media callback thread.
pub(crate) fn end_io_write(inner: &Arc<FtlInner>, rq: DeviceRq, status: IoStatus, ctx: RqCtx) {
    match ctx {
        RqCtx::Ring {
            sentry,
            nr_valid,
            nr_padded,
        } => {
            if status.is_ok() {
                inner.limiter.release(nr_valid);
                complete_ring(inner, sentry, nr_valid);
            } else {
                inner.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                end_w_fail(inner, &rq, status, sentry, nr_valid, nr_padded);
            }
            inner.drain_kick.kick();
        }
        RqCtx::Close { blk } => end_close(inner, blk, status),
        RqCtx::Pad { blk, signal } => {
            if status.is_ok() {
                signal.complete_ok();
            } else {
                begin_block_failure(inner, blk);
                signal.complete_err(format!("pad write failed on block {blk}"));
            }
        }
    }
}

/// Commit a ring-range completion in order, or park it.
fn complete_ring(inner: &FtlInner, sentry: u64, nr_valid: u64) {
    let mut session = inner.rb.sync_session();
    if session.pos() != sentry {
        inner
            .pending
            .lock()
            .push(PendingCompletion { sentry, nr_valid });
        return;
    }

    let mut pos = commit_batch(inner, &mut session, sentry, nr_valid);
    loop {
        let next = {
            let mut pending = inner.pending.lock();
            pending
                .iter()
                .position(|p| p.sentry == pos)
                .map(|idx| pending.swap_remove(idx))
        };
        match next {
            Some(p) => pos = commit_batch(inner, &mut session, p.sentry, p.nr_valid),
            None => break,
        }
    }
}

fn commit_batch(
    inner: &FtlInner,
    session: &mut SyncSession<'_>,
    sentry: u64,
    nr_valid: u64,
) -> u64 {
    for i in 0..nr_valid {
        let pos = sentry + i;
        let (lba, paddr, ppa, blk, flush, gc_ref) = inner.rb.with_ctx(pos, |ctx| {
            (
                ctx.lba,
                ctx.paddr,
                ctx.ppa,
                ctx.blk,
                ctx.flush.take(),
                ctx.gc_ref.take(),
            )
        });

        if let (Some(dev), Some(blk_id)) = (ppa, blk) {
            let block = inner.blocks.get(blk_id);
            let (closeable, bad) = {
                let mut g = block.lock();
                let closeable = g.set_sync(paddr);
                (closeable, g.st == BlockState::Bad)
            };
            if closeable && !bad {
                schedule_close(inner, blk_id);
            }
            publish_dev(inner, Lba(lba), inner.rb.wrap(pos), dev, blk_id);
        } else {
            error!(target: "oxblk::compl", pos, "committing an unmapped entry");
        }

        if let Some(signal) = flush {
            signal.complete_ok();
        }
        drop(gc_ref);
    }
    session.advance(nr_valid)
}

/// Move an entry's mapping from cacheline to persisted, yielding while a
/// reader holds it.
fn publish_dev(inner: &FtlInner, lba: Lba, line: u64, dev: DevPpa, blk: BlockId) {
    loop {
        match inner.l2p.update_map_dev(lba, line, dev, blk, &inner.blocks) {
            Ok(retire) => {
                if let Some(victim) = retire {
                    schedule_retire(inner, victim);
                }
                return;
            }
            Err(FtlError::Busy) => std::thread::yield_now(),
            Err(err) => unreachable!("update_map_dev: {err}"),
        }
    }
}

/// Mark a block grown-bad exactly once and queue data relocation.
pub(crate) fn begin_block_failure(inner: &FtlInner, blk_id: BlockId) {
    let block = inner.blocks.get(blk_id);
    {
        let mut g = block.lock();
        if g.st == BlockState::Bad {
            return;
        }
        g.st = BlockState::Bad;
    }
    warn!(target: "oxblk::compl", blk = %blk_id, "block grown bad");
    inner.stats.blocks_bad.fetch_add(1, Ordering::Relaxed);
    inner
        .media
        .mark_blk_bad(inner.geo.dev_ppa(block.lun, block.blk, 0));
    inner.ws.send(BlockJob::Recover(blk_id));
}

fn end_close(inner: &FtlInner, blk_id: BlockId, status: IoStatus) {
    if !status.is_ok() {
        error!(target: "oxblk::compl", blk = %blk_id, "recovery page write failed");
        begin_block_failure(inner, blk_id);
        return;
    }

    let block = inner.blocks.get(blk_id);
    let retire = {
        let mut g = block.lock();
        if g.st == BlockState::Bad {
            return;
        }
        g.st = BlockState::Closed;
        g.invalid.is_full()
    };

    {
        let mut lists = inner.luns[block.lun as usize].lists.lock();
        lists.remove_open(blk_id);
        lists.closed.push(blk_id);
    }
    inner.stats.blocks_closed.fetch_add(1, Ordering::Relaxed);
    debug!(target: "oxblk::compl", blk = %blk_id, "block closed");

    if retire {
        schedule_retire(inner, blk_id);
    }
}

/// Handle a per-sector write failure: grown-bad bookkeeping, re-issue of the
/// failed entries, in-order commit of the successful runs.
fn end_w_fail(
    inner: &Arc<FtlInner>,
    rq: &DeviceRq,
    status: IoStatus,
    sentry: u64,
    nr_valid: u64,
    _nr_padded: u64,
) {
    let mut bad_blocks: Vec<BlockId> = Vec::new();
    let mut failed_positions: Vec<u64> = Vec::new();

    for (i, ppa) in rq.ppas.iter().enumerate() {
        if !status.sector_failed(i) {
            continue;
        }
        let blk_id = inner.geo.block_id(ppa.lun(), ppa.blk());
        if !bad_blocks.contains(&blk_id) {
            bad_blocks.push(blk_id);
        }
        if (i as u64) < nr_valid {
            match inner.rb.sync_scan_entry(*ppa) {
                Some(pos) => failed_positions.push(pos),
                None => {
                    error!(target: "oxblk::compl", ppa = %ppa, "no ring entry for failed sector");
                }
            }
        }
    }

    for blk in &bad_blocks {
        begin_block_failure(inner, *blk);
    }

    let failed_in_valid = (0..nr_valid)
        .filter(|i| status.sector_failed(*i as usize))
        .count() as u64;
    let ok_count = nr_valid - failed_in_valid;
    if ok_count > 0 {
        inner.limiter.release(ok_count);
    }
    warn!(
        target: "oxblk::compl",
        sentry,
        failed = failed_in_valid,
        ok = ok_count,
        "write failure: re-issuing failed sectors"
    );

    // Fresh mappings first, so the gaps in the sync sequence are already
    // covered by in-flight requests when the successful runs park.
    for pos in &failed_positions {
        if let Err(err) = reissue_entry(inner, *pos) {
            error!(target: "oxblk::compl", pos, %err, "could not re-issue failed sector");
        }
    }
    inner
        .stats
        .recovered_secs
        .fetch_add(failed_positions.len() as u64, Ordering::Relaxed);

    // Commit each contiguous successful run.
    let mut run_start: Option<u64> = None;
    for i in 0..=nr_valid {
        let failed = i < nr_valid && status.sector_failed(i as usize);
        if i < nr_valid && !failed {
            run_start.get_or_insert(i);
            continue;
        }
        if let Some(start) = run_start.take() {
            complete_ring(inner, sentry + start, i - start);
        }
    }
}

/// Re-map one failed ring entry and submit it as a minimum-sized request
/// (one valid sector, the rest padding).
fn reissue_entry(inner: &Arc<FtlInner>, pos: u64) -> Result<()> {
    let min = u64::from(inner.geo.min_write_secs());
    let sec_size = inner.geo.sec_size as usize;

    let mut data = vec![0_u8; min as usize * sec_size];
    inner.rb.drain_entry_data(pos, &mut data[..sec_size]);

    let mut ppas = Vec::with_capacity(min as usize);
    let mut metas = Vec::with_capacity(min as usize);
    map::map_rr_page(inner, pos, min, 1, &mut ppas, &mut metas)?;

    let rq = DeviceRq {
        op: DeviceOp::Write,
        ppas,
        data,
        meta: metas,
    };
    let ctx = RqCtx::Ring {
        sentry: pos,
        nr_valid: 1,
        nr_padded: min - 1,
    };
    let cb_inner = Arc::clone(inner);
    inner.media.submit_io(
        rq,
        Box::new(move |rq, status| end_io_write(&cb_inner, rq, status, ctx)),
    )
}
