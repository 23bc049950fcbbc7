//! Round-robin allocator/mapper.
//!
//! Maps each device-granularity group of drained ring entries onto the next
//! LUN's current block, replacing full or grown-bad blocks from the
//! provisioner pool. Under emergency GC the round-robin is abandoned for the
//! LUN with the most free blocks, to keep the collector from starving one
//! LUN while another still has headroom.

use crate::complete::schedule_close;
use crate::provision;
use crate::FtlInner;
use oxblk_error::{FtlError, Result};
use oxblk_media::SectorMeta;
use oxblk_types::{BlockId, DevPpa};
use std::sync::atomic::Ordering;
use tracing::{trace, warn};

fn next_lun_rr(inner: &FtlInner) -> u32 {
    if inner.prov.any_emergency() {
        // Evenness beats round-robin while blocks are scarce. An estimate is
        // enough, no locks taken.
        let mut best = 0_u32;
        let mut best_free = 0_usize;
        for lun in 0..inner.geo.nr_luns {
            let free = inner.media.free_blocks(lun);
            if free >= best_free {
                best = lun;
                best_free = free;
            }
        }
        return best;
    }
    inner.next_lun.fetch_add(1, Ordering::Relaxed) % inner.geo.nr_luns
}

/// Map one `min_write_secs` group starting at ring position `sentry`.
///
/// The first `valid_secs` sectors are real ring entries and get their write
/// context stamped; the rest are padding, marked invalid and sync-complete on
/// the block so it can close without them.
pub(crate) fn map_rr_page(
    inner: &FtlInner,
    sentry: u64,
    nr_secs: u64,
    valid_secs: u64,
    ppas: &mut Vec<DevPpa>,
    metas: &mut Vec<SectorMeta>,
) -> Result<()> {
    let mut attempts = 0_u64;
    loop {
        let lun_id = next_lun_rr(inner);
        let lun = &inner.luns[lun_id as usize];
        debug_assert_eq!(lun.id, lun_id);
        let mut cur = lun.cur.lock();

        loop {
            let blk_id = match *cur {
                Some(id) => id,
                None => match provision::pool_get(inner, lun_id) {
                    Some(id) => {
                        *cur = Some(id);
                        id
                    }
                    None => break,
                },
            };

            let block = inner.blocks.get(blk_id);
            let usable = {
                let g = block.lock();
                g.st == crate::block::BlockState::Open && !g.is_full()
            };
            if !usable {
                // Full or grown bad: replace from the pool and retry.
                match provision::pool_get(inner, lun_id) {
                    Some(next) => {
                        *cur = Some(next);
                        continue;
                    }
                    None => break,
                }
            }

            return map_page(inner, blk_id, sentry, nr_secs, valid_secs, ppas, metas);
        }

        // This LUN has no usable block right now; wake the provisioner and
        // try again after a yield.
        drop(cur);
        inner.prov_kick.kick();
        attempts += 1;
        if inner.stopping.load(Ordering::Acquire) && attempts > 64 {
            warn!(target: "oxblk::map", lun = lun_id, "no pre-allocated block during shutdown");
            return Err(FtlError::NoSpace { lun: lun_id });
        }
        std::thread::yield_now();
    }
}

fn map_page(
    inner: &FtlInner,
    blk_id: BlockId,
    sentry: u64,
    nr_secs: u64,
    valid_secs: u64,
    ppas: &mut Vec<DevPpa>,
    metas: &mut Vec<SectorMeta>,
) -> Result<()> {
    let block = inner.blocks.get(blk_id);
    let mut close = false;
    {
        let mut g = block.lock();
        let base = g.alloc_secs(nr_secs).ok_or_else(|| {
            FtlError::Malformed(format!(
                "block {blk_id} ran out of sectors mid-map (cursor {})",
                g.cur_sec
            ))
        })?;

        for i in 0..nr_secs {
            let paddr = base + i;
            let ppa = inner.geo.dev_ppa(block.lun, block.blk, paddr);
            ppas.push(ppa);

            if i < valid_secs {
                let lba = inner.rb.with_ctx(sentry + i, |ctx| {
                    ctx.paddr = paddr;
                    ctx.ppa = Some(ppa);
                    ctx.blk = Some(blk_id);
                    ctx.lba
                });
                metas.push(SectorMeta { lba });
                g.record_lba(paddr, lba);
            } else {
                metas.push(SectorMeta::EMPTY);
                if g.pad_invalidate(paddr) {
                    close = true;
                }
            }
        }
    }

    trace!(
        target: "oxblk::map",
        blk = %blk_id,
        sentry,
        nr_secs,
        valid_secs,
        "group mapped"
    );
    if close {
        schedule_close(inner, blk_id);
    }
    Ok(())
}

/// Map one all-padding group onto a specific block during teardown.
///
/// Returns `true` when the padding filled the sync bitmap and the close was
/// scheduled.
pub(crate) fn map_pad_group(
    inner: &FtlInner,
    blk_id: BlockId,
    ppas: &mut Vec<DevPpa>,
    metas: &mut Vec<SectorMeta>,
) -> Result<bool> {
    let block = inner.blocks.get(blk_id);
    let min = u64::from(inner.geo.min_write_secs());
    let mut close = false;
    {
        let mut g = block.lock();
        let base = g.alloc_secs(min).ok_or_else(|| {
            FtlError::Malformed(format!("padding a full block {blk_id}"))
        })?;
        for i in 0..min {
            let paddr = base + i;
            ppas.push(inner.geo.dev_ppa(block.lun, block.blk, paddr));
            metas.push(SectorMeta::EMPTY);
            if g.pad_invalidate(paddr) {
                close = true;
            }
        }
    }
    if close {
        schedule_close(inner, blk_id);
    }
    Ok(close)
}
