//! Block provisioner.
//!
//! A timer-driven worker keeps a small queue of pre-erased blocks per LUN so
//! the mapper never erases on the write path. Erase failures mark the block
//! bad and move on to the next. The provisioner also owns the emergency-GC
//! bitset: a LUN whose free-block count drops under the threshold flips its
//! bit before its next block is taken, and clears it once the collector has
//! returned enough blocks.

use crate::block::BlockState;
use crate::FtlInner;
use oxblk_types::BlockId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub(crate) struct Provisioner {
    queues: Vec<Mutex<VecDeque<BlockId>>>,
    qd: usize,
    emergency: Vec<AtomicBool>,
    engaged: AtomicUsize,
}

impl Provisioner {
    pub(crate) fn new(nr_luns: u32, qd: usize) -> Self {
        Self {
            queues: (0..nr_luns).map(|_| Mutex::new(VecDeque::new())).collect(),
            qd,
            emergency: (0..nr_luns).map(|_| AtomicBool::new(false)).collect(),
            engaged: AtomicUsize::new(0),
        }
    }

    /// Any LUN in emergency-GC mode: user writes are rejected.
    pub(crate) fn any_emergency(&self) -> bool {
        self.engaged.load(Ordering::Acquire) > 0
    }

    pub(crate) fn is_emergency(&self, lun: u32) -> bool {
        self.emergency[lun as usize].load(Ordering::Acquire)
    }

    pub(crate) fn queue_len(&self, lun: u32) -> usize {
        self.queues[lun as usize].lock().len()
    }

    fn should_kick(&self) -> bool {
        self.queues.iter().any(|q| q.lock().len() < self.qd)
    }

    /// Pop without list bookkeeping; teardown only.
    pub(crate) fn pop_raw(&self, lun: u32) -> Option<BlockId> {
        self.queues[lun as usize].lock().pop_front()
    }
}

/// Refill every LUN's queue up to the configured depth.
pub(crate) fn provision_pass(inner: &FtlInner) {
    let thres = inner.cfg.emergency_free_blocks;
    for lun in 0..inner.geo.nr_luns {
        loop {
            if inner.prov.queue_len(lun) >= inner.prov.qd {
                break;
            }

            let free = inner.media.free_blocks(lun);
            let engaged = inner.prov.is_emergency(lun);
            if free < thres {
                if !engaged {
                    inner.prov.emergency[lun as usize].store(true, Ordering::Release);
                    inner.prov.engaged.fetch_add(1, Ordering::AcqRel);
                    warn!(target: "oxblk::prov", lun, free, "entering emergency GC");
                    // Skip this LUN for the round; the next pass provisions
                    // for the collector.
                    break;
                }
            } else if engaged {
                inner.prov.emergency[lun as usize].store(false, Ordering::Release);
                inner.prov.engaged.fetch_sub(1, Ordering::AcqRel);
                info!(target: "oxblk::prov", lun, free, "leaving emergency GC");
            }

            let Some(blk) = inner.media.get_blk(lun) else {
                debug!(target: "oxblk::prov", lun, "lun has no blocks");
                break;
            };

            if let Err(err) = inner.media.erase_blk(lun, blk) {
                warn!(target: "oxblk::prov", lun, blk, %err, "erase failed, marking bad");
                inner.media.mark_blk_bad(inner.geo.dev_ppa(lun, blk, 0));
                inner.blocks.get(inner.geo.block_id(lun, blk)).lock().st = BlockState::Bad;
                inner.media.put_blk(lun, blk);
                continue;
            }

            let id = inner.geo.block_id(lun, blk);
            inner.blocks.get(id).lock().reset_free();
            inner.prov.queues[lun as usize].lock().push_back(id);
        }
    }
}

/// Take a pre-erased block for `lun`, moving it onto the LUN's open list.
pub(crate) fn pool_get(inner: &FtlInner, lun: u32) -> Option<BlockId> {
    let id = {
        let mut queue = inner.prov.queues[lun as usize].lock();
        queue.pop_front()?
    };
    if inner.prov.queue_len(lun) < inner.prov.qd {
        inner.prov_kick.kick();
    }

    inner.luns[lun as usize].lists.lock().open.push(id);
    inner.blocks.get(id).lock().st = BlockState::Open;
    debug!(target: "oxblk::prov", lun, blk = %id, "block taken from pool");
    Some(id)
}

/// Thread body.
pub(crate) fn run(inner: &Arc<FtlInner>) {
    debug!(target: "oxblk::prov", "provisioner started");
    let interval = Duration::from_millis(inner.cfg.prov_interval_ms);
    loop {
        if inner.stopping.load(Ordering::Acquire) {
            break;
        }
        if inner.prov.should_kick() {
            provision_pass(inner);
        }
        inner.prov_kick.wait_timeout(interval);
    }
    debug!(target: "oxblk::prov", "provisioner stopped");
}
