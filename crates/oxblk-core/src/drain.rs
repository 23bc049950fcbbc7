//! Dedicated writer thread.
//!
//! Drains ring entries into device-sized write requests. Every submitted
//! request is a multiple of the device write granularity; a flush that
//! leaves a shortfall is padded with zeroed, unmapped sectors. Without a
//! pending flush the drainer waits for a full maximum-size batch before
//! touching the media.

use crate::complete::{end_io_write, RqCtx};
use crate::{map, FtlInner};
use oxblk_error::Result;
use oxblk_media::{DeviceOp, DeviceRq, SectorMeta};
use oxblk_types::DevPpa;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace};

/// Sectors to put in the next request, given what is buffered and what a
/// pending flush demands. Always a multiple of `min` (or zero); never more
/// than `max`.
pub(crate) fn calc_secs_to_sync(min: u64, max: u64, secs_avail: u64, secs_to_flush: u64) -> u64 {
    if secs_avail >= max || secs_to_flush >= max {
        return max;
    }
    if secs_avail >= min {
        if secs_to_flush > 0 {
            let mut secs_to_sync = min * (secs_to_flush / min);
            loop {
                let inc = secs_to_sync + min;
                if inc <= secs_avail && inc <= max {
                    secs_to_sync = inc;
                } else {
                    break;
                }
            }
            return secs_to_sync;
        }
        return min * (secs_avail / min);
    }
    if secs_to_flush > 0 {
        return min;
    }
    0
}

/// One drain iteration. Returns whether a request was submitted.
pub(crate) fn drain_once(inner: &Arc<FtlInner>) -> Result<bool> {
    let min = u64::from(inner.geo.min_write_secs());
    let max = u64::from(inner.geo.max_write_pgs);

    // Cheap pre-check before taking the reader lock.
    if inner.rb.sync_point_count() == 0 && inner.rb.count() < max {
        return Ok(false);
    }

    let (pos, secs_to_sync, secs_to_com, secs_to_flush) = {
        let mut session = inner.rb.read_session();
        let secs_avail = session.avail();
        if secs_avail == 0 {
            return Ok(false);
        }
        let secs_to_flush = inner.rb.sync_point_count();
        let secs_to_sync = calc_secs_to_sync(min, max, secs_avail, secs_to_flush);
        if secs_to_sync == 0 {
            return Ok(false);
        }
        let secs_to_com = secs_to_sync.min(secs_avail);
        let pos = session.commit(secs_to_com);
        (pos, secs_to_sync, secs_to_com, secs_to_flush)
    };

    let sec_size = inner.geo.sec_size as usize;
    let mut data = vec![0_u8; secs_to_sync as usize * sec_size];
    for i in 0..secs_to_com {
        let off = i as usize * sec_size;
        inner
            .rb
            .drain_entry_data(pos + i, &mut data[off..off + sec_size]);
    }

    if secs_to_flush <= secs_to_sync {
        inner.rb.sync_point_reset(pos + secs_to_com);
    }

    // Assign device addresses, one granularity group at a time. Groups past
    // the committed count are pure padding.
    let mut ppas: Vec<DevPpa> = Vec::with_capacity(secs_to_sync as usize);
    let mut metas: Vec<SectorMeta> = Vec::with_capacity(secs_to_sync as usize);
    let mut group = 0;
    while group < secs_to_sync {
        let valid = secs_to_com.saturating_sub(group).min(min);
        map::map_rr_page(inner, pos + group, min, valid, &mut ppas, &mut metas)?;
        group += min;
    }

    let nr_padded = secs_to_sync - secs_to_com;
    if nr_padded > 0 {
        inner
            .stats
            .padded_secs
            .fetch_add(nr_padded, Ordering::Relaxed);
    }

    let rq = DeviceRq {
        op: DeviceOp::Write,
        ppas,
        data,
        meta: metas,
    };
    let ctx = RqCtx::Ring {
        sentry: pos,
        nr_valid: secs_to_com,
        nr_padded,
    };
    let cb_inner = Arc::clone(inner);
    inner.media.submit_io(
        rq,
        Box::new(move |rq, status| end_io_write(&cb_inner, rq, status, ctx)),
    )?;

    trace!(
        target: "oxblk::drain",
        sentry = pos,
        secs = secs_to_sync,
        valid = secs_to_com,
        padded = nr_padded,
        "write submitted"
    );
    Ok(true)
}

/// Thread body.
pub(crate) fn run(inner: &Arc<FtlInner>) {
    debug!(target: "oxblk::drain", "drainer started");
    let idle = Duration::from_millis(inner.cfg.drain_idle_ms);
    loop {
        if inner.stopping.load(Ordering::Acquire) {
            break;
        }
        match drain_once(inner) {
            Ok(true) => {}
            Ok(false) => inner.drain_kick.wait_timeout(idle),
            Err(err) => {
                error!(target: "oxblk::drain", %err, "drain iteration failed");
                inner.drain_kick.wait_timeout(idle);
            }
        }
    }
    debug!(target: "oxblk::drain", "drainer stopped");
}

#[cfg(test)]
mod tests {
    use super::calc_secs_to_sync;

    const MIN: u64 = 4;
    const MAX: u64 = 16;

    #[test]
    fn full_batches_cap_at_max() {
        assert_eq!(calc_secs_to_sync(MIN, MAX, 16, 0), 16);
        assert_eq!(calc_secs_to_sync(MIN, MAX, 40, 0), 16);
        assert_eq!(calc_secs_to_sync(MIN, MAX, 3, 17), 16);
    }

    #[test]
    fn no_flush_rounds_down_to_granularity() {
        assert_eq!(calc_secs_to_sync(MIN, MAX, 7, 0), 4);
        assert_eq!(calc_secs_to_sync(MIN, MAX, 11, 0), 8);
        assert_eq!(calc_secs_to_sync(MIN, MAX, 4, 0), 4);
    }

    #[test]
    fn below_granularity_waits_unless_flushing() {
        assert_eq!(calc_secs_to_sync(MIN, MAX, 3, 0), 0);
        assert_eq!(calc_secs_to_sync(MIN, MAX, 0, 0), 0);
        // A flush forces a padded minimum write.
        assert_eq!(calc_secs_to_sync(MIN, MAX, 3, 3), 4);
        assert_eq!(calc_secs_to_sync(MIN, MAX, 1, 1), 4);
    }

    #[test]
    fn flush_extends_greedily_within_caps() {
        // Flush of 5 rounds down to 4, then extends while room remains.
        assert_eq!(calc_secs_to_sync(MIN, MAX, 10, 5), 8);
        assert_eq!(calc_secs_to_sync(MIN, MAX, 6, 5), 4);
        assert_eq!(calc_secs_to_sync(MIN, MAX, 16, 5), 16);
        // Flush smaller than min with plenty buffered still drains a
        // granular batch.
        assert_eq!(calc_secs_to_sync(MIN, MAX, 9, 2), 8);
    }

    #[test]
    fn result_is_always_granular() {
        for avail in 0..40 {
            for flush in 0..40_u64 {
                let flush = flush.min(avail);
                let secs = calc_secs_to_sync(MIN, MAX, avail, flush);
                assert_eq!(secs % MIN, 0, "avail={avail} flush={flush}");
                assert!(secs <= MAX);
                if flush > 0 {
                    assert!(secs > 0, "flush must always produce a write");
                }
            }
        }
    }
}
