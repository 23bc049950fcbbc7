//! Host-facing write submission.
//!
//! Writes are absorbed into the ring buffer and complete immediately; only
//! preflush-carrying bios stay pending until the sync cursor covers them.
//! Admission is capped by an inflight-sector budget; callers park on the cap
//! and are woken by the completion pipeline.

use crate::FtlInner;
use oxblk_error::{FtlError, Result};
use oxblk_ring::{FlushSignal, GcBuf, WriteCtx};
use oxblk_types::{DevPpa, Lba, ADDR_EMPTY, MAX_REQ_SECS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use tracing::{debug, trace};

/// Outcome of a write submission.
#[derive(Debug)]
pub enum WriteOutcome {
    /// Handled synchronously; the data is in the write cache.
    Done,
    /// Preflush: the signal fires once everything up to the flush point is
    /// persisted.
    Pending(FlushSignal),
}

/// Inflight-sector admission cap.
///
/// `try_admit` is a compare-exchange loop (increment only while below the
/// cap); `admit` parks until the completion path releases budget.
pub(crate) struct WriteLimiter {
    inflight: AtomicU64,
    cap: u64,
    gate: Mutex<()>,
    cv: Condvar,
}

impl WriteLimiter {
    pub(crate) fn new(cap: u64) -> Self {
        Self {
            inflight: AtomicU64::new(0),
            cap,
            gate: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    fn try_admit(&self, n: u64) -> bool {
        let mut cur = self.inflight.load(Ordering::Relaxed);
        loop {
            if cur >= self.cap {
                return false;
            }
            match self.inflight.compare_exchange_weak(
                cur,
                cur + n,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    pub(crate) fn admit(&self, n: u64) {
        if self.try_admit(n) {
            return;
        }
        let mut gate = self
            .gate
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if self.try_admit(n) {
                return;
            }
            gate = self
                .cv
                .wait(gate)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    pub(crate) fn release(&self, n: u64) {
        self.inflight.fetch_sub(n, Ordering::AcqRel);
        self.cv.notify_all();
    }

    pub(crate) fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::Acquire)
    }
}

fn check_bounds(inner: &FtlInner, lba: Lba, k: usize) -> Result<()> {
    if k > MAX_REQ_SECS {
        return Err(FtlError::TooLarge {
            got: k,
            max: MAX_REQ_SECS,
        });
    }
    let end = lba
        .checked_add(k as u64)
        .ok_or_else(|| FtlError::Malformed("lba range overflow".to_owned()))?;
    if end.0 > inner.geo.nr_secs() {
        return Err(FtlError::Malformed(format!(
            "lba range [{lba}, {end}) outside capacity {}",
            inner.geo.nr_secs()
        )));
    }
    Ok(())
}

/// Buffer a host write; the entry point behind `Ftl::submit_write`.
pub(crate) fn buffer_write(
    inner: &FtlInner,
    lba: Lba,
    data: &[u8],
    preflush: bool,
) -> Result<WriteOutcome> {
    let sec_size = inner.geo.sec_size as usize;
    if data.len() % sec_size != 0 {
        return Err(FtlError::Malformed(format!(
            "payload {} bytes is not sector aligned",
            data.len()
        )));
    }
    let k = data.len() / sec_size;

    if preflush && k == 0 {
        // Dataless flush: park on a sync point at the current head.
        let signal = FlushSignal::new();
        if inner.rb.sync_point_set(signal.clone()) {
            inner.drain_kick.kick();
            return Ok(WriteOutcome::Pending(signal));
        }
        return Ok(WriteOutcome::Done);
    }
    if k == 0 {
        return Ok(WriteOutcome::Done);
    }
    check_bounds(inner, lba, k)?;

    if inner.prov.any_emergency() {
        inner.stats.requeues.fetch_add(1, Ordering::Relaxed);
        return Err(FtlError::Requeue);
    }

    let k = k as u64;
    let Some(pos) = inner.rb.may_write(k, k) else {
        inner.stats.requeues.fetch_add(1, Ordering::Relaxed);
        return Err(FtlError::Requeue);
    };

    let flush = preflush.then(FlushSignal::new);
    for i in 0..k {
        let mut ctx = WriteCtx::user(lba.0 + i);
        if i == k - 1 {
            // The bio persists once its last entry syncs; ring order covers
            // the earlier ones.
            ctx.flush = flush.clone();
        }
        let sector = &data[i as usize * sec_size..(i as usize + 1) * sec_size];
        inner.rb.write_entry(pos + i, sector, ctx);
        publish_cached(inner, Lba(lba.0 + i), inner.rb.wrap(pos + i));
    }

    inner.limiter.admit(k);
    inner.stats.buffered_writes.fetch_add(k, Ordering::Relaxed);
    trace!(target: "oxblk::write", lba = lba.0, secs = k, preflush, "buffered");

    if let Some(signal) = flush {
        inner.drain_kick.kick();
        return Ok(WriteOutcome::Pending(signal));
    }
    Ok(WriteOutcome::Done)
}

/// Publish a cacheline mapping, yielding while a reader holds the entry.
fn publish_cached(inner: &FtlInner, lba: Lba, line: u64) {
    loop {
        match inner.l2p.update_map_cache(lba, line, &inner.blocks) {
            Ok(retire) => {
                if let Some(blk) = retire {
                    crate::complete::schedule_retire(inner, blk);
                }
                return;
            }
            Err(FtlError::Busy) => std::thread::yield_now(),
            Err(err) => unreachable!("update_map_cache: {err}"),
        }
    }
}

/// Buffer a scattered relocation batch (GC and grown-bad recovery).
///
/// `entries` pairs each batch slot's LBA with the device address the data
/// was read from; [`ADDR_EMPTY`] slots are skipped. A `Some` expectation
/// publishes only while the L2P still points at that address, so a racing
/// host write is never clobbered by relocated data. Permitted under
/// emergency GC.
pub(crate) fn write_list_to_cache(
    inner: &FtlInner,
    entries: &[(u64, Option<DevPpa>)],
    buf: &GcBuf,
) -> Result<()> {
    let sec_size = inner.geo.sec_size as usize;
    let live = entries.iter().filter(|(lba, _)| *lba != ADDR_EMPTY).count() as u64;
    if live == 0 {
        return Ok(());
    }
    if live as usize > MAX_REQ_SECS {
        return Err(FtlError::TooLarge {
            got: live as usize,
            max: MAX_REQ_SECS,
        });
    }

    let Some(pos) = inner.rb.may_write(live, live) else {
        return Err(FtlError::Requeue);
    };

    // The buffer is compact: it carries only the live sectors, in list
    // order.
    let mut slot = 0_u64;
    for (lba, expected) in entries {
        if *lba == ADDR_EMPTY {
            continue;
        }
        inner.rb.write_entry(
            pos + slot,
            buf.sector(slot as usize, sec_size),
            WriteCtx::gc(*lba, buf.clone()),
        );
        publish_gc(inner, Lba(*lba), inner.rb.wrap(pos + slot), *expected);
        slot += 1;
    }

    inner.limiter.admit(live);
    inner.stats.gc_writes.fetch_add(live, Ordering::Relaxed);
    debug!(target: "oxblk::write", secs = live, "relocation batch buffered");
    Ok(())
}

fn publish_gc(inner: &FtlInner, lba: Lba, line: u64, expected: Option<DevPpa>) {
    loop {
        match inner.l2p.update_map_gc(lba, line, expected, &inner.blocks) {
            Ok((published, retire)) => {
                if let Some(blk) = retire {
                    crate::complete::schedule_retire(inner, blk);
                }
                if !published {
                    // The host moved on; the entry drains as an unreferenced
                    // sector and is invalidated at completion.
                    trace!(target: "oxblk::write", lba = lba.0, "relocation superseded by host write");
                }
                return;
            }
            Err(FtlError::Busy) => std::thread::yield_now(),
            Err(err) => unreachable!("update_map_gc: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::WriteLimiter;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn limiter_admits_below_cap() {
        let limiter = WriteLimiter::new(10);
        assert!(limiter.try_admit(4));
        assert!(limiter.try_admit(4));
        assert_eq!(limiter.inflight(), 8);
        // Cap check is on the current value, as in the original: one more
        // batch is admitted while still below the cap.
        assert!(limiter.try_admit(4));
        assert!(!limiter.try_admit(1));
        limiter.release(12);
        assert!(limiter.try_admit(1));
    }

    #[test]
    fn limiter_parks_until_release() {
        let limiter = Arc::new(WriteLimiter::new(4));
        limiter.admit(4);

        let parked = Arc::new(AtomicBool::new(true));
        let waiter = {
            let limiter = Arc::clone(&limiter);
            let parked = Arc::clone(&parked);
            std::thread::spawn(move || {
                limiter.admit(2);
                parked.store(false, Ordering::Release);
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(parked.load(Ordering::Acquire));
        limiter.release(4);
        waiter.join().expect("waiter");
        assert!(!parked.load(Ordering::Acquire));
        assert_eq!(limiter.inflight(), 2);
    }
}
