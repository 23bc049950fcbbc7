//! Cache-blended read path.
//!
//! Each sector of a read resolves to exactly one of: zero-fill (unmapped),
//! a copy out of the write cache, or a device read. Cached entries are
//! latched with the read-in-flight bit for the duration of the copy; the
//! holes are gathered into a single device request and spliced back into
//! the caller's buffer at their original offsets.

use crate::FtlInner;
use oxblk_error::{FtlError, Result};
use oxblk_media::{DeviceOp, DeviceRq};
use oxblk_types::{DevPpa, Lba, Ppa, MAX_REQ_SECS};
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use tracing::{trace, warn};

const RETRY_LIMIT: u32 = 128;

pub(crate) fn submit_read(inner: &FtlInner, lba: Lba, out: &mut [u8]) -> Result<()> {
    let sec_size = inner.geo.sec_size as usize;
    if out.is_empty() || out.len() % sec_size != 0 {
        return Err(FtlError::Malformed(format!(
            "read buffer {} bytes is not sector aligned",
            out.len()
        )));
    }
    let k = out.len() / sec_size;
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

    let mut attempts = 0_u32;
    loop {
        match try_read(inner, lba, k, out) {
            Ok(()) => return Ok(()),
            Err(FtlError::Busy) => {
                // A latched cacheline went stale under us (single-bit
                // limitation); re-snapshot and retry.
                attempts += 1;
                if attempts >= RETRY_LIMIT {
                    return Err(FtlError::ReadFailed {
                        failed: k as u32,
                        total: k as u32,
                    });
                }
                std::thread::yield_now();
            }
            Err(err) => return Err(err),
        }
    }
}

fn try_read(inner: &FtlInner, lba: Lba, k: usize, out: &mut [u8]) -> Result<()> {
    let sec_size = inner.geo.sec_size as usize;
    let snap = inner.l2p.latch_reads(lba, k);

    let mut holes: Vec<(usize, DevPpa)> = Vec::new();
    let mut done = 0_u64;
    let mut stale = false;

    for (i, ppa) in snap.iter().enumerate() {
        let dst = &mut out[i * sec_size..(i + 1) * sec_size];
        match *ppa {
            Ppa::Empty => {
                dst.fill(0);
                done |= 1 << i;
                inner.stats.zero_fill_reads.fetch_add(1, Ordering::Relaxed);
            }
            Ppa::Cached { line, .. } => {
                if inner.rb.cache_read(line, lba.0 + i as u64, dst) {
                    done |= 1 << i;
                    inner.stats.cache_hit_reads.fetch_add(1, Ordering::Relaxed);
                } else {
                    stale = true;
                    break;
                }
            }
            Ppa::Device(dev) => holes.push((i, dev)),
        }
    }

    // The latch protects only the cache copies. It must be released before
    // the device read: completions spin on it, and they run on the thread
    // that would service that read.
    inner.l2p.unlatch_reads(lba, &snap);
    if stale {
        return Err(FtlError::Busy);
    }

    if holes.is_empty() {
        debug_assert_eq!(done.count_ones() as usize, k);
        return Ok(());
    }
    fill_holes(inner, &holes, out)
}

/// Read every hole in one device request and splice the sectors back at
/// their original positions.
fn fill_holes(inner: &FtlInner, holes: &[(usize, DevPpa)], out: &mut [u8]) -> Result<()> {
    let sec_size = inner.geo.sec_size as usize;
    let ppas: Vec<DevPpa> = holes.iter().map(|(_, d)| *d).collect();
    let nr = ppas.len();

    let rq = DeviceRq {
        op: DeviceOp::Read,
        ppas,
        data: vec![0_u8; nr * sec_size],
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
        warn!(
            target: "oxblk::read",
            failed = status.nr_failed(),
            total = nr,
            "device read failed"
        );
        return Err(FtlError::ReadFailed {
            failed: status.nr_failed(),
            total: nr as u32,
        });
    }

    for (slot, (idx, _)) in holes.iter().enumerate() {
        out[idx * sec_size..(idx + 1) * sec_size]
            .copy_from_slice(&rq.data[slot * sec_size..(slot + 1) * sec_size]);
    }
    inner
        .stats
        .device_reads
        .fetch_add(nr as u64, Ordering::Relaxed);
    trace!(target: "oxblk::read", holes = nr, "holes filled from device");
    Ok(())
}
