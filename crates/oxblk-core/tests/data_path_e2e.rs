#![forbid(unsafe_code)]
//! End-to-end data-path scenarios over the in-memory device.

use oxblk_core::{decode_recovery_page, BlockState, Ftl, FtlConfig};
use oxblk_error::FtlError;
use oxblk_media::{MediaManager, RamMedia};
use oxblk_types::{Geometry, Lba, ADDR_EMPTY};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SEC: usize = 512;

/// min_write_secs = 4, max_write_pgs = 8, 12 data sectors per block.
fn small_geo(nr_luns: u32, blks_per_lun: u32) -> Geometry {
    Geometry::new(1, nr_luns, 1, blks_per_lun, 4, 4, SEC as u32, 8).expect("geometry")
}

fn config() -> FtlConfig {
    FtlConfig {
        ring_entries: 64,
        emergency_free_blocks: 1,
        ..FtlConfig::default()
    }
}

fn target(geo: Geometry) -> (Ftl, Arc<RamMedia>) {
    let media = RamMedia::new(geo);
    let ftl = Ftl::new(media.clone(), config()).expect("ftl");
    (ftl, media)
}

fn sector(byte: u8) -> Vec<u8> {
    vec![byte; SEC]
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn cache_hit_read_before_drain() {
    let (ftl, _media) = target(small_geo(2, 8));

    ftl.write(Lba(0), &sector(b'A')).expect("write");
    assert!(ftl.lookup(Lba(0)).is_cached());

    let mut out = vec![0_u8; SEC];
    ftl.read(Lba(0), &mut out).expect("read");
    assert_eq!(out, sector(b'A'));
    assert!(ftl.metrics().cache_hit_reads >= 1);
}

#[test]
fn flushed_write_reads_from_device() {
    let (ftl, _media) = target(small_geo(2, 8));

    ftl.write(Lba(0), &sector(b'A')).expect("write");
    ftl.flush().expect("flush");

    // The flush returns only after the sync cursor covered the entry, and
    // the persisted mapping is published before the cursor moves.
    assert!(ftl.lookup(Lba(0)).is_device());

    let mut out = vec![0_u8; SEC];
    ftl.read(Lba(0), &mut out).expect("read");
    assert_eq!(out, sector(b'A'));
    assert!(ftl.metrics().device_reads >= 1);
    // A one-sector flush on a four-sector page pads three.
    assert_eq!(ftl.metrics().padded_secs, 3);
}

#[test]
fn overwrite_returns_newest_and_invalidates_stale() {
    let (ftl, _media) = target(small_geo(1, 8));

    ftl.write(Lba(0), &sector(b'A')).expect("write A");
    ftl.write(Lba(0), &sector(b'B')).expect("write B");

    let mut out = vec![0_u8; SEC];
    ftl.read(Lba(0), &mut out).expect("cached read");
    assert_eq!(out, sector(b'B'));

    ftl.flush().expect("flush");
    // Both entries drained in a padded four-sector request; the stale copy
    // was invalidated on the block instead of being published, alongside
    // the two padding sectors.
    assert!(ftl.lookup(Lba(0)).is_device());
    assert_eq!(ftl.block_invalid(0, 0), 3);
    assert_eq!(ftl.metrics().padded_secs, 2);

    ftl.read(Lba(0), &mut out).expect("device read");
    assert_eq!(out, sector(b'B'));
}

#[test]
fn unmapped_reads_zero_fill() {
    let (ftl, _media) = target(small_geo(2, 8));

    ftl.write(Lba(1), &sector(0x55)).expect("write");
    let mut out = vec![0xFF_u8; 3 * SEC];
    ftl.read(Lba(0), &mut out).expect("read");
    assert!(out[..SEC].iter().all(|b| *b == 0));
    assert_eq!(&out[SEC..2 * SEC], sector(0x55).as_slice());
    assert!(out[2 * SEC..].iter().all(|b| *b == 0));
    assert!(ftl.metrics().zero_fill_reads >= 2);
}

#[test]
fn padded_flush_closes_block_and_opens_next() {
    let geo = small_geo(1, 4);
    let (ftl, media) = target(geo);

    // Two full pages straight to block 0.
    let mut bulk = Vec::new();
    for i in 0..8_u8 {
        bulk.extend(sector(b'0' + i));
    }
    ftl.write(Lba(0), &bulk).expect("bulk write");
    ftl.flush().expect("flush bulk");

    // One more sector with a flush: the drain pads the page, block 0 hits
    // its data-sector count and closes behind a recovery-page write.
    ftl.write(Lba(8), &sector(b'X')).expect("tail write");
    ftl.flush().expect("flush tail");
    assert_eq!(ftl.metrics().padded_secs, 3);

    wait_until("block 0 to close", || {
        ftl.block_state(0, 0) == BlockState::Closed
    });

    // The recovery page sits in the last physical page.
    let mut meta = Vec::new();
    for paddr in geo.nr_blk_dsecs()..geo.secs_per_blk() {
        meta.extend(media.sector_data(geo.dev_ppa(0, 0, paddr)));
    }
    let page = decode_recovery_page(&meta, &geo).expect("rlpg");
    assert_eq!(page.nr_lbas, 9);
    assert_eq!(page.nr_padded, 3);
    let expect: Vec<u64> = (0..9).chain([ADDR_EMPTY; 3]).collect();
    assert_eq!(page.lba_list, expect);

    // The next write lands on the pre-provisioned replacement block.
    ftl.write(Lba(20), &sector(b'Y')).expect("next write");
    ftl.flush().expect("flush next");
    assert_ne!(ftl.block_state(0, 1), BlockState::Free);

    let mut out = vec![0_u8; SEC];
    ftl.read(Lba(8), &mut out).expect("read tail");
    assert_eq!(out, sector(b'X'));
}

#[test]
fn failwrite_recovers_single_sector() {
    // min 4, max 16, 28 data sectors per block.
    let geo = Geometry::new(1, 1, 1, 8, 8, 4, SEC as u32, 16).expect("geometry");
    let (ftl, media) = target(geo);

    // Sector 2 of the 16-sector batch will fail on block 0.
    media.fail_next_write(geo.dev_ppa(0, 0, 2));

    let mut bulk = Vec::new();
    for i in 0..16_u8 {
        bulk.extend(sector(b'a' + i));
    }
    ftl.write(Lba(0), &bulk).expect("bulk write");

    // The 15 successful sectors commit in order; the failed one is
    // re-issued with a fresh mapping on the replacement block.
    wait_until("recovery to publish lba 2", || ftl.lookup(Lba(2)).is_device());
    ftl.flush().expect("flush");

    assert_eq!(ftl.block_state(0, 0), BlockState::Bad);
    let metrics = ftl.metrics();
    assert_eq!(metrics.write_failures, 1);
    assert_eq!(metrics.recovered_secs, 1);

    let mut out = vec![0_u8; SEC];
    for i in 0..16_u64 {
        ftl.read(Lba(i), &mut out).expect("read");
        assert_eq!(out, sector(b'a' + i as u8), "lba {i}");
    }
}

#[test]
fn failwrite_relocates_synced_sectors_off_bad_block() {
    // max equals min so every batch is one page.
    let geo = Geometry::new(1, 1, 1, 8, 4, 4, SEC as u32, 4).expect("geometry");
    let (ftl, media) = target(geo);

    ftl.write(Lba(0), &[sector(b'p'), sector(b'q'), sector(b'r'), sector(b's')].concat())
        .expect("first page");
    wait_until("first page to persist", || ftl.lookup(Lba(3)).is_device());

    // Second page to the same block fails on its second sector.
    media.fail_next_write(geo.dev_ppa(0, 0, 5));
    ftl.write(Lba(4), &[sector(b't'), sector(b'u'), sector(b'v'), sector(b'w')].concat())
        .expect("second page");

    wait_until("bad block recovery", || ftl.block_state(0, 0) == BlockState::Bad);
    wait_until("relocation to drain", || ftl.metrics().gc_writes >= 4);
    ftl.flush().expect("flush relocations");

    let mut out = vec![0_u8; SEC];
    for (i, byte) in (b'p'..=b'w').enumerate() {
        ftl.read(Lba(i as u64), &mut out).expect("read");
        assert_eq!(out, sector(byte), "lba {i}");
    }
}

#[test]
fn discard_empties_cached_and_persisted() {
    let (ftl, _media) = target(small_geo(1, 8));

    // Persisted sectors.
    ftl.write(Lba(0), &[sector(1), sector(2)].concat()).expect("write");
    ftl.flush().expect("flush");
    // A cached one on top.
    ftl.write(Lba(2), &sector(3)).expect("cached write");

    ftl.discard(Lba(0), 3).expect("discard");
    for lba in 0..3 {
        assert!(ftl.lookup(Lba(lba)).is_empty());
    }

    let mut out = vec![0_u8; 3 * SEC];
    ftl.read(Lba(0), &mut out).expect("read");
    assert!(out.iter().all(|b| *b == 0));

    // The persisted owners were invalidated; the orphaned cached entry is
    // invalidated when its drained sector commits.
    assert!(ftl.block_invalid(0, 0) >= 2);
    ftl.flush().expect("drain orphan");
}

#[test]
fn scattered_gc_list_skips_empty_slots() {
    let (ftl, _media) = target(small_geo(2, 8));

    let lbas = [5_u64, ADDR_EMPTY, 9];
    let data = [sector(0xAA), sector(0xBB)].concat();
    ftl.write_gc(&lbas, data).expect("gc write");

    let mut out = vec![0_u8; SEC];
    ftl.read(Lba(5), &mut out).expect("read 5");
    assert_eq!(out, sector(0xAA));
    ftl.read(Lba(9), &mut out).expect("read 9");
    assert_eq!(out, sector(0xBB));
    assert_eq!(ftl.metrics().gc_writes, 2);
}

#[test]
fn emergency_gc_rejects_user_but_admits_gc() {
    // Two blocks per LUN and an emergency threshold of two: the pool take
    // at bring-up already leaves free < threshold.
    let geo = small_geo(1, 2);
    let media = RamMedia::new(geo);
    let cfg = FtlConfig {
        ring_entries: 64,
        emergency_free_blocks: 2,
        ..FtlConfig::default()
    };
    let ftl = Ftl::new(media, cfg).expect("ftl");

    // Pulling the pooled block makes the provisioner re-check the LUN and
    // see free-block pressure.
    ftl.write(Lba(0), &sector(0x11)).expect("first write");
    ftl.flush().expect("flush");
    wait_until("emergency mode", || ftl.emergency_gc());

    match ftl.submit_write(Lba(1), &sector(1), false) {
        Err(FtlError::Requeue) => {}
        other => panic!("expected requeue under emergency GC, got {other:?}"),
    }
    assert!(ftl.metrics().requeues >= 1);

    // The collector's path stays open.
    ftl.write_gc(&[3], sector(7)).expect("gc write");
    let mut out = vec![0_u8; SEC];
    ftl.read(Lba(3), &mut out).expect("read");
    assert_eq!(out, sector(7));
}

#[test]
fn concurrent_overwrite_never_tears_reads() {
    let (ftl, _media) = target(small_geo(2, 8));
    let ftl = Arc::new(ftl);

    ftl.write(Lba(7), &sector(b'X')).expect("seed");

    let reader = {
        let ftl = Arc::clone(&ftl);
        std::thread::spawn(move || {
            let mut out = vec![0_u8; SEC];
            for _ in 0..2000 {
                ftl.read(Lba(7), &mut out).expect("read");
                let first = out[0];
                assert!(
                    out.iter().all(|b| *b == first),
                    "torn read: starts {first:#x}"
                );
                assert!(first == b'X' || first == b'Y');
            }
        })
    };
    let writer = {
        let ftl = Arc::clone(&ftl);
        std::thread::spawn(move || {
            for i in 0..2000 {
                let byte = if i % 2 == 0 { b'Y' } else { b'X' };
                ftl.write(Lba(7), &sector(byte)).expect("write");
            }
        })
    };

    reader.join().expect("reader");
    writer.join().expect("writer");
}

#[test]
fn round_trip_with_interleaved_flushes() {
    let (ftl, _media) = target(small_geo(2, 8));
    let nr = 48_u64;

    for lba in 0..nr {
        ftl.write(Lba(lba), &sector(lba as u8)).expect("write");
        if lba % 7 == 0 {
            ftl.flush().expect("flush");
        }
    }
    // Overwrite a stripe.
    for lba in (0..nr).step_by(5) {
        ftl.write(Lba(lba), &sector(0xE0 | (lba as u8 & 0xF))).expect("rewrite");
    }
    ftl.flush().expect("final flush");

    let mut out = vec![0_u8; SEC];
    for lba in 0..nr {
        ftl.read(Lba(lba), &mut out).expect("read");
        let expect = if lba % 5 == 0 {
            0xE0 | (lba as u8 & 0xF)
        } else {
            lba as u8
        };
        assert_eq!(out, sector(expect), "lba {lba}");
    }
}

#[test]
fn teardown_pads_open_blocks_and_returns_untouched() {
    let geo = small_geo(1, 4);
    let media = RamMedia::new(geo);
    let ftl = Ftl::new(media.clone(), config()).expect("ftl");

    ftl.write(Lba(0), &[sector(1), sector(2), sector(3), sector(4)].concat())
        .expect("write");
    ftl.flush().expect("flush");
    ftl.shutdown().expect("shutdown");

    // Block 0 was padded to its data-sector count and closed with a
    // recovery page.
    assert_eq!(media.written_sectors(0, 0), geo.secs_per_blk() as usize);
    let mut meta = Vec::new();
    for paddr in geo.nr_blk_dsecs()..geo.secs_per_blk() {
        meta.extend(media.sector_data(geo.dev_ppa(0, 0, paddr)));
    }
    let page = decode_recovery_page(&meta, &geo).expect("rlpg");
    assert_eq!(page.nr_lbas, 4);
    assert_eq!(page.nr_padded, geo.nr_blk_dsecs() as u32 - 4);

    // The untouched pooled block went back to the media manager: only
    // block 0 is still owned.
    assert_eq!(media.free_blocks(0), 3);
}

#[test]
fn flush_of_empty_ring_completes_immediately() {
    let (ftl, _media) = target(small_geo(2, 8));
    ftl.flush().expect("empty flush");
}
