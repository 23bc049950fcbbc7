//! Per-block recovery page.
//!
//! The last physical page of every closed block carries the block's reverse
//! LBA map and bitmaps so the L2P can be rebuilt by scanning blocks. Layout
//! (little-endian):
//!
//! ```text
//! status:u32 rlpg_len:u32 req_len:u32 bitmap_len:u32 crc:u32
//! nr_lbas:u32 nr_padded:u32 reserved:u32
//! lba_list[nr_blk_dsecs]:u64
//! sector_bitmap bitmap_len bytes
//! sync_bitmap   bitmap_len bytes
//! invalid_bitmap bitmap_len bytes
//! ```
//!
//! The CRC covers everything after itself, up to `rlpg_len`.

use crate::block::BlockInner;
use oxblk_error::{FtlError, Result};
use oxblk_types::Geometry;

/// Block was open when the metadata was generated (teardown snapshot).
pub const BLK_META_OPEN: u32 = 0x1;
/// Block closed normally.
pub const BLK_META_CLOSED: u32 = 0x2;

const HEADER_LEN: usize = 32;
const CRC_OFFSET: usize = 16;

/// Decoded recovery page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPage {
    pub status: u32,
    pub nr_lbas: u32,
    pub nr_padded: u32,
    pub lba_list: Vec<u64>,
    pub sector_bitmap: Vec<u64>,
    pub sync_bitmap: Vec<u64>,
    pub invalid_bitmap: Vec<u64>,
}

fn bitmap_len(geo: &Geometry) -> usize {
    geo.nr_blk_dsecs().div_ceil(64) as usize * 8
}

/// Encoded length for this geometry (header + LBA array + three bitmaps).
#[must_use]
pub fn rlpg_len(geo: &Geometry) -> usize {
    HEADER_LEN + geo.nr_blk_dsecs() as usize * 8 + 3 * bitmap_len(geo)
}

/// Whether the recovery page fits the reserved last page. Checked once at
/// bring-up so encode can assume it.
#[must_use]
pub fn fits(geo: &Geometry) -> bool {
    rlpg_len(geo) <= geo.meta_page_bytes()
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn put_words(buf: &mut [u8], off: usize, words: &[u64]) -> usize {
    let mut off = off;
    for w in words {
        buf[off..off + 8].copy_from_slice(&w.to_le_bytes());
        off += 8;
    }
    off
}

fn get_words(buf: &[u8], off: usize, n: usize) -> (Vec<u64>, usize) {
    let mut words = Vec::with_capacity(n);
    let mut off = off;
    for _ in 0..n {
        words.push(u64::from_le_bytes([
            buf[off],
            buf[off + 1],
            buf[off + 2],
            buf[off + 3],
            buf[off + 4],
            buf[off + 5],
            buf[off + 6],
            buf[off + 7],
        ]));
        off += 8;
    }
    (words, off)
}

/// Serialize a block's metadata into a full recovery page buffer.
#[must_use]
pub fn encode(inner: &BlockInner, status: u32, geo: &Geometry) -> Vec<u8> {
    let len = rlpg_len(geo);
    let req_len = geo.meta_page_bytes();
    debug_assert!(len <= req_len);
    let bm_len = bitmap_len(geo);

    let mut buf = vec![0_u8; req_len];
    put_u32(&mut buf, 0, status);
    put_u32(&mut buf, 4, len as u32);
    put_u32(&mut buf, 8, req_len as u32);
    put_u32(&mut buf, 12, bm_len as u32);
    // crc at 16, filled last
    put_u32(&mut buf, 20, inner.nr_lbas);
    put_u32(&mut buf, 24, inner.nr_padded);

    let off = put_words(&mut buf, HEADER_LEN, &inner.lba_list);
    let off = put_words(&mut buf, off, inner.sector.words());
    let off = put_words(&mut buf, off, inner.sync.words());
    let end = put_words(&mut buf, off, inner.invalid.words());
    debug_assert_eq!(end, len);

    let crc = crc32c::crc32c(&buf[CRC_OFFSET + 4..len]);
    put_u32(&mut buf, CRC_OFFSET, crc);
    buf
}

/// Parse and verify a recovery page.
pub fn decode(buf: &[u8], geo: &Geometry) -> Result<RecoveryPage> {
    let expect_len = rlpg_len(geo);
    if buf.len() < expect_len {
        return Err(FtlError::MetaCorrupt(format!(
            "short recovery page: {} < {expect_len}",
            buf.len()
        )));
    }

    let status = get_u32(buf, 0);
    if status != BLK_META_OPEN && status != BLK_META_CLOSED {
        return Err(FtlError::MetaCorrupt(format!("bad status {status:#x}")));
    }
    let len = get_u32(buf, 4) as usize;
    if len != expect_len {
        return Err(FtlError::MetaCorrupt(format!(
            "length mismatch: {len} != {expect_len}"
        )));
    }
    let bm_len = get_u32(buf, 12) as usize;
    if bm_len != bitmap_len(geo) {
        return Err(FtlError::MetaCorrupt(format!(
            "bitmap length mismatch: {bm_len}"
        )));
    }

    let crc = get_u32(buf, CRC_OFFSET);
    let actual = crc32c::crc32c(&buf[CRC_OFFSET + 4..len]);
    if crc != actual {
        return Err(FtlError::MetaCorrupt(format!(
            "crc mismatch: stored {crc:#010x}, computed {actual:#010x}"
        )));
    }

    let dsecs = geo.nr_blk_dsecs() as usize;
    let words = bm_len / 8;
    let (lba_list, off) = get_words(buf, HEADER_LEN, dsecs);
    let (sector_bitmap, off) = get_words(buf, off, words);
    let (sync_bitmap, off) = get_words(buf, off, words);
    let (invalid_bitmap, _) = get_words(buf, off, words);

    Ok(RecoveryPage {
        status,
        nr_lbas: get_u32(buf, 20),
        nr_padded: get_u32(buf, 24),
        lba_list,
        sector_bitmap,
        sync_bitmap,
        invalid_bitmap,
    })
}
