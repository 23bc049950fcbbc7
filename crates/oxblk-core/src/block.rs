//! Per-erase-block state.
//!
//! A block tracks three bitmaps over its data sectors: `sector` (allocated),
//! `sync` (persisted on media), `invalid` (overwritten, discarded, or
//! padding). Allocation is a contiguous cursor bump, so
//! `cur_sec == popcount(sector)` always holds; the block is full when the
//! cursor reaches the data-sector count and closeable when every allocated
//! sector has synced.

use oxblk_types::{BlockId, Geometry, ADDR_EMPTY};
use parking_lot::{Mutex, MutexGuard};

/// Lifecycle of an erase block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Erased, waiting in the provisioner pool.
    Free,
    /// Accepting writes as some LUN's current block.
    Open,
    /// All data sectors allocated; waiting for outstanding syncs.
    Full,
    /// Recovery page write in flight.
    Closing,
    /// Recovery page persisted.
    Closed,
    /// Fully invalid and returned to the media manager.
    Retired,
    /// Grown bad.
    Bad,
}

/// Fixed-width bitmap over data sectors.
#[derive(Debug, Clone)]
pub struct Bitmap {
    words: Vec<u64>,
    nbits: u64,
}

impl Bitmap {
    #[must_use]
    pub fn new(nbits: u64) -> Self {
        Self {
            words: vec![0_u64; nbits.div_ceil(64) as usize],
            nbits,
        }
    }

    /// Set bit `idx`, returning its previous value.
    pub fn set(&mut self, idx: u64) -> bool {
        debug_assert!(idx < self.nbits);
        let word = (idx / 64) as usize;
        let mask = 1_u64 << (idx % 64);
        let prev = self.words[word] & mask != 0;
        self.words[word] |= mask;
        prev
    }

    #[must_use]
    pub fn test(&self, idx: u64) -> bool {
        debug_assert!(idx < self.nbits);
        self.words[(idx / 64) as usize] & (1_u64 << (idx % 64)) != 0
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.count() == self.nbits
    }

    #[must_use]
    pub fn nbits(&self) -> u64 {
        self.nbits
    }

    #[must_use]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }
}

/// Mutable block state behind the block mutex.
#[derive(Debug)]
pub struct BlockInner {
    pub st: BlockState,
    pub cur_sec: u64,
    pub sector: Bitmap,
    pub sync: Bitmap,
    pub invalid: Bitmap,
    pub nr_invalid: u64,
    /// Reverse map stamped at drain time and persisted in the recovery page.
    pub lba_list: Vec<u64>,
    pub nr_lbas: u32,
    pub nr_padded: u32,
}

impl BlockInner {
    fn new(dsecs: u64) -> Self {
        Self {
            st: BlockState::Free,
            cur_sec: 0,
            sector: Bitmap::new(dsecs),
            sync: Bitmap::new(dsecs),
            invalid: Bitmap::new(dsecs),
            nr_invalid: 0,
            lba_list: vec![ADDR_EMPTY; dsecs as usize],
            nr_lbas: 0,
            nr_padded: 0,
        }
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.cur_sec == self.sector.nbits()
    }

    /// Allocate `n` contiguous sectors, returning the base address.
    ///
    /// Fails only when fewer than `n` sectors remain; the caller replaces
    /// the block in that case. Alignment holds because `n` always equals the
    /// device write granularity, which divides the data-sector count.
    pub fn alloc_secs(&mut self, n: u64) -> Option<u64> {
        let dsecs = self.sector.nbits();
        if self.cur_sec + n > dsecs {
            return None;
        }
        let base = self.cur_sec;
        for i in 0..n {
            let prev = self.sector.set(base + i);
            debug_assert!(!prev);
        }
        self.cur_sec += n;
        if self.cur_sec == dsecs {
            self.st = BlockState::Full;
        }
        Some(base)
    }

    /// Record a persisted sector. Returns `true` when the sync bitmap just
    /// filled and the block can close.
    pub fn set_sync(&mut self, paddr: u64) -> bool {
        let prev = self.sync.set(paddr);
        debug_assert!(!prev, "sector synced twice");
        self.sync.is_full()
    }

    /// Stamp a padding sector: invalid and sync-complete at once, so the
    /// block can close even though no host data lands there.
    pub fn pad_invalidate(&mut self, paddr: u64) -> bool {
        if !self.invalid.set(paddr) {
            self.nr_invalid += 1;
        }
        self.nr_padded += 1;
        self.lba_list[paddr as usize] = ADDR_EMPTY;
        let prev = self.sync.set(paddr);
        debug_assert!(!prev, "padded sector already synced");
        self.sync.is_full()
    }

    /// Invalidate an overwritten or discarded sector. Returns `true` when a
    /// closed block just became fully invalid and should be retired.
    pub fn invalidate(&mut self, paddr: u64) -> bool {
        if !self.invalid.set(paddr) {
            self.nr_invalid += 1;
        }
        self.st == BlockState::Closed && self.invalid.is_full()
    }

    /// Record the LBA mapped to `paddr` for the recovery page.
    pub fn record_lba(&mut self, paddr: u64, lba: u64) {
        self.lba_list[paddr as usize] = lba;
        self.nr_lbas += 1;
    }

    /// Reset to a freshly erased state.
    pub fn reset_free(&mut self) {
        self.st = BlockState::Free;
        self.cur_sec = 0;
        self.sector.clear_all();
        self.sync.clear_all();
        self.invalid.clear_all();
        self.nr_invalid = 0;
        self.lba_list.fill(ADDR_EMPTY);
        self.nr_lbas = 0;
        self.nr_padded = 0;
    }
}

/// One erase block. The immutable identity lives outside the mutex.
#[derive(Debug)]
pub struct Block {
    pub id: BlockId,
    pub lun: u32,
    pub blk: u32,
    inner: Mutex<BlockInner>,
}

impl Block {
    #[must_use]
    pub fn new(id: BlockId, lun: u32, blk: u32, dsecs: u64) -> Self {
        Self {
            id,
            lun,
            blk,
            inner: Mutex::new(BlockInner::new(dsecs)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, BlockInner> {
        self.inner.lock()
    }

    #[must_use]
    pub fn state(&self) -> BlockState {
        self.inner.lock().st
    }
}

/// Process-wide arena of every physical erase block, indexed by [`BlockId`].
#[derive(Debug)]
pub struct BlockTable {
    blocks: Vec<Block>,
    geo: Geometry,
}

impl BlockTable {
    #[must_use]
    pub fn new(geo: Geometry) -> Self {
        let dsecs = geo.nr_blk_dsecs();
        let blocks = (0..geo.nr_blocks() as u32)
            .map(|idx| {
                let id = BlockId(idx);
                let (lun, blk) = geo.block_coords(id);
                Block::new(id, lun, blk, dsecs)
            })
            .collect();
        Self { blocks, geo }
    }

    #[must_use]
    pub fn get(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner(dsecs: u64) -> BlockInner {
        let mut inner = BlockInner::new(dsecs);
        inner.st = BlockState::Open;
        inner
    }

    #[test]
    fn bitmap_ops() {
        let mut bm = Bitmap::new(70);
        assert!(!bm.set(0));
        assert!(bm.set(0));
        assert!(!bm.set(69));
        assert_eq!(bm.count(), 2);
        assert!(bm.test(69));
        assert!(!bm.test(68));
        assert!(!bm.is_full());
        for i in 0..70 {
            bm.set(i);
        }
        assert!(bm.is_full());
        bm.clear_all();
        assert_eq!(bm.count(), 0);
    }

    #[test]
    fn contiguous_allocation_tracks_cursor() {
        let mut b = inner(16);
        assert_eq!(b.alloc_secs(4), Some(0));
        assert_eq!(b.alloc_secs(4), Some(4));
        assert_eq!(b.cur_sec, 8);
        assert_eq!(b.sector.count(), b.cur_sec);
        assert_eq!(b.alloc_secs(4), Some(8));
        assert_eq!(b.alloc_secs(4), Some(12));
        assert_eq!(b.st, BlockState::Full);
        assert_eq!(b.alloc_secs(4), None);
    }

    #[test]
    fn sync_bitmap_closes_block() {
        let mut b = inner(8);
        b.alloc_secs(8);
        for paddr in 0..7 {
            assert!(!b.set_sync(paddr));
        }
        assert!(b.set_sync(7));
    }

    #[test]
    fn padding_counts_as_synced_and_invalid() {
        let mut b = inner(8);
        b.alloc_secs(8);
        for paddr in 0..4 {
            b.record_lba(paddr, 100 + paddr);
            b.set_sync(paddr);
        }
        for paddr in 4..7 {
            assert!(!b.pad_invalidate(paddr));
        }
        assert!(b.pad_invalidate(7));
        assert_eq!(b.nr_padded, 4);
        assert_eq!(b.nr_invalid, 4);
        assert_eq!(b.lba_list[5], ADDR_EMPTY);
        assert_eq!(b.lba_list[2], 102);
    }

    #[test]
    fn retire_only_when_closed_and_fully_invalid() {
        let mut b = inner(4);
        b.alloc_secs(4);
        for paddr in 0..4 {
            b.set_sync(paddr);
        }
        assert!(!b.invalidate(0));
        b.st = BlockState::Closed;
        assert!(!b.invalidate(1));
        assert!(!b.invalidate(2));
        assert!(b.invalidate(3));
        // Double invalidation does not bump the counter.
        assert_eq!(b.nr_invalid, 4);
        b.invalidate(3);
        assert_eq!(b.nr_invalid, 4);
    }

    #[test]
    fn table_indexes_by_lun_and_block() {
        let geo = Geometry::new(2, 4, 1, 8, 16, 4, 512, 8).expect("geometry");
        let table = BlockTable::new(geo);
        let id = geo.block_id(3, 5);
        let block = table.get(id);
        assert_eq!(block.lun, 3);
        assert_eq!(block.blk, 5);
        assert_eq!(block.state(), BlockState::Free);
    }
}
