//! Logical-to-physical map and its update protocol.
//!
//! A flat array of entries under one mutex, held only for constant-time
//! work. The read path latches cached entries with the read-in-flight bit
//! before copying from the ring; any writer that would republish such an
//! entry gets `Busy` and retries with a yield. This is what keeps a cache
//! read from ever observing a slot mid-rewrite.
//!
//! Three publication flavors exist:
//! - cacheline publication on buffered write (unconditional, invalidating a
//!   previous persisted location),
//! - guarded publication for GC/recovery relocation (only if the entry still
//!   points where the relocated data came from),
//! - device publication at completion (only if the entry still points at the
//!   cacheline being persisted; otherwise the fresh sector is stale and is
//!   invalidated on its block instead).

use crate::block::BlockTable;
use oxblk_error::FtlError;
use oxblk_types::{BlockId, DevPpa, Lba, Ppa};
use parking_lot::Mutex;
use tracing::trace;

#[derive(Debug, Clone, Copy)]
pub struct L2pEntry {
    pub ppa: Ppa,
    pub blk: Option<BlockId>,
}

impl L2pEntry {
    const EMPTY: Self = Self {
        ppa: Ppa::Empty,
        blk: None,
    };
}

/// Blocks that became fully invalid during an update and should be retired.
pub type RetireList = Vec<BlockId>;

pub struct L2pMap {
    entries: Mutex<Vec<L2pEntry>>,
}

impl L2pMap {
    #[must_use]
    pub fn new(nr_secs: u64) -> Self {
        Self {
            entries: Mutex::new(vec![L2pEntry::EMPTY; nr_secs as usize]),
        }
    }

    /// Snapshot `k` consecutive entries for a read, setting the
    /// read-in-flight bit on every cached one. The returned snapshot drives
    /// the copy phase; [`Self::unlatch_reads`] must follow.
    #[must_use]
    pub fn latch_reads(&self, slba: Lba, k: usize) -> Vec<Ppa> {
        let mut entries = self.entries.lock();
        let base = slba.0 as usize;
        let mut snap = Vec::with_capacity(k);
        for entry in entries[base..base + k].iter_mut() {
            snap.push(entry.ppa);
            if let Ppa::Cached { line, .. } = entry.ppa {
                entry.ppa = Ppa::Cached {
                    line,
                    read_inflight: true,
                };
            }
        }
        snap
    }

    /// Clear the read-in-flight bit for every entry the snapshot latched.
    ///
    /// The entry may have been republished to a different cacheline in the
    /// meantime; the bit is cleared regardless, mirroring the single-bit
    /// limitation documented on [`Ppa`].
    pub fn unlatch_reads(&self, slba: Lba, snap: &[Ppa]) {
        let mut entries = self.entries.lock();
        let base = slba.0 as usize;
        for (i, latched) in snap.iter().enumerate() {
            if !latched.is_cached() {
                continue;
            }
            let entry = &mut entries[base + i];
            if let Ppa::Cached { line, .. } = entry.ppa {
                entry.ppa = Ppa::Cached {
                    line,
                    read_inflight: false,
                };
            }
        }
    }

    /// Publish a cacheline mapping for a buffered write.
    ///
    /// Returns `Busy` while a reader holds the previous cached entry; the
    /// caller yields and retries. On success returns the block to retire if
    /// invalidating the previous persisted location made it fully invalid.
    pub fn update_map_cache(
        &self,
        lba: Lba,
        line: u64,
        table: &BlockTable,
    ) -> Result<Option<BlockId>, FtlError> {
        let mut entries = self.entries.lock();
        let entry = &mut entries[lba.0 as usize];

        let mut retire = None;
        match entry.ppa {
            Ppa::Cached {
                read_inflight: true,
                ..
            } => return Err(FtlError::Busy),
            Ppa::Device(old) => {
                retire = invalidate_dev(table, old, entry.blk);
            }
            Ppa::Cached { .. } | Ppa::Empty => {}
        }

        entry.ppa = Ppa::Cached {
            line,
            read_inflight: false,
        };
        entry.blk = None;
        trace!(target: "oxblk::l2p", lba = lba.0, line, "cache mapping published");
        Ok(retire)
    }

    /// Guarded cacheline publication for relocated (GC/recovery) data:
    /// publish only while the entry still points at `expected`. Returns
    /// whether the publication happened.
    pub fn update_map_gc(
        &self,
        lba: Lba,
        line: u64,
        expected: Option<DevPpa>,
        table: &BlockTable,
    ) -> Result<(bool, Option<BlockId>), FtlError> {
        let Some(expected) = expected else {
            // External GC contract: unguarded, same as a user write.
            return self.update_map_cache(lba, line, table).map(|r| (true, r));
        };

        let mut entries = self.entries.lock();
        let entry = &mut entries[lba.0 as usize];
        match entry.ppa {
            Ppa::Device(old) if old == expected => {
                let retire = invalidate_dev(table, old, entry.blk);
                entry.ppa = Ppa::Cached {
                    line,
                    read_inflight: false,
                };
                entry.blk = None;
                Ok((true, retire))
            }
            // The host rewrote or discarded the LBA since the relocation
            // batch was built; the relocated copy is stale.
            _ => Ok((false, None)),
        }
    }

    /// Publish the persisted location once a ring entry's device write has
    /// committed in order.
    ///
    /// Returns `Busy` while a reader is copying the cacheline. If the entry
    /// no longer points at `line`, the freshly written sector is stale and
    /// is invalidated on its block.
    pub fn update_map_dev(
        &self,
        lba: Lba,
        line: u64,
        dev: DevPpa,
        blk: BlockId,
        table: &BlockTable,
    ) -> Result<Option<BlockId>, FtlError> {
        let mut entries = self.entries.lock();
        let entry = &mut entries[lba.0 as usize];

        match entry.ppa {
            Ppa::Cached {
                line: l,
                read_inflight,
            } if l == line => {
                if read_inflight {
                    return Err(FtlError::Busy);
                }
                entry.ppa = Ppa::Device(dev);
                entry.blk = Some(blk);
                trace!(target: "oxblk::l2p", lba = lba.0, ppa = %dev, "persisted mapping published");
                Ok(None)
            }
            _ => {
                trace!(target: "oxblk::l2p", lba = lba.0, ppa = %dev, "stale write invalidated");
                Ok(invalidate_dev(table, dev, Some(blk)))
            }
        }
    }

    /// Discard a range: invalidate persisted owners and empty every entry.
    #[must_use]
    pub fn invalidate_range(&self, slba: Lba, n: u64, table: &BlockTable) -> RetireList {
        let mut entries = self.entries.lock();
        let base = slba.0 as usize;
        let mut retire = RetireList::new();
        for entry in entries[base..base + n as usize].iter_mut() {
            if let Ppa::Device(old) = entry.ppa {
                if let Some(id) = invalidate_dev(table, old, entry.blk) {
                    retire.push(id);
                }
            }
            *entry = L2pEntry::EMPTY;
        }
        retire
    }

    /// Current entry, for completion checks and tests.
    #[must_use]
    pub fn lookup(&self, lba: Lba) -> L2pEntry {
        self.entries.lock()[lba.0 as usize]
    }

    /// Filter `(lba, paddr)` pairs down to those still mapped to the given
    /// device address. Used when collecting relocation victims.
    #[must_use]
    pub fn filter_mapped(&self, candidates: &[(u64, DevPpa)]) -> Vec<u64> {
        let entries = self.entries.lock();
        candidates
            .iter()
            .filter(|(lba, dev)| entries[*lba as usize].ppa == Ppa::Device(*dev))
            .map(|(lba, _)| *lba)
            .collect()
    }
}

/// Mark the sector behind a persisted mapping invalid on its owning block.
fn invalidate_dev(table: &BlockTable, dev: DevPpa, blk: Option<BlockId>) -> Option<BlockId> {
    let blk = blk?;
    let block = table.get(blk);
    let paddr = table.geometry().paddr_of(dev);
    let retire = block.lock().invalidate(paddr);
    retire.then_some(blk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockState;
    use oxblk_types::Geometry;

    fn setup() -> (L2pMap, BlockTable) {
        let geo = Geometry::new(1, 2, 1, 4, 4, 4, 512, 8).expect("geometry");
        (L2pMap::new(geo.nr_secs()), BlockTable::new(geo))
    }

    #[test]
    fn cache_publication_and_lookup() {
        let (l2p, table) = setup();
        assert!(l2p.update_map_cache(Lba(5), 3, &table).expect("update").is_none());
        let entry = l2p.lookup(Lba(5));
        assert_eq!(
            entry.ppa,
            Ppa::Cached {
                line: 3,
                read_inflight: false
            }
        );
        assert!(entry.blk.is_none());
    }

    #[test]
    fn latched_entry_blocks_republication() {
        let (l2p, table) = setup();
        l2p.update_map_cache(Lba(7), 1, &table).expect("update");

        let snap = l2p.latch_reads(Lba(7), 1);
        assert_eq!(
            snap[0],
            Ppa::Cached {
                line: 1,
                read_inflight: false
            }
        );
        assert!(matches!(
            l2p.update_map_cache(Lba(7), 2, &table),
            Err(FtlError::Busy)
        ));

        l2p.unlatch_reads(Lba(7), &snap);
        assert!(l2p.update_map_cache(Lba(7), 2, &table).is_ok());
    }

    #[test]
    fn dev_publication_requires_matching_line() {
        let (l2p, table) = setup();
        let geo = *table.geometry();
        l2p.update_map_cache(Lba(3), 4, &table).expect("update");

        let blk = geo.block_id(0, 0);
        {
            let mut inner = table.get(blk).lock();
            inner.st = BlockState::Open;
            inner.alloc_secs(4);
        }
        let dev = geo.dev_ppa(0, 0, 0);

        // Overwritten while in flight: the new sector is invalidated, the
        // mapping stays on the newer cacheline.
        l2p.update_map_cache(Lba(3), 9, &table).expect("overwrite");
        assert!(l2p.update_map_dev(Lba(3), 4, dev, blk, &table).expect("stale").is_none());
        assert_eq!(l2p.lookup(Lba(3)).ppa.cacheline(), Some(9));
        assert_eq!(table.get(blk).lock().nr_invalid, 1);

        // Matching line: publish.
        let dev2 = geo.dev_ppa(0, 0, 1);
        l2p.update_map_dev(Lba(3), 9, dev2, blk, &table).expect("publish");
        assert_eq!(l2p.lookup(Lba(3)).ppa, Ppa::Device(dev2));
        assert_eq!(l2p.lookup(Lba(3)).blk, Some(blk));
    }

    #[test]
    fn overwrite_of_persisted_invalidates_old_sector() {
        let (l2p, table) = setup();
        let geo = *table.geometry();
        let blk = geo.block_id(1, 0);
        {
            let mut inner = table.get(blk).lock();
            inner.st = BlockState::Open;
            inner.alloc_secs(4);
        }
        let dev = geo.dev_ppa(1, 0, 2);

        l2p.update_map_cache(Lba(11), 0, &table).expect("cache");
        l2p.update_map_dev(Lba(11), 0, dev, blk, &table).expect("dev");

        l2p.update_map_cache(Lba(11), 5, &table).expect("rewrite");
        assert!(table.get(blk).lock().invalid.test(2));
    }

    #[test]
    fn discard_empties_range_and_reports_retire() {
        let (l2p, table) = setup();
        let geo = *table.geometry();
        let blk = geo.block_id(0, 1);
        let dsecs = geo.nr_blk_dsecs();
        {
            let mut inner = table.get(blk).lock();
            inner.st = BlockState::Closed;
            inner.alloc_secs(dsecs);
        }

        for i in 0..dsecs {
            l2p.update_map_cache(Lba(10 + i), i, &table).expect("cache");
            l2p.update_map_dev(Lba(10 + i), i, geo.dev_ppa(0, 1, i), blk, &table)
                .expect("dev");
        }

        let retire = l2p.invalidate_range(Lba(10), dsecs, &table);
        assert_eq!(retire, vec![blk]);
        assert!(l2p.lookup(Lba(10)).ppa.is_empty());
        assert!(l2p.lookup(Lba(10 + dsecs - 1)).ppa.is_empty());
    }

    #[test]
    fn gc_publication_is_guarded() {
        let (l2p, table) = setup();
        let geo = *table.geometry();
        let blk = geo.block_id(0, 0);
        {
            let mut inner = table.get(blk).lock();
            inner.st = BlockState::Open;
            inner.alloc_secs(4);
        }
        let dev = geo.dev_ppa(0, 0, 1);
        l2p.update_map_cache(Lba(20), 0, &table).expect("cache");
        l2p.update_map_dev(Lba(20), 0, dev, blk, &table).expect("dev");

        // Guard holds: relocation publishes.
        let (published, _) = l2p
            .update_map_gc(Lba(20), 7, Some(dev), &table)
            .expect("gc update");
        assert!(published);
        assert_eq!(l2p.lookup(Lba(20)).ppa.cacheline(), Some(7));

        // Guard fails: entry moved on, no publication.
        let (published, _) = l2p
            .update_map_gc(Lba(20), 8, Some(dev), &table)
            .expect("gc update");
        assert!(!published);
        assert_eq!(l2p.lookup(Lba(20)).ppa.cacheline(), Some(7));
    }

    #[test]
    fn filter_mapped_keeps_current_victims() {
        let (l2p, table) = setup();
        let geo = *table.geometry();
        let blk = geo.block_id(0, 0);
        {
            let mut inner = table.get(blk).lock();
            inner.st = BlockState::Open;
            inner.alloc_secs(8);
        }
        let d0 = geo.dev_ppa(0, 0, 0);
        let d1 = geo.dev_ppa(0, 0, 1);
        l2p.update_map_cache(Lba(1), 0, &table).expect("cache");
        l2p.update_map_dev(Lba(1), 0, d0, blk, &table).expect("dev");
        l2p.update_map_cache(Lba(2), 1, &table).expect("cache");
        l2p.update_map_dev(Lba(2), 1, d1, blk, &table).expect("dev");
        // LBA 2 rewritten since.
        l2p.update_map_cache(Lba(2), 9, &table).expect("rewrite");

        let survivors = l2p.filter_mapped(&[(1, d0), (2, d1)]);
        assert_eq!(survivors, vec![1]);
    }
}
