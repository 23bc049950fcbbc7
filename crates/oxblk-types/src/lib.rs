#![forbid(unsafe_code)]
//! Shared address and geometry types for oxblk.
//!
//! A logical address (`Lba`) maps through the L2P to a `Ppa`, which is either
//! empty, a cacheline in the write buffer, or a packed device address
//! (`DevPpa`). The packed form exists only for the media boundary; everything
//! above it works with `(lun, blk, block-local sector)` coordinates.

use oxblk_error::FtlError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel for "no address": empty slots in scattered LBA lists and the OOB
/// metadata of padded sectors.
pub const ADDR_EMPTY: u64 = u64::MAX;

/// Maximum sectors per host request; also the width of the per-request
/// status and done bitmaps (`u64`).
pub const MAX_REQ_SECS: usize = 64;

/// Host-visible logical block address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lba(pub u64);

impl Lba {
    /// The empty sentinel, usable wherever a raw `u64` list carries
    /// [`ADDR_EMPTY`].
    pub const EMPTY: Self = Self(ADDR_EMPTY);

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == ADDR_EMPTY
    }

    /// Offset within a request, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, secs: u64) -> Option<Self> {
        self.0.checked_add(secs).map(Self)
    }
}

impl fmt::Display for Lba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Arena index of an erase block in the process-wide block table.
///
/// Ring entries and L2P entries back-reference their owning block through
/// this index rather than an owning pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of data a buffered write carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Host write.
    User,
    /// Garbage-collector relocation (admitted under emergency GC).
    Gc,
    /// Padding sector, never mapped to an LBA.
    Pad,
}

// ── Packed device address ───────────────────────────────────────────────────

const SEC_SHIFT: u32 = 0;
const PL_SHIFT: u32 = 8;
const PG_SHIFT: u32 = 12;
const BLK_SHIFT: u32 = 28;
const LUN_SHIFT: u32 = 44;
const CH_SHIFT: u32 = 52;

const SEC_MASK: u64 = 0xFF;
const PL_MASK: u64 = 0xF;
const PG_MASK: u64 = 0xFFFF;
const BLK_MASK: u64 = 0xFFFF;
const LUN_MASK: u64 = 0xFF;
const CH_MASK: u64 = 0xFF;

/// Packed global device address `{ch, lun, pl, blk, pg, sec}`.
///
/// Field widths are fixed (8/8/4/16/16/8 bits); [`Geometry::new`] rejects
/// geometries that do not fit them. Ordering on the packed word has no
/// physical meaning and exists only for use in sets and maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DevPpa(u64);

impl DevPpa {
    #[must_use]
    pub fn new(ch: u32, lun: u32, pl: u32, blk: u32, pg: u32, sec: u32) -> Self {
        Self(
            (u64::from(ch) & CH_MASK) << CH_SHIFT
                | (u64::from(lun) & LUN_MASK) << LUN_SHIFT
                | (u64::from(blk) & BLK_MASK) << BLK_SHIFT
                | (u64::from(pg) & PG_MASK) << PG_SHIFT
                | (u64::from(pl) & PL_MASK) << PL_SHIFT
                | (u64::from(sec) & SEC_MASK) << SEC_SHIFT,
        )
    }

    #[must_use]
    pub fn from_packed(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn packed(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn ch(self) -> u32 {
        ((self.0 >> CH_SHIFT) & CH_MASK) as u32
    }

    #[must_use]
    pub fn lun(self) -> u32 {
        ((self.0 >> LUN_SHIFT) & LUN_MASK) as u32
    }

    #[must_use]
    pub fn pl(self) -> u32 {
        ((self.0 >> PL_SHIFT) & PL_MASK) as u32
    }

    #[must_use]
    pub fn blk(self) -> u32 {
        ((self.0 >> BLK_SHIFT) & BLK_MASK) as u32
    }

    #[must_use]
    pub fn pg(self) -> u32 {
        ((self.0 >> PG_SHIFT) & PG_MASK) as u32
    }

    #[must_use]
    pub fn sec(self) -> u32 {
        ((self.0 >> SEC_SHIFT) & SEC_MASK) as u32
    }

    /// Whether two addresses land in the same erase block.
    #[must_use]
    pub fn same_blk(self, other: Self) -> bool {
        self.lun() == other.lun() && self.blk() == other.blk()
    }
}

impl fmt::Display for DevPpa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ch:{} lun:{} pl:{} blk:{} pg:{} sec:{}",
            self.ch(),
            self.lun(),
            self.pl(),
            self.blk(),
            self.pg(),
            self.sec()
        )
    }
}

/// Physical address as seen by the L2P: empty, a write-buffer cacheline, or
/// a device address.
///
/// `read_inflight` is a single bit, as in the on-device OOB format it mirrors:
/// one tracked reader per cached LBA. A second concurrent reader can clear the
/// bit early; the mapping-update retry loop tolerates the spurious clear
/// because the sync cursor still pins the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ppa {
    Empty,
    Cached { line: u64, read_inflight: bool },
    Device(DevPpa),
}

impl Ppa {
    #[must_use]
    pub fn is_empty(self) -> bool {
        matches!(self, Self::Empty)
    }

    #[must_use]
    pub fn is_cached(self) -> bool {
        matches!(self, Self::Cached { .. })
    }

    #[must_use]
    pub fn is_device(self) -> bool {
        matches!(self, Self::Device(_))
    }

    #[must_use]
    pub fn cacheline(self) -> Option<u64> {
        match self {
            Self::Cached { line, .. } => Some(line),
            _ => None,
        }
    }
}

// ── Device geometry ─────────────────────────────────────────────────────────

/// Validated device geometry.
///
/// All sector counts are in units of one exposed sector (`sec_size` bytes).
/// The device write granularity is `min_write_secs`, one full page across
/// all planes; every submitted request must be a multiple of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub nr_channels: u32,
    pub nr_luns: u32,
    pub nr_planes: u32,
    pub blks_per_lun: u32,
    pub pgs_per_blk: u32,
    /// Sectors per page per plane.
    pub sec_per_pg: u32,
    /// Sector size in bytes.
    pub sec_size: u32,
    /// Maximum sectors per device write request.
    pub max_write_pgs: u32,
}

impl Geometry {
    pub fn new(
        nr_channels: u32,
        nr_luns: u32,
        nr_planes: u32,
        blks_per_lun: u32,
        pgs_per_blk: u32,
        sec_per_pg: u32,
        sec_size: u32,
        max_write_pgs: u32,
    ) -> Result<Self, FtlError> {
        let geo = Self {
            nr_channels,
            nr_luns,
            nr_planes,
            blks_per_lun,
            pgs_per_blk,
            sec_per_pg,
            sec_size,
            max_write_pgs,
        };
        geo.validate()?;
        Ok(geo)
    }

    fn validate(&self) -> Result<(), FtlError> {
        let fail = |reason: &str| Err(FtlError::Geometry(reason.to_owned()));

        if self.nr_channels == 0
            || self.nr_luns == 0
            || self.nr_planes == 0
            || self.blks_per_lun == 0
            || self.pgs_per_blk == 0
            || self.sec_per_pg == 0
            || self.sec_size == 0
        {
            return fail("all dimensions must be non-zero");
        }
        if self.nr_luns > LUN_MASK as u32 + 1
            || self.nr_channels > CH_MASK as u32 + 1
            || self.nr_planes > PL_MASK as u32 + 1
            || self.blks_per_lun > BLK_MASK as u32 + 1
            || self.pgs_per_blk > PG_MASK as u32 + 1
            || self.sec_per_pg > SEC_MASK as u32 + 1
        {
            return fail("dimension exceeds packed address field width");
        }
        if self.nr_luns % self.nr_channels != 0 {
            return fail("nr_luns must be a multiple of nr_channels");
        }
        if !self.sec_size.is_power_of_two() {
            return fail("sec_size must be a power of two");
        }
        let min = self.min_write_secs();
        if self.max_write_pgs < min || self.max_write_pgs % min != 0 {
            return fail("max_write_pgs must be a non-zero multiple of min_write_secs");
        }
        if self.max_write_pgs as usize > MAX_REQ_SECS {
            return fail("max_write_pgs exceeds per-request sector limit");
        }
        if self.pgs_per_blk < 2 {
            return fail("pgs_per_blk must leave room for the recovery page");
        }
        Ok(())
    }

    /// Device write granularity: one page across all planes, in sectors.
    #[must_use]
    pub fn min_write_secs(&self) -> u32 {
        self.sec_per_pg * self.nr_planes
    }

    /// Total sectors per erase block, recovery page included.
    #[must_use]
    pub fn secs_per_blk(&self) -> u64 {
        u64::from(self.min_write_secs()) * u64::from(self.pgs_per_blk)
    }

    /// Data sectors per erase block: everything except the last physical
    /// page, which holds the recovery metadata.
    #[must_use]
    pub fn nr_blk_dsecs(&self) -> u64 {
        self.secs_per_blk() - u64::from(self.min_write_secs())
    }

    /// Host-visible capacity in sectors.
    #[must_use]
    pub fn nr_secs(&self) -> u64 {
        u64::from(self.nr_luns) * u64::from(self.blks_per_lun) * self.nr_blk_dsecs()
    }

    /// Arena index for `(lun, blk)`.
    #[must_use]
    pub fn block_id(&self, lun: u32, blk: u32) -> BlockId {
        BlockId(lun * self.blks_per_lun + blk)
    }

    /// Inverse of [`Self::block_id`].
    #[must_use]
    pub fn block_coords(&self, id: BlockId) -> (u32, u32) {
        (id.0 / self.blks_per_lun, id.0 % self.blks_per_lun)
    }

    /// Total number of erase blocks across all LUNs.
    #[must_use]
    pub fn nr_blocks(&self) -> usize {
        self.nr_luns as usize * self.blks_per_lun as usize
    }

    /// Build the packed device address for a block-local sector.
    ///
    /// `paddr` is the flat sector index within the block, including the
    /// recovery page region at the tail.
    #[must_use]
    pub fn dev_ppa(&self, lun: u32, blk: u32, paddr: u64) -> DevPpa {
        debug_assert!(paddr < self.secs_per_blk());
        let min = u64::from(self.min_write_secs());
        let pg = paddr / min;
        let within = paddr % min;
        let pl = within / u64::from(self.sec_per_pg);
        let sec = within % u64::from(self.sec_per_pg);
        DevPpa::new(
            lun % self.nr_channels,
            lun,
            pl as u32,
            blk,
            pg as u32,
            sec as u32,
        )
    }

    /// Recover the block-local sector index from a packed address.
    #[must_use]
    pub fn paddr_of(&self, ppa: DevPpa) -> u64 {
        u64::from(ppa.pg()) * u64::from(self.min_write_secs())
            + u64::from(ppa.pl()) * u64::from(self.sec_per_pg)
            + u64::from(ppa.sec())
    }

    /// Byte length of the recovery page region (one full page).
    #[must_use]
    pub fn meta_page_bytes(&self) -> usize {
        self.min_write_secs() as usize * self.sec_size as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> Geometry {
        Geometry::new(2, 4, 1, 8, 16, 4, 4096, 8).expect("geometry")
    }

    #[test]
    fn geometry_derived_counts() {
        let g = geo();
        assert_eq!(g.min_write_secs(), 4);
        assert_eq!(g.secs_per_blk(), 64);
        assert_eq!(g.nr_blk_dsecs(), 60);
        assert_eq!(g.nr_secs(), 4 * 8 * 60);
        assert_eq!(g.nr_blocks(), 32);
    }

    #[test]
    fn geometry_rejects_bad_dimensions() {
        assert!(Geometry::new(0, 4, 1, 8, 16, 4, 4096, 8).is_err());
        // max_write_pgs not a multiple of min_write_secs
        assert!(Geometry::new(2, 4, 1, 8, 16, 4, 4096, 6).is_err());
        // luns not a multiple of channels
        assert!(Geometry::new(3, 4, 1, 8, 16, 4, 4096, 8).is_err());
        // sec_size not a power of two
        assert!(Geometry::new(2, 4, 1, 8, 16, 4, 4000, 8).is_err());
        // request bitmap is a u64
        assert!(Geometry::new(2, 4, 1, 8, 16, 16, 4096, 128).is_err());
    }

    #[test]
    fn dev_ppa_pack_round_trip() {
        let ppa = DevPpa::new(1, 3, 2, 500, 1000, 7);
        assert_eq!(ppa.ch(), 1);
        assert_eq!(ppa.lun(), 3);
        assert_eq!(ppa.pl(), 2);
        assert_eq!(ppa.blk(), 500);
        assert_eq!(ppa.pg(), 1000);
        assert_eq!(ppa.sec(), 7);
        assert_eq!(DevPpa::from_packed(ppa.packed()), ppa);
    }

    #[test]
    fn dev_ppa_from_paddr_round_trip() {
        let g = Geometry::new(2, 4, 2, 8, 16, 2, 4096, 8).expect("geometry");
        // min_write_secs = 4; paddr 13 => pg 3, within 1 => pl 0, sec 1
        let ppa = g.dev_ppa(3, 5, 13);
        assert_eq!(ppa.lun(), 3);
        assert_eq!(ppa.ch(), 1);
        assert_eq!(ppa.blk(), 5);
        assert_eq!(ppa.pg(), 3);
        assert_eq!(ppa.pl(), 0);
        assert_eq!(ppa.sec(), 1);
        assert_eq!(g.paddr_of(ppa), 13);

        for paddr in 0..g.secs_per_blk() {
            assert_eq!(g.paddr_of(g.dev_ppa(1, 2, paddr)), paddr);
        }
    }

    #[test]
    fn block_id_round_trip() {
        let g = geo();
        let id = g.block_id(3, 7);
        assert_eq!(g.block_coords(id), (3, 7));
        assert_eq!(id, BlockId(3 * 8 + 7));
    }

    #[test]
    fn ppa_variant_helpers() {
        assert!(Ppa::Empty.is_empty());
        let cached = Ppa::Cached {
            line: 9,
            read_inflight: false,
        };
        assert!(cached.is_cached());
        assert_eq!(cached.cacheline(), Some(9));
        assert!(Ppa::Device(DevPpa::new(0, 0, 0, 0, 0, 0)).is_device());
    }

    #[test]
    fn lba_sentinel() {
        assert!(Lba::EMPTY.is_empty());
        assert!(!Lba(0).is_empty());
        assert_eq!(Lba(u64::MAX - 1).checked_add(2), None);
    }
}
