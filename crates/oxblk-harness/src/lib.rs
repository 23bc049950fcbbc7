#![forbid(unsafe_code)]
//! Workload harness: drives an [`Ftl`] over the in-memory device and
//! verifies every byte it wrote.

use anyhow::{bail, Context, Result};
use oxblk_core::{Ftl, FtlConfig, FtlMetrics};
use oxblk_media::RamMedia;
use oxblk_types::{Geometry, Lba};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Workload shape. All patterns are deterministic so failures reproduce.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Sectors to write sequentially.
    pub nr_secs: u64,
    /// Issue a flush after every N writes (0 = only the final flush).
    pub flush_every: u64,
    /// Re-write every Nth sector afterwards with a second pattern
    /// (0 = no overwrites).
    pub overwrite_stride: u64,
    /// Discard every Nth sector at the end (0 = no discards).
    pub discard_stride: u64,
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        Self {
            nr_secs: 256,
            flush_every: 13,
            overwrite_stride: 5,
            discard_stride: 17,
        }
    }
}

/// Outcome of a workload run, JSON-printable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadReport {
    pub spec: WorkloadSpec,
    pub written_secs: u64,
    pub overwritten_secs: u64,
    pub discarded_secs: u64,
    pub verified_secs: u64,
    pub flushes: u64,
    pub wall_ms: u128,
    pub metrics: FtlMetrics,
}

fn first_pattern(lba: u64) -> u8 {
    (lba.wrapping_mul(31) % 251) as u8
}

fn second_pattern(lba: u64) -> u8 {
    (lba.wrapping_mul(67) % 239) as u8 | 0x80
}

/// A harness-sized geometry: 4 LUNs on 2 channels, 16 blocks per LUN.
#[must_use]
pub fn default_geometry() -> Geometry {
    Geometry::new(2, 4, 1, 16, 8, 4, 4096, 16).expect("default geometry is valid")
}

/// Run the workload and verify every sector's final contents.
pub fn run_workload(geo: Geometry, cfg: FtlConfig, spec: WorkloadSpec) -> Result<WorkloadReport> {
    if spec.nr_secs > geo.nr_secs() {
        bail!(
            "workload of {} sectors exceeds capacity {}",
            spec.nr_secs,
            geo.nr_secs()
        );
    }

    let start = Instant::now();
    let media = RamMedia::new(geo);
    let ftl = Ftl::new(media, cfg).context("bring up target")?;
    let sec_size = geo.sec_size as usize;

    let mut flushes = 0_u64;
    for lba in 0..spec.nr_secs {
        let payload = vec![first_pattern(lba); sec_size];
        ftl.write(Lba(lba), &payload).context("write")?;
        if spec.flush_every != 0 && lba % spec.flush_every == 0 {
            ftl.flush().context("flush")?;
            flushes += 1;
        }
    }

    let mut overwritten = 0_u64;
    if spec.overwrite_stride != 0 {
        for lba in (0..spec.nr_secs).step_by(spec.overwrite_stride as usize) {
            let payload = vec![second_pattern(lba); sec_size];
            ftl.write(Lba(lba), &payload).context("overwrite")?;
            overwritten += 1;
        }
    }

    let mut discarded = 0_u64;
    if spec.discard_stride != 0 {
        for lba in (0..spec.nr_secs).step_by(spec.discard_stride as usize) {
            ftl.discard(Lba(lba), 1).context("discard")?;
            discarded += 1;
        }
    }

    ftl.flush().context("final flush")?;
    flushes += 1;

    let mut verified = 0_u64;
    let mut out = vec![0_u8; sec_size];
    for lba in 0..spec.nr_secs {
        ftl.read(Lba(lba), &mut out).context("read back")?;
        let expect = expected_byte(&spec, lba);
        if out.iter().any(|b| *b != expect) {
            bail!(
                "verification failed at lba {lba}: expected {expect:#04x}, got {:#04x}",
                out[0]
            );
        }
        verified += 1;
    }

    let metrics = ftl.metrics();
    ftl.shutdown().context("shutdown")?;

    Ok(WorkloadReport {
        spec,
        written_secs: spec.nr_secs,
        overwritten_secs: overwritten,
        discarded_secs: discarded,
        verified_secs: verified,
        flushes,
        wall_ms: start.elapsed().as_millis(),
        metrics,
    })
}

/// The byte every sector of `lba` must hold after the workload.
#[must_use]
pub fn expected_byte(spec: &WorkloadSpec, lba: u64) -> u8 {
    if spec.discard_stride != 0 && lba % spec.discard_stride == 0 {
        return 0;
    }
    if spec.overwrite_stride != 0 && lba % spec.overwrite_stride == 0 {
        return second_pattern(lba);
    }
    first_pattern(lba)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_byte_priority() {
        let spec = WorkloadSpec {
            nr_secs: 100,
            flush_every: 0,
            overwrite_stride: 5,
            discard_stride: 10,
        };
        // Discard wins over overwrite.
        assert_eq!(expected_byte(&spec, 10), 0);
        assert_eq!(expected_byte(&spec, 5), second_pattern(5));
        assert_eq!(expected_byte(&spec, 7), first_pattern(7));
    }

    #[test]
    fn small_workload_verifies() {
        let report = run_workload(
            default_geometry(),
            FtlConfig::default(),
            WorkloadSpec {
                nr_secs: 64,
                flush_every: 9,
                overwrite_stride: 4,
                discard_stride: 11,
            },
        )
        .expect("workload");
        assert_eq!(report.verified_secs, 64);
        assert!(report.metrics.buffered_writes >= 64);
    }
}
