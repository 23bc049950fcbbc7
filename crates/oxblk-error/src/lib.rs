#![forbid(unsafe_code)]
//! Error types for oxblk.
//!
//! Defines `FtlError` and a `Result<T>` alias used throughout the workspace.
//! The backpressure variants (`Requeue`, `Busy`) are part of the submission
//! contract: callers retry them, they are not failures.

use thiserror::Error;

/// Unified error type for all oxblk operations.
#[derive(Debug, Error)]
pub enum FtlError {
    /// The write buffer (or a LUN in emergency-GC mode) cannot accept the
    /// request right now. The caller owns the retry.
    #[error("write buffer backpressure, requeue")]
    Requeue,

    /// A mapping update collided with an in-flight cache read. Retried
    /// internally with a yield; surfaces only on bounded-retry exhaustion.
    #[error("mapping contended by in-flight read")]
    Busy,

    #[error("no free blocks available on lun {lun}")]
    NoSpace { lun: u32 },

    #[error("invalid geometry: {0}")]
    Geometry(String),

    #[error("media error: {0}")]
    Media(String),

    #[error("device read failed on {failed} of {total} sectors")]
    ReadFailed { failed: u32, total: u32 },

    #[error("recovery page corrupt: {0}")]
    MetaCorrupt(String),

    #[error("request too large: {got} sectors (max {max})")]
    TooLarge { got: usize, max: usize },

    #[error("request malformed: {0}")]
    Malformed(String),

    #[error("target is shut down")]
    Shutdown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias using `FtlError`.
pub type Result<T> = std::result::Result<T, FtlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        assert_eq!(
            FtlError::NoSpace { lun: 3 }.to_string(),
            "no free blocks available on lun 3"
        );
        assert_eq!(
            FtlError::TooLarge { got: 65, max: 64 }.to_string(),
            "request too large: 65 sectors (max 64)"
        );
    }
}
