//! Error types for the metrics store.

use thiserror::Error;

/// Errors that can occur while operating the store.
///
/// Every failure is logged where it happens; the facade in
/// [`crate::logger`] converts these into its sentinel surface so no
/// error type escapes to application hot paths.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A metric configuration was rejected during validation.
    #[error("metric config '{name}' rejected: {reason}")]
    ConfigInvalid {
        /// Offending config name ("?" when the name itself is the problem).
        name: String,
        /// Human-readable rejection reason.
        reason: String,
    },

    /// A shared-memory segment could not be opened or created.
    #[error("shared memory unavailable for '{key_file}' (project '{project}'): {errno}")]
    SegmentUnavailable {
        /// Rendezvous file the segment is keyed to.
        key_file: String,
        /// Project id (`'i'` or `'d'`).
        project: char,
        /// Underlying errno.
        errno: nix::errno::Errno,
    },

    /// The entry table has no room for another 16-byte entry.
    #[error("index segment full ({size} bytes): cannot register another metric")]
    IndexFull {
        /// Index segment size in bytes.
        size: usize,
    },

    /// The data segment has no room for another value slot.
    #[error("data segment full ({size} bytes): cannot allocate value slot")]
    DataFull {
        /// Data segment size in bytes.
        size: usize,
    },

    /// The rendezvous-file lock could not be acquired within the wait bound.
    #[error("could not lock '{key_file}' within {waited_ms} ms")]
    LockTimeout {
        /// Lock target path.
        key_file: String,
        /// Total time spent waiting.
        waited_ms: u64,
    },

    /// The stored layout version is newer than the one requested.
    #[error("stored layout version {stored} is newer than requested {requested}")]
    VersionConflict {
        /// Version found in the header.
        stored: u32,
        /// Version this process was configured with.
        requested: u32,
    },

    /// The header has not been initialized by any writer yet.
    #[error("index header not initialized for '{key_file}'")]
    Uninitialized {
        /// Rendezvous file the segment is keyed to.
        key_file: String,
    },

    /// A byte range fell outside the segment.
    #[error("range of {len} bytes at offset {offset} exceeds segment bounds ({size} bytes)")]
    OutOfBounds {
        /// Start offset of the attempted access.
        offset: usize,
        /// Length of the attempted access.
        len: usize,
        /// Segment size.
        size: usize,
    },

    /// A value failed range or type checks and was rewritten to zero.
    #[error("value for '{metric}' out of range: {reason}")]
    RangeOrTypeViolation {
        /// Metric whose value was rewritten.
        metric: String,
        /// Which check failed.
        reason: String,
    },

    /// Write attempted through a read-only store.
    #[error("store is read-only")]
    ReadOnly,

    /// A packed record or scalar did not match its format.
    #[error("codec mismatch: {reason}")]
    CodecMismatch {
        /// What did not line up.
        reason: String,
    },

    /// OS-level error from nix/libc calls.
    #[error("OS error: {0}")]
    Os(#[from] nix::errno::Errno),

    /// IO error (rendezvous file handling).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let e = StoreError::SegmentUnavailable {
            key_file: "/var/tmp/app.metrics".to_string(),
            project: 'i',
            errno: nix::errno::Errno::ENOENT,
        };
        let msg = e.to_string();
        assert!(msg.contains("/var/tmp/app.metrics"));
        assert!(msg.contains("'i'"));

        let e = StoreError::LockTimeout {
            key_file: "k".to_string(),
            waited_ms: 100,
        };
        assert!(e.to_string().contains("100 ms"));

        let e = StoreError::OutOfBounds {
            offset: 4090,
            len: 16,
            size: 4096,
        };
        assert!(e.to_string().contains("4090"));
    }
}
