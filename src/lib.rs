//! # Shared-Memory Application Metrics for PCP
//!
//! An interprocess metrics store backed by System V shared memory.
//! Producer processes record monotonic counters and histogram-style
//! timers; consumer processes — typically a Performance Co-Pilot PMDA,
//! but any same-endian reader works — poll the same segments and map
//! every value to a PCP identifier triple {cluster, item, instance}.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌───────────────────────┐     ┌──────────────┐
//! │  Producer A  │     │  /var/tmp/app.metrics │     │   Consumer   │
//! │              │     │   (rendezvous file)   │     │   (PMDA)     │
//! │ MetricsLogger├──┐  │  inode ──ftok──► keys │  ┌──┤              │
//! └──────────────┘  │  │  flock: shared/excl   │  │  └──────────────┘
//! ┌──────────────┐  │  └───────────────────────┘  │
//! │  Producer B  │  │  ┌───────────────────────┐  │
//! │              │  ├─►│ index segment ('i')   │◄─┤
//! │ MetricsLogger├──┘  │ [header][entries...]  │  │
//! └──────────────┘     ├───────────────────────┤  │
//!                      │ data segment  ('d')   │◄─┘
//!                      │ [packed u32 slots]    │
//!                      └───────────────────────┘
//! ```
//!
//! Two segments hang off one rendezvous file: the *index* segment
//! (12-byte header plus packed 16-byte entries) describes where each
//! metric lives, and the *data* segment holds the packed values. Any
//! process keyed to the same file attaches the same memory.
//!
//! ## Coordination
//!
//! - **Registration** (first touch of a metric) is serialized by an
//!   exclusive `flock` on the rendezvous file: scan, append entry,
//!   advance cursors. Entries below a published cursor never change.
//! - **Value reads and writes** are lock-free single-slot copies; a
//!   `get`/`set` pair on one metric is sequentially consistent within a
//!   process. Cross-process `increment` is read-modify-write and can
//!   lose updates under contention — an accepted trade for a lock-free
//!   hot path.
//! - **Lock waits** are bounded (100 ms) with 0–10 ms randomized
//!   backoff per retry; a timeout abandons the operation, never leaving
//!   a partial layout mutation behind.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shm_metrics::{MetricConfig, MetricsLogger, StoreOptions};
//!
//! let mut options = StoreOptions::new("soapxml");
//! options.version = 100;
//! options.metrics = vec![
//!     MetricConfig::counter("requests", 0, 0),
//!     MetricConfig::timer("render", 0, 10),
//! ];
//!
//! let mut metrics = MetricsLogger::new(options);
//! metrics.increment("requests");
//! metrics.timing("render", 2_000.0);
//!
//! assert_eq!(metrics.get("requests"), Some(1));
//! assert_eq!(metrics.get("render.time_taken_1"), Some(1));
//! ```
//!
//! ## Error Handling
//!
//! The facade never panics and never surfaces an error type: failures
//! are logged via [`tracing`] and reported as `None`/`false`. A failed
//! initialization latches the handle into a sink. The typed error enum
//! ([`StoreError`]) is available to code driving the lower layers
//! directly.
//!
//! ## Caveats
//!
//! - Producer and consumer must run on same-endian hosts; all packed
//!   values use host-native byte order.
//! - Segments survive process exit (that is the point) but not reboot.
//!   `delete_shared_memory` is the only cleanup path.
//! - Protection is filesystem permissions on the rendezvous file plus
//!   segment mode bits (0644); there is no authentication.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod config;
pub mod consts;
pub mod error;
pub mod index;
pub mod lock;
pub mod logger;
pub mod registry;
pub mod segment;

pub use codec::{FormatCache, RecordFormat, TypeCode};
pub use config::{AccessMode, MetricConfig, MetricKind, StoreOptions};
pub use error::{StoreError, StoreResult};
pub use index::{IndexEntry, IndexHeader, MetricIndex, Slot};
pub use lock::{KeyfileLock, LockGuard, LockKind};
pub use logger::MetricsLogger;
pub use registry::{MetricsRegistry, PhysicalMetric, TIMING_FIELDS};
pub use segment::{SegmentPair, SysvSegment};

/// Initialize tracing with an environment-driven filter.
///
/// Convenience for binaries and tests; libraries embedding the store
/// should install their own subscriber instead.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
