//! Advisory locking against the rendezvous file.
//!
//! Every layout mutation (header initialization, version upgrade, entry
//! append) runs under the exclusive lock; index scans run under the
//! shared lock. Value reads and writes take no lock at all — slots are
//! immutable in position once published, so the hot path stays
//! lock-free.
//!
//! Acquisition is a bounded non-blocking loop: try `flock(2)`, and on
//! contention sleep a uniform random 0–10 ms before retrying, failing
//! once the cumulative wait exceeds the timeout. The random backoff
//! de-synchronizes producers that start registering at the same instant.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use rand::Rng;
use tracing::trace;

use crate::consts::{LOCK_BACKOFF_MAX_MS, LOCK_WAIT_TIMEOUT};
use crate::error::{StoreError, StoreResult};

/// Which advisory lock to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Shared lock — index scans.
    Shared,
    /// Exclusive lock — layout mutations.
    Exclusive,
}

/// Held advisory lock; released on drop on every path.
pub struct LockGuard {
    _flock: Flock<File>,
}

/// Lock acquisition against one rendezvous file.
#[derive(Debug, Clone)]
pub struct KeyfileLock {
    path: PathBuf,
    timeout: Duration,
}

impl KeyfileLock {
    /// Lock handle for `path` with the default wait bound.
    pub fn new(path: &Path) -> Self {
        Self::with_timeout(path, LOCK_WAIT_TIMEOUT)
    }

    /// Lock handle with an explicit wait bound (tests use short ones).
    pub fn with_timeout(path: &Path, timeout: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            timeout,
        }
    }

    /// Acquire `kind` within the wait bound.
    ///
    /// Each attempt is non-blocking; contention backs off for a random
    /// 0–10 ms. Fails with [`StoreError::LockTimeout`] once the
    /// cumulative wall-clock wait exceeds the bound.
    pub fn acquire(&self, kind: LockKind) -> StoreResult<LockGuard> {
        let arg = match kind {
            LockKind::Shared => FlockArg::LockSharedNonblock,
            LockKind::Exclusive => FlockArg::LockExclusiveNonblock,
        };

        let started = Instant::now();
        let mut file = File::open(&self.path)?;
        loop {
            match Flock::lock(file, arg) {
                Ok(flock) => {
                    trace!(path = %self.path.display(), ?kind, "rendezvous lock acquired");
                    return Ok(LockGuard { _flock: flock });
                }
                Err((returned, Errno::EWOULDBLOCK)) => {
                    if started.elapsed() >= self.timeout {
                        return Err(StoreError::LockTimeout {
                            key_file: self.path.display().to_string(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    file = returned;
                    let backoff = rand::rng().random_range(0..=LOCK_BACKOFF_MAX_MS);
                    std::thread::sleep(Duration::from_millis(backoff));
                }
                Err((_, errno)) => return Err(StoreError::Os(errno)),
            }
        }
    }
}
