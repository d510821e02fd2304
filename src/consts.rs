//! Store-wide constants.
//!
//! These constants define the binary contract shared with out-of-process
//! consumers (PMDAs and other C readers). They are the single source of
//! truth — every module imports from here.

use std::time::Duration;

use static_assertions::const_assert_eq;

/// Shared-memory page size; segments are sized in whole pages.
pub const PAGE_SIZE: usize = 4096;

/// Permission bits for newly created segments.
///
/// World-readable so consumer processes running under another uid can
/// attach; writable only by the owner.
pub const SHARED_MEMORY_MODE: u32 = 0o644;

/// Upper bound on waiting for the rendezvous-file lock.
pub const LOCK_WAIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Maximum single backoff sleep between lock attempts, in milliseconds.
/// Each retry sleeps a uniform random duration in `0..=LOCK_BACKOFF_MAX_MS`.
pub const LOCK_BACKOFF_MAX_MS: u64 = 10;

/// PCP instance id meaning "no instance domain".
pub const INSTANCE_DOMAIN_NULL: i32 = -1;

/// Project byte fed to `ftok(3)` for the index segment key.
pub const PROJECT_INDEX: u8 = b'i';

/// Project byte fed to `ftok(3)` for the data segment key.
pub const PROJECT_DATA: u8 = b'd';

/// Default directory for rendezvous files.
pub const KEY_FILE_DIR: &str = "/var/tmp/";

/// Size of the index-segment header: `version`, `next_index_offset`,
/// `next_data_offset`, each a native-endian u32.
pub const INDEX_HEADER_LEN: usize = 12;

/// Byte offset of the two append cursors within the header (just past
/// the version field).
pub const CURSOR_OFFSET: usize = 4;

/// Size of one packed index entry.
pub const INDEX_ENTRY_LEN: usize = 16;

/// Width of a value slot in the data segment (u32 counter).
pub const VALUE_LEN: usize = 4;

/// Headroom multiplier applied when sizing fresh segments, so other
/// producers can register their own metrics later without growing.
pub const GROWTH_FACTOR: usize = 4;

// The on-wire contract: 3 packed u32s, then 16-byte entries with no padding.
const_assert_eq!(INDEX_HEADER_LEN, 3 * 4);
const_assert_eq!(INDEX_ENTRY_LEN, 1 + 1 + 2 + 4 + 2 + 2 + 4);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_table_starts_on_entry_boundary() {
        // Entries are appended at 12, 28, 44, ... — the header is not a
        // multiple of the entry size, which is fine because the scan
        // starts at INDEX_HEADER_LEN, not 0.
        assert_eq!(INDEX_HEADER_LEN % VALUE_LEN, 0);
        assert_eq!(INDEX_ENTRY_LEN % VALUE_LEN, 0);
    }

    #[test]
    fn one_page_holds_a_useful_entry_count() {
        let capacity = (PAGE_SIZE - INDEX_HEADER_LEN) / INDEX_ENTRY_LEN;
        assert_eq!(capacity, 255);
    }
}
