//! System V shared-memory segments keyed off the rendezvous file.
//!
//! Each store owns two segments derived from one rendezvous file: the
//! *index* segment (project id `'i'`) holding the header and entry
//! table, and the *data* segment (project id `'d'`) holding packed
//! values. Keys come from `ftok(3)` over the rendezvous file's inode,
//! so every process naming the same file attaches the same memory.
//!
//! Segments expose byte-granular reads and writes and do not serialize
//! concurrent callers — layout mutations are fenced by the rendezvous
//! lock in [`crate::lock`].

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::NonNull;

use nix::errno::Errno;
use tracing::debug;

use crate::consts::{
    GROWTH_FACTOR, INDEX_ENTRY_LEN, INDEX_HEADER_LEN, PAGE_SIZE, PROJECT_DATA, PROJECT_INDEX,
    SHARED_MEMORY_MODE, VALUE_LEN,
};
use crate::error::{StoreError, StoreResult};

/// Derive the `ftok(3)` key for a rendezvous file and project byte.
///
/// The rendezvous file must exist: `ftok` hashes its inode.
fn segment_key(key_file: &Path, project: u8) -> StoreResult<libc::key_t> {
    let path = CString::new(key_file.as_os_str().as_bytes()).map_err(|_| {
        StoreError::SegmentUnavailable {
            key_file: key_file.display().to_string(),
            project: project as char,
            errno: Errno::EINVAL,
        }
    })?;
    let key = unsafe { libc::ftok(path.as_ptr(), project as libc::c_int) };
    if key == -1 {
        return Err(StoreError::SegmentUnavailable {
            key_file: key_file.display().to_string(),
            project: project as char,
            errno: Errno::last(),
        });
    }
    Ok(key)
}

/// One attached System V shared-memory segment.
pub struct SysvSegment {
    shmid: libc::c_int,
    base: NonNull<u8>,
    size: usize,
    read_only: bool,
    key_file: String,
    project: u8,
}

// SAFETY: the base pointer refers to a shared mapping that outlives the
// attachment; all accesses are bounds-checked against the attached size
// and cross-process consistency is the caller's protocol (rendezvous
// lock for layout, append-only entries for scans).
unsafe impl Send for SysvSegment {}

impl SysvSegment {
    /// Open the segment for `(key_file, project)`, creating it with
    /// `pages * PAGE_SIZE` bytes and mode 0644 when absent.
    ///
    /// In read-only mode creation is forbidden: a missing segment is an
    /// error, and the attachment is `SHM_RDONLY`.
    pub fn open_or_create(
        key_file: &Path,
        project: u8,
        pages: usize,
        read_only: bool,
    ) -> StoreResult<Self> {
        let unavailable = |errno: Errno| StoreError::SegmentUnavailable {
            key_file: key_file.display().to_string(),
            project: project as char,
            errno,
        };

        let key = segment_key(key_file, project)?;
        let mode = SHARED_MEMORY_MODE as libc::c_int;

        // Open an existing segment first; size 0 matches any.
        let mut shmid = unsafe { libc::shmget(key, 0, mode) };
        if shmid == -1 {
            let errno = Errno::last();
            if errno != Errno::ENOENT || read_only {
                return Err(unavailable(errno));
            }
            let bytes = pages * PAGE_SIZE;
            shmid =
                unsafe { libc::shmget(key, bytes, libc::IPC_CREAT | libc::IPC_EXCL | mode) };
            if shmid == -1 {
                let errno = Errno::last();
                if errno == Errno::EEXIST {
                    // Lost the creation race; attach the winner's segment.
                    shmid = unsafe { libc::shmget(key, 0, mode) };
                    if shmid == -1 {
                        return Err(unavailable(Errno::last()));
                    }
                } else {
                    return Err(unavailable(errno));
                }
            } else {
                let project_id = project as char;
                debug!(
                    key_file = %key_file.display(),
                    project = %project_id,
                    bytes,
                    "created shared-memory segment"
                );
            }
        }

        let flags = if read_only { libc::SHM_RDONLY } else { 0 };
        let addr = unsafe { libc::shmat(shmid, std::ptr::null(), flags) };
        if addr as isize == -1 {
            return Err(unavailable(Errno::last()));
        }
        let base = NonNull::new(addr as *mut u8).ok_or_else(|| unavailable(Errno::EINVAL))?;

        // The attached segment may predate this process with a different
        // size; always report the real size from the kernel.
        let mut ds = std::mem::MaybeUninit::<libc::shmid_ds>::zeroed();
        let rc = unsafe { libc::shmctl(shmid, libc::IPC_STAT, ds.as_mut_ptr()) };
        if rc == -1 {
            let errno = Errno::last();
            unsafe { libc::shmdt(base.as_ptr() as *const libc::c_void) };
            return Err(unavailable(errno));
        }
        let size = unsafe { ds.assume_init() }.shm_segsz as usize;

        Ok(Self {
            shmid,
            base,
            size,
            read_only,
            key_file: key_file.display().to_string(),
            project,
        })
    }

    /// Segment size in bytes, as reported by the kernel.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy `buf.len()` bytes at `offset` into `buf`.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> StoreResult<()> {
        self.check_bounds(offset, buf.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.as_ptr().add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Write `bytes` at `offset`.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        self.check_bounds(offset, bytes.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base.as_ptr().add(offset),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Remove the segment from the system. Idempotent: a segment someone
    /// else already removed is not an error. The local attachment stays
    /// valid until drop.
    pub fn remove(&mut self) -> StoreResult<()> {
        let rc = unsafe { libc::shmctl(self.shmid, libc::IPC_RMID, std::ptr::null_mut()) };
        if rc == -1 {
            let errno = Errno::last();
            if errno != Errno::EINVAL && errno != Errno::EIDRM {
                return Err(StoreError::SegmentUnavailable {
                    key_file: self.key_file.clone(),
                    project: self.project as char,
                    errno,
                });
            }
        }
        Ok(())
    }

    fn check_bounds(&self, offset: usize, len: usize) -> StoreResult<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(StoreError::OutOfBounds {
                offset,
                len,
                size: self.size,
            });
        }
        Ok(())
    }
}

impl Drop for SysvSegment {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.base.as_ptr() as *const libc::c_void);
        }
    }
}

impl std::fmt::Debug for SysvSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysvSegment")
            .field("key_file", &self.key_file)
            .field("project", &(self.project as char))
            .field("shmid", &self.shmid)
            .field("size", &self.size)
            .field("read_only", &self.read_only)
            .finish()
    }
}

/// The index/data segment pair behind one rendezvous file.
#[derive(Debug)]
pub struct SegmentPair {
    /// Header plus entry table.
    pub index: SysvSegment,
    /// Packed metric values.
    pub data: SysvSegment,
}

impl SegmentPair {
    /// Open or create both segments, sized for `physical_count` metrics
    /// with the growth headroom factor applied.
    pub fn open_or_create(
        key_file: &Path,
        physical_count: usize,
        read_only: bool,
    ) -> StoreResult<Self> {
        let index_pages =
            pages_for(INDEX_HEADER_LEN + GROWTH_FACTOR * physical_count * INDEX_ENTRY_LEN);
        let data_pages = pages_for(GROWTH_FACTOR * VALUE_LEN * physical_count);

        let index = SysvSegment::open_or_create(key_file, PROJECT_INDEX, index_pages, read_only)?;
        let data = SysvSegment::open_or_create(key_file, PROJECT_DATA, data_pages, read_only)?;
        Ok(Self { index, data })
    }

    /// Remove both segments from the system. Idempotent.
    pub fn remove(&mut self) -> StoreResult<()> {
        self.index.remove()?;
        self.data.remove()
    }
}

/// Whole pages covering `bytes`, at least one.
fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE).max(1)
}
