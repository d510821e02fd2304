//! Header and entry-table management for the index segment.
//!
//! The index segment starts with a 12-byte header — layout `version`,
//! `next_index_offset`, `next_data_offset` as native-endian u32s —
//! followed by packed 16-byte entries describing where each metric's
//! bytes live in the data segment. Entries are append-only: bytes below
//! a sampled `next_index_offset` never change, which is what lets value
//! reads and writes skip the rendezvous lock entirely.
//!
//! The append protocol publishes in a fixed order under the exclusive
//! lock: zero the value slot, write the entry, then advance the two
//! cursors. A failure at any step leaves the cursors untouched, so
//! readers can never observe a half-registered metric.

use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::{FormatCache, RecordFormat, TypeCode};
use crate::consts::{CURSOR_OFFSET, INDEX_ENTRY_LEN, INDEX_HEADER_LEN};
use crate::error::{StoreError, StoreResult};
use crate::lock::{KeyfileLock, LockKind};
use crate::segment::SegmentPair;

/// Decoded index-segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    /// Layout version; zero means "never initialized".
    pub version: u32,
    /// Byte offset just past the last written entry.
    pub next_index_offset: u32,
    /// Byte offset just past the last allocated data byte.
    pub next_data_offset: u32,
}

/// Decoded index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Reserved; always zero today.
    pub flags: u8,
    /// Packing code of the value slot.
    pub code: TypeCode,
    /// Slot length in bytes.
    pub length: u16,
    /// Slot offset in the data segment.
    pub offset: u32,
    /// PCP cluster id.
    pub cluster: u16,
    /// PCP item id.
    pub item: u16,
    /// PCP instance id (-1 = no instance domain).
    pub instance: i32,
}

impl IndexEntry {
    /// The slot this entry describes.
    pub fn slot(&self) -> Slot {
        Slot {
            offset: self.offset,
            length: self.length,
            code: self.code,
        }
    }
}

/// Where one metric's bytes live; what the facade caches per name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Byte offset in the data segment.
    pub offset: u32,
    /// Slot length in bytes.
    pub length: u16,
    /// Packing code.
    pub code: TypeCode,
}

/// The dual-segment store behind one rendezvous file.
pub struct MetricIndex {
    key_file: PathBuf,
    lock: KeyfileLock,
    segments: SegmentPair,
    header_format: Arc<RecordFormat>,
    entry_format: Arc<RecordFormat>,
    read_only: bool,
}

impl MetricIndex {
    /// Open the store behind `key_file`, creating and initializing as
    /// permitted by `read_only`.
    ///
    /// Writable opens create the rendezvous file and both segments on
    /// demand (sized for `physical_count` metrics) and stamp a zero
    /// header with `version`. A stored version older than `version` is
    /// upgraded in place; a newer one degrades this handle to a reader.
    pub fn open(
        key_file: &Path,
        physical_count: usize,
        version: u32,
        read_only: bool,
        formats: &mut FormatCache,
    ) -> StoreResult<Self> {
        if !read_only {
            // Zero-length create; an existing file is left untouched.
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(key_file)?;
        }

        let segments = SegmentPair::open_or_create(key_file, physical_count, read_only)?;
        let header_format = formats.get_or_build("index_header", || {
            RecordFormat::new([
                ("version", TypeCode::U32),
                ("next_index_offset", TypeCode::U32),
                ("next_data_offset", TypeCode::U32),
            ])
        });
        let entry_format = formats.get_or_build("index_entry", || {
            RecordFormat::new([
                ("flags", TypeCode::U8),
                ("type", TypeCode::U8),
                ("length", TypeCode::U16),
                ("offset", TypeCode::U32),
                ("cluster", TypeCode::U16),
                ("item", TypeCode::U16),
                ("instance", TypeCode::I32),
            ])
        });

        let mut index = Self {
            key_file: key_file.to_path_buf(),
            lock: KeyfileLock::new(key_file),
            segments,
            header_format,
            entry_format,
            read_only,
        };
        index.initialize(version)?;
        Ok(index)
    }

    /// Versioned initialization: stamp a fresh header, upgrade an old
    /// version, or degrade to reader on a newer one.
    fn initialize(&mut self, version: u32) -> StoreResult<()> {
        // Zero marks "never initialized" on the wire, so it can never
        // be a valid configured version.
        let version = version.max(1);
        let stored = self.header()?.version;

        if stored == 0 {
            if self.read_only {
                return Err(StoreError::Uninitialized {
                    key_file: self.key_file.display().to_string(),
                });
            }
            let _guard = self.lock.acquire(LockKind::Exclusive)?;
            // Double-checked: another producer may have won the race
            // between the unlocked read and the lock.
            if self.header()?.version == 0 {
                let bytes = self.header_format.pack(&[
                    version as i64,
                    INDEX_HEADER_LEN as i64,
                    0,
                ])?;
                self.segments.index.write_at(0, &bytes)?;
                debug!(
                    key_file = %self.key_file.display(),
                    version,
                    "initialized index header"
                );
                return Ok(());
            }
        }

        let stored = self.header()?.version;
        if stored < version {
            if self.read_only {
                return Ok(());
            }
            let _guard = self.lock.acquire(LockKind::Exclusive)?;
            let current = self.header()?.version;
            if current < version {
                // Upgrade rewrites the version field only; the cursors
                // and every published entry stay valid.
                let mut buf = [0u8; 4];
                crate::codec::pack_scalar(TypeCode::U32, version as i64, &mut buf)?;
                self.segments.index.write_at(0, &buf)?;
                debug!(
                    key_file = %self.key_file.display(),
                    from = current,
                    to = version,
                    "upgraded index header version"
                );
            }
        } else if stored > version {
            let conflict = StoreError::VersionConflict {
                stored,
                requested: version,
            };
            warn!(
                key_file = %self.key_file.display(),
                error = %conflict,
                "continuing as reader"
            );
            self.read_only = true;
        }
        Ok(())
    }

    /// Read the header. Lock-free: the version is written once and the
    /// cursors only ever grow, so a stale read is safe for scanning.
    pub fn header(&self) -> StoreResult<IndexHeader> {
        let mut bytes = [0u8; INDEX_HEADER_LEN];
        self.segments.index.read_at(0, &mut bytes)?;
        let values = self.header_format.unpack(&bytes)?;
        Ok(IndexHeader {
            version: values[0] as u32,
            next_index_offset: values[1] as u32,
            next_data_offset: values[2] as u32,
        })
    }

    /// Look up a slot by identifier triple under the shared lock.
    pub fn find(&self, cluster: u16, item: u16, instance: i32) -> StoreResult<Option<Slot>> {
        let _guard = self.lock.acquire(LockKind::Shared)?;
        self.scan(cluster, item, instance)
    }

    /// Decode every published entry, in insertion order.
    pub fn entries(&self) -> StoreResult<Vec<IndexEntry>> {
        let _guard = self.lock.acquire(LockKind::Shared)?;
        let header = self.header()?;
        let mut entries = Vec::new();
        let mut pos = INDEX_HEADER_LEN;
        while pos + INDEX_ENTRY_LEN <= header.next_index_offset as usize {
            entries.push(self.entry_at(pos)?);
            pos += INDEX_ENTRY_LEN;
        }
        Ok(entries)
    }

    /// Register a new metric, returning its slot.
    ///
    /// Idempotent under races: if another process appended the same
    /// triple between our miss and the exclusive lock, its slot is
    /// returned instead of a duplicate.
    pub fn append(
        &mut self,
        cluster: u16,
        item: u16,
        instance: i32,
        code: TypeCode,
    ) -> StoreResult<Slot> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let _guard = self.lock.acquire(LockKind::Exclusive)?;

        if let Some(slot) = self.scan(cluster, item, instance)? {
            return Ok(slot);
        }

        let header = self.header()?;
        if header.version == 0 {
            return Err(StoreError::Uninitialized {
                key_file: self.key_file.display().to_string(),
            });
        }

        let entry_pos = header.next_index_offset as usize;
        if entry_pos + INDEX_ENTRY_LEN > self.segments.index.size() {
            return Err(StoreError::IndexFull {
                size: self.segments.index.size(),
            });
        }

        let width = code.width();
        let value_offset = header.next_data_offset as usize;
        if value_offset + width > self.segments.data.size() {
            return Err(StoreError::DataFull {
                size: self.segments.data.size(),
            });
        }

        // Zero the slot before anything references it; a failure here
        // leaves both cursors un-advanced.
        self.segments.data.write_at(value_offset, &[0u8; 4][..width])?;

        let entry = self.entry_format.pack(&[
            0,
            code.code() as i64,
            width as i64,
            value_offset as i64,
            cluster as i64,
            item as i64,
            instance as i64,
        ])?;
        self.segments.index.write_at(entry_pos, &entry)?;

        // Entry bytes must be visible before the cursor announces them.
        fence(Ordering::Release);
        self.write_cursors(
            (entry_pos + INDEX_ENTRY_LEN) as u32,
            (value_offset + width) as u32,
        )?;

        debug!(
            cluster,
            item,
            instance,
            offset = value_offset,
            "registered metric slot"
        );
        Ok(Slot {
            offset: value_offset as u32,
            length: width as u16,
            code,
        })
    }

    /// Read the current value of a slot. Lock-free.
    pub fn read_value(&self, slot: &Slot) -> StoreResult<i64> {
        let mut bytes = [0u8; 4];
        let buf = &mut bytes[..slot.length as usize];
        self.segments.data.read_at(slot.offset as usize, buf)?;
        crate::codec::unpack_scalar(slot.code, buf)
    }

    /// Write a validated value into a slot. Lock-free.
    pub fn write_value(&mut self, slot: &Slot, value: i64) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let mut bytes = [0u8; 4];
        let buf = &mut bytes[..slot.length as usize];
        crate::codec::pack_scalar(slot.code, value, buf)?;
        self.segments.data.write_at(slot.offset as usize, buf)
    }

    /// Remove both segments and optionally the rendezvous file.
    /// Idempotent.
    pub fn delete(&mut self, drop_key_file: bool) -> StoreResult<()> {
        self.segments.remove()?;
        if drop_key_file {
            match std::fs::remove_file(&self.key_file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Whether this handle can mutate (may have been degraded at open).
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// The rendezvous file this store is keyed to.
    pub fn key_file(&self) -> &Path {
        &self.key_file
    }

    /// Linear scan of the published entry table. Callers hold a lock.
    fn scan(&self, cluster: u16, item: u16, instance: i32) -> StoreResult<Option<Slot>> {
        let header = self.header()?;
        let mut pos = INDEX_HEADER_LEN;
        while pos + INDEX_ENTRY_LEN <= header.next_index_offset as usize {
            let entry = self.entry_at(pos)?;
            if entry.cluster == cluster && entry.item == item && entry.instance == instance {
                return Ok(Some(entry.slot()));
            }
            pos += INDEX_ENTRY_LEN;
        }
        Ok(None)
    }

    fn entry_at(&self, pos: usize) -> StoreResult<IndexEntry> {
        let mut bytes = [0u8; INDEX_ENTRY_LEN];
        self.segments.index.read_at(pos, &mut bytes)?;
        let values = self.entry_format.unpack(&bytes)?;
        let code = TypeCode::from_code(values[1] as u8).ok_or_else(|| {
            StoreError::CodecMismatch {
                reason: format!("unknown type code {:#x} in entry at {pos}", values[1]),
            }
        })?;
        Ok(IndexEntry {
            flags: values[0] as u8,
            code,
            length: values[2] as u16,
            offset: values[3] as u32,
            cluster: values[4] as u16,
            item: values[5] as u16,
            instance: values[6] as i32,
        })
    }

    fn write_cursors(&mut self, next_index_offset: u32, next_data_offset: u32) -> StoreResult<()> {
        let mut buf = [0u8; 8];
        crate::codec::pack_scalar(TypeCode::U32, next_index_offset as i64, &mut buf[..4])?;
        crate::codec::pack_scalar(TypeCode::U32, next_data_offset as i64, &mut buf[4..])?;
        self.segments.index.write_at(CURSOR_OFFSET, &buf)
    }
}

impl std::fmt::Debug for MetricIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricIndex")
            .field("key_file", &self.key_file)
            .field("read_only", &self.read_only)
            .finish()
    }
}
