//! Packing codec for the segment wire format.
//!
//! Maps an ordered record of (field name → scalar type code) onto a
//! fixed-width byte layout with no alignment padding, and converts
//! values to and from those bytes in host-native byte order. Producer
//! and consumer must therefore run on same-endian hosts; C readers use
//! the matching `struct` layout.
//!
//! The codec never clamps: out-of-range values are truncated to the
//! field width exactly as a C assignment would. Range discipline lives
//! with the caller (see [`crate::logger`]).

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{StoreError, StoreResult};

// ─── Type codes ─────────────────────────────────────────────────────

/// Scalar type code for one packed field.
///
/// The single-character code is what lands in the `type` byte of an
/// index entry, so consumers can decode slots without out-of-band
/// schema knowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCode {
    /// `c`: signed 8-bit.
    I8,
    /// `C`: unsigned 8-bit.
    U8,
    /// `s`: signed 16-bit.
    I16,
    /// `S`: unsigned 16-bit.
    U16,
    /// `l`: signed 32-bit.
    I32,
    /// `L`: unsigned 32-bit.
    U32,
}

impl TypeCode {
    /// Decode a type-code byte (e.g. from an index entry).
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            b'c' => Some(Self::I8),
            b'C' => Some(Self::U8),
            b's' => Some(Self::I16),
            b'S' => Some(Self::U16),
            b'l' => Some(Self::I32),
            b'L' => Some(Self::U32),
            _ => None,
        }
    }

    /// The code byte stored on the wire.
    pub const fn code(self) -> u8 {
        match self {
            Self::I8 => b'c',
            Self::U8 => b'C',
            Self::I16 => b's',
            Self::U16 => b'S',
            Self::I32 => b'l',
            Self::U32 => b'L',
        }
    }

    /// Packed width in bytes.
    pub const fn width(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 => 4,
        }
    }
}

// ─── Scalar packing ─────────────────────────────────────────────────

/// Pack one scalar into `out`, which must be exactly `code.width()` long.
///
/// Values wider than the field are truncated, matching C assignment
/// semantics; callers validate range beforehand.
pub fn pack_scalar(code: TypeCode, value: i64, out: &mut [u8]) -> StoreResult<()> {
    if out.len() != code.width() {
        return Err(StoreError::CodecMismatch {
            reason: format!(
                "scalar '{}' needs {} bytes, got {}",
                code.code() as char,
                code.width(),
                out.len()
            ),
        });
    }
    match code {
        TypeCode::I8 => out.copy_from_slice(&(value as i8).to_ne_bytes()),
        TypeCode::U8 => out.copy_from_slice(&(value as u8).to_ne_bytes()),
        TypeCode::I16 => out.copy_from_slice(&(value as i16).to_ne_bytes()),
        TypeCode::U16 => out.copy_from_slice(&(value as u16).to_ne_bytes()),
        TypeCode::I32 => out.copy_from_slice(&(value as i32).to_ne_bytes()),
        TypeCode::U32 => out.copy_from_slice(&(value as u32).to_ne_bytes()),
    }
    Ok(())
}

/// Unpack one scalar from `bytes`, which must be exactly `code.width()` long.
pub fn unpack_scalar(code: TypeCode, bytes: &[u8]) -> StoreResult<i64> {
    if bytes.len() != code.width() {
        return Err(StoreError::CodecMismatch {
            reason: format!(
                "scalar '{}' needs {} bytes, got {}",
                code.code() as char,
                code.width(),
                bytes.len()
            ),
        });
    }
    let value = match code {
        TypeCode::I8 => i8::from_ne_bytes([bytes[0]]) as i64,
        TypeCode::U8 => u8::from_ne_bytes([bytes[0]]) as i64,
        TypeCode::I16 => i16::from_ne_bytes([bytes[0], bytes[1]]) as i64,
        TypeCode::U16 => u16::from_ne_bytes([bytes[0], bytes[1]]) as i64,
        TypeCode::I32 => {
            i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64
        }
        TypeCode::U32 => {
            u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64
        }
    };
    Ok(value)
}

// ─── Record formats ─────────────────────────────────────────────────

/// One field of a record format: name, code, and computed byte offset.
#[derive(Debug, Clone)]
pub struct RecordField {
    /// Field name, in declaration order.
    pub name: String,
    /// Scalar type code.
    pub code: TypeCode,
    /// Byte offset from the start of the record.
    pub offset: usize,
}

/// An ordered, fixed-width record layout.
#[derive(Debug, Clone)]
pub struct RecordFormat {
    fields: Vec<RecordField>,
    length: usize,
}

impl RecordFormat {
    /// Build a format from (name, code) pairs in declaration order.
    pub fn new<'a, I>(fields: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, TypeCode)>,
    {
        let mut offset = 0;
        let fields: Vec<RecordField> = fields
            .into_iter()
            .map(|(name, code)| {
                let field = RecordField {
                    name: name.to_string(),
                    code,
                    offset,
                };
                offset += code.width();
                field
            })
            .collect();
        Self {
            fields,
            length: offset,
        }
    }

    /// Total packed length of one record.
    pub fn record_length(&self) -> usize {
        self.length
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> &[RecordField] {
        &self.fields
    }

    /// Pack `values` (one per field, in order) into a fresh buffer.
    pub fn pack(&self, values: &[i64]) -> StoreResult<Vec<u8>> {
        if values.len() != self.fields.len() {
            return Err(StoreError::CodecMismatch {
                reason: format!(
                    "record has {} fields, got {} values",
                    self.fields.len(),
                    values.len()
                ),
            });
        }
        let mut out = vec![0u8; self.length];
        for (field, &value) in self.fields.iter().zip(values) {
            let end = field.offset + field.code.width();
            pack_scalar(field.code, value, &mut out[field.offset..end])?;
        }
        Ok(out)
    }

    /// Unpack one record from `bytes` into per-field values, in order.
    pub fn unpack(&self, bytes: &[u8]) -> StoreResult<Vec<i64>> {
        if bytes.len() != self.length {
            return Err(StoreError::CodecMismatch {
                reason: format!(
                    "record is {} bytes, got {}",
                    self.length,
                    bytes.len()
                ),
            });
        }
        self.fields
            .iter()
            .map(|field| {
                let end = field.offset + field.code.width();
                unpack_scalar(field.code, &bytes[field.offset..end])
            })
            .collect()
    }
}

// ─── Format cache ───────────────────────────────────────────────────

/// Per-registry memoization of record formats, keyed by caller id.
///
/// Owned by each store instance — there is no process-global cache, so
/// two stores in one process never share mutable state.
#[derive(Debug, Default)]
pub struct FormatCache {
    formats: HashMap<String, Arc<RecordFormat>>,
}

impl FormatCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the memoized format for `id`, building it on first use.
    pub fn get_or_build<F>(&mut self, id: &str, build: F) -> Arc<RecordFormat>
    where
        F: FnOnce() -> RecordFormat,
    {
        if let Some(format) = self.formats.get(id) {
            return Arc::clone(format);
        }
        let format = Arc::new(build());
        self.formats.insert(id.to_string(), Arc::clone(&format));
        format
    }

    /// Number of memoized formats.
    pub fn len(&self) -> usize {
        self.formats.len()
    }

    /// True when nothing has been memoized yet.
    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }
}
