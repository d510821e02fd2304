//! Public metrics facade.
//!
//! Application code talks to [`MetricsLogger`] by metric name:
//! `get`/`set`, `increment`, and `timing` for the eight-field timer
//! records, plus bulk read, bulk clear, and segment deletion.
//!
//! The facade never panics and never returns an error type: failures
//! are logged and surfaced as `None`/`false`, and a failed segment
//! initialization latches `has_error` so every later call
//! short-circuits. Value reads and writes are lock-free; only
//! first-touch materialization of a metric takes the rendezvous lock.
//!
//! Note that `increment` is read-modify-write: two processes bumping
//! the same counter concurrently can lose updates. Registration is the
//! only cross-process operation with a hard exclusivity guarantee.

use std::collections::HashMap;

use tracing::{error, info, warn};

use crate::codec::FormatCache;
use crate::config::{AccessMode, StoreOptions};
use crate::error::StoreError;
use crate::index::{IndexEntry, MetricIndex, Slot};
use crate::registry::MetricsRegistry;

/// Milliseconds upper bounds of histogram buckets 0..=4; everything
/// else lands in bucket 5.
const BUCKET_BOUNDS_MS: [f64; 5] = [1_000.0, 5_000.0, 10_000.0, 20_000.0, 40_000.0];

/// Per-process handle on the shared metrics store.
pub struct MetricsLogger {
    registry: MetricsRegistry,
    index: Option<MetricIndex>,
    slots: HashMap<String, Slot>,
    has_error: bool,
}

impl MetricsLogger {
    /// Build the store from `options`.
    ///
    /// Construction itself never fails: if the rendezvous file or a
    /// segment cannot be set up the error is logged, `has_error`
    /// latches, and the handle degrades to a sink (reads `None`,
    /// writes no-ops).
    pub fn new(options: StoreOptions) -> Self {
        let registry = MetricsRegistry::expand(&options.metrics, options.development_mode);
        let mut formats = FormatCache::new();
        let key_file = options.key_file_path();
        let version = options.version.max(1);
        let read_only = options.mode == AccessMode::ReadOnly;

        let (index, has_error) = match MetricIndex::open(
            &key_file,
            registry.len(),
            version,
            read_only,
            &mut formats,
        ) {
            Ok(index) => (Some(index), false),
            Err(e) => {
                error!(
                    key_file = %key_file.display(),
                    error = %e,
                    "metrics store initialization failed; all operations disabled"
                );
                (None, true)
            }
        };

        Self {
            registry,
            index,
            slots: HashMap::new(),
            has_error,
        }
    }

    /// Whether initialization failed and the handle is a sink.
    pub fn has_error(&self) -> bool {
        self.has_error
    }

    /// Current value of a metric.
    ///
    /// `None` for names that were never registered (or when the store
    /// is errored); `Some(0)` for registered names whose slot could not
    /// be materialized yet.
    pub fn get(&mut self, name: &str) -> Option<u32> {
        if self.has_error || !self.registry.contains(name) {
            return None;
        }
        let allow_append = !self.is_read_only();
        let Some(slot) = self.materialize(name, allow_append) else {
            return Some(0);
        };
        let index = self.index.as_ref()?;
        match index.read_value(&slot) {
            Ok(value) => Some(value as u32),
            Err(e) => {
                warn!(metric = name, error = %e, "value read failed");
                Some(0)
            }
        }
    }

    /// Store a value, materializing the metric on first touch.
    ///
    /// Out-of-range values are rewritten to 0 with a logged warning;
    /// unregistered names are ignored; read-only handles log and no-op.
    pub fn set(&mut self, name: &str, value: f64) -> bool {
        if self.has_error || !self.registry.contains(name) {
            return false;
        }
        if self.is_read_only() {
            error!(metric = name, "set on read-only metrics store ignored");
            return false;
        }
        let Some(slot) = self.materialize(name, true) else {
            return false;
        };
        let value = self.validate_value(name, value);
        let Some(index) = self.index.as_mut() else {
            return false;
        };
        match index.write_value(&slot, value as i64) {
            Ok(()) => true,
            Err(e) => {
                error!(metric = name, error = %e, "value write failed");
                false
            }
        }
    }

    /// Add 1 to a counter.
    pub fn increment(&mut self, name: &str) -> bool {
        self.increment_by(name, 1.0)
    }

    /// Add `delta` to a counter.
    ///
    /// Read-modify-write: not atomic across processes.
    pub fn increment_by(&mut self, name: &str, delta: f64) -> bool {
        let Some(current) = self.get(name) else {
            return false;
        };
        self.set(name, current as f64 + delta)
    }

    /// Record one timed event of `ms` milliseconds against a timer.
    ///
    /// Adds `ms` to `<name>.service_time`, bumps the one bucket counter
    /// covering `ms`, and bumps `<name>.timings_count`.
    pub fn timing(&mut self, name: &str, ms: f64) -> bool {
        if self.has_error {
            return false;
        }
        let service_time = format!("{name}.service_time");
        if !self.registry.contains(&service_time) {
            warn!(metric = name, "timing on a name that is not a registered timer");
            return false;
        }
        if self.is_read_only() {
            error!(metric = name, "timing on read-only metrics store ignored");
            return false;
        }
        if ms.is_nan() || ms < 0.0 {
            warn!(metric = name, ms, "timing duration must be non-negative");
            return false;
        }

        let bucket = bucket_for(ms);
        let mut ok = self.increment_by(&service_time, ms);
        ok &= self.increment(&format!("{name}.time_taken_{bucket}"));
        ok &= self.increment(&format!("{name}.timings_count"));
        ok
    }

    /// Snapshot every registered physical metric and its current value.
    pub fn get_all_metrics(&mut self) -> HashMap<String, u32> {
        if self.has_error {
            return HashMap::new();
        }
        let names: Vec<String> = self.registry.iter().map(|m| m.name.clone()).collect();
        names
            .into_iter()
            .filter_map(|name| {
                let value = self.get(&name)?;
                Some((name, value))
            })
            .collect()
    }

    /// Reset every registered physical metric to zero.
    pub fn clear_all_metrics(&mut self) -> bool {
        if self.has_error {
            return false;
        }
        let names: Vec<String> = self.registry.iter().map(|m| m.name.clone()).collect();
        let mut ok = true;
        for name in names {
            ok &= self.set(&name, 0.0);
        }
        ok
    }

    /// Every published index entry paired with its current value — the
    /// consumer-side view of the segments, independent of this
    /// process's registry.
    pub fn export(&mut self) -> Vec<(IndexEntry, u32)> {
        let Some(index) = self.index.as_ref() else {
            return Vec::new();
        };
        let entries = match index.entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "index walk failed");
                return Vec::new();
            }
        };
        entries
            .into_iter()
            .map(|entry| {
                let value = index.read_value(&entry.slot()).unwrap_or(0) as u32;
                (entry, value)
            })
            .collect()
    }

    /// Remove both segments and optionally the rendezvous file.
    /// Idempotent; the handle keeps working as a sink afterwards.
    pub fn delete_shared_memory(&mut self, drop_key_file: bool) -> bool {
        self.slots.clear();
        let Some(index) = self.index.as_mut() else {
            return true;
        };
        match index.delete(drop_key_file) {
            Ok(()) => {
                self.index = None;
                true
            }
            Err(e) => {
                error!(error = %e, "segment deletion failed");
                false
            }
        }
    }

    fn is_read_only(&self) -> bool {
        self.index.as_ref().map_or(true, |i| i.is_read_only())
    }

    /// Resolve a name to its slot: local cache, then index scan, then
    /// (when allowed) registration.
    fn materialize(&mut self, name: &str, allow_append: bool) -> Option<Slot> {
        if let Some(slot) = self.slots.get(name) {
            return Some(*slot);
        }
        let metric = self.registry.lookup(name)?.clone();
        let index = self.index.as_mut()?;

        match index.find(metric.cluster, metric.item, metric.instance) {
            Ok(Some(slot)) => {
                self.slots.insert(name.to_string(), slot);
                return Some(slot);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(metric = name, error = %e, "index lookup failed");
                return None;
            }
        }
        if !allow_append {
            return None;
        }
        match index.append(metric.cluster, metric.item, metric.instance, metric.code) {
            Ok(slot) => {
                self.slots.insert(name.to_string(), slot);
                Some(slot)
            }
            Err(e) => {
                error!(metric = name, error = %e, "metric registration failed");
                None
            }
        }
    }

    /// Range discipline for u32 slots. Rewrites out-of-range values to
    /// zero so a misbehaving producer can never corrupt a slot, only
    /// blank it.
    fn validate_value(&self, name: &str, value: f64) -> u32 {
        let reject = |reason: &str| StoreError::RangeOrTypeViolation {
            metric: name.to_string(),
            reason: reason.to_string(),
        };
        if value.fract() != 0.0 {
            warn!(value, error = %reject("not an integer"), "storing 0");
            return 0;
        }
        if value < 0.0 {
            warn!(value, error = %reject("negative"), "storing 0");
            return 0;
        }
        if value >= u32::MAX as f64 {
            info!(metric = name, value, "Wrapping value for metric; storing 0");
            return 0;
        }
        value as u32
    }

    /// The index handle, when initialization succeeded. Diagnostic
    /// tooling uses this to walk the raw entry table.
    pub fn index(&self) -> Option<&MetricIndex> {
        self.index.as_ref()
    }

    /// Names of every registered physical metric, in registration order.
    pub fn metric_names(&self) -> Vec<&str> {
        self.registry.iter().map(|m| m.name.as_str()).collect()
    }
}

impl std::fmt::Debug for MetricsLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsLogger")
            .field("metrics", &self.registry.len())
            .field("materialized", &self.slots.len())
            .field("has_error", &self.has_error)
            .finish()
    }
}

/// Histogram bucket for a duration in milliseconds.
fn bucket_for(ms: f64) -> usize {
    BUCKET_BOUNDS_MS
        .iter()
        .position(|&bound| ms < bound)
        .unwrap_or(BUCKET_BOUNDS_MS.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_table_is_half_open() {
        assert_eq!(bucket_for(0.0), 0);
        assert_eq!(bucket_for(999.0), 0);
        assert_eq!(bucket_for(1_000.0), 1);
        assert_eq!(bucket_for(4_999.0), 1);
        assert_eq!(bucket_for(5_000.0), 2);
        assert_eq!(bucket_for(9_999.0), 2);
        assert_eq!(bucket_for(10_000.0), 3);
        assert_eq!(bucket_for(19_999.0), 3);
        assert_eq!(bucket_for(20_000.0), 4);
        assert_eq!(bucket_for(39_999.0), 4);
        assert_eq!(bucket_for(40_000.0), 5);
        assert_eq!(bucket_for(1e12), 5);
    }
}
