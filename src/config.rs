//! Store construction options and per-metric configuration.
//!
//! Options are plain serde-deserializable structs, so a metric table
//! can be declared in a TOML file and loaded with [`StoreOptions::load`]
//! as well as built programmatically.
//!
//! # TOML Example
//!
//! ```toml
//! name = "soapxml"
//! version = 100
//! development_mode = true
//!
//! [[metrics]]
//! type = "counter"
//! name = "requests"
//! pcp_cluster = 0
//! pcp_item = 0
//!
//! [[metrics]]
//! type = "timer"
//! name = "render"
//! pcp_cluster = 0
//! pcp_item = 10
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::consts::KEY_FILE_DIR;
use crate::error::{StoreError, StoreResult};

/// Logical metric kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// One u32 slot, monotonically increasing by convention.
    Counter,
    /// Eight u32 slots: service-time accumulator, six histogram
    /// buckets, and an occurrence counter.
    Timer,
}

/// Whether this process may mutate the segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Producer: create, register, and write.
    #[default]
    ReadWrite,
    /// Consumer: attach existing segments only; every write is a no-op.
    ReadOnly,
}

/// One logical metric declaration.
///
/// Identifier fields are kept wide (`i64`) so development-mode
/// validation can see and report out-of-range declarations instead of
/// silently truncating them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfig {
    /// Metric kind.
    #[serde(rename = "type")]
    pub kind: MetricKind,
    /// Logical metric name; timers expand to `<name>.<field>`.
    pub name: String,
    /// PCP cluster id, 0..=65535.
    pub pcp_cluster: i64,
    /// PCP item id. Required for counters; timers default to 0 and
    /// claim items `pcp_item..pcp_item+7`.
    #[serde(default)]
    pub pcp_item: Option<i64>,
    /// PCP instance id; defaults to -1 ("no instance domain").
    #[serde(default)]
    pub pcp_instance: Option<i64>,
}

impl MetricConfig {
    /// Counter declaration.
    pub fn counter(name: &str, cluster: u16, item: u16) -> Self {
        Self {
            kind: MetricKind::Counter,
            name: name.to_string(),
            pcp_cluster: cluster as i64,
            pcp_item: Some(item as i64),
            pcp_instance: None,
        }
    }

    /// Timer declaration claiming items `item..item+7`.
    pub fn timer(name: &str, cluster: u16, item: u16) -> Self {
        Self {
            kind: MetricKind::Timer,
            name: name.to_string(),
            pcp_cluster: cluster as i64,
            pcp_item: Some(item as i64),
            pcp_instance: None,
        }
    }

    /// Attach an explicit instance id.
    pub fn with_instance(mut self, instance: i32) -> Self {
        self.pcp_instance = Some(instance as i64);
        self
    }
}

/// Constructor options for [`crate::logger::MetricsLogger`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Application name; first half of the rendezvous file name.
    pub name: String,
    /// Second half of the rendezvous file name.
    #[serde(default = "default_identifier")]
    pub identifier: String,
    /// Logical metric declarations.
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
    /// Layout version stamped into fresh headers; minimum 1.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Producer or consumer role.
    #[serde(default)]
    pub mode: AccessMode,
    /// Validate metric configs and log rejections. Off in production
    /// for speed.
    #[serde(default)]
    pub development_mode: bool,
    /// Directory holding the rendezvous file.
    #[serde(default = "default_key_file_dir")]
    pub key_file_dir: PathBuf,
}

fn default_identifier() -> String {
    "metrics".to_string()
}

fn default_version() -> u32 {
    1
}

fn default_key_file_dir() -> PathBuf {
    PathBuf::from(KEY_FILE_DIR)
}

impl StoreOptions {
    /// Options for `name` with every default applied.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            identifier: default_identifier(),
            metrics: Vec::new(),
            version: default_version(),
            mode: AccessMode::default(),
            development_mode: false,
            key_file_dir: default_key_file_dir(),
        }
    }

    /// Full path of the rendezvous file: `<dir>/<name>.<identifier>`.
    pub fn key_file_path(&self) -> PathBuf {
        self.key_file_dir
            .join(format!("{}.{}", self.name, self.identifier))
    }

    /// Load options from a TOML file.
    pub fn load(path: &Path) -> StoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| StoreError::ConfigInvalid {
            name: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn key_file_path_joins_name_and_identifier() {
        let mut options = StoreOptions::new("soapxml");
        assert_eq!(
            options.key_file_path(),
            PathBuf::from("/var/tmp/soapxml.metrics")
        );

        options.identifier = "stats".to_string();
        options.key_file_dir = PathBuf::from("/run/app");
        assert_eq!(options.key_file_path(), PathBuf::from("/run/app/soapxml.stats"));
    }

    #[test]
    fn defaults() {
        let options = StoreOptions::new("app");
        assert_eq!(options.version, 1);
        assert_eq!(options.mode, AccessMode::ReadWrite);
        assert!(!options.development_mode);
        assert!(options.metrics.is_empty());
    }

    #[test]
    fn load_from_toml() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"name = "soapxml"
version = 100
development_mode = true
mode = "read_only"

[[metrics]]
type = "counter"
name = "requests"
pcp_cluster = 3
pcp_item = 1

[[metrics]]
type = "timer"
name = "render"
pcp_cluster = 3
pcp_item = 10
pcp_instance = 7
"#
        )
        .unwrap();
        file.flush().unwrap();

        let options = StoreOptions::load(file.path()).unwrap();
        assert_eq!(options.name, "soapxml");
        assert_eq!(options.version, 100);
        assert_eq!(options.mode, AccessMode::ReadOnly);
        assert!(options.development_mode);
        assert_eq!(options.metrics.len(), 2);
        assert_eq!(options.metrics[0].kind, MetricKind::Counter);
        assert_eq!(options.metrics[0].pcp_item, Some(1));
        assert_eq!(options.metrics[1].kind, MetricKind::Timer);
        assert_eq!(options.metrics[1].pcp_instance, Some(7));
    }

    #[test]
    fn load_rejects_bad_toml() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not really [[ toml").unwrap();
        file.flush().unwrap();

        assert!(matches!(
            StoreOptions::load(file.path()),
            Err(StoreError::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        assert!(matches!(
            StoreOptions::load(Path::new("/nonexistent/options.toml")),
            Err(StoreError::Io(_))
        ));
    }

    #[test]
    fn builders_fill_identifier_fields() {
        let counter = MetricConfig::counter("things", 2, 9);
        assert_eq!(counter.kind, MetricKind::Counter);
        assert_eq!(counter.pcp_cluster, 2);
        assert_eq!(counter.pcp_item, Some(9));
        assert_eq!(counter.pcp_instance, None);

        let timer = MetricConfig::timer("render", 1, 10).with_instance(-1);
        assert_eq!(timer.kind, MetricKind::Timer);
        assert_eq!(timer.pcp_instance, Some(-1));
    }
}
