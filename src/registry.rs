//! Expansion of logical metric configs into physical metrics.
//!
//! A counter yields one physical metric under its own name. A timer
//! yields eight — `<name>.service_time`, `<name>.time_taken_0` through
//! `<name>.time_taken_5`, `<name>.timings_count` — at consecutive item
//! ids starting from the timer's base item. Expansion never mutates the
//! caller's configs.
//!
//! In development mode each config passes a validation gauntlet before
//! expansion and is dropped (with a logged warning) on the first
//! failure. Production skips validation entirely.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::codec::TypeCode;
use crate::config::{MetricConfig, MetricKind};
use crate::consts::INSTANCE_DOMAIN_NULL;
use crate::error::{StoreError, StoreResult};

/// Timer field names, in expansion order. Field `k` lands at item
/// `base + k`.
pub const TIMING_FIELDS: [&str; 8] = [
    "service_time",
    "time_taken_0",
    "time_taken_1",
    "time_taken_2",
    "time_taken_3",
    "time_taken_4",
    "time_taken_5",
    "timings_count",
];

/// One physical metric: a name bound to an identifier triple and a
/// packing code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalMetric {
    /// Physical name (`<config name>` or `<config name>.<field>`).
    pub name: String,
    /// PCP cluster id.
    pub cluster: u16,
    /// PCP item id.
    pub item: u16,
    /// PCP instance id.
    pub instance: i32,
    /// Packing code of the value slot.
    pub code: TypeCode,
}

/// The expanded, validated set of physical metrics for one store.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    metrics: Vec<PhysicalMetric>,
    by_name: HashMap<String, usize>,
}

impl MetricsRegistry {
    /// Expand `configs` into physical metrics.
    ///
    /// With `development_mode` set, configs are validated in order and
    /// dropped on the first failing rule; without it the values are
    /// taken as declared (truncated to field width where needed).
    pub fn expand(configs: &[MetricConfig], development_mode: bool) -> Self {
        let mut registry = Self::default();
        let mut accepted: HashSet<(u16, u16, i32)> = HashSet::new();

        for config in configs {
            let triple = if development_mode {
                match validate(config, &accepted) {
                    Ok(triple) => triple,
                    Err(e) => {
                        warn!(error = %e, "dropping metric config");
                        continue;
                    }
                }
            } else {
                (
                    config.pcp_cluster as u16,
                    config.pcp_item.unwrap_or(0) as u16,
                    config.pcp_instance.unwrap_or(INSTANCE_DOMAIN_NULL as i64) as i32,
                )
            };
            let (cluster, item, instance) = triple;

            match config.kind {
                MetricKind::Counter => {
                    registry.push(PhysicalMetric {
                        name: config.name.clone(),
                        cluster,
                        item,
                        instance,
                        code: TypeCode::U32,
                    });
                }
                MetricKind::Timer => {
                    for (k, field) in TIMING_FIELDS.iter().enumerate() {
                        registry.push(PhysicalMetric {
                            name: format!("{}.{}", config.name, field),
                            cluster,
                            item: (item as u32 + k as u32) as u16,
                            instance,
                            code: TypeCode::U32,
                        });
                    }
                }
            }
            accepted.insert(triple);
        }
        registry
    }

    /// Look up a physical metric by name.
    pub fn lookup(&self, name: &str) -> Option<&PhysicalMetric> {
        self.by_name.get(name).map(|&i| &self.metrics[i])
    }

    /// Whether `name` is a registered physical metric.
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Physical metrics in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &PhysicalMetric> {
        self.metrics.iter()
    }

    /// Number of physical metrics.
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// True when no config survived expansion.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    fn push(&mut self, metric: PhysicalMetric) {
        if self.by_name.contains_key(&metric.name) {
            warn!(name = %metric.name, "physical metric already registered; keeping first");
            return;
        }
        self.by_name.insert(metric.name.clone(), self.metrics.len());
        self.metrics.push(metric);
    }
}

/// Development-mode validation. Rules run in a fixed order; the first
/// failure wins.
fn validate(
    config: &MetricConfig,
    accepted: &HashSet<(u16, u16, i32)>,
) -> StoreResult<(u16, u16, i32)> {
    let reject = |reason: String| StoreError::ConfigInvalid {
        name: config.name.clone(),
        reason,
    };

    // The kind enum is total, so "unknown type" cannot reach here; it
    // is rejected at deserialization or never constructed.
    if config.name.is_empty() {
        return Err(reject("name must be a non-empty string".to_string()));
    }

    if !(0..=u16::MAX as i64).contains(&config.pcp_cluster) {
        return Err(reject(format!(
            "pcp_cluster {} outside 0..=65535",
            config.pcp_cluster
        )));
    }
    let cluster = config.pcp_cluster as u16;

    let item = match (config.kind, config.pcp_item) {
        (MetricKind::Timer, None) => 0,
        (_, None) => return Err(reject("pcp_item is required".to_string())),
        (_, Some(item)) => {
            if !(0..=u16::MAX as i64).contains(&item) {
                return Err(reject(format!("pcp_item {item} outside 0..=65535")));
            }
            item as u16
        }
    };

    let instance = match config.pcp_instance {
        None => INSTANCE_DOMAIN_NULL,
        Some(instance) => {
            if !(i32::MIN as i64..=i32::MAX as i64).contains(&instance) {
                return Err(reject(format!(
                    "pcp_instance {instance} outside i32 range"
                )));
            }
            instance as i32
        }
    };

    if accepted.contains(&(cluster, item, instance)) {
        return Err(reject(format!(
            "duplicate identifier triple ({cluster}, {item}, {instance})"
        )));
    }
    Ok((cluster, item, instance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricConfig;

    #[test]
    fn counter_expands_to_one_metric() {
        let registry =
            MetricsRegistry::expand(&[MetricConfig::counter("things", 0, 0)], true);
        assert_eq!(registry.len(), 1);
        let metric = registry.lookup("things").unwrap();
        assert_eq!((metric.cluster, metric.item, metric.instance), (0, 0, -1));
        assert_eq!(metric.code, TypeCode::U32);
    }

    #[test]
    fn timer_expands_to_eight_with_consecutive_items() {
        let registry = MetricsRegistry::expand(
            &[MetricConfig::timer("t", 1, 10).with_instance(1)],
            true,
        );
        assert_eq!(registry.len(), 8);

        let expectations = [
            ("t.service_time", 10),
            ("t.time_taken_0", 11),
            ("t.time_taken_1", 12),
            ("t.time_taken_2", 13),
            ("t.time_taken_3", 14),
            ("t.time_taken_4", 15),
            ("t.time_taken_5", 16),
            ("t.timings_count", 17),
        ];
        for (name, item) in expectations {
            let metric = registry.lookup(name).unwrap();
            assert_eq!(metric.item, item, "{name}");
            assert_eq!(metric.cluster, 1);
            assert_eq!(metric.instance, 1);
        }
    }

    #[test]
    fn timer_item_defaults_to_zero() {
        let mut config = MetricConfig::timer("t", 0, 0);
        config.pcp_item = None;
        let registry = MetricsRegistry::expand(&[config], true);
        assert_eq!(registry.lookup("t.service_time").unwrap().item, 0);
        assert_eq!(registry.lookup("t.timings_count").unwrap().item, 7);
    }

    #[test]
    fn duplicate_triple_drops_later_config() {
        let registry = MetricsRegistry::expand(
            &[
                MetricConfig::counter("first", 0, 0).with_instance(0),
                MetricConfig::counter("second", 0, 0).with_instance(0),
            ],
            true,
        );
        assert!(registry.contains("first"));
        assert!(!registry.contains("second"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_physical_name_keeps_first() {
        let registry = MetricsRegistry::expand(
            &[
                MetricConfig::counter("same", 0, 0),
                MetricConfig::counter("same", 0, 1),
            ],
            true,
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("same").unwrap().item, 0);
    }

    #[test]
    fn invalid_configs_are_dropped_without_aborting_the_rest() {
        let mut unnamed = MetricConfig::counter("", 0, 1);
        unnamed.name = String::new();
        let mut wide_cluster = MetricConfig::counter("wide", 0, 2);
        wide_cluster.pcp_cluster = 70_000;
        let mut itemless = MetricConfig::counter("itemless", 0, 0);
        itemless.pcp_item = None;
        let mut wide_instance = MetricConfig::counter("wideinst", 0, 3);
        wide_instance.pcp_instance = Some(i64::MAX);
        let survivor = MetricConfig::counter("survivor", 0, 4);

        let registry = MetricsRegistry::expand(
            &[unnamed, wide_cluster, itemless, wide_instance, survivor],
            true,
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("survivor"));
    }

    #[test]
    fn validation_failures_are_typed_config_rejections() {
        let mut config = MetricConfig::counter("wide", 0, 0);
        config.pcp_cluster = -1;
        let err = validate(&config, &HashSet::new()).unwrap_err();
        assert!(matches!(err, StoreError::ConfigInvalid { .. }));
        assert!(err.to_string().contains("wide"));
        assert!(err.to_string().contains("pcp_cluster"));
    }

    #[test]
    fn production_mode_skips_validation() {
        let mut config = MetricConfig::counter("overflowing", 0, 0);
        config.pcp_cluster = 70_000; // truncates to 70_000 % 65_536
        let registry = MetricsRegistry::expand(&[config], false);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("overflowing").unwrap().cluster, 4_464);
    }

    #[test]
    fn expansion_does_not_mutate_inputs() {
        let configs = vec![MetricConfig::timer("t", 0, 5)];
        let before = configs.clone();
        let _ = MetricsRegistry::expand(&configs, true);
        assert_eq!(configs[0].pcp_item, before[0].pcp_item);
    }

    #[test]
    fn registration_order_is_preserved() {
        let registry = MetricsRegistry::expand(
            &[
                MetricConfig::counter("b", 0, 1),
                MetricConfig::counter("a", 0, 0),
            ],
            true,
        );
        let names: Vec<&str> = registry.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["b", "a"]);
    }
}
