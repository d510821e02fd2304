//! Timer expansion, histogram bucketing, and timing accounting.

use std::path::PathBuf;

use shm_metrics::{MetricConfig, MetricsLogger, StoreOptions, TIMING_FIELDS};
use tempfile::TempDir;

fn options_in(dir: &TempDir, metrics: Vec<MetricConfig>) -> StoreOptions {
    let mut options = StoreOptions::new("timers");
    options.key_file_dir = PathBuf::from(dir.path());
    options.metrics = metrics;
    options.version = 100;
    options.development_mode = true;
    options
}

#[test]
fn timing_fills_the_matching_bucket() {
    let dir = TempDir::new().unwrap();
    let mut metrics = MetricsLogger::new(options_in(
        &dir,
        vec![MetricConfig::timer("time", 0, 0)],
    ));

    assert!(metrics.timing("time", 2_000.0));
    assert_eq!(metrics.get("time.service_time"), Some(2_000));
    assert_eq!(metrics.get("time.time_taken_0"), Some(0));
    assert_eq!(metrics.get("time.time_taken_1"), Some(1));
    assert_eq!(metrics.get("time.time_taken_2"), Some(0));
    assert_eq!(metrics.get("time.timings_count"), Some(1));

    assert!(metrics.timing("time", 15_000.0));
    assert_eq!(metrics.get("time.service_time"), Some(17_000));
    assert_eq!(metrics.get("time.time_taken_1"), Some(1));
    assert_eq!(metrics.get("time.time_taken_3"), Some(1));
    assert_eq!(metrics.get("time.timings_count"), Some(2));

    assert!(metrics.delete_shared_memory(true));
}

#[test]
fn timer_items_auto_increment_from_base() {
    let dir = TempDir::new().unwrap();
    let mut metrics = MetricsLogger::new(options_in(
        &dir,
        vec![MetricConfig::timer("t", 1, 10).with_instance(1)],
    ));

    // Touch every field so all eight entries publish.
    assert!(metrics.timing("t", 1.0));
    for field in TIMING_FIELDS {
        assert!(metrics.get(&format!("t.{field}")).is_some());
    }

    let mut entries = metrics.index().unwrap().entries().unwrap();
    entries.sort_by_key(|e| e.item);
    let items: Vec<u16> = entries.iter().map(|e| e.item).collect();
    assert_eq!(items, [10, 11, 12, 13, 14, 15, 16, 17]);
    assert!(entries.iter().all(|e| e.cluster == 1 && e.instance == 1));

    assert!(metrics.delete_shared_memory(true));
}

#[test]
fn bucket_totals_reconcile_with_count_and_sum() {
    let dir = TempDir::new().unwrap();
    let mut metrics = MetricsLogger::new(options_in(
        &dir,
        vec![MetricConfig::timer("req", 0, 0)],
    ));

    let durations = [
        0.0, 500.0, 999.0, 1_000.0, 4_999.0, 5_000.0, 9_000.0, 12_000.0, 25_000.0, 39_999.0,
        40_000.0, 120_000.0,
    ];
    for &ms in &durations {
        assert!(metrics.timing("req", ms));
    }

    let count = metrics.get("req.timings_count").unwrap();
    assert_eq!(count as usize, durations.len());

    let bucket_total: u32 = (0..6)
        .map(|k| metrics.get(&format!("req.time_taken_{k}")).unwrap())
        .sum();
    assert_eq!(bucket_total, count);

    let expected_sum: f64 = durations.iter().sum();
    assert_eq!(
        metrics.get("req.service_time").unwrap(),
        expected_sum as u32
    );

    // Spot-check the half-open edges: 999 stays in bucket 0, 1000
    // crosses into bucket 1, 39999 stays in bucket 4, 40000 crosses
    // into the open-ended last bucket.
    assert_eq!(metrics.get("req.time_taken_0"), Some(3));
    assert_eq!(metrics.get("req.time_taken_1"), Some(2));
    assert_eq!(metrics.get("req.time_taken_2"), Some(2));
    assert_eq!(metrics.get("req.time_taken_3"), Some(1));
    assert_eq!(metrics.get("req.time_taken_4"), Some(2));
    assert_eq!(metrics.get("req.time_taken_5"), Some(2));

    assert!(metrics.delete_shared_memory(true));
}

#[test]
fn snapshot_covers_counters_once_and_timers_eightfold() {
    let dir = TempDir::new().unwrap();
    let mut metrics = MetricsLogger::new(options_in(
        &dir,
        vec![
            MetricConfig::counter("c1", 0, 0),
            MetricConfig::counter("c2", 0, 1),
            MetricConfig::timer("t1", 0, 10),
            MetricConfig::timer("t2", 0, 20),
        ],
    ));

    let snapshot = metrics.get_all_metrics();
    assert_eq!(snapshot.len(), 2 + 2 * 8);
    assert!(snapshot.contains_key("c1"));
    assert!(snapshot.contains_key("t1.service_time"));
    assert!(snapshot.contains_key("t2.timings_count"));

    assert!(metrics.delete_shared_memory(true));
}

#[test]
fn timing_rejects_non_timers_and_negative_durations() {
    let dir = TempDir::new().unwrap();
    let mut metrics = MetricsLogger::new(options_in(
        &dir,
        vec![
            MetricConfig::counter("plain", 0, 0),
            MetricConfig::timer("t", 0, 10),
        ],
    ));

    assert!(!metrics.timing("plain", 100.0));
    assert!(!metrics.timing("missing", 100.0));
    assert!(!metrics.timing("t", -1.0));
    assert_eq!(metrics.get("t.timings_count"), Some(0));

    assert!(metrics.delete_shared_memory(true));
}
