//! Tiered time-series storage for metric points.
//!
//! Each metric holds one buffer per retention tier (`raw`, `hourly`,
//! `daily`, `monthly`); writes land in `raw` and compaction evicts entries
//! older than the tier's window. Reads pick the finest tier whose window
//! covers the requested range. A label index maps `key -> value -> metric
//! names` for fast filter candidates.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Points per tier before compaction kicks in.
const MAX_POINTS_PER_TIER: usize = 100_000;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// A stored metric point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// One retention tier: how long points live and at what resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionTier {
    pub name: &'static str,
    pub window: Duration,
    pub resolution: Duration,
}

impl RetentionTier {
    /// Raw data: 24 hours at full resolution.
    pub fn raw() -> Self {
        Self {
            name: "raw",
            window: Duration::hours(24),
            resolution: Duration::zero(),
        }
    }

    /// Hourly rollup kept 7 days.
    pub fn hourly() -> Self {
        Self {
            name: "hourly",
            window: Duration::days(7),
            resolution: Duration::hours(1),
        }
    }

    /// Daily rollup kept 90 days.
    pub fn daily() -> Self {
        Self {
            name: "daily",
            window: Duration::days(90),
            resolution: Duration::days(1),
        }
    }

    /// Monthly rollup kept two years.
    pub fn monthly() -> Self {
        Self {
            name: "monthly",
            window: Duration::days(730),
            resolution: Duration::days(30),
        }
    }
}

// ---------------------------------------------------------------------------
// MetricStorage
// ---------------------------------------------------------------------------

struct StorageInner {
    /// metric -> tier name -> points
    data: HashMap<String, BTreeMap<&'static str, Vec<StoredPoint>>>,
    /// label key -> label value -> metric names
    label_index: HashMap<String, HashMap<String, HashSet<String>>>,
}

/// Tiered metric storage. Write paths take the lock; read paths snapshot
/// under it and filter outside.
pub struct MetricStorage {
    inner: Mutex<StorageInner>,
    tiers: Vec<RetentionTier>,
}

impl MetricStorage {
    /// Storage with the standard raw/hourly/daily tiers.
    pub fn new() -> Self {
        Self::with_tiers(vec![
            RetentionTier::raw(),
            RetentionTier::hourly(),
            RetentionTier::daily(),
        ])
    }

    pub fn with_tiers(tiers: Vec<RetentionTier>) -> Self {
        Self {
            inner: Mutex::new(StorageInner {
                data: HashMap::new(),
                label_index: HashMap::new(),
            }),
            tiers,
        }
    }

    /// Append a point to the raw tier, indexing its labels. Compaction
    /// runs when the tier exceeds its point budget.
    pub fn write(
        &self,
        metric: &str,
        value: f64,
        timestamp: Option<DateTime<Utc>>,
        labels: HashMap<String, String>,
    ) {
        let mut inner = self.inner.lock().unwrap();

        for (key, val) in &labels {
            inner
                .label_index
                .entry(key.clone())
                .or_default()
                .entry(val.clone())
                .or_default()
                .insert(metric.to_string());
        }

        let tiers = inner
            .data
            .entry(metric.to_string())
            .or_default();
        let raw = tiers.entry("raw").or_default();
        raw.push(StoredPoint {
            timestamp: timestamp.unwrap_or_else(Utc::now),
            value,
            labels,
        });

        if raw.len() > MAX_POINTS_PER_TIER {
            let cutoff = Utc::now() - self.tier("raw").window;
            raw.retain(|p| p.timestamp >= cutoff);
        }
    }

    /// Append a batch of (timestamp, value) pairs. Returns the count written.
    pub fn write_batch(
        &self,
        metric: &str,
        points: Vec<(DateTime<Utc>, f64, HashMap<String, String>)>,
    ) -> usize {
        let count = points.len();
        for (timestamp, value, labels) in points {
            self.write(metric, value, Some(timestamp), labels);
        }
        count
    }

    /// Read points for a metric, selecting the finest tier whose window
    /// covers the range, then filtering by time and labels.
    pub fn read(
        &self,
        metric: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        labels: Option<&HashMap<String, String>>,
        limit: usize,
    ) -> Vec<StoredPoint> {
        let tier = self.select_tier(start, end);
        let inner = self.inner.lock().unwrap();

        let Some(tiers) = inner.data.get(metric) else {
            return Vec::new();
        };
        let points = tiers.get(tier.name).cloned().unwrap_or_default();
        drop(inner);

        let mut filtered: Vec<StoredPoint> = points
            .into_iter()
            .filter(|p| start.is_none_or(|s| p.timestamp >= s))
            .filter(|p| end.is_none_or(|e| p.timestamp <= e))
            .filter(|p| {
                labels.is_none_or(|wanted| {
                    wanted.iter().all(|(k, v)| p.labels.get(k) == Some(v))
                })
            })
            .collect();

        let skip = filtered.len().saturating_sub(limit);
        filtered.drain(..skip);
        filtered
    }

    /// Most recent matching point.
    pub fn read_latest(
        &self,
        metric: &str,
        labels: Option<&HashMap<String, String>>,
    ) -> Option<StoredPoint> {
        self.read(metric, None, None, labels, 1).pop()
    }

    /// All known metric names.
    pub fn list_metrics(&self) -> Vec<String> {
        self.inner.lock().unwrap().data.keys().cloned().collect()
    }

    /// Known values for a label key, optionally scoped to one metric.
    pub fn list_label_values(&self, label_key: &str, metric: Option<&str>) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        match metric {
            Some(name) => {
                let mut values: HashSet<String> = HashSet::new();
                if let Some(tiers) = inner.data.get(name) {
                    if let Some(raw) = tiers.get("raw") {
                        for point in raw {
                            if let Some(v) = point.labels.get(label_key) {
                                values.insert(v.clone());
                            }
                        }
                    }
                }
                values.into_iter().collect()
            }
            None => inner
                .label_index
                .get(label_key)
                .map(|values| values.keys().cloned().collect())
                .unwrap_or_default(),
        }
    }

    /// Metric names carrying the given label pair.
    pub fn metrics_with_label(&self, key: &str, value: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .label_index
            .get(key)
            .and_then(|values| values.get(value))
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Delete points for a metric: everything, or only those before a
    /// cutoff. Returns the deleted count.
    pub fn delete(&self, metric: &str, before: Option<DateTime<Utc>>) -> usize {
        let mut inner = self.inner.lock().unwrap();
        match before {
            None => match inner.data.remove(metric) {
                Some(tiers) => tiers.values().map(|v| v.len()).sum(),
                None => 0,
            },
            Some(cutoff) => {
                let Some(tiers) = inner.data.get_mut(metric) else {
                    return 0;
                };
                let mut deleted = 0;
                for points in tiers.values_mut() {
                    let before_len = points.len();
                    points.retain(|p| p.timestamp >= cutoff);
                    deleted += before_len - points.len();
                }
                deleted
            }
        }
    }

    /// Evict points older than each tier's window across all metrics.
    pub fn compact(&self) {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        for tiers in inner.data.values_mut() {
            for tier in &self.tiers {
                if let Some(points) = tiers.get_mut(tier.name) {
                    let cutoff = now - tier.window;
                    points.retain(|p| p.timestamp >= cutoff);
                }
            }
        }
    }

    /// Roll raw points up into a coarser tier at its resolution, averaging
    /// points within each resolution bucket.
    pub fn rollup(&self, metric: &str, tier_name: &str) {
        let Some(tier) = self.tiers.iter().find(|t| t.name == tier_name) else {
            return;
        };
        if tier.resolution <= Duration::zero() {
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        let Some(tiers) = inner.data.get_mut(metric) else {
            return;
        };
        let Some(raw) = tiers.get("raw") else { return };

        let step = tier.resolution.num_seconds();
        let mut buckets: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
        for point in raw {
            let bucket = (point.timestamp.timestamp() / step) * step;
            buckets.entry(bucket).or_default().push(point.value);
        }

        let rolled: Vec<StoredPoint> = buckets
            .into_iter()
            .map(|(bucket, values)| StoredPoint {
                timestamp: DateTime::from_timestamp(bucket, 0).unwrap_or_else(Utc::now),
                value: values.iter().sum::<f64>() / values.len() as f64,
                labels: HashMap::new(),
            })
            .collect();

        tiers.insert(tier.name, rolled);
    }

    /// Totals for observability of the store itself.
    pub fn stats(&self) -> StorageStats {
        let inner = self.inner.lock().unwrap();
        let total_points = inner
            .data
            .values()
            .flat_map(|tiers| tiers.values())
            .map(|points| points.len())
            .sum();
        StorageStats {
            metrics: inner.data.len(),
            total_points,
            tiers: self.tiers.iter().map(|t| t.name.to_string()).collect(),
        }
    }

    fn tier(&self, name: &str) -> &RetentionTier {
        self.tiers
            .iter()
            .find(|t| t.name == name)
            .unwrap_or(&self.tiers[0])
    }

    /// The finest tier whose window covers the requested range.
    fn select_tier(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> &RetentionTier {
        let Some(start) = start else {
            return self.tier("raw");
        };
        let range = end.unwrap_or_else(Utc::now) - start;
        for tier in &self.tiers {
            if range <= tier.window {
                return tier;
            }
        }
        self.tiers.last().unwrap_or(&self.tiers[0])
    }
}

impl Default for MetricStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary counters for the storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    pub metrics: usize,
    pub total_points: usize,
    pub tiers: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn write_and_read_raw() {
        let storage = MetricStorage::new();
        storage.write("cpu", 0.5, None, HashMap::new());
        storage.write("cpu", 0.7, None, HashMap::new());

        let points = storage.read("cpu", None, None, None, 100);
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].value, 0.7);
    }

    #[test]
    fn read_unknown_metric_is_empty() {
        let storage = MetricStorage::new();
        assert!(storage.read("ghost", None, None, None, 10).is_empty());
    }

    #[test]
    fn time_range_filters_points() {
        let storage = MetricStorage::new();
        let now = Utc::now();
        storage.write("m", 1.0, Some(now - Duration::hours(3)), HashMap::new());
        storage.write("m", 2.0, Some(now - Duration::hours(1)), HashMap::new());
        storage.write("m", 3.0, Some(now), HashMap::new());

        let recent = storage.read("m", Some(now - Duration::hours(2)), None, None, 100);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].value, 2.0);
    }

    #[test]
    fn label_filter_and_index() {
        let storage = MetricStorage::new();
        storage.write("reqs", 1.0, None, labels(&[("route", "/a")]));
        storage.write("reqs", 2.0, None, labels(&[("route", "/b")]));
        storage.write("errs", 1.0, None, labels(&[("route", "/a")]));

        let only_a = storage.read("reqs", None, None, Some(&labels(&[("route", "/a")])), 100);
        assert_eq!(only_a.len(), 1);

        let mut values = storage.list_label_values("route", None);
        values.sort();
        assert_eq!(values, vec!["/a", "/b"]);

        let mut with_a = storage.metrics_with_label("route", "/a");
        with_a.sort();
        assert_eq!(with_a, vec!["errs", "reqs"]);
    }

    #[test]
    fn latest_returns_newest_matching() {
        let storage = MetricStorage::new();
        let now = Utc::now();
        storage.write("m", 1.0, Some(now - Duration::minutes(2)), labels(&[("k", "x")]));
        storage.write("m", 2.0, Some(now - Duration::minutes(1)), labels(&[("k", "y")]));

        assert_eq!(storage.read_latest("m", None).unwrap().value, 2.0);
        assert_eq!(
            storage
                .read_latest("m", Some(&labels(&[("k", "x")])))
                .unwrap()
                .value,
            1.0
        );
    }

    #[test]
    fn tier_selection_prefers_finest_covering_tier() {
        let storage = MetricStorage::new();
        let now = Utc::now();

        // 1-hour range fits raw (24h window)
        let tier = storage.select_tier(Some(now - Duration::hours(1)), Some(now));
        assert_eq!(tier.name, "raw");

        // 3-day range needs hourly
        let tier = storage.select_tier(Some(now - Duration::days(3)), Some(now));
        assert_eq!(tier.name, "hourly");

        // 30-day range needs daily
        let tier = storage.select_tier(Some(now - Duration::days(30)), Some(now));
        assert_eq!(tier.name, "daily");

        // Absurd range falls back to the coarsest tier
        let tier = storage.select_tier(Some(now - Duration::days(5000)), Some(now));
        assert_eq!(tier.name, "daily");
    }

    #[test]
    fn rollup_buckets_at_tier_resolution() {
        let storage = MetricStorage::new();
        let base = DateTime::from_timestamp(1_700_000_400, 0).unwrap(); // aligned oddly
        // Two points in one hour, one in the next
        storage.write("m", 10.0, Some(base), HashMap::new());
        storage.write("m", 20.0, Some(base + Duration::minutes(10)), HashMap::new());
        storage.write("m", 30.0, Some(base + Duration::hours(2)), HashMap::new());

        storage.rollup("m", "hourly");

        let inner = storage.inner.lock().unwrap();
        let hourly = &inner.data["m"]["hourly"];
        assert_eq!(hourly.len(), 2);
        assert_eq!(hourly[0].value, 15.0);
        assert_eq!(hourly[1].value, 30.0);
    }

    #[test]
    fn delete_all_and_delete_before() {
        let storage = MetricStorage::new();
        let now = Utc::now();
        storage.write("m", 1.0, Some(now - Duration::hours(2)), HashMap::new());
        storage.write("m", 2.0, Some(now), HashMap::new());

        let deleted = storage.delete("m", Some(now - Duration::hours(1)));
        assert_eq!(deleted, 1);
        assert_eq!(storage.read("m", None, None, None, 10).len(), 1);

        let deleted = storage.delete("m", None);
        assert_eq!(deleted, 1);
        assert!(storage.list_metrics().is_empty() || storage.read("m", None, None, None, 10).is_empty());
    }

    #[test]
    fn compact_evicts_beyond_window() {
        let storage = MetricStorage::new();
        let now = Utc::now();
        storage.write("m", 1.0, Some(now - Duration::hours(30)), HashMap::new());
        storage.write("m", 2.0, Some(now), HashMap::new());

        storage.compact();
        let points = storage.read("m", None, None, None, 10);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 2.0);
    }

    #[test]
    fn stats_count_points_across_tiers() {
        let storage = MetricStorage::new();
        storage.write("a", 1.0, None, HashMap::new());
        storage.write("b", 1.0, None, HashMap::new());
        storage.write("b", 2.0, None, HashMap::new());

        let stats = storage.stats();
        assert_eq!(stats.metrics, 2);
        assert_eq!(stats.total_points, 3);
        assert!(stats.tiers.contains(&"raw".to_string()));
    }
}
