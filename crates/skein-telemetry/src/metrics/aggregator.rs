//! Time-series aggregation: bucketing, reducers, gap fill, comparisons.
//!
//! Interval strings (`30s`, `5m`, `1h`, `1d`, `1w`, `1M`) parse to
//! durations; the bucket key of a timestamp is the epoch-aligned floor of
//! the interval. Reducers cover sums, averages, extremes, percentiles, and
//! counter math (`rate`, `irate`, `delta`, `increase`).

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Aggregation functions
// ---------------------------------------------------------------------------

/// Reducer applied to each bucket (or whole series for the counter math).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    First,
    Last,
    P50,
    P75,
    P90,
    P95,
    P99,
    Rate,
    Irate,
    Delta,
    Increase,
}

impl AggregateFn {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sum" => Some(Self::Sum),
            "avg" => Some(Self::Avg),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "count" => Some(Self::Count),
            "first" => Some(Self::First),
            "last" => Some(Self::Last),
            "p50" => Some(Self::P50),
            "p75" => Some(Self::P75),
            "p90" => Some(Self::P90),
            "p95" => Some(Self::P95),
            "p99" => Some(Self::P99),
            "rate" => Some(Self::Rate),
            "irate" => Some(Self::Irate),
            "delta" => Some(Self::Delta),
            "increase" => Some(Self::Increase),
            _ => None,
        }
    }
}

/// One aggregated bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

/// Two-period comparison summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodComparison {
    pub current: f64,
    pub previous: f64,
    pub change: f64,
    pub change_percent: f64,
    pub trend: Trend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

// ---------------------------------------------------------------------------
// Interval parsing and bucketing
// ---------------------------------------------------------------------------

/// Parse an interval string (`Ns`, `Nm`, `Nh`, `Nd`, `Nw`, `NM`) into a
/// duration. Months are 30 days.
pub fn parse_interval(interval: &str) -> Option<Duration> {
    if interval.len() < 2 {
        return None;
    }
    let (value_str, unit) = interval.split_at(interval.len() - 1);
    let value: i64 = value_str.parse().ok()?;
    if value <= 0 {
        return None;
    }
    match unit {
        "s" => Some(Duration::seconds(value)),
        "m" => Some(Duration::minutes(value)),
        "h" => Some(Duration::hours(value)),
        "d" => Some(Duration::days(value)),
        "w" => Some(Duration::weeks(value)),
        "M" => Some(Duration::days(value * 30)),
        _ => None,
    }
}

/// Epoch-aligned bucket key: `epoch + floor(elapsed / interval) * interval`.
pub fn bucket_key(timestamp: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let step = interval.num_seconds().max(1);
    let bucket = timestamp.timestamp().div_euclid(step) * step;
    DateTime::from_timestamp(bucket, 0).unwrap_or(timestamp)
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Stateless time-series aggregator.
#[derive(Debug, Default, Clone, Copy)]
pub struct Aggregator;

impl Aggregator {
    pub fn new() -> Self {
        Self
    }

    /// Group `(timestamp, value)` points into interval buckets and reduce
    /// each. Optionally fill interior gaps with zero-count points.
    pub fn aggregate(
        &self,
        points: &[(DateTime<Utc>, f64)],
        interval: &str,
        function: AggregateFn,
        fill_gaps: bool,
        fill_value: f64,
    ) -> Vec<AggregatedPoint> {
        if points.is_empty() {
            return Vec::new();
        }
        let Some(delta) = parse_interval(interval) else {
            return Vec::new();
        };

        let mut buckets: BTreeMap<DateTime<Utc>, Vec<f64>> = BTreeMap::new();
        let mut ordered: BTreeMap<DateTime<Utc>, Vec<(DateTime<Utc>, f64)>> = BTreeMap::new();
        for &(ts, value) in points {
            let key = bucket_key(ts, delta);
            buckets.entry(key).or_default().push(value);
            ordered.entry(key).or_default().push((ts, value));
        }

        let mut result: Vec<AggregatedPoint> = buckets
            .iter()
            .map(|(&ts, values)| {
                // Rate-family reducers need time ordering within the bucket
                let timed = &ordered[&ts];
                AggregatedPoint {
                    timestamp: ts,
                    value: apply_fn(values, timed, function),
                    count: values.len(),
                    min: values.iter().copied().reduce(f64::min),
                    max: values.iter().copied().reduce(f64::max),
                }
            })
            .collect();

        if fill_gaps && result.len() >= 2 {
            result = fill(result, delta, fill_value);
        }
        result
    }

    /// Compare totals over two aggregated periods.
    pub fn compare_periods(
        &self,
        current: &[(DateTime<Utc>, f64)],
        previous: &[(DateTime<Utc>, f64)],
        interval: &str,
        function: AggregateFn,
    ) -> PeriodComparison {
        let current_total: f64 = self
            .aggregate(current, interval, function, false, 0.0)
            .iter()
            .map(|p| p.value)
            .sum();
        let previous_total: f64 = self
            .aggregate(previous, interval, function, false, 0.0)
            .iter()
            .map(|p| p.value)
            .sum();

        let change = current_total - previous_total;
        let change_percent = if previous_total > 0.0 {
            (change / previous_total) * 100.0
        } else if current_total > 0.0 {
            100.0
        } else {
            0.0
        };

        PeriodComparison {
            current: current_total,
            previous: previous_total,
            change,
            change_percent: (change_percent * 100.0).round() / 100.0,
            trend: if change_percent > 0.0 {
                Trend::Up
            } else if change_percent < 0.0 {
                Trend::Down
            } else {
                Trend::Stable
            },
        }
    }

    /// Reduce a series to roughly `target` points, preserving shape by
    /// stride sampling.
    pub fn downsample(
        &self,
        points: Vec<AggregatedPoint>,
        target: usize,
    ) -> Vec<AggregatedPoint> {
        if target == 0 || points.len() <= target {
            return points;
        }
        let step = points.len() as f64 / target as f64;
        let mut result = Vec::with_capacity(target);
        let mut i = 0.0;
        while (i as usize) < points.len() {
            result.push(points[i as usize].clone());
            i += step;
        }
        result
    }
}

fn apply_fn(values: &[f64], timed: &[(DateTime<Utc>, f64)], function: AggregateFn) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    match function {
        AggregateFn::Sum => values.iter().sum(),
        AggregateFn::Avg => values.iter().sum::<f64>() / values.len() as f64,
        AggregateFn::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        AggregateFn::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggregateFn::Count => values.len() as f64,
        AggregateFn::First => values[0],
        AggregateFn::Last => values[values.len() - 1],
        AggregateFn::P50 => percentile(values, 50.0),
        AggregateFn::P75 => percentile(values, 75.0),
        AggregateFn::P90 => percentile(values, 90.0),
        AggregateFn::P95 => percentile(values, 95.0),
        AggregateFn::P99 => percentile(values, 99.0),
        AggregateFn::Delta => values[values.len() - 1] - values[0],
        AggregateFn::Increase => (values[values.len() - 1] - values[0]).max(0.0),
        AggregateFn::Rate => {
            if timed.len() < 2 {
                return 0.0;
            }
            let first = timed[0];
            let last = timed[timed.len() - 1];
            let seconds = (last.0 - first.0).num_milliseconds() as f64 / 1000.0;
            if seconds > 0.0 {
                (last.1 - first.1) / seconds
            } else {
                0.0
            }
        }
        AggregateFn::Irate => {
            if timed.len() < 2 {
                return 0.0;
            }
            let prev = timed[timed.len() - 2];
            let last = timed[timed.len() - 1];
            let seconds = (last.0 - prev.0).num_milliseconds() as f64 / 1000.0;
            if seconds > 0.0 {
                (last.1 - prev.1) / seconds
            } else {
                0.0
            }
        }
    }
}

/// Nearest-rank percentile over an unsorted slice.
pub fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((sorted.len() as f64 * pct / 100.0) as usize).min(sorted.len() - 1);
    sorted[idx]
}

fn fill(
    points: Vec<AggregatedPoint>,
    interval: Duration,
    fill_value: f64,
) -> Vec<AggregatedPoint> {
    let mut filled = Vec::with_capacity(points.len());
    for i in 0..points.len() {
        filled.push(points[i].clone());
        if i + 1 < points.len() {
            let mut expected = points[i].timestamp + interval;
            while expected < points[i + 1].timestamp {
                filled.push(AggregatedPoint {
                    timestamp: expected,
                    value: fill_value,
                    count: 0,
                    min: None,
                    max: None,
                });
                expected += interval;
            }
        }
    }
    filled
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    // -------------------------------------------------------------------
    // Interval parsing and bucket keys
    // -------------------------------------------------------------------

    #[test]
    fn interval_strings_parse() {
        assert_eq!(parse_interval("30s"), Some(Duration::seconds(30)));
        assert_eq!(parse_interval("5m"), Some(Duration::minutes(5)));
        assert_eq!(parse_interval("1h"), Some(Duration::hours(1)));
        assert_eq!(parse_interval("2d"), Some(Duration::days(2)));
        assert_eq!(parse_interval("1w"), Some(Duration::weeks(1)));
        assert_eq!(parse_interval("1M"), Some(Duration::days(30)));
        assert_eq!(parse_interval("x"), None);
        assert_eq!(parse_interval("5y"), None);
        assert_eq!(parse_interval("0m"), None);
    }

    #[test]
    fn bucket_keys_floor_to_interval() {
        let interval = Duration::minutes(5);
        assert_eq!(bucket_key(ts(0), interval), ts(0));
        assert_eq!(bucket_key(ts(299), interval), ts(0));
        assert_eq!(bucket_key(ts(300), interval), ts(300));
        assert_eq!(bucket_key(ts(754), interval), ts(600));
    }

    // -------------------------------------------------------------------
    // Reducers
    // -------------------------------------------------------------------

    #[test]
    fn basic_reducers() {
        let agg = Aggregator::new();
        let points = vec![(ts(10), 1.0), (ts(20), 2.0), (ts(30), 3.0)];

        for (function, expected) in [
            (AggregateFn::Sum, 6.0),
            (AggregateFn::Avg, 2.0),
            (AggregateFn::Min, 1.0),
            (AggregateFn::Max, 3.0),
            (AggregateFn::Count, 3.0),
            (AggregateFn::First, 1.0),
            (AggregateFn::Last, 3.0),
            (AggregateFn::Delta, 2.0),
            (AggregateFn::Increase, 2.0),
        ] {
            let result = agg.aggregate(&points, "1h", function, false, 0.0);
            assert_eq!(result.len(), 1);
            assert_eq!(result[0].value, expected, "{function:?}");
        }
    }

    #[test]
    fn increase_clamps_at_zero() {
        let agg = Aggregator::new();
        let points = vec![(ts(10), 5.0), (ts(20), 2.0)];
        let result = agg.aggregate(&points, "1h", AggregateFn::Increase, false, 0.0);
        assert_eq!(result[0].value, 0.0);
        let delta = agg.aggregate(&points, "1h", AggregateFn::Delta, false, 0.0);
        assert_eq!(delta[0].value, -3.0);
    }

    #[test]
    fn rate_uses_elapsed_seconds() {
        let agg = Aggregator::new();
        // 100 -> 160 over 60 seconds = 1/sec
        let points = vec![(ts(0), 100.0), (ts(30), 120.0), (ts(60), 160.0)];
        let result = agg.aggregate(&points, "1h", AggregateFn::Rate, false, 0.0);
        assert_eq!(result[0].value, 1.0);
    }

    #[test]
    fn irate_uses_last_two_samples() {
        let agg = Aggregator::new();
        // last two: 120 -> 160 over 30 seconds
        let points = vec![(ts(0), 100.0), (ts(30), 120.0), (ts(60), 160.0)];
        let result = agg.aggregate(&points, "1h", AggregateFn::Irate, false, 0.0);
        assert!((result[0].value - 4.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn percentiles_nearest_rank() {
        let values: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert_eq!(percentile(&values, 50.0), 51.0);
        assert_eq!(percentile(&values, 95.0), 96.0);
        assert_eq!(percentile(&values, 99.0), 100.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn p95_over_buckets() {
        let agg = Aggregator::new();
        let points: Vec<(DateTime<Utc>, f64)> =
            (0..100).map(|i| (ts(i), i as f64)).collect();
        let result = agg.aggregate(&points, "1h", AggregateFn::P95, false, 0.0);
        assert_eq!(result[0].value, 95.0);
    }

    // -------------------------------------------------------------------
    // Bucketing and gap fill
    // -------------------------------------------------------------------

    #[test]
    fn points_split_into_interval_buckets() {
        let agg = Aggregator::new();
        let points = vec![
            (ts(0), 1.0),
            (ts(30), 3.0),
            (ts(60), 10.0),
            (ts(120), 20.0),
        ];
        let result = agg.aggregate(&points, "1m", AggregateFn::Avg, false, 0.0);
        assert_eq!(result.len(), 3);
        assert_eq!(result[0].value, 2.0);
        assert_eq!(result[0].count, 2);
        assert_eq!(result[1].value, 10.0);
        assert_eq!(result[2].value, 20.0);
    }

    #[test]
    fn gap_fill_inserts_zero_count_buckets() {
        let agg = Aggregator::new();
        // Buckets at 0 and 180 with a 1m interval: two gaps
        let points = vec![(ts(0), 1.0), (ts(180), 4.0)];
        let result = agg.aggregate(&points, "1m", AggregateFn::Sum, true, 0.0);
        assert_eq!(result.len(), 4);
        assert_eq!(result[1].count, 0);
        assert_eq!(result[1].value, 0.0);
        assert_eq!(result[2].count, 0);
    }

    #[test]
    fn empty_input_aggregates_to_empty() {
        let agg = Aggregator::new();
        assert!(agg.aggregate(&[], "1m", AggregateFn::Sum, true, 0.0).is_empty());
    }

    // -------------------------------------------------------------------
    // Comparison and downsampling
    // -------------------------------------------------------------------

    #[test]
    fn compare_periods_reports_trend() {
        let agg = Aggregator::new();
        let current = vec![(ts(0), 30.0)];
        let previous = vec![(ts(0), 20.0)];
        let cmp = agg.compare_periods(&current, &previous, "1h", AggregateFn::Sum);
        assert_eq!(cmp.change, 10.0);
        assert_eq!(cmp.change_percent, 50.0);
        assert_eq!(cmp.trend, Trend::Up);

        let cmp = agg.compare_periods(&previous, &current, "1h", AggregateFn::Sum);
        assert_eq!(cmp.trend, Trend::Down);

        let cmp = agg.compare_periods(&[], &[], "1h", AggregateFn::Sum);
        assert_eq!(cmp.trend, Trend::Stable);
    }

    #[test]
    fn downsample_preserves_length_bound() {
        let agg = Aggregator::new();
        let points: Vec<AggregatedPoint> = (0..1000)
            .map(|i| AggregatedPoint {
                timestamp: ts(i),
                value: i as f64,
                count: 1,
                min: None,
                max: None,
            })
            .collect();

        let down = agg.downsample(points.clone(), 100);
        assert!(down.len() <= 101);
        assert_eq!(down[0].value, 0.0);

        // Already small series pass through
        let small = agg.downsample(points[..10].to_vec(), 100);
        assert_eq!(small.len(), 10);
    }
}
