//! Anomaly detection over metric series.
//!
//! Four detectors share a sensitivity knob in `[0, 1]`:
//! - z-score: `|x - mean| / stdev > 4 - 3*sensitivity`;
//! - IQR: outside `[Q1 - k*IQR, Q3 + k*IQR]` with `k = 2.5 - 1.5*sensitivity`;
//! - moving average: the z-score test over a trailing window;
//! - trend change: slope sign flip between adjacent windows.
//!
//! `detect_all` runs every detector and de-duplicates by
//! `(timestamp, kind)`, keeping the highest-confidence finding.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Kind of detected anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    Spike,
    Drop,
    TrendChange,
    Outlier,
}

/// Severity derived from the deviation magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// One detected anomaly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub metric: String,
    pub kind: AnomalyKind,
    pub severity: AnomalySeverity,
    pub value: f64,
    pub expected_value: f64,
    /// Standard deviations (or IQR multiples) from the expectation.
    pub deviation: f64,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
}

// ---------------------------------------------------------------------------
// AnomalyDetector
// ---------------------------------------------------------------------------

/// Detector with a shared sensitivity setting.
pub struct AnomalyDetector {
    sensitivity: f64,
    min_data_points: usize,
    z_threshold: f64,
}

impl AnomalyDetector {
    /// `sensitivity` in `[0, 1]`: 0 = least sensitive, 1 = most.
    pub fn new(sensitivity: f64) -> Self {
        let sensitivity = sensitivity.clamp(0.0, 1.0);
        Self {
            sensitivity,
            min_data_points: 10,
            z_threshold: 4.0 - sensitivity * 3.0,
        }
    }

    /// Z-score detector over the whole series.
    pub fn detect_zscore(
        &self,
        values: &[f64],
        timestamps: Option<&[DateTime<Utc>]>,
        metric: &str,
    ) -> Vec<Anomaly> {
        if values.len() < self.min_data_points {
            return Vec::new();
        }

        let mean = mean(values);
        let stdev = stdev(values, mean);
        if stdev == 0.0 {
            return Vec::new();
        }

        values
            .iter()
            .enumerate()
            .filter_map(|(i, &value)| {
                let z = (value - mean).abs() / stdev;
                if z <= self.z_threshold {
                    return None;
                }
                Some(Anomaly {
                    metric: metric.to_string(),
                    kind: if value > mean {
                        AnomalyKind::Spike
                    } else {
                        AnomalyKind::Drop
                    },
                    severity: severity_for(z),
                    value,
                    expected_value: mean,
                    deviation: z,
                    timestamp: at(timestamps, i),
                    description: format!(
                        "value {value:.2} is {z:.1} standard deviations from mean {mean:.2}"
                    ),
                    confidence: (z / 5.0).min(1.0),
                })
            })
            .collect()
    }

    /// Interquartile-range detector.
    pub fn detect_iqr(
        &self,
        values: &[f64],
        timestamps: Option<&[DateTime<Utc>]>,
        metric: &str,
    ) -> Vec<Anomaly> {
        if values.len() < self.min_data_points {
            return Vec::new();
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = sorted.len();
        let q1 = sorted[n / 4];
        let q3 = sorted[(3 * n) / 4];
        let iqr = q3 - q1;

        let multiplier = 2.5 - self.sensitivity * 1.5;
        let lower = q1 - multiplier * iqr;
        let upper = q3 + multiplier * iqr;
        let midpoint = (q1 + q3) / 2.0;

        values
            .iter()
            .enumerate()
            .filter_map(|(i, &value)| {
                if value >= lower && value <= upper {
                    return None;
                }
                let deviation = if iqr > 0.0 {
                    (value - midpoint).abs() / iqr
                } else {
                    0.0
                };
                Some(Anomaly {
                    metric: metric.to_string(),
                    kind: if value > upper {
                        AnomalyKind::Spike
                    } else {
                        AnomalyKind::Drop
                    },
                    severity: severity_for(deviation),
                    value,
                    expected_value: midpoint,
                    deviation,
                    timestamp: at(timestamps, i),
                    description: format!(
                        "value {value:.2} is outside IQR bounds [{lower:.2}, {upper:.2}]"
                    ),
                    confidence: (deviation / 3.0).min(1.0),
                })
            })
            .collect()
    }

    /// Moving-average detector with a trailing window.
    pub fn detect_moving_average(
        &self,
        values: &[f64],
        timestamps: Option<&[DateTime<Utc>]>,
        window: usize,
        metric: &str,
    ) -> Vec<Anomaly> {
        if values.len() < window + self.min_data_points {
            return Vec::new();
        }

        let mut anomalies = Vec::new();
        for i in window..values.len() {
            let slice = &values[i - window..i];
            let ma = mean(slice);
            let sd = stdev(slice, ma);
            if sd == 0.0 {
                continue;
            }

            let value = values[i];
            let z = (value - ma).abs() / sd;
            if z > self.z_threshold {
                anomalies.push(Anomaly {
                    metric: metric.to_string(),
                    kind: if value > ma {
                        AnomalyKind::Spike
                    } else {
                        AnomalyKind::Drop
                    },
                    severity: severity_for(z),
                    value,
                    expected_value: ma,
                    deviation: z,
                    timestamp: at(timestamps, i),
                    description: format!(
                        "value {value:.2} deviates from moving average {ma:.2}"
                    ),
                    confidence: (z / 5.0).min(1.0),
                });
            }
        }
        anomalies
    }

    /// Trend-change detector: slope sign flips between adjacent windows.
    pub fn detect_trend_change(
        &self,
        values: &[f64],
        timestamps: Option<&[DateTime<Utc>]>,
        window: usize,
        metric: &str,
    ) -> Vec<Anomaly> {
        if window == 0 || values.len() < window * 2 {
            return Vec::new();
        }

        let mut anomalies = Vec::new();
        for i in window..=(values.len() - window) {
            let before = &values[i - window..i];
            let after = &values[i..i + window];

            let before_slope = (before[before.len() - 1] - before[0]) / window as f64;
            let after_slope = (after[after.len() - 1] - after[0]) / window as f64;

            if before_slope * after_slope < 0.0 {
                let magnitude = (after_slope - before_slope).abs();
                if magnitude > 0.1 {
                    anomalies.push(Anomaly {
                        metric: metric.to_string(),
                        kind: AnomalyKind::TrendChange,
                        severity: AnomalySeverity::Medium,
                        value: values[i],
                        expected_value: values[i - 1] + before_slope,
                        deviation: magnitude,
                        timestamp: at(timestamps, i),
                        description: format!(
                            "trend changed from {before_slope:.3} to {after_slope:.3}"
                        ),
                        confidence: magnitude.min(1.0),
                    });
                }
            }
        }
        anomalies
    }

    /// Run every detector; de-duplicate by `(timestamp, kind)` keeping the
    /// highest confidence; sort by confidence descending.
    pub fn detect_all(
        &self,
        values: &[f64],
        timestamps: Option<&[DateTime<Utc>]>,
        metric: &str,
    ) -> Vec<Anomaly> {
        let mut all = Vec::new();
        all.extend(self.detect_zscore(values, timestamps, metric));
        all.extend(self.detect_iqr(values, timestamps, metric));
        all.extend(self.detect_moving_average(values, timestamps, 5, metric));
        all.extend(self.detect_trend_change(values, timestamps, 10, metric));

        let mut best: HashMap<(DateTime<Utc>, AnomalyKind), Anomaly> = HashMap::new();
        for anomaly in all {
            let key = (anomaly.timestamp, anomaly.kind);
            match best.get(&key) {
                Some(existing) if existing.confidence >= anomaly.confidence => {}
                _ => {
                    best.insert(key, anomaly);
                }
            }
        }

        let mut deduped: Vec<Anomaly> = best.into_values().collect();
        deduped.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        deduped
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(0.5)
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn stdev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let variance = values
        .iter()
        .map(|v| (v - mean) * (v - mean))
        .sum::<f64>()
        / (values.len() - 1) as f64;
    variance.sqrt()
}

fn severity_for(deviation: f64) -> AnomalySeverity {
    if deviation > 5.0 {
        AnomalySeverity::Critical
    } else if deviation > 4.0 {
        AnomalySeverity::High
    } else if deviation > 3.0 {
        AnomalySeverity::Medium
    } else {
        AnomalySeverity::Low
    }
}

fn at(timestamps: Option<&[DateTime<Utc>]>, index: usize) -> DateTime<Utc> {
    timestamps
        .and_then(|ts| ts.get(index).copied())
        .unwrap_or_else(Utc::now)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn timestamps(n: usize) -> Vec<DateTime<Utc>> {
        let base = Utc::now();
        (0..n).map(|i| base + Duration::minutes(i as i64)).collect()
    }

    /// Mostly-flat series with one spike injected.
    fn spiky_series() -> Vec<f64> {
        let mut values = vec![10.0, 11.0, 9.0, 10.5, 10.0, 9.5, 10.2, 9.8, 10.1, 10.0, 9.9];
        values.push(50.0);
        values.extend([10.0, 10.3, 9.7]);
        values
    }

    // -------------------------------------------------------------------
    // Constant series property
    // -------------------------------------------------------------------

    #[test]
    fn constant_series_yields_no_anomalies_for_any_detector() {
        let detector = AnomalyDetector::new(0.9);
        let values = vec![5.0; 30];
        let ts = timestamps(30);

        assert!(detector.detect_zscore(&values, Some(&ts), "m").is_empty());
        assert!(detector.detect_iqr(&values, Some(&ts), "m").is_empty());
        assert!(
            detector
                .detect_moving_average(&values, Some(&ts), 5, "m")
                .is_empty()
        );
        assert!(
            detector
                .detect_trend_change(&values, Some(&ts), 10, "m")
                .is_empty()
        );
        assert!(detector.detect_all(&values, Some(&ts), "m").is_empty());
    }

    // -------------------------------------------------------------------
    // Z-score
    // -------------------------------------------------------------------

    #[test]
    fn zscore_flags_the_spike() {
        let detector = AnomalyDetector::new(0.5);
        let values = spiky_series();
        let anomalies = detector.detect_zscore(&values, None, "reqs");

        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::Spike);
        assert_eq!(anomalies[0].value, 50.0);
        assert_eq!(anomalies[0].metric, "reqs");
    }

    #[test]
    fn zscore_flags_drops_below_mean() {
        let detector = AnomalyDetector::new(0.5);
        let mut values = vec![100.0; 12];
        // Perturb slightly so stdev is nonzero, then drop hard
        values[3] = 101.0;
        values[7] = 99.0;
        values.push(10.0);

        let anomalies = detector.detect_zscore(&values, None, "m");
        assert!(anomalies.iter().any(|a| a.kind == AnomalyKind::Drop));
    }

    #[test]
    fn short_series_is_ignored() {
        let detector = AnomalyDetector::new(0.5);
        assert!(detector.detect_zscore(&[1.0, 100.0], None, "m").is_empty());
    }

    #[test]
    fn sensitivity_lowers_the_threshold() {
        let relaxed = AnomalyDetector::new(0.0); // threshold 4.0
        let strict = AnomalyDetector::new(1.0); // threshold 1.0

        // A moderate outlier around 2-3 sigma
        let mut values = vec![10.0, 10.2, 9.8, 10.1, 9.9, 10.0, 10.3, 9.7, 10.0, 10.1];
        values.push(11.5);

        assert!(relaxed.detect_zscore(&values, None, "m").is_empty());
        assert!(!strict.detect_zscore(&values, None, "m").is_empty());
    }

    // -------------------------------------------------------------------
    // IQR
    // -------------------------------------------------------------------

    #[test]
    fn iqr_flags_extreme_outliers() {
        let detector = AnomalyDetector::new(0.5);
        let anomalies = detector.detect_iqr(&spiky_series(), None, "m");
        assert!(!anomalies.is_empty());
        assert!(anomalies.iter().all(|a| a.value == 50.0));
    }

    // -------------------------------------------------------------------
    // Moving average
    // -------------------------------------------------------------------

    #[test]
    fn moving_average_flags_local_deviation() {
        let detector = AnomalyDetector::new(0.5);
        // Gentle noise, then a local jump
        let mut values: Vec<f64> = (0..20)
            .map(|i| 10.0 + if i % 2 == 0 { 0.2 } else { -0.2 })
            .collect();
        values.push(20.0);

        let anomalies = detector.detect_moving_average(&values, None, 5, "m");
        assert!(anomalies.iter().any(|a| a.value == 20.0));
    }

    // -------------------------------------------------------------------
    // Trend change
    // -------------------------------------------------------------------

    #[test]
    fn trend_change_detects_sign_flip() {
        let detector = AnomalyDetector::new(0.5);
        // Rising then falling: clear slope inversion
        let mut values: Vec<f64> = (0..15).map(|i| i as f64 * 2.0).collect();
        values.extend((0..15).map(|i| 28.0 - i as f64 * 2.0));

        let anomalies = detector.detect_trend_change(&values, None, 10, "m");
        assert!(!anomalies.is_empty());
        assert!(anomalies.iter().all(|a| a.kind == AnomalyKind::TrendChange));
    }

    #[test]
    fn monotonic_series_has_no_trend_change() {
        let detector = AnomalyDetector::new(0.5);
        let values: Vec<f64> = (0..40).map(|i| i as f64).collect();
        assert!(
            detector
                .detect_trend_change(&values, None, 10, "m")
                .is_empty()
        );
    }

    // -------------------------------------------------------------------
    // Combined detection
    // -------------------------------------------------------------------

    #[test]
    fn detect_all_dedupes_by_timestamp_and_kind() {
        let detector = AnomalyDetector::new(0.5);
        let values = spiky_series();
        let ts = timestamps(values.len());

        let anomalies = detector.detect_all(&values, Some(&ts), "m");
        // The spike is found by multiple detectors at the same timestamp
        // and kind; only one survives
        let spikes: Vec<&Anomaly> = anomalies
            .iter()
            .filter(|a| a.kind == AnomalyKind::Spike && a.value == 50.0)
            .collect();
        assert_eq!(spikes.len(), 1);
    }

    #[test]
    fn detect_all_sorts_by_confidence() {
        let detector = AnomalyDetector::new(0.8);
        let values = spiky_series();
        let ts = timestamps(values.len());
        let anomalies = detector.detect_all(&values, Some(&ts), "m");

        for pair in anomalies.windows(2) {
            assert!(pair[0].confidence >= pair[1].confidence);
        }
    }

    #[test]
    fn severity_scales_with_deviation() {
        assert_eq!(severity_for(2.0), AnomalySeverity::Low);
        assert_eq!(severity_for(3.5), AnomalySeverity::Medium);
        assert_eq!(severity_for(4.5), AnomalySeverity::High);
        assert_eq!(severity_for(6.0), AnomalySeverity::Critical);
    }
}
