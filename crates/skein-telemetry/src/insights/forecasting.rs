//! Forecasting: project metric series forward.
//!
//! Three methods: least-squares linear regression (confidence band from
//! residual stdev), simple exponential smoothing (flat projection), and
//! Holt's linear trend. `auto` picks Holt when the mean of the second half
//! of the series drifts more than 5% (relative) from the first half, and
//! linear regression otherwise.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// z-score for a 95% confidence band.
const Z_95: f64 = 1.96;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// One forecast point with its confidence band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

/// Trend direction over the forecast horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Up,
    Down,
    Stable,
}

/// A complete forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub metric: String,
    pub method: String,
    pub points: Vec<ForecastPoint>,
    pub confidence: f64,
    pub trend: TrendDirection,
    pub trend_strength: f64,
}

impl Forecast {
    fn empty(metric: &str, method: &str) -> Self {
        Self {
            metric: metric.to_string(),
            method: method.to_string(),
            points: Vec::new(),
            confidence: 0.0,
            trend: TrendDirection::Stable,
            trend_strength: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Forecaster
// ---------------------------------------------------------------------------

/// Stateless series forecaster.
#[derive(Debug, Default, Clone, Copy)]
pub struct Forecaster;

impl Forecaster {
    pub fn new() -> Self {
        Self
    }

    /// Least-squares linear regression projection.
    pub fn linear_regression(
        &self,
        values: &[f64],
        timestamps: Option<&[DateTime<Utc>]>,
        periods: usize,
        metric: &str,
    ) -> Forecast {
        if values.len() < 3 {
            return Forecast::empty(metric, "linear_regression");
        }

        let n = values.len();
        let x_mean = (n as f64 - 1.0) / 2.0;
        let y_mean = values.iter().sum::<f64>() / n as f64;

        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for (i, &y) in values.iter().enumerate() {
            let dx = i as f64 - x_mean;
            numerator += dx * (y - y_mean);
            denominator += dx * dx;
        }
        let slope = if denominator != 0.0 {
            numerator / denominator
        } else {
            0.0
        };
        let intercept = y_mean - slope * x_mean;

        // Residual stdev drives the confidence band
        let residuals: Vec<f64> = values
            .iter()
            .enumerate()
            .map(|(i, &y)| y - (intercept + slope * i as f64))
            .collect();
        let std_error = sample_stdev(&residuals);

        let (last_ts, interval) = series_cadence(timestamps);
        let margin_base = Z_95 * std_error * (1.0 + 1.0 / n as f64).sqrt();

        let points = (0..periods)
            .map(|i| {
                let predicted = intercept + slope * (n + i) as f64;
                ForecastPoint {
                    timestamp: last_ts + interval * (i as i32 + 1),
                    value: predicted,
                    lower_bound: predicted - margin_base,
                    upper_bound: predicted + margin_base,
                }
            })
            .collect();

        Forecast {
            metric: metric.to_string(),
            method: "linear_regression".to_string(),
            points,
            confidence: 0.8,
            trend: direction(slope),
            trend_strength: slope.abs(),
        }
    }

    /// Simple exponential smoothing: a flat projection of the smoothed
    /// level, with a band widening by `sqrt(horizon)`.
    pub fn exponential_smoothing(
        &self,
        values: &[f64],
        timestamps: Option<&[DateTime<Utc>]>,
        alpha: f64,
        periods: usize,
        metric: &str,
    ) -> Forecast {
        if values.len() < 3 {
            return Forecast::empty(metric, "exponential_smoothing");
        }

        let mut smoothed = values[0];
        let mut errors = Vec::with_capacity(values.len());
        for &value in &values[1..] {
            errors.push((value - smoothed).abs());
            smoothed = alpha * value + (1.0 - alpha) * smoothed;
        }
        let std_error = sample_stdev(&errors);

        let (last_ts, interval) = series_cadence(timestamps);
        let points = (0..periods)
            .map(|i| {
                let margin = Z_95 * std_error * ((i + 1) as f64).sqrt();
                ForecastPoint {
                    timestamp: last_ts + interval * (i as i32 + 1),
                    value: smoothed,
                    lower_bound: smoothed - margin,
                    upper_bound: smoothed + margin,
                }
            })
            .collect();

        Forecast {
            metric: metric.to_string(),
            method: "exponential_smoothing".to_string(),
            points,
            confidence: 0.75,
            trend: TrendDirection::Stable,
            trend_strength: 0.0,
        }
    }

    /// Holt's linear trend method: level and trend updated per sample.
    pub fn holt_linear(
        &self,
        values: &[f64],
        timestamps: Option<&[DateTime<Utc>]>,
        alpha: f64,
        beta: f64,
        periods: usize,
        metric: &str,
    ) -> Forecast {
        if values.len() < 3 {
            return Forecast::empty(metric, "holt_linear");
        }

        let mut level = values[0];
        let mut trend = values[1] - values[0];
        let mut errors = Vec::with_capacity(values.len());

        for &value in &values[1..] {
            errors.push((value - (level + trend)).abs());
            let prev_level = level;
            level = alpha * value + (1.0 - alpha) * (level + trend);
            trend = beta * (level - prev_level) + (1.0 - beta) * trend;
        }
        let std_error = sample_stdev(&errors);

        let (last_ts, interval) = series_cadence(timestamps);
        let points = (0..periods)
            .map(|i| {
                let value = level + (i as f64 + 1.0) * trend;
                let margin = Z_95 * std_error * ((i + 1) as f64).sqrt();
                ForecastPoint {
                    timestamp: last_ts + interval * (i as i32 + 1),
                    value,
                    lower_bound: value - margin,
                    upper_bound: value + margin,
                }
            })
            .collect();

        Forecast {
            metric: metric.to_string(),
            method: "holt_linear".to_string(),
            points,
            confidence: 0.8,
            trend: direction(trend),
            trend_strength: trend.abs(),
        }
    }

    /// Pick a method automatically: Holt when the second half's mean
    /// drifts more than 5% (relative) from the first half's, otherwise
    /// linear regression.
    pub fn auto(
        &self,
        values: &[f64],
        timestamps: Option<&[DateTime<Utc>]>,
        periods: usize,
        metric: &str,
    ) -> Forecast {
        if values.len() < 6 {
            return self.linear_regression(values, timestamps, periods, metric);
        }

        let mid = values.len() / 2;
        let first = values[..mid].iter().sum::<f64>() / mid as f64;
        let second = values[mid..].iter().sum::<f64>() / (values.len() - mid) as f64;

        let drift = if first.abs() > f64::EPSILON {
            ((second - first) / first).abs()
        } else {
            0.0
        };

        if drift > 0.05 {
            self.holt_linear(values, timestamps, 0.3, 0.1, periods, metric)
        } else {
            self.linear_regression(values, timestamps, periods, metric)
        }
    }
}

fn direction(slope: f64) -> TrendDirection {
    if slope > 0.01 {
        TrendDirection::Up
    } else if slope < -0.01 {
        TrendDirection::Down
    } else {
        TrendDirection::Stable
    }
}

fn sample_stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values
        .iter()
        .map(|v| (v - mean) * (v - mean))
        .sum::<f64>()
        / (values.len() - 1) as f64;
    variance.sqrt()
}

/// Last timestamp and sample interval of the series (defaults: now, 1h).
fn series_cadence(timestamps: Option<&[DateTime<Utc>]>) -> (DateTime<Utc>, Duration) {
    match timestamps {
        Some(ts) if ts.len() >= 2 => (ts[ts.len() - 1], ts[ts.len() - 1] - ts[ts.len() - 2]),
        Some(ts) if ts.len() == 1 => (ts[0], Duration::hours(1)),
        _ => (Utc::now(), Duration::hours(1)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn timestamps(n: usize, step_minutes: i64) -> Vec<DateTime<Utc>> {
        let base = Utc::now();
        (0..n)
            .map(|i| base + Duration::minutes(i as i64 * step_minutes))
            .collect()
    }

    // -------------------------------------------------------------------
    // Linear regression
    // -------------------------------------------------------------------

    #[test]
    fn linear_fit_extends_a_perfect_line() {
        let forecaster = Forecaster::new();
        let values: Vec<f64> = (0..10).map(|i| 2.0 * i as f64 + 1.0).collect();
        let forecast = forecaster.linear_regression(&values, None, 3, "m");

        assert_eq!(forecast.method, "linear_regression");
        assert_eq!(forecast.points.len(), 3);
        // Next values continue the line: 21, 23, 25
        assert!((forecast.points[0].value - 21.0).abs() < 1e-9);
        assert!((forecast.points[2].value - 25.0).abs() < 1e-9);
        assert_eq!(forecast.trend, TrendDirection::Up);
        // Perfect fit: zero-width band
        assert!((forecast.points[0].upper_bound - forecast.points[0].value).abs() < 1e-9);
    }

    #[test]
    fn noisy_series_gets_a_wider_band() {
        let forecaster = Forecaster::new();
        let values = vec![10.0, 14.0, 9.0, 15.0, 8.0, 16.0, 9.0, 15.0, 10.0, 14.0];
        let forecast = forecaster.linear_regression(&values, None, 1, "m");

        let point = &forecast.points[0];
        assert!(point.upper_bound > point.value);
        assert!(point.lower_bound < point.value);
    }

    #[test]
    fn falling_series_trends_down() {
        let forecaster = Forecaster::new();
        let values: Vec<f64> = (0..10).map(|i| 100.0 - 3.0 * i as f64).collect();
        let forecast = forecaster.linear_regression(&values, None, 2, "m");
        assert_eq!(forecast.trend, TrendDirection::Down);
        assert!(forecast.trend_strength > 2.9);
    }

    #[test]
    fn too_short_series_yields_empty_forecast() {
        let forecaster = Forecaster::new();
        let forecast = forecaster.linear_regression(&[1.0, 2.0], None, 5, "m");
        assert!(forecast.points.is_empty());
    }

    #[test]
    fn forecast_timestamps_continue_the_cadence() {
        let forecaster = Forecaster::new();
        let ts = timestamps(10, 5);
        let values: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let forecast = forecaster.linear_regression(&values, Some(&ts), 2, "m");

        assert_eq!(forecast.points[0].timestamp, ts[9] + Duration::minutes(5));
        assert_eq!(forecast.points[1].timestamp, ts[9] + Duration::minutes(10));
    }

    // -------------------------------------------------------------------
    // Exponential smoothing
    // -------------------------------------------------------------------

    #[test]
    fn ses_projects_flat() {
        let forecaster = Forecaster::new();
        let values = vec![10.0, 12.0, 11.0, 10.5, 11.5, 11.0];
        let forecast = forecaster.exponential_smoothing(&values, None, 0.3, 4, "m");

        assert_eq!(forecast.points.len(), 4);
        let first = forecast.points[0].value;
        assert!(forecast.points.iter().all(|p| p.value == first));
        // Band widens with horizon
        let w0 = forecast.points[0].upper_bound - forecast.points[0].lower_bound;
        let w3 = forecast.points[3].upper_bound - forecast.points[3].lower_bound;
        assert!(w3 > w0);
    }

    // -------------------------------------------------------------------
    // Holt linear
    // -------------------------------------------------------------------

    #[test]
    fn holt_captures_a_linear_trend() {
        let forecaster = Forecaster::new();
        let values: Vec<f64> = (0..20).map(|i| 5.0 + 2.0 * i as f64).collect();
        let forecast = forecaster.holt_linear(&values, None, 0.3, 0.1, 3, "m");

        assert_eq!(forecast.trend, TrendDirection::Up);
        // Projections keep climbing
        assert!(forecast.points[1].value > forecast.points[0].value);
        assert!(forecast.points[2].value > forecast.points[1].value);
        // And land in the right neighborhood of the true line (45, 47, 49)
        assert!((forecast.points[0].value - 45.0).abs() < 3.0);
    }

    // -------------------------------------------------------------------
    // Auto selection
    // -------------------------------------------------------------------

    #[test]
    fn auto_picks_holt_on_half_mean_drift() {
        let forecaster = Forecaster::new();
        // Second half 50% above the first half
        let mut values = vec![10.0; 10];
        values.extend(vec![15.0; 10]);
        let forecast = forecaster.auto(&values, None, 3, "m");
        assert_eq!(forecast.method, "holt_linear");
    }

    #[test]
    fn auto_picks_linear_on_stable_series() {
        let forecaster = Forecaster::new();
        let values = vec![10.0, 10.1, 9.9, 10.0, 10.2, 9.8, 10.1, 10.0, 9.9, 10.0];
        let forecast = forecaster.auto(&values, None, 3, "m");
        assert_eq!(forecast.method, "linear_regression");
    }

    #[test]
    fn forecast_roundtrip() {
        let forecaster = Forecaster::new();
        let values: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let forecast = forecaster.linear_regression(&values, None, 2, "m");

        let json = serde_json::to_string(&forecast).unwrap();
        let parsed: Forecast = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, forecast);
    }
}
