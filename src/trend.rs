//! Latency trend over an ordered population (supplement to C9, grounded in
//! `statistical_analysis.py`'s `analyze_trace_patterns`).

use serde::{Deserialize, Serialize};

use crate::model::Trace;

const R_SQUARED_FLOOR: f64 = 0.3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrendReport {
    pub sample_count: usize,
    pub slope_ms_per_step: f64,
    pub r_squared: f64,
    pub direction: String,
}

/// Ordinary-least-squares slope of `duration_ms` against position in
/// `traces` (caller supplies traces already ordered by time). Direction is
/// `stable` unless the fit explains at least `R_SQUARED_FLOOR` of the
/// variance, since a noisy near-zero-confidence slope is not a trend.
pub fn latency_trend(traces: &[Trace]) -> TrendReport {
    let n = traces.len();
    if n < 2 {
        return TrendReport {
            sample_count: n,
            slope_ms_per_step: 0.0,
            r_squared: 0.0,
            direction: "stable".to_string(),
        };
    }

    let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let ys: Vec<f64> = traces.iter().map(|t| t.duration_ms).collect();
    let n_f = n as f64;

    let x_mean = xs.iter().sum::<f64>() / n_f;
    let y_mean = ys.iter().sum::<f64>() / n_f;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    for i in 0..n {
        let dx = xs[i] - x_mean;
        cov += dx * (ys[i] - y_mean);
        var_x += dx * dx;
    }

    let slope = if var_x > 0.0 { cov / var_x } else { 0.0 };
    let intercept = y_mean - slope * x_mean;

    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for i in 0..n {
        let predicted = intercept + slope * xs[i];
        ss_res += (ys[i] - predicted).powi(2);
        ss_tot += (ys[i] - y_mean).powi(2);
    }
    let r_squared = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };

    let direction = if r_squared < R_SQUARED_FLOOR {
        "stable"
    } else if slope > 0.0 {
        "degrading"
    } else if slope < 0.0 {
        "improving"
    } else {
        "stable"
    };

    TrendReport {
        sample_count: n,
        slope_ms_per_step: slope,
        r_squared,
        direction: direction.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(duration_ms: f64) -> Trace {
        Trace {
            trace_id: "t".to_string(),
            project: "p".to_string(),
            duration_ms,
            spans: vec![],
        }
    }

    #[test]
    fn fewer_than_two_traces_is_stable() {
        let report = latency_trend(&[trace(10.0)]);
        assert_eq!(report.direction, "stable");
    }

    #[test]
    fn monotonically_increasing_durations_are_degrading() {
        let traces: Vec<Trace> = (0..10).map(|i| trace(10.0 + i as f64 * 5.0)).collect();
        let report = latency_trend(&traces);
        assert_eq!(report.direction, "degrading");
        assert!(report.slope_ms_per_step > 0.0);
        assert!(report.r_squared > 0.9);
    }

    #[test]
    fn monotonically_decreasing_durations_are_improving() {
        let traces: Vec<Trace> = (0..10).map(|i| trace(100.0 - i as f64 * 5.0)).collect();
        let report = latency_trend(&traces);
        assert_eq!(report.direction, "improving");
        assert!(report.slope_ms_per_step < 0.0);
    }

    #[test]
    fn noisy_flat_durations_are_stable() {
        let samples = [50.0, 48.0, 52.0, 49.0, 51.0, 47.0, 53.0, 50.0];
        let traces: Vec<Trace> = samples.iter().map(|&d| trace(d)).collect();
        let report = latency_trend(&traces);
        assert_eq!(report.direction, "stable");
    }
}
