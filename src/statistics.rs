//! Percentiles, per-span stats, and Z-score anomaly detection across a
//! trace population (C5).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::Trace;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Stats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub stdev: f64,
    pub variance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PopulationStats {
    #[serde(flatten)]
    pub overall: Stats,
    pub per_span_stats: HashMap<String, Stats>,
}

/// Percentile by index `floor(count * q)`, clamped to the last index. Not a
/// continuous quantile estimator — the index formula is load-bearing for
/// the exact numeric expectations this crate is tested against.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64) * q).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn compute_stats(samples: &[f64]) -> Stats {
    if samples.is_empty() {
        return Stats::default();
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mean = samples.iter().sum::<f64>() / samples.len() as f64;

    let variance = if samples.len() > 1 {
        let sum_sq_dev: f64 = samples.iter().map(|v| (v - mean).powi(2)).sum();
        sum_sq_dev / (samples.len() - 1) as f64
    } else {
        0.0
    };

    Stats {
        count: samples.len(),
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        mean,
        median: percentile(&sorted, 0.5),
        p90: percentile(&sorted, 0.9),
        p95: percentile(&sorted, 0.95),
        p99: percentile(&sorted, 0.99),
        stdev: variance.sqrt(),
        variance,
    }
}

/// Population-level latency statistics: trace-level durations plus a
/// per-span-name breakdown across every occurrence in the population.
pub fn latency_stats(traces: &[Trace]) -> PopulationStats {
    let durations: Vec<f64> = traces.iter().map(|t| t.duration_ms).collect();
    let overall = compute_stats(&durations);

    let mut by_name: HashMap<String, Vec<f64>> = HashMap::new();
    for trace in traces {
        for span in &trace.spans {
            if let Some(d) = span.duration_ms() {
                by_name.entry(span.name.clone()).or_default().push(d);
            }
        }
    }
    let per_span_stats = by_name
        .into_iter()
        .map(|(name, samples)| (name, compute_stats(&samples)))
        .collect();

    PopulationStats {
        overall,
        per_span_stats,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyType {
    Slow,
    Fast,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnomalousSpan {
    pub name: String,
    pub z_score: f64,
    pub duration_ms: f64,
    pub anomaly_type: AnomalyType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnomalyReport {
    pub is_anomaly: bool,
    pub z_score: f64,
    pub target_duration: f64,
    pub baseline_mean: f64,
    pub baseline_stdev: f64,
    pub threshold_sigma: f64,
    pub deviation_ms: f64,
    pub anomalous_spans: Vec<AnomalousSpan>,
}

const SPAN_NOISE_FLOOR_MS: f64 = 50.0;

fn z_score(value: f64, mean: f64, stdev: f64) -> f64 {
    if stdev == 0.0 {
        if (value - mean).abs() < 1e-9 {
            0.0
        } else if value > mean {
            100.0
        } else {
            -100.0
        }
    } else {
        (value - mean) / stdev
    }
}

/// Computes a Z-score for the target trace against baseline population
/// statistics, plus a per-span-occurrence anomaly check: every span in the
/// target is scored individually against its name's baseline stats, so one
/// name can contribute more than one anomalous entry.
pub fn anomaly(
    baseline: &PopulationStats,
    target: &Trace,
    threshold_sigma: f64,
) -> AnomalyReport {
    let z = z_score(target.duration_ms, baseline.overall.mean, baseline.overall.stdev);
    let deviation_ms = target.duration_ms - baseline.overall.mean;

    // Per-span-occurrence, not per-name-sum: each span in the target is its
    // own sample against the baseline's per-span-name stats, matching
    // `_detect_latency_anomalies_impl`'s per-span loop over `target_data["spans"]`.
    let mut anomalous_spans = Vec::new();
    for span in &target.spans {
        let Some(duration) = span.duration_ms() else {
            continue;
        };
        let Some(span_stats) = baseline.per_span_stats.get(span.name.as_str()) else {
            continue;
        };
        let span_z = z_score(duration, span_stats.mean, span_stats.stdev);
        if span_z.abs() > threshold_sigma && duration.abs() > SPAN_NOISE_FLOOR_MS {
            anomalous_spans.push(AnomalousSpan {
                name: span.name.clone(),
                z_score: span_z,
                duration_ms: duration,
                anomaly_type: if span_z >= 0.0 {
                    AnomalyType::Slow
                } else {
                    AnomalyType::Fast
                },
            });
        }
    }
    anomalous_spans.sort_by(|a, b| b.z_score.abs().partial_cmp(&a.z_score.abs()).unwrap());

    AnomalyReport {
        is_anomaly: z.abs() > threshold_sigma,
        z_score: z,
        target_duration: target.duration_ms,
        baseline_mean: baseline.overall.mean,
        baseline_stdev: baseline.overall.stdev,
        threshold_sigma,
        deviation_ms,
        anomalous_spans,
    }
}
