//! Rule-driven detection of retry storms, cascading timeouts, and
//! connection-pool exhaustion (C7.1–C7.3). N+1 query and serial-chain
//! detection (C7.4/C7.5) live in [`crate::diff`] since both require a
//! target-trace context and a pre-sorted span list shared between them.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::model::{Span, Trace};

const RETRY_INDICATORS: [&str; 4] = ["retry", "attempt", "backoff", "reconnect"];
const TIMEOUT_INDICATORS: [&str; 5] =
    ["timeout", "deadline", "exceeded", "timed out", "context deadline"];
const CONNECTION_INDICATORS: [&str; 5] = ["connection", "pool", "acquire", "checkout", "wait"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryStormFinding {
    pub span_name: String,
    pub count: usize,
    pub severity: Severity,
    pub backoff_detected: bool,
}

fn name_contains_any(name: &str, indicators: &[&str]) -> bool {
    let lower = name.to_lowercase();
    indicators.iter().any(|i| lower.contains(i))
}

/// Groups spans by name; a group is a retry storm if its size already
/// clears `threshold`, or its name suggests a retry AND its spans are
/// mostly sequential (at least `threshold` consecutive spans with
/// inter-span gaps in `[0, 1s]`, sorted by start time).
pub fn detect_retry_storm(trace: &Trace, threshold: usize) -> Vec<RetryStormFinding> {
    let mut by_name: HashMap<&str, Vec<&Span>> = HashMap::new();
    for span in &trace.spans {
        by_name.entry(span.name.as_str()).or_default().push(span);
    }

    let mut findings = Vec::new();
    for (name, mut spans) in by_name {
        spans.sort_by(|a, b| {
            a.start_unix
                .partial_cmp(&b.start_unix)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let size_triggers = spans.len() >= threshold;
        let name_suggests_retry = name_contains_any(name, &RETRY_INDICATORS);
        let sequential_run = name_suggests_retry && has_sequential_run(&spans, threshold);

        if !size_triggers && !sequential_run {
            continue;
        }

        let durations: Vec<f64> = spans.iter().filter_map(|s| s.duration_ms()).collect();
        let backoff_detected = is_non_decreasing_within_tolerance(&durations, 1.5);

        findings.push(RetryStormFinding {
            span_name: name.to_string(),
            count: spans.len(),
            severity: if spans.len() >= 5 {
                Severity::High
            } else {
                Severity::Medium
            },
            backoff_detected,
        });
    }
    findings
}

fn has_sequential_run(sorted_spans: &[&Span], threshold: usize) -> bool {
    if sorted_spans.len() < threshold {
        return false;
    }
    let mut run_len = 1usize;
    for window in sorted_spans.windows(2) {
        let (prev, next) = (window[0], window[1]);
        let gap = match (prev.end_unix, next.start_unix) {
            (Some(end), Some(start)) => (start - end) * 1000.0,
            _ => continue,
        };
        if (0.0..=1000.0).contains(&gap) {
            run_len += 1;
            if run_len >= threshold {
                return true;
            }
        } else {
            run_len = 1;
        }
    }
    false
}

fn is_non_decreasing_within_tolerance(durations: &[f64], tolerance: f64) -> bool {
    if durations.len() < 2 {
        return false;
    }
    durations
        .windows(2)
        .all(|w| w[1] >= w[0] || w[0] <= w[1] * tolerance)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CascadingTimeoutFinding {
    pub chain: Vec<String>,
    pub length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CascadingTimeoutReport {
    pub cascade_detected: bool,
    pub chains: Vec<CascadingTimeoutFinding>,
    pub impact: String,
}

fn is_timeout(span: &Span, threshold_ms: f64) -> bool {
    if span.duration_ms().map(|d| d >= threshold_ms).unwrap_or(false) {
        return true;
    }
    if name_contains_any(&span.name, &TIMEOUT_INDICATORS) {
        return true;
    }
    if span.label_matches_any(&TIMEOUT_INDICATORS) {
        return true;
    }
    span.labels
        .get("error.type")
        .map(|v| v.eq_ignore_ascii_case("timeout"))
        .unwrap_or(false)
}

/// Walks each timeout span's parent chain; chains where every span is also
/// a timeout and length ≥ 2 are reported, deduplicated so no reported chain
/// is a strict subset of another (the longest chain wins).
pub fn detect_cascading_timeout(trace: &Trace, threshold_ms: f64) -> CascadingTimeoutReport {
    let span_by_id: HashMap<&str, &Span> = trace
        .spans
        .iter()
        .map(|s| (s.span_id.as_str(), s))
        .collect();
    let timeout_ids: HashSet<&str> = trace
        .spans
        .iter()
        .filter(|s| is_timeout(s, threshold_ms))
        .map(|s| s.span_id.as_str())
        .collect();

    let mut raw_chains: Vec<Vec<String>> = Vec::new();
    for span in &trace.spans {
        if !timeout_ids.contains(span.span_id.as_str()) {
            continue;
        }
        let mut chain = vec![span.span_id.clone()];
        let mut current = span;
        while !current.parent_span_id.is_empty() {
            let Some(parent) = span_by_id.get(current.parent_span_id.as_str()) else {
                break;
            };
            if !timeout_ids.contains(parent.span_id.as_str()) {
                break;
            }
            chain.push(parent.span_id.clone());
            current = parent;
        }
        if chain.len() >= 2 {
            raw_chains.push(chain);
        }
    }

    raw_chains.sort_by(|a, b| b.len().cmp(&a.len()));
    let mut kept: Vec<Vec<String>> = Vec::new();
    for chain in raw_chains {
        let chain_set: HashSet<&String> = chain.iter().collect();
        let is_subset = kept
            .iter()
            .any(|existing| chain_set.iter().all(|id| existing.contains(id)));
        if !is_subset {
            kept.push(chain);
        }
    }

    let chains: Vec<CascadingTimeoutFinding> = kept
        .into_iter()
        .map(|chain| CascadingTimeoutFinding {
            length: chain.len(),
            chain,
        })
        .collect();

    CascadingTimeoutReport {
        cascade_detected: !chains.is_empty(),
        impact: if chains.is_empty() { "low" } else { "critical" }.to_string(),
        chains,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolExhaustionFinding {
    pub span_id: String,
    pub name: String,
    pub wait_ms: f64,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PoolExhaustionReport {
    pub findings: Vec<PoolExhaustionFinding>,
    pub has_pool_exhaustion: bool,
}

pub fn detect_connection_pool_issues(trace: &Trace, wait_threshold_ms: f64) -> PoolExhaustionReport {
    let mut findings = Vec::new();
    let mut total_wait = 0.0;
    for span in &trace.spans {
        if !name_contains_any(&span.name, &CONNECTION_INDICATORS) {
            continue;
        }
        let Some(duration) = span.duration_ms() else {
            continue;
        };
        if duration < wait_threshold_ms {
            continue;
        }
        total_wait += duration;
        let severity = if duration >= wait_threshold_ms * 5.0 {
            Severity::High
        } else if duration >= wait_threshold_ms * 2.0 {
            Severity::Medium
        } else {
            Severity::Low
        };
        findings.push(PoolExhaustionFinding {
            span_id: span.span_id.clone(),
            name: span.name.clone(),
            wait_ms: duration,
            severity,
        });
    }

    PoolExhaustionReport {
        has_pool_exhaustion: total_wait >= wait_threshold_ms * 3.0,
        findings,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SrePatternReport {
    pub retry_storms: Vec<RetryStormFinding>,
    pub cascading_timeout: CascadingTimeoutReport,
    pub pool_exhaustion: PoolExhaustionReport,
    pub overall_health: String,
}

/// Aggregates the three single-trace detectors and rolls their results up
/// into an overall-health verdict: `critical` > `degraded` > `warning` >
/// `healthy`, matching the reference aggregator's ordering.
pub fn detect_all(
    trace: &Trace,
    retry_threshold: usize,
    timeout_ms: f64,
    pool_wait_ms: f64,
) -> SrePatternReport {
    let retry_storms = detect_retry_storm(trace, retry_threshold);
    let cascading_timeout = detect_cascading_timeout(trace, timeout_ms);
    let pool_exhaustion = detect_connection_pool_issues(trace, pool_wait_ms);

    let overall_health = if cascading_timeout.impact == "critical" {
        "critical"
    } else if retry_storms.iter().any(|f| f.severity == Severity::High)
        || pool_exhaustion
            .findings
            .iter()
            .any(|f| f.severity == Severity::High)
    {
        "degraded"
    } else if !retry_storms.is_empty() || !pool_exhaustion.findings.is_empty() {
        "warning"
    } else {
        "healthy"
    }
    .to_string();

    SrePatternReport {
        retry_storms,
        cascading_timeout,
        pool_exhaustion,
        overall_health,
    }
}
