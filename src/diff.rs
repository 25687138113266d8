//! Two-trace comparison: slower/faster spans, N+1/serial-chain detection,
//! structural diff, and root-cause scoring (C8).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::critical_path;
use crate::model::{Span, Trace};
use crate::span_algebra;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpanComparison {
    pub span_name: String,
    pub baseline_duration_ms: f64,
    pub target_duration_ms: f64,
    pub diff_ms: f64,
    pub diff_percent: f64,
    pub baseline_count: usize,
    pub target_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NPlusOneFinding {
    pub span_name: String,
    pub count: usize,
    pub total_duration_ms: f64,
    pub impact: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerialChainFinding {
    pub span_names: Vec<String>,
    pub count: usize,
    pub total_duration_ms: f64,
    pub impact: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TimingDiff {
    pub slower_spans: Vec<SpanComparison>,
    pub faster_spans: Vec<SpanComparison>,
    pub missing_from_target: Vec<String>,
    pub new_in_target: Vec<String>,
    pub n_plus_one: Vec<NPlusOneFinding>,
    pub serial_chains: Vec<SerialChainFinding>,
    pub baseline_total_ms: f64,
    pub target_total_ms: f64,
}

/// Spans sorted by start time, used identically by N+1 and serial-chain
/// detection below — both derive from the same sort so their results stay
/// consistent with each other even though the two checks are independent.
fn sorted_by_start(trace: &Trace) -> Vec<&Span> {
    let mut spans: Vec<&Span> = trace.spans.iter().filter(|s| s.start_unix.is_some()).collect();
    spans.sort_by(|a, b| {
        a.start_unix
            .partial_cmp(&b.start_unix)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    spans
}

fn detect_n_plus_one(sorted_spans: &[&Span]) -> Vec<NPlusOneFinding> {
    let mut findings = Vec::new();
    let mut run: Vec<&Span> = Vec::new();

    let flush = |run: &Vec<&Span>, findings: &mut Vec<NPlusOneFinding>| {
        if run.len() >= 3 {
            let sum: f64 = run.iter().filter_map(|s| s.duration_ms()).sum();
            if sum > 50.0 {
                findings.push(NPlusOneFinding {
                    span_name: run[0].name.clone(),
                    count: run.len(),
                    total_duration_ms: sum,
                    impact: if sum > 200.0 { "high" } else { "medium" }.to_string(),
                });
            }
        }
    };

    for span in sorted_spans {
        if run.is_empty() || run.last().unwrap().name == span.name {
            run.push(span);
        } else {
            flush(&run, &mut findings);
            run = vec![span];
        }
    }
    flush(&run, &mut findings);
    findings
}

const SERIAL_GAP_THRESHOLD_MS: f64 = 10.0;

fn detect_serial_chains(sorted_spans: &[&Span]) -> Vec<SerialChainFinding> {
    let mut chains: Vec<Vec<&Span>> = Vec::new();
    let mut current: Vec<&Span> = Vec::new();

    for window in sorted_spans.windows(2) {
        let (curr, next) = (window[0], window[1]);
        let (Some(curr_end), Some(next_start)) = (curr.end_unix, next.start_unix) else {
            continue;
        };

        let is_parent_child =
            curr.span_id == next.parent_span_id || next.span_id == curr.parent_span_id;
        if is_parent_child {
            if current.len() >= 3 {
                chains.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
            continue;
        }

        let gap_ms = (next_start - curr_end) * 1000.0;
        if (0.0..=SERIAL_GAP_THRESHOLD_MS).contains(&gap_ms) {
            if current.is_empty() {
                current.push(curr);
            }
            current.push(next);
        } else {
            if current.len() >= 3 {
                chains.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
    }
    if current.len() >= 3 {
        chains.push(current);
    }

    chains
        .into_iter()
        .filter_map(|chain| {
            let total: f64 = chain.iter().filter_map(|s| s.duration_ms()).sum();
            if total > 100.0 {
                Some(SerialChainFinding {
                    span_names: chain.iter().map(|s| s.name.clone()).collect(),
                    count: chain.len(),
                    total_duration_ms: total,
                    impact: if total > 500.0 { "high" } else { "medium" }.to_string(),
                })
            } else {
                None
            }
        })
        .collect()
}

fn mean_duration(spans: &[&Span]) -> f64 {
    let durations: Vec<f64> = spans.iter().filter_map(|s| s.duration_ms()).collect();
    if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<f64>() / durations.len() as f64
    }
}

/// Compares span timings between a baseline and target trace, flagging
/// slower/faster spans by name and running the N+1/serial-chain detectors
/// against the target's spans sorted by start time.
pub fn compare_timings(baseline: &Trace, target: &Trace) -> TimingDiff {
    let sorted_target = sorted_by_start(target);
    let n_plus_one = detect_n_plus_one(&sorted_target);
    let serial_chains = detect_serial_chains(&sorted_target);

    let mut baseline_by_name: HashMap<&str, Vec<&Span>> = HashMap::new();
    for span in &baseline.spans {
        baseline_by_name.entry(span.name.as_str()).or_default().push(span);
    }
    let mut target_by_name: HashMap<&str, Vec<&Span>> = HashMap::new();
    for span in &target.spans {
        target_by_name.entry(span.name.as_str()).or_default().push(span);
    }

    let all_names: HashSet<&str> = baseline_by_name
        .keys()
        .chain(target_by_name.keys())
        .copied()
        .collect();

    let mut slower_spans = Vec::new();
    let mut faster_spans = Vec::new();
    for name in &all_names {
        let (Some(baseline_spans), Some(target_spans)) =
            (baseline_by_name.get(name), target_by_name.get(name))
        else {
            continue;
        };
        let baseline_avg = mean_duration(baseline_spans);
        let target_avg = mean_duration(target_spans);
        let diff_ms = target_avg - baseline_avg;
        let diff_pct = if baseline_avg > 0.0 {
            diff_ms / baseline_avg * 100.0
        } else {
            0.0
        };

        let comparison = SpanComparison {
            span_name: name.to_string(),
            baseline_duration_ms: baseline_avg,
            target_duration_ms: target_avg,
            diff_ms,
            diff_percent: diff_pct,
            baseline_count: baseline_spans.len(),
            target_count: target_spans.len(),
        };

        if diff_pct > 10.0 || diff_ms > 50.0 {
            slower_spans.push(comparison);
        } else if diff_pct < -10.0 || diff_ms < -50.0 {
            faster_spans.push(comparison);
        }
    }
    slower_spans.sort_by(|a, b| b.diff_ms.partial_cmp(&a.diff_ms).unwrap());
    faster_spans.sort_by(|a, b| a.diff_ms.partial_cmp(&b.diff_ms).unwrap());

    let missing_from_target: Vec<String> = baseline_by_name
        .keys()
        .filter(|name| !target_by_name.contains_key(*name))
        .map(|s| s.to_string())
        .collect();
    let new_in_target: Vec<String> = target_by_name
        .keys()
        .filter(|name| !baseline_by_name.contains_key(*name))
        .map(|s| s.to_string())
        .collect();

    TimingDiff {
        slower_spans,
        faster_spans,
        missing_from_target,
        new_in_target,
        n_plus_one,
        serial_chains,
        baseline_total_ms: baseline.spans.iter().filter_map(|s| s.duration_ms()).sum(),
        target_total_ms: target.spans.iter().filter_map(|s| s.duration_ms()).sum(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StructDiff {
    pub missing_spans: Vec<String>,
    pub new_spans: Vec<String>,
    pub common_spans: Vec<String>,
    pub baseline_span_count: usize,
    pub target_span_count: usize,
    pub span_count_change: i64,
    pub depth_change: i64,
}

pub fn compare_structure(baseline: &Trace, target: &Trace) -> StructDiff {
    let baseline_graph = span_algebra::call_graph(baseline);
    let target_graph = span_algebra::call_graph(target);

    let baseline_names: HashSet<&String> = baseline_graph.span_names.iter().collect();
    let target_names: HashSet<&String> = target_graph.span_names.iter().collect();

    StructDiff {
        missing_spans: baseline_names
            .difference(&target_names)
            .map(|s| s.to_string())
            .collect(),
        new_spans: target_names
            .difference(&baseline_names)
            .map(|s| s.to_string())
            .collect(),
        common_spans: baseline_names
            .intersection(&target_names)
            .map(|s| s.to_string())
            .collect(),
        baseline_span_count: baseline.spans.len(),
        target_span_count: target.spans.len(),
        span_count_change: target.spans.len() as i64 - baseline.spans.len() as i64,
        depth_change: target_graph.max_depth as i64 - baseline_graph.max_depth as i64,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CausalCandidate {
    pub span_name: String,
    pub diff_ms: f64,
    pub diff_percent: f64,
    pub confidence_score: f64,
    pub on_critical_path: bool,
    pub is_likely_root_cause: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CausalReport {
    pub candidates: Vec<CausalCandidate>,
    pub total_candidates: usize,
    pub critical_path_span_count: usize,
}

/// Ranks target spans by a confidence score combining the timing diff,
/// call-graph depth, and critical-path membership/self-time dominance.
pub fn causal_analysis(baseline: &Trace, target: &Trace) -> CausalReport {
    let baseline_graph = span_algebra::call_graph(baseline);
    let target_graph = span_algebra::call_graph(target);
    let critical = critical_path::analyze(target);

    let mut depth_by_name: HashMap<&str, usize> = HashMap::new();
    fn walk<'a>(nodes: &'a [span_algebra::CallGraphNode], out: &mut HashMap<&'a str, usize>) {
        for node in nodes {
            out.entry(node.name.as_str())
                .and_modify(|d| *d = (*d).min(node.depth))
                .or_insert(node.depth);
            walk(&node.children, out);
        }
    }
    walk(&target_graph.tree, &mut depth_by_name);

    let critical_path_names: HashSet<&str> = critical
        .critical_path
        .iter()
        .map(|e| e.name.as_str())
        .collect();
    let self_time_by_name: HashMap<&str, f64> = critical
        .critical_path
        .iter()
        .map(|e| (e.name.as_str(), e.self_time_ms))
        .collect();

    let mut baseline_by_name: HashMap<&str, Vec<&Span>> = HashMap::new();
    for span in &baseline.spans {
        baseline_by_name.entry(span.name.as_str()).or_default().push(span);
    }
    let mut target_by_name: HashMap<&str, Vec<&Span>> = HashMap::new();
    for span in &target.spans {
        target_by_name.entry(span.name.as_str()).or_default().push(span);
    }

    let mut candidates: Vec<CausalCandidate> = Vec::new();
    for (name, target_spans) in &target_by_name {
        let Some(baseline_spans) = baseline_by_name.get(name) else {
            continue;
        };
        let baseline_avg = mean_duration(baseline_spans);
        let target_avg = mean_duration(target_spans);
        let diff_ms = target_avg - baseline_avg;
        let diff_pct = if baseline_avg > 0.0 {
            diff_ms / baseline_avg * 100.0
        } else {
            0.0
        };

        if diff_ms < 10.0 && diff_pct.abs() < 10.0 {
            continue;
        }

        let depth = depth_by_name.get(name).copied().unwrap_or(0);
        let depth_factor: f64 = (1.0 + 0.1 * depth as f64).min(1.5);
        let mut score = diff_ms * depth_factor;
        let on_critical_path = critical_path_names.contains(name);
        if on_critical_path {
            score *= 2.0;
            let self_time = self_time_by_name.get(name).copied().unwrap_or(0.0);
            if self_time > diff_ms * 0.3 {
                score *= 1.3;
            }
        }

        candidates.push(CausalCandidate {
            span_name: name.to_string(),
            diff_ms,
            diff_percent: diff_pct,
            confidence_score: score,
            on_critical_path,
            is_likely_root_cause: false,
        });
    }

    candidates.sort_by(|a, b| b.confidence_score.partial_cmp(&a.confidence_score).unwrap());

    for candidate in &mut candidates {
        let self_time = self_time_by_name
            .get(candidate.span_name.as_str())
            .copied()
            .unwrap_or(0.0);
        if candidate.on_critical_path && self_time > 50.0 {
            candidate.is_likely_root_cause = true;
        }
    }
    if let Some(top) = candidates.first_mut() {
        if top.on_critical_path {
            top.is_likely_root_cause = true;
        }
    }

    let total_candidates = candidates.len();
    candidates.truncate(10);

    CausalReport {
        candidates,
        total_candidates,
        critical_path_span_count: critical.critical_path.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn span(id: &str, parent: &str, name: &str, start: f64, end: f64) -> Span {
        Span {
            span_id: id.to_string(),
            parent_span_id: parent.to_string(),
            name: name.to_string(),
            start_unix: Some(start),
            end_unix: Some(end),
            start_iso: None,
            end_iso: None,
            labels: Map::new(),
        }
    }

    fn trace(id: &str, spans: Vec<Span>) -> Trace {
        let duration_ms = spans
            .iter()
            .filter_map(|s| s.end_unix)
            .fold(0.0_f64, f64::max)
            * 1000.0;
        Trace {
            trace_id: id.to_string(),
            project: "p".to_string(),
            duration_ms,
            spans,
        }
    }

    #[test]
    fn scenario_s1_n_plus_one_boundary_is_medium() {
        // 5 sibling spans, 30ms each, starting 50ms apart -> sum=150ms <= 200 -> medium.
        let spans: Vec<Span> = (0..5)
            .map(|i| {
                span(
                    &format!("s{i}"),
                    "",
                    "DatabaseQuery",
                    i as f64 * 0.05,
                    i as f64 * 0.05 + 0.03,
                )
            })
            .collect();
        let target = trace("target", spans);
        let baseline = trace("baseline", vec![]);
        let diff = compare_timings(&baseline, &target);
        assert_eq!(diff.n_plus_one.len(), 1);
        assert_eq!(diff.n_plus_one[0].count, 5);
        assert_eq!(diff.n_plus_one[0].total_duration_ms, 150.0);
        assert_eq!(diff.n_plus_one[0].impact, "medium");
    }

    #[test]
    fn serial_chain_excludes_parent_child_pairs() {
        let spans = vec![
            span("a", "", "op1", 0.0, 0.05),
            span("b", "a", "op2", 0.055, 0.2), // parent-child with a, breaks chain
        ];
        let target = trace("t", spans);
        let chains = detect_serial_chains(&sorted_by_start(&target));
        assert!(chains.is_empty());
    }

    #[test]
    fn serial_chain_requires_length_three_and_duration_over_100ms() {
        let spans = vec![
            span("a", "", "op1", 0.0, 0.04),
            span("b", "", "op2", 0.045, 0.08),
            span("c", "", "op3", 0.085, 0.12),
        ];
        let target = trace("t", spans);
        let chains = detect_serial_chains(&sorted_by_start(&target));
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].count, 3);
    }

    #[test]
    fn compare_structure_detects_added_and_removed_spans() {
        let baseline = trace(
            "b",
            vec![span("a", "", "keep", 0.0, 0.01), span("b", "", "removed", 0.0, 0.01)],
        );
        let target = trace(
            "t",
            vec![span("a", "", "keep", 0.0, 0.01), span("c", "", "added", 0.0, 0.01)],
        );
        let diff = compare_structure(&baseline, &target);
        assert_eq!(diff.missing_spans, vec!["removed".to_string()]);
        assert_eq!(diff.new_spans, vec!["added".to_string()]);
        assert_eq!(diff.common_spans, vec!["keep".to_string()]);
    }

    #[test]
    fn scenario_s4_root_cause_db_outranks_http() {
        let baseline = trace(
            "baseline",
            vec![
                span("http", "", "http", 0.0, 0.1),
                span("db", "http", "db", 0.02, 0.07),
            ],
        );
        let target = trace(
            "target",
            vec![
                span("http", "", "http", 0.0, 0.2),
                span("db", "http", "db", 0.02, 0.17),
            ],
        );
        let report = causal_analysis(&baseline, &target);
        assert!(report.candidates.len() >= 2);
        let db_rank = report.candidates.iter().position(|c| c.span_name == "db").unwrap();
        let http_rank = report
            .candidates
            .iter()
            .position(|c| c.span_name == "http")
            .unwrap();
        assert!(db_rank < http_rank, "db should rank above http");
        assert!(report.candidates[0].is_likely_root_cause);
    }
}
