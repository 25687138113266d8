//! Parent-covered self-time computation and blocking-path selection (C6).
//!
//! Uses an explicit work stack rather than natural recursion so that deep
//! traces (spec requires tolerance up to 20k spans in a narrow chain) don't
//! exhaust the call stack.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::{Span, Trace};

const NON_BLOCKING_GAP_MS: f64 = 5.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CriticalPathEntry {
    pub span_id: String,
    pub name: String,
    pub self_time_ms: f64,
    pub contribution_pct: f64,
    pub blocking_contribution_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CriticalPathResult {
    pub critical_path: Vec<CriticalPathEntry>,
    pub total_critical_duration_ms: f64,
    pub trace_duration_ms: f64,
    pub parallelism_ratio: f64,
    pub parallelism_pct: f64,
}

struct NodeInfo {
    span_id: String,
    name: String,
    self_time_ms: f64,
    best_blocking_ms: f64,
    best_chain: Vec<String>,
}

/// Merges overlapping `[start, end]` intervals (ms) and returns their total
/// covered length.
fn merged_coverage(mut intervals: Vec<(f64, f64)>) -> f64 {
    if intervals.is_empty() {
        return 0.0;
    }
    intervals.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    let mut total = 0.0;
    let (mut cur_start, mut cur_end) = intervals[0];
    for &(start, end) in &intervals[1..] {
        if start > cur_end {
            total += cur_end - cur_start;
            cur_start = start;
            cur_end = end;
        } else {
            cur_end = cur_end.max(end);
        }
    }
    total += cur_end - cur_start;
    total
}

/// Computes the critical path for one trace, picking the best blocking path
/// across every root and reporting it relative to trace totals.
pub fn analyze(trace: &Trace) -> CriticalPathResult {
    let span_by_id: HashMap<&str, &Span> = trace
        .spans
        .iter()
        .map(|s| (s.span_id.as_str(), s))
        .collect();
    let mut children_by_parent: HashMap<&str, Vec<&Span>> = HashMap::new();
    let mut roots: Vec<&Span> = Vec::new();
    for span in &trace.spans {
        if span.parent_span_id.is_empty() || !span_by_id.contains_key(span.parent_span_id.as_str())
        {
            roots.push(span);
        } else {
            children_by_parent
                .entry(span.parent_span_id.as_str())
                .or_default()
                .push(span);
        }
    }

    if trace.spans.is_empty() {
        return CriticalPathResult {
            trace_duration_ms: trace.duration_ms,
            ..Default::default()
        };
    }

    // Post-order traversal via explicit stack: (span, children_already_pushed).
    let mut order: Vec<&Span> = Vec::new();
    let mut stack: Vec<(&Span, bool)> = roots.iter().map(|s| (*s, false)).collect();
    while let Some((span, expanded)) = stack.pop() {
        if expanded {
            order.push(span);
            continue;
        }
        stack.push((span, true));
        if let Some(children) = children_by_parent.get(span.span_id.as_str()) {
            for child in children {
                stack.push((child, false));
            }
        }
    }

    let mut info: HashMap<&str, NodeInfo> = HashMap::new();
    for span in &order {
        let own_duration = span.duration_ms().unwrap_or(0.0);
        let children = children_by_parent
            .get(span.span_id.as_str())
            .cloned()
            .unwrap_or_default();

        let child_intervals: Vec<(f64, f64)> = children
            .iter()
            .filter_map(|c| match (c.start_unix, c.end_unix) {
                (Some(s), Some(e)) => Some((s * 1000.0, e * 1000.0)),
                _ => None,
            })
            .collect();
        let coverage = merged_coverage(child_intervals);
        let self_time = (own_duration - coverage).max(0.0);

        let parent_end_ms = span.end_unix.map(|e| e * 1000.0);

        let mut best_blocking = self_time;
        let mut best_chain = vec![span.span_id.clone()];
        for child in &children {
            let Some(child_info) = info.get(child.span_id.as_str()) else {
                continue;
            };
            let mut contribution = child_info.best_blocking_ms;
            if let (Some(child_end), Some(parent_end)) =
                (child.end_unix.map(|e| e * 1000.0), parent_end_ms)
            {
                if parent_end - child_end > NON_BLOCKING_GAP_MS {
                    contribution /= 2.0;
                }
            }
            let candidate_total = self_time + contribution;
            if candidate_total > best_blocking {
                best_blocking = candidate_total;
                let mut chain = vec![span.span_id.clone()];
                chain.extend(child_info.best_chain.iter().cloned());
                best_chain = chain;
            }
        }

        info.insert(
            span.span_id.as_str(),
            NodeInfo {
                span_id: span.span_id.clone(),
                name: span.name.clone(),
                self_time_ms: self_time,
                best_blocking_ms: best_blocking,
                best_chain,
            },
        );
    }

    let mut winner: Option<&NodeInfo> = None;
    for root in &roots {
        if let Some(candidate) = info.get(root.span_id.as_str()) {
            winner = match winner {
                None => Some(candidate),
                Some(current) if candidate.best_blocking_ms > current.best_blocking_ms => {
                    Some(candidate)
                }
                other => other,
            };
        }
    }

    let Some(winner) = winner else {
        return CriticalPathResult {
            trace_duration_ms: trace.duration_ms,
            ..Default::default()
        };
    };

    let total_critical = winner.best_blocking_ms;
    let trace_duration = trace.duration_ms;
    let parallelism_ratio = if total_critical > 0.0 {
        trace_duration / total_critical
    } else {
        1.0
    };
    let parallelism_pct = if parallelism_ratio > 1.0 {
        (1.0 - 1.0 / parallelism_ratio) * 100.0
    } else {
        0.0
    };

    let entries: Vec<CriticalPathEntry> = winner
        .best_chain
        .iter()
        .filter_map(|id| info.get(id.as_str()))
        .map(|node| CriticalPathEntry {
            span_id: node.span_id.clone(),
            name: node.name.clone(),
            self_time_ms: node.self_time_ms,
            contribution_pct: if trace_duration > 0.0 {
                node.self_time_ms / trace_duration * 100.0
            } else {
                0.0
            },
            blocking_contribution_pct: if total_critical > 0.0 {
                node.self_time_ms / total_critical * 100.0
            } else {
                0.0
            },
        })
        .collect();

    CriticalPathResult {
        critical_path: entries,
        total_critical_duration_ms: total_critical,
        trace_duration_ms: trace_duration,
        parallelism_ratio,
        parallelism_pct,
    }
}
