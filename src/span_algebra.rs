//! Pure, deterministic functions over a single trace: durations, errors,
//! call graph, quality validation, and summarization (C4).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::model::{Span, Trace};

const DURATION_EPSILON_MS: f64 = 1e-3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpanTiming {
    pub span_id: String,
    pub name: String,
    pub start_unix: Option<f64>,
    pub end_unix: Option<f64>,
    pub duration_ms: Option<f64>,
}

/// Computes each span's duration, sorted descending (undefined durations
/// last), ties broken by original insertion order.
pub fn durations(trace: &Trace) -> Vec<SpanTiming> {
    let mut timings: Vec<(usize, SpanTiming)> = trace
        .spans
        .iter()
        .enumerate()
        .map(|(idx, span)| {
            (
                idx,
                SpanTiming {
                    span_id: span.span_id.clone(),
                    name: span.name.clone(),
                    start_unix: span.start_unix,
                    end_unix: span.end_unix,
                    duration_ms: span.duration_ms(),
                },
            )
        })
        .collect();

    timings.sort_by(|(ai, a), (bi, b)| match (a.duration_ms, b.duration_ms) {
        (Some(da), Some(db)) => db
            .partial_cmp(&da)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(ai.cmp(bi)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => ai.cmp(bi),
    });

    timings.into_iter().map(|(_, t)| t).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorRecord {
    pub span_id: String,
    pub name: String,
    pub error_type: String,
    pub status_code: Option<i64>,
    pub error_message: Option<String>,
}

const ERROR_KEYWORDS: [&str; 4] = ["error", "exception", "fault", "failure"];
const ERROR_FALSEY_VALUES: [&str; 4] = ["false", "0", "none", "ok"];

fn parse_int(value: &str) -> Option<i64> {
    value.trim().parse::<i64>().ok()
}

/// A span is an error iff it matches a gRPC status check, an HTTP
/// status-code check, or a generic error-keyword fallback — checked in
/// that order, matching the reference implementation's branch priority so
/// that a bare `status`/`code` key is never over-matched.
fn classify_error(span: &Span) -> Option<ErrorRecord> {
    for (key, value) in &span.labels {
        let lower_key = key.to_lowercase();
        if lower_key.contains("grpc") && lower_key.contains("status") {
            let lower_value = value.to_lowercase();
            if !value.is_empty() && lower_value != "ok" && lower_value != "0" {
                return Some(ErrorRecord {
                    span_id: span.span_id.clone(),
                    name: span.name.clone(),
                    error_type: "grpc_error".to_string(),
                    status_code: parse_int(value),
                    error_message: Some(value.clone()),
                });
            }
        }
    }

    for (key, value) in &span.labels {
        let lower_key = key.to_lowercase();
        if lower_key.contains("/http/status_code") || lower_key.contains("http.status_code") {
            if let Some(code) = parse_int(value) {
                if code >= 400 {
                    return Some(ErrorRecord {
                        span_id: span.span_id.clone(),
                        name: span.name.clone(),
                        error_type: "http_error".to_string(),
                        status_code: Some(code),
                        error_message: None,
                    });
                }
            }
        }
    }

    for (key, value) in &span.labels {
        let lower_key = key.to_lowercase();
        let lower_value = value.to_lowercase();
        if ERROR_KEYWORDS.iter().any(|kw| lower_key.contains(kw))
            && !value.is_empty()
            && !ERROR_FALSEY_VALUES.contains(&lower_value.as_str())
        {
            return Some(ErrorRecord {
                span_id: span.span_id.clone(),
                name: span.name.clone(),
                error_type: "generic_error".to_string(),
                status_code: None,
                error_message: Some(value.clone()),
            });
        }
    }

    None
}

pub fn errors(trace: &Trace) -> Vec<ErrorRecord> {
    trace.spans.iter().filter_map(classify_error).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallGraphNode {
    pub span_id: String,
    pub name: String,
    pub depth: usize,
    pub children: Vec<CallGraphNode>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CallGraph {
    pub roots: Vec<String>,
    pub tree: Vec<CallGraphNode>,
    pub span_names: Vec<String>,
    pub max_depth: usize,
}

/// Builds the parent→children mapping and nested tree records. Cycles are
/// treated as a quality defect, not traversed: a span already on the
/// current active path is skipped rather than re-descended into.
pub fn call_graph(trace: &Trace) -> CallGraph {
    let span_by_id: HashMap<&str, &Span> = trace
        .spans
        .iter()
        .map(|s| (s.span_id.as_str(), s))
        .collect();

    let mut children_by_parent: HashMap<&str, Vec<&Span>> = HashMap::new();
    let mut roots = Vec::new();
    for span in &trace.spans {
        if span.parent_span_id.is_empty() || !span_by_id.contains_key(span.parent_span_id.as_str())
        {
            roots.push(span.span_id.clone());
        } else {
            children_by_parent
                .entry(span.parent_span_id.as_str())
                .or_default()
                .push(span);
        }
    }

    let mut max_depth = 0usize;

    fn build_subtree<'a>(
        span: &'a Span,
        depth: usize,
        children_by_parent: &HashMap<&'a str, Vec<&'a Span>>,
        active_path: &mut HashSet<&'a str>,
        max_depth: &mut usize,
    ) -> CallGraphNode {
        *max_depth = (*max_depth).max(depth);
        active_path.insert(span.span_id.as_str());

        let children = children_by_parent
            .get(span.span_id.as_str())
            .map(|kids| {
                kids.iter()
                    .filter(|child| !active_path.contains(child.span_id.as_str()))
                    .map(|child| {
                        build_subtree(child, depth + 1, children_by_parent, active_path, max_depth)
                    })
                    .collect()
            })
            .unwrap_or_default();

        active_path.remove(span.span_id.as_str());

        CallGraphNode {
            span_id: span.span_id.clone(),
            name: span.name.clone(),
            depth,
            children,
            labels: span.labels.clone(),
        }
    }

    let mut active_path = HashSet::new();
    let tree: Vec<CallGraphNode> = roots
        .iter()
        .filter_map(|id| span_by_id.get(id.as_str()))
        .map(|span| build_subtree(span, 0, &children_by_parent, &mut active_path, &mut max_depth))
        .collect();

    let span_names: Vec<String> = {
        let mut set: Vec<String> = trace
            .spans
            .iter()
            .map(|s| s.name.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        set.sort();
        set
    };

    CallGraph {
        roots,
        tree,
        span_names,
        max_depth,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityIssue {
    #[serde(rename = "type")]
    pub issue_type: String,
    pub span_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct QualityReport {
    pub valid: bool,
    pub issues: Vec<QualityIssue>,
}

/// Detects missing span ids, orphaned spans, negative durations,
/// parent/child clock skew, cycles, and timestamp parse failures.
pub fn validate(trace: &Trace) -> QualityReport {
    let mut issues = Vec::new();
    let span_ids: HashSet<&str> = trace.spans.iter().map(|s| s.span_id.as_str()).collect();

    for span in &trace.spans {
        if span.span_id.is_empty() {
            issues.push(QualityIssue {
                issue_type: "missing_span_id".to_string(),
                span_id: None,
                message: format!("span named '{}' has no span_id", span.name),
            });
            continue;
        }

        if !span.parent_span_id.is_empty() && !span_ids.contains(span.parent_span_id.as_str()) {
            issues.push(QualityIssue {
                issue_type: "orphaned_span".to_string(),
                span_id: Some(span.span_id.clone()),
                message: format!(
                    "span {} references missing parent {}",
                    span.span_id, span.parent_span_id
                ),
            });
        }

        match span.raw_duration_ms() {
            Some(d) if d < -DURATION_EPSILON_MS => {
                issues.push(QualityIssue {
                    issue_type: "negative_duration".to_string(),
                    span_id: Some(span.span_id.clone()),
                    message: format!("span {} has negative duration {d}ms", span.span_id),
                });
            }
            None if span.start_unix.is_some() || span.start_iso.is_some() => {
                issues.push(QualityIssue {
                    issue_type: "timestamp_parse_failure".to_string(),
                    span_id: Some(span.span_id.clone()),
                    message: format!("span {} timestamps could not be parsed", span.span_id),
                });
            }
            _ => {}
        }
    }

    let span_by_id: HashMap<&str, &Span> = trace
        .spans
        .iter()
        .map(|s| (s.span_id.as_str(), s))
        .collect();
    for span in &trace.spans {
        if span.parent_span_id.is_empty() {
            continue;
        }
        let Some(parent) = span_by_id.get(span.parent_span_id.as_str()) else {
            continue;
        };
        if let (Some(child_start), Some(parent_start)) = (span.start_unix, parent.start_unix) {
            if child_start < parent_start - DURATION_EPSILON_MS / 1000.0 {
                issues.push(QualityIssue {
                    issue_type: "clock_skew".to_string(),
                    span_id: Some(span.span_id.clone()),
                    message: format!("span {} starts before its parent", span.span_id),
                });
            }
        }
        if let (Some(child_end), Some(parent_end)) = (span.end_unix, parent.end_unix) {
            if child_end > parent_end + DURATION_EPSILON_MS / 1000.0 {
                issues.push(QualityIssue {
                    issue_type: "clock_skew".to_string(),
                    span_id: Some(span.span_id.clone()),
                    message: format!("span {} ends after its parent", span.span_id),
                });
            }
        }
    }

    if let Some(cycle_span) = detect_cycle(trace) {
        issues.push(QualityIssue {
            issue_type: "cycle".to_string(),
            span_id: Some(cycle_span),
            message: "cyclic parent pointers detected".to_string(),
        });
    }

    QualityReport {
        valid: issues.is_empty(),
        issues,
    }
}

/// Walks each span's ancestor chain; a re-visit of a span already on the
/// current path indicates a cycle. Returns the span id where the cycle was
/// detected, if any.
fn detect_cycle(trace: &Trace) -> Option<String> {
    let span_by_id: HashMap<&str, &Span> = trace
        .spans
        .iter()
        .map(|s| (s.span_id.as_str(), s))
        .collect();

    for span in &trace.spans {
        let mut seen = HashSet::new();
        let mut current = span;
        seen.insert(current.span_id.as_str());
        loop {
            if current.parent_span_id.is_empty() {
                break;
            }
            let Some(parent) = span_by_id.get(current.parent_span_id.as_str()) else {
                break;
            };
            if !seen.insert(parent.span_id.as_str()) {
                return Some(span.span_id.clone());
            }
            current = parent;
        }
    }
    None
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Summary {
    pub trace_id: String,
    pub total_spans: usize,
    pub duration_ms: f64,
    pub error_count: usize,
    pub errors: Vec<ErrorRecord>,
    pub slowest_spans: Vec<SpanTiming>,
}

pub fn summary(trace: &Trace) -> Summary {
    let all_errors = errors(trace);
    let all_durations = durations(trace);
    Summary {
        trace_id: trace.trace_id.clone(),
        total_spans: trace.spans.len(),
        duration_ms: trace.duration_ms,
        error_count: all_errors.len(),
        errors: all_errors.into_iter().take(5).collect(),
        slowest_spans: all_durations.into_iter().take(5).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(id: &str, parent: &str, name: &str, start: f64, end: f64) -> Span {
        Span {
            span_id: id.to_string(),
            parent_span_id: parent.to_string(),
            name: name.to_string(),
            start_unix: Some(start),
            end_unix: Some(end),
            start_iso: None,
            end_iso: None,
            labels: HashMap::new(),
        }
    }

    fn trace(spans: Vec<Span>) -> Trace {
        let duration_ms = 0.0;
        Trace {
            trace_id: "t1".to_string(),
            project: "p".to_string(),
            duration_ms,
            spans,
        }
    }

    #[test]
    fn empty_trace_has_empty_derived_values() {
        let t = trace(vec![]);
        assert!(durations(&t).is_empty());
        assert!(errors(&t).is_empty());
        let graph = call_graph(&t);
        assert!(graph.roots.is_empty());
        assert_eq!(graph.max_depth, 0);
    }

    #[test]
    fn durations_sorted_descending_with_tie_break() {
        let t = trace(vec![
            span("a", "", "x", 0.0, 0.01),
            span("b", "", "y", 0.0, 0.02),
            span("c", "", "z", 0.0, 0.02),
        ]);
        let d = durations(&t);
        assert_eq!(d[0].span_id, "b");
        assert_eq!(d[1].span_id, "c");
        assert_eq!(d[2].span_id, "a");
    }

    #[test]
    fn http_200_is_not_an_error() {
        let mut s = span("a", "", "x", 0.0, 0.01);
        s.labels.insert("/http/status_code".to_string(), "200".to_string());
        let t = trace(vec![s]);
        assert!(errors(&t).is_empty());
    }

    #[test]
    fn http_500_is_an_error_with_status_code() {
        let mut s = span("a", "", "x", 0.0, 0.01);
        s.labels.insert("/http/status_code".to_string(), "500".to_string());
        let t = trace(vec![s]);
        let e = errors(&t);
        assert_eq!(e.len(), 1);
        assert_eq!(e[0].status_code, Some(500));
        assert_eq!(e[0].error_type, "http_error");
    }

    #[test]
    fn generic_status_key_with_200_is_not_flagged() {
        let mut s = span("a", "", "x", 0.0, 0.01);
        s.labels.insert("status".to_string(), "200".to_string());
        let t = trace(vec![s]);
        assert!(errors(&t).is_empty());
    }

    #[test]
    fn generic_error_keyword_with_falsey_value_is_not_flagged() {
        let mut s = span("a", "", "x", 0.0, 0.01);
        s.labels.insert("error.occurred".to_string(), "false".to_string());
        let t = trace(vec![s]);
        assert!(errors(&t).is_empty());
    }

    #[test]
    fn generic_error_keyword_with_message_is_flagged() {
        let mut s = span("a", "", "x", 0.0, 0.01);
        s.labels
            .insert("error.message".to_string(), "connection refused".to_string());
        let t = trace(vec![s]);
        let e = errors(&t);
        assert_eq!(e.len(), 1);
        assert_eq!(e[0].error_type, "generic_error");
    }

    #[test]
    fn call_graph_builds_nested_tree_with_depth() {
        let t = trace(vec![
            span("root", "", "http", 0.0, 1.0),
            span("child", "root", "db", 0.1, 0.5),
            span("grandchild", "child", "parse", 0.2, 0.3),
        ]);
        let graph = call_graph(&t);
        assert_eq!(graph.roots, vec!["root".to_string()]);
        assert_eq!(graph.max_depth, 2);
        assert_eq!(graph.tree[0].children[0].children[0].span_id, "grandchild");
    }

    #[test]
    fn orphaned_span_is_treated_as_root_and_flagged() {
        let t = trace(vec![span("a", "missing-parent", "x", 0.0, 1.0)]);
        let graph = call_graph(&t);
        assert_eq!(graph.roots, vec!["a".to_string()]);
        let report = validate(&t);
        assert!(!report.valid);
        assert!(report.issues.iter().any(|i| i.issue_type == "orphaned_span"));
    }

    #[test]
    fn cycle_is_detected_as_quality_defect() {
        let mut a = span("a", "b", "x", 0.0, 1.0);
        let mut b = span("b", "a", "y", 0.0, 1.0);
        a.parent_span_id = "b".to_string();
        b.parent_span_id = "a".to_string();
        let t = trace(vec![a, b]);
        let report = validate(&t);
        assert!(report.issues.iter().any(|i| i.issue_type == "cycle"));
    }

    #[test]
    fn negative_duration_is_flagged() {
        let t = trace(vec![span("a", "", "x", 1.0, 0.5)]);
        let report = validate(&t);
        assert!(report
            .issues
            .iter()
            .any(|i| i.issue_type == "negative_duration"));
    }

    #[test]
    fn clock_skew_detects_child_outside_parent_window() {
        let t = trace(vec![
            span("root", "", "http", 0.0, 1.0),
            span("child", "root", "db", -0.1, 0.5),
        ]);
        let report = validate(&t);
        assert!(report.issues.iter().any(|i| i.issue_type == "clock_skew"));
    }

    #[test]
    fn summary_caps_errors_and_slowest_at_five() {
        let mut spans = Vec::new();
        for i in 0..10 {
            let mut s = span(&format!("s{i}"), "", "op", 0.0, (i as f64 + 1.0) * 0.01);
            s.labels
                .insert("error.message".to_string(), "boom".to_string());
            spans.push(s);
        }
        let t = trace(spans);
        let s = summary(&t);
        assert_eq!(s.total_spans, 10);
        assert_eq!(s.error_count, 10);
        assert_eq!(s.errors.len(), 5);
        assert_eq!(s.slowest_spans.len(), 5);
    }
}
