//! Composes C1–C8 into named composite analyses (C9).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::cache::TraceCache;
use crate::config::EngineOptions;
use crate::critical_path::{self, CriticalPathResult};
use crate::diff::{self, CausalReport, StructDiff, TimingDiff};
use crate::error::EngineError;
use crate::fetch_pool;
use crate::model::{CancelToken, Credentials, Finding, Trace};
use crate::patterns::{self, SrePatternReport};
use crate::source::TraceSource;
use crate::span_algebra::{self, CallGraph, ErrorRecord, QualityReport, SpanTiming};
use crate::statistics::{self, AnomalyReport};

pub struct Engine<S: TraceSource> {
    source: Arc<S>,
    cache: TraceCache,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AnalyzeTraceResult {
    pub quality: QualityReport,
    pub durations: Vec<SpanTiming>,
    pub errors: Vec<ErrorRecord>,
    pub critical_path: Option<CriticalPathResult>,
    pub call_graph: Option<CallGraph>,
    pub anomaly: Option<AnomalyReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CompareResult {
    pub timings: TimingDiff,
    pub structure: StructDiff,
    pub causal: Option<CausalReport>,
}

impl<S: TraceSource> Engine<S> {
    pub fn new(source: S, options: &EngineOptions) -> Self {
        Self {
            source: Arc::new(source),
            cache: TraceCache::new(options.cache_max_entries, options.cache_ttl_ms),
        }
    }

    fn fetch(
        &self,
        project: &str,
        trace_id: &str,
        credentials: &Credentials,
        cancel: &CancelToken,
    ) -> Result<Arc<Trace>, EngineError> {
        let cache_key = format!("{project}:{trace_id}");
        let source = self.source.clone();
        let project = project.to_string();
        let trace_id_owned = trace_id.to_string();
        let credentials = credentials.clone();
        let cancel = cancel.clone();
        self.cache.get_or_fetch(&cache_key, move || {
            if cancel.is_cancelled() {
                return Err(EngineError::cancelled());
            }
            source
                .fetch_one(&project, &trace_id_owned, &credentials, &cancel)
                .map_err(EngineError::from)
        })
    }

    /// fetch -> validate -> if valid then durations/errors/critical-path,
    /// optionally call graph; if a baseline id is given, also anomaly.
    #[instrument(skip(self, credentials, cancel))]
    pub fn analyze_trace(
        &self,
        project: &str,
        trace_id: &str,
        baseline_id: Option<&str>,
        credentials: &Credentials,
        cancel: &CancelToken,
        options: &EngineOptions,
    ) -> Finding<AnalyzeTraceResult> {
        let trace = match self.fetch(project, trace_id, credentials, cancel) {
            Ok(t) => t,
            Err(e) => return e.into(),
        };

        let quality = span_algebra::validate(&trace);
        if !quality.valid {
            return EngineError::QualityRejected { report: quality }.into();
        }

        let anomaly = match baseline_id {
            Some(baseline_id) => match self.fetch(project, baseline_id, credentials, cancel) {
                Ok(baseline_trace) => {
                    let population_stats = statistics::latency_stats(&[(*baseline_trace).clone()]);
                    Some(statistics::anomaly(
                        &population_stats,
                        &trace,
                        options.threshold_sigma,
                    ))
                }
                Err(e) => return e.into(),
            },
            None => None,
        };

        let result = AnalyzeTraceResult {
            durations: span_algebra::durations(&trace),
            errors: span_algebra::errors(&trace),
            critical_path: Some(critical_path::analyze(&trace)),
            call_graph: if options.include_call_graph {
                Some(span_algebra::call_graph(&trace))
            } else {
                None
            },
            anomaly,
            quality,
        };
        Finding::success(result)
    }

    /// fetch -> run C7 detectors -> aggregate overall health.
    #[instrument(skip(self, credentials, cancel))]
    pub fn run_sre_patterns(
        &self,
        project: &str,
        trace_id: &str,
        credentials: &Credentials,
        cancel: &CancelToken,
        options: &EngineOptions,
    ) -> Finding<SrePatternReport> {
        let trace = match self.fetch(project, trace_id, credentials, cancel) {
            Ok(t) => t,
            Err(e) => return e.into(),
        };
        let thresholds = &options.pattern_thresholds;
        Finding::success(patterns::detect_all(
            &trace,
            thresholds.retry,
            thresholds.timeout_ms,
            thresholds.pool_wait_ms,
        ))
    }

    /// fetch both -> timings/structure diff; optionally causal analysis.
    #[instrument(skip(self, credentials, cancel))]
    pub fn compare(
        &self,
        project: &str,
        baseline_id: &str,
        target_id: &str,
        include_causal: bool,
        credentials: &Credentials,
        cancel: &CancelToken,
    ) -> Finding<CompareResult> {
        let baseline = match self.fetch(project, baseline_id, credentials, cancel) {
            Ok(t) => t,
            Err(e) => return e.into(),
        };
        let target = match self.fetch(project, target_id, credentials, cancel) {
            Ok(t) => t,
            Err(e) => return e.into(),
        };

        let result = CompareResult {
            timings: diff::compare_timings(&baseline, &target),
            structure: diff::compare_structure(&baseline, &target),
            causal: if include_causal {
                Some(diff::causal_analysis(&baseline, &target))
            } else {
                None
            },
        };
        Finding::success(result)
    }

    /// Lists recent/slow/error-filtered ids, fetches them through the pool,
    /// then picks a baseline (closest to population p50) and an anomaly
    /// (highest composite score, see SPEC_FULL.md §4.9).
    #[instrument(skip(self, credentials, cancel))]
    pub fn find_example_traces(
        &self,
        project: &str,
        filter: &str,
        credentials: &Credentials,
        cancel: &CancelToken,
        options: &EngineOptions,
    ) -> Finding<ExampleTraces> {
        let recent = match self
            .source
            .list_ids(project, filter, 50, credentials, cancel)
        {
            Ok(ids) => ids,
            Err(e) => return EngineError::from(e).into(),
        };

        if recent.is_empty() {
            return EngineError::insufficient_data("no traces matched the filter").into();
        }

        let source = self.source.clone();
        let project_owned = project.to_string();
        let credentials_owned = credentials.clone();
        let cancel_owned = cancel.clone();
        let (fetched, failed) = fetch_pool::fetch_all(&recent, options.max_in_flight, cancel, move |id| {
            source
                .fetch_one(&project_owned, id, &credentials_owned, &cancel_owned)
                .map_err(|e| e.to_string())
        });

        if fetched.is_empty() {
            return EngineError::insufficient_data(format!(
                "all {} trace fetches failed",
                failed + fetched.len()
            ))
            .into();
        }

        let traces: Vec<Trace> = fetched.iter().map(|(_, t): &(String, Trace)| t.clone()).collect();
        let population = statistics::latency_stats(&traces);
        let p50 = population.overall.median;

        let mut sorted_by_id = traces.clone();
        sorted_by_id.sort_by(|a, b| a.trace_id.cmp(&b.trace_id));

        let baseline = sorted_by_id
            .iter()
            .min_by(|a, b| {
                let da = (a.duration_ms - p50).abs();
                let db = (b.duration_ms - p50).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned();

        let Some(baseline) = baseline else {
            return EngineError::insufficient_data("no baseline candidate").into();
        };

        let anomaly = traces
            .iter()
            .map(|t| {
                let z = if population.overall.stdev == 0.0 {
                    0.0
                } else {
                    (t.duration_ms - population.overall.mean) / population.overall.stdev
                };
                let has_error = if span_algebra::errors(t).is_empty() { 0.0 } else { 1.0 };
                let magnitude_ratio = if baseline.duration_ms > 0.0 {
                    (t.duration_ms / baseline.duration_ms).min(5.0)
                } else {
                    0.0
                };
                let composite = z.abs() + 2.0 * has_error + magnitude_ratio;
                (t.clone(), composite)
            })
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(t, _)| t);

        Finding::success(ExampleTraces {
            baseline,
            anomaly,
            traces_fetched: fetched.len(),
            traces_requested: recent.len(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExampleTraces {
    pub baseline: Trace,
    pub anomaly: Option<Trace>,
    pub traces_fetched: usize,
    pub traces_requested: usize,
}
