//! Service-level compliance over a population (supplement to C9, grounded
//! in `statistical_analysis.py`'s `compute_service_level_stats`).

use serde::{Deserialize, Serialize};

use crate::model::Trace;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SloReport {
    pub total: usize,
    pub within_slo: usize,
    pub violations: usize,
    pub compliance_pct: f64,
    pub error_budget_consumed_pct: f64,
}

/// Fraction of `traces` whose duration is at or under `slo_ms`, plus the
/// fraction of the implied 100%-minus-target error budget already consumed.
/// An empty population reports full compliance rather than dividing by zero.
pub fn service_level_stats(traces: &[Trace], slo_ms: f64, target_compliance_pct: f64) -> SloReport {
    let total = traces.len();
    if total == 0 {
        return SloReport {
            total: 0,
            within_slo: 0,
            violations: 0,
            compliance_pct: 100.0,
            error_budget_consumed_pct: 0.0,
        };
    }

    let within_slo = traces.iter().filter(|t| t.duration_ms <= slo_ms).count();
    let violations = total - within_slo;
    let compliance_pct = within_slo as f64 / total as f64 * 100.0;

    let allowed_violation_pct = (100.0 - target_compliance_pct).max(0.0);
    let actual_violation_pct = violations as f64 / total as f64 * 100.0;
    let error_budget_consumed_pct = if allowed_violation_pct > 0.0 {
        (actual_violation_pct / allowed_violation_pct * 100.0).min(999.0)
    } else {
        0.0
    };

    SloReport {
        total,
        within_slo,
        violations,
        compliance_pct,
        error_budget_consumed_pct,
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
    fn empty_population_reports_full_compliance() {
        let report = service_level_stats(&[], 100.0, 99.0);
        assert_eq!(report.compliance_pct, 100.0);
        assert_eq!(report.error_budget_consumed_pct, 0.0);
    }

    #[test]
    fn all_within_slo_consumes_no_budget() {
        let traces: Vec<Trace> = (0..10).map(|_| trace(50.0)).collect();
        let report = service_level_stats(&traces, 100.0, 99.0);
        assert_eq!(report.within_slo, 10);
        assert_eq!(report.compliance_pct, 100.0);
        assert_eq!(report.error_budget_consumed_pct, 0.0);
    }

    #[test]
    fn violations_consume_error_budget_proportionally() {
        let mut traces: Vec<Trace> = (0..9).map(|_| trace(50.0)).collect();
        traces.push(trace(500.0));
        let report = service_level_stats(&traces, 100.0, 90.0);
        assert_eq!(report.violations, 1);
        assert!((report.compliance_pct - 90.0).abs() < 1e-9);
        // allowed violation rate is 10%, actual is 10%, so budget is fully spent.
        assert!((report.error_budget_consumed_pct - 100.0).abs() < 1e-6);
    }
}
