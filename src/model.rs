//! Core data model: traces, spans, findings, and the explicit credential/
//! cancellation handles threaded through every operation in this crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// One timed operation within a distributed request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Span {
    pub span_id: String,
    #[serde(default)]
    pub parent_span_id: String,
    pub name: String,
    pub start_unix: Option<f64>,
    pub end_unix: Option<f64>,
    #[serde(default)]
    pub start_iso: Option<String>,
    #[serde(default)]
    pub end_iso: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Span {
    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_empty()
    }

    /// Duration in milliseconds, preferring unix timestamps over ISO-8601
    /// fallback parsing. `None` when neither representation is usable.
    pub fn duration_ms(&self) -> Option<f64> {
        if let (Some(start), Some(end)) = (self.start_unix, self.end_unix) {
            return Some((end - start).max(0.0) * 1000.0);
        }
        let start = parse_iso(self.start_iso.as_deref()?)?;
        let end = parse_iso(self.end_iso.as_deref()?)?;
        Some((end - start).max(0.0) * 1000.0)
    }

    /// Unclamped duration, used only where a negative value is itself the
    /// signal (quality validation). `duration_ms` clamps to zero per the
    /// derived-field invariant; this does not.
    pub fn raw_duration_ms(&self) -> Option<f64> {
        if let (Some(start), Some(end)) = (self.start_unix, self.end_unix) {
            return Some((end - start) * 1000.0);
        }
        let start = parse_iso(self.start_iso.as_deref()?)?;
        let end = parse_iso(self.end_iso.as_deref()?)?;
        Some((end - start) * 1000.0)
    }

    pub fn label_matches_any(&self, needles: &[&str]) -> bool {
        self.labels
            .keys()
            .any(|k| needles.iter().any(|n| k.to_lowercase().contains(n)))
    }
}

/// Minimal ISO-8601 timestamp parser covering the `YYYY-MM-DDTHH:MM:SS(.sss)?Z`
/// shape traces emit; returns seconds since epoch. Not a general calendar
/// parser — only as much as fallback span timing requires.
fn parse_iso(s: &str) -> Option<f64> {
    let s = s.trim_end_matches('Z');
    let (date, time) = s.split_once('T')?;
    let mut date_parts = date.splitn(3, '-');
    let year: i64 = date_parts.next()?.parse().ok()?;
    let month: i64 = date_parts.next()?.parse().ok()?;
    let day: i64 = date_parts.next()?.parse().ok()?;

    let mut time_parts = time.splitn(3, ':');
    let hour: f64 = time_parts.next()?.parse().ok()?;
    let minute: f64 = time_parts.next()?.parse().ok()?;
    let second: f64 = time_parts.next()?.parse().ok()?;

    let days_since_epoch = days_from_civil(year, month, day);
    Some(days_since_epoch as f64 * 86_400.0 + hour * 3600.0 + minute * 60.0 + second)
}

/// Howard Hinnant's days-from-civil algorithm (proleptic Gregorian, epoch 1970-01-01).
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// A tree of spans corresponding to one end-to-end request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,
    pub project: String,
    pub duration_ms: f64,
    pub spans: Vec<Span>,
}

impl Trace {
    pub fn span_by_id(&self, id: &str) -> Option<&Span> {
        self.spans.iter().find(|s| s.span_id == id)
    }
}

/// Caller identity, passed explicitly on every `TraceSource` call rather
/// than carried in thread-local or task-local state.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub bearer_token: Option<String>,
    pub project_override: Option<String>,
}

impl Credentials {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer_token: Some(token.into()),
            project_override: None,
        }
    }
}

/// A cooperative cancellation flag threaded explicitly through fetches and
/// population-level analyses. Checked between traces and between patterns,
/// never inside tight inner loops (per-span iteration).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The common envelope every analysis-facing operation returns: a status
/// discriminant plus a payload or a typed error, with room for free-form
/// operation metadata (fetch counts, per-pattern status, etc.).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Finding<T> {
    Success {
        result: T,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        metadata: HashMap<String, serde_json::Value>,
    },
    Error {
        error_kind: crate::error::ErrorKind,
        message: String,
    },
}

impl<T> Finding<T> {
    pub fn success(result: T) -> Self {
        Finding::Success {
            result,
            metadata: HashMap::new(),
        }
    }

    pub fn success_with_metadata(result: T, metadata: HashMap<String, serde_json::Value>) -> Self {
        Finding::Success { result, metadata }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Finding::Success { .. })
    }
}

impl<T> From<crate::error::EngineError> for Finding<T> {
    fn from(err: crate::error::EngineError) -> Self {
        Finding::Error {
            error_kind: err.error_kind(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_prefers_unix_fields() {
        let span = Span {
            span_id: "s1".into(),
            parent_span_id: String::new(),
            name: "op".into(),
            start_unix: Some(10.0),
            end_unix: Some(10.25),
            start_iso: None,
            end_iso: None,
            labels: HashMap::new(),
        };
        assert_eq!(span.duration_ms(), Some(250.0));
    }

    #[test]
    fn duration_falls_back_to_iso() {
        let span = Span {
            span_id: "s1".into(),
            parent_span_id: String::new(),
            name: "op".into(),
            start_unix: None,
            end_unix: None,
            start_iso: Some("2024-01-01T00:00:00Z".into()),
            end_iso: Some("2024-01-01T00:00:01Z".into()),
            labels: HashMap::new(),
        };
        assert_eq!(span.duration_ms(), Some(1000.0));
    }

    #[test]
    fn duration_is_none_when_unparseable() {
        let span = Span {
            span_id: "s1".into(),
            parent_span_id: String::new(),
            name: "op".into(),
            start_unix: None,
            end_unix: None,
            start_iso: None,
            end_iso: None,
            labels: HashMap::new(),
        };
        assert_eq!(span.duration_ms(), None);
    }

    #[test]
    fn cancel_token_reflects_cancellation() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn is_root_detects_empty_parent() {
        let mut span = Span {
            span_id: "s1".into(),
            parent_span_id: String::new(),
            name: "op".into(),
            start_unix: Some(0.0),
            end_unix: Some(1.0),
            start_iso: None,
            end_iso: None,
            labels: HashMap::new(),
        };
        assert!(span.is_root());
        span.parent_span_id = "parent".into();
        assert!(!span.is_root());
    }
}
