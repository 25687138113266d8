//! Trace source adapters (C1). The engine depends only on the `TraceSource`
//! trait; credential handling and transport specifics live behind it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::model::{CancelToken, Credentials, Trace};

#[derive(thiserror::Error, Debug, Clone)]
pub enum SourceError {
    #[error("trace not found: {id}")]
    NotFound { id: String },
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("permission denied")]
    PermissionDenied,
    #[error("transient failure: {message}")]
    Transient { message: String },
    #[error("malformed record: {message}")]
    Malformed { message: String },
}

/// Polymorphic provider that resolves a trace id (or filter) to a
/// normalized trace record. Implementations own their own synchronization;
/// the engine treats every call as safe for concurrent use.
pub trait TraceSource: Send + Sync {
    fn fetch_one(
        &self,
        project: &str,
        trace_id: &str,
        credentials: &Credentials,
        cancel: &CancelToken,
    ) -> Result<Trace, SourceError>;

    fn list_ids(
        &self,
        project: &str,
        filter: &str,
        limit: usize,
        credentials: &Credentials,
        cancel: &CancelToken,
    ) -> Result<Vec<String>, SourceError>;
}

/// In-memory fixture source for tests and the demo binary. Traces are
/// inserted ahead of time; `list_ids` returns them most-recently-inserted
/// first, ignoring `filter` (the fixture has no query language).
#[derive(Default)]
pub struct FixtureSource {
    traces: Mutex<Vec<Trace>>,
}

impl FixtureSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, trace: Trace) {
        self.traces.lock().expect("fixture lock poisoned").push(trace);
    }

    pub fn with_traces(traces: Vec<Trace>) -> Self {
        Self {
            traces: Mutex::new(traces),
        }
    }
}

impl TraceSource for FixtureSource {
    fn fetch_one(
        &self,
        _project: &str,
        trace_id: &str,
        _credentials: &Credentials,
        _cancel: &CancelToken,
    ) -> Result<Trace, SourceError> {
        self.traces
            .lock()
            .expect("fixture lock poisoned")
            .iter()
            .find(|t| t.trace_id == trace_id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound {
                id: trace_id.to_string(),
            })
    }

    fn list_ids(
        &self,
        _project: &str,
        _filter: &str,
        limit: usize,
        _credentials: &Credentials,
        _cancel: &CancelToken,
    ) -> Result<Vec<String>, SourceError> {
        let traces = self.traces.lock().expect("fixture lock poisoned");
        Ok(traces
            .iter()
            .rev()
            .take(limit)
            .map(|t| t.trace_id.clone())
            .collect())
    }
}

/// Reads one JSON-encoded trace per file from a directory. File stem is
/// treated as the trace id unless the record's own `trace_id` differs, in
/// which case the record wins.
pub struct FileSource {
    root: PathBuf,
}

impl FileSource {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, trace_id: &str) -> PathBuf {
        self.root.join(format!("{trace_id}.json"))
    }
}

impl TraceSource for FileSource {
    fn fetch_one(
        &self,
        _project: &str,
        trace_id: &str,
        _credentials: &Credentials,
        _cancel: &CancelToken,
    ) -> Result<Trace, SourceError> {
        let path = self.path_for(trace_id);
        let bytes = fs::read(&path).map_err(|e| SourceError::NotFound {
            id: format!("{trace_id} ({e})"),
        })?;
        serde_json::from_slice(&bytes).map_err(|e| SourceError::Malformed {
            message: e.to_string(),
        })
    }

    fn list_ids(
        &self,
        _project: &str,
        _filter: &str,
        limit: usize,
        _credentials: &Credentials,
        _cancel: &CancelToken,
    ) -> Result<Vec<String>, SourceError> {
        let entries = fs::read_dir(&self.root).map_err(|e| SourceError::Transient {
            message: e.to_string(),
        })?;
        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                if path.extension().and_then(|s| s.to_str()) == Some("json") {
                    path.file_stem()?.to_str().map(str::to_string)
                } else {
                    None
                }
            })
            .collect();
        ids.sort();
        ids.truncate(limit);
        Ok(ids)
    }
}

/// Blocking HTTP-backed remote trace source. Gated behind the `remote`
/// feature so the default build carries no network-client surface.
#[cfg(feature = "remote")]
pub struct RemoteSource {
    base_url: String,
    client: reqwest::blocking::Client,
}

#[cfg(feature = "remote")]
impl RemoteSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::blocking::Client::new(),
        }
    }
}

#[cfg(feature = "remote")]
impl TraceSource for RemoteSource {
    fn fetch_one(
        &self,
        project: &str,
        trace_id: &str,
        credentials: &Credentials,
        _cancel: &CancelToken,
    ) -> Result<Trace, SourceError> {
        let url = format!("{}/projects/{project}/traces/{trace_id}", self.base_url);
        let mut req = self.client.get(&url);
        if let Some(token) = &credentials.bearer_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().map_err(|e| SourceError::Transient {
            message: e.to_string(),
        })?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound {
                id: trace_id.to_string(),
            });
        }
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SourceError::Unauthenticated);
        }
        if resp.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(SourceError::PermissionDenied);
        }
        if resp.status().is_server_error() || resp.status().as_u16() == 429 {
            return Err(SourceError::Transient {
                message: format!("server returned {}", resp.status()),
            });
        }
        resp.json().map_err(|e| SourceError::Malformed {
            message: e.to_string(),
        })
    }

    fn list_ids(
        &self,
        project: &str,
        filter: &str,
        limit: usize,
        credentials: &Credentials,
        _cancel: &CancelToken,
    ) -> Result<Vec<String>, SourceError> {
        let url = format!("{}/projects/{project}/traces", self.base_url);
        let mut req = self
            .client
            .get(&url)
            .query(&[("filter", filter), ("limit", &limit.to_string())]);
        if let Some(token) = &credentials.bearer_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().map_err(|e| SourceError::Transient {
            message: e.to_string(),
        })?;
        let ids: Vec<String> = resp.json().map_err(|e| SourceError::Malformed {
            message: e.to_string(),
        })?;
        Ok(ids)
    }
}

/// Builder for the Cloud Trace v1-style filter grammar consumed by
/// `list_ids`. A convenience, not a parser: the grammar is opaque to the
/// engine, which only passes the built string through.
#[derive(Debug, Clone, Default)]
pub struct TraceFilterBuilder {
    terms: Vec<String>,
}

impl TraceFilterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_latency(mut self, min_ms: u64) -> Self {
        self.terms.push(format!("latency:{min_ms}ms"));
        self
    }

    pub fn add_error(mut self, error: bool) -> Self {
        self.terms.push(format!("error:{error}"));
        self
    }

    pub fn add_root_span_name(mut self, name: &str) -> Self {
        self.terms.push(format!("root:{}", quote_term(name)));
        self
    }

    pub fn add_span_name(mut self, name: &str) -> Self {
        self.terms.push(format!("span.name:{}", quote_term(name)));
        self
    }

    pub fn add_attribute(mut self, key: &str, value: &str) -> Self {
        self.terms.push(format!("{key}:{}", quote_term(value)));
        self
    }

    pub fn build(self) -> String {
        self.terms.join(" ")
    }
}

fn bare_token(s: &str) -> bool {
    static BARE_TOKEN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    BARE_TOKEN
        .get_or_init(|| regex::Regex::new(r"^[a-zA-Z0-9./_-]+$").expect("static regex"))
        .is_match(s)
}

fn quote_term(value: &str) -> String {
    if bare_token(value) {
        value.to_string()
    } else {
        format!("\"{}\"", value.replace('"', "\\\""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn trace(id: &str) -> Trace {
        Trace {
            trace_id: id.to_string(),
            project: "p".to_string(),
            duration_ms: 10.0,
            spans: vec![],
        }
    }

    #[test]
    fn fixture_round_trips_by_id() {
        let source = FixtureSource::new();
        source.insert(trace("t1"));
        let creds = Credentials::anonymous();
        let cancel = CancelToken::new();
        let got = source.fetch_one("p", "t1", &creds, &cancel).unwrap();
        assert_eq!(got.trace_id, "t1");
    }

    #[test]
    fn fixture_missing_id_is_not_found() {
        let source = FixtureSource::new();
        let creds = Credentials::anonymous();
        let cancel = CancelToken::new();
        let err = source.fetch_one("p", "missing", &creds, &cancel).unwrap_err();
        assert!(matches!(err, SourceError::NotFound { .. }));
    }

    #[test]
    fn filter_builder_quotes_non_bare_values() {
        let filter = TraceFilterBuilder::new()
            .add_latency(500)
            .add_error(true)
            .add_attribute("service.name", "checkout api")
            .build();
        assert!(filter.contains("latency:500ms"));
        assert!(filter.contains("error:true"));
        assert!(filter.contains("service.name:\"checkout api\""));
    }

    #[test]
    fn filter_builder_leaves_bare_tokens_unquoted() {
        let filter = TraceFilterBuilder::new()
            .add_attribute("/http/status_code", "500")
            .build();
        assert_eq!(filter, "/http/status_code:500");
    }

    #[test]
    fn empty_labels_do_not_panic_label_match() {
        let span = crate::model::Span {
            span_id: "s".into(),
            parent_span_id: String::new(),
            name: "op".into(),
            start_unix: Some(0.0),
            end_unix: Some(1.0),
            start_iso: None,
            end_iso: None,
            labels: Map::new(),
        };
        assert!(!span.label_matches_any(&["timeout"]));
    }
}
