//! External options record (§6) and its TOML-file loading path.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternThresholds {
    pub retry: usize,
    pub timeout_ms: f64,
    pub pool_wait_ms: f64,
}

impl Default for PatternThresholds {
    fn default() -> Self {
        Self {
            retry: 3,
            timeout_ms: 1000.0,
            pool_wait_ms: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineOptions {
    pub include_call_graph: bool,
    pub threshold_sigma: f64,
    pub pattern_thresholds: PatternThresholds,
    pub max_in_flight: usize,
    pub cache_ttl_ms: u64,
    pub cache_max_entries: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            include_call_graph: true,
            threshold_sigma: 2.0,
            pattern_thresholds: PatternThresholds::default(),
            max_in_flight: 10,
            cache_ttl_ms: 60_000,
            cache_max_entries: 10_000,
        }
    }
}

impl EngineOptions {
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config file {}", path.as_ref().display()))?;
        toml::from_str(&text).context("parsing engine config TOML")
    }
}
