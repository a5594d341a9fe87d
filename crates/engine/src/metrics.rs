//! Metrics backend seam for the KPI evaluator.
//!
//! The evaluator only needs scalar answers to instant PromQL queries, so
//! the trait is one method. Production talks to a Prometheus-compatible
//! HTTP API; tests script a [`MockBackend`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use phoenix_core::{Error, Result};

#[async_trait]
pub trait MetricsBackend: Send + Sync {
    /// Evaluate an instant query; vector results are summed into a scalar.
    async fn query(&self, promql: &str) -> Result<f64>;
}

// ── Prometheus HTTP API ──────────────────────────────────────────────

pub struct PromBackend {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: Option<PromData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct PromData {
    #[serde(default)]
    result: Vec<PromSample>,
}

#[derive(Deserialize)]
struct PromSample {
    /// `[unix_ts, "value"]`
    value: (f64, String),
}

impl PromBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Fatal(format!("http client init failed: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl MetricsBackend for PromBackend {
    async fn query(&self, promql: &str) -> Result<f64> {
        let url = format!("{}/api/v1/query", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .query(&[("query", promql)])
            .send()
            .await
            .map_err(|e| Error::Transient(format!("metrics query failed: {e}")))?;

        let body: PromResponse = response
            .json()
            .await
            .map_err(|e| Error::Transient(format!("metrics response unreadable: {e}")))?;

        if body.status != "success" {
            return Err(Error::Transient(format!(
                "metrics query rejected: {}",
                body.error.unwrap_or_else(|| "unknown error".into())
            )));
        }

        let sum = body
            .data
            .map(|d| {
                d.result
                    .iter()
                    .filter_map(|s| s.value.1.parse::<f64>().ok())
                    .sum()
            })
            .unwrap_or(0.0);
        debug!(promql, value = sum, "metrics query");
        Ok(sum)
    }
}

// ── Scripted mock ────────────────────────────────────────────────────

/// Test backend: answers are matched by substring against the query, in
/// insertion order; unmatched queries error like an unreachable backend.
#[derive(Default)]
pub struct MockBackend {
    answers: Mutex<Vec<(String, Result<f64>)>>,
    hits: Mutex<HashMap<String, u64>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(&self, needle: impl Into<String>, value: f64) {
        self.lock_answers().push((needle.into(), Ok(value)));
    }

    pub fn fail(&self, needle: impl Into<String>, message: impl Into<String>) {
        self.lock_answers()
            .push((needle.into(), Err(Error::Transient(message.into()))));
    }

    /// Drop every scripted answer (subsequent queries fail).
    pub fn clear(&self) {
        self.lock_answers().clear();
    }

    /// Times a query matching `needle` was served.
    pub fn hit_count(&self, needle: &str) -> u64 {
        match self.hits.lock() {
            Ok(hits) => hits.get(needle).copied().unwrap_or(0),
            Err(poisoned) => poisoned.into_inner().get(needle).copied().unwrap_or(0),
        }
    }

    fn lock_answers(&self) -> std::sync::MutexGuard<'_, Vec<(String, Result<f64>)>> {
        match self.answers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl MetricsBackend for MockBackend {
    async fn query(&self, promql: &str) -> Result<f64> {
        let answers = self.lock_answers();
        for (needle, outcome) in answers.iter() {
            if promql.contains(needle.as_str()) {
                match self.hits.lock() {
                    Ok(mut hits) => *hits.entry(needle.clone()).or_insert(0) += 1,
                    Err(poisoned) => {
                        *poisoned.into_inner().entry(needle.clone()).or_insert(0) += 1
                    }
                }
                return match outcome {
                    Ok(v) => Ok(*v),
                    Err(e) => Err(Error::Transient(e.to_string())),
                };
            }
        }
        Err(Error::Transient(format!("no scripted answer for: {promql}")))
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_matches_by_substring() {
        let mock = MockBackend::new();
        mock.answer(r#"variant="baseline""#, 100.0);
        mock.answer(r#"variant="candidate""#, 40.0);

        let baseline = mock
            .query(r#"sum(active_series{experiment_id="x",variant="baseline"})"#)
            .await
            .unwrap();
        assert_eq!(baseline, 100.0);
        assert_eq!(mock.hit_count(r#"variant="baseline""#), 1);
    }

    #[tokio::test]
    async fn test_mock_unscripted_query_errors() {
        let mock = MockBackend::new();
        let err = mock.query("up").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_prom_response_parsing() {
        let json = r#"{
            "status": "success",
            "data": {"resultType": "vector", "result": [
                {"metric": {"host": "h1"}, "value": [1712000000.0, "12.5"]},
                {"metric": {"host": "h2"}, "value": [1712000000.0, "7.5"]}
            ]}
        }"#;
        let parsed: PromResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.status, "success");
        let sum: f64 = parsed
            .data
            .unwrap()
            .result
            .iter()
            .filter_map(|s| s.value.1.parse::<f64>().ok())
            .sum();
        assert_eq!(sum, 20.0);
    }

    #[test]
    fn test_prom_error_response_parsing() {
        let json = r#"{"status": "error", "error": "query timed out"}"#;
        let parsed: PromResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.status, "error");
        assert_eq!(parsed.error.as_deref(), Some("query timed out"));
    }
}
