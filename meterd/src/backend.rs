//! Metrics backend abstraction.
//!
//! This module defines the `MetricsBackend` trait used to evaluate a query at a single instant,
//! and a production implementation backed by the Prometheus HTTP API. The query expression is
//! opaque to the pipeline; only the returned scalar matters.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use url::Url;

/// Result of a successful point-in-time query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QueryValue {
    /// Exactly one sample was returned
    Found(f64),
    /// The query matched no series at the evaluation instant
    NotFound,
    /// The query matched more than one series, so no single value can be attributed
    Ambiguous { series: usize },
}

/// Errors returned by a metrics backend for a single query.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// The backend could not be reached at all (connection refused, DNS, TLS, ...)
    #[error("metrics backend unreachable: {0}")]
    Unreachable(String),

    /// The query did not complete within its deadline
    #[error("query timed out after {0:?}")]
    TimedOut(Duration),

    /// The backend answered but refused the query
    #[error("query rejected by metrics backend (status {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The backend answered with something that is not a usable query result
    #[error("malformed query response: {0}")]
    Malformed(String),
}

/// Trait for evaluating a query at a single instant.
///
/// Implementations make exactly one attempt per call; retries are the scheduler's business.
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    /// Evaluate `query` at instant `at`.
    ///
    /// # Arguments
    /// * `query` - Opaque query expression
    /// * `at` - Evaluation instant
    /// * `timeout` - Per-call timeout, also forwarded to the backend when it supports one
    async fn query(&self, query: &str, at: DateTime<Utc>, timeout: Duration) -> Result<QueryValue, QueryError>;
}

// ============================================================================
// Prometheus HTTP API
// ============================================================================

/// Metrics backend talking to the Prometheus instant query endpoint (`/api/v1/query`).
#[derive(Clone)]
pub struct PrometheusBackend {
    client: reqwest::Client,
    base_url: Url,
}

impl PrometheusBackend {
    pub fn new(base_url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn query_url(&self) -> String {
        format!("{}/api/v1/query", self.base_url.as_str().trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum QueryData {
    Vector(Vec<VectorSample>),
    Scalar(SamplePair),
    Matrix(serde_json::Value),
    String(serde_json::Value),
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    #[serde(default)]
    #[allow(dead_code)]
    metric: HashMap<String, String>,
    value: SamplePair,
}

/// `[<unix seconds>, "<value>"]`
#[derive(Debug, Deserialize)]
struct SamplePair(#[allow(dead_code)] f64, String);

impl SamplePair {
    fn parse(&self) -> Result<f64, QueryError> {
        self.1
            .parse::<f64>()
            .map_err(|e| QueryError::Malformed(format!("sample value {:?}: {}", self.1, e)))
    }
}

fn interpret(data: QueryData) -> Result<QueryValue, QueryError> {
    match data {
        QueryData::Vector(samples) => match samples.as_slice() {
            [] => Ok(QueryValue::NotFound),
            [only] => Ok(QueryValue::Found(only.value.parse()?)),
            many => Ok(QueryValue::Ambiguous { series: many.len() }),
        },
        QueryData::Scalar(pair) => Ok(QueryValue::Found(pair.parse()?)),
        QueryData::Matrix(_) => Err(QueryError::Malformed("unexpected result type 'matrix'".to_string())),
        QueryData::String(_) => Err(QueryError::Malformed("unexpected result type 'string'".to_string())),
    }
}

#[async_trait]
impl MetricsBackend for PrometheusBackend {
    #[tracing::instrument(skip(self, timeout), fields(at = %at))]
    async fn query(&self, query: &str, at: DateTime<Utc>, timeout: Duration) -> Result<QueryValue, QueryError> {
        let response = self
            .client
            .get(self.query_url())
            .query(&[
                ("query", query.to_string()),
                ("time", at.timestamp().to_string()),
                ("timeout", format!("{}ms", timeout.as_millis())),
            ])
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    QueryError::TimedOut(timeout)
                } else {
                    QueryError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                QueryError::TimedOut(timeout)
            } else {
                QueryError::Malformed(format!("failed to read response body: {}", e))
            }
        })?;

        let parsed = serde_json::from_str::<ApiResponse>(&body);

        if !status.is_success() {
            let message = match parsed {
                Ok(ApiResponse { error_type, error, .. }) => format!(
                    "{}: {}",
                    error_type.unwrap_or_else(|| "error".to_string()),
                    error.unwrap_or_default()
                ),
                Err(_) => body,
            };
            return Err(QueryError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let parsed = parsed.map_err(|e| QueryError::Malformed(e.to_string()))?;

        if !parsed.warnings.is_empty() {
            tracing::warn!(query, warnings = ?parsed.warnings, "Metrics backend returned warnings");
        }

        if parsed.status != "success" {
            return Err(QueryError::Rejected {
                status: status.as_u16(),
                message: parsed.error.unwrap_or_else(|| format!("status '{}'", parsed.status)),
            });
        }

        let data = parsed
            .data
            .ok_or_else(|| QueryError::Malformed("response has no data".to_string()))?;
        let value = interpret(data)?;

        tracing::debug!(query, value = ?value, "Query evaluated");
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn at() -> DateTime<Utc> {
        "2024-01-01T02:00:00Z".parse().unwrap()
    }

    fn vector(values: &[&str]) -> serde_json::Value {
        let result: Vec<_> = values
            .iter()
            .map(|v| json!({ "metric": { "__name__": "billing:cpu" }, "value": [1704074400, v] }))
            .collect();
        json!({ "status": "success", "data": { "resultType": "vector", "result": result } })
    }

    async fn backend_for(server: &MockServer) -> PrometheusBackend {
        PrometheusBackend::new(Url::parse(&server.uri()).unwrap())
    }

    #[tokio::test]
    async fn test_single_series_is_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .and(query_param("query", "billing:cpu_capacity:last1h"))
            .and(query_param("time", "1704074400"))
            .and(query_param("timeout", "5000ms"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vector(&["4.75"])))
            .expect(1)
            .mount(&server)
            .await;

        let backend = backend_for(&server).await;
        let value = backend
            .query("billing:cpu_capacity:last1h", at(), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(value, QueryValue::Found(4.75));
    }

    #[tokio::test]
    async fn test_empty_and_multi_series_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("query", "empty"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vector(&[])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("query", "many"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vector(&["1", "2"])))
            .mount(&server)
            .await;

        let backend = backend_for(&server).await;
        let timeout = Duration::from_secs(5);

        assert_eq!(backend.query("empty", at(), timeout).await.unwrap(), QueryValue::NotFound);
        assert_eq!(
            backend.query("many", at(), timeout).await.unwrap(),
            QueryValue::Ambiguous { series: 2 }
        );
    }

    #[tokio::test]
    async fn test_scalar_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": { "resultType": "scalar", "result": [1704074400, "100"] }
            })))
            .mount(&server)
            .await;

        let backend = backend_for(&server).await;
        let value = backend.query("scalar(1)", at(), Duration::from_secs(5)).await.unwrap();

        assert_eq!(value, QueryValue::Found(100.0));
    }

    #[tokio::test]
    async fn test_api_error_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "status": "error",
                "errorType": "bad_data",
                "error": "parse error at char 4"
            })))
            .mount(&server)
            .await;

        let backend = backend_for(&server).await;
        let err = backend.query("sum(", at(), Duration::from_secs(5)).await.unwrap_err();

        assert_eq!(
            err,
            QueryError::Rejected {
                status: 400,
                message: "bad_data: parse error at char 4".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_garbage_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy error</html>"))
            .mount(&server)
            .await;

        let backend = backend_for(&server).await;
        let err = backend.query("up", at(), Duration::from_secs(5)).await.unwrap_err();

        assert!(matches!(err, QueryError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(vector(&["1"]))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let backend = backend_for(&server).await;
        let err = backend.query("up", at(), Duration::from_millis(50)).await.unwrap_err();

        assert_eq!(err, QueryError::TimedOut(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        // Nothing listens on port 9 (discard) on the loopback interface in test environments
        let backend = PrometheusBackend::new(Url::parse("http://127.0.0.1:9").unwrap());
        let err = backend.query("up", at(), Duration::from_secs(2)).await.unwrap_err();

        assert!(matches!(err, QueryError::Unreachable(_)), "got {err:?}");
    }
}
