use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::Display;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::BackendConfig;
use crate::domain::TimeWindow;

const TENANT_HEADER: &str = "X-Scope-OrgID";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Unit used when encoding window bounds as query parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TimestampUnit {
    #[default]
    Seconds,
    Microseconds,
}

impl TimestampUnit {
    /// Truncates `ts` to this unit.
    pub fn floor(self, ts: DateTime<Utc>) -> i64 {
        match self {
            TimestampUnit::Seconds => ts.timestamp(),
            TimestampUnit::Microseconds => ts.timestamp_micros(),
        }
    }

    /// Rounds `ts` up to this unit.
    pub fn ceil(self, ts: DateTime<Utc>) -> i64 {
        let nanos = ts.timestamp_subsec_nanos();
        let partial = match self {
            TimestampUnit::Seconds => nanos > 0,
            TimestampUnit::Microseconds => nanos % 1_000 > 0,
        };
        self.floor(ts) + i64::from(partial)
    }

    /// Encodes a window with both edges rounded inward, so the range sent never
    /// reaches past the bucket it was cut from.
    pub fn encode(self, window: TimeWindow) -> (i64, i64) {
        (self.ceil(window.start), self.floor(window.end))
    }
}

/// One read-style request: expression, optional range, result cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub window: Option<TimeWindow>,
    pub limit: u32,
}

/// Raw backend answer; interpretation happens in the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub status: u16,
    pub body: String,
}

impl SearchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait TraceBackend: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, BackendError>;

    /// Printable form of the request as it goes on the wire, secrets masked.
    fn describe(&self, request: &SearchRequest) -> String {
        format!("{request:?}")
    }
}

/// Tempo-compatible `/api/search` client, optionally behind a multi-tenant gateway.
#[derive(Clone)]
pub struct TempoBackend {
    client: reqwest::Client,
    search_url: String,
    tenant_id: Option<String>,
    token: Option<String>,
    timestamp_unit: TimestampUnit,
}

impl TempoBackend {
    pub fn new(cfg: &BackendConfig) -> Result<Self, BackendError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("query-load-generator/", env!("CARGO_PKG_VERSION"))),
        );
        let client = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .default_headers(headers)
            .danger_accept_invalid_certs(cfg.insecure_skip_verify)
            .build()?;

        let tenant_id = cfg.tenant_id.clone().filter(|t| !t.is_empty());
        let path = cfg
            .search_path
            .replace("{tenant}", tenant_id.as_deref().unwrap_or_default());
        let search_url = format!("{}{}", cfg.query_endpoint.trim_end_matches('/'), path);
        reqwest::Url::parse(&search_url)
            .map_err(|e| BackendError::InvalidRequest(format!("{search_url}: {e}")))?;

        let token = cfg.token_path.as_deref().and_then(|path| {
            match std::fs::read_to_string(path) {
                Ok(token) => {
                    info!(path = %path.display(), "bearer token loaded");
                    Some(token.trim().to_string()).filter(|t| !t.is_empty())
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "no bearer token, sending unauthenticated requests");
                    None
                }
            }
        });

        Ok(Self {
            client,
            search_url,
            tenant_id,
            token,
            timestamp_unit: cfg.timestamp_unit,
        })
    }

    pub fn search_url(&self) -> &str {
        &self.search_url
    }

    fn query_params(&self, request: &SearchRequest) -> Vec<(&'static str, String)> {
        let mut params = vec![("q", request.query.clone())];
        if let Some(window) = request.window {
            let (start, end) = self.timestamp_unit.encode(window);
            params.push(("start", start.to_string()));
            params.push(("end", end.to_string()));
        }
        params.push(("limit", request.limit.to_string()));
        params
    }
}

#[async_trait]
impl TraceBackend for TempoBackend {
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, BackendError> {
        let mut req = self
            .client
            .get(&self.search_url)
            .query(&self.query_params(request));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(tenant) = &self.tenant_id {
            req = req.header(TENANT_HEADER, tenant);
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        // An unreadable body still carries a status; it is counted as zero results.
        let body = match resp.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!(status, error = %e, "failed to read response body");
                String::new()
            }
        };
        Ok(SearchResponse { status, body })
    }

    fn describe(&self, request: &SearchRequest) -> String {
        let url = reqwest::Url::parse_with_params(&self.search_url, self.query_params(request))
            .map(|url| url.to_string())
            .unwrap_or_else(|_| self.search_url.clone());
        let mut line = format!("GET {url}");
        if let Some(tenant) = &self.tenant_id {
            line.push_str(&format!(" {TENANT_HEADER}: {tenant}"));
        }
        if self.token.is_some() {
            line.push_str(" Authorization: Bearer ***");
        }
        line
    }
}

#[derive(Debug, Deserialize)]
struct SearchBody {
    #[serde(default)]
    traces: Vec<TraceHit>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TraceHit {
    #[serde(default)]
    span_sets: Vec<SpanSet>,
    // non-structural queries report a single set per trace
    #[serde(default)]
    span_set: Option<SpanSet>,
}

#[derive(Debug, Deserialize)]
struct SpanSet {
    #[serde(default)]
    spans: Vec<serde_json::Value>,
}

/// Counts spans across all returned traces.
pub fn count_spans(body: &str) -> Result<u64, serde_json::Error> {
    let parsed: SearchBody = serde_json::from_str(body)?;
    let count = parsed
        .traces
        .iter()
        .map(|t| {
            t.span_sets.iter().map(|s| s.spans.len()).sum::<usize>()
                + t.span_set.as_ref().map_or(0, |s| s.spans.len())
        })
        .sum::<usize>();
    Ok(count as u64)
}

/// Default request timeout; long because slow queries are what the load test measures.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TimeBucket;
    use chrono::TimeZone;
    use std::path::PathBuf;
    use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(endpoint: &str) -> BackendConfig {
        BackendConfig {
            query_endpoint: endpoint.to_string(),
            tenant_id: Some("tenant-a".into()),
            token_path: None,
            ..BackendConfig::default()
        }
    }

    #[test]
    fn test_count_spans_structural_and_flat() {
        let body = r#"{
            "traces": [
                {"traceID": "a", "spanSets": [{"spans": [{"spanID": "1"}, {"spanID": "2"}], "matched": 2},
                                              {"spans": [{"spanID": "3"}], "matched": 1}]},
                {"traceID": "b", "spanSet": {"spans": [{"spanID": "4"}], "matched": 1}},
                {"traceID": "c"}
            ]
        }"#;
        assert_eq!(count_spans(body).unwrap(), 4);
        assert_eq!(count_spans(r#"{"traces": []}"#).unwrap(), 0);
        assert_eq!(count_spans("{}").unwrap(), 0);
        assert!(count_spans("<html>gateway timeout</html>").is_err());
    }

    #[test]
    fn test_timestamp_units() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(TimestampUnit::Seconds.floor(ts), 1_704_067_200);
        assert_eq!(TimestampUnit::Seconds.ceil(ts), 1_704_067_200);
        assert_eq!(TimestampUnit::Microseconds.floor(ts), 1_704_067_200_000_000);
        assert_eq!(TimestampUnit::Microseconds.to_string(), "microseconds");
    }

    #[test]
    fn test_encoded_window_rounds_inward() {
        // now = ...200.9s, bucket 0-60s
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::milliseconds(200_900);
        let bucket = TimeBucket::new("recent", Duration::ZERO, Duration::from_secs(60));
        let window = bucket.window_at(now, Duration::ZERO);

        let (start, end) = TimestampUnit::Seconds.encode(window);
        assert_eq!(start, 1_704_067_341);
        assert_eq!(end, 1_704_067_400);
        assert!(start >= window.start.timestamp());
        assert!(end <= window.end.timestamp());

        let (start, end) = TimestampUnit::Microseconds.encode(window);
        assert_eq!(start, 1_704_067_340_900_000);
        assert_eq!(end, 1_704_067_400_900_000);
    }

    #[test]
    fn test_narrowest_window_encodes_non_empty() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::milliseconds(200_500);
        let bucket = TimeBucket::new("thin", Duration::from_secs(30), Duration::from_secs(32));
        for jitter_ms in [0, 700, 2_000, 60_000] {
            let window = bucket.window_at(now, Duration::from_millis(jitter_ms));
            let (start, end) = TimestampUnit::Seconds.encode(window);
            assert!(start < end, "jitter {jitter_ms}ms encoded {start}..{end}");
        }
    }

    #[test]
    fn test_search_url_substitutes_tenant() {
        let backend = TempoBackend::new(&config("http://tempo:8080/")).unwrap();
        assert_eq!(
            backend.search_url(),
            "http://tempo:8080/api/traces/v1/tenant-a/tempo/api/search"
        );
    }

    #[test]
    fn test_missing_token_file_is_not_fatal() {
        let cfg = BackendConfig {
            token_path: Some(PathBuf::from("/nonexistent/token")),
            ..config("http://tempo:8080")
        };
        assert!(TempoBackend::new(&cfg).is_ok());
    }

    #[test]
    fn test_describe_shows_wire_request_and_masks_token() {
        let token_path = std::env::temp_dir().join(format!("qlg-token-{}", std::process::id()));
        std::fs::write(&token_path, "s3cret\n").unwrap();
        let cfg = BackendConfig {
            token_path: Some(token_path.clone()),
            ..config("http://tempo:8080")
        };
        let backend = TempoBackend::new(&cfg).unwrap();
        std::fs::remove_file(&token_path).unwrap();

        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let line = backend.describe(&SearchRequest {
            query: "{ }".into(),
            window: Some(TimeWindow {
                start,
                end: start + chrono::Duration::seconds(60),
            }),
            limit: 20,
        });
        assert!(line.starts_with("GET http://tempo:8080/api/traces/v1/tenant-a/tempo/api/search?"));
        assert!(line.contains("start=1704067200&end=1704067260&limit=20"));
        assert!(line.contains("X-Scope-OrgID: tenant-a"));
        assert!(line.contains("Bearer ***"));
        assert!(!line.contains("s3cret"));
    }

    #[tokio::test]
    async fn test_search_sends_window_tenant_and_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/traces/v1/tenant-a/tempo/api/search"))
            .and(query_param("q", "{ .service.name = \"api\" }"))
            .and(query_param("start", "1704067200"))
            .and(query_param("end", "1704067260"))
            .and(query_param("limit", "1000"))
            .and(header(TENANT_HEADER, "tenant-a"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"traces": []}"#))
            .expect(1)
            .mount(&server)
            .await;

        let backend = TempoBackend::new(&config(&server.uri())).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let resp = backend
            .search(&SearchRequest {
                query: "{ .service.name = \"api\" }".into(),
                window: Some(TimeWindow {
                    start,
                    end: start + chrono::Duration::seconds(60),
                }),
                limit: 1000,
            })
            .await
            .unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.body, r#"{"traces": []}"#);
    }

    #[tokio::test]
    async fn test_immediate_search_has_no_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param_is_missing("start"))
            .and(query_param_is_missing("end"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .expect(1)
            .mount(&server)
            .await;

        let backend = TempoBackend::new(&config(&server.uri())).unwrap();
        let resp = backend
            .search(&SearchRequest {
                query: "{ }".into(),
                window: None,
                limit: 20,
            })
            .await
            .unwrap();
        assert_eq!(resp.status, 503);
        assert!(!resp.is_success());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        // Bind then drop to get a port with nothing listening.
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let backend = TempoBackend::new(&config(&format!("http://{addr}"))).unwrap();
        let err = backend
            .search(&SearchRequest {
                query: "{ }".into(),
                window: None,
                limit: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Transport(_)));
    }
}
