use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A named backend query expression. Opaque apart from the time range the executor attaches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryTemplate {
    pub name: String,
    pub expression: String,
}

impl QueryTemplate {
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expression: expression.into(),
        }
    }
}

/// Result of a single dispatch, handed to the metrics sink and then dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub query_name: String,
    /// Bucket the dispatch actually ran against (`immediate` when no range was sent).
    pub bucket_name: String,
    pub latency: Duration,
    pub success: bool,
    /// Matched result units; `None` for failures.
    pub result_count: Option<u64>,
}

impl Outcome {
    pub fn success(
        query_name: impl Into<String>,
        bucket_name: impl Into<String>,
        latency: Duration,
        result_count: u64,
    ) -> Self {
        Self {
            query_name: query_name.into(),
            bucket_name: bucket_name.into(),
            latency,
            success: true,
            result_count: Some(result_count),
        }
    }

    pub fn failure(
        query_name: impl Into<String>,
        bucket_name: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            query_name: query_name.into(),
            bucket_name: bucket_name.into(),
            latency,
            success: false,
            result_count: None,
        }
    }
}
