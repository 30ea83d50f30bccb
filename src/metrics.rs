//! Prometheus metrics for dispatch outcomes.
//!
//! Metric names carry the sanitised namespace so several load generators can be scraped
//! into one Prometheus without clashing:
//!
//! - `query_load_test_<ns>`: latency histogram by query name
//! - `query_failures_count_<ns>`: failed dispatches by query name
//! - `query_load_test_spans_returned_<ns>`: result counts by query name
//! - `query_load_test_time_bucket_queries_total` / `..._duration_seconds`: per bucket and query
//! - `query_load_test_time_bucket_ineligible_total`: planned buckets that were not yet eligible

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

use crate::domain::Outcome;

const SPANS_RETURNED_BUCKETS: &[f64] = &[0.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0];

/// Receiver for per-dispatch signals. Implementations must not block.
pub trait MetricsSink: Send + Sync {
    fn record(&self, outcome: &Outcome);

    /// The plan asked for `bucket` but it could not contain data yet.
    fn record_ineligible(&self, query_name: &str, bucket_name: &str);
}

/// Folds a namespace into something valid inside a metric name.
pub fn sanitize_namespace(namespace: &str) -> String {
    namespace
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

pub struct PrometheusSink {
    registry: Registry,
    latency: HistogramVec,
    failures: CounterVec,
    spans_returned: HistogramVec,
    bucket_queries: CounterVec,
    bucket_duration: HistogramVec,
    bucket_ineligible: CounterVec,
}

impl PrometheusSink {
    pub fn new(namespace: &str) -> prometheus::Result<Self> {
        let ns = sanitize_namespace(namespace);
        let registry = Registry::new();

        let latency = HistogramVec::new(
            HistogramOpts::new(ns.clone(), "Query latency in seconds").namespace("query_load_test"),
            &["name"],
        )?;
        let failures = CounterVec::new(
            Opts::new(ns.clone(), "Total query failures").namespace("query_failures_count"),
            &["name"],
        )?;
        let spans_returned = HistogramVec::new(
            HistogramOpts::new(ns, "Number of spans returned per query")
                .namespace("query_load_test")
                .subsystem("spans_returned")
                .buckets(SPANS_RETURNED_BUCKETS.to_vec()),
            &["name"],
        )?;
        let bucket_queries = CounterVec::new(
            Opts::new("queries_total", "Total queries executed per time bucket")
                .namespace("query_load_test")
                .subsystem("time_bucket"),
            &["bucket", "query_name"],
        )?;
        let bucket_duration = HistogramVec::new(
            HistogramOpts::new("duration_seconds", "Query duration per time bucket")
                .namespace("query_load_test")
                .subsystem("time_bucket"),
            &["bucket", "query_name"],
        )?;
        let bucket_ineligible = CounterVec::new(
            Opts::new(
                "ineligible_total",
                "Dispatches whose planned time bucket could not contain data yet",
            )
            .namespace("query_load_test")
            .subsystem("time_bucket"),
            &["bucket", "query_name"],
        )?;

        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        registry.register(Box::new(spans_returned.clone()))?;
        registry.register(Box::new(bucket_queries.clone()))?;
        registry.register(Box::new(bucket_duration.clone()))?;
        registry.register(Box::new(bucket_ineligible.clone()))?;

        Ok(Self {
            registry,
            latency,
            failures,
            spans_returned,
            bucket_queries,
            bucket_duration,
            bucket_ineligible,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format for a scrape.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %e, "failed to encode metrics");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl MetricsSink for PrometheusSink {
    fn record(&self, outcome: &Outcome) {
        let query = outcome.query_name.as_str();
        let bucket = outcome.bucket_name.as_str();
        let secs = outcome.latency.as_secs_f64();

        self.latency.with_label_values(&[query]).observe(secs);
        self.bucket_queries.with_label_values(&[bucket, query]).inc();
        self.bucket_duration
            .with_label_values(&[bucket, query])
            .observe(secs);

        match outcome.result_count {
            Some(count) if outcome.success => self
                .spans_returned
                .with_label_values(&[query])
                .observe(count as f64),
            _ => self.failures.with_label_values(&[query]).inc(),
        }
    }

    fn record_ineligible(&self, query_name: &str, bucket_name: &str) {
        self.bucket_ineligible
            .with_label_values(&[bucket_name, query_name])
            .inc();
    }
}
