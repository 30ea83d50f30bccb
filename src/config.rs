use figment::{
    providers::{Env, Format, Toml, Yaml},
    Figment,
};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum::Display;
use thiserror::Error;

use crate::domain::{
    BucketRegistry, ExecutionPlan, PlanEntry, PlanError, QueryTemplate, TimeBucket, IMMEDIATE_BUCKET,
    MIN_WINDOW,
};
use crate::executor::backend::{TimestampUnit, DEFAULT_REQUEST_TIMEOUT};

pub const CONFIG_FILE_ENV: &str = "CONFIG_FILE";
pub const DEFAULT_CONFIG_FILE: &str = "/config/config.yaml";
const ENV_PREFIX: &str = "QLG__";

/// Fatal configuration problems; any of these aborts startup before a worker runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("namespace must not be empty")]
    EmptyNamespace,

    #[error("backend.query_endpoint must not be empty")]
    EmptyEndpoint,

    #[error("backend.result_limit must be > 0")]
    ZeroResultLimit,

    #[error("no queries defined")]
    NoQueries,

    #[error("duplicate query name '{0}'")]
    DuplicateQuery(String),

    #[error("duplicate time bucket name '{0}'")]
    DuplicateBucket(String),

    #[error("time bucket name 'immediate' is reserved")]
    ReservedBucketName,

    #[error("time bucket '{name}': age_min ({age_min:?}) exceeds age_max ({age_max:?})")]
    InvertedBucket {
        name: String,
        age_min: Duration,
        age_max: Duration,
    },

    #[error("time bucket '{name}': width {width:?} is narrower than the 2s minimum")]
    NarrowBucket { name: String, width: Duration },

    #[error("query.window_jitter_ratio must be within [0, 1], got {0}")]
    InvalidJitterRatio(f64),

    #[error("query '{query}': target_qps must be a positive number, got {rate}")]
    InvalidRate { query: String, rate: f64 },

    #[error("query '{0}': concurrency must be >= 1")]
    ZeroConcurrency(String),

    #[error(transparent)]
    Plan(#[from] PlanError),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Load(Box::new(e))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub namespace: String,
    pub backend: BackendConfig,
    #[serde(default)]
    pub query: QueryDefaults,
    #[serde(default)]
    pub time_buckets: Vec<TimeBucket>,
    pub queries: Vec<QueryConfig>,
    #[serde(default)]
    pub execution_plan: Vec<PlanEntry>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub query_endpoint: String,
    pub tenant_id: Option<String>,
    /// Appended to the endpoint; `{tenant}` is replaced by `tenant_id`.
    pub search_path: String,
    pub token_path: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub result_limit: u32,
    pub timestamp_unit: TimestampUnit,
    pub insecure_skip_verify: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            query_endpoint: String::new(),
            tenant_id: None,
            search_path: "/api/traces/v1/{tenant}/tempo/api/search".to_string(),
            token_path: Some(PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/token",
            )),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            result_limit: 1000,
            timestamp_unit: TimestampUnit::Seconds,
            insecure_skip_verify: true,
        }
    }
}

/// What to do when a plan entry's bucket is not yet eligible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum IneligiblePolicy {
    /// Dispatch anyway, without a time range.
    #[default]
    Immediate,
    /// Spend the rate slot without dispatching.
    Skip,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryDefaults {
    pub concurrent_queries: usize,
    /// Total rate across all queries; split evenly unless a query sets its own.
    pub target_qps: f64,
    #[serde(with = "humantime_serde")]
    pub worker_start_jitter: Duration,
    pub ineligible_bucket_policy: IneligiblePolicy,
    pub window_jitter_ratio: f64,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            concurrent_queries: 1,
            target_qps: 1.0,
            worker_start_jitter: Duration::from_secs(1),
            ineligible_bucket_policy: IneligiblePolicy::Immediate,
            window_jitter_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    pub name: String,
    pub traceql: String,
    pub concurrency: Option<usize>,
    pub target_qps: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 2112)),
        }
    }
}

/// Per-query executor settings after defaults are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    pub concurrency: usize,
    pub target_rate: f64,
    pub start_jitter: Duration,
    pub ineligible_policy: IneligiblePolicy,
    pub result_limit: u32,
}

impl Config {
    /// Loads from `$CONFIG_FILE` (default `/config/config.yaml`) plus `QLG__` env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_FILE_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
        Self::load_from(path)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let figment = if path.extension().is_some_and(|ext| ext == "toml") {
            Figment::new().merge(Toml::file(path))
        } else {
            Figment::new().merge(Yaml::file(path))
        };
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Extracts and validates.
    pub fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let cfg: Config = figment.extract()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::EmptyNamespace);
        }
        if self.backend.query_endpoint.trim().is_empty() {
            return Err(ConfigError::EmptyEndpoint);
        }
        if self.backend.result_limit == 0 {
            return Err(ConfigError::ZeroResultLimit);
        }
        let ratio = self.query.window_jitter_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigError::InvalidJitterRatio(ratio));
        }

        let mut bucket_names = HashSet::new();
        for bucket in &self.time_buckets {
            if bucket.name == IMMEDIATE_BUCKET {
                return Err(ConfigError::ReservedBucketName);
            }
            if !bucket_names.insert(bucket.name.as_str()) {
                return Err(ConfigError::DuplicateBucket(bucket.name.clone()));
            }
            if bucket.age_min > bucket.age_max {
                return Err(ConfigError::InvertedBucket {
                    name: bucket.name.clone(),
                    age_min: bucket.age_min,
                    age_max: bucket.age_max,
                });
            }
            if bucket.width() < MIN_WINDOW {
                return Err(ConfigError::NarrowBucket {
                    name: bucket.name.clone(),
                    width: bucket.width(),
                });
            }
        }

        if self.queries.is_empty() {
            return Err(ConfigError::NoQueries);
        }
        let mut query_names = HashSet::new();
        for q in &self.queries {
            if !query_names.insert(q.name.as_str()) {
                return Err(ConfigError::DuplicateQuery(q.name.clone()));
            }
            let settings = self.executor_settings(q);
            if settings.concurrency == 0 {
                return Err(ConfigError::ZeroConcurrency(q.name.clone()));
            }
            if !settings.target_rate.is_finite() || settings.target_rate <= 0.0 {
                return Err(ConfigError::InvalidRate {
                    query: q.name.clone(),
                    rate: settings.target_rate,
                });
            }
        }

        self.execution_plan()
            .partition(&self.query_templates(), &self.bucket_registry())?;
        Ok(())
    }

    pub fn query_templates(&self) -> Vec<QueryTemplate> {
        self.queries
            .iter()
            .map(|q| QueryTemplate::new(q.name.clone(), q.traceql.clone()))
            .collect()
    }

    pub fn bucket_registry(&self) -> BucketRegistry {
        BucketRegistry::new(self.time_buckets.iter().cloned(), self.query.window_jitter_ratio)
    }

    pub fn execution_plan(&self) -> ExecutionPlan {
        ExecutionPlan::new(self.execution_plan.clone())
    }

    /// Per-query settings: explicit overrides win, otherwise the global defaults with the
    /// total rate split evenly across all declared queries.
    pub fn executor_settings(&self, query: &QueryConfig) -> ExecutorSettings {
        let shared_rate = self.query.target_qps / self.queries.len().max(1) as f64;
        ExecutorSettings {
            concurrency: query.concurrency.unwrap_or(self.query.concurrent_queries),
            target_rate: query.target_qps.unwrap_or(shared_rate),
            start_jitter: self.query.worker_start_jitter,
            ineligible_policy: self.query.ineligible_bucket_policy,
            result_limit: self.backend.result_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
namespace: tempo-perf
backend:
  query_endpoint: https://gateway.example:8080
  tenant_id: tenant-a
  request_timeout: 2m
query:
  concurrent_queries: 4
  target_qps: 20
  worker_start_jitter: 500ms
time_buckets:
  - { name: recent, age_min: 0s, age_max: 1m }
  - { name: mid, age_min: 1m, age_max: 5m }
  - { name: old, age_min: 5m, age_max: 15m }
queries:
  - { name: q1, traceql: "{ .service.name = \"api\" }" }
  - { name: q2, traceql: "{ status = error }", concurrency: 2, target_qps: 3.5 }
execution_plan:
  - { query_name: q1, bucket_name: recent }
  - { query_name: q1, bucket_name: mid }
  - { query_name: q1, bucket_name: old }
  - { query_name: q2, bucket_name: immediate }
"#;

    fn load(yaml: &str) -> Result<Config, ConfigError> {
        Config::extract(Figment::new().merge(Yaml::string(yaml)))
    }

    fn sample() -> Config {
        load(SAMPLE).unwrap()
    }

    #[test]
    fn test_sample_parses_with_defaults() {
        let cfg = sample();
        assert_eq!(cfg.namespace, "tempo-perf");
        assert_eq!(cfg.backend.request_timeout, Duration::from_secs(120));
        assert_eq!(cfg.backend.result_limit, 1000);
        assert_eq!(cfg.backend.timestamp_unit, TimestampUnit::Seconds);
        assert_eq!(cfg.time_buckets[2].age_max, Duration::from_secs(900));
        assert_eq!(cfg.query.worker_start_jitter, Duration::from_millis(500));
        assert_eq!(cfg.query.ineligible_bucket_policy, IneligiblePolicy::Immediate);
        assert_eq!(cfg.metrics.listen_addr.port(), 2112);
    }

    #[test]
    fn test_executor_settings_split_and_override() {
        let cfg = sample();
        let q1 = cfg.executor_settings(&cfg.queries[0]);
        assert_eq!(q1.concurrency, 4);
        assert!((q1.target_rate - 10.0).abs() < f64::EPSILON);

        let q2 = cfg.executor_settings(&cfg.queries[1]);
        assert_eq!(q2.concurrency, 2);
        assert!((q2.target_rate - 3.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_bad_duration_is_load_error() {
        let yaml = SAMPLE.replace("age_max: 15m", "age_max: fifteen");
        assert!(matches!(load(&yaml), Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_inverted_bucket_rejected() {
        let yaml = SAMPLE.replace("{ name: mid, age_min: 1m, age_max: 5m }", "{ name: mid, age_min: 10m, age_max: 5m }");
        assert!(matches!(load(&yaml), Err(ConfigError::InvertedBucket { .. })));
    }

    #[test]
    fn test_zero_width_bucket_rejected() {
        let yaml = SAMPLE.replace("{ name: mid, age_min: 1m, age_max: 5m }", "{ name: mid, age_min: 30s, age_max: 30s }");
        assert!(matches!(
            load(&yaml),
            Err(ConfigError::NarrowBucket { name, width }) if name == "mid" && width.is_zero()
        ));
    }

    #[test]
    fn test_dangling_bucket_rejected() {
        let yaml = SAMPLE.replace("bucket_name: old", "bucket_name: ancient");
        assert!(matches!(
            load(&yaml),
            Err(ConfigError::Plan(PlanError::UnknownBucket { .. }))
        ));
    }

    #[test]
    fn test_query_without_plan_rejected() {
        let yaml = SAMPLE.replace("  - { query_name: q2, bucket_name: immediate }\n", "");
        assert!(matches!(
            load(&yaml),
            Err(ConfigError::Plan(PlanError::NoEntries(q))) if q == "q2"
        ));
    }

    #[test]
    fn test_invalid_rate_and_concurrency_rejected() {
        let mut cfg = sample();
        cfg.queries[1].target_qps = Some(0.0);
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidRate { .. })));

        let mut cfg = sample();
        cfg.queries[1].target_qps = Some(f64::NAN);
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidRate { .. })));

        let mut cfg = sample();
        cfg.query.concurrent_queries = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroConcurrency(q)) if q == "q1"));
    }

    #[test]
    fn test_reserved_and_duplicate_names_rejected() {
        let mut cfg = sample();
        cfg.time_buckets.push(TimeBucket::new(IMMEDIATE_BUCKET, Duration::ZERO, Duration::ZERO));
        assert!(matches!(cfg.validate(), Err(ConfigError::ReservedBucketName)));

        let mut cfg = sample();
        cfg.time_buckets.push(cfg.time_buckets[0].clone());
        assert!(matches!(cfg.validate(), Err(ConfigError::DuplicateBucket(_))));

        let mut cfg = sample();
        cfg.queries.push(cfg.queries[0].clone());
        assert!(matches!(cfg.validate(), Err(ConfigError::DuplicateQuery(_))));
    }

    #[test]
    fn test_missing_namespace_and_endpoint_rejected() {
        let mut cfg = sample();
        cfg.namespace = " ".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyNamespace)));

        let mut cfg = sample();
        cfg.backend.query_endpoint.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyEndpoint)));
    }

    #[test]
    fn test_jitter_ratio_bounds() {
        let mut cfg = sample();
        cfg.query.window_jitter_ratio = 1.5;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidJitterRatio(_))));
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("config.yaml", SAMPLE)?;
            jail.set_env("QLG__QUERY__TARGET_QPS", "50.0");
            jail.set_env("QLG__QUERY__INELIGIBLE_BUCKET_POLICY", "skip");
            let cfg = Config::load_from("config.yaml").map_err(|e| e.to_string())?;
            assert!((cfg.query.target_qps - 50.0).abs() < f64::EPSILON);
            assert_eq!(cfg.query.ineligible_bucket_policy, IneligiblePolicy::Skip);
            Ok(())
        });
    }
}
