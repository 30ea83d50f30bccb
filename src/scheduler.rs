use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{Config, ConfigError};
use crate::domain::PlanError;
use crate::executor::{ExecutorContext, InvalidRate, QueryExecutor, TraceBackend};
use crate::metrics::MetricsSink;

/// Composition root: one executor per query template, all started together.
///
/// Construction does every fallible step, so a `Scheduler` that exists can always start
/// all of its workers.
pub struct Scheduler {
    executors: Vec<Arc<QueryExecutor>>,
}

impl Scheduler {
    pub fn new(
        cfg: &Config,
        backend: Arc<dyn TraceBackend>,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;

        let templates = cfg.query_templates();
        let registry = Arc::new(cfg.bucket_registry());
        let mut plans = cfg.execution_plan().partition(&templates, &registry)?;

        info!(
            namespace = %cfg.namespace,
            queries = templates.len(),
            time_buckets = registry.len(),
            plan_entries = cfg.execution_plan.len(),
            total_target_qps = cfg.query.target_qps,
            ineligible_policy = %cfg.query.ineligible_bucket_policy,
            "scheduler configured"
        );

        let ctx = ExecutorContext {
            registry,
            backend,
            sink,
            run_start: Instant::now(),
        };

        let mut executors = Vec::with_capacity(templates.len());
        for (template, query) in templates.into_iter().zip(&cfg.queries) {
            let plan = plans
                .remove(&template.name)
                .ok_or_else(|| PlanError::NoEntries(template.name.clone()))?;
            for (bucket, count) in plan.distribution() {
                info!(query = %template.name, bucket, entries = count, "plan distribution");
            }
            let settings = cfg.executor_settings(query);
            let executor = QueryExecutor::new(template, settings, plan, ctx.clone()).map_err(
                |InvalidRate(rate)| ConfigError::InvalidRate {
                    query: query.name.clone(),
                    rate,
                },
            )?;
            executors.push(Arc::new(executor));
        }

        Ok(Self { executors })
    }

    pub fn executors(&self) -> &[Arc<QueryExecutor>] {
        &self.executors
    }

    /// Starts every worker and waits until all of them have stopped after `shutdown`.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut workers = JoinSet::new();
        for executor in &self.executors {
            executor.spawn(&mut workers, &shutdown);
        }
        info!(workers = workers.len(), "all query executors started");

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = %e, "query worker panicked");
                }
            }
        }
        info!("all query workers stopped");
    }
}
