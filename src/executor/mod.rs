pub mod backend;
pub mod limiter;

use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ExecutorSettings, IneligiblePolicy};
use crate::domain::{
    BucketRegistry, Outcome, PlanEntry, QueryPlan, QueryTemplate, Resolution, TimeWindow,
    IMMEDIATE_BUCKET,
};
use crate::metrics::MetricsSink;

pub use backend::{count_spans, BackendError, SearchRequest, SearchResponse, TraceBackend};
pub use limiter::{InvalidRate, RateLimiter};

const BODY_LOG_LIMIT: usize = 512;

/// Collaborators shared by every executor of a run.
#[derive(Clone)]
pub struct ExecutorContext {
    pub registry: Arc<BucketRegistry>,
    pub backend: Arc<dyn TraceBackend>,
    pub sink: Arc<dyn MetricsSink>,
    /// Start of the load test; bucket eligibility is measured from here.
    pub run_start: Instant,
}

/// What a worker does with one plan step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Run {
        bucket_name: String,
        window: Option<TimeWindow>,
    },
    Skip {
        bucket_name: String,
    },
}

/// Drives one query template: a pool of workers behind one shared rate limiter and one
/// plan cursor.
pub struct QueryExecutor {
    template: QueryTemplate,
    settings: ExecutorSettings,
    plan: QueryPlan,
    limiter: RateLimiter,
    ctx: ExecutorContext,
}

impl QueryExecutor {
    pub fn new(
        template: QueryTemplate,
        settings: ExecutorSettings,
        plan: QueryPlan,
        ctx: ExecutorContext,
    ) -> Result<Self, InvalidRate> {
        let limiter = RateLimiter::new(settings.target_rate)?;
        Ok(Self {
            template,
            settings,
            plan,
            limiter,
            ctx,
        })
    }

    pub fn name(&self) -> &str {
        &self.template.name
    }

    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Spawns `concurrency` workers into `workers`. They run until `shutdown` fires.
    pub fn spawn(self: &Arc<Self>, workers: &mut JoinSet<()>, shutdown: &CancellationToken) {
        info!(
            query = %self.template.name,
            concurrency = self.settings.concurrency,
            target_qps = self.settings.target_rate,
            plan_entries = self.plan.len(),
            "starting query executor"
        );
        for worker_id in 1..=self.settings.concurrency {
            let executor = Arc::clone(self);
            let shutdown = shutdown.clone();
            workers.spawn(async move { executor.run_worker(worker_id, shutdown).await });
        }
    }

    async fn run_worker(&self, worker_id: usize, shutdown: CancellationToken) {
        let stagger = self.start_stagger();
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(stagger) => {}
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.limiter.acquire() => {}
            }

            let step = self.plan.next();
            if step.starts_new_cycle(self.plan.len()) {
                debug!(
                    worker = worker_id,
                    query = %self.template.name,
                    cycle = step.sequence / self.plan.len() as u64,
                    "plan exhausted, repeating from start"
                );
            }

            let (bucket_name, window) = match self.plan_dispatch(step.entry) {
                Dispatch::Run {
                    bucket_name,
                    window,
                } => (bucket_name, window),
                Dispatch::Skip { bucket_name } => {
                    debug!(worker = worker_id, query = %self.template.name, bucket = %bucket_name, "bucket not eligible yet, skipping");
                    continue;
                }
            };

            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.dispatch(worker_id, bucket_name, window) => outcome,
            };
            self.ctx.sink.record(&outcome);
        }
        debug!(worker = worker_id, query = %self.template.name, "worker stopped");
    }

    fn start_stagger(&self) -> Duration {
        let max = self.settings.start_jitter;
        if max.is_zero() {
            return Duration::ZERO;
        }
        let nanos = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
    }

    /// Resolves a plan entry against bucket eligibility at this instant.
    ///
    /// An ineligible bucket never changes the plan; it only alters this one dispatch.
    pub fn plan_dispatch(&self, entry: &PlanEntry) -> Dispatch {
        let elapsed = self.ctx.run_start.elapsed();
        let resolution = self.ctx.registry.resolve(
            &entry.bucket_name,
            elapsed,
            Utc::now(),
            &mut rand::thread_rng(),
        );
        match resolution {
            Resolution::Window { bucket, window } => Dispatch::Run {
                bucket_name: bucket.name.clone(),
                window: Some(window),
            },
            Resolution::Immediate => Dispatch::Run {
                bucket_name: IMMEDIATE_BUCKET.to_string(),
                window: None,
            },
            Resolution::Ineligible { bucket } => {
                self.ctx
                    .sink
                    .record_ineligible(&self.template.name, &bucket.name);
                match self.settings.ineligible_policy {
                    IneligiblePolicy::Immediate => Dispatch::Run {
                        bucket_name: IMMEDIATE_BUCKET.to_string(),
                        window: None,
                    },
                    IneligiblePolicy::Skip => Dispatch::Skip {
                        bucket_name: bucket.name.clone(),
                    },
                }
            }
        }
    }

    /// Issues one query, a single attempt.
    async fn dispatch(
        &self,
        worker_id: usize,
        bucket_name: String,
        window: Option<TimeWindow>,
    ) -> Outcome {
        let request = SearchRequest {
            query: self.template.expression.clone(),
            window,
            limit: self.settings.result_limit,
        };
        let started = Instant::now();
        let result = self.ctx.backend.search(&request).await;
        let latency = started.elapsed();

        let outcome = interpret(&self.template.name, bucket_name, latency, result, || {
            self.ctx.backend.describe(&request)
        });
        if outcome.success {
            debug!(
                worker = worker_id,
                query = %outcome.query_name,
                bucket = %outcome.bucket_name,
                latency_ms = latency.as_millis() as u64,
                result_count = outcome.result_count.unwrap_or_default(),
                window_start = ?window.map(|w| w.start),
                window_end = ?window.map(|w| w.end),
                "query completed"
            );
        }
        outcome
    }
}

/// Maps a backend result to an outcome. Non-2xx and transport errors are failures; an
/// unparsable success body counts as zero results.
///
/// `request` renders the request for failure logs and is only called on failure.
pub fn interpret(
    query_name: &str,
    bucket_name: String,
    latency: Duration,
    result: Result<SearchResponse, BackendError>,
    request: impl FnOnce() -> String,
) -> Outcome {
    match result {
        Ok(resp) if resp.is_success() => {
            let count = count_spans(&resp.body).unwrap_or_else(|e| {
                warn!(query = %query_name, bucket = %bucket_name, error = %e, "unparsable search response, counting 0 results");
                0
            });
            Outcome::success(query_name, bucket_name, latency, count)
        }
        Ok(resp) => {
            let excerpt: String = resp.body.chars().take(BODY_LOG_LIMIT).collect();
            let request = request();
            warn!(
                query = %query_name,
                bucket = %bucket_name,
                status = resp.status,
                latency_ms = latency.as_millis() as u64,
                request = %request,
                body = %excerpt,
                "query failed"
            );
            Outcome::failure(query_name, bucket_name, latency)
        }
        Err(e) => {
            let request = request();
            warn!(
                query = %query_name,
                bucket = %bucket_name,
                latency_ms = latency.as_millis() as u64,
                request = %request,
                error = %e,
                "query request failed"
            );
            Outcome::failure(query_name, bucket_name, latency)
        }
    }
}
