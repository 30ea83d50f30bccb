use anyhow::{Context, Result};
use chrono::Utc;
use query_load_generator::{api, config, executor, metrics, scheduler, telemetry};
use config::Config;
use executor::backend::TempoBackend;
use metrics::PrometheusSink;
use scheduler::Scheduler;
use std::sync::Arc;
use telemetry::init_tracing;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cfg = Config::load().context("invalid configuration")?;

    let sink = Arc::new(PrometheusSink::new(&cfg.namespace).context("metrics registration failed")?);
    let backend = Arc::new(TempoBackend::new(&cfg.backend).context("backend client setup failed")?);
    info!(url = %backend.search_url(), tenant = ?cfg.backend.tenant_id, "backend configured");

    // Every fatal check happens here, before any worker exists.
    let scheduler = Scheduler::new(&cfg, backend, sink.clone())?;
    let listener = api::bind(cfg.metrics.listen_addr).await?;

    let shutdown = CancellationToken::new();
    telemetry::cancel_on_signal(shutdown.clone());

    let api_state = api::ApiState {
        metrics: sink,
        started_at: Utc::now(),
    };
    // A failed scrape endpoint stops the run.
    let server_shutdown = shutdown.clone();
    let metrics_server = tokio::spawn(async move {
        let result = api::serve(listener, api_state, server_shutdown.clone()).await;
        if let Err(e) = &result {
            error!(error = %e, "metrics endpoint failed, stopping load");
            server_shutdown.cancel();
        }
        result
    });

    info!(namespace = %cfg.namespace, "starting query load generator");
    scheduler.run(shutdown.clone()).await;

    // Workers are done; stop the scrape endpoint too.
    shutdown.cancel();
    match metrics_server.await {
        Ok(Err(e)) => return Err(e.context("metrics endpoint failed")),
        Err(e) => warn!(error = %e, "metrics endpoint task aborted"),
        Ok(Ok(())) => {}
    }

    warn!("shutdown complete");
    Ok(())
}
