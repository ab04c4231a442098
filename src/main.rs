use std::sync::Arc;
use std::time::Duration;

use transcribe_dispatch::api::ApiServer;
use transcribe_dispatch::config::Config;
use transcribe_dispatch::dispatcher::Dispatcher;
use transcribe_dispatch::lease::{LeaseStore, RedisLeaseStore};
use transcribe_dispatch::queue::AssignmentQueue;
use transcribe_dispatch::reconciler::Reconciler;
use transcribe_dispatch::stats::{PostgresStatsStore, StatsStore};
use transcribe_dispatch::upstream::{HttpUpstreamClient, UpstreamClient};
use transcribe_dispatch::Result;

use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("starting transcribe-dispatch middleware");

    let config = Config::load()?;

    let leases: Arc<dyn LeaseStore> = Arc::new(
        RedisLeaseStore::connect(&config.backends.kv_url, config.backends.kv_timeout)
            .await?
            .with_ttls(
                config.backends.lease_ttl_secs,
                config.backends.cooldown_ttl_secs,
            ),
    );

    let upstream: Arc<dyn UpstreamClient> = Arc::new(HttpUpstreamClient::new(
        config.upstream.base_url.clone(),
        config.upstream.api_key.clone(),
        config.upstream.project_id,
        config.upstream.timeout,
    ));

    let stats: Arc<PostgresStatsStore> = Arc::new(
        PostgresStatsStore::connect(&config.backends.sql_url, config.backends.sql_timeout).await?,
    );

    let queue = Arc::new(AssignmentQueue::new());

    let audio_url_base = format!("http://{}:{}", config.api.host, config.api.port);
    let dispatcher = Arc::new(
        Dispatcher::new(
            leases.clone(),
            upstream.clone(),
            stats.clone(),
            queue.clone(),
            audio_url_base,
        )
        .with_rate(config.backends.rate_per_second),
    );

    let reconciler = Reconciler::new(
        upstream.clone(),
        leases.clone(),
        queue.clone(),
        Duration::from_secs(config.backends.sync_interval_secs),
    );

    let api_server = ApiServer::new(&config, dispatcher.clone(), upstream.clone(), leases.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Run the first reconciliation tick to completion before the API starts
    // accepting connections, so `/api/stats` and `/api/tasks/available/count`
    // never observe an empty queue racing against startup.
    reconciler.tick().await;
    let reconciler_handle = tokio::spawn(async move { reconciler.run_loop(shutdown_rx).await });

    tokio::select! {
        result = api_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "API server failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = reconciler_handle.await;

    Ok(())
}
