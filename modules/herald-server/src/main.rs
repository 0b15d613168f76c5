mod auth;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use herald_alerts::admin::Admin;
use herald_alerts::{HttpFetcher, HttpTransport, Tick};
use herald_common::{keys, Config};
use herald_kv::{KvStore, PgKv};

use crate::routes::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("herald=info".parse()?))
        .init();

    info!("Herald alert engine starting...");

    let config = Arc::new(Config::from_env());
    config.log_summary();

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    let pg = PgKv::new(pool);
    pg.migrate().await?;
    let kv: Arc<dyn KvStore> = Arc::new(pg.clone());

    // Seed the strict-delivery flag from the environment once; afterwards
    // the admin surface owns it.
    if config.strict_delivery && kv.get(keys::STRICT_DELIVERY_FLAG).await?.is_none() {
        kv.put(keys::STRICT_DELIVERY_FLAG, "1", None).await?;
        info!("Strict delivery enabled from environment");
    }

    let fetcher = Arc::new(HttpFetcher::new());
    let transport = Arc::new(HttpTransport::new());
    let tick = Arc::new(Tick::new(
        kv.clone(),
        fetcher.clone(),
        transport,
        config.clone(),
    ));
    let admin = Admin::new(kv.clone(), fetcher, tick.dispatcher().clone(), config.clone());

    spawn_tick_loop(tick.clone(), config.tick_interval_secs);
    spawn_eviction_loop(pg);

    let state = Arc::new(AppState {
        admin,
        tick,
        config: config.clone(),
    });
    let app = routes::router(state);

    let addr = format!("{}:{}", config.web_host, config.web_port);
    info!(addr = addr.as_str(), "Admin surface listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Run the pipeline on a fixed cadence. A failed tick logs and waits for
/// the next slot; it never takes the process down.
fn spawn_tick_loop(tick: Arc<Tick>, interval_secs: u64) {
    info!(interval_secs, "Starting tick loop");
    tokio::spawn(async move {
        loop {
            match tick.run(Utc::now()).await {
                Ok(stats) => info!(%stats, "Scheduled tick complete"),
                Err(e) => error!(error = %e, "Scheduled tick failed"),
            }
            tokio::time::sleep(Duration::from_secs(interval_secs)).await;
        }
    });
}

/// Sweep expired KV rows hourly so the table stays bounded.
fn spawn_eviction_loop(pg: PgKv) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            match pg.evict_expired().await {
                Ok(0) => {}
                Ok(n) => info!(evicted = n, "Expired KV rows swept"),
                Err(e) => error!(error = %e, "KV eviction failed"),
            }
        }
    });
}
