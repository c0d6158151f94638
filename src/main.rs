//! strata-pool — multi-currency stratum mining pool server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use strata_pool::banning::BanManager;
use strata_pool::bus::MessageBus;
use strata_pool::clock::system_clock;
use strata_pool::config::ClusterConfig;
use strata_pool::pool::Pool;
use strata_pool::relay::wire::WIRE_FORMAT_BINARY;
use strata_pool::relay::RelayPublisher;

fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn config_path() -> Result<PathBuf> {
    if let Some(arg) = std::env::args().nth(1) {
        return Ok(PathBuf::from(arg));
    }
    if let Ok(env) = std::env::var("STRATA_CONFIG") {
        return Ok(PathBuf::from(env));
    }
    bail!("usage: strata-pool <config.json> (or set STRATA_CONFIG)");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let path = config_path()?;
    let config = ClusterConfig::load(&path)?;
    tracing::info!(
        cluster = %config.cluster_name,
        pools = config.pools.len(),
        "configuration loaded"
    );

    let clock = system_clock();
    let bus = MessageBus::default();
    let bans = Arc::new(BanManager::new(clock.clone()));

    let publisher = match &config.share_relay {
        Some(relay_cfg) => Some(
            RelayPublisher::start(relay_cfg, &config.cluster_name, &bus, WIRE_FORMAT_BINARY)
                .await
                .context("starting the share relay publisher")?,
        ),
        None => None,
    };

    let mut pools = Vec::new();
    for pool_cfg in &config.pools {
        if !pool_cfg.enabled {
            tracing::info!(pool = %pool_cfg.id, "pool disabled, skipping");
            continue;
        }
        let pool = Arc::new(Pool::new(
            pool_cfg.clone(),
            config.cluster_name.clone(),
            config.banning.clone(),
            bus.clone(),
            bans.clone(),
            clock.clone(),
        ));
        // A pool that cannot start does not take the process down; the
        // others keep serving.
        match pool.start().await {
            Ok(()) => pools.push(pool),
            Err(e) => tracing::error!(pool = %pool_cfg.id, "pool failed to start: {e:#}"),
        }
    }

    if pools.is_empty() {
        bail!("no pool started");
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");

    for pool in &pools {
        pool.stop();
    }
    if let Some(publisher) = &publisher {
        publisher.stop();
    }

    Ok(())
}
