//! Cluster configuration.
//!
//! A single JSON document describes the whole process: cluster identity,
//! banning policy, the optional share relay, and one entry per pool with
//! its daemons, stratum listeners and coin-family extras.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::banning::BanningConfig;
use crate::vardiff::VardiffConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub cluster_name: String,
    #[serde(default)]
    pub banning: BanningConfig,
    #[serde(default)]
    pub share_relay: Option<ShareRelayConfig>,
    pub pools: Vec<PoolConfig>,
}

/// Publish side of the share relay fabric.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareRelayConfig {
    /// Listen address for relay subscribers, e.g. `0.0.0.0:6000`.
    pub publish_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub coin: CoinConfig,
    pub daemons: Vec<DaemonEndpointConfig>,
    #[serde(default)]
    pub stratums: Vec<StratumEndpointConfig>,
    /// Seconds between block template polls.
    #[serde(default = "default_refresh_secs")]
    pub block_refresh_interval: u64,
    #[serde(default = "default_true")]
    pub enable_internal_stratum: bool,
    /// Remote relay endpoints whose shares are re-injected locally.
    #[serde(default)]
    pub external_stratums: Vec<RelaySubscriptionConfig>,
    #[serde(default)]
    pub reward_recipients: Vec<RewardRecipient>,
    #[serde(default = "default_idle_secs")]
    pub client_idle_timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,
}

/// Coin-family specific settings, discriminated by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CoinConfig {
    Bitcoin(BitcoinCoinConfig),
    Ethereum(EthereumCoinConfig),
}

impl CoinConfig {
    pub fn family_name(&self) -> &'static str {
        match self {
            CoinConfig::Bitcoin(_) => "bitcoin",
            CoinConfig::Ethereum(_) => "ethereum",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BitcoinCoinConfig {
    /// Marker string embedded in the coinbase input script.
    pub coinbase_tag: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EthereumCoinConfig {
    /// Blocks per verification epoch (seed rotation).
    pub epoch_length: u64,
}

impl Default for EthereumCoinConfig {
    fn default() -> Self {
        Self { epoch_length: 30_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonEndpointConfig {
    /// HTTP(S) JSON-RPC endpoint, e.g. `http://127.0.0.1:8332`.
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Optional push-notification endpoint (`host:port`); when set the job
    /// manager subscribes for template pushes in addition to polling.
    #[serde(default)]
    pub notify_url: Option<String>,
    #[serde(default = "default_rpc_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StratumEndpointConfig {
    pub address: String,
    pub port: u16,
    /// PEM certificate chain; TLS is enabled when both paths are set.
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
    pub difficulty: f64,
    #[serde(default)]
    pub var_diff: VardiffConfig,
}

impl StratumEndpointConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelaySubscriptionConfig {
    /// Name of the remote cluster; stamped as `source` on received shares.
    pub name: String,
    /// `host:port` of the remote publish endpoint.
    pub url: String,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardRecipient {
    pub address: String,
    pub percentage: f64,
}

fn default_true() -> bool {
    true
}

fn default_refresh_secs() -> u64 {
    5
}

fn default_idle_secs() -> u64 {
    600
}

fn default_rpc_timeout_secs() -> u64 {
    30
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_connections_per_ip() -> usize {
    100
}

impl ClusterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: ClusterConfig =
            serde_json::from_str(&text).context("parsing cluster config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            bail!("clusterName must not be empty");
        }
        if self.pools.is_empty() {
            bail!("at least one pool must be configured");
        }

        let mut ids = std::collections::HashSet::new();
        let mut ports = std::collections::HashSet::new();
        for pool in &self.pools {
            if !ids.insert(pool.id.as_str()) {
                bail!("duplicate pool id '{}'", pool.id);
            }
            if pool.daemons.is_empty() {
                bail!("pool '{}' has no daemon endpoints", pool.id);
            }
            if pool.enable_internal_stratum && pool.stratums.is_empty() {
                bail!("pool '{}' enables stratum but lists no endpoints", pool.id);
            }
            for stratum in &pool.stratums {
                if !ports.insert(stratum.port) {
                    bail!("stratum port {} is used twice", stratum.port);
                }
                if stratum.difficulty <= 0.0 {
                    bail!("pool '{}' port {}: difficulty must be positive", pool.id, stratum.port);
                }
                if stratum.tls_cert.is_some() != stratum.tls_key.is_some() {
                    bail!(
                        "pool '{}' port {}: tlsCert and tlsKey must be set together",
                        pool.id,
                        stratum.port
                    );
                }
            }
            let total: f64 = pool.reward_recipients.iter().map(|r| r.percentage).sum();
            if total > 100.0 {
                bail!("pool '{}' reward recipients exceed 100%", pool.id);
            }
        }
        Ok(())
    }
}
