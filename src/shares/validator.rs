//! Coin-family share validation.
//!
//! Each family implements one capability set: parse daemon work payloads,
//! validate submissions against a job, and build the RPC calls for block
//! submission. The pool wires the right implementation at construction
//! from the `coin.type` config tag.
//!
//! Validation pipeline, identical across families:
//! decode the submission, register the submission tuple (duplicates are
//! rejected here), assemble the candidate, hash it through the family's
//! verifier, then compare against the worker and network targets.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::config::{BitcoinCoinConfig, CoinConfig, EthereumCoinConfig};
use crate::jobs::{BlockTemplate, Job};
use crate::shares::pow::{DoubleSha, EpochCache, PowVerifier};
use crate::shares::{BlockSubmission, Share, ValidatedShare, WorkerSnapshot};
use crate::stratum::protocol::StratumError;
use crate::util::U256;

/// Daemon sync progress as the family reports it.
#[derive(Debug, Clone)]
pub struct SyncState {
    pub synced: bool,
    pub detail: String,
}

/// Ambient fields the validator stamps onto every share.
#[derive(Debug, Clone, Copy)]
pub struct SubmitContext<'a> {
    pub pool_id: &'a str,
    pub source: &'a str,
    pub now: DateTime<Utc>,
}

pub trait CoinFamily: Send + Sync {
    fn name(&self) -> &'static str;

    /// RPC surface, named per family.
    fn get_work_call(&self) -> (&'static str, Value);
    fn submit_method(&self) -> &'static str;
    fn peer_count_call(&self) -> (&'static str, Value);
    fn sync_state_call(&self) -> (&'static str, Value);

    fn parse_template(&self, raw: &Value) -> Result<BlockTemplate>;
    fn parse_peer_count(&self, raw: &Value) -> Result<u64>;
    fn parse_sync_state(&self, raw: &Value) -> Result<SyncState>;
    /// Whether the daemon's submit response means "block accepted".
    fn parse_submit_result(&self, raw: &Value) -> bool;

    /// Build any per-epoch verification context before the first job of
    /// that epoch is announced.
    fn prepare(&self, template: &BlockTemplate) -> Result<()> {
        let _ = template;
        Ok(())
    }

    /// Validate a `mining.submit` against a located job.
    fn validate_submit(
        &self,
        ctx: &SubmitContext<'_>,
        worker: &WorkerSnapshot,
        params: &[Value],
        job: &Job,
    ) -> Result<ValidatedShare, StratumError>;

    /// RPC params submitting a block candidate.
    fn submit_params(&self, job: &Job, submission: &BlockSubmission) -> Value;

    /// `mining.notify` params for a job.
    fn notify_params(&self, job: &Job, clean: bool) -> Value;

    /// Bytes of extranonce2 the worker appends (0 when unused).
    fn extranonce2_size(&self) -> usize;
}

/// Instantiate the family selected by the config tag.
pub fn family_for(coin: &CoinConfig) -> Arc<dyn CoinFamily> {
    match coin {
        CoinConfig::Bitcoin(cfg) => Arc::new(BitcoinFamily::new(cfg.clone())),
        CoinConfig::Ethereum(cfg) => Arc::new(EthereumFamily::new(cfg.clone())),
    }
}

fn require_hex(value: &str, hex_len: usize, what: &str) -> Result<String, StratumError> {
    let v = value.trim().trim_start_matches("0x");
    if v.len() != hex_len || !v.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(StratumError::other(format!("malformed {}", what)));
    }
    Ok(v.to_ascii_lowercase())
}

fn param_str<'a>(params: &'a [Value], idx: usize, what: &str) -> Result<&'a str, StratumError> {
    params
        .get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| StratumError::other(format!("missing {}", what)))
}

/// Steps 6-8 of the pipeline, shared by every family: compare the hash
/// against worker and network targets and build the share record.
fn finish(
    ctx: &SubmitContext<'_>,
    worker: &WorkerSnapshot,
    job: &Job,
    hash: [u8; 32],
    submission: BlockSubmission,
) -> Result<ValidatedShare, StratumError> {
    let hash_value = U256::from_be_bytes(hash);
    let worker_target = U256::from_difficulty(worker.difficulty);

    let actual_difficulty = hash_value.to_difficulty();
    if hash_value > worker_target {
        return Err(StratumError::low_difficulty(actual_difficulty));
    }

    let is_block_candidate = hash_value <= job.network_target();

    let share = Share {
        pool_id: ctx.pool_id.to_string(),
        worker: worker.worker.clone(),
        miner: worker.miner.clone(),
        difficulty: worker.difficulty,
        actual_difficulty,
        network_difficulty: job.template.network_difficulty,
        block_height: job.height(),
        is_block_candidate,
        source: ctx.source.to_string(),
        created: ctx.now,
        block_hash: is_block_candidate.then(|| submission.header_hash.clone()),
    };

    Ok(ValidatedShare {
        share,
        submission: is_block_candidate.then_some(submission),
    })
}

// ---------------------------------------------------------------------------
// Bitcoin-style family: coinbase built locally, sha256d header chain.
// ---------------------------------------------------------------------------

pub struct BitcoinFamily {
    cfg: BitcoinCoinConfig,
    pow: Arc<dyn PowVerifier>,
}

impl BitcoinFamily {
    pub const EXTRANONCE2_SIZE: usize = 4;

    pub fn new(cfg: BitcoinCoinConfig) -> Self {
        Self {
            cfg,
            pow: Arc::new(DoubleSha),
        }
    }

    /// Swap in an external verifier (tests, exotic sha-family chains).
    pub fn with_pow(cfg: BitcoinCoinConfig, pow: Arc<dyn PowVerifier>) -> Self {
        Self { cfg, pow }
    }

    /// Coinbase halves; the session's extranonce pair goes between them.
    fn coinbase_parts(&self, template: &BlockTemplate) -> (Vec<u8>, Vec<u8>) {
        let mut coinb1 = Vec::with_capacity(16 + self.cfg.coinbase_tag.len());
        coinb1.extend_from_slice(&template.version.to_le_bytes());
        coinb1.extend_from_slice(&template.height.to_le_bytes());
        coinb1.extend_from_slice(self.cfg.coinbase_tag.as_bytes());
        let coinb2 = template.coinbase_value.to_le_bytes().to_vec();
        (coinb1, coinb2)
    }

    fn merkle_root(&self, template: &BlockTemplate, coinbase: &[u8]) -> Result<[u8; 32], StratumError> {
        let mut root: [u8; 32] = Sha256::digest(Sha256::digest(coinbase)).into();
        for branch in &template.merkle_branches {
            let bytes = hex::decode(branch)
                .map_err(|_| StratumError::other("malformed merkle branch"))?;
            let mut hasher = Sha256::new();
            hasher.update(root);
            hasher.update(&bytes);
            root = Sha256::digest(hasher.finalize()).into();
        }
        Ok(root)
    }

    fn assemble_header(
        &self,
        template: &BlockTemplate,
        merkle_root: &[u8; 32],
        ntime: u32,
        nonce: u32,
    ) -> Result<Vec<u8>, StratumError> {
        let mut prev = hex::decode(&template.prev_hash)
            .map_err(|_| StratumError::other("malformed previous hash"))?;
        if prev.len() != 32 {
            return Err(StratumError::other("malformed previous hash"));
        }
        prev.reverse();

        let mut header = Vec::with_capacity(80);
        header.extend_from_slice(&template.version.to_le_bytes());
        header.extend_from_slice(&prev);
        header.extend_from_slice(merkle_root);
        header.extend_from_slice(&ntime.to_le_bytes());
        header.extend_from_slice(&template.bits.to_le_bytes());
        header.extend_from_slice(&nonce.to_le_bytes());
        Ok(header)
    }
}

impl CoinFamily for BitcoinFamily {
    fn name(&self) -> &'static str {
        "bitcoin"
    }

    fn get_work_call(&self) -> (&'static str, Value) {
        ("getblocktemplate", json!([{ "rules": ["segwit"] }]))
    }

    fn submit_method(&self) -> &'static str {
        "submitblock"
    }

    fn peer_count_call(&self) -> (&'static str, Value) {
        ("getconnectioncount", json!([]))
    }

    fn sync_state_call(&self) -> (&'static str, Value) {
        ("getblockchaininfo", json!([]))
    }

    fn parse_template(&self, raw: &Value) -> Result<BlockTemplate> {
        let height = raw
            .get("height")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("template missing height"))?;
        let prev_hash = raw
            .get("previousblockhash")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("template missing previousblockhash"))?
            .to_string();
        let target = raw
            .get("target")
            .and_then(Value::as_str)
            .and_then(U256::from_hex)
            .ok_or_else(|| anyhow!("template missing target"))?;
        let bits = raw
            .get("bits")
            .and_then(Value::as_str)
            .and_then(|s| u32::from_str_radix(s, 16).ok())
            .ok_or_else(|| anyhow!("template missing bits"))?;

        Ok(BlockTemplate {
            height,
            prev_hash,
            network_target: target,
            network_difficulty: target.to_difficulty(),
            version: raw.get("version").and_then(Value::as_u64).unwrap_or(1) as u32,
            bits,
            cur_time: raw.get("curtime").and_then(Value::as_u64).unwrap_or(0),
            coinbase_value: raw.get("coinbasevalue").and_then(Value::as_u64).unwrap_or(0),
            merkle_branches: raw
                .get("merklebranches")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            ..Default::default()
        })
    }

    fn parse_peer_count(&self, raw: &Value) -> Result<u64> {
        raw.as_u64().ok_or_else(|| anyhow!("peer count not a number"))
    }

    fn parse_sync_state(&self, raw: &Value) -> Result<SyncState> {
        let ibd = raw
            .get("initialblockdownload")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let progress = raw
            .get("verificationprogress")
            .and_then(Value::as_f64)
            .unwrap_or(1.0);
        Ok(SyncState {
            synced: !ibd,
            detail: format!("{:.1}% verified", progress * 100.0),
        })
    }

    fn parse_submit_result(&self, raw: &Value) -> bool {
        // submitblock answers null on success and a reject reason string
        // otherwise.
        raw.is_null() || raw.as_bool() == Some(true)
    }

    fn validate_submit(
        &self,
        ctx: &SubmitContext<'_>,
        worker: &WorkerSnapshot,
        params: &[Value],
        job: &Job,
    ) -> Result<ValidatedShare, StratumError> {
        let extranonce2 = require_hex(
            param_str(params, 2, "extranonce2")?,
            Self::EXTRANONCE2_SIZE * 2,
            "extranonce2",
        )?;
        let ntime_hex = require_hex(param_str(params, 3, "ntime")?, 8, "ntime")?;
        let nonce_hex = require_hex(param_str(params, 4, "nonce")?, 8, "nonce")?;

        if !job.register_submission(&worker.extranonce1, &nonce_hex, &extranonce2) {
            return Err(StratumError::duplicate_share());
        }

        let ntime = u32::from_str_radix(&ntime_hex, 16)
            .map_err(|_| StratumError::other("malformed ntime"))?;
        let nonce = u32::from_str_radix(&nonce_hex, 16)
            .map_err(|_| StratumError::other("malformed nonce"))?;
        if (ntime as u64) < job.template.cur_time {
            return Err(StratumError::other("ntime out of range"));
        }

        let mut coinbase = Vec::new();
        let (coinb1, coinb2) = self.coinbase_parts(&job.template);
        coinbase.extend_from_slice(&coinb1);
        coinbase.extend_from_slice(
            &hex::decode(&worker.extranonce1)
                .map_err(|_| StratumError::other("malformed extranonce1"))?,
        );
        coinbase.extend_from_slice(
            &hex::decode(&extranonce2).map_err(|_| StratumError::other("malformed extranonce2"))?,
        );
        coinbase.extend_from_slice(&coinb2);

        let merkle_root = self.merkle_root(&job.template, &coinbase)?;
        let header = self.assemble_header(&job.template, &merkle_root, ntime, nonce)?;

        let hash = self
            .pow
            .hash(&header, nonce as u64, None)
            .map_err(|e| {
                tracing::error!("pow verification failed: {e}");
                StratumError::other("verification failed")
            })?;

        let submission = BlockSubmission {
            job_id: job.id.clone(),
            nonce: nonce_hex,
            extranonce2: Some(extranonce2),
            mix_hash: None,
            header_hash: hex::encode(hash),
        };
        finish(ctx, worker, job, hash, submission)
    }

    fn submit_params(&self, _job: &Job, submission: &BlockSubmission) -> Value {
        // Header hash, nonce and the winning extranonce pair; the daemon
        // reconstructs the block from its copy of the template.
        json!([
            submission.header_hash.clone(),
            submission.nonce.clone(),
            submission.extranonce2.clone(),
        ])
    }

    fn notify_params(&self, job: &Job, clean: bool) -> Value {
        let (coinb1, coinb2) = self.coinbase_parts(&job.template);
        json!([
            job.id.clone(),
            job.template.prev_hash.clone(),
            hex::encode(coinb1),
            hex::encode(coinb2),
            job.template.merkle_branches.clone(),
            format!("{:08x}", job.template.version),
            format!("{:08x}", job.template.bits),
            format!("{:08x}", job.template.cur_time),
            clean,
        ])
    }

    fn extranonce2_size(&self) -> usize {
        Self::EXTRANONCE2_SIZE
    }
}

// ---------------------------------------------------------------------------
// Ethereum-style family: header hash + nonce + mix, seed-epoch contexts.
// ---------------------------------------------------------------------------

pub struct EthereumFamily {
    epochs: EpochCache,
}

impl EthereumFamily {
    pub fn new(cfg: EthereumCoinConfig) -> Self {
        Self {
            epochs: EpochCache::new(cfg.epoch_length),
        }
    }
}

impl CoinFamily for EthereumFamily {
    fn name(&self) -> &'static str {
        "ethereum"
    }

    fn get_work_call(&self) -> (&'static str, Value) {
        ("eth_getWork", json!([]))
    }

    fn submit_method(&self) -> &'static str {
        "eth_submitWork"
    }

    fn peer_count_call(&self) -> (&'static str, Value) {
        ("net_peerCount", json!([]))
    }

    fn sync_state_call(&self) -> (&'static str, Value) {
        ("eth_syncing", json!([]))
    }

    fn parse_template(&self, raw: &Value) -> Result<BlockTemplate> {
        // Object form {height, headerHash, seedHash, target}; legacy
        // daemons answer the positional [header, seed, target, height].
        let (header_hash, seed_hash, target, height) = if let Some(arr) = raw.as_array() {
            let get = |i: usize| arr.get(i).and_then(Value::as_str).map(str::to_string);
            (
                get(0).ok_or_else(|| anyhow!("work missing header hash"))?,
                get(1).ok_or_else(|| anyhow!("work missing seed hash"))?,
                get(2).ok_or_else(|| anyhow!("work missing target"))?,
                arr.get(3)
                    .and_then(|v| {
                        v.as_u64().or_else(|| {
                            v.as_str()
                                .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
                        })
                    })
                    .ok_or_else(|| anyhow!("work missing height"))?,
            )
        } else {
            (
                raw.get("headerHash")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("work missing headerHash"))?
                    .to_string(),
                raw.get("seedHash")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("work missing seedHash"))?
                    .to_string(),
                raw.get("target")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("work missing target"))?
                    .to_string(),
                raw.get("height")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| anyhow!("work missing height"))?,
            )
        };

        let network_target =
            U256::from_hex(&target).ok_or_else(|| anyhow!("work target not hex"))?;

        Ok(BlockTemplate {
            height,
            prev_hash: header_hash.clone(),
            network_target,
            network_difficulty: network_target.to_difficulty(),
            header_hash: Some(header_hash.trim_start_matches("0x").to_string()),
            seed_hash: Some(seed_hash.trim_start_matches("0x").to_string()),
            ..Default::default()
        })
    }

    fn parse_peer_count(&self, raw: &Value) -> Result<u64> {
        if let Some(n) = raw.as_u64() {
            return Ok(n);
        }
        raw.as_str()
            .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
            .ok_or_else(|| anyhow!("peer count not a quantity"))
    }

    fn parse_sync_state(&self, raw: &Value) -> Result<SyncState> {
        if raw.as_bool() == Some(false) {
            return Ok(SyncState {
                synced: true,
                detail: "synced".to_string(),
            });
        }
        let qty = |key: &str| {
            raw.get(key)
                .and_then(Value::as_str)
                .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
                .unwrap_or(0)
        };
        Ok(SyncState {
            synced: false,
            detail: format!("block {} of {}", qty("currentBlock"), qty("highestBlock")),
        })
    }

    fn parse_submit_result(&self, raw: &Value) -> bool {
        raw.as_bool() == Some(true)
    }

    fn prepare(&self, template: &BlockTemplate) -> Result<()> {
        if let Some(seed) = &template.seed_hash {
            self.epochs.prepare(template.height, seed)?;
        }
        Ok(())
    }

    fn validate_submit(
        &self,
        ctx: &SubmitContext<'_>,
        worker: &WorkerSnapshot,
        params: &[Value],
        job: &Job,
    ) -> Result<ValidatedShare, StratumError> {
        let nonce_hex = require_hex(param_str(params, 2, "nonce")?, 16, "nonce")?;
        let mix_hex = match params.get(3).and_then(Value::as_str) {
            Some(mix) => Some(require_hex(mix, 64, "mix hash")?),
            None => None,
        };

        if !job.register_submission(&worker.extranonce1, &nonce_hex, "") {
            return Err(StratumError::duplicate_share());
        }

        let nonce = u64::from_str_radix(&nonce_hex, 16)
            .map_err(|_| StratumError::other("malformed nonce"))?;
        let header_hex = job
            .template
            .header_hash
            .as_deref()
            .ok_or_else(|| StratumError::other("job has no header"))?;
        let header = hex::decode(header_hex)
            .map_err(|_| StratumError::other("job header not hex"))?;

        // Contexts are built at job install time; absence here is an
        // internal fault, reported as a generic stratum error.
        let context = self.epochs.get(job.height()).ok_or_else(|| {
            tracing::error!(height = job.height(), "epoch context missing");
            StratumError::other("verification context unavailable")
        })?;

        let mix_bytes = match &mix_hex {
            Some(m) => {
                Some(hex::decode(m).map_err(|_| StratumError::other("malformed mix hash"))?)
            }
            None => None,
        };
        let hash = context
            .hash(&header, nonce, mix_bytes.as_deref())
            .map_err(|e| {
                tracing::error!("pow verification failed: {e}");
                StratumError::other("verification failed")
            })?;

        let submission = BlockSubmission {
            job_id: job.id.clone(),
            nonce: nonce_hex,
            extranonce2: None,
            mix_hash: mix_hex,
            header_hash: hex::encode(hash),
        };
        finish(ctx, worker, job, hash, submission)
    }

    fn submit_params(&self, job: &Job, submission: &BlockSubmission) -> Value {
        json!([
            format!("0x{}", submission.nonce),
            format!("0x{}", job.template.header_hash.as_deref().unwrap_or_default()),
            format!("0x{}", submission.mix_hash.as_deref().unwrap_or_default()),
        ])
    }

    fn notify_params(&self, job: &Job, clean: bool) -> Value {
        json!([
            job.id.clone(),
            job.template.seed_hash.as_deref().unwrap_or_default(),
            job.template.header_hash.as_deref().unwrap_or_default(),
            clean,
        ])
    }

    fn extranonce2_size(&self) -> usize {
        0
    }
}
