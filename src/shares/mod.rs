//! Share records and validation.

pub mod pow;
pub mod validator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Record emitted on the message bus for every accepted submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Share {
    pub pool_id: String,
    pub worker: String,
    /// Miner payout address when decodable from the worker name.
    pub miner: Option<String>,
    /// Difficulty the worker was credited at (stratum-assigned).
    pub difficulty: f64,
    /// Difficulty the hash actually achieved; always >= `difficulty`.
    pub actual_difficulty: f64,
    pub network_difficulty: f64,
    pub block_height: u64,
    pub is_block_candidate: bool,
    /// Originating cluster name.
    pub source: String,
    pub created: DateTime<Utc>,
    /// Hash of the solved block for candidates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_hash: Option<String>,
}

/// Copy-out of the session's worker context taken at submission time.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub worker: String,
    pub miner: Option<String>,
    pub extranonce1: String,
    pub difficulty: f64,
}

/// Raw material a block-candidate share needs for daemon submission.
#[derive(Debug, Clone)]
pub struct BlockSubmission {
    pub job_id: String,
    pub nonce: String,
    pub extranonce2: Option<String>,
    pub mix_hash: Option<String>,
    pub header_hash: String,
}

/// Result of a successful validation.
#[derive(Debug, Clone)]
pub struct ValidatedShare {
    pub share: Share,
    /// Present iff the share is a block candidate.
    pub submission: Option<BlockSubmission>,
}
