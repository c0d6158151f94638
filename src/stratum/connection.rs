//! Per-connection session state.
//!
//! A session is shared between its I/O task and the request dispatcher.
//! Worker state lives behind a mutex owned by the session; observers take
//! copy-out snapshots. All outgoing traffic funnels through one bounded
//! queue drained by a single writer task, so broadcast and reply bytes
//! never interleave mid-line.

use std::net::SocketAddr;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::shares::WorkerSnapshot;
use crate::stratum::protocol::StratumResponse;
use crate::vardiff::VardiffState;

/// Maximum queued outbound lines before the session is dropped as a slow
/// consumer.
pub const SEND_QUEUE_DEPTH: usize = 256;

#[derive(Debug)]
pub struct WorkerState {
    pub subscribed: bool,
    pub authorized: bool,
    /// Full worker login, e.g. `address.rig`.
    pub worker: Option<String>,
    /// Payout address decoded from the login, when present.
    pub miner: Option<String>,
    pub extranonce1: String,
    pub difficulty: f64,
    /// Difficulty decided by vardiff, applied at the next job
    /// notification.
    pub pending_difficulty: Option<f64>,
    pub current_job_id: Option<String>,
    pub vardiff: VardiffState,
    pub valid_shares: u64,
    pub invalid_shares: u64,
    pub last_activity: Instant,
}

pub struct Session {
    pub id: String,
    pub remote: SocketAddr,
    /// Local listener port this session arrived on.
    pub local_port: u16,
    state: Mutex<WorkerState>,
    outbound: mpsc::Sender<String>,
    closer: CancellationToken,
}

impl Session {
    pub fn new(
        remote: SocketAddr,
        local_port: u16,
        extranonce1: String,
        difficulty: f64,
        vardiff: VardiffState,
        now: Instant,
    ) -> (std::sync::Arc<Self>, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let session = std::sync::Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            remote,
            local_port,
            state: Mutex::new(WorkerState {
                subscribed: false,
                authorized: false,
                worker: None,
                miner: None,
                extranonce1,
                difficulty,
                pending_difficulty: None,
                current_job_id: None,
                vardiff,
                valid_shares: 0,
                invalid_shares: 0,
                last_activity: now,
            }),
            outbound,
            closer: CancellationToken::new(),
        });
        (session, rx)
    }

    /// Queue one message. A full queue means the miner cannot keep up;
    /// the session is closed rather than buffering without bound.
    pub fn post(&self, message: &Value) -> bool {
        let mut line = message.to_string();
        line.push('\n');
        match self.outbound.try_send(line) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(session = %self.id, remote = %self.remote, "send queue overflow");
                self.close();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn respond(&self, response: StratumResponse) -> bool {
        match serde_json::to_value(&response) {
            Ok(value) => self.post(&value),
            Err(_) => false,
        }
    }

    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn close_token(&self) -> CancellationToken {
        self.closer.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Run `f` under the state lock. Callers must not await inside.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut WorkerState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn touch(&self, now: Instant) {
        self.state.lock().last_activity = now;
    }

    pub fn is_authorized(&self) -> bool {
        self.state.lock().authorized
    }

    pub fn is_subscribed(&self) -> bool {
        self.state.lock().subscribed
    }

    pub fn extranonce1(&self) -> String {
        self.state.lock().extranonce1.clone()
    }

    /// Copy-out of the fields share validation needs.
    pub fn snapshot(&self) -> WorkerSnapshot {
        let state = self.state.lock();
        WorkerSnapshot {
            worker: state.worker.clone().unwrap_or_default(),
            miner: state.miner.clone(),
            extranonce1: state.extranonce1.clone(),
            difficulty: state.difficulty,
        }
    }
}
