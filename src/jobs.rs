//! Job management.
//!
//! The job manager keeps the set of valid jobs for one pool, feeding it
//! from a periodic template poll and, when configured, a daemon push
//! stream. Each installed template becomes a [`Job`] with a monotonic hex
//! id; jobs older than [`MAX_BLOCK_BACKLOG`] heights are evicted so
//! submissions against them fail as stale.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::bus::{MessageBus, PoolEvent};
use crate::clock::SharedClock;
use crate::daemon::{DaemonClient, DaemonError};
use crate::metrics;
use crate::shares::validator::CoinFamily;
use crate::shares::ValidatedShare;
use crate::util::U256;

/// Jobs this many heights behind the tip are retired.
pub const MAX_BLOCK_BACKLOG: u64 = 3;

/// Template fields shared by every coin family. Families leave the fields
/// they do not use at their defaults.
#[derive(Debug, Clone, Default)]
pub struct BlockTemplate {
    pub height: u64,
    pub prev_hash: String,
    pub network_target: U256,
    pub network_difficulty: f64,
    /// Header families: hash of the work package and the epoch seed.
    pub header_hash: Option<String>,
    pub seed_hash: Option<String>,
    /// Coinbase families: header fields and coinbase inputs.
    pub version: u32,
    pub bits: u32,
    pub cur_time: u64,
    pub coinbase_value: u64,
    pub merkle_branches: Vec<String>,
}

/// One unit of distributable work.
pub struct Job {
    pub id: String,
    pub template: BlockTemplate,
    pub created: DateTime<Utc>,
    /// Submission tuples already seen for this job.
    seen: Mutex<HashSet<u64>>,
}

impl Job {
    pub fn new(id: String, template: BlockTemplate, created: DateTime<Utc>) -> Self {
        Self {
            id,
            template,
            created,
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn height(&self) -> u64 {
        self.template.height
    }

    pub fn network_target(&self) -> U256 {
        self.template.network_target
    }

    /// Record a submission tuple. Returns false when the tuple was
    /// already submitted against this job.
    pub fn register_submission(&self, extranonce1: &str, nonce: &str, extranonce2: &str) -> bool {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        extranonce1.hash(&mut hasher);
        nonce.to_ascii_lowercase().hash(&mut hasher);
        extranonce2.to_ascii_lowercase().hash(&mut hasher);
        self.seen.lock().insert(hasher.finish())
    }
}

#[derive(Clone)]
pub struct JobNotification {
    pub job: Arc<Job>,
    pub clean: bool,
}

#[derive(Default)]
struct JobSet {
    current: Option<Arc<Job>>,
    by_id: HashMap<String, Arc<Job>>,
    order: VecDeque<String>,
}

impl JobSet {
    fn insert(&mut self, job: Arc<Job>) {
        self.by_id.insert(job.id.clone(), job.clone());
        self.order.push_back(job.id.clone());
        self.current = Some(job);
    }

    fn evict_below(&mut self, min_height: u64) {
        while let Some(front) = self.order.front() {
            let stale = self
                .by_id
                .get(front)
                .map(|j| j.height() < min_height)
                .unwrap_or(true);
            if !stale {
                break;
            }
            let id = self.order.pop_front().unwrap();
            self.by_id.remove(&id);
        }
    }
}

pub struct JobManager {
    pool_id: String,
    family: Arc<dyn CoinFamily>,
    daemon: Arc<DaemonClient>,
    clock: SharedClock,
    bus: MessageBus,
    refresh_interval: Duration,
    jobs: RwLock<JobSet>,
    job_counter: AtomicU64,
    notify_tx: broadcast::Sender<JobNotification>,
    cancel: Mutex<CancellationToken>,
}

impl JobManager {
    pub fn new(
        pool_id: String,
        family: Arc<dyn CoinFamily>,
        daemon: Arc<DaemonClient>,
        clock: SharedClock,
        bus: MessageBus,
        refresh_interval: Duration,
    ) -> Self {
        let (notify_tx, _) = broadcast::channel(64);
        Self {
            pool_id,
            family,
            daemon,
            clock,
            bus,
            refresh_interval,
            jobs: RwLock::new(JobSet::default()),
            job_counter: AtomicU64::new(1),
            notify_tx,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobNotification> {
        self.notify_tx.subscribe()
    }

    pub async fn current_job(&self) -> Option<Arc<Job>> {
        self.jobs.read().await.current.clone()
    }

    pub async fn get_job(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.read().await.by_id.get(id).cloned()
    }

    pub async fn job_heights(&self) -> Vec<u64> {
        let jobs = self.jobs.read().await;
        jobs.by_id.values().map(|j| j.height()).collect()
    }

    /// Startup preconditions: every endpoint healthy (well-formed work
    /// response; credentials rejected is fatal), at least one connected
    /// peer, and the chain synced. Blocks until satisfied or cancelled.
    pub async fn ensure_ready(&self) -> Result<()> {
        let cancel = self.cancel.lock().clone();

        loop {
            if cancel.is_cancelled() {
                bail!("startup cancelled");
            }
            match self.all_endpoints_healthy().await {
                Ok(true) => break,
                Ok(false) => {
                    tracing::info!(pool = %self.pool_id, "waiting for daemons to come online");
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }

        loop {
            if cancel.is_cancelled() {
                bail!("startup cancelled");
            }
            let peers = self.best_peer_count().await;
            if peers > 0 {
                tracing::info!(pool = %self.pool_id, peers, "daemon has peers");
                break;
            }
            tracing::info!(pool = %self.pool_id, "daemon reports no peers yet");
            tokio::time::sleep(Duration::from_secs(5)).await;
        }

        loop {
            if cancel.is_cancelled() {
                bail!("startup cancelled");
            }
            let (method, params) = self.family.sync_state_call();
            let state = self
                .daemon
                .call(method, params)
                .await
                .ok()
                .and_then(|v| self.family.parse_sync_state(&v).ok());
            match state {
                Some(state) if state.synced => break,
                Some(state) => {
                    tracing::info!(pool = %self.pool_id, "daemon syncing: {}", state.detail);
                }
                None => {
                    tracing::warn!(pool = %self.pool_id, "could not read sync state");
                }
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }

        Ok(())
    }

    async fn all_endpoints_healthy(&self) -> Result<bool> {
        let (method, params) = self.family.get_work_call();
        let results = self.daemon.call_all(method, params).await;
        let mut healthy = true;
        for result in results {
            match result {
                Ok(value) => {
                    if let Err(e) = self.family.parse_template(&value) {
                        bail!("daemon returned an unusable work response: {e}");
                    }
                }
                Err(DaemonError::Unauthorized) => {
                    bail!("daemon rejected credentials");
                }
                Err(DaemonError::Rpc { code, message }) => {
                    bail!("daemon rpc error during startup ({code}): {message}");
                }
                Err(_) => healthy = false,
            }
        }
        Ok(healthy)
    }

    async fn best_peer_count(&self) -> u64 {
        let (method, params) = self.family.peer_count_call();
        self.daemon
            .call_all(method, params)
            .await
            .into_iter()
            .filter_map(|r| r.ok())
            .filter_map(|v| self.family.parse_peer_count(&v).ok())
            .max()
            .unwrap_or(0)
    }

    /// Start the poll loop and, when endpoints expose one, the push
    /// subscription. Re-entrant after `stop()`.
    pub fn start(self: &Arc<Self>) {
        let cancel = {
            let mut guard = self.cancel.lock();
            if guard.is_cancelled() {
                *guard = CancellationToken::new();
            }
            guard.clone()
        };

        let mgr = self.clone();
        let poll_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(mgr.refresh_interval);
            let mut failures: u32 = 0;
            loop {
                tokio::select! {
                    _ = poll_cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                match mgr.refresh_once().await {
                    Ok(_) => failures = 0,
                    Err(e) => {
                        failures += 1;
                        tracing::warn!(pool = %mgr.pool_id, "template refresh failed: {e}");
                        // One notification per outage, after the refresh
                        // window has clearly elapsed.
                        if failures == 3 {
                            mgr.bus.notify_admin(
                                "daemons unreachable",
                                format!("pool {}: {}", mgr.pool_id, e),
                            );
                        }
                    }
                }
            }
        });

        if self.daemon.has_notify_endpoints() {
            let (tx, mut rx) = mpsc::channel::<Value>(16);
            self.daemon.spawn_notify_listeners(cancel.clone(), tx);
            let mgr = self.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        pushed = rx.recv() => {
                            let Some(value) = pushed else { return };
                            let payload = value.get("params").unwrap_or(&value);
                            match mgr.family.parse_template(payload) {
                                Ok(template) => {
                                    mgr.install(template).await;
                                }
                                Err(e) => {
                                    tracing::warn!(pool = %mgr.pool_id, "bad pushed template: {e}");
                                }
                            }
                        }
                    }
                }
            });
        }
    }

    /// Cancel polling and push subscriptions.
    pub fn stop(&self) {
        self.cancel.lock().cancel();
    }

    /// Fetch a template and install it if it is new. Returns whether a
    /// new job was published.
    pub async fn refresh_once(&self) -> Result<bool> {
        let (method, params) = self.family.get_work_call();
        let value = self
            .daemon
            .call(method, params)
            .await
            .context("fetching block template")?;
        let template = self
            .family
            .parse_template(&value)
            .context("parsing block template")?;
        Ok(self.install(template).await.is_some())
    }

    /// Install a template as the current job if it advances the chain
    /// view. New-job events are strictly monotonic in height.
    pub async fn install(&self, template: BlockTemplate) -> Option<JobNotification> {
        let mut jobs = self.jobs.write().await;

        let clean = match &jobs.current {
            None => true,
            Some(current) => {
                let cur = &current.template;
                if template.height < cur.height {
                    return None;
                }
                if template.height == cur.height
                    && template.prev_hash == cur.prev_hash
                    && template.header_hash == cur.header_hash
                {
                    return None;
                }
                template.height > cur.height
            }
        };

        // Epoch contexts must exist before the job is announced.
        if let Err(e) = self.family.prepare(&template) {
            tracing::error!(pool = %self.pool_id, "template preparation failed: {e}");
            return None;
        }

        let id = format!("{:08x}", self.job_counter.fetch_add(1, Ordering::Relaxed));
        let job = Arc::new(Job::new(id, template, self.clock.wall()));
        let height = job.height();

        jobs.insert(job.clone());
        jobs.evict_below(height.saturating_sub(MAX_BLOCK_BACKLOG));
        drop(jobs);

        metrics::set_template_height(height);
        tracing::info!(
            pool = %self.pool_id,
            job = %job.id,
            height,
            difficulty = job.template.network_difficulty,
            clean,
            "new job installed"
        );

        let notification = JobNotification { job, clean };
        let _ = self.notify_tx.send(notification.clone());
        Some(notification)
    }

    /// Submit a block-candidate share to the daemon. A rejected candidate
    /// keeps its share validity but loses the block flag; the failure is
    /// announced on the bus and never retried.
    pub async fn submit_candidate(&self, job: &Job, validated: &mut ValidatedShare) -> bool {
        let Some(submission) = validated.submission.as_ref() else {
            return false;
        };
        let share = &mut validated.share;

        let params = self.family.submit_params(job, submission);
        let outcome = self.daemon.call(self.family.submit_method(), params).await;

        let accepted = match &outcome {
            Ok(value) => self.family.parse_submit_result(value),
            Err(_) => false,
        };

        if accepted {
            metrics::inc_blocks_found();
            tracing::info!(
                pool = %self.pool_id,
                height = share.block_height,
                worker = %share.worker,
                hash = %submission.header_hash,
                "block accepted"
            );
            self.bus.publish(PoolEvent::BlockFound {
                pool_id: self.pool_id.clone(),
                height: share.block_height,
                hash: submission.header_hash.clone(),
                worker: share.worker.clone(),
            });
        } else {
            let reason = match outcome {
                Ok(value) => value.to_string(),
                Err(e) => e.to_string(),
            };
            metrics::inc_block_submits_failed();
            tracing::warn!(
                pool = %self.pool_id,
                height = share.block_height,
                "block submission failed: {reason}"
            );
            share.is_block_candidate = false;
            self.bus.publish(PoolEvent::BlockSubmitFailed {
                pool_id: self.pool_id.clone(),
                height: share.block_height,
                worker: share.worker.clone(),
                reason,
            });
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use crate::shares::validator::EthereumFamily;

    fn manager() -> Arc<JobManager> {
        let family = Arc::new(EthereumFamily::new(Default::default()));
        let daemon = Arc::new(DaemonClient::new(&[]));
        Arc::new(JobManager::new(
            "test1".to_string(),
            family,
            daemon,
            system_clock(),
            MessageBus::new(16),
            Duration::from_secs(5),
        ))
    }

    fn template(height: u64, tag: &str) -> BlockTemplate {
        BlockTemplate {
            height,
            prev_hash: format!("prev-{height}"),
            network_target: U256::from_difficulty(1000.0),
            network_difficulty: 1000.0,
            header_hash: Some(format!("{:064}", tag.len() as u64 + height)),
            seed_hash: Some("00".repeat(32)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn installs_are_monotonic_in_height() {
        let mgr = manager();
        assert!(mgr.install(template(100, "a")).await.is_some());
        assert!(mgr.install(template(99, "b")).await.is_none());
        assert!(mgr.install(template(101, "c")).await.is_some());
        assert_eq!(mgr.current_job().await.unwrap().height(), 101);
    }

    #[tokio::test]
    async fn same_template_is_not_reinstalled() {
        let mgr = manager();
        assert!(mgr.install(template(100, "a")).await.is_some());
        assert!(mgr.install(template(100, "a")).await.is_none());
        // Same height but different work package: installed, not clean.
        let n = mgr.install(template(100, "wide")).await.unwrap();
        assert!(!n.clean);
    }

    #[tokio::test]
    async fn clean_flag_set_on_height_advance() {
        let mgr = manager();
        let first = mgr.install(template(100, "a")).await.unwrap();
        assert!(first.clean);
        let second = mgr.install(template(101, "a")).await.unwrap();
        assert!(second.clean);
    }

    #[tokio::test]
    async fn backlog_eviction_keeps_recent_heights_only() {
        let mgr = manager();
        let mut ids = Vec::new();
        for h in [100u64, 101, 102, 103, 104, 105] {
            let n = mgr.install(template(h, "a")).await.unwrap();
            ids.push((h, n.job.id.clone()));
        }
        let heights = mgr.job_heights().await;
        assert!(heights.iter().all(|&h| h >= 105 - MAX_BLOCK_BACKLOG));
        for (h, id) in ids {
            let present = mgr.get_job(&id).await.is_some();
            assert_eq!(present, h >= 105 - MAX_BLOCK_BACKLOG, "height {h}");
        }
    }

    #[tokio::test]
    async fn duplicate_submission_tuple_is_detected() {
        let mgr = manager();
        let n = mgr.install(template(100, "a")).await.unwrap();
        assert!(n.job.register_submission("ab", "1234", ""));
        assert!(!n.job.register_submission("ab", "1234", ""));
        // Different extranonce: distinct tuple.
        assert!(n.job.register_submission("ac", "1234", ""));
    }

    #[tokio::test]
    async fn job_ids_are_monotonic_hex() {
        let mgr = manager();
        let a = mgr.install(template(100, "a")).await.unwrap();
        let b = mgr.install(template(101, "a")).await.unwrap();
        let ia = u64::from_str_radix(&a.job.id, 16).unwrap();
        let ib = u64::from_str_radix(&b.job.id, 16).unwrap();
        assert!(ib > ia);
    }
}
