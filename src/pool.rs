//! Per-currency pool.
//!
//! Wires one coin's daemon client, job manager, stratum server, vardiff
//! and validator together, and owns the request dispatcher behind the
//! stratum server's session hooks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::banning::{BanManager, BanningConfig};
use crate::bus::{MessageBus, PoolEvent};
use crate::clock::SharedClock;
use crate::config::PoolConfig;
use crate::daemon::DaemonClient;
use crate::jobs::{Job, JobManager, JobNotification};
use crate::metrics;
use crate::relay::ShareReceiver;
use crate::shares::validator::{family_for, CoinFamily, SubmitContext};
use crate::stratum::connection::Session;
use crate::stratum::protocol::{notification, StratumError, StratumRequest, StratumResponse};
use crate::stratum::server::{ConnectionLimits, SessionHandler, StratumServer};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub pool_id: String,
    pub connected_miners: usize,
    pub accepted_shares: u64,
    pub rejected_shares: u64,
    pub blocks_found: u64,
    pub network_difficulty: f64,
    pub block_height: u64,
}

pub struct Pool {
    inner: Arc<PoolInner>,
    server: Arc<StratumServer<PoolHandler>>,
    receiver: parking_lot::Mutex<Option<ShareReceiver>>,
    cancel: parking_lot::Mutex<CancellationToken>,
}

pub(crate) struct PoolInner {
    cfg: PoolConfig,
    cluster_name: String,
    family: Arc<dyn CoinFamily>,
    jobs: Arc<JobManager>,
    bus: MessageBus,
    bans: Arc<BanManager>,
    banning: BanningConfig,
    clock: SharedClock,
    accepted: AtomicU64,
    rejected: AtomicU64,
    blocks: AtomicU64,
}

struct PoolHandler {
    inner: Arc<PoolInner>,
}

impl SessionHandler for PoolHandler {
    async fn on_connect(&self, session: &Arc<Session>) {
        tracing::debug!(
            pool = %self.inner.cfg.id,
            session = %session.id,
            remote = %session.remote,
            "miner connected"
        );
    }

    async fn on_request(&self, session: &Arc<Session>, request: StratumRequest) {
        self.inner.dispatch(session, request).await;
    }

    async fn on_disconnect(&self, session: &Arc<Session>) {
        tracing::debug!(
            pool = %self.inner.cfg.id,
            session = %session.id,
            "miner disconnected"
        );
    }
}

impl Pool {
    pub fn new(
        cfg: PoolConfig,
        cluster_name: String,
        banning: BanningConfig,
        bus: MessageBus,
        bans: Arc<BanManager>,
        clock: SharedClock,
    ) -> Self {
        let family = family_for(&cfg.coin);
        let daemon = Arc::new(DaemonClient::new(&cfg.daemons));
        let jobs = Arc::new(JobManager::new(
            cfg.id.clone(),
            family.clone(),
            daemon,
            clock.clone(),
            bus.clone(),
            Duration::from_secs(cfg.block_refresh_interval.max(1)),
        ));

        let inner = Arc::new(PoolInner {
            cluster_name,
            family,
            jobs,
            bus,
            bans: bans.clone(),
            banning: banning.clone(),
            clock: clock.clone(),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            blocks: AtomicU64::new(0),
            cfg,
        });

        let server = Arc::new(StratumServer::new(
            inner.cfg.id.clone(),
            Arc::new(PoolHandler {
                inner: inner.clone(),
            }),
            bans,
            banning,
            clock,
            Duration::from_secs(inner.cfg.client_idle_timeout_secs.max(1)),
            ConnectionLimits {
                max_connections: inner.cfg.max_connections,
                max_connections_per_ip: inner.cfg.max_connections_per_ip,
            },
        ));

        Self {
            inner,
            server,
            receiver: parking_lot::Mutex::new(None),
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.cfg.id
    }

    /// Bring the pool up: daemon preconditions, first job, poll loop,
    /// stratum listeners, job fan-out and relay subscriptions.
    pub async fn start(&self) -> Result<()> {
        let cancel = {
            let mut guard = self.cancel.lock();
            if guard.is_cancelled() {
                *guard = CancellationToken::new();
            }
            guard.clone()
        };

        self.inner.jobs.ensure_ready().await?;
        self.inner
            .jobs
            .refresh_once()
            .await
            .context("fetching the initial job")?;
        self.inner.jobs.start();

        if self.inner.cfg.enable_internal_stratum {
            self.server.start(&self.inner.cfg.stratums).await?;
        }

        // Fan job notifications out to every live session.
        let inner = self.inner.clone();
        let server = self.server.clone();
        let mut job_rx = self.inner.jobs.subscribe();
        tokio::spawn(async move {
            loop {
                let notification = tokio::select! {
                    _ = cancel.cancelled() => return,
                    notification = job_rx.recv() => notification,
                };
                match notification {
                    Ok(n) => {
                        let delivered =
                            server.broadcast(|session| inner.job_messages(session, &n));
                        metrics::inc_job_broadcasts();
                        tracing::debug!(
                            pool = %inner.cfg.id,
                            job = %n.job.id,
                            delivered,
                            "job broadcast"
                        );
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(pool = %inner.cfg.id, missed, "job fan-out lagged");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        });

        if !self.inner.cfg.external_stratums.is_empty() {
            let receiver = ShareReceiver::start(
                self.inner.cfg.external_stratums.clone(),
                self.inner.bus.clone(),
                self.inner.clock.clone(),
            );
            *self.receiver.lock() = Some(receiver);
        }

        tracing::info!(pool = %self.inner.cfg.id, "pool started");
        Ok(())
    }

    /// Graceful shutdown: close listeners, drain sessions, cancel the
    /// daemon polling and relay subscriptions.
    pub fn stop(&self) {
        tracing::info!(pool = %self.inner.cfg.id, "stopping pool");
        self.cancel.lock().cancel();
        self.server.stop();
        self.inner.jobs.stop();
        if let Some(receiver) = self.receiver.lock().take() {
            receiver.stop();
        }
        tracing::info!(pool = %self.inner.cfg.id, "pool stopped");
    }

    pub async fn stats(&self) -> PoolStats {
        let current = self.inner.jobs.current_job().await;
        PoolStats {
            pool_id: self.inner.cfg.id.clone(),
            connected_miners: self.server.session_count(),
            accepted_shares: self.inner.accepted.load(Ordering::Relaxed),
            rejected_shares: self.inner.rejected.load(Ordering::Relaxed),
            blocks_found: self.inner.blocks.load(Ordering::Relaxed),
            network_difficulty: current
                .as_ref()
                .map(|j| j.template.network_difficulty)
                .unwrap_or(0.0),
            block_height: current.map(|j| j.height()).unwrap_or(0),
        }
    }

    /// Addresses the stratum listeners actually bound.
    pub fn stratum_addrs(&self) -> Vec<std::net::SocketAddr> {
        self.server.bound_addrs()
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<PoolInner> {
        &self.inner
    }
}

impl PoolInner {
    #[cfg(test)]
    pub(crate) fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    /// Route one request from a session. Replies and notifications go
    /// back through the session's send queue.
    pub(crate) async fn dispatch(&self, session: &Arc<Session>, request: StratumRequest) {
        let method = request.method.clone();
        match method.as_str() {
            "mining.subscribe" => self.handle_subscribe(session, request).await,
            "mining.authorize" => self.handle_authorize(session, request).await,
            "mining.submit" => self.handle_submit(session, request).await,
            "mining.extranonce.subscribe" => {
                session.respond(StratumResponse::success(request.id, json!(true)));
            }
            other => {
                tracing::debug!(method = other, "unsupported stratum method");
                session.respond(StratumResponse::failure(
                    request.id,
                    StratumError::other(format!("unsupported method '{}'", other)),
                ));
            }
        }
    }

    async fn handle_subscribe(&self, session: &Arc<Session>, request: StratumRequest) {
        let extranonce1 = session.extranonce1();
        session.with_state(|state| state.subscribed = true);

        session.respond(StratumResponse::success(
            request.id,
            json!([
                [
                    ["mining.set_difficulty", session.id.clone()],
                    ["mining.notify", session.id.clone()]
                ],
                extranonce1,
                self.family.extranonce2_size(),
            ]),
        ));

        self.push_current_work(session, true).await;
    }

    async fn handle_authorize(&self, session: &Arc<Session>, request: StratumRequest) {
        let params = request.params.as_ref().and_then(Value::as_array);
        let Some(login) = params
            .and_then(|p| p.first())
            .and_then(Value::as_str)
            .filter(|l| !l.trim().is_empty())
        else {
            session.respond(StratumResponse::failure(
                request.id,
                StratumError::other("missing worker name"),
            ));
            return;
        };

        let login = login.trim().to_string();
        let miner = login
            .split_once('.')
            .map(|(address, _)| address.to_string())
            .filter(|a| !a.is_empty());

        session.with_state(|state| {
            state.authorized = true;
            state.worker = Some(login.clone());
            state.miner = miner.clone();
        });
        tracing::info!(pool = %self.cfg.id, worker = %login, "worker authorized");

        session.respond(StratumResponse::success(request.id, json!(true)));
    }

    async fn handle_submit(&self, session: &Arc<Session>, request: StratumRequest) {
        if !session.is_authorized() {
            session.respond(StratumResponse::failure(
                request.id,
                StratumError::unauthorized(),
            ));
            return;
        }
        if !session.is_subscribed() {
            session.respond(StratumResponse::failure(
                request.id,
                StratumError::not_subscribed(),
            ));
            return;
        }

        let params = match request.params.as_ref().and_then(Value::as_array) {
            Some(p) => p,
            None => {
                session.respond(StratumResponse::failure(
                    request.id,
                    StratumError::other("missing submit params"),
                ));
                return;
            }
        };

        match self.validate(session, params).await {
            Ok((job, mut validated)) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                metrics::inc_accepted();

                self.apply_vardiff(session);
                session.respond(StratumResponse::success(request.id, json!(true)));

                if validated.share.is_block_candidate {
                    let accepted = self.jobs.submit_candidate(&job, &mut validated).await;
                    if accepted {
                        self.blocks.fetch_add(1, Ordering::Relaxed);
                    }
                }

                tracing::debug!(
                    pool = %self.cfg.id,
                    worker = %validated.share.worker,
                    difficulty = validated.share.difficulty,
                    actual = validated.share.actual_difficulty,
                    "share accepted"
                );
                self.bus.publish(PoolEvent::ShareAccepted {
                    share: validated.share,
                });
            }
            Err(error) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::inc_rejected();
                tracing::debug!(
                    pool = %self.cfg.id,
                    session = %session.id,
                    code = error.code,
                    "share rejected: {}",
                    error.message
                );
                session.respond(StratumResponse::failure(request.id, error));
                self.check_invalid_share_ban(session);
            }
        }
    }

    /// Locate the job and run the family validator. Shares against jobs
    /// behind the current height are stale even while the job is still
    /// retained for duplicate tracking.
    async fn validate(
        &self,
        session: &Arc<Session>,
        params: &[Value],
    ) -> Result<(Arc<Job>, crate::shares::ValidatedShare), StratumError> {
        let job_id = params
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(StratumError::job_not_found)?;

        let job = self
            .jobs
            .get_job(job_id)
            .await
            .ok_or_else(StratumError::stale_share)?;
        if let Some(current) = self.jobs.current_job().await {
            if job.height() < current.height() {
                return Err(StratumError::stale_share());
            }
        }

        let snapshot = session.snapshot();
        let ctx = SubmitContext {
            pool_id: &self.cfg.id,
            source: &self.cluster_name,
            now: self.clock.wall(),
        };
        let validated = self.family.validate_submit(&ctx, &snapshot, params, &job)?;

        session.with_state(|state| state.valid_shares += 1);
        Ok((job, validated))
    }

    fn apply_vardiff(&self, session: &Arc<Session>) {
        let now = self.clock.now();
        let retarget = session.with_state(|state| {
            let retarget = state.vardiff.on_share(now);
            if let Some(next) = retarget {
                state.pending_difficulty = Some(next);
            }
            retarget
        });
        if let Some(next) = retarget {
            metrics::inc_vardiff_retargets();
            tracing::debug!(
                pool = %self.cfg.id,
                session = %session.id,
                next,
                "vardiff retarget pending"
            );
        }
    }

    fn check_invalid_share_ban(&self, session: &Arc<Session>) {
        if !self.banning.ban_on_invalid_shares {
            return;
        }
        let should_ban = session.with_state(|state| {
            state.invalid_shares += 1;
            let total = state.valid_shares + state.invalid_shares;
            if total < self.banning.check_threshold {
                return false;
            }
            let ratio = state.invalid_shares as f64 * 100.0 / total as f64;
            state.valid_shares = 0;
            state.invalid_shares = 0;
            ratio >= self.banning.invalid_percent
        });
        if should_ban {
            tracing::info!(
                pool = %self.cfg.id,
                remote = %session.remote,
                "worker banned for invalid shares"
            );
            self.bans.ban(
                session.remote.ip(),
                self.banning.invalid_share_ban_duration(),
            );
            session.close();
        }
    }

    /// Messages delivering a job to one session: a pending vardiff
    /// difficulty is applied here, immediately before the notify.
    pub(crate) fn job_messages(
        &self,
        session: &Arc<Session>,
        notification_: &JobNotification,
    ) -> Vec<Value> {
        let (subscribed, new_difficulty) = session.with_state(|state| {
            if !state.subscribed {
                return (false, None);
            }
            let pending = state.pending_difficulty.take();
            if let Some(next) = pending {
                state.difficulty = next;
            }
            state.current_job_id = Some(notification_.job.id.clone());
            (true, pending)
        });
        if !subscribed {
            return Vec::new();
        }

        let mut messages = Vec::with_capacity(2);
        if let Some(next) = new_difficulty {
            messages.push(notification("mining.set_difficulty", json!([next])));
        }
        messages.push(notification(
            "mining.notify",
            self.family
                .notify_params(&notification_.job, notification_.clean),
        ));
        messages
    }

    /// Difficulty plus the current job, sent on subscribe.
    async fn push_current_work(&self, session: &Arc<Session>, clean: bool) {
        let difficulty = session.with_state(|state| state.difficulty);
        session.post(&notification("mining.set_difficulty", json!([difficulty])));

        if let Some(job) = self.jobs.current_job().await {
            session.with_state(|state| state.current_job_id = Some(job.id.clone()));
            session.post(&notification(
                "mining.notify",
                self.family.notify_params(&job, clean),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use crate::config::ClusterConfig;
    use crate::jobs::BlockTemplate;
    use crate::util::U256;
    use crate::vardiff::{VardiffConfig, VardiffState};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Instant;
    use tokio::sync::mpsc;

    fn pool_with(coin: Value, daemon_url: &str) -> Pool {
        let cfg: ClusterConfig = serde_json::from_value(json!({
            "clusterName": "local",
            "pools": [{
                "id": "pool1",
                "coin": coin,
                "daemons": [{ "url": daemon_url }],
                "stratums": [{ "address": "127.0.0.1", "port": 0, "difficulty": 1.0 }],
            }]
        }))
        .unwrap();
        let clock = system_clock();
        let bans = Arc::new(BanManager::new(clock.clone()));
        Pool::new(
            cfg.pools[0].clone(),
            cfg.cluster_name,
            cfg.banning,
            MessageBus::new(64),
            bans,
            clock,
        )
    }

    fn eth_pool() -> Pool {
        pool_with(json!({ "type": "ethereum" }), "http://127.0.0.1:1")
    }

    fn session(difficulty: f64) -> (Arc<Session>, mpsc::Receiver<String>) {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 77)), 50000);
        Session::new(
            addr,
            3333,
            "0000ab01".to_string(),
            difficulty,
            VardiffState::new(VardiffConfig::default(), Instant::now(), difficulty),
            Instant::now(),
        )
    }

    fn template(height: u64, network_difficulty: f64) -> BlockTemplate {
        BlockTemplate {
            height,
            prev_hash: format!("{:064x}", height),
            network_target: U256::from_difficulty(network_difficulty),
            network_difficulty,
            header_hash: Some(format!("{:064x}", height + 7)),
            seed_hash: Some("cc".repeat(32)),
            ..Default::default()
        }
    }

    async fn ready_session(
        pool: &Pool,
        difficulty: f64,
    ) -> (Arc<Session>, mpsc::Receiver<String>) {
        let (session, rx) = session(difficulty);
        pool.inner()
            .dispatch(
                &session,
                req(1, "mining.subscribe", json!(["test-miner/1.0"])),
            )
            .await;
        pool.inner()
            .dispatch(
                &session,
                req(2, "mining.authorize", json!(["addr7.rig1", "x"])),
            )
            .await;
        (session, rx)
    }

    fn req(id: u64, method: &str, params: Value) -> StratumRequest {
        StratumRequest {
            jsonrpc: None,
            id: json!(id),
            method: method.to_string(),
            params: Some(params),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(serde_json::from_str(line.trim()).unwrap());
        }
        out
    }

    fn submit_params(job_id: &str, nonce: &str) -> Value {
        json!(["addr7.rig1", job_id, nonce, "dd".repeat(32)])
    }

    #[tokio::test]
    async fn stale_share_after_height_advance() {
        let pool = eth_pool();
        let jobs = pool.inner().jobs();
        let job_a = jobs.install(template(100, 1.0)).await.unwrap();
        let _job_b = jobs.install(template(101, 1.0)).await.unwrap();

        let (session, mut rx) = ready_session(&pool, 1.0).await;
        drain(&mut rx);

        pool.inner()
            .dispatch(
                &session,
                req(
                    3,
                    "mining.submit",
                    submit_params(&job_a.job.id, "00000000000001a4"),
                ),
            )
            .await;

        let messages = drain(&mut rx);
        let reply = messages.last().unwrap();
        assert_eq!(reply["error"]["code"], -1);
        assert_eq!(reply["error"]["message"], "stale share");
    }

    #[tokio::test]
    async fn unknown_job_id_is_stale() {
        let pool = eth_pool();
        pool.inner().jobs().install(template(100, 1.0)).await.unwrap();
        let (session, mut rx) = ready_session(&pool, 1.0).await;
        drain(&mut rx);

        pool.inner()
            .dispatch(
                &session,
                req(3, "mining.submit", submit_params("ffffffff", "00000000000001a4")),
            )
            .await;

        let messages = drain(&mut rx);
        assert_eq!(messages.last().unwrap()["error"]["message"], "stale share");
    }

    #[tokio::test]
    async fn duplicate_submission_rejected_at_dispatch() {
        let pool = eth_pool();
        let n = pool.inner().jobs().install(template(100, 1.0)).await.unwrap();
        let (session, mut rx) = ready_session(&pool, 1.0).await;
        drain(&mut rx);

        let params = submit_params(&n.job.id, "00000000000001a4");
        pool.inner()
            .dispatch(&session, req(3, "mining.submit", params.clone()))
            .await;
        pool.inner()
            .dispatch(&session, req(4, "mining.submit", params))
            .await;

        let messages = drain(&mut rx);
        let first = &messages[messages.len() - 2];
        let second = &messages[messages.len() - 1];
        assert_eq!(first["result"], json!(true));
        assert_eq!(second["error"]["code"], -1);
        assert_eq!(second["error"]["message"], "duplicate share");
    }

    #[tokio::test]
    async fn low_difficulty_reports_ratio() {
        let pool = eth_pool();
        let n = pool
            .inner()
            .jobs()
            .install(template(100, 1e9))
            .await
            .unwrap();
        let (session, mut rx) = ready_session(&pool, 1e12).await;
        drain(&mut rx);

        pool.inner()
            .dispatch(
                &session,
                req(
                    3,
                    "mining.submit",
                    submit_params(&n.job.id, "00000000000001a4"),
                ),
            )
            .await;

        let messages = drain(&mut rx);
        let reply = messages.last().unwrap();
        assert_eq!(reply["error"]["code"], 23);
        let message = reply["error"]["message"].as_str().unwrap();
        assert!(message.starts_with("low difficulty share ("), "{message}");
    }

    #[tokio::test]
    async fn submit_requires_authorization_then_subscription() {
        let pool = eth_pool();
        pool.inner().jobs().install(template(100, 1.0)).await.unwrap();

        let (session, mut rx) = session(1.0);
        pool.inner()
            .dispatch(&session, req(1, "mining.submit", submit_params("x", "y")))
            .await;
        let unauthorized = drain(&mut rx);
        assert_eq!(unauthorized.last().unwrap()["error"]["code"], 24);

        pool.inner()
            .dispatch(&session, req(2, "mining.authorize", json!(["addr7.rig1", "x"])))
            .await;
        pool.inner()
            .dispatch(&session, req(3, "mining.submit", submit_params("x", "y")))
            .await;
        let unsubscribed = drain(&mut rx);
        assert_eq!(unsubscribed.last().unwrap()["error"]["code"], 25);
    }

    #[tokio::test]
    async fn accepted_share_is_published_on_the_bus() {
        let pool = eth_pool();
        let mut bus_rx = pool.inner().bus.subscribe();
        // Network difficulty high: plain share, no daemon submission.
        let n = pool
            .inner()
            .jobs()
            .install(template(100, 1e30))
            .await
            .unwrap();
        let (session, mut rx) = ready_session(&pool, 1.0).await;
        drain(&mut rx);

        pool.inner()
            .dispatch(
                &session,
                req(
                    3,
                    "mining.submit",
                    submit_params(&n.job.id, "00000000000001a4"),
                ),
            )
            .await;

        match bus_rx.try_recv().unwrap() {
            PoolEvent::ShareAccepted { share } => {
                assert_eq!(share.pool_id, "pool1");
                assert_eq!(share.source, "local");
                assert_eq!(share.worker, "addr7.rig1");
                assert_eq!(share.miner.as_deref(), Some("addr7"));
                assert_eq!(share.block_height, 100);
                assert!(!share.is_block_candidate);
                assert!(share.actual_difficulty >= share.difficulty);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_block_submission_clears_candidate_flag() {
        // Daemon endpoint unreachable: candidate submission fails, the
        // share stays accepted but loses the block flag.
        let pool = eth_pool();
        let mut bus_rx = pool.inner().bus.subscribe();
        let n = pool.inner().jobs().install(template(100, 1.0)).await.unwrap();
        let (session, mut rx) = ready_session(&pool, 1.0).await;
        drain(&mut rx);

        pool.inner()
            .dispatch(
                &session,
                req(
                    3,
                    "mining.submit",
                    submit_params(&n.job.id, "00000000000001a4"),
                ),
            )
            .await;

        // Miner still sees an accepted share.
        let messages = drain(&mut rx);
        assert_eq!(messages.last().unwrap()["result"], json!(true));

        let mut saw_failure = false;
        let mut share_flag = None;
        while let Ok(event) = bus_rx.try_recv() {
            match event {
                PoolEvent::BlockSubmitFailed { pool_id, .. } => {
                    assert_eq!(pool_id, "pool1");
                    saw_failure = true;
                }
                PoolEvent::ShareAccepted { share } => {
                    share_flag = Some(share.is_block_candidate);
                }
                _ => {}
            }
        }
        assert!(saw_failure, "expected a block submission failure event");
        assert_eq!(share_flag, Some(false));
    }

    #[tokio::test]
    async fn pending_difficulty_applies_with_next_job() {
        let pool = eth_pool();
        let n1 = pool.inner().jobs().install(template(100, 1.0)).await.unwrap();
        let (session, mut rx) = ready_session(&pool, 1.0).await;
        drain(&mut rx);

        // No pending difficulty: notify only.
        let messages = pool.inner().job_messages(&session, &n1);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["method"], "mining.notify");

        session.with_state(|s| s.pending_difficulty = Some(64.0));
        let n2 = pool.inner().jobs().install(template(101, 1.0)).await.unwrap();
        let messages = pool.inner().job_messages(&session, &n2);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["method"], "mining.set_difficulty");
        assert_eq!(messages[0]["params"], json!([64.0]));
        assert_eq!(messages[1]["method"], "mining.notify");
        // Applied difficulty is now live on the session.
        assert!((session.snapshot().difficulty - 64.0).abs() < f64::EPSILON);
        assert!(session.with_state(|s| s.pending_difficulty.is_none()));
        drain(&mut rx);
    }

    #[tokio::test]
    async fn subscribe_reply_carries_extranonce() {
        let pool = eth_pool();
        pool.inner().jobs().install(template(100, 1.0)).await.unwrap();
        let (session, mut rx) = session(1.0);

        pool.inner()
            .dispatch(&session, req(1, "mining.subscribe", json!([])))
            .await;

        let messages = drain(&mut rx);
        let reply = &messages[0];
        assert_eq!(reply["result"][1], json!("0000ab01"));
        assert_eq!(reply["result"][2], json!(0));
        // Difficulty and the current job follow immediately.
        assert_eq!(messages[1]["method"], "mining.set_difficulty");
        assert_eq!(messages[2]["method"], "mining.notify");
    }

    #[tokio::test]
    async fn repeated_invalid_shares_ban_the_peer() {
        let pool = eth_pool();
        pool.inner().jobs().install(template(100, 1.0)).await.unwrap();
        let (session, mut rx) = ready_session(&pool, 1.0).await;
        drain(&mut rx);

        // All submissions reference an unknown job: every one invalid.
        for i in 0..25 {
            pool.inner()
                .dispatch(
                    &session,
                    req(10 + i, "mining.submit", submit_params("deadbeef", "0000000000000001")),
                )
                .await;
        }

        assert!(session.is_closed());
        assert!(pool.inner().bans.is_banned(session.remote.ip()));
    }

    #[tokio::test]
    async fn unknown_method_gets_error_20() {
        let pool = eth_pool();
        let (session, mut rx) = session(1.0);
        pool.inner()
            .dispatch(&session, req(1, "mining.frobnicate", json!([])))
            .await;
        let messages = drain(&mut rx);
        assert_eq!(messages[0]["error"]["code"], 20);
    }

    // -- stub daemon -------------------------------------------------------

    fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    /// Minimal HTTP/1.1 JSON-RPC responder answering per method name.
    async fn stub_daemon(handler: fn(&str) -> Value) -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    loop {
                        let mut buf = Vec::new();
                        let mut tmp = [0u8; 2048];
                        let (header_end, content_length) = loop {
                            let n = stream.read(&mut tmp).await.unwrap_or(0);
                            if n == 0 {
                                return;
                            }
                            buf.extend_from_slice(&tmp[..n]);
                            if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
                                let headers = String::from_utf8_lossy(&buf[..pos]).to_string();
                                let content_length = headers
                                    .lines()
                                    .find_map(|line| {
                                        line.to_ascii_lowercase()
                                            .strip_prefix("content-length:")
                                            .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                                    })
                                    .unwrap_or(0);
                                break (pos + 4, content_length);
                            }
                        };
                        while buf.len() < header_end + content_length {
                            let n = stream.read(&mut tmp).await.unwrap_or(0);
                            if n == 0 {
                                return;
                            }
                            buf.extend_from_slice(&tmp[..n]);
                        }

                        let request: Value =
                            serde_json::from_slice(&buf[header_end..header_end + content_length])
                                .unwrap_or(Value::Null);
                        let method = request["method"].as_str().unwrap_or("").to_string();
                        let id = request["id"].clone();
                        let body = json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "result": handler(&method),
                            "error": null,
                        })
                        .to_string();
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        if stream.write_all(response.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    fn eth_daemon(method: &str) -> Value {
        match method {
            "eth_getWork" => json!({
                "height": 100,
                "headerHash": "bb".repeat(32),
                "seedHash": "cc".repeat(32),
                "target": "ff".repeat(32),
            }),
            "net_peerCount" => json!("0x5"),
            "eth_syncing" => json!(false),
            "eth_submitWork" => json!(true),
            _ => Value::Null,
        }
    }

    #[tokio::test]
    async fn accepted_block_submission_keeps_candidate_flag() {
        let daemon = stub_daemon(eth_daemon).await;
        let pool = pool_with(json!({ "type": "ethereum" }), &format!("http://{}", daemon));
        let mut bus_rx = pool.inner().bus.subscribe();

        // Target of all-ones: every share is a block candidate and the
        // stub daemon accepts the submission.
        pool.inner().jobs().refresh_once().await.unwrap();
        let n = pool.inner().jobs().current_job().await.unwrap();
        let (session, mut rx) = ready_session(&pool, 1.0).await;
        drain(&mut rx);

        pool.inner()
            .dispatch(
                &session,
                req(3, "mining.submit", submit_params(&n.id, "00000000000001a4")),
            )
            .await;

        let mut saw_block = false;
        let mut share_flag = None;
        while let Ok(event) = bus_rx.try_recv() {
            match event {
                PoolEvent::BlockFound { pool_id, height, .. } => {
                    assert_eq!(pool_id, "pool1");
                    assert_eq!(height, 100);
                    saw_block = true;
                }
                PoolEvent::ShareAccepted { share } => share_flag = Some(share.is_block_candidate),
                _ => {}
            }
        }
        assert!(saw_block, "expected a block-found event");
        assert_eq!(share_flag, Some(true));
    }

    /// Next line from the miner socket, parsed; bounded wait so a wedged
    /// server fails the test instead of hanging it.
    async fn read_json_line(
        reader: &mut tokio::io::Lines<tokio::io::BufReader<tokio::net::tcp::OwnedReadHalf>>,
    ) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), reader.next_line())
            .await
            .expect("timed out waiting for a reply")
            .unwrap()
            .expect("connection closed early");
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn pool_serves_miners_end_to_end() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let daemon = stub_daemon(eth_daemon).await;
        let pool = pool_with(json!({ "type": "ethereum" }), &format!("http://{}", daemon));
        pool.start().await.unwrap();
        let addr = pool.stratum_addrs()[0];

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read).lines();

        write
            .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[\"miner/1\"]}\n")
            .await
            .unwrap();
        let subscribe = read_json_line(&mut reader).await;
        let extranonce = subscribe["result"][1].as_str().unwrap().to_string();
        assert_eq!(extranonce.len(), 8);

        let set_difficulty = read_json_line(&mut reader).await;
        assert_eq!(set_difficulty["method"], "mining.set_difficulty");
        let notify = read_json_line(&mut reader).await;
        assert_eq!(notify["method"], "mining.notify");
        let job_id = notify["params"][0].as_str().unwrap().to_string();

        write
            .write_all(b"{\"id\":2,\"method\":\"mining.authorize\",\"params\":[\"addr9.rig\",\"x\"]}\n")
            .await
            .unwrap();
        let authorize = read_json_line(&mut reader).await;
        assert_eq!(authorize["result"], json!(true));

        let submit = json!({
            "id": 3,
            "method": "mining.submit",
            "params": ["addr9.rig", job_id, "00000000000001a4", "dd".repeat(32)],
        });
        write
            .write_all(format!("{}\n", submit).as_bytes())
            .await
            .unwrap();
        let reply = read_json_line(&mut reader).await;
        assert_eq!(reply["result"], json!(true), "submit rejected: {reply}");

        let stats = pool.stats().await;
        assert_eq!(stats.accepted_shares, 1);
        assert_eq!(stats.block_height, 100);
        pool.stop();
    }
}
