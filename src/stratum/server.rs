//! Stratum TCP front-end.
//!
//! One server owns the session registry for a pool and any number of
//! listening endpoints. Accepted peers are checked against the ban list
//! before a single byte is read, wrapped in TLS when the endpoint carries
//! certificate material, and then driven by a per-connection read loop
//! that forwards parsed requests to the pool's dispatcher.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::banning::{BanManager, BanningConfig};
use crate::clock::SharedClock;
use crate::config::StratumEndpointConfig;
use crate::metrics;
use crate::stratum::connection::Session;
use crate::stratum::protocol::{StratumError, StratumRequest, StratumResponse};
use crate::stratum::tls;
use crate::util::socket::is_routine_disconnect;
use crate::vardiff::VardiffState;

const LISTEN_BACKLOG: i32 = 1024;

/// Pool-side hooks driven by the server. Requests from one session are
/// delivered in receive order.
pub trait SessionHandler: Send + Sync + 'static {
    fn on_connect(&self, session: &Arc<Session>) -> impl Future<Output = ()> + Send;
    fn on_request(
        &self,
        session: &Arc<Session>,
        request: StratumRequest,
    ) -> impl Future<Output = ()> + Send;
    fn on_disconnect(&self, session: &Arc<Session>) -> impl Future<Output = ()> + Send;
}

/// Accept-policy limits.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_connections: usize,
    pub max_connections_per_ip: usize,
}

pub struct StratumServer<H: SessionHandler> {
    pool_id: String,
    handler: Arc<H>,
    bans: Arc<BanManager>,
    banning: BanningConfig,
    clock: SharedClock,
    idle_timeout: Duration,
    limits: ConnectionLimits,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    per_ip: Mutex<HashMap<std::net::IpAddr, usize>>,
    extranonce_counter: AtomicU32,
    bound: Mutex<Vec<SocketAddr>>,
    cancel: Mutex<CancellationToken>,
}

impl<H: SessionHandler> StratumServer<H> {
    pub fn new(
        pool_id: String,
        handler: Arc<H>,
        bans: Arc<BanManager>,
        banning: BanningConfig,
        clock: SharedClock,
        idle_timeout: Duration,
        limits: ConnectionLimits,
    ) -> Self {
        Self {
            pool_id,
            handler,
            bans,
            banning,
            clock,
            idle_timeout,
            limits,
            sessions: Mutex::new(HashMap::new()),
            per_ip: Mutex::new(HashMap::new()),
            extranonce_counter: AtomicU32::new(0),
            bound: Mutex::new(Vec::new()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Bind every endpoint and start accepting. Re-entrant after `stop()`.
    pub async fn start(self: &Arc<Self>, endpoints: &[StratumEndpointConfig]) -> Result<()> {
        let cancel = {
            let mut guard = self.cancel.lock();
            if guard.is_cancelled() {
                *guard = CancellationToken::new();
            }
            guard.clone()
        };

        for endpoint in endpoints {
            let listener = bind_listener(&endpoint.address, endpoint.port)?;
            let local = listener.local_addr().context("reading bound address")?;
            self.bound.lock().push(local);

            let acceptor = if endpoint.tls_enabled() {
                let cert = endpoint.tls_cert.as_ref().unwrap();
                let key = endpoint.tls_key.as_ref().unwrap();
                Some(tls::acceptor_for(cert, key)?)
            } else {
                None
            };

            tracing::info!(
                pool = %self.pool_id,
                addr = %local,
                tls = acceptor.is_some(),
                "stratum endpoint listening"
            );

            let server = self.clone();
            let endpoint = endpoint.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                server.accept_loop(listener, acceptor, endpoint, cancel).await;
            });
        }
        Ok(())
    }

    /// Close the listeners and every live session.
    pub fn stop(&self) {
        tracing::info!(pool = %self.pool_id, "stopping stratum server");
        self.cancel.lock().cancel();
        self.bound.lock().clear();
        let sessions: Vec<Arc<Session>> = self.sessions.lock().values().cloned().collect();
        for session in sessions {
            session.close();
        }
        tracing::info!(pool = %self.pool_id, "stratum server stopped");
    }

    /// Addresses actually bound; useful when a port was configured as 0.
    pub fn bound_addrs(&self) -> Vec<SocketAddr> {
        self.bound.lock().clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Snapshot of live sessions; iteration never holds the registry lock.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Fan out messages built per session. One slow consumer only costs
    /// itself: delivery goes through each session's bounded queue.
    pub fn broadcast<F>(&self, make: F) -> usize
    where
        F: Fn(&Arc<Session>) -> Vec<Value>,
    {
        let mut delivered = 0;
        for session in self.sessions() {
            let messages = make(&session);
            if messages.is_empty() {
                continue;
            }
            if messages.iter().all(|m| session.post(m)) {
                delivered += 1;
            }
        }
        delivered
    }

    fn release_ip(&self, ip: std::net::IpAddr) {
        let mut per_ip = self.per_ip.lock();
        if let Some(count) = per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                per_ip.remove(&ip);
            }
        }
    }

    /// Monotonic extra-nonce prefixes: unique among all live (and dead)
    /// sessions of this pool.
    fn next_extranonce(&self) -> String {
        format!("{:08x}", self.extranonce_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        acceptor: Option<tokio_rustls::TlsAcceptor>,
        endpoint: StratumEndpointConfig,
        cancel: CancellationToken,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(pool = %self.pool_id, "accept failed: {e}");
                    continue;
                }
            };

            // Banned peers are refused before any bytes are read.
            if self.bans.is_banned(peer.ip()) {
                tracing::debug!(pool = %self.pool_id, %peer, "refusing banned peer");
                continue;
            }
            if self.session_count() >= self.limits.max_connections {
                tracing::warn!(pool = %self.pool_id, %peer, "connection limit reached");
                continue;
            }
            {
                let mut per_ip = self.per_ip.lock();
                let count = per_ip.entry(peer.ip()).or_insert(0);
                if *count >= self.limits.max_connections_per_ip {
                    tracing::warn!(pool = %self.pool_id, %peer, "per-ip connection limit reached");
                    continue;
                }
                *count += 1;
            }

            let server = self.clone();
            let acceptor = acceptor.clone();
            let endpoint = endpoint.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let _ = stream.set_nodelay(true);
                match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            server.run_session(tls_stream, peer, &endpoint, cancel).await;
                        }
                        Err(e) => {
                            tracing::debug!(%peer, "tls handshake failed: {e}");
                        }
                    },
                    None => {
                        server.run_session(stream, peer, &endpoint, cancel).await;
                    }
                }
                server.release_ip(peer.ip());
            });
        }
    }

    async fn run_session<S>(
        &self,
        stream: S,
        peer: SocketAddr,
        endpoint: &StratumEndpointConfig,
        cancel: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let now = self.clock.now();
        let vardiff = VardiffState::new(endpoint.var_diff.clone(), now, endpoint.difficulty);
        let (session, mut outbound_rx) = Session::new(
            peer,
            endpoint.port,
            self.next_extranonce(),
            endpoint.difficulty,
            vardiff,
            now,
        );

        self.sessions.lock().insert(session.id.clone(), session.clone());
        metrics::inc_connections();
        tracing::debug!(pool = %self.pool_id, session = %session.id, %peer, "session connected");

        self.handler.on_connect(&session).await;

        let (read_half, mut write_half) = tokio::io::split(stream);
        let writer_close = session.close_token();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = outbound_rx.recv() => match message {
                        Some(line) => {
                            if write_half.write_all(line.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = writer_close.cancelled() => {
                        // Flush what is already queued, then stop.
                        while let Ok(line) = outbound_rx.try_recv() {
                            if write_half.write_all(line.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                        break;
                    }
                }
            }
            let _ = write_half.shutdown().await;
        });

        let mut lines = BufReader::new(read_half).lines();
        let session_close = session.close_token();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = session_close.cancelled() => break,
                next = tokio::time::timeout(self.idle_timeout, lines.next_line()) => next,
            };

            let line = match next {
                Err(_) => {
                    tracing::debug!(session = %session.id, "idle timeout");
                    break;
                }
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    if !is_routine_disconnect(&e) {
                        tracing::error!(session = %session.id, "read error: {e}");
                    }
                    break;
                }
                Ok(Ok(Some(line))) => line,
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            session.touch(self.clock.now());

            match serde_json::from_str::<StratumRequest>(trimmed) {
                Ok(request) => {
                    self.handler.on_request(&session, request).await;
                }
                Err(_) => {
                    session.respond(StratumResponse::failure(
                        Value::Null,
                        StratumError::parse_error(),
                    ));
                    if self.banning.ban_on_junk_receive {
                        tracing::info!(session = %session.id, %peer, "junk received");
                        self.bans.ban(peer.ip(), self.banning.junk_ban_duration());
                    }
                    break;
                }
            }
        }

        session.close();
        self.sessions.lock().remove(&session.id);
        metrics::dec_connections();
        self.handler.on_disconnect(&session).await;
        let _ = writer.await;
        tracing::debug!(pool = %self.pool_id, session = %session.id, "session closed");
    }
}

fn bind_listener(address: &str, port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", address, port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", address, port))?;

    let domain = if addr.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
        .context("creating listener socket")?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&socket2::SockAddr::from(addr))?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into()).context("registering listener with the runtime")
}
