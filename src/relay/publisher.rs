//! Share relay publisher.
//!
//! Remote clusters connect to the publish endpoint and receive every
//! locally produced share as a three-frame message. Fan-out goes through
//! a broadcast channel per subscriber connection; a subscriber that
//! cannot keep up is dropped, never buffered without bound.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::bus::{MessageBus, PoolEvent};
use crate::config::ShareRelayConfig;
use crate::metrics;
use crate::relay::wire::{self, RelayMessage};

pub struct RelayPublisher {
    local: SocketAddr,
    cancel: CancellationToken,
}

impl RelayPublisher {
    /// Bind the publish endpoint and start relaying bus shares.
    ///
    /// Only shares originating from this cluster are relayed; shares
    /// re-injected by the receiver keep their remote source and are
    /// skipped.
    pub async fn start(
        cfg: &ShareRelayConfig,
        cluster_name: &str,
        bus: &MessageBus,
        format: u32,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&cfg.publish_url)
            .await
            .with_context(|| format!("binding relay publish endpoint {}", cfg.publish_url))?;
        let local = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let (fanout_tx, _) = broadcast::channel::<RelayMessage>(512);

        tracing::info!(addr = %local, "share relay publishing");

        // Accept loop: one writer task per subscriber.
        {
            let fanout_tx = fanout_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let accepted = tokio::select! {
                        _ = cancel.cancelled() => return,
                        accepted = listener.accept() => accepted,
                    };
                    let (mut stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!("relay accept failed: {e}");
                            continue;
                        }
                    };
                    tracing::info!(%peer, "relay subscriber connected");

                    let mut fanout_rx = fanout_tx.subscribe();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        loop {
                            let message = tokio::select! {
                                _ = cancel.cancelled() => break,
                                message = fanout_rx.recv() => message,
                            };
                            match message {
                                Ok(message) => {
                                    if wire::write_message(&mut stream, &message).await.is_err() {
                                        break;
                                    }
                                }
                                Err(broadcast::error::RecvError::Lagged(n)) => {
                                    tracing::warn!(%peer, missed = n, "slow relay subscriber dropped");
                                    break;
                                }
                                Err(broadcast::error::RecvError::Closed) => break,
                            }
                        }
                        tracing::info!(%peer, "relay subscriber disconnected");
                    });
                }
            });
        }

        // Bus pump: serialize accepted shares onto the fan-out channel.
        {
            let mut bus_rx = bus.subscribe();
            let cluster_name = cluster_name.to_string();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => return,
                        event = bus_rx.recv() => event,
                    };
                    match event {
                        Ok(PoolEvent::ShareAccepted { share }) => {
                            if share.source != cluster_name {
                                continue;
                            }
                            match wire::encode_share(&share, format) {
                                Ok(message) => {
                                    metrics::inc_relay_published();
                                    let _ = fanout_tx.send(message);
                                }
                                Err(e) => tracing::error!("share encoding failed: {e}"),
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(missed = n, "relay pump lagged behind the bus");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            });
        }

        Ok(Self { local, cancel })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RelayPublisher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
