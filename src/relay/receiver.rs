//! Share relay receiver.
//!
//! One subscription task per configured remote endpoint. Received shares
//! are filtered on the subscribed topics, restamped with the remote
//! cluster's name and the local clock, and re-injected into the bus as
//! if locally produced. A subscription that stays silent for
//! [`SILENCE_TIMEOUT`] tears down and reconnects.

use std::collections::HashSet;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::bus::{MessageBus, PoolEvent};
use crate::clock::SharedClock;
use crate::config::RelaySubscriptionConfig;
use crate::metrics;
use crate::relay::wire;

pub const SILENCE_TIMEOUT: Duration = Duration::from_secs(60);

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct ShareReceiver {
    cancel: CancellationToken,
}

impl ShareReceiver {
    pub fn start(
        subscriptions: Vec<RelaySubscriptionConfig>,
        bus: MessageBus,
        clock: SharedClock,
    ) -> Self {
        let cancel = CancellationToken::new();
        for subscription in subscriptions {
            tokio::spawn(run_subscription(
                subscription,
                bus.clone(),
                clock.clone(),
                cancel.clone(),
            ));
        }
        Self { cancel }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ShareReceiver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_subscription(
    subscription: RelaySubscriptionConfig,
    bus: MessageBus,
    clock: SharedClock,
    cancel: CancellationToken,
) {
    let topics: HashSet<&str> = subscription.topics.iter().map(String::as_str).collect();

    loop {
        if cancel.is_cancelled() {
            return;
        }
        match TcpStream::connect(&subscription.url).await {
            Ok(mut stream) => {
                tracing::info!(
                    url = %subscription.url,
                    cluster = %subscription.name,
                    "relay subscription connected"
                );
                loop {
                    let message = tokio::select! {
                        _ = cancel.cancelled() => return,
                        message = tokio::time::timeout(
                            SILENCE_TIMEOUT,
                            wire::read_message(&mut stream),
                        ) => message,
                    };
                    let message = match message {
                        Err(_) => {
                            tracing::info!(
                                url = %subscription.url,
                                "relay silent for {}s, reconnecting",
                                SILENCE_TIMEOUT.as_secs()
                            );
                            break;
                        }
                        Ok(Err(e)) => {
                            tracing::debug!(url = %subscription.url, "relay read failed: {e}");
                            break;
                        }
                        Ok(Ok(message)) => message,
                    };

                    if !topics.contains(message.topic.as_str()) {
                        tracing::warn!(
                            topic = %message.topic,
                            url = %subscription.url,
                            "dropping share for unsubscribed topic"
                        );
                        continue;
                    }

                    match wire::decode_share(&message) {
                        Ok(mut share) => {
                            share.source = subscription.name.clone();
                            share.created = clock.wall();
                            metrics::inc_relay_received();
                            bus.publish(PoolEvent::ShareAccepted { share });
                        }
                        Err(e) => {
                            tracing::warn!(url = %subscription.url, "undecodable share: {e}");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::debug!(url = %subscription.url, "relay connect failed: {e}");
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}
