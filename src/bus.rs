//! In-process message bus.
//!
//! Typed publish/subscribe over a tokio broadcast channel. Validated shares,
//! block outcomes and admin notifications all flow through here; persistence
//! and the share relay are ordinary subscribers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::shares::Share;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PoolEvent {
    /// A share passed validation and was credited.
    ShareAccepted { share: Share },
    /// A block candidate was accepted by the daemon.
    BlockFound {
        pool_id: String,
        height: u64,
        hash: String,
        worker: String,
    },
    /// A block candidate was rejected by the daemon; the share stays valid.
    BlockSubmitFailed {
        pool_id: String,
        height: u64,
        worker: String,
        reason: String,
    },
    /// Operator-facing notification (daemon trouble, bans, startup issues).
    AdminNotification { title: String, message: String },
}

/// Cloneable handle to the process-wide event channel.
#[derive(Clone)]
pub struct MessageBus {
    tx: broadcast::Sender<PoolEvent>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Events with no live subscriber are dropped.
    pub fn publish(&self, event: PoolEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }

    pub fn notify_admin(&self, title: impl Into<String>, message: impl Into<String>) {
        self.publish(PoolEvent::AdminNotification {
            title: title.into(),
            message: message.into(),
        });
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
