use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::{PeerId, Recipient, TaskId};

/// Single tagged event type for everything the manager announces. Observers
/// (dashboard, tests) subscribe through [`EventBus::subscribe`]; nothing may
/// mutate core state through this channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "tag", content = "payload", rename_all = "camelCase")]
pub enum ManagerEvent {
    Cycle { cycle: u64 },
    WorkerOnboarded { peer_id: PeerId },
    WorkerConnected { peer_id: PeerId },
    WorkerDisconnected { peer_id: PeerId },
    TaskCreated { task_id: TaskId },
    TaskOffered { task_id: TaskId, peer_id: PeerId },
    TaskAccepted { task_id: TaskId, peer_id: PeerId },
    TaskRejected { task_id: TaskId, peer_id: PeerId },
    TaskCompleted { task_id: TaskId, peer_id: PeerId },
    TaskExpired { task_id: TaskId },
    PaymentCreated { recipient: Recipient, nonce: u64, amount: u64 },
    PaymentSettled { recipient: Recipient, min_nonce: u64, max_nonce: u64 },
    ManagerStop,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ManagerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fire-and-forget: an event with no live subscriber is dropped.
    pub fn emit(&self, event: ManagerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
