use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::Mutex;

use crate::config::ManagerConfig;
use crate::control::ControlHandle;
use crate::engine::TaskEngine;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::ledger::inbox::AccrualQueue;
use crate::ledger::PaymentLedger;
use crate::registry::WorkerRegistry;
use crate::store::Store;
use crate::transport::PeerConnections;

pub type PeerId = String;
pub type TaskId = String;
pub type TemplateId = String;

/// Milliseconds since the Unix epoch, the timestamp unit for every record and
/// event.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A 32-byte settlement address. Distinct from a worker's peer identity:
/// payments are owed to the recipient, not the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Recipient(pub [u8; 32]);

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Recipient {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| Error::InvalidArgument(format!("recipient is not valid hex: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidArgument("recipient must be 32 bytes".to_string()))?;
        Ok(Recipient(bytes))
    }
}

impl Serialize for Recipient {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Recipient {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Recipient::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Unknown,
    Registered,
    Connected,
    Busy,
    Disconnected,
}

// Datastructure for worker persistence, keyed `worker/<peerId>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRecord {
    pub peer_id: PeerId,
    pub recipient: Recipient,
    pub state: WorkerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<i64>,
    /// Highest onboarding nonce accepted for this peer, kept to refuse replays.
    pub last_nonce: u64,
    #[serde(default)]
    pub proof_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Offered,
    Accepted,
    Completed,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskEventKind {
    Created,
    Offered,
    Accepted,
    Rejected,
    Submission,
    Completed,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub kind: TaskEventKind,
    pub timestamp: i64,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// A task as submitted by a provider, before the manager stamps it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub id: TaskId,
    pub template_id: TemplateId,
    pub title: String,
    pub reward: i64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

// Keyed `task/<taskId>`; the event log is append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: TaskId,
    pub template_id: TemplateId,
    pub title: String,
    pub reward: u64,
    pub provider_peer_id: PeerId,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: i64,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker_peer_id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offered_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<i64>,
    pub events: Vec<TaskEvent>,
    /// Outbox flag: set when the task completes, cleared once the payment
    /// accrual is durably recorded. Replayed on restart.
    #[serde(default)]
    pub accrual_pending: bool,
}

impl TaskRecord {
    pub fn push_event(
        &mut self,
        kind: TaskEventKind,
        actor: &str,
        payload: Option<serde_json::Value>,
    ) {
        // The log must stay monotonically timestamped even if the clock reads
        // the same millisecond twice.
        let mut timestamp = now_ms();
        if let Some(last) = self.events.last() {
            if timestamp < last.timestamp {
                timestamp = last.timestamp;
            }
        }
        self.events.push(TaskEvent {
            kind,
            timestamp,
            actor: actor.to_string(),
            payload,
        });
    }

    /// The parsed result of the most recent submission event, if any.
    pub fn latest_result(&self) -> Option<serde_json::Value> {
        self.events
            .iter()
            .rev()
            .find(|e| e.kind == TaskEventKind::Submission)
            .and_then(|e| e.payload.as_ref())
            .and_then(|p| p.get("result").cloned())
    }
}

// Keyed `template/<templateId>`, immutable after registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRecord {
    pub template_id: TemplateId,
    pub name: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
}

// Keyed `payment/<recipient>/<nonce>`; nonces are gapless per recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub nonce: u64,
    pub recipient: Recipient,
    pub amount: u64,
    pub created_at: i64,
    #[serde(default)]
    pub settled: bool,
}

/// A contiguous nonce range of one recipient's records. Derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentBatch {
    pub recipient: Recipient,
    pub min_nonce: u64,
    pub max_nonce: u64,
    pub amount: u64,
}

/// The read-model row served for `GET /tasks/{templateId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub task_id: TaskId,
    pub template_id: TemplateId,
    pub title: String,
    pub result: Option<serde_json::Value>,
}

/// The manager node. Subsystems serialize their own mutations behind their
/// own lock; cross-subsystem flow goes through channels, never through a
/// reference into another subsystem's state.
pub struct Manager {
    pub peer_id: PeerId,
    pub config: ManagerConfig,
    /// Compressed EdDSA public key, hex. None when payments are disabled.
    pub public_key: Option<String>,
    pub store: Store,
    pub registry: Arc<Mutex<WorkerRegistry>>,
    pub engine: Arc<Mutex<TaskEngine>>,
    pub ledger: Arc<Mutex<PaymentLedger>>,
    pub accruals: Arc<AccrualQueue>,
    pub peers: Arc<PeerConnections>,
    pub events: EventBus,
    pub control: ControlHandle,
    pub started_at: i64,
}
