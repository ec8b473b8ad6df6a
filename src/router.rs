use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PROOF_FAILURE_THRESHOLD;
use crate::engine::NewTemplate;
use crate::error::{Error, Result};
use crate::ledger::{BulkAuthorization, PaymentClaim, ProofBundle, SignedAuthorization};
use crate::types::{now_ms, Manager, NewTask, PeerId, TaskId, TaskRecord, TemplateId, TemplateRecord};

pub const PROTOCOL_VERSION: u32 = 1;

/// Every message that crosses the wire, in both directions. The transport
/// frames these as `{ messageType, payload }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", content = "payload", rename_all = "camelCase")]
pub enum Envelope {
    /// First frame of a WebSocket session, binding it to a peer id.
    Hello { peer_id: PeerId },

    IdentifyRequest,
    #[serde(rename_all = "camelCase")]
    IdentifyResponse {
        peer_id: PeerId,
        version: String,
        protocol_version: u32,
        require_access_codes: bool,
        registered: bool,
        public_key: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    RequestToWork {
        recipient: crate::types::Recipient,
        nonce: u64,
        access_code: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    RequestToWorkResponse { accepted: bool },

    Task(NewTask),
    #[serde(rename_all = "camelCase")]
    TaskAck { task_id: TaskId },

    /// Manager to worker: a pending task bound to this worker with an
    /// acceptance deadline.
    Offer(TaskRecord),

    #[serde(rename_all = "camelCase")]
    TaskAccepted { task_id: TaskId },
    #[serde(rename_all = "camelCase")]
    TaskRejected {
        task_id: TaskId,
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TaskCompleted { task_id: TaskId, result: String },
    Ack,

    #[serde(rename_all = "camelCase")]
    ProofRequest { payments: Vec<PaymentClaim> },
    ProofResponse(SignedAuthorization),

    #[serde(rename_all = "camelCase")]
    BulkProofRequest {
        recipient: crate::types::Recipient,
        proofs: Vec<ProofBundle>,
    },
    BulkProofResponse(BulkAuthorization),

    PayoutRequest,
    PayoutResponse(SignedAuthorization),

    #[serde(rename_all = "camelCase")]
    TemplateRequest { template_id: TemplateId },
    TemplateResponse(TemplateRecord),

    #[serde(rename_all = "camelCase")]
    Error { kind: String, error: String },
}

impl Envelope {
    pub fn from_error(error: &Error) -> Self {
        Envelope::Error {
            kind: error.kind().to_string(),
            error: error.to_string(),
        }
    }
}

/// Dispatches one inbound message into the owning subsystem and returns the
/// reply, if the message warrants one. `sender` is the transport-verified
/// peer id; any payload that references a different peer is refused before a
/// subsystem sees it.
pub async fn handle_message(
    manager: &Arc<Manager>,
    sender: &PeerId,
    envelope: Envelope,
) -> Result<Option<Envelope>> {
    match envelope {
        // The transport consumes hellos; one arriving here is a no-op.
        Envelope::Hello { .. } => Ok(None),

        Envelope::IdentifyRequest => {
            let registered = manager
                .registry
                .lock()
                .await
                .get_worker(sender)?
                .is_some();
            Ok(Some(Envelope::IdentifyResponse {
                peer_id: manager.peer_id.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                protocol_version: PROTOCOL_VERSION,
                require_access_codes: manager.config.require_access_codes,
                registered,
                public_key: manager.public_key.clone(),
            }))
        }

        Envelope::RequestToWork {
            recipient,
            nonce,
            access_code,
        } => {
            manager.registry.lock().await.onboard(
                sender,
                recipient,
                nonce,
                access_code.as_deref(),
            )?;
            // A fresh worker may unblock pending tasks right away.
            manager.control.nudge();
            Ok(Some(Envelope::RequestToWorkResponse { accepted: true }))
        }

        Envelope::Task(new_task) => {
            let task_id = new_task.id.clone();
            manager.engine.lock().await.create_task(new_task, sender)?;
            manager.control.nudge();
            Ok(Some(Envelope::TaskAck { task_id }))
        }

        Envelope::TaskAccepted { task_id } => {
            manager
                .engine
                .lock()
                .await
                .process_task_acception(&task_id, sender, now_ms())?;
            Ok(Some(Envelope::Ack))
        }

        Envelope::TaskRejected { task_id, reason } => {
            let cycle = manager.control.get_cycle();
            manager.engine.lock().await.process_task_rejection(
                &task_id,
                sender,
                reason.as_deref().unwrap_or(""),
                cycle,
            )?;
            manager.registry.lock().await.mark_idle(sender, false)?;
            manager.control.nudge();
            Ok(Some(Envelope::Ack))
        }

        Envelope::TaskCompleted { task_id, result } => {
            let task = manager
                .engine
                .lock()
                .await
                .process_task_submission(&task_id, sender, &result)?;

            let recipient = {
                let mut registry = manager.registry.lock().await;
                registry.mark_idle(sender, false)?;
                registry
                    .get_worker(sender)?
                    .map(|w| w.recipient)
            };
            // Completed transition is durable; the accrual flows through the
            // ledger's inbox from here.
            if let Some(recipient) = recipient {
                manager
                    .accruals
                    .enqueue(crate::ledger::inbox::AccrualRequest {
                        task_id,
                        recipient,
                        amount: task.reward,
                    })
                    .await;
            }
            manager.control.nudge();
            Ok(Some(Envelope::Ack))
        }

        Envelope::ProofRequest { payments } => {
            let recipient = sender_recipient(manager, sender).await?;
            let outcome = manager
                .ledger
                .lock()
                .await
                .process_proof_request(recipient, &payments);
            let authorization = note_proof_outcome(manager, sender, outcome).await?;
            Ok(Some(Envelope::ProofResponse(authorization)))
        }

        Envelope::BulkProofRequest { recipient, proofs } => {
            let registered = sender_recipient(manager, sender).await?;
            if registered != recipient {
                return Err(Error::Forbidden(
                    "bulk proof request for a foreign recipient".to_string(),
                ));
            }

            // Groth16 verification is CPU-bound; it runs on the blocking pool
            // without holding the ledger lock.
            let verifier = manager.ledger.lock().await.verifier().ok_or_else(|| {
                Error::ProofInvalid("no verification key configured".to_string())
            })?;
            let to_verify = proofs.clone();
            let verified = tokio::task::spawn_blocking(move || -> Result<bool> {
                for bundle in &to_verify {
                    let batch = crate::types::PaymentBatch {
                        recipient: bundle.recipient,
                        min_nonce: bundle.min_nonce,
                        max_nonce: bundle.max_nonce,
                        amount: bundle.amount,
                    };
                    if !verifier.verify_batch(&bundle.proof, &batch)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            })
            .await
            .map_err(|e| Error::Custom(format!("verification task failed: {e}")))?;

            let outcome = match verified {
                Ok(true) => manager
                    .ledger
                    .lock()
                    .await
                    .settle_proofs(recipient, &proofs),
                Ok(false) => Err(Error::ProofInvalid(
                    "proof verification failed".to_string(),
                )),
                Err(e) => Err(e),
            };
            let authorization = note_proof_outcome(manager, sender, outcome).await?;
            Ok(Some(Envelope::BulkProofResponse(authorization)))
        }

        Envelope::PayoutRequest => {
            let recipient = sender_recipient(manager, sender).await?;
            let authorization = manager
                .ledger
                .lock()
                .await
                .process_payout_request(recipient)?;
            Ok(Some(Envelope::PayoutResponse(authorization)))
        }

        Envelope::TemplateRequest { template_id } => {
            let template = manager
                .store
                .template(&template_id)?
                .ok_or_else(|| Error::unknown_template(&template_id))?;
            Ok(Some(Envelope::TemplateResponse(template)))
        }

        // Replies arriving inbound are protocol misuse.
        other => Err(Error::InvalidArgument(format!(
            "unexpected message: {}",
            message_name(&other)
        ))),
    }
}

/// Registers a template on behalf of a provider; shared by the wire path and
/// the admin surface.
pub async fn register_template(
    manager: &Arc<Manager>,
    template: NewTemplate,
    provider_peer_id: &PeerId,
) -> Result<TemplateId> {
    manager
        .engine
        .lock()
        .await
        .register_template(template, provider_peer_id)
}

/// The settlement address a peer onboarded with. Peers that never onboarded
/// have no business in the payment flow.
async fn sender_recipient(
    manager: &Arc<Manager>,
    sender: &PeerId,
) -> Result<crate::types::Recipient> {
    manager
        .registry
        .lock()
        .await
        .get_worker(sender)?
        .map(|w| w.recipient)
        .ok_or_else(|| Error::Forbidden(format!("peer {sender} is not an onboarded worker")))
}

/// Books a failed proof against the worker and disconnects it once the
/// threshold is crossed. Successful outcomes pass straight through.
async fn note_proof_outcome<T>(
    manager: &Arc<Manager>,
    sender: &PeerId,
    outcome: Result<T>,
) -> Result<T> {
    match outcome {
        Err(e @ Error::ProofInvalid(_)) => {
            let failures = {
                let mut registry = manager.registry.lock().await;
                let failures = registry.record_proof_failure(sender)?;
                if failures >= PROOF_FAILURE_THRESHOLD {
                    registry.disconnect(sender)?;
                }
                failures
            };
            if failures >= PROOF_FAILURE_THRESHOLD {
                warn!(
                    "Worker {} exceeded the proof failure threshold, disconnecting",
                    sender
                );
                manager.peers.close(sender);
            } else {
                info!("Worker {} submitted an invalid proof ({} so far)", sender, failures);
            }
            Err(e)
        }
        other => other,
    }
}

fn message_name(envelope: &Envelope) -> &'static str {
    match envelope {
        Envelope::Hello { .. } => "hello",
        Envelope::IdentifyRequest => "identifyRequest",
        Envelope::IdentifyResponse { .. } => "identifyResponse",
        Envelope::RequestToWork { .. } => "requestToWork",
        Envelope::RequestToWorkResponse { .. } => "requestToWorkResponse",
        Envelope::Task(_) => "task",
        Envelope::TaskAck { .. } => "taskAck",
        Envelope::Offer(_) => "offer",
        Envelope::TaskAccepted { .. } => "taskAccepted",
        Envelope::TaskRejected { .. } => "taskRejected",
        Envelope::TaskCompleted { .. } => "taskCompleted",
        Envelope::Ack => "ack",
        Envelope::ProofRequest { .. } => "proofRequest",
        Envelope::ProofResponse(_) => "proofResponse",
        Envelope::BulkProofRequest { .. } => "bulkProofRequest",
        Envelope::BulkProofResponse(_) => "bulkProofResponse",
        Envelope::PayoutRequest => "payoutRequest",
        Envelope::PayoutResponse(_) => "payoutResponse",
        Envelope::TemplateRequest { .. } => "templateRequest",
        Envelope::TemplateResponse(_) => "templateResponse",
        Envelope::Error { .. } => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_format_is_tagged() {
        let env = Envelope::TaskAccepted {
            task_id: "t1".to_string(),
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["messageType"], "taskAccepted");
        assert_eq!(json["payload"]["taskId"], "t1");
    }

    #[test]
    fn unit_messages_round_trip() {
        let json = serde_json::json!({ "messageType": "identifyRequest" });
        let env: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(env, Envelope::IdentifyRequest);
    }

    #[test]
    fn error_envelope_carries_kind() {
        let env = Envelope::from_error(&Error::Forbidden("nope".to_string()));
        match env {
            Envelope::Error { kind, error } => {
                assert_eq!(kind, "Forbidden");
                assert!(error.contains("nope"));
            }
            _ => panic!("expected error envelope"),
        }
    }
}
