use std::collections::VecDeque;

use tracing::info;

use crate::error::{Error, Result};
use crate::events::{EventBus, ManagerEvent};
use crate::store::Store;
use crate::types::{now_ms, PeerId, Recipient, TaskId, WorkerRecord, WorkerState};

/// Worker admission, connection state and the dispatch queue. The registry
/// exclusively owns worker connection state; it never touches tasks, since a
/// disconnected worker's task is reclaimed by the engine's sweep.
pub struct WorkerRegistry {
    store: Store,
    events: EventBus,
    require_access_codes: bool,
    /// Round-robin dispatch order. Holds connected and busy peers; busy ones
    /// are skipped but keep their slot.
    queue: VecDeque<PeerId>,
}

impl WorkerRegistry {
    pub fn new(store: Store, events: EventBus, require_access_codes: bool) -> Self {
        Self {
            store,
            events,
            require_access_codes,
            queue: VecDeque::new(),
        }
    }

    /// Clears stale connection state left over from a previous run. Workers
    /// re-enter the queue when their transport session re-opens.
    pub fn reset_connections(&mut self) -> Result<()> {
        for mut worker in self.store.workers()? {
            if matches!(worker.state, WorkerState::Connected | WorkerState::Busy) {
                worker.state = WorkerState::Disconnected;
                worker.current_task_id = None;
                worker.connected_at = None;
                self.store.put_worker(&worker)?;
            }
        }
        self.queue.clear();
        Ok(())
    }

    /// Admits a worker into the marketplace. Re-onboarding with the same
    /// `(peer, nonce)` pair is idempotent; a fresh nonce is required for
    /// anything that changes state, so captured onboarding messages cannot be
    /// replayed.
    pub fn onboard(
        &mut self,
        peer_id: &PeerId,
        recipient: Recipient,
        nonce: u64,
        access_code: Option<&str>,
    ) -> Result<()> {
        if let Some(mut existing) = self.store.worker(peer_id)? {
            if nonce < existing.last_nonce {
                return Err(Error::replayed_nonce(peer_id));
            }
            if nonce == existing.last_nonce {
                // Idempotent retry of the accepted onboarding message.
                return Ok(());
            }
            if matches!(existing.state, WorkerState::Connected | WorkerState::Busy) {
                return Err(Error::already_onboarded(peer_id));
            }

            existing.recipient = recipient;
            existing.last_nonce = nonce;
            existing.state = WorkerState::Connected;
            existing.connected_at = Some(now_ms());
            self.store.put_worker(&existing)?;
            self.enqueue(peer_id);
            self.events.emit(ManagerEvent::WorkerOnboarded {
                peer_id: peer_id.clone(),
            });
            return Ok(());
        }

        if self.require_access_codes {
            let code = access_code.ok_or(Error::access_codes_required())?;
            if !self.store.consume_access_code(code)? {
                return Err(Error::bad_access_code());
            }
        }

        let worker = WorkerRecord {
            peer_id: peer_id.clone(),
            recipient,
            state: WorkerState::Connected,
            current_task_id: None,
            connected_at: Some(now_ms()),
            last_nonce: nonce,
            proof_failures: 0,
        };
        self.store.put_worker(&worker)?;
        self.enqueue(peer_id);

        info!("Worker onboarded: {}", peer_id);
        self.events.emit(ManagerEvent::WorkerOnboarded {
            peer_id: peer_id.clone(),
        });
        Ok(())
    }

    pub fn get_worker(&self, peer_id: &str) -> Result<Option<WorkerRecord>> {
        self.store.worker(peer_id)
    }

    /// Transport session opened for an already-onboarded worker. Unknown
    /// peers are ignored; they have to onboard first.
    pub fn connect(&mut self, peer_id: &PeerId) -> Result<()> {
        let Some(mut worker) = self.store.worker(peer_id)? else {
            return Ok(());
        };
        if worker.state != WorkerState::Busy {
            worker.state = WorkerState::Connected;
        }
        worker.connected_at = Some(now_ms());
        self.store.put_worker(&worker)?;
        self.enqueue(peer_id);
        self.events.emit(ManagerEvent::WorkerConnected {
            peer_id: peer_id.clone(),
        });
        Ok(())
    }

    /// Transport drop. The durable record survives so re-onboarding stays
    /// idempotent; only queue membership and connection state change.
    pub fn disconnect(&mut self, peer_id: &PeerId) -> Result<()> {
        self.queue.retain(|p| p != peer_id);
        if let Some(mut worker) = self.store.worker(peer_id)? {
            worker.state = WorkerState::Disconnected;
            worker.connected_at = None;
            self.store.put_worker(&worker)?;
        }
        self.events.emit(ManagerEvent::WorkerDisconnected {
            peer_id: peer_id.clone(),
        });
        Ok(())
    }

    /// Returns the next `Connected` (not busy) worker and rotates it to the
    /// tail, so repeated calls walk the queue fairly and deterministically.
    pub fn next_eligible(&mut self) -> Result<Option<PeerId>> {
        for _ in 0..self.queue.len() {
            let Some(peer_id) = self.queue.pop_front() else {
                break;
            };
            match self.store.worker(&peer_id)?.map(|w| w.state) {
                Some(WorkerState::Connected) => {
                    self.queue.push_back(peer_id.clone());
                    return Ok(Some(peer_id));
                }
                Some(WorkerState::Busy) => {
                    // Keeps its slot, skipped this round.
                    self.queue.push_back(peer_id);
                }
                // Stale entry, drop it.
                _ => {}
            }
        }
        Ok(None)
    }

    pub fn mark_busy(&mut self, peer_id: &PeerId, task_id: &TaskId) -> Result<()> {
        let mut worker = self
            .store
            .worker(peer_id)?
            .ok_or_else(|| Error::NotFound(format!("worker {peer_id} is not onboarded")))?;
        worker.state = WorkerState::Busy;
        worker.current_task_id = Some(task_id.clone());
        self.store.put_worker(&worker)
    }

    /// Returns a busy worker to the eligible pool. With `to_tail` the worker
    /// additionally loses its queue position (used after an expired offer).
    pub fn mark_idle(&mut self, peer_id: &PeerId, to_tail: bool) -> Result<()> {
        if let Some(mut worker) = self.store.worker(peer_id)? {
            if worker.state == WorkerState::Busy {
                worker.state = WorkerState::Connected;
            }
            worker.current_task_id = None;
            self.store.put_worker(&worker)?;
        }
        if to_tail {
            if let Some(pos) = self.queue.iter().position(|p| p == peer_id) {
                self.queue.remove(pos);
                self.queue.push_back(peer_id.clone());
            }
        }
        Ok(())
    }

    /// Bumps the failed-proof counter; the router disconnects the worker once
    /// the threshold is crossed.
    pub fn record_proof_failure(&mut self, peer_id: &PeerId) -> Result<u32> {
        let mut worker = self
            .store
            .worker(peer_id)?
            .ok_or_else(|| Error::NotFound(format!("worker {peer_id} is not onboarded")))?;
        worker.proof_failures += 1;
        let count = worker.proof_failures;
        self.store.put_worker(&worker)?;
        Ok(count)
    }

    pub fn connected_peers(&self) -> Result<Vec<PeerId>> {
        Ok(self
            .store
            .workers()?
            .into_iter()
            .filter(|w| matches!(w.state, WorkerState::Connected | WorkerState::Busy))
            .map(|w| w.peer_id)
            .collect())
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn enqueue(&mut self, peer_id: &PeerId) {
        if !self.queue.contains(peer_id) {
            self.queue.push_back(peer_id.clone());
        }
    }
}
