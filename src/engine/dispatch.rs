use std::collections::HashSet;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::events::ManagerEvent;
use crate::registry::WorkerRegistry;
use crate::types::{PeerId, TaskEventKind, TaskId, TaskRecord, TaskState, WorkerState};

use super::TaskEngine;

/// An offer the control glue still has to send. The state transition is
/// already durable when this leaves the engine; a failed transport send rolls
/// it back through [`TaskEngine::rollback_offer`].
#[derive(Debug, Clone)]
pub struct OutboundOffer {
    pub task_id: TaskId,
    pub peer_id: PeerId,
    pub task: TaskRecord,
}

impl TaskEngine {
    /// Pairs pending tasks with eligible workers until either side runs out.
    /// The registry's rotation keeps the pairing fair and deterministic; a
    /// worker that rejected a task recently is skipped for that task.
    ///
    /// Transport sends happen after this returns, outside the critical
    /// section.
    pub fn dispatch(
        &mut self,
        registry: &mut WorkerRegistry,
        now: i64,
        cycle: u64,
    ) -> Result<Vec<OutboundOffer>> {
        let mut offers = Vec::new();
        let mut requeue: Vec<TaskId> = Vec::new();

        'tasks: while let Some(task_id) = self.pending.pop_front() {
            let Some(mut task) = self.store.task(&task_id)? else {
                continue;
            };
            if task.state != TaskState::Pending {
                // Stale queue entry, drop it.
                continue;
            }

            // Sample each eligible worker at most once for this task.
            let mut seen: HashSet<PeerId> = HashSet::new();
            let mut picked = None;
            while let Some(peer_id) = registry.next_eligible()? {
                if !seen.insert(peer_id.clone()) {
                    break;
                }
                if self.is_blacklisted(&task_id, &peer_id, cycle) {
                    continue;
                }
                picked = Some(peer_id);
                break;
            }

            let Some(worker_peer_id) = picked else {
                requeue.push(task_id);
                if seen.is_empty() {
                    // No eligible worker at all; stop dispatching entirely.
                    break 'tasks;
                }
                // Only blacklisted candidates; another task may still match.
                continue;
            };

            task.state = TaskState::Offered;
            task.assigned_worker_peer_id = Some(worker_peer_id.clone());
            task.offered_at = Some(now);
            task.deadline = Some(now + self.task_acceptance_ms);
            task.push_event(TaskEventKind::Offered, "manager", None);
            self.store.put_task(&task)?;
            registry.mark_busy(&worker_peer_id, &task_id)?;

            debug!("Offering task {} to {}", task_id, worker_peer_id);
            self.events.emit(ManagerEvent::TaskOffered {
                task_id: task_id.clone(),
                peer_id: worker_peer_id.clone(),
            });
            offers.push(OutboundOffer {
                task_id,
                peer_id: worker_peer_id,
                task,
            });
        }

        for task_id in requeue.into_iter().rev() {
            self.pending.push_front(task_id);
        }
        Ok(offers)
    }

    /// Undoes an offer whose transport send failed: the task returns to the
    /// head of the pending queue and the worker to the eligible pool.
    pub fn rollback_offer(
        &mut self,
        registry: &mut WorkerRegistry,
        task_id: &TaskId,
    ) -> Result<()> {
        let mut task = self
            .store
            .task(task_id)?
            .ok_or_else(|| Error::NotFound(format!("task {task_id} does not exist")))?;
        if task.state != TaskState::Offered {
            return Ok(());
        }

        let worker = task.assigned_worker_peer_id.take();
        task.state = TaskState::Pending;
        task.offered_at = None;
        task.deadline = None;
        self.store.put_task(&task)?;
        self.pending.push_front(task_id.clone());

        if let Some(worker_peer_id) = worker {
            warn!(
                "Offer for task {} to {} could not be delivered, rolled back",
                task_id, worker_peer_id
            );
            registry.mark_idle(&worker_peer_id, false)?;
        }
        Ok(())
    }

    /// The per-cycle recovery pass: offers past their deadline and any task
    /// whose assigned worker is no longer connected go back to `Pending`. The
    /// worker is not penalized beyond losing its queue position.
    pub fn sweep(&mut self, registry: &mut WorkerRegistry, now: i64) -> Result<Vec<TaskId>> {
        let mut reclaimed = Vec::new();
        for mut task in self.store.tasks()? {
            if !matches!(task.state, TaskState::Offered | TaskState::Accepted) {
                continue;
            }
            let Some(worker_peer_id) = task.assigned_worker_peer_id.clone() else {
                continue;
            };

            let timed_out = task.state == TaskState::Offered
                && task.deadline.map(|d| now > d).unwrap_or(false);
            let worker_connected = registry
                .get_worker(&worker_peer_id)?
                .map(|w| matches!(w.state, WorkerState::Connected | WorkerState::Busy))
                .unwrap_or(false);
            if !timed_out && worker_connected {
                continue;
            }

            task.push_event(TaskEventKind::Expired, "manager", None);
            task.state = TaskState::Pending;
            task.assigned_worker_peer_id = None;
            task.offered_at = None;
            task.deadline = None;
            self.store.put_task(&task)?;

            registry.mark_idle(&worker_peer_id, true)?;
            self.pending.push_back(task.id.clone());
            self.events.emit(ManagerEvent::TaskExpired {
                task_id: task.id.clone(),
            });
            reclaimed.push(task.id);
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{engine_with_template, new_task, registry_with_workers};
    use crate::store::tests::temp_store;
    use crate::types::{now_ms, TaskEventKind, TaskState, WorkerState};

    #[test]
    fn dispatch_stops_when_no_worker_is_eligible() {
        let store = temp_store();
        let mut engine = engine_with_template(&store);
        let mut registry = registry_with_workers(&store, &[]);
        engine
            .create_task(new_task("t1"), &"provider-1".to_string())
            .unwrap();

        assert!(engine.dispatch(&mut registry, now_ms(), 0).unwrap().is_empty());
        assert_eq!(engine.pending_len(), 1);
    }

    #[test]
    fn dispatch_is_fair_across_workers() {
        let store = temp_store();
        let mut engine = engine_with_template(&store);
        let mut registry = registry_with_workers(&store, &["w1", "w2", "w3"]);
        let provider = "provider-1".to_string();

        for i in 0..6 {
            engine.create_task(new_task(&format!("t{i}")), &provider).unwrap();
        }

        let mut offers_per_worker = std::collections::HashMap::new();
        // Workers accept and complete between dispatch rounds, so every
        // pending task eventually lands.
        while engine.pending_len() > 0 {
            let now = now_ms();
            let offers = engine.dispatch(&mut registry, now, 0).unwrap();
            assert!(!offers.is_empty());
            for offer in offers {
                *offers_per_worker.entry(offer.peer_id.clone()).or_insert(0u32) += 1;
                engine
                    .process_task_acception(&offer.task_id, &offer.peer_id, now)
                    .unwrap();
                engine
                    .process_task_submission(&offer.task_id, &offer.peer_id, "ok")
                    .unwrap();
                registry.mark_idle(&offer.peer_id, false).unwrap();
            }
        }

        assert_eq!(offers_per_worker.len(), 3);
        assert!(offers_per_worker.values().all(|&count| count == 2));
    }

    #[test]
    fn dispatch_marks_worker_busy_and_sets_deadline() {
        let store = temp_store();
        let mut engine = engine_with_template(&store);
        let mut registry = registry_with_workers(&store, &["w1"]);
        engine
            .create_task(new_task("t1"), &"provider-1".to_string())
            .unwrap();

        let now = now_ms();
        let offers = engine.dispatch(&mut registry, now, 0).unwrap();
        assert_eq!(offers.len(), 1);

        let task = store.task("t1").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Offered);
        assert_eq!(task.offered_at, Some(now));
        assert_eq!(task.deadline, Some(now + 30_000));

        let worker = registry.get_worker("w1").unwrap().unwrap();
        assert_eq!(worker.state, WorkerState::Busy);
        assert_eq!(worker.current_task_id, Some("t1".to_string()));

        // Nothing left to dispatch, the only worker is busy.
        assert!(engine.dispatch(&mut registry, now_ms(), 0).unwrap().is_empty());
    }

    #[test]
    fn rollback_returns_task_and_worker() {
        let store = temp_store();
        let mut engine = engine_with_template(&store);
        let mut registry = registry_with_workers(&store, &["w1"]);
        engine
            .create_task(new_task("t1"), &"provider-1".to_string())
            .unwrap();
        engine.dispatch(&mut registry, now_ms(), 0).unwrap();

        engine.rollback_offer(&mut registry, &"t1".to_string()).unwrap();

        let task = store.task("t1").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.assigned_worker_peer_id, None);
        assert_eq!(engine.pending_len(), 1);
        assert_eq!(
            registry.get_worker("w1").unwrap().unwrap().state,
            WorkerState::Connected
        );
    }

    #[test]
    fn sweep_reclaims_timed_out_offers() {
        let store = temp_store();
        let mut engine = engine_with_template(&store);
        let mut registry = registry_with_workers(&store, &["w1", "w2"]);
        engine
            .create_task(new_task("t1"), &"provider-1".to_string())
            .unwrap();

        let now = now_ms();
        let offers = engine.dispatch(&mut registry, now, 0).unwrap();
        assert_eq!(offers[0].peer_id, "w1");

        // Nothing to reclaim before the deadline.
        assert!(engine.sweep(&mut registry, now + 1_000).unwrap().is_empty());

        let reclaimed = engine.sweep(&mut registry, now + 31_000).unwrap();
        assert_eq!(reclaimed, vec!["t1".to_string()]);

        let task = store.task("t1").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.events.last().unwrap().kind, TaskEventKind::Expired);
        assert_eq!(
            registry.get_worker("w1").unwrap().unwrap().state,
            WorkerState::Connected
        );

        // The expired worker went to the queue tail: w2 gets the re-offer.
        let offers = engine.dispatch(&mut registry, now_ms(), 1).unwrap();
        assert_eq!(offers[0].peer_id, "w2");
    }

    #[test]
    fn sweep_recovers_tasks_from_disconnected_workers() {
        let store = temp_store();
        let mut engine = engine_with_template(&store);
        let mut registry = registry_with_workers(&store, &["w1"]);
        engine
            .create_task(new_task("t1"), &"provider-1".to_string())
            .unwrap();

        let now = now_ms();
        engine.dispatch(&mut registry, now, 0).unwrap();
        engine
            .process_task_acception(&"t1".to_string(), &"w1".to_string(), now)
            .unwrap();

        registry.disconnect(&"w1".to_string()).unwrap();
        let reclaimed = engine.sweep(&mut registry, now).unwrap();
        assert_eq!(reclaimed, vec!["t1".to_string()]);

        let task = store.task("t1").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert!(!task.accrual_pending);
        assert!(task
            .events
            .iter()
            .all(|e| e.kind != TaskEventKind::Completed));
    }
}
