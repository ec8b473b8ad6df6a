pub mod dispatch;

pub use dispatch::OutboundOffer;

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::REJECTION_BACKOFF_CYCLES;
use crate::error::{Error, Result};
use crate::events::{EventBus, ManagerEvent};
use crate::store::Store;
use crate::types::{
    now_ms, NewTask, PeerId, TaskEventKind, TaskId, TaskRecord, TaskState, TaskView, TemplateId,
    TemplateRecord,
};

/// A template as submitted by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTemplate {
    pub template_id: TemplateId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
}

/// Task admission, the offer/accept/submit state machine and recovery. The
/// engine exclusively owns task state transitions; worker connection state
/// belongs to the registry and payments to the ledger.
pub struct TaskEngine {
    store: Store,
    events: EventBus,
    task_acceptance_ms: i64,
    /// Dispatch order for pending tasks, oldest first.
    pending: VecDeque<TaskId>,
    /// Workers that rejected a task recently, excluded from re-offers of that
    /// task until the stored cycle has passed.
    rejections: HashMap<TaskId, HashMap<PeerId, u64>>,
    /// Set while stopping: new tasks are refused, in-flight ones drain.
    draining: bool,
}

impl TaskEngine {
    /// Rebuilds the pending queue from the store. Tasks left `Offered` or
    /// `Accepted` by a previous run are reclaimed by the first sweep, since
    /// their workers start out disconnected.
    pub fn new(store: Store, events: EventBus, task_acceptance_ms: i64) -> Result<Self> {
        let mut pending: Vec<TaskRecord> = store
            .tasks()?
            .into_iter()
            .filter(|t| t.state == TaskState::Pending)
            .collect();
        pending.sort_by_key(|t| t.created_at);

        Ok(Self {
            store,
            events,
            task_acceptance_ms,
            pending: pending.into_iter().map(|t| t.id).collect(),
            rejections: HashMap::new(),
            draining: false,
        })
    }

    /// Admits a provider task: persisted `Pending` with its `created` event,
    /// then queued for dispatch.
    pub fn create_task(&mut self, new: NewTask, provider_peer_id: &PeerId) -> Result<()> {
        if self.draining {
            return Err(Error::Cancelled("manager is stopping".to_string()));
        }
        if new.reward < 0 {
            return Err(Error::InvalidArgument(format!(
                "reward {} is negative",
                new.reward
            )));
        }
        if self.store.template(&new.template_id)?.is_none() {
            return Err(Error::unknown_template(&new.template_id));
        }
        if self.store.task(&new.id)?.is_some() {
            return Err(Error::duplicate_task(&new.id));
        }

        let mut task = TaskRecord {
            id: new.id.clone(),
            template_id: new.template_id,
            title: new.title,
            reward: new.reward as u64,
            provider_peer_id: provider_peer_id.clone(),
            payload: new.payload,
            created_at: now_ms(),
            state: TaskState::Pending,
            assigned_worker_peer_id: None,
            offered_at: None,
            deadline: None,
            events: vec![],
            accrual_pending: false,
        };
        task.push_event(TaskEventKind::Created, provider_peer_id, None);
        self.store.put_task(&task)?;
        self.pending.push_back(task.id.clone());

        info!("Task created: {}", task.id);
        self.events.emit(ManagerEvent::TaskCreated { task_id: task.id });
        Ok(())
    }

    pub fn register_template(
        &mut self,
        template: NewTemplate,
        provider_peer_id: &PeerId,
    ) -> Result<TemplateId> {
        if self.store.template(&template.template_id)?.is_some() {
            return Err(Error::Conflict(format!(
                "template {} already exists",
                template.template_id
            )));
        }
        let record = TemplateRecord {
            template_id: template.template_id.clone(),
            name: template.name,
            created_at: now_ms(),
            schema: template.schema,
        };
        self.store.put_template(&record)?;
        info!(
            "Template registered: {} by {}",
            record.template_id, provider_peer_id
        );
        Ok(record.template_id)
    }

    /// Worker accepts an open offer. Late acceptances lose to the deadline,
    /// second acceptances lose to the assignment.
    pub fn process_task_acception(
        &mut self,
        task_id: &TaskId,
        worker_peer_id: &PeerId,
        now: i64,
    ) -> Result<()> {
        let mut task = self
            .store
            .task(task_id)?
            .ok_or_else(|| Error::NotFound(format!("task {task_id} does not exist")))?;

        if matches!(task.state, TaskState::Offered | TaskState::Accepted)
            && task.assigned_worker_peer_id.as_ref() != Some(worker_peer_id)
        {
            return Err(Error::wrong_worker(task_id));
        }
        if task.state != TaskState::Offered {
            return Err(Error::not_offered(task_id));
        }
        if let Some(deadline) = task.deadline {
            if now > deadline {
                // The sweep reclaims the task; the worker is told it was too
                // slow.
                return Err(Error::DeadlinePassed(format!(
                    "acceptance for task {task_id} arrived after the deadline"
                )));
            }
        }

        task.state = TaskState::Accepted;
        task.push_event(TaskEventKind::Accepted, worker_peer_id, None);
        self.store.put_task(&task)?;

        self.events.emit(ManagerEvent::TaskAccepted {
            task_id: task_id.clone(),
            peer_id: worker_peer_id.clone(),
        });
        Ok(())
    }

    /// Worker turns an offer down. The task re-enters the pending queue with
    /// the rejecter excluded for a few cycles; the caller idles the worker.
    pub fn process_task_rejection(
        &mut self,
        task_id: &TaskId,
        worker_peer_id: &PeerId,
        reason: &str,
        cycle: u64,
    ) -> Result<()> {
        let mut task = self
            .store
            .task(task_id)?
            .ok_or_else(|| Error::NotFound(format!("task {task_id} does not exist")))?;

        if task.state != TaskState::Offered {
            return Err(Error::not_offered(task_id));
        }
        if task.assigned_worker_peer_id.as_ref() != Some(worker_peer_id) {
            return Err(Error::wrong_worker(task_id));
        }

        task.push_event(
            TaskEventKind::Rejected,
            worker_peer_id,
            Some(serde_json::json!({ "reason": reason })),
        );
        task.state = TaskState::Pending;
        task.assigned_worker_peer_id = None;
        task.offered_at = None;
        task.deadline = None;
        self.store.put_task(&task)?;

        self.rejections
            .entry(task_id.clone())
            .or_default()
            .insert(worker_peer_id.clone(), cycle + REJECTION_BACKOFF_CYCLES);
        self.pending.push_back(task_id.clone());

        self.events.emit(ManagerEvent::TaskRejected {
            task_id: task_id.clone(),
            peer_id: worker_peer_id.clone(),
        });
        Ok(())
    }

    /// Worker submits a result for its accepted task. The completed record is
    /// made durable (with `accrual_pending` raised) before the caller
    /// enqueues the accrual; results are opaque strings.
    pub fn process_task_submission(
        &mut self,
        task_id: &TaskId,
        worker_peer_id: &PeerId,
        result: &str,
    ) -> Result<TaskRecord> {
        let mut task = self
            .store
            .task(task_id)?
            .ok_or_else(|| Error::NotFound(format!("task {task_id} does not exist")))?;

        if matches!(task.state, TaskState::Offered | TaskState::Accepted)
            && task.assigned_worker_peer_id.as_ref() != Some(worker_peer_id)
        {
            return Err(Error::wrong_worker(task_id));
        }
        // Also refuses a double submission after a timeout: the task is back
        // in `Pending` by then.
        if task.state != TaskState::Accepted {
            return Err(Error::not_accepted(task_id));
        }

        task.push_event(
            TaskEventKind::Submission,
            worker_peer_id,
            Some(serde_json::json!({ "result": result })),
        );
        task.push_event(TaskEventKind::Completed, "manager", None);
        task.state = TaskState::Completed;
        task.accrual_pending = true;
        self.store.put_task(&task)?;

        info!("Task completed: {} by {}", task_id, worker_peer_id);
        self.events.emit(ManagerEvent::TaskCompleted {
            task_id: task_id.clone(),
            peer_id: worker_peer_id.clone(),
        });
        self.rejections.remove(task_id);
        Ok(task)
    }

    pub fn get_completed_tasks(&self, offset: usize, limit: usize) -> Result<Vec<TaskRecord>> {
        let mut completed: Vec<TaskRecord> = self
            .store
            .tasks()?
            .into_iter()
            .filter(|t| t.state == TaskState::Completed)
            .collect();
        completed.sort_by_key(|t| t.created_at);
        Ok(completed.into_iter().skip(offset).take(limit).collect())
    }

    /// Read model for the admin surface: every task of a template with the
    /// JSON-parsed result of its latest submission, if any.
    pub fn tasks_by_template(&self, template_id: &str) -> Result<Vec<TaskView>> {
        let mut tasks: Vec<TaskRecord> = self
            .store
            .tasks()?
            .into_iter()
            .filter(|t| t.template_id == template_id)
            .collect();
        tasks.sort_by_key(|t| t.created_at);

        Ok(tasks
            .into_iter()
            .map(|t| {
                let result = t.latest_result().map(|value| match value {
                    serde_json::Value::String(raw) => serde_json::from_str(&raw)
                        .unwrap_or(serde_json::Value::String(raw)),
                    other => other,
                });
                TaskView {
                    task_id: t.id,
                    template_id: t.template_id,
                    title: t.title,
                    result,
                }
            })
            .collect())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn set_draining(&mut self, draining: bool) {
        self.draining = draining;
    }

    /// Whether any task is still offered or accepted; used by the graceful
    /// drain.
    pub fn has_active_tasks(&self) -> Result<bool> {
        Ok(self
            .store
            .tasks()?
            .iter()
            .any(|t| matches!(t.state, TaskState::Offered | TaskState::Accepted)))
    }

    fn is_blacklisted(&self, task_id: &TaskId, peer_id: &PeerId, cycle: u64) -> bool {
        self.rejections
            .get(task_id)
            .and_then(|m| m.get(peer_id))
            .map(|until| *until > cycle)
            .unwrap_or(false)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::registry::WorkerRegistry;
    use crate::store::tests::temp_store;
    use crate::types::Recipient;

    pub(crate) fn engine_with_template(store: &Store) -> TaskEngine {
        let mut engine = TaskEngine::new(store.clone(), EventBus::default(), 30_000).unwrap();
        engine
            .register_template(
                NewTemplate {
                    template_id: "tpl1".to_string(),
                    name: "labeling".to_string(),
                    schema: None,
                },
                &"provider-1".to_string(),
            )
            .unwrap();
        engine
    }

    pub(crate) fn new_task(id: &str) -> NewTask {
        NewTask {
            id: id.to_string(),
            template_id: "tpl1".to_string(),
            title: format!("task {id}"),
            reward: 5,
            payload: serde_json::Value::Null,
        }
    }

    pub(crate) fn registry_with_workers(store: &Store, workers: &[&str]) -> WorkerRegistry {
        let mut registry = WorkerRegistry::new(store.clone(), EventBus::default(), false);
        for (i, w) in workers.iter().enumerate() {
            registry
                .onboard(&w.to_string(), Recipient([i as u8 + 1; 32]), 0, None)
                .unwrap();
        }
        registry
    }

    #[test]
    fn create_task_validates_input() {
        let store = temp_store();
        let mut engine = engine_with_template(&store);
        let provider = "provider-1".to_string();

        let mut bad_reward = new_task("t1");
        bad_reward.reward = -1;
        assert!(matches!(
            engine.create_task(bad_reward, &provider),
            Err(Error::InvalidArgument(_))
        ));

        let mut bad_template = new_task("t1");
        bad_template.template_id = "nope".to_string();
        assert!(matches!(
            engine.create_task(bad_template, &provider),
            Err(Error::NotFound(_))
        ));

        engine.create_task(new_task("t1"), &provider).unwrap();
        assert!(matches!(
            engine.create_task(new_task("t1"), &provider),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn create_task_refused_while_draining() {
        let store = temp_store();
        let mut engine = engine_with_template(&store);
        engine.set_draining(true);
        assert!(matches!(
            engine.create_task(new_task("t1"), &"provider-1".to_string()),
            Err(Error::Cancelled(_))
        ));
    }

    #[test]
    fn register_template_is_immutable() {
        let store = temp_store();
        let mut engine = engine_with_template(&store);
        let err = engine
            .register_template(
                NewTemplate {
                    template_id: "tpl1".to_string(),
                    name: "other".to_string(),
                    schema: None,
                },
                &"provider-1".to_string(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn full_lifecycle_produces_ordered_event_log() {
        let store = temp_store();
        let mut engine = engine_with_template(&store);
        let mut registry = registry_with_workers(&store, &["w1"]);
        let provider = "provider-1".to_string();
        let worker = "w1".to_string();

        engine.create_task(new_task("t1"), &provider).unwrap();
        let offers = engine.dispatch(&mut registry, now_ms(), 0).unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].peer_id, worker);

        engine
            .process_task_acception(&"t1".to_string(), &worker, now_ms())
            .unwrap();
        let task = engine
            .process_task_submission(&"t1".to_string(), &worker, "\"answer\"")
            .unwrap();

        assert_eq!(task.state, TaskState::Completed);
        assert!(task.accrual_pending);

        let kinds: Vec<TaskEventKind> = task.events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TaskEventKind::Created,
                TaskEventKind::Offered,
                TaskEventKind::Accepted,
                TaskEventKind::Submission,
                TaskEventKind::Completed,
            ]
        );
        assert!(task.events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn acceptance_checks_state_worker_and_deadline() {
        let store = temp_store();
        let mut engine = engine_with_template(&store);
        let mut registry = registry_with_workers(&store, &["w1"]);
        let provider = "provider-1".to_string();

        engine.create_task(new_task("t1"), &provider).unwrap();
        assert!(matches!(
            engine.process_task_acception(&"t1".to_string(), &"w1".to_string(), now_ms()),
            Err(Error::Conflict(_))
        ));

        let now = now_ms();
        engine.dispatch(&mut registry, now, 0).unwrap();

        assert!(matches!(
            engine.process_task_acception(&"t1".to_string(), &"w2".to_string(), now),
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(
            engine.process_task_acception(&"t1".to_string(), &"w1".to_string(), now + 60_000),
            Err(Error::DeadlinePassed(_))
        ));

        engine
            .process_task_acception(&"t1".to_string(), &"w1".to_string(), now)
            .unwrap();

        // A second acceptance from another worker is an assignment violation.
        assert!(matches!(
            engine.process_task_acception(&"t1".to_string(), &"w2".to_string(), now),
            Err(Error::Forbidden(_))
        ));
    }

    #[test]
    fn rejection_requeues_and_blacklists_the_rejecter() {
        let store = temp_store();
        let mut engine = engine_with_template(&store);
        let mut registry = registry_with_workers(&store, &["w1"]);
        let provider = "provider-1".to_string();
        let worker = "w1".to_string();

        engine.create_task(new_task("t1"), &provider).unwrap();
        engine.dispatch(&mut registry, now_ms(), 0).unwrap();
        engine
            .process_task_rejection(&"t1".to_string(), &worker, "not my kind of task", 0)
            .unwrap();
        registry.mark_idle(&worker, false).unwrap();

        let task = store.task("t1").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.assigned_worker_peer_id, None);

        // The rejecter is excluded, so nothing dispatches this cycle.
        assert!(engine.dispatch(&mut registry, now_ms(), 1).unwrap().is_empty());

        // Once the backoff lapses the same worker may be offered again.
        let offers = engine
            .dispatch(&mut registry, now_ms(), REJECTION_BACKOFF_CYCLES + 1)
            .unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].peer_id, worker);
    }

    #[test]
    fn submission_requires_accepted_state() {
        let store = temp_store();
        let mut engine = engine_with_template(&store);
        let mut registry = registry_with_workers(&store, &["w1"]);
        let provider = "provider-1".to_string();
        let worker = "w1".to_string();

        engine.create_task(new_task("t1"), &provider).unwrap();
        let now = now_ms();
        engine.dispatch(&mut registry, now, 0).unwrap();

        // Submitting while only offered is refused.
        assert!(matches!(
            engine.process_task_submission(&"t1".to_string(), &worker, "r"),
            Err(Error::Conflict(_))
        ));

        engine.process_task_acception(&"t1".to_string(), &worker, now).unwrap();
        engine.process_task_submission(&"t1".to_string(), &worker, "r").unwrap();

        // Completed is terminal; a second submission is refused.
        assert!(matches!(
            engine.process_task_submission(&"t1".to_string(), &worker, "r"),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn submission_after_timeout_recovery_is_refused() {
        let store = temp_store();
        let mut engine = engine_with_template(&store);
        let mut registry = registry_with_workers(&store, &["w1"]);
        let provider = "provider-1".to_string();
        let worker = "w1".to_string();

        engine.create_task(new_task("t1"), &provider).unwrap();
        let now = now_ms();
        engine.dispatch(&mut registry, now, 0).unwrap();
        engine.process_task_acception(&"t1".to_string(), &worker, now).unwrap();

        // The worker drops; the sweep reclaims the task.
        registry.disconnect(&worker).unwrap();
        engine.sweep(&mut registry, now).unwrap();

        let err = engine
            .process_task_submission(&"t1".to_string(), &worker, "late")
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(!store.task("t1").unwrap().unwrap().accrual_pending);
    }

    #[test]
    fn completed_tasks_read_model_pages() {
        let store = temp_store();
        let mut engine = engine_with_template(&store);
        let mut registry = registry_with_workers(&store, &["w1"]);
        let provider = "provider-1".to_string();
        let worker = "w1".to_string();

        for i in 0..3 {
            let id = format!("t{i}");
            engine.create_task(new_task(&id), &provider).unwrap();
            let now = now_ms();
            engine.dispatch(&mut registry, now, 0).unwrap();
            engine.process_task_acception(&id, &worker, now).unwrap();
            engine.process_task_submission(&id, &worker, "done").unwrap();
            registry.mark_idle(&worker, false).unwrap();
        }

        assert_eq!(engine.get_completed_tasks(0, 10).unwrap().len(), 3);
        assert_eq!(engine.get_completed_tasks(1, 1).unwrap()[0].id, "t1");
    }

    #[test]
    fn template_read_model_parses_submission_results() {
        let store = temp_store();
        let mut engine = engine_with_template(&store);
        let mut registry = registry_with_workers(&store, &["w1"]);
        let provider = "provider-1".to_string();
        let worker = "w1".to_string();

        engine.create_task(new_task("t1"), &provider).unwrap();
        engine.create_task(new_task("t2"), &provider).unwrap();

        let now = now_ms();
        engine.dispatch(&mut registry, now, 0).unwrap();
        engine.process_task_acception(&"t1".to_string(), &worker, now).unwrap();
        engine
            .process_task_submission(&"t1".to_string(), &worker, "{\"label\":\"cat\"}")
            .unwrap();

        let views = engine.tasks_by_template("tpl1").unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].task_id, "t1");
        assert_eq!(views[0].result, Some(serde_json::json!({"label": "cat"})));
        assert_eq!(views[1].result, None);
    }
}
