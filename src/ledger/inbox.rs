use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::ledger::PaymentLedger;
use crate::store::Store;
use crate::types::{Recipient, TaskId};

const MAX_RETRIES: u32 = 5;

/// One accrual owed for a completed task. The task transition is already
/// durable when this is enqueued; the `accrual_pending` flag on the task is
/// what gets replayed if the process dies in between.
#[derive(Debug, Clone)]
pub struct AccrualRequest {
    pub task_id: TaskId,
    pub recipient: Recipient,
    pub amount: u64,
}

struct QueuedAccrual {
    request: AccrualRequest,
    retry_count: u32,
}

/// The ledger's inbox: completions are enqueued here and drained by a single
/// background task, so the engine never blocks on the ledger. Failed accruals
/// retry with exponential backoff before being dropped.
pub struct AccrualQueue {
    inner: Arc<Mutex<VecDeque<QueuedAccrual>>>,
    processing: Arc<AtomicBool>,
    ledger: Arc<Mutex<PaymentLedger>>,
    store: Store,
}

impl AccrualQueue {
    pub fn new(ledger: Arc<Mutex<PaymentLedger>>, store: Store) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            processing: Arc::new(AtomicBool::new(false)),
            ledger,
            store,
        }
    }

    pub async fn enqueue(&self, request: AccrualRequest) {
        self.inner.lock().await.push_back(QueuedAccrual {
            request,
            retry_count: 0,
        });
        self.start_processing();
    }

    /// Re-enqueues every completed task whose accrual never landed. Called
    /// once at startup; the recipient is resolved through the worker that
    /// completed the task.
    pub async fn replay_pending(&self) -> Result<usize> {
        let mut replayed = 0;
        for task in self.store.tasks()? {
            if !task.accrual_pending {
                continue;
            }
            let Some(peer_id) = task.assigned_worker_peer_id.clone() else {
                warn!("Task {} awaits accrual but has no assigned worker", task.id);
                continue;
            };
            let Some(worker) = self.store.worker(&peer_id)? else {
                warn!("Task {} awaits accrual but worker {} is gone", task.id, peer_id);
                continue;
            };
            self.enqueue(AccrualRequest {
                task_id: task.id,
                recipient: worker.recipient,
                amount: task.reward,
            })
            .await;
            replayed += 1;
        }
        Ok(replayed)
    }

    fn start_processing(&self) {
        if self.processing.swap(true, Ordering::SeqCst) {
            // Already processing
            return;
        }

        let inner = Arc::clone(&self.inner);
        let processing = Arc::clone(&self.processing);
        let ledger = Arc::clone(&self.ledger);
        let store = self.store.clone();

        tokio::spawn(async move {
            loop {
                let item = inner.lock().await.pop_front();

                match item {
                    Some(mut item) => match apply(&ledger, &store, &item.request).await {
                        Ok(()) => {}
                        Err(Error::Forbidden(msg)) => {
                            // Payments disabled; retrying will not help.
                            warn!("Dropping accrual for task {}: {}", item.request.task_id, msg);
                        }
                        Err(e) if item.retry_count < MAX_RETRIES => {
                            warn!("Accrual for task {} failed: {}", item.request.task_id, e);
                            item.retry_count += 1;

                            let delay_ms = 250 * 2u64.pow(item.retry_count.min(6));
                            sleep(Duration::from_millis(delay_ms)).await;

                            inner.lock().await.push_front(item);
                        }
                        Err(e) => {
                            error!(
                                "Giving up on accrual for task {}: {}",
                                item.request.task_id, e
                            );
                        }
                    },
                    None => {
                        processing.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
        });
    }
}

/// Records the accrual and clears the task's outbox flag.
async fn apply(
    ledger: &Arc<Mutex<PaymentLedger>>,
    store: &Store,
    request: &AccrualRequest,
) -> Result<()> {
    ledger
        .lock()
        .await
        .accrue(request.recipient, request.amount)?;

    if let Some(mut task) = store.task(&request.task_id)? {
        task.accrual_pending = false;
        store.put_task(&task)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::ledger::signing::PayoutSigner;
    use crate::store::tests::{task_fixture, temp_store};
    use crate::types::TaskState;

    fn setup() -> (AccrualQueue, Store) {
        let store = temp_store();
        let ledger = Arc::new(Mutex::new(PaymentLedger::new(
            store.clone(),
            EventBus::default(),
            Some(PayoutSigner::from_seed(&hex::encode([1u8; 32])).unwrap()),
            None,
            Some("settlement-account".to_string()),
            100,
        )));
        (AccrualQueue::new(ledger, store.clone()), store)
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn accrual_lands_and_clears_outbox_flag() {
        let (queue, store) = setup();
        let mut task = task_fixture("t1");
        task.state = TaskState::Completed;
        task.accrual_pending = true;
        store.put_task(&task).unwrap();

        queue
            .enqueue(AccrualRequest {
                task_id: "t1".to_string(),
                recipient: Recipient([2; 32]),
                amount: 5,
            })
            .await;

        let check_store = store.clone();
        wait_for(move || {
            check_store
                .task("t1")
                .unwrap()
                .map(|t| !t.accrual_pending)
                .unwrap_or(false)
        })
        .await;

        let payments = store.payments_for(&Recipient([2; 32])).unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].amount, 5);
        assert_eq!(payments[0].nonce, 0);
    }

    #[tokio::test]
    async fn replay_picks_up_unprocessed_completions() {
        let (queue, store) = setup();

        let mut task = task_fixture("t1");
        task.state = TaskState::Completed;
        task.accrual_pending = true;
        task.assigned_worker_peer_id = Some("w1".to_string());
        store.put_task(&task).unwrap();

        store
            .put_worker(&crate::types::WorkerRecord {
                peer_id: "w1".to_string(),
                recipient: Recipient([3; 32]),
                state: crate::types::WorkerState::Disconnected,
                current_task_id: None,
                connected_at: None,
                last_nonce: 0,
                proof_failures: 0,
            })
            .unwrap();

        let replayed = queue.replay_pending().await.unwrap();
        assert_eq!(replayed, 1);

        let check_store = store.clone();
        wait_for(move || {
            !check_store
                .payments_for(&Recipient([3; 32]))
                .unwrap()
                .is_empty()
        })
        .await;
    }

    #[tokio::test]
    async fn completed_tasks_without_pending_flag_are_not_replayed() {
        let (queue, store) = setup();
        let mut task = task_fixture("t1");
        task.state = TaskState::Completed;
        task.accrual_pending = false;
        store.put_task(&task).unwrap();

        assert_eq!(queue.replay_pending().await.unwrap(), 0);
    }
}
