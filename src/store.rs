use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::types::{PaymentRecord, Recipient, TaskRecord, TemplateRecord, WorkerRecord};

/// One embedded key-value store shared by every subsystem. Each subsystem
/// owns a disjoint key prefix (`task/`, `worker/`, `payment/`, `template/`,
/// `accesscode/`), so no cross-prefix transactions are needed.
#[derive(Clone)]
pub struct Store {
    db: sled::Db,
}

fn task_key(id: &str) -> String {
    format!("task/{id}")
}

fn worker_key(peer_id: &str) -> String {
    format!("worker/{peer_id}")
}

fn template_key(id: &str) -> String {
    format!("template/{id}")
}

// Zero-padded nonce so lexicographic key order is nonce order.
fn payment_key(recipient: &Recipient, nonce: u64) -> String {
    format!("payment/{recipient}/{nonce:020}")
}

fn access_code_key(code: &str) -> String {
    format!("accesscode/{code}")
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    fn put<T: Serialize>(&self, key: String, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.db.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = entry?;
            out.push(serde_json::from_slice(&bytes)?);
        }
        Ok(out)
    }

    pub fn put_task(&self, task: &TaskRecord) -> Result<()> {
        self.put(task_key(&task.id), task)
    }

    pub fn task(&self, id: &str) -> Result<Option<TaskRecord>> {
        self.get(&task_key(id))
    }

    pub fn tasks(&self) -> Result<Vec<TaskRecord>> {
        self.scan("task/")
    }

    pub fn put_worker(&self, worker: &WorkerRecord) -> Result<()> {
        self.put(worker_key(&worker.peer_id), worker)
    }

    pub fn worker(&self, peer_id: &str) -> Result<Option<WorkerRecord>> {
        self.get(&worker_key(peer_id))
    }

    pub fn workers(&self) -> Result<Vec<WorkerRecord>> {
        self.scan("worker/")
    }

    pub fn put_template(&self, template: &TemplateRecord) -> Result<()> {
        self.put(template_key(&template.template_id), template)
    }

    pub fn template(&self, id: &str) -> Result<Option<TemplateRecord>> {
        self.get(&template_key(id))
    }

    pub fn put_payment(&self, record: &PaymentRecord) -> Result<()> {
        self.put(payment_key(&record.recipient, record.nonce), record)
    }

    pub fn payment(&self, recipient: &Recipient, nonce: u64) -> Result<Option<PaymentRecord>> {
        self.get(&payment_key(recipient, nonce))
    }

    /// All records for one recipient, in nonce order.
    pub fn payments_for(&self, recipient: &Recipient) -> Result<Vec<PaymentRecord>> {
        self.scan(&format!("payment/{recipient}/"))
    }

    pub fn insert_access_code(&self, code: &str) -> Result<()> {
        self.put(access_code_key(code), &false)
    }

    /// Marks a code consumed. Returns false when the code is unknown or was
    /// already used; single-use is enforced here.
    pub fn consume_access_code(&self, code: &str) -> Result<bool> {
        let key = access_code_key(code);
        match self.get::<bool>(&key)? {
            Some(false) => {
                self.put(key, &true)?;
                Ok(true)
            }
            Some(true) | None => Ok(false),
        }
    }

    /// Blocks until all dirty pages hit disk. Called on shutdown.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{TaskState, WorkerState};

    pub(crate) fn temp_store() -> Store {
        let dir = tempfile::tempdir().unwrap();
        // Keep the directory alive for the process; tests are short-lived.
        let store = Store::open(dir.path()).unwrap();
        std::mem::forget(dir);
        store
    }

    pub(crate) fn task_fixture(id: &str) -> TaskRecord {
        TaskRecord {
            id: id.to_string(),
            template_id: "tpl1".to_string(),
            title: format!("task {id}"),
            reward: 5,
            provider_peer_id: "provider-1".to_string(),
            payload: serde_json::Value::Null,
            created_at: crate::types::now_ms(),
            state: TaskState::Pending,
            assigned_worker_peer_id: None,
            offered_at: None,
            deadline: None,
            events: vec![],
            accrual_pending: false,
        }
    }

    #[test]
    fn task_round_trip() {
        let store = temp_store();
        let task = task_fixture("t1");
        store.put_task(&task).unwrap();
        assert_eq!(store.task("t1").unwrap(), Some(task));
        assert_eq!(store.task("t2").unwrap(), None);
    }

    #[test]
    fn worker_round_trip() {
        let store = temp_store();
        let worker = WorkerRecord {
            peer_id: "w1".to_string(),
            recipient: Recipient([1; 32]),
            state: WorkerState::Connected,
            current_task_id: None,
            connected_at: Some(1),
            last_nonce: 3,
            proof_failures: 0,
        };
        store.put_worker(&worker).unwrap();
        assert_eq!(store.worker("w1").unwrap(), Some(worker));
    }

    #[test]
    fn payments_iterate_in_nonce_order() {
        let store = temp_store();
        let recipient = Recipient([9; 32]);
        for nonce in [3u64, 0, 2, 1, 10] {
            store
                .put_payment(&PaymentRecord {
                    nonce,
                    recipient,
                    amount: nonce + 1,
                    created_at: 0,
                    settled: false,
                })
                .unwrap();
        }
        let nonces: Vec<u64> = store
            .payments_for(&recipient)
            .unwrap()
            .into_iter()
            .map(|r| r.nonce)
            .collect();
        assert_eq!(nonces, vec![0, 1, 2, 3, 10]);
    }

    #[test]
    fn payments_are_scoped_per_recipient() {
        let store = temp_store();
        let a = Recipient([1; 32]);
        let b = Recipient([2; 32]);
        store
            .put_payment(&PaymentRecord {
                nonce: 0,
                recipient: a,
                amount: 5,
                created_at: 0,
                settled: false,
            })
            .unwrap();
        assert!(store.payments_for(&b).unwrap().is_empty());
    }

    #[test]
    fn access_codes_are_single_use() {
        let store = temp_store();
        store.insert_access_code("alpha").unwrap();
        assert!(store.consume_access_code("alpha").unwrap());
        assert!(!store.consume_access_code("alpha").unwrap());
        assert!(!store.consume_access_code("never-issued").unwrap());
    }
}
