use std::fs;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::config::ManagerConfig;
use crate::control::ControlHandle;
use crate::engine::TaskEngine;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::ledger::inbox::AccrualQueue;
use crate::ledger::proof::{BatchProofVerifier, ProofVerifier};
use crate::ledger::signing::PayoutSigner;
use crate::ledger::PaymentLedger;
use crate::registry::WorkerRegistry;
use crate::store::Store;
use crate::transport::PeerConnections;
use crate::types::{now_ms, Manager};

/// A builder pattern for constructing a `Manager` instance. The keypair step
/// changes the builder's type, so a manager cannot be built before the
/// signing decision (key or explicitly none) has been made.
pub struct ManagerBuilder<Keypair> {
    config: Option<ManagerConfig>,
    keypair: Keypair,
    verifier: Option<Arc<dyn BatchProofVerifier>>,
}

pub struct NoKeypair;

/// The resolved signing decision: a payout signer, or none when payments are
/// disabled.
pub struct PayoutKeypair(Option<PayoutSigner>);

impl Default for ManagerBuilder<NoKeypair> {
    fn default() -> Self {
        ManagerBuilder {
            config: None,
            keypair: NoKeypair,
            verifier: None,
        }
    }
}

impl<Keypair> ManagerBuilder<Keypair> {
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Overrides the proof verifier; without this the verification key is
    /// loaded from the configured path.
    pub fn verifier(mut self, verifier: Arc<dyn BatchProofVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Derives the payout signing key from the first 32 bytes of the given
    /// hex seed. Without a seed the manager runs with payments disabled.
    pub fn keypair(self, private_key: Option<&str>) -> Result<ManagerBuilder<PayoutKeypair>> {
        let signer = match private_key {
            Some(seed) => Some(PayoutSigner::from_seed(seed)?),
            None => {
                warn!("No private key present, payout signing is disabled...");
                None
            }
        };
        Ok(ManagerBuilder {
            config: self.config,
            keypair: PayoutKeypair(signer),
            verifier: self.verifier,
        })
    }
}

impl ManagerBuilder<PayoutKeypair> {
    /// Opens the store, wires the subsystems and resets any connection state
    /// left over from a previous run.
    pub async fn build(self) -> Result<Manager> {
        let config = self.config.ok_or_else(Error::config_not_initialized)?;
        let store = Store::open(&config.db_path)?;
        let events = EventBus::default();

        let signer = self.keypair.0;
        let public_key = signer.as_ref().map(|s| s.public_key_hex());
        let peer_id = public_key
            .as_ref()
            .map(|pk| format!("manager-{}", &pk[..16.min(pk.len())]))
            .unwrap_or_else(|| "manager-local".to_string());

        let verifier = match self.verifier {
            Some(verifier) => Some(verifier),
            None => match &config.verification_key_path {
                Some(path) => {
                    let raw = fs::read_to_string(path)?;
                    Some(Arc::new(ProofVerifier::from_json(&raw)?)
                        as Arc<dyn BatchProofVerifier>)
                }
                None => None,
            },
        };

        let mut registry =
            WorkerRegistry::new(store.clone(), events.clone(), config.require_access_codes);
        registry.reset_connections()?;
        let engine = TaskEngine::new(store.clone(), events.clone(), config.task_acceptance_ms)?;
        let ledger = Arc::new(Mutex::new(PaymentLedger::new(
            store.clone(),
            events.clone(),
            signer,
            verifier,
            config.payment_account.clone(),
            config.payment_batch_size,
        )));
        let accruals = Arc::new(AccrualQueue::new(ledger.clone(), store.clone()));

        Ok(Manager {
            peer_id,
            config,
            public_key,
            store,
            registry: Arc::new(Mutex::new(registry)),
            engine: Arc::new(Mutex::new(engine)),
            ledger,
            accruals,
            peers: Arc::new(PeerConnections::new()),
            events,
            control: ControlHandle::new(),
            started_at: now_ms(),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::ledger::proof::ProofWire;
    use crate::types::PaymentBatch;
    use std::path::PathBuf;

    /// Stands in for the Groth16 verifier so settlement logic can be tested
    /// without a circuit.
    pub(crate) struct AlwaysValid;

    impl BatchProofVerifier for AlwaysValid {
        fn verify_batch(&self, _proof: &ProofWire, _batch: &PaymentBatch) -> Result<bool> {
            Ok(true)
        }
    }

    pub(crate) fn test_config(require_access_codes: bool, payment_batch_size: u32) -> ManagerConfig {
        let dir = tempfile::tempdir().unwrap();
        let db_path: PathBuf = dir.path().to_path_buf();
        std::mem::forget(dir);

        ManagerConfig {
            port: 0,
            http_port: 0,
            auto_manage: true,
            listen: vec![],
            announce: vec![],
            payment_batch_size,
            require_access_codes,
            payment_account: Some("settlement-account".to_string()),
            with_admin: true,
            tick_interval_ms: 1000,
            task_acceptance_ms: 30_000,
            db_path,
            log_path: None,
            verification_key_path: None,
            private_key: None,
        }
    }

    pub(crate) async fn test_manager(
        require_access_codes: bool,
        payment_batch_size: u32,
    ) -> Arc<Manager> {
        Arc::new(
            ManagerBuilder::default()
                .config(test_config(require_access_codes, payment_batch_size))
                .keypair(Some(&hex::encode([7u8; 32])))
                .unwrap()
                .build()
                .await
                .unwrap(),
        )
    }

    pub(crate) async fn test_manager_with_verifier(
        require_access_codes: bool,
        payment_batch_size: u32,
        verifier: AlwaysValid,
    ) -> Arc<Manager> {
        Arc::new(
            ManagerBuilder::default()
                .config(test_config(require_access_codes, payment_batch_size))
                .verifier(Arc::new(verifier))
                .keypair(Some(&hex::encode([7u8; 32])))
                .unwrap()
                .build()
                .await
                .unwrap(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_support::test_config;

    #[tokio::test]
    async fn build_requires_config() {
        let result = ManagerBuilder::default().keypair(None).unwrap().build().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn build_without_key_disables_payments() {
        let manager = ManagerBuilder::default()
            .config(test_config(false, 100))
            .keypair(None)
            .unwrap()
            .build()
            .await
            .unwrap();
        assert_eq!(manager.public_key, None);
        assert_eq!(manager.peer_id, "manager-local");
    }

    #[tokio::test]
    async fn build_with_key_publishes_it() {
        let manager = ManagerBuilder::default()
            .config(test_config(false, 100))
            .keypair(Some(&hex::encode([7u8; 32])))
            .unwrap()
            .build()
            .await
            .unwrap();
        let public_key = manager.public_key.clone().unwrap();
        assert_eq!(public_key.len(), 64);
        assert!(manager.peer_id.starts_with("manager-"));
    }

    #[tokio::test]
    async fn keypair_rejects_bad_seed() {
        assert!(ManagerBuilder::default()
            .config(test_config(false, 100))
            .keypair(Some("tooshort"))
            .is_err());
    }
}
