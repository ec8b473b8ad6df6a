pub mod inbox;
pub mod proof;
pub mod signing;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::events::{EventBus, ManagerEvent};
use crate::store::Store;
use crate::types::{now_ms, PaymentBatch, PaymentRecord, Recipient};

use proof::{BatchProofVerifier, ProofWire};
use signing::PayoutSigner;

/// A worker's view of one of its payment records, as sent in a proof request.
/// Amounts are never trusted; the ledger re-derives every sum from its own
/// records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentClaim {
    pub nonce: u64,
    pub recipient: Recipient,
    pub amount: u64,
}

/// One Groth16 proof plus its public signals, covering a contiguous nonce
/// range of the sender's records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofBundle {
    pub min_nonce: u64,
    pub max_nonce: u64,
    pub amount: u64,
    pub recipient: Recipient,
    pub proof: ProofWire,
}

/// A payout authorization signed with the manager's EdDSA key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedAuthorization {
    #[serde(flatten)]
    pub batch: PaymentBatch,
    /// Compressed `(R8, S)`, hex.
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkAuthorization {
    pub authorization: SignedAuthorization,
    /// How many records this settlement marked settled.
    pub settled_records: u64,
}

/// Per-recipient payment accrual and proof-mediated settlement. The ledger
/// exclusively owns payment records; completions reach it through the accrual
/// inbox, never through a direct engine reference.
pub struct PaymentLedger {
    store: Store,
    events: EventBus,
    signer: Option<PayoutSigner>,
    verifier: Option<Arc<dyn BatchProofVerifier>>,
    payment_account: Option<String>,
    batch_size: u32,
    /// Next nonce to allocate, per recipient. Lazily rebuilt from the store.
    next_nonce: HashMap<Recipient, u64>,
    /// Highest settled nonce, per recipient. Settlement is a contiguous
    /// prefix, so one number is enough.
    last_settled: HashMap<Recipient, Option<u64>>,
}

impl PaymentLedger {
    pub fn new(
        store: Store,
        events: EventBus,
        signer: Option<PayoutSigner>,
        verifier: Option<Arc<dyn BatchProofVerifier>>,
        payment_account: Option<String>,
        batch_size: u32,
    ) -> Self {
        Self {
            store,
            events,
            signer,
            verifier,
            payment_account,
            batch_size,
            next_nonce: HashMap::new(),
            last_settled: HashMap::new(),
        }
    }

    pub fn public_key_hex(&self) -> Option<String> {
        self.signer.as_ref().map(|s| s.public_key_hex())
    }

    pub fn verifier(&self) -> Option<Arc<dyn BatchProofVerifier>> {
        self.verifier.clone()
    }

    fn signer(&self) -> Result<&PayoutSigner> {
        self.signer.as_ref().ok_or_else(Error::payments_disabled)
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.payment_account.is_none() {
            return Err(Error::payments_disabled());
        }
        Ok(())
    }

    /// Loads the nonce cursors for a recipient from its stored records.
    fn load_cursors(&mut self, recipient: &Recipient) -> Result<()> {
        if self.next_nonce.contains_key(recipient) {
            return Ok(());
        }
        let records = self.store.payments_for(recipient)?;
        let next = records.last().map(|r| r.nonce + 1).unwrap_or(0);
        let settled = records.iter().filter(|r| r.settled).map(|r| r.nonce).max();
        self.next_nonce.insert(*recipient, next);
        self.last_settled.insert(*recipient, settled);
        Ok(())
    }

    /// Allocates the next nonce for the recipient and persists the record.
    /// Nonces are gapless per recipient: the store key order is allocation
    /// order and nothing is ever deleted.
    pub fn accrue(&mut self, recipient: Recipient, amount: u64) -> Result<PaymentRecord> {
        self.ensure_enabled()?;
        self.load_cursors(&recipient)?;

        let nonce = *self.next_nonce.get(&recipient).unwrap_or(&0);
        let record = PaymentRecord {
            nonce,
            recipient,
            amount,
            created_at: now_ms(),
            settled: false,
        };
        self.store.put_payment(&record)?;
        self.next_nonce.insert(recipient, nonce + 1);

        info!("Payment accrued: {} nonce {} amount {}", recipient, nonce, amount);
        self.events.emit(ManagerEvent::PaymentCreated {
            recipient,
            nonce,
            amount,
        });
        Ok(record)
    }

    /// Signs an authorization for a set of the sender's records. The batch is
    /// the contiguous `[min, max]` nonce span of the claims; its total comes
    /// from the ledger's own records.
    pub fn process_proof_request(
        &mut self,
        sender_recipient: Recipient,
        claims: &[PaymentClaim],
    ) -> Result<SignedAuthorization> {
        self.ensure_enabled()?;
        if claims.is_empty() {
            return Err(Error::InvalidArgument(
                "proof request carries no payments".to_string(),
            ));
        }
        if claims.iter().any(|c| c.recipient != claims[0].recipient) {
            return Err(Error::InvalidArgument(
                "proof request mixes recipients".to_string(),
            ));
        }
        if claims[0].recipient != sender_recipient {
            return Err(Error::Forbidden(
                "proof request for a foreign recipient".to_string(),
            ));
        }

        let recipient = sender_recipient;
        self.load_cursors(&recipient)?;

        let min_nonce = claims.iter().map(|c| c.nonce).min().unwrap_or(0);
        let max_nonce = claims.iter().map(|c| c.nonce).max().unwrap_or(0);
        let span = max_nonce - min_nonce + 1;
        if span > u64::from(self.batch_size) {
            return Err(Error::batch_too_large(span, self.batch_size));
        }

        let recorded = self.recorded_sum(&recipient, min_nonce, max_nonce)?;
        let claimed: u64 = claims.iter().map(|c| c.amount).sum();
        if claimed != recorded {
            return Err(Error::inconsistent_sum(claimed, recorded));
        }

        let batch = PaymentBatch {
            recipient,
            min_nonce,
            max_nonce,
            amount: recorded,
        };
        let signature = self.signer()?.sign_batch(&batch)?;
        Ok(SignedAuthorization { batch, signature })
    }

    /// Settles pre-verified proof bundles. Ranges must be disjoint and
    /// contiguous from the last settled nonce; every covered record is marked
    /// settled and one aggregated authorization is returned.
    ///
    /// Groth16 verification itself happens before this call, off the
    /// subsystem lock (it is CPU-bound); see the router.
    pub fn settle_proofs(
        &mut self,
        sender_recipient: Recipient,
        bundles: &[ProofBundle],
    ) -> Result<BulkAuthorization> {
        self.ensure_enabled()?;
        if bundles.is_empty() {
            return Err(Error::InvalidArgument(
                "bulk proof request carries no proofs".to_string(),
            ));
        }
        for bundle in bundles {
            if bundle.recipient != sender_recipient {
                return Err(Error::Forbidden(
                    "bulk proof for a foreign recipient".to_string(),
                ));
            }
            if bundle.max_nonce < bundle.min_nonce {
                return Err(Error::InvalidArgument(format!(
                    "proof range [{}, {}] is inverted",
                    bundle.min_nonce, bundle.max_nonce
                )));
            }
        }

        let recipient = sender_recipient;
        self.load_cursors(&recipient)?;

        let mut ordered: Vec<&ProofBundle> = bundles.iter().collect();
        ordered.sort_by_key(|b| b.min_nonce);

        // Ranges must continue exactly where settlement last stopped.
        let mut expected = self
            .last_settled
            .get(&recipient)
            .copied()
            .flatten()
            .map(|n| n + 1)
            .unwrap_or(0);
        for bundle in &ordered {
            if bundle.min_nonce != expected {
                return Err(Error::range_overlap(expected, bundle.min_nonce));
            }
            let recorded = self.recorded_sum(&recipient, bundle.min_nonce, bundle.max_nonce)?;
            if recorded != bundle.amount {
                return Err(Error::inconsistent_sum(bundle.amount, recorded));
            }
            expected = bundle.max_nonce + 1;
        }

        // All checks passed; flip the settled markers.
        let min_nonce = ordered.first().map(|b| b.min_nonce).unwrap_or(0);
        let max_nonce = ordered.last().map(|b| b.max_nonce).unwrap_or(0);
        let mut total = 0u64;
        for nonce in min_nonce..=max_nonce {
            let mut record = self
                .store
                .payment(&recipient, nonce)?
                .ok_or_else(|| Error::unknown_nonce(nonce))?;
            record.settled = true;
            total += record.amount;
            self.store.put_payment(&record)?;
        }
        self.last_settled.insert(recipient, Some(max_nonce));

        for bundle in &ordered {
            self.events.emit(ManagerEvent::PaymentSettled {
                recipient,
                min_nonce: bundle.min_nonce,
                max_nonce: bundle.max_nonce,
            });
        }

        let batch = PaymentBatch {
            recipient,
            min_nonce,
            max_nonce,
            amount: total,
        };
        let signature = self.signer()?.sign_batch(&batch)?;
        Ok(BulkAuthorization {
            authorization: SignedAuthorization { batch, signature },
            settled_records: max_nonce - min_nonce + 1,
        })
    }

    /// Administrative flush: signs and settles the current unsettled batch
    /// for a recipient. Used by test and manual flows.
    pub fn process_payout_request(&mut self, recipient: Recipient) -> Result<SignedAuthorization> {
        self.ensure_enabled()?;
        self.load_cursors(&recipient)?;

        let next = *self.next_nonce.get(&recipient).unwrap_or(&0);
        let min_nonce = self
            .last_settled
            .get(&recipient)
            .copied()
            .flatten()
            .map(|n| n + 1)
            .unwrap_or(0);
        if min_nonce >= next {
            return Err(Error::NotFound(format!(
                "no unsettled payments for {recipient}"
            )));
        }
        let max_nonce = next - 1;

        let mut total = 0u64;
        for nonce in min_nonce..=max_nonce {
            let mut record = self
                .store
                .payment(&recipient, nonce)?
                .ok_or_else(|| Error::unknown_nonce(nonce))?;
            record.settled = true;
            total += record.amount;
            self.store.put_payment(&record)?;
        }
        self.last_settled.insert(recipient, Some(max_nonce));

        let batch = PaymentBatch {
            recipient,
            min_nonce,
            max_nonce,
            amount: total,
        };
        let signature = self.signer()?.sign_batch(&batch)?;
        self.events.emit(ManagerEvent::PaymentSettled {
            recipient,
            min_nonce,
            max_nonce,
        });
        Ok(SignedAuthorization { batch, signature })
    }

    /// Sum of the ledger's own records over `[min, max]`. Every nonce in the
    /// range must exist.
    fn recorded_sum(&self, recipient: &Recipient, min: u64, max: u64) -> Result<u64> {
        let mut total = 0u64;
        for nonce in min..=max {
            let record = self
                .store
                .payment(recipient, nonce)?
                .ok_or_else(|| Error::unknown_nonce(nonce))?;
            total += record.amount;
        }
        Ok(total)
    }
}
