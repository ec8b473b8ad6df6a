use std::str::FromStr;

use ark_bn254::{Bn254, Fq, Fq2, Fr, G1Affine, G2Affine};
use ark_groth16::{prepare_verifying_key, Groth16, PreparedVerifyingKey, Proof, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::PaymentBatch;

/// A Groth16 proof as emitted by snarkjs: affine coordinates as decimal
/// strings, G1 points padded with a trailing `1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofWire {
    pub pi_a: Vec<String>,
    pub pi_b: Vec<Vec<String>>,
    pub pi_c: Vec<String>,
}

/// snarkjs `verification_key.json` layout. Only the fields the verifier needs.
#[derive(Debug, Clone, Deserialize)]
pub struct VerificationKeyWire {
    pub vk_alpha_1: Vec<String>,
    pub vk_beta_2: Vec<Vec<String>>,
    pub vk_gamma_2: Vec<Vec<String>>,
    pub vk_delta_2: Vec<Vec<String>>,
    #[serde(rename = "IC")]
    pub ic: Vec<Vec<String>>,
}

/// Verifies settlement proofs against the circuit's verification key. The
/// public signals are `(recipient, minNonce, maxNonce, amount)`, matching the
/// authorization message the manager signs.
pub trait BatchProofVerifier: Send + Sync {
    fn verify_batch(&self, proof: &ProofWire, batch: &PaymentBatch) -> Result<bool>;
}

pub struct ProofVerifier {
    pvk: PreparedVerifyingKey<Bn254>,
}

impl ProofVerifier {
    pub fn from_json(raw: &str) -> Result<Self> {
        let wire: VerificationKeyWire = serde_json::from_str(raw)?;
        let vk = VerifyingKey::<Bn254> {
            alpha_g1: g1(&wire.vk_alpha_1)?,
            beta_g2: g2(&wire.vk_beta_2)?,
            gamma_g2: g2(&wire.vk_gamma_2)?,
            delta_g2: g2(&wire.vk_delta_2)?,
            gamma_abc_g1: wire.ic.iter().map(|p| g1(p)).collect::<Result<Vec<_>>>()?,
        };
        Ok(Self {
            pvk: prepare_verifying_key(&vk),
        })
    }
}

impl BatchProofVerifier for ProofVerifier {
    fn verify_batch(&self, proof: &ProofWire, batch: &PaymentBatch) -> Result<bool> {
        let proof = Proof::<Bn254> {
            a: g1(&proof.pi_a)?,
            b: g2(&proof.pi_b)?,
            c: g1(&proof.pi_c)?,
        };
        let public_inputs = [
            fr_from_bytes(&batch.recipient.0),
            Fr::from(batch.min_nonce),
            Fr::from(batch.max_nonce),
            Fr::from(batch.amount),
        ];
        Groth16::<Bn254>::verify_proof(&self.pvk, &proof, &public_inputs)
            .map_err(|e| Error::ProofInvalid(e.to_string()))
    }
}

fn fq(raw: &str) -> Result<Fq> {
    Fq::from_str(raw).map_err(|_| Error::ProofInvalid(format!("bad base field element: {raw}")))
}

fn g1(coords: &[String]) -> Result<G1Affine> {
    if coords.len() < 2 {
        return Err(Error::ProofInvalid("G1 point needs two coordinates".to_string()));
    }
    let point = G1Affine::new_unchecked(fq(&coords[0])?, fq(&coords[1])?);
    if !point.is_on_curve() || !point.is_in_correct_subgroup_assuming_on_curve() {
        return Err(Error::ProofInvalid("G1 point is not on the curve".to_string()));
    }
    Ok(point)
}

fn g2(coords: &[Vec<String>]) -> Result<G2Affine> {
    if coords.len() < 2 || coords[0].len() < 2 || coords[1].len() < 2 {
        return Err(Error::ProofInvalid("G2 point needs two Fq2 coordinates".to_string()));
    }
    let x = Fq2::new(fq(&coords[0][0])?, fq(&coords[0][1])?);
    let y = Fq2::new(fq(&coords[1][0])?, fq(&coords[1][1])?);
    let point = G2Affine::new_unchecked(x, y);
    if !point.is_on_curve() || !point.is_in_correct_subgroup_assuming_on_curve() {
        return Err(Error::ProofInvalid("G2 point is not on the curve".to_string()));
    }
    Ok(point)
}

// Same reduction as the signing side: big-endian bytes mod r.
fn fr_from_bytes(bytes: &[u8; 32]) -> Fr {
    use ark_ff::PrimeField;
    Fr::from_be_bytes_mod_order(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_points() {
        assert!(g1(&["1".to_string()]).is_err());
        assert!(g1(&["5".to_string(), "5".to_string()]).is_err());
        assert!(fq("not-a-number").is_err());
    }

    #[test]
    fn accepts_the_g1_generator() {
        // BN254 G1 generator (1, 2).
        assert!(g1(&["1".to_string(), "2".to_string()]).is_ok());
    }

    #[test]
    fn verification_key_requires_all_fields() {
        assert!(ProofVerifier::from_json("{}").is_err());
    }
}
