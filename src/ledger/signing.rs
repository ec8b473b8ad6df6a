use babyjubjub_rs::{decompress_point, decompress_signature, PrivateKey};
use ff::PrimeField;
use num_bigint::{BigInt, Sign};
use poseidon_rs::{Fr, Poseidon};

use crate::error::{Error, Result};
use crate::types::PaymentBatch;

// BN254 scalar field modulus; recipient bytes are reduced into the field the
// same way the settlement circuit does.
const FIELD_MODULUS: &str =
    "21888242871839275222246405745257275088548364400416034343698204186575808495617";

/// EdDSA-on-BabyJubJub signer for payout authorizations. The key is derived
/// once at startup from the first 32 bytes of the configured private key; the
/// compressed public key is published in the identify response so workers can
/// check authorizations offline.
pub struct PayoutSigner {
    key: PrivateKey,
}

impl PayoutSigner {
    pub fn from_seed(seed_hex: &str) -> Result<Self> {
        let bytes = hex::decode(seed_hex.trim_start_matches("0x"))
            .map_err(|e| Error::InvalidArgument(format!("private key is not valid hex: {e}")))?;
        if bytes.len() < 32 {
            return Err(Error::InvalidArgument(
                "private key must be at least 32 bytes".to_string(),
            ));
        }
        let key = PrivateKey::import(bytes[..32].to_vec()).map_err(Error::Custom)?;
        Ok(Self { key })
    }

    /// Compressed public key, hex.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.public().compress())
    }

    /// Signs `(recipient, minNonce, maxNonce, amount)`. The signature is the
    /// 64-byte compressed `(R8, S)` pair, hex-encoded.
    pub fn sign_batch(&self, batch: &PaymentBatch) -> Result<String> {
        let message = authorization_message(batch)?;
        let signature = self.key.sign(message).map_err(Error::Custom)?;
        Ok(hex::encode(signature.compress()))
    }
}

/// Checks a payout authorization against a compressed public key. The manager
/// itself only signs; this is the worker-side check, kept here so the signing
/// scheme is covered end to end by the tests.
pub fn verify_authorization(
    public_key_hex: &str,
    batch: &PaymentBatch,
    signature_hex: &str,
) -> Result<bool> {
    let pk_bytes: [u8; 32] = hex::decode(public_key_hex)
        .map_err(|e| Error::InvalidArgument(format!("public key is not valid hex: {e}")))?
        .try_into()
        .map_err(|_| Error::InvalidArgument("public key must be 32 bytes".to_string()))?;
    let sig_bytes: [u8; 64] = hex::decode(signature_hex)
        .map_err(|e| Error::InvalidArgument(format!("signature is not valid hex: {e}")))?
        .try_into()
        .map_err(|_| Error::InvalidArgument("signature must be 64 bytes".to_string()))?;

    let point = decompress_point(pk_bytes).map_err(Error::Custom)?;
    let signature = decompress_signature(&sig_bytes).map_err(Error::Custom)?;
    Ok(babyjubjub_rs::verify(
        point,
        signature,
        authorization_message(batch)?,
    ))
}

/// Poseidon hash of the four authorization fields, as the EdDSA message.
fn authorization_message(batch: &PaymentBatch) -> Result<BigInt> {
    let inputs = vec![
        fr_from_bytes(&batch.recipient.0)?,
        fr_from_u64(batch.min_nonce)?,
        fr_from_u64(batch.max_nonce)?,
        fr_from_u64(batch.amount)?,
    ];
    let hash = Poseidon::new().hash(inputs).map_err(Error::Custom)?;
    fr_to_bigint(&hash)
}

fn fr_from_u64(n: u64) -> Result<Fr> {
    Fr::from_str(&n.to_string())
        .ok_or_else(|| Error::Custom(format!("{n} is not a valid field element")))
}

fn fr_from_bytes(bytes: &[u8; 32]) -> Result<Fr> {
    let modulus = BigInt::parse_bytes(FIELD_MODULUS.as_bytes(), 10)
        .ok_or_else(|| Error::Custom("invalid field modulus".to_string()))?;
    let reduced = BigInt::from_bytes_be(Sign::Plus, bytes) % modulus;
    Fr::from_str(&reduced.to_str_radix(10))
        .ok_or_else(|| Error::Custom("recipient does not reduce to a field element".to_string()))
}

fn fr_to_bigint(fr: &Fr) -> Result<BigInt> {
    BigInt::parse_bytes(ff::to_hex(fr).as_bytes(), 16)
        .ok_or_else(|| Error::Custom("could not decode poseidon output".to_string()))
}
