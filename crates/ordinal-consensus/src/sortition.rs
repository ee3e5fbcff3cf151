//! Verifiable sortition.
//!
//! A credential is the voter's ed25519 signature over the sortition message.
//! Ed25519 signing is deterministic, so the credential is a pure function of
//! (secret key, message) that anyone holding the public key can check. The
//! pseudo-random output is the blake3 digest of that signature.

use num_bigint::BigUint;
use ordinal_core::serialize::to_bytes;
use ordinal_core::{hash_blake3, sign, CoreError, Hash, KeyPair, PublicKey, SecretKey, Sig};
use serde::{Deserialize, Serialize};

use crate::types::{Round, Step, VoteType};

const SORTITION_DOMAIN: &[u8] = b"ordinal/sortition/v1";

/// Everything a credential is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortitionMessage {
    pub vote_type: VoteType,
    pub round: Round,
    pub step: Step,
    pub weighted_index: u64,
}

impl SortitionMessage {
    pub fn new(vote_type: VoteType, round: Round, step: Step, weighted_index: u64) -> Self {
        SortitionMessage {
            vote_type,
            round,
            step,
            weighted_index,
        }
    }

    fn signing_bytes(&self) -> Result<Vec<u8>, CoreError> {
        to_bytes(&(SORTITION_DOMAIN, self))
    }
}

/// Compute `(output, proof)` for `message`
pub fn compute(secret_key: &SecretKey, message: &SortitionMessage) -> Result<(Hash, Sig), CoreError> {
    let proof = sign(secret_key, &message.signing_bytes()?);
    Ok((hash_blake3(proof.as_bytes()), proof))
}

/// Check that `proof` is `public_key`'s credential for `message` and that
/// `output` was derived from it
pub fn verify(public_key: &PublicKey, message: &SortitionMessage, output: &Hash, proof: &Sig) -> bool {
    if hash_blake3(proof.as_bytes()) != *output {
        return false;
    }
    match message.signing_bytes() {
        Ok(bytes) => ordinal_core::verify(public_key, &bytes, proof).is_ok(),
        Err(_) => false,
    }
}

/// `output / output_max * total_weight <= threshold`, in integers
pub fn can_speak(output: &Hash, threshold: u64, total_weight: u64) -> bool {
    if total_weight == 0 || threshold == 0 {
        return false;
    }
    if threshold >= total_weight {
        return true;
    }
    let output_max = (BigUint::from(1u8) << 256u32) - 1u32;
    let lhs = BigUint::from_bytes_be(output.as_bytes()) * total_weight;
    let rhs = output_max * threshold;
    lhs <= rhs
}

/// A sortition credential as carried inside a vote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sortition {
    pub voter: PublicKey,
    pub message: SortitionMessage,
    pub output: Hash,
    pub proof: Sig,
}

impl Sortition {
    pub fn new(keypair: &KeyPair, message: SortitionMessage) -> Result<Self, CoreError> {
        let (output, proof) = compute(&keypair.secret, &message)?;
        Ok(Sortition {
            voter: keypair.public,
            message,
            output,
            proof,
        })
    }

    pub fn verify(&self) -> bool {
        verify(&self.voter, &self.message, &self.output, &self.proof)
    }

    pub fn can_speak(&self, threshold: u64, total_weight: u64) -> bool {
        can_speak(&self.output, threshold, total_weight)
    }
}
