use ordinal_core::serialize::{from_bytes, to_bytes};
use ordinal_core::{hash_tagged, sign, verify, CoreError, Hash, KeyPair, PublicKey, Sig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use crate::error::ConsensusError;
use crate::sortition::{Sortition, SortitionMessage};
use crate::types::{Round, Step, VoteType};

const VOTE_DOMAIN: &[u8] = b"ordinal/vote/v1";

/// A signed statement that `value` should be agreed on at (round, step).
///
/// Immutable once built. The signature covers the value and the whole
/// sortition credential, so neither can be swapped independently.
#[derive(Clone, Serialize, Deserialize)]
pub struct Vote {
    value: Hash,
    sortition: Sortition,
    signature: Sig,
    #[serde(skip)]
    hash: OnceLock<Hash>,
}

impl Vote {
    /// Run sortition for `weighted_index` and sign the result
    pub fn generate(
        keypair: &KeyPair,
        value: Hash,
        vote_type: VoteType,
        round: Round,
        step: Step,
        weighted_index: u64,
    ) -> Result<Self, CoreError> {
        let message = SortitionMessage::new(vote_type, round, step, weighted_index);
        let sortition = Sortition::new(keypair, message)?;
        Self::new(keypair, sortition, value)
    }

    pub fn new(keypair: &KeyPair, sortition: Sortition, value: Hash) -> Result<Self, CoreError> {
        let signature = sign(&keypair.secret, &signing_bytes(&value, &sortition)?);
        Ok(Self::from_parts(value, sortition, signature))
    }

    /// Assemble a vote without signing. The result is only trustworthy
    /// after [`Vote::validate`].
    pub fn from_parts(value: Hash, sortition: Sortition, signature: Sig) -> Self {
        Vote {
            value,
            sortition,
            signature,
            hash: OnceLock::new(),
        }
    }

    /// Sortition proof, sortition weight and signature, in that order
    pub fn validate(&self, total_weight: u64, threshold: u64) -> Result<(), ConsensusError> {
        if !self.sortition.verify() {
            return Err(ConsensusError::InvalidSortitionProof(self.voter().to_hex()));
        }
        if !self.sortition.can_speak(threshold, total_weight) {
            return Err(ConsensusError::SortitionFailed(self.voter().to_hex()));
        }
        self.verify_signature()
    }

    pub fn verify_signature(&self) -> Result<(), ConsensusError> {
        let bytes = signing_bytes(&self.value, &self.sortition)?;
        verify(self.voter(), &bytes, &self.signature)
            .map_err(|_| ConsensusError::InvalidVoteSignature(self.voter().to_hex()))
    }

    /// Content hash of the full signed vote
    pub fn hash(&self) -> &Hash {
        self.hash.get_or_init(|| {
            let message = &self.sortition.message;
            hash_tagged(
                VOTE_DOMAIN,
                &[
                    self.value.as_bytes(),
                    self.sortition.voter.as_bytes(),
                    message.vote_type.as_str().as_bytes(),
                    &message.round.to_be_bytes(),
                    &message.step.to_be_bytes(),
                    &message.weighted_index.to_be_bytes(),
                    self.sortition.output.as_bytes(),
                    self.sortition.proof.as_bytes(),
                    self.signature.as_bytes(),
                ],
            )
        })
    }

    pub fn value(&self) -> &Hash {
        &self.value
    }

    pub fn voter(&self) -> &PublicKey {
        &self.sortition.voter
    }

    pub fn vote_type(&self) -> VoteType {
        self.sortition.message.vote_type
    }

    pub fn round(&self) -> Round {
        self.sortition.message.round
    }

    pub fn step(&self) -> Step {
        self.sortition.message.step
    }

    pub fn weighted_index(&self) -> u64 {
        self.sortition.message.weighted_index
    }

    /// Sortition output; the leader of a round is the proposal with the
    /// smallest credential
    pub fn credential(&self) -> &Hash {
        &self.sortition.output
    }

    pub fn sortition(&self) -> &Sortition {
        &self.sortition
    }

    pub fn signature(&self) -> &Sig {
        &self.signature
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        to_bytes(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        from_bytes(bytes)
    }
}

fn signing_bytes(value: &Hash, sortition: &Sortition) -> Result<Vec<u8>, CoreError> {
    to_bytes(&(VOTE_DOMAIN, value, sortition))
}

impl PartialEq for Vote {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for Vote {}

impl fmt::Debug for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vote")
            .field("hash", &self.hash().short())
            .field("type", &self.vote_type())
            .field("round", &self.round())
            .field("step", &self.step())
            .field("weighted_index", &self.weighted_index())
            .field("value", &self.value.short())
            .field("voter", &self.voter().short())
            .finish()
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} vote {} (round {}, step {}) for {} by {}",
            self.vote_type(),
            self.hash().short(),
            self.round(),
            self.step(),
            self.value.short(),
            self.voter().short()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordinal_core::hash_blake3;

    #[test]
    fn test_generated_vote_validates() {
        let kp = KeyPair::generate();
        let value = hash_blake3(b"block");
        let vote = Vote::generate(&kp, value, VoteType::Cert, 2, 3, 0).unwrap();

        assert!(vote.validate(4, 4).is_ok());
        assert_eq!(vote.voter(), &kp.public);
        assert_eq!(vote.value(), &value);
        assert_eq!(vote.vote_type(), VoteType::Cert);
        assert_eq!((vote.round(), vote.step(), vote.weighted_index()), (2, 3, 0));
    }

    #[test]
    fn test_wire_roundtrip_keeps_identity() {
        let kp = KeyPair::generate();
        let vote = Vote::generate(&kp, hash_blake3(b"v"), VoteType::Next, 7, 4, 1).unwrap();
        let decoded = Vote::from_bytes(&vote.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded.hash(), vote.hash());
        assert!(decoded.validate(10, 10).is_ok());
        assert_eq!(decoded.round(), 7);
        assert_eq!(decoded.step(), 4);
        assert_eq!(decoded.vote_type(), VoteType::Next);
    }

    #[test]
    fn test_swapped_value_rejected() {
        let kp = KeyPair::generate();
        let vote = Vote::generate(&kp, hash_blake3(b"a"), VoteType::Soft, 1, 2, 0).unwrap();
        let forged = Vote::from_parts(
            hash_blake3(b"b"),
            vote.sortition().clone(),
            *vote.signature(),
        );
        assert!(matches!(
            forged.validate(4, 4),
            Err(ConsensusError::InvalidVoteSignature(_))
        ));
        assert_ne!(forged.hash(), vote.hash());
    }

    #[test]
    fn test_forged_sortition_rejected() {
        let kp = KeyPair::generate();
        let vote = Vote::generate(&kp, hash_blake3(b"a"), VoteType::Soft, 1, 2, 0).unwrap();
        let mut sortition = vote.sortition().clone();
        sortition.message.round = 2;
        let forged = Vote::new(&kp, sortition, hash_blake3(b"a")).unwrap();
        assert!(matches!(
            forged.validate(4, 4),
            Err(ConsensusError::InvalidSortitionProof(_))
        ));
    }

    #[test]
    fn test_losing_sortition_rejected() {
        let kp = KeyPair::generate();
        // threshold 1 of a huge total: practically never selected
        let vote = Vote::generate(&kp, Hash::ZERO, VoteType::Propose, 1, 1, 0).unwrap();
        let total = u64::MAX;
        assert!(matches!(
            vote.validate(total, 1),
            Err(ConsensusError::SortitionFailed(_))
        ));
    }
}
