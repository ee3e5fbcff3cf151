use serde::{Deserialize, Serialize};

use crate::crypto::{hash_blake3, sign, verify, Hash, KeyPair, PublicKey, Sig};
use crate::error::CoreError;
use crate::serialize::to_bytes;

/// Period number: the index of a finalized value in the canonical chain.
pub type Period = u64;

/// Proposal content identified by its hash. Consensus only handles the hash;
/// the content is carried and validated by the value source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalHeader {
    /// Hash of the previously finalized proposal (ZERO at genesis)
    pub prev_hash: Hash,
    /// Anchor into the ordered content this proposal finalizes
    pub anchor: Hash,
    pub period: Period,
    pub proposer: PublicKey,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub header: ProposalHeader,
    pub signature: Sig,
}

impl ProposalHeader {
    pub fn hash(&self) -> Result<Hash, CoreError> {
        Ok(hash_blake3(&to_bytes(self)?))
    }
}

impl Proposal {
    pub fn new_signed(header: ProposalHeader, keypair: &KeyPair) -> Result<Self, CoreError> {
        let signature = sign(&keypair.secret, &to_bytes(&header)?);
        Ok(Proposal { header, signature })
    }

    /// Identity of the proposal. Covers the signature so two proposers
    /// building on the same anchor never collide.
    pub fn hash(&self) -> Result<Hash, CoreError> {
        Ok(hash_blake3(&to_bytes(self)?))
    }

    pub fn verify_signature(&self) -> Result<(), CoreError> {
        verify(&self.header.proposer, &to_bytes(&self.header)?, &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(proposer: PublicKey, period: Period) -> ProposalHeader {
        ProposalHeader {
            prev_hash: Hash::ZERO,
            anchor: hash_blake3(b"anchor"),
            period,
            proposer,
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_signed_proposal_verifies() {
        let kp = KeyPair::generate();
        let proposal = Proposal::new_signed(header(kp.public, 1), &kp).unwrap();
        assert!(proposal.verify_signature().is_ok());
        assert_ne!(proposal.hash().unwrap(), Hash::ZERO);
    }

    #[test]
    fn test_forged_proposer_rejected() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let mut proposal = Proposal::new_signed(header(kp.public, 1), &kp).unwrap();
        proposal.header.proposer = other.public;
        assert!(proposal.verify_signature().is_err());
    }

    #[test]
    fn test_distinct_proposers_distinct_hashes() {
        let a = KeyPair::from_seed("proposal", 0);
        let b = KeyPair::from_seed("proposal", 1);
        let pa = Proposal::new_signed(header(a.public, 3), &a).unwrap();
        let pb = Proposal::new_signed(header(b.public, 3), &b).unwrap();
        assert_ne!(pa.hash().unwrap(), pb.hash().unwrap());
    }
}
