//! Contracts between the consensus core and the rest of the node.

use ordinal_core::{Hash, Period, PublicKey};

use crate::error::ConsensusError;
use crate::types::{CertifiedValue, Round, SyncReason};
use crate::vote::Vote;

/// Source of candidate values and the canonical chain they are committed to
pub trait ValueSource: Send + Sync {
    /// A fresh value to propose in `round`, or None when there is nothing new
    fn candidate_value(&self, round: Round) -> Option<Hash>;

    /// Whether the content behind `value` and everything it references is held locally
    fn is_value_available(&self, value: &Hash) -> bool;

    /// Whether `value` may be committed on top of the current chain head
    fn is_value_valid(&self, value: &Hash) -> bool;

    /// Whether `value` is already part of the canonical chain
    fn is_finalized(&self, value: &Hash) -> bool;

    /// Number of finalized values
    fn finalized_period(&self) -> Period;

    /// Most recently finalized value, NULL at genesis
    fn last_finalized_value(&self) -> Hash;

    /// Append `value` to the chain and execute it. Returns the new period.
    fn commit(&self, value: &Hash, cert_votes: &[Vote]) -> Result<Period, ConsensusError>;

    /// Oldest certified value obtained through chain sync, if any
    fn next_synced(&self) -> Option<CertifiedValue> {
        None
    }

    /// Drop the value returned by the last `next_synced`
    fn pop_synced(&self) {}

    /// Drop every queued synced value
    fn clear_synced(&self) {}
}

/// Delegated-stake snapshot
pub trait Eligibility: Send + Sync {
    /// Fails with [`ConsensusError::FutureSnapshot`] while `period` is not
    /// known yet; the caller retries.
    fn total_weight(&self, period: Period) -> Result<u64, ConsensusError>;

    fn weight_of(&self, validator: &PublicKey, period: Period) -> Result<u64, ConsensusError>;
}

/// Fire-and-forget outbound messages
pub trait Transport: Send + Sync {
    fn broadcast_votes(&self, votes: Vec<Vote>);

    fn broadcast_value(&self, value: &Hash);

    /// Previous-round next votes, so that lagging peers can change round
    fn broadcast_next_votes_bundle(&self, votes: Vec<Vote>);

    fn request_sync(&self, reason: SyncReason, hint: &Hash);

    fn is_syncing(&self) -> bool {
        false
    }
}
