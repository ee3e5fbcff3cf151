use ordinal_core::Period;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Invalid sortition proof from {0}")]
    InvalidSortitionProof(String),

    #[error("Sortition does not allow {0} to speak")]
    SortitionFailed(String),

    #[error("Invalid vote signature from {0}")]
    InvalidVoteSignature(String),

    #[error("Mixed vote batch: {0}")]
    MixedVoteBatch(String),

    #[error("Voter {voter} is not eligible at weighted index {weighted_index}")]
    NotEligible { voter: String, weighted_index: u64 },

    #[error("Value {0} is not available locally")]
    ValueUnavailable(String),

    #[error("Stake snapshot for period {0} is not available yet")]
    FutureSnapshot(Period),

    #[error("Consensus invariant violated: {0}")]
    InvariantViolation(String),

    #[error("State error: {0}")]
    State(#[from] ordinal_state::StateError),

    #[error("Core error: {0}")]
    Core(#[from] ordinal_core::CoreError),
}

impl ConsensusError {
    /// Errors after which the driver must not continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConsensusError::InvariantViolation(_) | ConsensusError::State(_)
        )
    }

    /// Errors caused by data a peer sent us. The transport may penalize the sender.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            ConsensusError::InvalidSortitionProof(_)
                | ConsensusError::SortitionFailed(_)
                | ConsensusError::InvalidVoteSignature(_)
                | ConsensusError::MixedVoteBatch(_)
                | ConsensusError::NotEligible { .. }
        )
    }
}
