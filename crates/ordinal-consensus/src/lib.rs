//! Ordinal Consensus - round/step PBFT finality over an anchor DAG
//!
//! Validators are selected per step by a verifiable sortition over their
//! stake units. Votes flow through the [`VoteManager`], quorums are tallied
//! by [`quorum`], and the [`PbftManager`] drives the propose, filter,
//! certify and finish phases of every round.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod next_votes;
pub mod pbft_manager;
pub mod quorum;
pub mod sortition;
pub mod traits;
pub mod types;
pub mod vote;
pub mod vote_manager;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PbftConfig;
pub use db::{ConsensusDb, DbBatch, PbftStatus, PbftVotedValue};
pub use error::ConsensusError;
pub use next_votes::NextVotesForPreviousRound;
pub use pbft_manager::{PbftContext, PbftHandle, PbftManager};
pub use quorum::{block_with_enough_votes, filter_votes, sortition_threshold, two_t_plus_one};
pub use sortition::{Sortition, SortitionMessage};
pub use traits::{Eligibility, Transport, ValueSource};
pub use types::{
    CertifiedValue, PbftState, Round, Step, SyncReason, VoteType, VotesBundle, NULL_BLOCK_HASH,
};
pub use vote::Vote;
pub use vote_manager::{VoteManager, CERTIFY_STEP};
