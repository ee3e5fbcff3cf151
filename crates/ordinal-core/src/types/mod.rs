pub mod block;
pub mod stake;

pub use block::{Period, Proposal, ProposalHeader};
pub use stake::{StakeEntry, StakeSnapshot};
