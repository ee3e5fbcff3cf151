use ordinal_core::Hash;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::vote::Vote;

pub type Round = u64;
pub type Step = u64;

/// The NULL value: "agree on nothing this round"
pub const NULL_BLOCK_HASH: Hash = Hash::ZERO;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VoteType {
    Propose,
    Soft,
    Cert,
    Next,
}

impl VoteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteType::Propose => "propose",
            VoteType::Soft => "soft",
            VoteType::Cert => "cert",
            VoteType::Next => "next",
        }
    }
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of the round/step state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PbftState {
    ValuePropose,
    Filter,
    Certify,
    FirstFinish,
    SecondFinish,
}

impl fmt::Display for PbftState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PbftState::ValuePropose => "value-propose",
            PbftState::Filter => "filter",
            PbftState::Certify => "certify",
            PbftState::FirstFinish => "first-finish",
            PbftState::SecondFinish => "second-finish",
        };
        f.write_str(name)
    }
}

/// Why the driver asks the transport to sync with peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncReason {
    MissingContent,
    InvalidCertVotedValue,
    InvalidSoftVotedValue,
    ExceededMaxSteps,
}

/// Result of tallying one homogeneous vote set
#[derive(Debug, Clone, Default)]
pub struct VotesBundle {
    pub enough: bool,
    pub value: Hash,
    pub votes: Vec<Vote>,
}

/// A finalized value together with the cert votes that finalized it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertifiedValue {
    pub value: Hash,
    pub cert_votes: Vec<Vote>,
}
