//! Next votes of the previous completed round.
//!
//! At most two values may legitimately reach next-vote quorum in one
//! round: NULL and a single concrete value. The tracker replaces its state
//! wholesale when the round advances and merges late votes for the same
//! round incrementally.

use ordinal_core::Hash;
use ordinal_state::Storage;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::db::ConsensusDb;
use crate::error::ConsensusError;
use crate::types::{Round, Step, VoteType, NULL_BLOCK_HASH};
use crate::vote::Vote;

#[derive(Debug, Default)]
struct Inner {
    enough_votes_for_null: bool,
    voted_value: Hash,
    next_votes: BTreeMap<Hash, Vec<Vote>>,
    known: HashSet<Hash>,
}

impl Inner {
    fn round(&self) -> Option<Round> {
        self.next_votes
            .values()
            .flat_map(|votes| votes.first())
            .map(|v| v.round())
            .next()
    }

    fn insert(&mut self, vote: Vote) -> bool {
        if !self.known.insert(*vote.hash()) {
            return false;
        }
        self.next_votes.entry(*vote.value()).or_default().push(vote);
        true
    }

    /// Derive the flags from the retained groups and check the two-value rule
    fn settle(&mut self, round: Round) -> Result<(), ConsensusError> {
        self.enough_votes_for_null = self.next_votes.contains_key(&NULL_BLOCK_HASH);
        let concrete: Vec<Hash> = self
            .next_votes
            .keys()
            .filter(|v| **v != NULL_BLOCK_HASH)
            .copied()
            .collect();
        if concrete.len() > 1 {
            error!(
                "More than one concrete value reached next-vote quorum in round {}: {:?}",
                round, concrete
            );
            return Err(ConsensusError::InvariantViolation(format!(
                "{} values reached next-vote quorum in round {}",
                self.next_votes.len(),
                round
            )));
        }
        self.voted_value = concrete.first().copied().unwrap_or(NULL_BLOCK_HASH);
        Ok(())
    }
}

/// Group by value, counting each (voter, weighted index) once per value
fn group_by_value(votes: &[Vote]) -> HashMap<Hash, Vec<Vote>> {
    let mut groups: HashMap<Hash, Vec<Vote>> = HashMap::new();
    let mut seen = HashSet::new();
    for vote in votes {
        if seen.insert((*vote.value(), *vote.voter(), vote.weighted_index())) {
            groups.entry(*vote.value()).or_default().push(vote.clone());
        }
    }
    groups
}

pub struct NextVotesForPreviousRound<S: Storage> {
    db: Arc<ConsensusDb<S>>,
    inner: RwLock<Inner>,
}

impl<S: Storage> NextVotesForPreviousRound<S> {
    pub fn new(db: Arc<ConsensusDb<S>>) -> Self {
        NextVotesForPreviousRound {
            db,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn clear(&self) {
        *self.inner.write() = Inner::default();
    }

    pub fn find(&self, vote_hash: &Hash) -> bool {
        self.inner.read().known.contains(vote_hash)
    }

    /// Quorum on NULL and on a concrete value: nothing more can be learned
    pub fn enough_next_votes(&self) -> bool {
        let inner = self.inner.read();
        inner.enough_votes_for_null && inner.voted_value != NULL_BLOCK_HASH
    }

    pub fn have_enough_votes_for_null_block_hash(&self) -> bool {
        self.inner.read().enough_votes_for_null
    }

    /// Concrete value that reached quorum, or NULL
    pub fn get_voted_value(&self) -> Hash {
        self.inner.read().voted_value
    }

    pub fn get_next_votes(&self) -> Vec<Vote> {
        self.inner
            .read()
            .next_votes
            .values()
            .flat_map(|votes| votes.iter().cloned())
            .collect()
    }

    pub fn get_next_votes_size(&self) -> usize {
        self.inner.read().known.len()
    }

    /// Round the tracked votes belong to
    pub fn round(&self) -> Option<Round> {
        self.inner.read().round()
    }

    /// Replace the state with the quorate groups of `votes`, the next votes
    /// of one completed round
    pub fn update(&self, votes: &[Vote], two_t_plus_one: u64) -> Result<(), ConsensusError> {
        let Some(first) = votes.first() else {
            return Err(ConsensusError::InvariantViolation(
                "next votes update without votes".to_string(),
            ));
        };
        let round = first.round();
        if votes.iter().any(|v| v.round() != round || v.vote_type() != VoteType::Next) {
            return Err(ConsensusError::InvariantViolation(format!(
                "next votes update for round {} mixes rounds or vote types",
                round
            )));
        }

        let mut fresh = Inner::default();
        for (_, group) in group_by_value(votes) {
            if group.len() as u64 >= two_t_plus_one {
                for vote in group {
                    fresh.insert(vote);
                }
            }
        }
        if fresh.next_votes.is_empty() {
            return Err(ConsensusError::InvariantViolation(format!(
                "no value reached next-vote quorum {} in round {}",
                two_t_plus_one, round
            )));
        }
        fresh.settle(round)?;

        info!(
            "Next votes of round {}: null quorum {}, voted value {}",
            round,
            fresh.enough_votes_for_null,
            fresh.voted_value.short()
        );
        *self.inner.write() = fresh;
        Ok(())
    }

    /// Merge further next votes of the tracked round
    pub fn add_next_votes(&self, votes: &[Vote], two_t_plus_one: u64) -> Result<(), ConsensusError> {
        if votes.is_empty() {
            return Ok(());
        }
        if self.enough_next_votes() {
            debug!("Already holding both next-voted values, ignoring {} votes", votes.len());
            return Ok(());
        }

        let mut inner = self.inner.write();
        let round = votes[0].round();
        if let Some(tracked) = inner.round() {
            if tracked != round {
                warn!(
                    "Ignoring next votes of round {}, tracking round {}",
                    round, tracked
                );
                return Ok(());
            }
        }
        if votes.iter().any(|v| v.round() != round || v.vote_type() != VoteType::Next) {
            return Err(ConsensusError::MixedVoteBatch(format!(
                "next votes for round {} mix rounds or vote types",
                round
            )));
        }

        let mut staged = Inner {
            enough_votes_for_null: false,
            voted_value: NULL_BLOCK_HASH,
            next_votes: inner.next_votes.clone(),
            known: inner.known.clone(),
        };
        for vote in votes {
            staged.insert(vote.clone());
        }
        staged.next_votes.retain(|_, group| {
            let voters: HashSet<_> = group.iter().map(|v| (*v.voter(), v.weighted_index())).collect();
            voters.len() as u64 >= two_t_plus_one
        });
        staged.known = staged
            .next_votes
            .values()
            .flat_map(|g| g.iter().map(|v| *v.hash()))
            .collect();
        staged.settle(round)?;

        *inner = staged;
        Ok(())
    }

    /// Merge next votes a peer sent in answer to a sync request.
    ///
    /// Ignored while nothing is tracked yet, so a freshly started node
    /// cannot be seeded by a single peer.
    pub fn update_with_synced_votes(
        &self,
        votes: &[Vote],
        two_t_plus_one: u64,
    ) -> Result<(), ConsensusError> {
        if self.get_next_votes_size() == 0 {
            debug!("No next votes tracked yet, ignoring {} synced votes", votes.len());
            return Ok(());
        }
        let Some(first) = votes.first() else {
            return Ok(());
        };
        let round = first.round();

        let mut value_steps: HashMap<Hash, Step> = HashMap::new();
        for vote in votes {
            if vote.vote_type() != VoteType::Next {
                return Err(ConsensusError::MixedVoteBatch(format!(
                    "synced next votes contain a {} vote",
                    vote.vote_type()
                )));
            }
            if vote.round() != round {
                return Err(ConsensusError::MixedVoteBatch(format!(
                    "synced next votes span rounds {} and {}",
                    round,
                    vote.round()
                )));
            }
            let step = *value_steps.entry(*vote.value()).or_insert(vote.step());
            if step != vote.step() {
                return Err(ConsensusError::MixedVoteBatch(format!(
                    "synced next votes for {} span steps {} and {}",
                    vote.value().short(),
                    step,
                    vote.step()
                )));
            }
        }
        if value_steps.len() > 2 {
            return Err(ConsensusError::MixedVoteBatch(format!(
                "synced next votes carry {} values",
                value_steps.len()
            )));
        }

        let held: HashSet<Hash> = self.inner.read().next_votes.keys().copied().collect();
        let mut adopted = Vec::new();
        for (value, group) in group_by_value(votes) {
            if held.contains(&value) {
                continue;
            }
            if (group.len() as u64) < two_t_plus_one {
                debug!(
                    "Synced next votes for {} below quorum ({} of {})",
                    value.short(),
                    group.len(),
                    two_t_plus_one
                );
                continue;
            }
            adopted.extend(group);
        }
        if adopted.is_empty() {
            return Ok(());
        }

        self.db.append_next_votes(round, &adopted)?;
        self.add_next_votes(&adopted, two_t_plus_one)
    }
}
