use ordinal_core::{Hash, PublicKey};
use std::collections::{HashMap, HashSet};
use tracing::error;

use crate::error::ConsensusError;
use crate::types::{Round, Step, VoteType, VotesBundle, NULL_BLOCK_HASH};
use crate::vote::Vote;

/// Expected number of sortition winners per step
pub fn sortition_threshold(committee_size: u64, total_weight: u64) -> u64 {
    committee_size.min(total_weight)
}

/// Smallest vote count that any two quorums must overlap in.
///
/// Computed as `floor(2C/3) + 1` over the sortition threshold `C`. For
/// `C` not of the form `3t + 1` this is stricter than `2 * floor((C - 1) / 3) + 1`
/// (e.g. 5 rather than 3 at `C = 6`).
pub fn two_t_plus_one(sortition_threshold: u64) -> u64 {
    sortition_threshold * 2 / 3 + 1
}

/// Votes of one type cast at one (round, step)
pub fn filter_votes(votes: &[Vote], vote_type: VoteType, round: Round, step: Step) -> Vec<Vote> {
    votes
        .iter()
        .filter(|v| v.vote_type() == vote_type && v.round() == round && v.step() == step)
        .cloned()
        .collect()
}

/// Tally a homogeneous vote set and report the first value whose group
/// reaches exactly `two_t_plus_one` votes.
///
/// A (voter, weighted index) pair counts once per value. Two distinct
/// concrete values both reaching quorum cannot happen with at most `t`
/// faulty voters and is reported as an invariant violation.
pub fn block_with_enough_votes(
    votes: &[Vote],
    two_t_plus_one: u64,
) -> Result<VotesBundle, ConsensusError> {
    let Some(first) = votes.first() else {
        return Ok(VotesBundle::default());
    };
    let (vote_type, round, step) = (first.vote_type(), first.round(), first.step());
    if let Some(stray) = votes
        .iter()
        .find(|v| v.vote_type() != vote_type || v.round() != round || v.step() != step)
    {
        return Err(ConsensusError::InvariantViolation(format!(
            "tally of {} votes at round {} step {} received {}",
            vote_type, round, step, stray
        )));
    }

    let mut seen: HashSet<(Hash, PublicKey, u64)> = HashSet::new();
    let mut groups: HashMap<Hash, Vec<Vote>> = HashMap::new();
    let mut winner: Option<Hash> = None;

    for vote in votes {
        if !seen.insert((*vote.value(), *vote.voter(), vote.weighted_index())) {
            continue;
        }
        let group = groups.entry(*vote.value()).or_default();
        group.push(vote.clone());
        if winner.is_none() && group.len() as u64 == two_t_plus_one {
            winner = Some(*vote.value());
        }
    }

    let Some(value) = winner else {
        return Ok(VotesBundle::default());
    };

    let quorate_concrete: Vec<&Hash> = groups
        .iter()
        .filter(|(v, g)| **v != NULL_BLOCK_HASH && g.len() as u64 >= two_t_plus_one)
        .map(|(v, _)| v)
        .collect();
    if quorate_concrete.len() > 1 {
        error!(
            "Conflicting {} quorums at round {} step {}: {:?}",
            vote_type, round, step, quorate_concrete
        );
        return Err(ConsensusError::InvariantViolation(format!(
            "{} distinct values reached {} quorum at round {} step {}",
            quorate_concrete.len(),
            vote_type,
            round,
            step
        )));
    }

    let mut votes = groups.remove(&value).unwrap_or_default();
    votes.truncate(two_t_plus_one as usize);
    Ok(VotesBundle {
        enough: true,
        value,
        votes,
    })
}
