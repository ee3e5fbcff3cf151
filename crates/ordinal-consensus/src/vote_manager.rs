use ordinal_core::{Hash, PublicKey};
use ordinal_state::Storage;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{ConsensusDb, DbBatch};
use crate::error::ConsensusError;
use crate::types::{CertifiedValue, Round, VoteType};
use crate::vote::Vote;

type VoteMap = BTreeMap<Round, BTreeMap<Hash, Vote>>;

/// Step of the certify phase; cert votes are only valid there
pub const CERTIFY_STEP: u64 = 3;

/// Round-partitioned store of unverified and verified votes.
///
/// Votes are promoted from unverified to verified only by
/// [`VoteManager::get_verified_votes`].
pub struct VoteManager<S: Storage> {
    db: Arc<ConsensusDb<S>>,
    unverified: RwLock<VoteMap>,
    verified: RwLock<VoteMap>,
}

fn insert(map: &mut VoteMap, vote: Vote) -> bool {
    let by_hash = map.entry(vote.round()).or_default();
    if by_hash.contains_key(vote.hash()) {
        return false;
    }
    by_hash.insert(*vote.hash(), vote);
    true
}

fn contains(map: &VoteMap, hash: &Hash) -> bool {
    map.values().any(|by_hash| by_hash.contains_key(hash))
}

fn flatten(map: &VoteMap) -> Vec<Vote> {
    map.values().flat_map(|by_hash| by_hash.values().cloned()).collect()
}

impl<S: Storage> VoteManager<S> {
    /// Create the manager and reload both vote sets from `db`
    pub fn new(db: Arc<ConsensusDb<S>>) -> Result<Self, ConsensusError> {
        let mut unverified = VoteMap::new();
        for vote in db.unverified_votes()? {
            insert(&mut unverified, vote);
        }
        let mut verified = VoteMap::new();
        for vote in db.verified_votes()? {
            insert(&mut verified, vote);
        }
        let restored = (flatten(&unverified).len(), flatten(&verified).len());
        if restored != (0, 0) {
            info!(
                "Restored {} unverified and {} verified votes from storage",
                restored.0, restored.1
            );
        }
        Ok(VoteManager {
            db,
            unverified: RwLock::new(unverified),
            verified: RwLock::new(verified),
        })
    }

    /// Store a vote received from a peer. Returns false if it was already
    /// known in either set.
    pub fn add_unverified_vote(&self, vote: Vote) -> Result<bool, ConsensusError> {
        if self.is_known_vote(vote.hash()) {
            return Ok(false);
        }
        let mut batch = self.db.batch();
        batch.add_unverified_vote(&vote)?;
        self.db.commit(batch)?;
        Ok(insert(&mut self.unverified.write(), vote))
    }

    /// Returns the number of votes that were new
    pub fn add_unverified_votes(&self, votes: Vec<Vote>) -> Result<usize, ConsensusError> {
        let mut added = 0;
        for vote in votes {
            if self.add_unverified_vote(vote)? {
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn remove_unverified_vote(&self, round: Round, hash: &Hash) -> Result<(), ConsensusError> {
        let mut batch = self.db.batch();
        batch.remove_unverified_vote(hash);
        self.db.commit(batch)?;
        let mut unverified = self.unverified.write();
        if let Some(by_hash) = unverified.get_mut(&round) {
            by_hash.remove(hash);
            if by_hash.is_empty() {
                unverified.remove(&round);
            }
        }
        Ok(())
    }

    pub fn vote_in_unverified_map(&self, round: Round, hash: &Hash) -> bool {
        self.unverified
            .read()
            .get(&round)
            .is_some_and(|by_hash| by_hash.contains_key(hash))
    }

    pub fn unverified_votes(&self) -> Vec<Vote> {
        flatten(&self.unverified.read())
    }

    pub fn unverified_votes_size(&self) -> usize {
        self.unverified.read().values().map(|m| m.len()).sum()
    }

    pub fn clear_unverified_votes(&self) {
        self.unverified.write().clear();
    }

    /// Record one of our own votes. The caller persists it.
    pub fn add_verified_vote(&self, vote: Vote) -> bool {
        insert(&mut self.verified.write(), vote)
    }

    pub fn vote_in_verified_map(&self, round: Round, hash: &Hash) -> bool {
        self.verified
            .read()
            .get(&round)
            .is_some_and(|by_hash| by_hash.contains_key(hash))
    }

    /// Ordered by round, then by vote hash
    pub fn verified_votes(&self) -> Vec<Vote> {
        flatten(&self.verified.read())
    }

    pub fn verified_votes_size(&self) -> usize {
        self.verified.read().values().map(|m| m.len()).sum()
    }

    pub fn clear_verified_votes(&self) {
        self.verified.write().clear();
    }

    /// Drop every verified vote, in memory and storage. Called after a
    /// period is committed because the eligibility snapshot changes.
    pub fn remove_verified_votes(&self) -> Result<(), ConsensusError> {
        let votes = self.verified_votes();
        let mut batch = self.db.batch();
        for vote in &votes {
            batch.remove_verified_vote(vote.hash());
        }
        self.db.commit(batch)?;
        self.clear_verified_votes();
        debug!("Removed {} verified votes", votes.len());
        Ok(())
    }

    pub fn is_known_vote(&self, hash: &Hash) -> bool {
        if contains(&self.unverified.read(), hash) {
            return true;
        }
        contains(&self.verified.read(), hash)
    }

    /// Promote every unverified vote that passes validation and return the
    /// full verified set for rounds `>= round`.
    ///
    /// `weight_of` reports each voter's stake units; votes from voters with
    /// no weight, or with a weighted index beyond their weight, stay
    /// unverified and age out with their round. Votes that fail validation
    /// are dropped.
    pub fn get_verified_votes(
        &self,
        round: Round,
        sortition_threshold: u64,
        total_weight: u64,
        weight_of: impl Fn(&PublicKey) -> u64,
    ) -> Result<Vec<Vote>, ConsensusError> {
        self.cleanup_votes(round)?;

        let candidates = self.unverified_votes();
        let mut promoted = Vec::new();
        let mut rejected = Vec::new();
        for vote in candidates {
            let weight = weight_of(vote.voter());
            if vote.weighted_index() >= weight {
                continue;
            }
            match vote.validate(total_weight, sortition_threshold) {
                Ok(()) => promoted.push(vote),
                Err(err) => {
                    warn!("Dropping {}: {}", vote, err);
                    rejected.push(vote);
                }
            }
        }

        if !promoted.is_empty() || !rejected.is_empty() {
            let mut batch = self.db.batch();
            for vote in &promoted {
                batch.add_verified_vote(vote)?;
                batch.remove_unverified_vote(vote.hash());
            }
            for vote in &rejected {
                batch.remove_unverified_vote(vote.hash());
            }
            self.db.commit(batch)?;

            let mut unverified = self.unverified.write();
            for vote in promoted.iter().chain(rejected.iter()) {
                if let Some(by_hash) = unverified.get_mut(&vote.round()) {
                    by_hash.remove(vote.hash());
                }
            }
            unverified.retain(|_, by_hash| !by_hash.is_empty());
            drop(unverified);

            let mut verified = self.verified.write();
            for vote in promoted {
                insert(&mut verified, vote);
            }
        }

        Ok(self.verified_votes())
    }

    /// Evict every vote of a round strictly below `round`
    pub fn cleanup_votes(&self, round: Round) -> Result<(), ConsensusError> {
        self.evict(&self.unverified, round, DbBatch::remove_unverified_vote)?;
        self.evict(&self.verified, round, DbBatch::remove_verified_vote)
    }

    /// Storage and memory are updated under one write lock so a vote
    /// inserted concurrently is either evicted from both or kept in both.
    fn evict(
        &self,
        votes: &RwLock<VoteMap>,
        round: Round,
        remove: fn(&mut DbBatch, &Hash),
    ) -> Result<(), ConsensusError> {
        let mut map = votes.write();
        let mut batch = self.db.batch();
        let mut stale = 0;
        for hash in map.range(..round).flat_map(|(_, by_hash)| by_hash.keys()) {
            remove(&mut batch, hash);
            stale += 1;
        }
        if stale == 0 {
            return Ok(());
        }
        self.db.commit(batch)?;
        *map = map.split_off(&round);
        Ok(())
    }

    /// Independently re-validate the cert votes attached to a synced value.
    ///
    /// Counting stops at the first vote that is not a cert vote for
    /// `certified.value` at step 3 of the first vote's round. Each
    /// (voter, weighted index) counts once.
    pub fn pbft_block_has_enough_valid_cert_votes(
        &self,
        certified: &CertifiedValue,
        total_weight: u64,
        sortition_threshold: u64,
        two_t_plus_one: u64,
        weight_of: impl Fn(&PublicKey) -> u64,
    ) -> bool {
        let Some(first) = certified.cert_votes.first() else {
            return false;
        };
        let round = first.round();
        let mut counted: HashSet<(PublicKey, u64)> = HashSet::new();

        for vote in &certified.cert_votes {
            if vote.vote_type() != VoteType::Cert
                || vote.round() != round
                || vote.step() != CERTIFY_STEP
                || vote.value() != &certified.value
            {
                warn!(
                    "Synced value {} carries a foreign vote {}",
                    certified.value.short(),
                    vote
                );
                break;
            }
            if vote.weighted_index() >= weight_of(vote.voter()) {
                continue;
            }
            if let Err(err) = vote.validate(total_weight, sortition_threshold) {
                warn!("Synced cert {} invalid: {}", vote, err);
                continue;
            }
            counted.insert((*vote.voter(), vote.weighted_index()));
        }

        let enough = counted.len() as u64 >= two_t_plus_one;
        if !enough {
            warn!(
                "Synced value {} has {} valid cert votes, need {}",
                certified.value.short(),
                counted.len(),
                two_t_plus_one
            );
        }
        enough
    }

    /// JSON dump of `votes` for diagnostics
    pub fn votes_json(votes: &[Vote]) -> Result<String, ConsensusError> {
        let entries: Vec<serde_json::Value> = votes
            .iter()
            .map(|v| {
                serde_json::json!({
                    "hash": v.hash().to_hex(),
                    "voter": v.voter().to_hex(),
                    "type": v.vote_type().as_str(),
                    "round": v.round(),
                    "step": v.step(),
                    "weighted_index": v.weighted_index(),
                    "value": v.value().to_hex(),
                })
            })
            .collect();
        serde_json::to_string_pretty(&entries)
            .map_err(|e| ordinal_core::CoreError::Serialization(e.to_string()).into())
    }
}
