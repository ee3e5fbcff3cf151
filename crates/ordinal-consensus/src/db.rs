//! Typed consensus persistence on top of a [`Storage`] backend.
//!
//! Every logical transition of the driver is written through one
//! [`DbBatch`], committed atomically by [`ConsensusDb::commit`].

use ordinal_core::serialize::{from_bytes, to_bytes};
use ordinal_core::{Hash, Period};
use ordinal_state::{StateError, Storage, WriteBatch};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::ConsensusError;
use crate::types::{CertifiedValue, Round, Step};
use crate::vote::Vote;

mod keys {
    pub const ROUND: &[u8] = b"pbft:round";
    pub const STEP: &[u8] = b"pbft:step";
    pub const STATUS: &[u8] = b"pbft:status:";
    pub const VOTED_VALUE: &[u8] = b"pbft:value:";
    pub const VERIFIED_VOTE: &[u8] = b"vote:verified:";
    pub const UNVERIFIED_VOTE: &[u8] = b"vote:unverified:";
    pub const NEXT_VOTES: &[u8] = b"round:next:";
    pub const SOFT_VOTES: &[u8] = b"round:soft:";
    pub const TWO_T_PLUS_ONE: &[u8] = b"round:2t1:";
    pub const CHAIN_HEAD: &[u8] = b"chain:head";
    pub const CERTIFIED: &[u8] = b"chain:certified:";
}

/// Boolean flags of the current round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PbftStatus {
    ExecutedInRound,
    ExecutedBlock,
    SoftVotedBlockInRound,
    NextVotedSoftValue,
    NextVotedNullBlockHash,
}

impl PbftStatus {
    fn name(&self) -> &'static [u8] {
        match self {
            PbftStatus::ExecutedInRound => b"executed_in_round",
            PbftStatus::ExecutedBlock => b"executed_block",
            PbftStatus::SoftVotedBlockInRound => b"soft_voted_block_in_round",
            PbftStatus::NextVotedSoftValue => b"next_voted_soft_value",
            PbftStatus::NextVotedNullBlockHash => b"next_voted_null_block_hash",
        }
    }
}

/// Values the node has voted for in the current round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PbftVotedValue {
    OwnStartingValueInRound,
    SoftVotedBlockHashInRound,
    LastCertVotedValue,
}

impl PbftVotedValue {
    fn name(&self) -> &'static [u8] {
        match self {
            PbftVotedValue::OwnStartingValueInRound => b"own_starting_value",
            PbftVotedValue::SoftVotedBlockHashInRound => b"soft_voted_value",
            PbftVotedValue::LastCertVotedValue => b"last_cert_voted_value",
        }
    }
}

fn key(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix);
    key
}

fn round_key(prefix: &[u8], round: Round) -> Vec<u8> {
    key(prefix, &round.to_be_bytes())
}

/// Typed writes staged for one atomic commit
#[derive(Debug, Default)]
pub struct DbBatch {
    inner: WriteBatch,
}

impl DbBatch {
    fn put<T: Serialize>(&mut self, key: Vec<u8>, value: &T) -> Result<(), ConsensusError> {
        self.inner.put(key, to_bytes(value)?);
        Ok(())
    }

    pub fn set_round(&mut self, round: Round) -> Result<(), ConsensusError> {
        self.put(keys::ROUND.to_vec(), &round)
    }

    pub fn set_step(&mut self, step: Step) -> Result<(), ConsensusError> {
        self.put(keys::STEP.to_vec(), &step)
    }

    pub fn set_status(&mut self, status: PbftStatus, value: bool) -> Result<(), ConsensusError> {
        self.put(key(keys::STATUS, status.name()), &value)
    }

    pub fn set_voted_value(&mut self, field: PbftVotedValue, value: Hash) -> Result<(), ConsensusError> {
        self.put(key(keys::VOTED_VALUE, field.name()), &value)
    }

    pub fn add_verified_vote(&mut self, vote: &Vote) -> Result<(), ConsensusError> {
        self.inner
            .put(key(keys::VERIFIED_VOTE, vote.hash().as_bytes()), vote.to_bytes()?);
        Ok(())
    }

    pub fn remove_verified_vote(&mut self, hash: &Hash) {
        self.inner.delete(key(keys::VERIFIED_VOTE, hash.as_bytes()));
    }

    pub fn add_unverified_vote(&mut self, vote: &Vote) -> Result<(), ConsensusError> {
        self.inner
            .put(key(keys::UNVERIFIED_VOTE, vote.hash().as_bytes()), vote.to_bytes()?);
        Ok(())
    }

    pub fn remove_unverified_vote(&mut self, hash: &Hash) {
        self.inner.delete(key(keys::UNVERIFIED_VOTE, hash.as_bytes()));
    }

    pub fn set_next_votes(&mut self, round: Round, votes: &[Vote]) -> Result<(), ConsensusError> {
        self.put(round_key(keys::NEXT_VOTES, round), &votes.to_vec())
    }

    pub fn remove_next_votes(&mut self, round: Round) {
        self.inner.delete(round_key(keys::NEXT_VOTES, round));
    }

    pub fn set_soft_votes(&mut self, round: Round, votes: &[Vote]) -> Result<(), ConsensusError> {
        self.put(round_key(keys::SOFT_VOTES, round), &votes.to_vec())
    }

    pub fn remove_soft_votes(&mut self, round: Round) {
        self.inner.delete(round_key(keys::SOFT_VOTES, round));
    }

    pub fn set_two_t_plus_one(&mut self, round: Round, value: u64) -> Result<(), ConsensusError> {
        self.put(round_key(keys::TWO_T_PLUS_ONE, round), &value)
    }

    pub fn set_chain_head(&mut self, period: Period, value: Hash) -> Result<(), ConsensusError> {
        self.put(keys::CHAIN_HEAD.to_vec(), &(period, value))
    }

    pub fn set_certified_value(
        &mut self,
        period: Period,
        certified: &CertifiedValue,
    ) -> Result<(), ConsensusError> {
        self.put(key(keys::CERTIFIED, &period.to_be_bytes()), certified)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Consensus database. Cheap to share behind an `Arc`; writes are
/// serialized by an internal lock.
pub struct ConsensusDb<S: Storage> {
    storage: Mutex<S>,
}

impl<S: Storage> ConsensusDb<S> {
    pub fn new(storage: S) -> Self {
        ConsensusDb {
            storage: Mutex::new(storage),
        }
    }

    pub fn batch(&self) -> DbBatch {
        DbBatch::default()
    }

    pub fn commit(&self, batch: DbBatch) -> Result<(), ConsensusError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.storage.lock().write(batch.inner)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, ConsensusError> {
        let bytes = self.storage.lock().get(key);
        match bytes {
            Some(bytes) => Ok(Some(from_bytes(&bytes).map_err(|_| corrupted(key))?)),
            None => Ok(None),
        }
    }

    fn votes_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vote>, ConsensusError> {
        let pairs = self.storage.lock().scan_prefix(prefix);
        pairs
            .iter()
            .map(|(k, v)| Vote::from_bytes(v).map_err(|_| corrupted(k)))
            .collect()
    }

    pub fn round(&self) -> Result<Option<Round>, ConsensusError> {
        self.get(keys::ROUND)
    }

    pub fn step(&self) -> Result<Option<Step>, ConsensusError> {
        self.get(keys::STEP)
    }

    pub fn status(&self, status: PbftStatus) -> Result<bool, ConsensusError> {
        Ok(self
            .get(&key(keys::STATUS, status.name()))?
            .unwrap_or(false))
    }

    pub fn voted_value(&self, field: PbftVotedValue) -> Result<Option<Hash>, ConsensusError> {
        self.get(&key(keys::VOTED_VALUE, field.name()))
    }

    pub fn verified_votes(&self) -> Result<Vec<Vote>, ConsensusError> {
        self.votes_with_prefix(keys::VERIFIED_VOTE)
    }

    pub fn unverified_votes(&self) -> Result<Vec<Vote>, ConsensusError> {
        self.votes_with_prefix(keys::UNVERIFIED_VOTE)
    }

    pub fn next_votes(&self, round: Round) -> Result<Vec<Vote>, ConsensusError> {
        Ok(self
            .get(&round_key(keys::NEXT_VOTES, round))?
            .unwrap_or_default())
    }

    pub fn soft_votes(&self, round: Round) -> Result<Vec<Vote>, ConsensusError> {
        Ok(self
            .get(&round_key(keys::SOFT_VOTES, round))?
            .unwrap_or_default())
    }

    pub fn two_t_plus_one(&self, round: Round) -> Result<Option<u64>, ConsensusError> {
        self.get(&round_key(keys::TWO_T_PLUS_ONE, round))
    }

    pub fn chain_head(&self) -> Result<Option<(Period, Hash)>, ConsensusError> {
        self.get(keys::CHAIN_HEAD)
    }

    pub fn certified_value(&self, period: Period) -> Result<Option<CertifiedValue>, ConsensusError> {
        self.get(&key(keys::CERTIFIED, &period.to_be_bytes()))
    }

    pub fn save_round(&self, round: Round) -> Result<(), ConsensusError> {
        let mut batch = self.batch();
        batch.set_round(round)?;
        self.commit(batch)
    }

    pub fn save_step(&self, step: Step) -> Result<(), ConsensusError> {
        let mut batch = self.batch();
        batch.set_step(step)?;
        self.commit(batch)
    }

    pub fn save_status(&self, status: PbftStatus, value: bool) -> Result<(), ConsensusError> {
        let mut batch = self.batch();
        batch.set_status(status, value)?;
        self.commit(batch)
    }

    pub fn save_voted_value(&self, field: PbftVotedValue, value: Hash) -> Result<(), ConsensusError> {
        let mut batch = self.batch();
        batch.set_voted_value(field, value)?;
        self.commit(batch)
    }

    /// Append `votes` to the stored next votes of `round`, skipping known ones
    pub fn append_next_votes(&self, round: Round, votes: &[Vote]) -> Result<(), ConsensusError> {
        let mut stored = self.next_votes(round)?;
        for vote in votes {
            if !stored.iter().any(|v| v.hash() == vote.hash()) {
                stored.push(vote.clone());
            }
        }
        let mut batch = self.batch();
        batch.set_next_votes(round, &stored)?;
        self.commit(batch)
    }
}

fn corrupted(key: &[u8]) -> ConsensusError {
    ConsensusError::State(StateError::Corrupted(String::from_utf8_lossy(key).into_owned()))
}
