use ordinal_core::{Hash, KeyPair, Period};
use ordinal_state::Storage;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::error::ConsensusError;
use crate::next_votes::NextVotesForPreviousRound;
use crate::sortition::{Sortition, SortitionMessage};
use crate::traits::Eligibility;
use crate::types::{Round, Step, VoteType};
use crate::vote::Vote;
use crate::vote_manager::VoteManager;

/// State the driver shares with network-facing threads
pub(crate) struct Shared<S: Storage> {
    pub(crate) keypair: KeyPair,
    pub(crate) vote_mgr: Arc<VoteManager<S>>,
    pub(crate) next_votes: Arc<NextVotesForPreviousRound<S>>,
    pub(crate) eligibility: Arc<dyn Eligibility>,
    pub(crate) round: AtomicU64,
    pub(crate) step: AtomicU64,
    pub(crate) dpos_period: AtomicU64,
    pub(crate) total_weight: AtomicU64,
    pub(crate) sortition_threshold: AtomicU64,
    pub(crate) two_t_plus_one: AtomicU64,
    stopped: AtomicBool,
    halted: Mutex<Option<String>>,
    wake_epoch: Mutex<u64>,
    wake_cv: Condvar,
}

impl<S: Storage> Shared<S> {
    pub(crate) fn new(
        keypair: KeyPair,
        vote_mgr: Arc<VoteManager<S>>,
        next_votes: Arc<NextVotesForPreviousRound<S>>,
        eligibility: Arc<dyn Eligibility>,
    ) -> Self {
        Shared {
            keypair,
            vote_mgr,
            next_votes,
            eligibility,
            round: AtomicU64::new(1),
            step: AtomicU64::new(1),
            dpos_period: AtomicU64::new(0),
            total_weight: AtomicU64::new(0),
            sortition_threshold: AtomicU64::new(0),
            two_t_plus_one: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            halted: Mutex::new(None),
            wake_epoch: Mutex::new(0),
            wake_cv: Condvar::new(),
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _epoch = self.wake_epoch.lock();
        self.wake_cv.notify_all();
    }

    /// Record a fatal error raised outside the driver and stop it. The
    /// driver reports the first recorded error on its next iteration.
    pub(crate) fn halt(&self, err: &ConsensusError) {
        error!(
            "Halting consensus driver of {}: {}",
            self.keypair.public.short(),
            err
        );
        let reason = match err {
            ConsensusError::InvariantViolation(message) => message.clone(),
            other => other.to_string(),
        };
        self.halted.lock().get_or_insert(reason);
        self.stop();
    }

    pub(crate) fn halted(&self) -> Option<String> {
        self.halted.lock().clone()
    }

    pub(crate) fn wake(&self) {
        let mut epoch = self.wake_epoch.lock();
        *epoch += 1;
        self.wake_cv.notify_all();
    }

    /// Block for `ms` or until stopped. With `wake_early`, a [`Shared::wake`]
    /// call also ends the wait.
    pub(crate) fn sleep(&self, ms: u64, wake_early: bool) {
        let deadline = Instant::now() + Duration::from_millis(ms);
        let mut epoch = self.wake_epoch.lock();
        let started_at = *epoch;
        while !self.is_stopped() {
            if wake_early && *epoch != started_at {
                break;
            }
            if self.wake_cv.wait_until(&mut epoch, deadline).timed_out() {
                break;
            }
        }
    }

    /// Full check of a peer's vote against the current snapshot
    pub(crate) fn validate(&self, vote: &Vote) -> Result<(), ConsensusError> {
        let period: Period = self.dpos_period.load(Ordering::SeqCst);
        let weight = self.eligibility.weight_of(vote.voter(), period)?;
        if vote.weighted_index() >= weight {
            return Err(ConsensusError::NotEligible {
                voter: vote.voter().to_hex(),
                weighted_index: vote.weighted_index(),
            });
        }
        vote.validate(
            self.total_weight.load(Ordering::SeqCst),
            self.sortition_threshold.load(Ordering::SeqCst),
        )
    }
}

/// Thread-safe interface to a running [`PbftManager`](super::PbftManager)
pub struct PbftHandle<S: Storage> {
    pub(crate) shared: Arc<Shared<S>>,
}

impl<S: Storage> Clone for PbftHandle<S> {
    fn clone(&self) -> Self {
        PbftHandle {
            shared: self.shared.clone(),
        }
    }
}

impl<S: Storage> PbftHandle<S> {
    pub fn current_round_and_step(&self) -> (Round, Step) {
        (
            self.shared.round.load(Ordering::SeqCst),
            self.shared.step.load(Ordering::SeqCst),
        )
    }

    /// Whether our sortition for this slot wins under the current snapshot
    pub fn should_speak(&self, vote_type: VoteType, round: Round, step: Step, weighted_index: u64) -> bool {
        let message = SortitionMessage::new(vote_type, round, step, weighted_index);
        match Sortition::new(&self.shared.keypair, message) {
            Ok(sortition) => sortition.can_speak(
                self.shared.sortition_threshold.load(Ordering::SeqCst),
                self.shared.total_weight.load(Ordering::SeqCst),
            ),
            Err(_) => false,
        }
    }

    /// Hand over a vote received from the network.
    ///
    /// Votes of rounds we have left are dropped, except next votes of the
    /// previous round, which are validated and merged into the next-votes
    /// tracker. Returns whether the vote was new.
    pub fn submit_external_vote(&self, vote: Vote) -> Result<bool, ConsensusError> {
        let result = self.ingest_external_vote(vote);
        self.escalate(result)
    }

    fn ingest_external_vote(&self, vote: Vote) -> Result<bool, ConsensusError> {
        let (round, _) = self.current_round_and_step();
        if vote.round() < round {
            if vote.vote_type() == VoteType::Next
                && vote.round() + 1 == round
                && !self.shared.next_votes.find(vote.hash())
            {
                self.shared.validate(&vote)?;
                let two_t_plus_one = self.shared.two_t_plus_one.load(Ordering::SeqCst);
                self.shared.next_votes.add_next_votes(&[vote], two_t_plus_one)?;
                return Ok(true);
            }
            debug!("Dropping stale {} at round {}", vote, round);
            return Ok(false);
        }

        let is_next = vote.vote_type() == VoteType::Next;
        let added = self.shared.vote_mgr.add_unverified_vote(vote)?;
        if added && is_next {
            self.shared.wake();
        }
        Ok(added)
    }

    /// Merge a previous-round next-votes bundle a peer sent us
    pub fn submit_synced_next_votes(&self, votes: &[Vote]) -> Result<(), ConsensusError> {
        let result = votes
            .iter()
            .try_for_each(|vote| self.shared.validate(vote))
            .and_then(|_| {
                let two_t_plus_one = self.shared.two_t_plus_one.load(Ordering::SeqCst);
                self.shared
                    .next_votes
                    .update_with_synced_votes(votes, two_t_plus_one)
            });
        self.escalate(result)
    }

    /// Fatal errors stop the driver; the caller still gets the error
    fn escalate<T>(&self, result: Result<T, ConsensusError>) -> Result<T, ConsensusError> {
        if let Err(err) = &result {
            if err.is_fatal() {
                self.shared.halt(err);
            }
        }
        result
    }

    /// Answer a peer at `peer_round` asking for our previous-round next votes
    pub fn next_votes_for_sync(&self, peer_round: Round) -> Option<Vec<Vote>> {
        let (round, _) = self.current_round_and_step();
        if round <= 1 || round < peer_round {
            return None;
        }
        let votes = self.shared.next_votes.get_next_votes();
        if votes.is_empty() {
            None
        } else {
            Some(votes)
        }
    }

    pub fn is_known_vote(&self, hash: &Hash) -> bool {
        self.shared.vote_mgr.is_known_vote(hash) || self.shared.next_votes.find(hash)
    }

    pub fn stop(&self) {
        if !self.shared.is_stopped() {
            info!("Stopping consensus driver of {}", self.shared.keypair.public.short());
        }
        self.shared.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }
}
