//! The round/step PBFT state machine.
//!
//! A single driver owns the [`PbftManager`] and runs its loop on a
//! dedicated thread. Other threads talk to it through a [`PbftHandle`]:
//! they feed votes into the shared [`VoteManager`] and read the current
//! round and step.

mod handle;
mod phases;

use ordinal_core::{Hash, KeyPair, Period};
use ordinal_state::Storage;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::PbftConfig;
use crate::db::{ConsensusDb, PbftStatus, PbftVotedValue};
use crate::error::ConsensusError;
use crate::next_votes::NextVotesForPreviousRound;
use crate::quorum::{self, block_with_enough_votes, filter_votes};
use crate::traits::{Eligibility, Transport, ValueSource};
use crate::types::{CertifiedValue, PbftState, Round, Step, SyncReason, VoteType, NULL_BLOCK_HASH};
use crate::vote::Vote;
use crate::vote_manager::{VoteManager, CERTIFY_STEP};

pub use handle::PbftHandle;
use handle::Shared;

/// Sleeps shorter than this are skipped
const MIN_SLEEP_MS: u64 = 25;

/// Collaborators a manager is built from
pub struct PbftContext {
    pub chain: Arc<dyn ValueSource>,
    pub eligibility: Arc<dyn Eligibility>,
    pub transport: Arc<dyn Transport>,
    pub clock: Arc<dyn Clock>,
}

pub struct PbftManager<S: Storage> {
    config: PbftConfig,
    shared: Arc<Shared<S>>,
    db: Arc<ConsensusDb<S>>,
    vote_mgr: Arc<VoteManager<S>>,
    next_votes: Arc<NextVotesForPreviousRound<S>>,
    chain: Arc<dyn ValueSource>,
    eligibility: Arc<dyn Eligibility>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,

    round: Round,
    step: Step,
    state: PbftState,
    starting_step_in_round: Step,

    lambda_ms: u64,
    max_wait_for_soft_voted_block_ms: u64,
    max_wait_for_next_voted_block_ms: u64,

    now_ms: u64,
    round_clock_start_ms: u64,
    elapsed_time_in_round_ms: u64,
    next_step_time_ms: u64,
    time_began_waiting_next_voted_block_ms: u64,
    time_began_waiting_soft_voted_block_ms: u64,

    own_starting_value: Hash,
    last_cert_voted_value: Hash,
    last_soft_voted_value: Hash,
    soft_voted_value: Hash,
    soft_voted_enough: bool,
    previous_round_next_voted_value: Hash,
    previous_round_next_voted_null: bool,
    /// Own proposal this period; `Some(NULL)` when we proposed nothing new
    proposed_value: Option<Hash>,

    have_executed_this_round: bool,
    should_have_cert_voted_in_this_round: bool,
    next_voted_soft_value: bool,
    next_voted_null_block_hash: bool,
    executed_pbft_block: bool,
    go_finish_state: bool,
    loop_back_finish_state: bool,
    reset_own_value_to_null_in_this_round: bool,
    polling_state_print_log: bool,
    round_began_wait_proposal_block: Round,
    last_sync_request: Option<(Round, Step)>,
    last_bundle_broadcast: Option<(Round, Step)>,

    votes: Vec<Vote>,
    dpos_period: Period,
    total_weight: u64,
    weighted_votes: u64,
    sortition_threshold: u64,
    two_t_plus_one: u64,
}

impl<S: Storage + 'static> PbftManager<S> {
    /// Spawn the driver thread. The returned join handle yields the error
    /// that stopped the driver, if any.
    pub fn start(self) -> Result<(PbftHandle<S>, JoinHandle<Result<(), ConsensusError>>), ConsensusError> {
        let handle = self.handle();
        let name = format!("pbft-{}", self.shared.keypair.public.short());
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
            .map_err(|e| ConsensusError::InvariantViolation(format!("cannot spawn driver: {}", e)))?;
        Ok((handle, join))
    }
}

impl<S: Storage> PbftManager<S> {
    pub fn new(
        config: PbftConfig,
        keypair: KeyPair,
        db: Arc<ConsensusDb<S>>,
        context: PbftContext,
    ) -> Result<Self, ConsensusError> {
        let vote_mgr = Arc::new(VoteManager::new(db.clone())?);
        let next_votes = Arc::new(NextVotesForPreviousRound::new(db.clone()));
        let shared = Arc::new(Shared::new(
            keypair,
            vote_mgr.clone(),
            next_votes.clone(),
            context.eligibility.clone(),
        ));
        let lambda_ms = config.lambda_ms_min;
        let max_soft = config.max_wait_for_soft_voted_block_ms();
        let max_next = config.max_wait_for_next_voted_block_ms();

        Ok(PbftManager {
            config,
            shared,
            db,
            vote_mgr,
            next_votes,
            chain: context.chain,
            eligibility: context.eligibility,
            transport: context.transport,
            clock: context.clock,

            round: 1,
            step: 1,
            state: PbftState::ValuePropose,
            starting_step_in_round: 1,

            lambda_ms,
            max_wait_for_soft_voted_block_ms: max_soft,
            max_wait_for_next_voted_block_ms: max_next,

            now_ms: 0,
            round_clock_start_ms: 0,
            elapsed_time_in_round_ms: 0,
            next_step_time_ms: 0,
            time_began_waiting_next_voted_block_ms: 0,
            time_began_waiting_soft_voted_block_ms: 0,

            own_starting_value: NULL_BLOCK_HASH,
            last_cert_voted_value: NULL_BLOCK_HASH,
            last_soft_voted_value: NULL_BLOCK_HASH,
            soft_voted_value: NULL_BLOCK_HASH,
            soft_voted_enough: false,
            previous_round_next_voted_value: NULL_BLOCK_HASH,
            previous_round_next_voted_null: false,
            proposed_value: None,

            have_executed_this_round: false,
            should_have_cert_voted_in_this_round: false,
            next_voted_soft_value: false,
            next_voted_null_block_hash: false,
            executed_pbft_block: false,
            go_finish_state: false,
            loop_back_finish_state: false,
            reset_own_value_to_null_in_this_round: false,
            polling_state_print_log: true,
            round_began_wait_proposal_block: 0,
            last_sync_request: None,
            last_bundle_broadcast: None,

            votes: Vec::new(),
            dpos_period: 0,
            total_weight: 0,
            weighted_votes: 0,
            sortition_threshold: 0,
            two_t_plus_one: 0,
        })
    }

    pub fn handle(&self) -> PbftHandle<S> {
        PbftHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn vote_manager(&self) -> &Arc<VoteManager<S>> {
        &self.vote_mgr
    }

    pub fn next_votes(&self) -> &Arc<NextVotesForPreviousRound<S>> {
        &self.next_votes
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn state(&self) -> PbftState {
        self.state
    }

    pub fn two_t_plus_one(&self) -> u64 {
        self.two_t_plus_one
    }

    pub fn sortition_threshold(&self) -> u64 {
        self.sortition_threshold
    }

    pub fn own_starting_value(&self) -> Hash {
        self.own_starting_value
    }

    pub fn last_cert_voted_value(&self) -> Hash {
        self.last_cert_voted_value
    }

    pub fn set_max_wait_for_soft_voted_block_ms(&mut self, ms: u64) {
        self.max_wait_for_soft_voted_block_ms = ms;
    }

    pub fn set_max_wait_for_next_voted_block_ms(&mut self, ms: u64) {
        self.max_wait_for_next_voted_block_ms = ms;
    }

    /// Restore from storage and loop until stopped or a fatal error
    pub fn run(mut self) -> Result<(), ConsensusError> {
        info!("Consensus driver of {} starting", self.shared.keypair.public.short());
        let result = self.initial_state().and_then(|_| self.continuous_operation());
        match &result {
            Ok(()) => info!("Consensus driver stopped at round {} step {}", self.round, self.step),
            Err(err) => error!(
                "Consensus driver halted at round {} step {}: {}",
                self.round, self.step, err
            ),
        }
        self.shared.stop();
        result
    }

    fn continuous_operation(&mut self) -> Result<(), ConsensusError> {
        while !self.shared.is_stopped() {
            self.check_halted()?;
            if !self.iterate()? {
                continue;
            }
            let remaining = self.time_to_next_step_ms();
            if remaining > MIN_SLEEP_MS {
                debug!("Sleeping {} ms in {} at step {}", remaining, self.state, self.step);
                let wake_early = matches!(self.state, PbftState::FirstFinish | PbftState::SecondFinish);
                self.shared.sleep(remaining, wake_early);
            }
        }
        self.check_halted()
    }

    /// Run one loop iteration if its step timer is due. Returns whether it ran.
    pub fn tick(&mut self) -> Result<bool, ConsensusError> {
        self.check_halted()?;
        if self.time_to_next_step_ms() > 0 {
            return Ok(false);
        }
        self.iterate()?;
        Ok(true)
    }

    /// Returns false when the iteration restarted because of a commit or a
    /// round change
    fn iterate(&mut self) -> Result<bool, ConsensusError> {
        if self.state_operations()? {
            return Ok(false);
        }
        match self.state {
            PbftState::ValuePropose => self.propose_block()?,
            PbftState::Filter => self.identify_block()?,
            PbftState::Certify => self.certify_block()?,
            PbftState::FirstFinish => self.first_finish()?,
            PbftState::SecondFinish => self.second_finish()?,
        }
        self.set_next_state()?;
        Ok(true)
    }

    /// Milliseconds until the current step timer fires
    pub fn time_to_next_step_ms(&self) -> u64 {
        let elapsed = self.clock.now_ms().saturating_sub(self.round_clock_start_ms);
        self.next_step_time_ms.saturating_sub(elapsed)
    }

    fn update_clock(&mut self) {
        self.now_ms = self.clock.now_ms();
        self.elapsed_time_in_round_ms = self.now_ms.saturating_sub(self.round_clock_start_ms);
    }

    /// Restore the session from storage. Also refreshes the stake snapshot.
    pub fn initial_state(&mut self) -> Result<(), ConsensusError> {
        self.update_dpos_state()?;
        self.update_two_t_plus_one_and_threshold();

        let round = self.db.round()?.unwrap_or(1);
        let step = self.db.step()?.unwrap_or(1);
        if round == 0 || step == 0 {
            return self.fatal(format!("persisted round {} step {} is not valid", round, step));
        }

        if round == 1 && step == 1 {
            self.state = PbftState::ValuePropose;
            self.step = 1;
        } else if step < 4 {
            // resuming mid-round: only the finish steps are safe to re-enter
            self.step = 4;
            self.state = PbftState::FirstFinish;
        } else if step % 2 == 0 {
            self.step = step;
            self.state = PbftState::FirstFinish;
        } else {
            self.step = step;
            self.state = PbftState::SecondFinish;
        }
        self.set_round(round)?;
        self.set_step(self.step)?;
        self.starting_step_in_round = self.step;

        if round > 1 {
            let votes = self.db.next_votes(round - 1)?;
            if votes.is_empty() {
                return self.fatal(format!("no next votes stored for round {}", round - 1));
            }
            let Some(two_t_plus_one) = self.db.two_t_plus_one(round - 1)? else {
                return self.fatal(format!("no quorum size stored for round {}", round - 1));
            };
            self.next_votes.update(&votes, two_t_plus_one)?;
        }

        self.own_starting_value = self
            .db
            .voted_value(PbftVotedValue::OwnStartingValueInRound)?
            .unwrap_or(NULL_BLOCK_HASH);
        self.soft_voted_value = self
            .db
            .voted_value(PbftVotedValue::SoftVotedBlockHashInRound)?
            .unwrap_or(NULL_BLOCK_HASH);
        self.soft_voted_enough = self.db.status(PbftStatus::SoftVotedBlockInRound)?;
        self.last_cert_voted_value = self
            .db
            .voted_value(PbftVotedValue::LastCertVotedValue)?
            .unwrap_or(NULL_BLOCK_HASH);
        self.have_executed_this_round = self.db.status(PbftStatus::ExecutedInRound)?;
        self.executed_pbft_block = self.db.status(PbftStatus::ExecutedBlock)?;
        self.next_voted_soft_value = self.db.status(PbftStatus::NextVotedSoftValue)?;
        self.next_voted_null_block_hash = self.db.status(PbftStatus::NextVotedNullBlockHash)?;

        self.previous_round_next_voted_value = self.next_votes.get_voted_value();
        self.previous_round_next_voted_null = self.next_votes.have_enough_votes_for_null_block_hash();

        self.update_clock();
        self.round_clock_start_ms = self.now_ms;
        self.elapsed_time_in_round_ms = 0;
        self.next_step_time_ms = 0;
        self.time_began_waiting_next_voted_block_ms = self.now_ms;
        self.time_began_waiting_soft_voted_block_ms = self.now_ms;
        if self.soft_voted_enough && self.soft_voted_value != NULL_BLOCK_HASH {
            self.last_soft_voted_value = self.soft_voted_value;
        }

        info!(
            "Node {} initialized at round {} step {} in {}",
            self.shared.keypair.public.short(),
            self.round,
            self.step,
            self.state
        );
        Ok(())
    }

    /// Work done before every phase action. Returns true when the loop must
    /// restart: a value was committed or the round changed.
    fn state_operations(&mut self) -> Result<bool, ConsensusError> {
        self.push_synced_values_into_chain()?;
        self.check_previous_round_next_voted_value_change();
        self.update_clock();

        let eligibility = self.eligibility.clone();
        let period = self.dpos_period;
        self.votes = self.vote_mgr.get_verified_votes(
            self.round,
            self.sortition_threshold,
            self.total_weight,
            |voter| eligibility.weight_of(voter, period).unwrap_or(0),
        )?;

        if self.state == PbftState::Certify && !self.have_executed_this_round {
            let cert_votes = filter_votes(&self.votes, VoteType::Cert, self.round, CERTIFY_STEP);
            let bundle = block_with_enough_votes(&cert_votes, self.two_t_plus_one)?;
            if bundle.enough {
                info!(
                    "Cert votes reached quorum on {} in round {}",
                    bundle.value.short(),
                    self.round
                );
                if self.push_cert_voted_value_into_chain(bundle.value, bundle.votes)? {
                    self.db.save_status(PbftStatus::ExecutedInRound, true)?;
                    self.have_executed_this_round = true;
                    return Ok(true);
                }
            }
        }

        self.reset_round()
    }

    fn check_previous_round_next_voted_value_change(&mut self) {
        let value = self.next_votes.get_voted_value();
        let null = self.next_votes.have_enough_votes_for_null_block_hash();
        if value != self.previous_round_next_voted_value {
            self.previous_round_next_voted_value = value;
            self.time_began_waiting_next_voted_block_ms = self.clock.now_ms();
        } else if null != self.previous_round_next_voted_null {
            self.previous_round_next_voted_null = null;
            self.time_began_waiting_next_voted_block_ms = self.clock.now_ms();
        }
    }

    /// Smallest round at or above ours whose next votes reached quorum at
    /// some step. Seeds the next-votes tracker from it and returns the
    /// round the network has moved to.
    fn round_determined_from_votes(&mut self) -> Result<Option<Round>, ConsensusError> {
        let mut tallies: std::collections::BTreeMap<(Round, Step), u64> = Default::default();
        for vote in &self.votes {
            if vote.vote_type() == VoteType::Next && vote.round() >= self.round {
                *tallies.entry((vote.round(), vote.step())).or_default() += 1;
            }
        }

        for ((round, step), count) in tallies {
            if count < self.two_t_plus_one {
                continue;
            }
            let votes = filter_votes(&self.votes, VoteType::Next, round, step);
            let bundle = block_with_enough_votes(&votes, self.two_t_plus_one)?;
            if !bundle.enough {
                continue;
            }
            debug!(
                "Next votes reached quorum on {} at round {} step {}",
                bundle.value.short(),
                round,
                step
            );
            self.next_votes.update(&votes, self.two_t_plus_one)?;

            let mut batch = self.db.batch();
            batch.set_two_t_plus_one(round, self.two_t_plus_one)?;
            batch.set_next_votes(round, &self.next_votes.get_next_votes())?;
            if round > 1 {
                batch.remove_next_votes(round - 1);
            }
            self.db.commit(batch)?;
            return Ok(Some(round + 1));
        }
        Ok(None)
    }

    /// Move to the round the network is in. Returns whether it changed.
    fn reset_round(&mut self) -> Result<bool, ConsensusError> {
        let Some(consensus_round) = self.round_determined_from_votes()? else {
            return Ok(false);
        };
        if consensus_round < self.round {
            return self.fatal(format!(
                "next votes point to round {} while at round {}",
                consensus_round, self.round
            ));
        }
        if consensus_round == self.round {
            return Ok(false);
        }

        info!(
            "Node {} moving from round {} to round {}",
            self.shared.keypair.public.short(),
            self.round,
            consensus_round
        );
        let old_round = self.round;

        let mut batch = self.db.batch();
        batch.set_round(consensus_round)?;
        batch.set_step(1)?;
        batch.set_status(PbftStatus::ExecutedInRound, false)?;
        batch.set_status(PbftStatus::NextVotedNullBlockHash, false)?;
        batch.set_status(PbftStatus::NextVotedSoftValue, false)?;
        batch.set_status(PbftStatus::SoftVotedBlockInRound, false)?;
        batch.set_voted_value(PbftVotedValue::OwnStartingValueInRound, NULL_BLOCK_HASH)?;
        batch.set_voted_value(PbftVotedValue::SoftVotedBlockHashInRound, NULL_BLOCK_HASH)?;
        if self.soft_voted_enough && self.soft_voted_value != NULL_BLOCK_HASH {
            batch.remove_soft_votes(old_round);
        }
        self.db.commit(batch)?;

        self.round = consensus_round;
        self.shared.round.store(consensus_round, Ordering::SeqCst);
        self.step = 1;
        self.shared.step.store(1, Ordering::SeqCst);
        self.starting_step_in_round = 1;
        self.state = PbftState::ValuePropose;
        self.lambda_ms = self.config.lambda_ms_min;

        self.have_executed_this_round = false;
        self.should_have_cert_voted_in_this_round = false;
        self.next_voted_soft_value = false;
        self.next_voted_null_block_hash = false;
        self.go_finish_state = false;
        self.loop_back_finish_state = false;
        self.polling_state_print_log = true;
        self.reset_own_value_to_null_in_this_round = false;
        self.own_starting_value = NULL_BLOCK_HASH;
        self.soft_voted_value = NULL_BLOCK_HASH;
        self.soft_voted_enough = false;

        if self.executed_pbft_block {
            self.after_commit()?;
        }

        self.update_clock();
        self.round_clock_start_ms = self.now_ms;
        self.elapsed_time_in_round_ms = 0;
        self.next_step_time_ms = 0;
        Ok(true)
    }

    /// Refresh everything that depends on the finalized period
    fn after_commit(&mut self) -> Result<(), ConsensusError> {
        self.vote_mgr.remove_verified_votes()?;
        self.update_dpos_state()?;
        self.update_two_t_plus_one_and_threshold();
        self.db.save_status(PbftStatus::ExecutedBlock, false)?;
        self.executed_pbft_block = false;
        Ok(())
    }

    /// Load the stake snapshot of the current period, waiting while it is
    /// not available yet
    fn update_dpos_state(&mut self) -> Result<(), ConsensusError> {
        self.dpos_period = self.chain.finalized_period();
        loop {
            let weights = self.eligibility.total_weight(self.dpos_period).and_then(|total| {
                self.eligibility
                    .weight_of(&self.shared.keypair.public, self.dpos_period)
                    .map(|own| (total, own))
            });
            match weights {
                Ok((total, own)) => {
                    self.total_weight = total;
                    self.weighted_votes = own;
                    break;
                }
                Err(ConsensusError::FutureSnapshot(period)) => {
                    warn!("Stake snapshot for period {} not ready, retrying", period);
                    self.shared.sleep(self.config.polling_interval_ms, false);
                    if self.shared.is_stopped() {
                        break;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        self.shared.dpos_period.store(self.dpos_period, Ordering::SeqCst);
        self.shared.total_weight.store(self.total_weight, Ordering::SeqCst);
        debug!(
            "Period {}: total weight {}, own weight {}",
            self.dpos_period, self.total_weight, self.weighted_votes
        );
        Ok(())
    }

    fn update_two_t_plus_one_and_threshold(&mut self) {
        self.sortition_threshold = quorum::sortition_threshold(self.config.committee_size, self.total_weight);
        self.two_t_plus_one = quorum::two_t_plus_one(self.sortition_threshold);
        self.shared
            .sortition_threshold
            .store(self.sortition_threshold, Ordering::SeqCst);
        self.shared
            .two_t_plus_one
            .store(self.two_t_plus_one, Ordering::SeqCst);
        info!(
            "Sortition threshold {}, quorum {}",
            self.sortition_threshold, self.two_t_plus_one
        );
    }

    fn set_round(&mut self, round: Round) -> Result<(), ConsensusError> {
        self.db.save_round(round)?;
        self.round = round;
        self.shared.round.store(round, Ordering::SeqCst);
        Ok(())
    }

    fn set_step(&mut self, step: Step) -> Result<(), ConsensusError> {
        self.db.save_step(step)?;
        self.step = step;
        self.shared.step.store(step, Ordering::SeqCst);
        self.lambda_ms = self.config.lambda_ms_min;
        Ok(())
    }

    fn set_next_state(&mut self) -> Result<(), ConsensusError> {
        match self.state {
            PbftState::ValuePropose => {
                self.state = PbftState::Filter;
                self.set_step(self.step + 1)?;
                self.next_step_time_ms = 2 * self.lambda_ms;
            }
            PbftState::Filter => {
                self.state = PbftState::Certify;
                self.set_step(self.step + 1)?;
                self.next_step_time_ms = 2 * self.lambda_ms;
            }
            PbftState::Certify => {
                if self.go_finish_state {
                    self.state = PbftState::FirstFinish;
                    self.set_step(self.step + 1)?;
                    self.next_step_time_ms = 4 * self.lambda_ms;
                    self.polling_state_print_log = true;
                } else {
                    self.next_step_time_ms += self.config.polling_interval_ms;
                }
            }
            PbftState::FirstFinish => {
                self.state = PbftState::SecondFinish;
                self.set_step(self.step + 1)?;
                self.polling_state_print_log = true;
            }
            PbftState::SecondFinish => {
                if self.loop_back_finish_state {
                    self.loop_back_finish_state()?;
                } else {
                    self.next_step_time_ms += self.config.polling_interval_ms;
                }
            }
        }
        Ok(())
    }

    fn loop_back_finish_state(&mut self) -> Result<(), ConsensusError> {
        debug!("Round {} step {} looping back to first finish", self.round, self.step);
        self.state = PbftState::FirstFinish;
        self.set_step(self.step + 1)?;

        let mut batch = self.db.batch();
        batch.set_status(PbftStatus::NextVotedSoftValue, false)?;
        batch.set_status(PbftStatus::NextVotedNullBlockHash, false)?;
        self.db.commit(batch)?;
        self.next_voted_soft_value = false;
        self.next_voted_null_block_hash = false;
        self.polling_state_print_log = true;

        if self.step < self.starting_step_in_round {
            return self.fatal(format!(
                "step {} below starting step {}",
                self.step, self.starting_step_in_round
            ));
        }
        self.next_step_time_ms = (1 + self.step - self.starting_step_in_round) * self.lambda_ms;
        Ok(())
    }

    /// Cast every vote our stake units win sortition for. Returns how many.
    fn place_vote(&mut self, value: Hash, vote_type: VoteType, round: Round, step: Step) -> Result<usize, ConsensusError> {
        let mut votes = Vec::new();
        for weighted_index in 0..self.weighted_votes {
            // one proposal per validator per round
            if step == 1 && weighted_index > 0 {
                break;
            }
            let vote = Vote::generate(&self.shared.keypair, value, vote_type, round, step, weighted_index)?;
            if vote.sortition().can_speak(self.sortition_threshold, self.total_weight) {
                votes.push(vote);
            }
        }
        if votes.is_empty() {
            return Ok(0);
        }

        let mut batch = self.db.batch();
        for vote in &votes {
            batch.add_verified_vote(vote)?;
        }
        self.db.commit(batch)?;
        for vote in &votes {
            self.vote_mgr.add_verified_vote(vote.clone());
        }
        info!(
            "Placed {} {} vote(s) for {} at round {} step {}",
            votes.len(),
            vote_type,
            value.short(),
            round,
            step
        );
        let count = votes.len();
        self.transport.broadcast_votes(votes);
        Ok(count)
    }

    /// Ask peers for help, at most once per (round, step)
    fn sync_pbft_chain_from_peers(&mut self, reason: SyncReason, hint: Hash) {
        if self.transport.is_syncing() {
            debug!("Already syncing, not requesting {:?}", reason);
            return;
        }
        if self.chain.next_synced().is_some() {
            debug!("Synced values still queued, not requesting {:?}", reason);
            return;
        }
        if self.last_sync_request == Some((self.round, self.step)) {
            return;
        }
        info!(
            "Requesting sync ({:?}, hint {}) at round {} step {}",
            reason,
            hint.short(),
            self.round,
            self.step
        );
        self.last_sync_request = Some((self.round, self.step));
        self.transport.request_sync(reason, &hint);
    }

    /// Commit values obtained through chain sync, in order
    fn push_synced_values_into_chain(&mut self) -> Result<(), ConsensusError> {
        while let Some(certified) = self.chain.next_synced() {
            if self.chain.is_finalized(&certified.value) {
                self.chain.pop_synced();
                continue;
            }
            let eligibility = self.eligibility.clone();
            let period = self.dpos_period;
            if !self.vote_mgr.pbft_block_has_enough_valid_cert_votes(
                &certified,
                self.total_weight,
                self.sortition_threshold,
                self.two_t_plus_one,
                |voter| eligibility.weight_of(voter, period).unwrap_or(0),
            ) {
                error!(
                    "Synced value {} lacks valid cert votes, dropping the sync queue",
                    certified.value.short()
                );
                self.chain.clear_synced();
                break;
            }
            if !self.chain.is_value_available(&certified.value) {
                debug!("Content of synced value {} not here yet", certified.value.short());
                self.sync_pbft_chain_from_peers(SyncReason::MissingContent, certified.value);
                break;
            }
            if !self.chain.is_value_valid(&certified.value) {
                error!("Synced value {} is not valid, dropping the sync queue", certified.value.short());
                self.chain.clear_synced();
                break;
            }
            if !self.push_value(&certified)? {
                break;
            }
            self.chain.pop_synced();
            if self.executed_pbft_block {
                self.after_commit()?;
            }
        }
        Ok(())
    }

    fn push_cert_voted_value_into_chain(&mut self, value: Hash, cert_votes: Vec<Vote>) -> Result<bool, ConsensusError> {
        if value == NULL_BLOCK_HASH {
            return Ok(false);
        }
        if !self.chain.is_value_available(&value) {
            self.sync_pbft_chain_from_peers(SyncReason::MissingContent, value);
            return Ok(false);
        }
        if !self.chain.is_value_valid(&value) {
            warn!("Cert-voted value {} is not valid", value.short());
            self.sync_pbft_chain_from_peers(SyncReason::InvalidCertVotedValue, value);
            return Ok(false);
        }
        self.push_value(&CertifiedValue { value, cert_votes })
    }

    fn push_value(&mut self, certified: &CertifiedValue) -> Result<bool, ConsensusError> {
        let value = certified.value;
        if self.chain.is_finalized(&value) {
            if self.last_cert_voted_value == value {
                return self.fatal(format!(
                    "value {} cert-voted in round {} is already finalized",
                    value.short(),
                    self.round
                ));
            }
            debug!("Value {} already finalized", value.short());
            return Ok(false);
        }

        let period = self.chain.commit(&value, &certified.cert_votes)?;

        let mut batch = self.db.batch();
        batch.set_chain_head(period, value)?;
        batch.set_certified_value(period, certified)?;
        batch.set_voted_value(PbftVotedValue::LastCertVotedValue, NULL_BLOCK_HASH)?;
        batch.set_status(PbftStatus::ExecutedBlock, true)?;
        self.db.commit(batch)?;

        self.last_cert_voted_value = NULL_BLOCK_HASH;
        self.proposed_value = None;
        self.executed_pbft_block = true;
        info!(
            "Node {} finalized {} as period {} in round {}",
            self.shared.keypair.public.short(),
            value.short(),
            period,
            self.round
        );
        Ok(true)
    }

    /// Fails once a fatal error was recorded through a [`PbftHandle`]
    fn check_halted(&self) -> Result<(), ConsensusError> {
        match self.shared.halted() {
            Some(reason) => Err(ConsensusError::InvariantViolation(reason)),
            None => Ok(()),
        }
    }

    fn fatal<T>(&self, message: String) -> Result<T, ConsensusError> {
        error!("{}", message);
        Err(ConsensusError::InvariantViolation(message))
    }
}
