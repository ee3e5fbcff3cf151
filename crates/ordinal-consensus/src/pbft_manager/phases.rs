use ordinal_core::Hash;
use ordinal_state::Storage;
use tracing::{debug, error, info, trace};

use super::PbftManager;
use crate::db::{PbftStatus, PbftVotedValue};
use crate::error::ConsensusError;
use crate::quorum::{block_with_enough_votes, filter_votes};
use crate::types::{PbftState, SyncReason, VoteType, NULL_BLOCK_HASH};

const FILTER_STEP: u64 = 2;

impl<S: Storage> PbftManager<S> {
    /// Step 1
    pub(super) fn propose_block(&mut self) -> Result<(), ConsensusError> {
        let round = self.round;
        if round > 1 {
            if self.next_votes.have_enough_votes_for_null_block_hash() {
                debug!("Previous round {} next voted NULL", round - 1);
            } else if self.previous_round_next_voted_value != NULL_BLOCK_HASH {
                debug!(
                    "Previous round {} next voted {}",
                    round - 1,
                    self.previous_round_next_voted_value.short()
                );
            } else {
                return self.fatal(format!("previous round {} has no next-vote quorum", round - 1));
            }
        }

        if round == 1 {
            let placed = self.place_vote(self.own_starting_value, VoteType::Propose, round, self.step)?;
            if placed > 0 {
                info!("Proposing NULL for round 1");
            }
        } else if self.give_up_next_voted_block() {
            // one fresh proposal per period
            if matches!(self.proposed_value, None | Some(NULL_BLOCK_HASH)) {
                self.proposed_value = self.propose_own_value();
            }
            if let Some(value) = self.proposed_value {
                self.db
                    .save_voted_value(PbftVotedValue::OwnStartingValueInRound, value)?;
                self.own_starting_value = value;
                let placed = self.place_vote(value, VoteType::Propose, round, self.step)?;
                if placed > 0 {
                    info!("Proposing own starting value {} for round {}", value.short(), round);
                }
            }
        } else if self.previous_round_next_voted_value != NULL_BLOCK_HASH {
            let value = self.previous_round_next_voted_value;
            self.db
                .save_voted_value(PbftVotedValue::OwnStartingValueInRound, value)?;
            self.own_starting_value = value;
            if self.chain.is_value_available(&value) {
                let placed = self.place_vote(value, VoteType::Propose, round, self.step)?;
                if placed > 0 {
                    info!(
                        "Re-proposing {} next voted in round {}",
                        value.short(),
                        round - 1
                    );
                    self.transport.broadcast_value(&value);
                }
            } else {
                debug!("Next voted value {} not held, cannot re-propose", value.short());
            }
        }
        Ok(())
    }

    /// `None` when sortition does not let us propose, `Some(NULL)` when there
    /// is nothing new to propose.
    fn propose_own_value(&mut self) -> Option<Hash> {
        let handle = self.handle();
        let eligible = self.weighted_votes > 0
            && handle.should_speak(VoteType::Propose, self.round, self.step, 0);
        if !eligible {
            return None;
        }
        match self.chain.candidate_value(self.round) {
            Some(value) if value != NULL_BLOCK_HASH => {
                info!(
                    "Node {} proposes {} in round {}",
                    self.shared.keypair.public.short(),
                    value.short(),
                    self.round
                );
                self.transport.broadcast_value(&value);
                Some(value)
            }
            _ => {
                debug!("Nothing new to propose in round {}", self.round);
                Some(NULL_BLOCK_HASH)
            }
        }
    }

    /// Step 2: soft vote the leader's proposal
    pub(super) fn identify_block(&mut self) -> Result<(), ConsensusError> {
        let round = self.round;
        if round == 1 || self.give_up_next_voted_block() {
            if let Some(leader) = self.identify_leader_value() {
                self.db
                    .save_voted_value(PbftVotedValue::OwnStartingValueInRound, leader)?;
                self.own_starting_value = leader;
                debug!("Leader value {} in round {}", leader.short(), round);
                let placed = self.place_vote(leader, VoteType::Soft, round, self.step)?;
                self.update_last_soft_voted_value(leader);
                if placed > 0 {
                    debug!("Soft voted {} in round {}", leader.short(), round);
                }
            }
        } else if self.previous_round_next_voted_value != NULL_BLOCK_HASH {
            let value = self.previous_round_next_voted_value;
            self.place_vote(value, VoteType::Soft, round, self.step)?;
            self.update_last_soft_voted_value(value);
        }
        Ok(())
    }

    /// The proposal with the smallest sortition credential
    fn identify_leader_value(&mut self) -> Option<Hash> {
        let round = self.round;
        let proposals: Vec<(Hash, Hash)> = self
            .votes
            .iter()
            .filter(|v| v.round() == round && v.vote_type() == VoteType::Propose)
            .map(|v| (*v.credential(), *v.value()))
            .collect();

        let mut leader: Option<(Hash, Hash)> = None;
        for (credential, value) in proposals {
            if value == self.last_soft_voted_value && self.give_up_soft_voted_block() {
                continue;
            }
            let eligible = round == 1 || (value != NULL_BLOCK_HASH && !self.chain.is_finalized(&value));
            if !eligible {
                continue;
            }
            if leader.map_or(true, |(best, _)| credential < best) {
                leader = Some((credential, value));
            }
        }
        leader.map(|(_, value)| value)
    }

    /// Step 3: cert vote once the soft-voted value is quorate, held and valid
    pub(super) fn certify_block(&mut self) -> Result<(), ConsensusError> {
        let round = self.round;
        let lambda = self.lambda_ms;
        self.go_finish_state =
            self.elapsed_time_in_round_ms > (4 * lambda).saturating_sub(self.config.polling_interval_ms);

        if self.elapsed_time_in_round_ms < 2 * lambda {
            error!(
                "Reached certify after only {} ms in round {}",
                self.elapsed_time_in_round_ms, round
            );
            return Ok(());
        }
        if self.go_finish_state {
            debug!("Certify expired in round {}", round);
            return Ok(());
        }
        if self.should_have_cert_voted_in_this_round {
            return Ok(());
        }
        if !self.update_soft_voted_value()? {
            return Ok(());
        }
        let value = self.soft_voted_value;
        if !self.value_available(&value) {
            return Ok(());
        }

        let already_executed = self.have_executed_this_round && self.chain.last_finalized_value() == value;
        let valid = already_executed || {
            let valid = self.chain.is_value_valid(&value);
            if !valid {
                self.sync_pbft_chain_from_peers(SyncReason::InvalidSoftVotedValue, value);
            }
            valid
        };
        if !valid {
            return Ok(());
        }

        let placed = self.place_vote(value, VoteType::Cert, round, self.step)?;
        if placed > 0 {
            info!("Cert voted {} in round {}", value.short(), round);
            self.last_cert_voted_value = value;
            self.db
                .save_voted_value(PbftVotedValue::LastCertVotedValue, value)?;
            self.should_have_cert_voted_in_this_round = true;
        }
        Ok(())
    }

    /// Even steps from 4
    pub(super) fn first_finish(&mut self) -> Result<(), ConsensusError> {
        let round = self.round;
        let step = self.step;

        if self.last_cert_voted_value != NULL_BLOCK_HASH {
            let value = self.last_cert_voted_value;
            let placed = self.place_vote(value, VoteType::Next, round, step)?;
            if placed > 0 {
                debug!("Next voted cert voted value {} at step {}", value.short(), step);
            }
            return Ok(());
        }

        let own = self.own_starting_value;
        let give_up_soft = own == self.previous_round_next_voted_value
            && self.give_up_soft_voted_block()
            && !self.value_available(&own);

        if round >= 2 && (self.give_up_next_voted_block() || give_up_soft) {
            let placed = self.place_vote(NULL_BLOCK_HASH, VoteType::Next, round, step)?;
            if placed > 0 {
                debug!("Next voted NULL in round {} step {}", round, step);
            }
            return Ok(());
        }

        if self.own_starting_value == NULL_BLOCK_HASH
            && self.previous_round_next_voted_value != NULL_BLOCK_HASH
            && !self.reset_own_value_to_null_in_this_round
        {
            let value = self.previous_round_next_voted_value;
            self.db
                .save_voted_value(PbftVotedValue::OwnStartingValueInRound, value)?;
            self.own_starting_value = value;
            debug!("Own starting value set to previous round next voted value {}", value.short());
        }
        let value = self.own_starting_value;
        let placed = self.place_vote(value, VoteType::Next, round, step)?;
        if placed > 0 {
            debug!(
                "Next voted own starting value {} in round {} step {}",
                value.short(),
                round,
                step
            );
        }
        Ok(())
    }

    /// Odd steps from 5
    pub(super) fn second_finish(&mut self) -> Result<(), ConsensusError> {
        let round = self.round;
        let step = self.step;
        if step < self.starting_step_in_round {
            return self.fatal(format!(
                "step {} below starting step {}",
                step, self.starting_step_in_round
            ));
        }
        let end_time_for_step = ((2 + step - self.starting_step_in_round) * self.lambda_ms)
            .saturating_sub(self.config.polling_interval_ms);

        self.update_soft_voted_value()?;

        if !self.next_voted_soft_value && self.soft_voted_enough && self.soft_voted_value != NULL_BLOCK_HASH {
            let value = self.soft_voted_value;
            let placed = self.place_vote(value, VoteType::Next, round, step)?;
            if placed > 0 {
                debug!("Next voted soft value {} at step {}", value.short(), step);
                self.db.save_status(PbftStatus::NextVotedSoftValue, true)?;
                self.next_voted_soft_value = true;
            }
        }

        let soft = self.soft_voted_value;
        let give_up_soft = self.last_cert_voted_value == NULL_BLOCK_HASH
            && self.last_soft_voted_value == self.previous_round_next_voted_value
            && self.give_up_soft_voted_block()
            && !self.value_available(&soft);

        if !self.next_voted_null_block_hash && round >= 2 && (give_up_soft || self.give_up_next_voted_block()) {
            let placed = self.place_vote(NULL_BLOCK_HASH, VoteType::Next, round, step)?;
            if placed > 0 {
                debug!("Next voted NULL in round {} step {}", round, step);
                self.db.save_status(PbftStatus::NextVotedNullBlockHash, true)?;
                self.next_voted_null_block_hash = true;
            }
        }

        let interval = self.config.next_votes_rebroadcast_interval_steps.max(1);
        let due = step > self.config.max_steps
            && step
                .checked_sub(self.config.max_steps + 2)
                .is_some_and(|n| n % interval == 0);
        if due {
            self.sync_pbft_chain_from_peers(SyncReason::ExceededMaxSteps, NULL_BLOCK_HASH);
            if self.last_bundle_broadcast != Some((round, step)) {
                let bundle = self.next_votes.get_next_votes();
                if !bundle.is_empty() {
                    info!(
                        "Rebroadcasting {} next votes of round {} at step {}",
                        bundle.len(),
                        round.saturating_sub(1),
                        step
                    );
                    self.transport.broadcast_next_votes_bundle(bundle);
                }
                self.last_bundle_broadcast = Some((round, step));
            }
        }

        self.loop_back_finish_state = self.elapsed_time_in_round_ms > end_time_for_step;
        Ok(())
    }

    /// Tally soft votes of this round until one value reaches quorum.
    /// Returns whether a concrete value has soft-vote quorum.
    fn update_soft_voted_value(&mut self) -> Result<bool, ConsensusError> {
        if !self.soft_voted_enough {
            let round = self.round;
            let soft_votes = filter_votes(&self.votes, VoteType::Soft, round, FILTER_STEP);
            let bundle = block_with_enough_votes(&soft_votes, self.two_t_plus_one)?;

            let mut batch = self.db.batch();
            batch.set_voted_value(PbftVotedValue::SoftVotedBlockHashInRound, bundle.value)?;
            batch.set_status(PbftStatus::SoftVotedBlockInRound, bundle.enough)?;
            if bundle.enough && bundle.value != NULL_BLOCK_HASH {
                batch.set_soft_votes(round, &bundle.votes)?;
            }
            self.db.commit(batch)?;

            self.soft_voted_value = bundle.value;
            self.soft_voted_enough = bundle.enough;

            if bundle.enough && bundle.value != NULL_BLOCK_HASH {
                debug!("Soft votes reached quorum on {} in round {}", bundle.value.short(), round);
                if self.state == PbftState::SecondFinish {
                    self.transport.broadcast_votes(bundle.votes);
                }
            }
        }
        Ok(self.soft_voted_enough && self.soft_voted_value != NULL_BLOCK_HASH)
    }

    fn update_last_soft_voted_value(&mut self, value: Hash) {
        if value != self.last_soft_voted_value {
            self.time_began_waiting_soft_voted_block_ms = self.clock.now_ms();
        }
        self.last_soft_voted_value = value;
    }

    /// Whether the content behind `value` is held. Asks peers for it when
    /// not, and after waiting too many rounds drops the own starting value.
    fn value_available(&mut self, value: &Hash) -> bool {
        if *value == NULL_BLOCK_HASH {
            return false;
        }
        if self.chain.is_value_available(value) {
            self.round_began_wait_proposal_block = 0;
            return true;
        }

        let round = self.round;
        if self.round_began_wait_proposal_block == 0 {
            debug!("Content of {} not here yet", value.short());
            self.round_began_wait_proposal_block = round;
        } else if round > self.round_began_wait_proposal_block {
            let waited = round - self.round_began_wait_proposal_block;
            if waited >= self.config.max_wait_rounds_for_proposal_block {
                debug!(
                    "Waited {} rounds for {}, resetting own starting value to NULL",
                    waited,
                    value.short()
                );
                if let Err(err) = self
                    .db
                    .save_voted_value(PbftVotedValue::OwnStartingValueInRound, NULL_BLOCK_HASH)
                {
                    error!("Cannot persist own starting value: {}", err);
                }
                self.own_starting_value = NULL_BLOCK_HASH;
                self.reset_own_value_to_null_in_this_round = true;
            } else {
                trace!("Waited {} rounds for {}", waited, value.short());
            }
        }
        self.sync_pbft_chain_from_peers(SyncReason::MissingContent, *value);
        false
    }

    /// Stop backing the last soft-voted value once it proved invalid or its
    /// content took too long to arrive
    fn give_up_soft_voted_block(&self) -> bool {
        if self.last_soft_voted_value == NULL_BLOCK_HASH {
            return false;
        }
        let previous = self.previous_round_next_voted_value;
        if previous != NULL_BLOCK_HASH
            && self.chain.is_value_available(&previous)
            && !self.chain.is_value_valid(&previous)
        {
            return true;
        }
        let waited = self
            .clock
            .now_ms()
            .saturating_sub(self.time_began_waiting_soft_voted_block_ms);
        if waited >= self.max_wait_for_soft_voted_block_ms {
            debug!(
                "Waited {} ms for soft voted value {}, giving up",
                waited,
                self.last_soft_voted_value.short()
            );
            return true;
        }
        false
    }

    /// Whether the previous round leaves us free to back a new value
    fn give_up_next_voted_block(&mut self) -> bool {
        let (round, step) = (self.round, self.step);
        if self.last_cert_voted_value != NULL_BLOCK_HASH {
            if self.polling_state_print_log {
                debug!(
                    "Round {} step {}: last cert voted value is {}",
                    round,
                    step,
                    self.last_cert_voted_value.short()
                );
                self.polling_state_print_log = false;
            }
            return false;
        }

        let previous = self.previous_round_next_voted_value;
        if previous == NULL_BLOCK_HASH || self.next_votes.have_enough_votes_for_null_block_hash() {
            trace!("Round {} step {}: previous round next voted NULL", round, step);
            return true;
        }
        if self.chain.is_finalized(&previous) {
            debug!("Next voted value {} already finalized, giving up", previous.short());
            return true;
        }
        if !self.chain.is_value_available(&previous) {
            let waited = self
                .clock
                .now_ms()
                .saturating_sub(self.time_began_waiting_next_voted_block_ms);
            if waited >= self.max_wait_for_next_voted_block_ms {
                debug!(
                    "Waited {} ms for next voted value {}, giving up",
                    waited,
                    previous.short()
                );
                return true;
            }
            return false;
        }
        !self.chain.is_value_valid(&previous)
    }
}
