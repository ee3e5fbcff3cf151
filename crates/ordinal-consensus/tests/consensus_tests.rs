//! Committee-level behaviour of the round/step state machine

mod common;

use common::{test_config, test_keys, Cluster, StaticStake, TestNode};
use ordinal_consensus::{
    block_with_enough_votes, CertifiedValue, ConsensusDb, ConsensusError, ManualClock, PbftState,
    PbftStatus, SyncReason, ValueSource, Vote, VoteType, NULL_BLOCK_HASH,
};
use ordinal_core::{hash_tagged, Hash, KeyPair};
use ordinal_state::MemoryStorage;
use std::sync::Arc;

// ============================================================================
// Quorum scenario
// ============================================================================

#[test]
fn test_round_one_agrees_on_null_without_commit() {
    let mut cluster = Cluster::new(4, test_config());
    cluster.start();

    assert_eq!(cluster.nodes[0].manager.sortition_threshold(), 4);
    assert_eq!(cluster.nodes[0].manager.two_t_plus_one(), 3);

    let advanced = cluster.run_until(5_000, |c| c.rounds().iter().all(|r| *r >= 2));
    assert!(advanced, "committee stuck in round 1: {:?}", cluster.rounds());

    for node in &cluster.nodes {
        assert_eq!(node.manager.round(), 2);
        assert!(node.chain.finalized().is_empty());
        assert!(node.manager.next_votes().have_enough_votes_for_null_block_hash());
        assert_eq!(node.manager.next_votes().get_voted_value(), NULL_BLOCK_HASH);
    }
}

#[test]
fn test_late_cert_vote_does_not_change_outcome() {
    let keys = test_keys(4);
    let value = hash_tagged(b"test/value", &[b"h"]);
    let mut votes: Vec<Vote> = keys[..3]
        .iter()
        .map(|k| Vote::generate(k, value, VoteType::Cert, 2, 3, 0).unwrap())
        .collect();

    let bundle = block_with_enough_votes(&votes, 3).unwrap();
    assert!(bundle.enough);
    assert_eq!(bundle.value, value);

    votes.push(Vote::generate(&keys[3], value, VoteType::Cert, 2, 3, 0).unwrap());
    let late = block_with_enough_votes(&votes, 3).unwrap();
    assert!(late.enough);
    assert_eq!(late.value, value);
    assert_eq!(late.votes.len(), 3);
}

// ============================================================================
// Finality
// ============================================================================

#[test]
fn test_committee_finalizes_identical_sequences() {
    let mut cluster = Cluster::new(4, test_config());
    cluster.start();

    let done = cluster.run_until(60_000, |c| c.min_finalized() >= 3);
    assert!(done, "only {} values finalized", cluster.min_finalized());

    let reference = cluster.nodes[0].chain.finalized();
    for node in &cluster.nodes[1..] {
        let finalized = node.chain.finalized();
        let common = reference.len().min(finalized.len());
        assert_eq!(&reference[..common], &finalized[..common]);
    }
    assert!(reference.iter().all(|v| *v != NULL_BLOCK_HASH));

    for node in &cluster.nodes {
        let (period, head) = node.db.chain_head().unwrap().unwrap();
        assert_eq!(period as usize, node.chain.finalized().len());
        assert_eq!(Some(&head), node.chain.finalized().last());
        let certified = node.db.certified_value(1).unwrap().unwrap();
        assert_eq!(certified.value, reference[0]);
        assert!(certified.cert_votes.len() >= 3);
    }
}

#[test]
fn test_rounds_never_decrease() {
    let mut cluster = Cluster::new(4, test_config());
    cluster.start();

    let mut last = cluster.rounds();
    for _ in 0..200 {
        cluster.run_until(50, |_| false);
        let now = cluster.rounds();
        for (before, after) in last.iter().zip(&now) {
            assert!(after >= before);
        }
        last = now;
    }
    assert!(last.iter().all(|r| *r > 2));
}

// ============================================================================
// Round advancement from observed votes
// ============================================================================

fn lone_node(config: ordinal_consensus::PbftConfig) -> (TestNode, Vec<ordinal_core::KeyPair>, ManualClock) {
    let keys = test_keys(4);
    let clock = ManualClock::new();
    let stake = Arc::new(StaticStake::equal(&keys, 1));
    let db = Arc::new(ConsensusDb::new(MemoryStorage::new()));
    let node = TestNode::new(0, keys[0].clone(), config, db, stake, &clock);
    (node, keys, clock)
}

fn next_votes(keys: &[ordinal_core::KeyPair], value: ordinal_core::Hash, round: u64, step: u64) -> Vec<Vote> {
    keys.iter()
        .map(|k| Vote::generate(k, value, VoteType::Next, round, step, 0).unwrap())
        .collect()
}

#[test]
fn test_next_vote_quorum_moves_to_following_round() {
    let (mut node, keys, _clock) = lone_node(test_config());
    node.manager.initial_state().unwrap();
    assert_eq!(node.manager.round(), 1);

    for vote in next_votes(&keys[1..], NULL_BLOCK_HASH, 3, 6) {
        assert!(node.handle.submit_external_vote(vote).unwrap());
    }
    node.manager.tick().unwrap();

    assert_eq!(node.manager.round(), 4);
    assert_eq!(node.handle.current_round_and_step(), (4, 1));
    assert_eq!(node.db.round().unwrap(), Some(4));
    assert_eq!(node.db.next_votes(3).unwrap().len(), 3);
    assert_eq!(node.db.two_t_plus_one(3).unwrap(), Some(3));
    assert_eq!(node.manager.next_votes().round(), Some(3));
}

#[test]
fn test_smallest_quorate_round_wins() {
    let (mut node, keys, _clock) = lone_node(test_config());
    node.manager.initial_state().unwrap();

    for vote in next_votes(&keys[1..], NULL_BLOCK_HASH, 5, 4)
        .into_iter()
        .chain(next_votes(&keys[1..], NULL_BLOCK_HASH, 3, 6))
    {
        node.handle.submit_external_vote(vote).unwrap();
    }

    // the driver restarts after every round change
    node.manager.tick().unwrap();
    assert_eq!(node.manager.round(), 4);
    node.manager.tick().unwrap();
    assert_eq!(node.manager.round(), 6);
}

#[test]
fn test_stale_votes_do_not_rewind_round() {
    let (mut node, keys, _clock) = lone_node(test_config());
    node.manager.initial_state().unwrap();
    for vote in next_votes(&keys[1..], NULL_BLOCK_HASH, 3, 6) {
        node.handle.submit_external_vote(vote).unwrap();
    }
    node.manager.tick().unwrap();
    assert_eq!(node.manager.round(), 4);

    for vote in next_votes(&keys[1..], NULL_BLOCK_HASH, 2, 4) {
        assert!(!node.handle.submit_external_vote(vote).unwrap());
    }
    // previous-round next votes still feed the tracker
    let late = next_votes(&keys[1..2], NULL_BLOCK_HASH, 3, 7).remove(0);
    let late_hash = *late.hash();
    assert!(node.handle.submit_external_vote(late).unwrap());
    assert!(node.handle.is_known_vote(&late_hash));

    node.manager.tick().unwrap();
    assert_eq!(node.manager.round(), 4);
}

// ============================================================================
// Give-up timing
// ============================================================================

/// A node restarted in round 2, second finish, whose previous round next
/// voted a value it never received
fn stranded_node() -> (TestNode, ManualClock) {
    let (node, keys, clock) = lone_node(test_config());
    let unseen = hash_tagged(b"test/value", &[b"unseen"]);
    let mut batch = node.db.batch();
    batch.set_round(2).unwrap();
    batch.set_step(5).unwrap();
    batch.set_next_votes(1, &next_votes(&keys[1..], unseen, 1, 4)).unwrap();
    batch.set_two_t_plus_one(1, 3).unwrap();
    node.db.commit(batch).unwrap();
    (node, clock)
}

fn null_next_votes_sent(node: &TestNode) -> Vec<Vote> {
    node.transport
        .sent_votes()
        .into_iter()
        .filter(|v| v.vote_type() == VoteType::Next && *v.value() == NULL_BLOCK_HASH)
        .collect()
}

#[test]
fn test_zero_wait_gives_up_on_first_evaluation() {
    let (mut node, _clock) = stranded_node();
    node.manager.initial_state().unwrap();
    node.manager.set_max_wait_for_soft_voted_block_ms(0);
    node.manager.set_max_wait_for_next_voted_block_ms(0);
    assert_eq!(node.manager.state(), PbftState::SecondFinish);

    assert!(node.manager.tick().unwrap());

    let nulls = null_next_votes_sent(&node);
    assert_eq!(nulls.len(), 1);
    assert_eq!(nulls[0].round(), 2);
    assert_eq!(nulls[0].step(), 5);
}

#[test]
fn test_invalid_next_voted_value_is_abandoned_at_once() {
    let (mut node, _clock) = stranded_node();
    let unseen = hash_tagged(b"test/value", &[b"unseen"]);
    node.chain.hold(unseen);
    node.chain.mark_invalid(unseen);
    node.manager.initial_state().unwrap();

    node.manager.tick().unwrap();

    let nulls = null_next_votes_sent(&node);
    assert_eq!(nulls.len(), 1);
    assert_eq!((nulls[0].round(), nulls[0].step()), (2, 5));
    assert!(node
        .transport
        .sent_votes()
        .iter()
        .all(|v| *v.value() != unseen));
}

#[test]
fn test_default_wait_gives_up_after_threshold() {
    let (mut node, clock) = stranded_node();
    node.manager.initial_state().unwrap();

    node.manager.tick().unwrap();
    assert!(null_next_votes_sent(&node).is_empty());

    clock.advance(test_config().max_wait_for_next_voted_block_ms());
    node.manager.tick().unwrap();
    assert_eq!(null_next_votes_sent(&node).len(), 1);
}

// ============================================================================
// Synced values
// ============================================================================

fn certified(keys: &[ordinal_core::KeyPair], value: ordinal_core::Hash) -> CertifiedValue {
    CertifiedValue {
        value,
        cert_votes: keys
            .iter()
            .map(|k| Vote::generate(k, value, VoteType::Cert, 1, 3, 0).unwrap())
            .collect(),
    }
}

#[test]
fn test_synced_value_with_quorum_is_committed() {
    let (mut node, keys, _clock) = lone_node(test_config());
    node.manager.initial_state().unwrap();
    let value = hash_tagged(b"test/value", &[b"synced"]);
    node.chain.hold(value);
    node.chain.push_synced(certified(&keys[1..], value));

    node.manager.tick().unwrap();

    assert_eq!(node.chain.finalized(), vec![value]);
    assert_eq!(node.db.chain_head().unwrap(), Some((1, value)));
}

#[test]
fn test_synced_value_without_quorum_is_dropped() {
    let (mut node, keys, _clock) = lone_node(test_config());
    node.manager.initial_state().unwrap();
    let value = hash_tagged(b"test/value", &[b"forged"]);
    node.chain.hold(value);
    node.chain.push_synced(certified(&keys[1..3], value));

    node.manager.tick().unwrap();

    assert!(node.chain.finalized().is_empty());
    assert!(node.chain.next_synced_is_empty());
}

#[test]
fn test_synced_value_waits_for_content_without_new_sync_request() {
    let (mut node, keys, clock) = lone_node(test_config());
    node.manager.initial_state().unwrap();
    let value = hash_tagged(b"test/value", &[b"in-flight"]);
    node.chain.push_synced(certified(&keys[1..], value));

    node.manager.tick().unwrap();
    assert!(node.transport.sent_syncs().is_empty());
    assert!(!node.chain.next_synced_is_empty());
    assert!(node.chain.finalized().is_empty());

    node.chain.hold(value);
    clock.advance(2 * test_config().lambda_ms_min);
    assert!(node.manager.tick().unwrap());
    assert_eq!(node.chain.finalized(), vec![value]);
    assert!(node.chain.next_synced_is_empty());
}

// ============================================================================
// Faults
// ============================================================================

#[test]
fn test_conflicting_synced_next_votes_halt_driver() {
    let (mut node, _clock) = stranded_node();
    node.manager.initial_state().unwrap();
    let keys = test_keys(4);
    let rival = hash_tagged(b"test/value", &[b"rival"]);

    let result = node
        .handle
        .submit_synced_next_votes(&next_votes(&keys[1..], rival, 1, 4));
    assert!(matches!(result, Err(ConsensusError::InvariantViolation(_))));
    assert!(node.handle.is_stopped());

    match node.manager.tick() {
        Err(err) => assert!(err.is_fatal(), "unexpected error {}", err),
        Ok(ran) => panic!("halted driver kept running (ran: {})", ran),
    }
    // the halt is sticky
    assert!(node.manager.tick().is_err());
}

/// A lone node that saw round 1 next vote NULL and sits at the start of
/// round 2. Also returns the value it will propose there.
fn node_in_round_two() -> (TestNode, Vec<KeyPair>, ManualClock, Hash) {
    let (mut node, keys, clock) = lone_node(test_config());
    node.manager.initial_state().unwrap();
    for vote in next_votes(&keys[1..], NULL_BLOCK_HASH, 1, 4) {
        node.handle.submit_external_vote(vote).unwrap();
    }
    node.manager.tick().unwrap();
    assert_eq!(node.handle.current_round_and_step(), (2, 1));

    let proposal = hash_tagged(
        b"test/candidate",
        &[&0u64.to_be_bytes(), &0u64.to_be_bytes(), &2u64.to_be_bytes()],
    );
    (node, keys, clock, proposal)
}

fn round_two_votes(keys: &[KeyPair], value: Hash, vote_type: VoteType, step: u64) -> Vec<Vote> {
    keys.iter()
        .map(|k| Vote::generate(k, value, vote_type, 2, step, 0).unwrap())
        .collect()
}

/// Propose, then filter with a soft-vote quorum on `value`, then enter certify
fn soft_vote_quorum(node: &mut TestNode, keys: &[KeyPair], clock: &ManualClock, value: Hash) {
    node.manager.tick().unwrap();
    assert_eq!(node.manager.state(), PbftState::Filter);
    for vote in round_two_votes(&keys[1..3], value, VoteType::Soft, 2) {
        node.handle.submit_external_vote(vote).unwrap();
    }
    clock.advance(2 * test_config().lambda_ms_min);
    node.manager.tick().unwrap();
    assert_eq!(node.manager.state(), PbftState::Certify);
    node.manager.tick().unwrap();
}

fn sent_of_type(node: &TestNode, vote_type: VoteType) -> Vec<Vote> {
    node.transport
        .sent_votes()
        .into_iter()
        .filter(|v| v.vote_type() == vote_type)
        .collect()
}

#[test]
fn test_invalid_leader_value_is_not_certified() {
    let (mut node, keys, clock, proposal) = node_in_round_two();
    node.chain.mark_invalid(proposal);

    soft_vote_quorum(&mut node, &keys, &clock, proposal);
    for _ in 0..40 {
        clock.advance(10);
        node.manager.tick().unwrap();
    }

    assert!(sent_of_type(&node, VoteType::Soft)
        .iter()
        .any(|v| *v.value() == proposal));
    assert!(sent_of_type(&node, VoteType::Cert).is_empty());
    assert_eq!(node.manager.last_cert_voted_value(), NULL_BLOCK_HASH);
    assert!(node
        .transport
        .sent_syncs()
        .contains(&(SyncReason::InvalidSoftVotedValue, proposal)));
    assert!(null_next_votes_sent(&node)
        .iter()
        .any(|v| v.round() == 2 && v.step() == 4));
    assert!(node.chain.finalized().is_empty());
}

#[test]
fn test_cert_voted_value_finalized_elsewhere_is_fatal() {
    let (mut node, keys, clock, proposal) = node_in_round_two();
    soft_vote_quorum(&mut node, &keys, &clock, proposal);
    assert_eq!(node.manager.last_cert_voted_value(), proposal);

    // the value reaches the chain behind the driver's back
    node.chain.commit(&proposal, &[]).unwrap();
    for vote in round_two_votes(&keys[1..3], proposal, VoteType::Cert, 3) {
        node.handle.submit_external_vote(vote).unwrap();
    }
    clock.advance(test_config().polling_interval_ms);

    assert!(matches!(
        node.manager.tick(),
        Err(ConsensusError::InvariantViolation(_))
    ));
}

#[test]
fn test_redundant_cert_quorums_commit_once() {
    let (mut node, keys, clock, proposal) = node_in_round_two();
    let polling = test_config().polling_interval_ms;
    soft_vote_quorum(&mut node, &keys, &clock, proposal);
    assert_eq!(sent_of_type(&node, VoteType::Cert).len(), 1);

    for vote in round_two_votes(&keys[1..3], proposal, VoteType::Cert, 3) {
        node.handle.submit_external_vote(vote).unwrap();
    }
    clock.advance(polling);
    node.manager.tick().unwrap();
    assert_eq!(node.chain.finalized(), vec![proposal]);
    assert!(node.db.status(PbftStatus::ExecutedInRound).unwrap());

    // a late cert vote grows the quorum
    for vote in round_two_votes(&keys[3..], proposal, VoteType::Cert, 3) {
        node.handle.submit_external_vote(vote).unwrap();
    }
    clock.advance(polling);
    node.manager.tick().unwrap();

    // and sync delivers the same value again
    node.chain.push_synced(certified(&keys[1..], proposal));
    clock.advance(polling);
    node.manager.tick().unwrap();

    assert_eq!(node.chain.finalized(), vec![proposal]);
    assert_eq!(node.chain.finalized_period(), 1);
    assert_eq!(node.db.chain_head().unwrap(), Some((1, proposal)));
    assert!(node.db.status(PbftStatus::ExecutedInRound).unwrap());
    assert!(node.chain.next_synced_is_empty());
    assert_eq!(node.manager.round(), 2);
}
