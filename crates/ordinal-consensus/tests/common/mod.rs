//! In-process committee driven by a shared manual clock

#![allow(dead_code)]

use ordinal_consensus::{
    Clock, ConsensusDb, ConsensusError, Eligibility, ManualClock, PbftConfig, PbftContext,
    PbftHandle, PbftManager, SyncReason, Transport, ValueSource, Vote,
};
use ordinal_core::{hash_tagged, Hash, KeyPair, Period, PublicKey, StakeEntry, StakeSnapshot};
use ordinal_state::MemoryStorage;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

pub type Db = ConsensusDb<MemoryStorage>;

pub fn test_keys(n: usize) -> Vec<KeyPair> {
    (0..n as u64).map(|i| KeyPair::from_seed("test-committee", i)).collect()
}

pub fn test_config() -> PbftConfig {
    PbftConfig {
        lambda_ms_min: 100,
        committee_size: 4,
        polling_interval_ms: 10,
        ..PbftConfig::default()
    }
}

/// Chain of one validator. Content is "available" once the validator has
/// seen the value announced.
pub struct TestChain {
    id: u64,
    held: Mutex<HashSet<Hash>>,
    invalid: Mutex<HashSet<Hash>>,
    finalized: Mutex<Vec<Hash>>,
    synced: Mutex<Vec<ordinal_consensus::CertifiedValue>>,
}

impl TestChain {
    pub fn new(id: u64) -> Self {
        TestChain {
            id,
            held: Mutex::new(HashSet::new()),
            invalid: Mutex::new(HashSet::new()),
            finalized: Mutex::new(Vec::new()),
            synced: Mutex::new(Vec::new()),
        }
    }

    pub fn hold(&self, value: Hash) {
        self.held.lock().insert(value);
    }

    pub fn mark_invalid(&self, value: Hash) {
        self.invalid.lock().insert(value);
    }

    pub fn finalized(&self) -> Vec<Hash> {
        self.finalized.lock().clone()
    }

    pub fn push_synced(&self, certified: ordinal_consensus::CertifiedValue) {
        self.synced.lock().push(certified);
    }

    pub fn next_synced_is_empty(&self) -> bool {
        self.synced.lock().is_empty()
    }
}

impl ValueSource for TestChain {
    fn candidate_value(&self, round: u64) -> Option<Hash> {
        let period = self.finalized.lock().len() as u64;
        let value = hash_tagged(
            b"test/candidate",
            &[&self.id.to_be_bytes(), &period.to_be_bytes(), &round.to_be_bytes()],
        );
        self.hold(value);
        Some(value)
    }

    fn is_value_available(&self, value: &Hash) -> bool {
        self.held.lock().contains(value)
    }

    fn is_value_valid(&self, value: &Hash) -> bool {
        !self.invalid.lock().contains(value)
    }

    fn is_finalized(&self, value: &Hash) -> bool {
        self.finalized.lock().contains(value)
    }

    fn finalized_period(&self) -> Period {
        self.finalized.lock().len() as Period
    }

    fn last_finalized_value(&self) -> Hash {
        self.finalized.lock().last().copied().unwrap_or(Hash::ZERO)
    }

    fn commit(&self, value: &Hash, _cert_votes: &[Vote]) -> Result<Period, ConsensusError> {
        let mut finalized = self.finalized.lock();
        finalized.push(*value);
        Ok(finalized.len() as Period)
    }

    fn next_synced(&self) -> Option<ordinal_consensus::CertifiedValue> {
        self.synced.lock().first().cloned()
    }

    fn pop_synced(&self) {
        let mut synced = self.synced.lock();
        if !synced.is_empty() {
            synced.remove(0);
        }
    }

    fn clear_synced(&self) {
        self.synced.lock().clear();
    }
}

/// Same stake table for every period
pub struct StaticStake(pub StakeSnapshot);

impl StaticStake {
    pub fn equal(keys: &[KeyPair], weight: u64) -> Self {
        StaticStake(StakeSnapshot::new(
            0,
            keys.iter().map(|k| StakeEntry {
                validator: k.public,
                weight,
            }),
        ))
    }
}

impl Eligibility for StaticStake {
    fn total_weight(&self, _period: Period) -> Result<u64, ConsensusError> {
        Ok(self.0.total_weight())
    }

    fn weight_of(&self, validator: &PublicKey, _period: Period) -> Result<u64, ConsensusError> {
        Ok(self.0.weight_of(validator))
    }
}

#[derive(Debug, Clone)]
pub enum Outbound {
    Votes(Vec<Vote>),
    Value(Hash),
    NextVotesBundle(Vec<Vote>),
    Sync(SyncReason, Hash),
}

#[derive(Default)]
pub struct TestTransport {
    outbox: Mutex<Vec<Outbound>>,
}

impl TestTransport {
    pub fn drain(&self) -> Vec<Outbound> {
        std::mem::take(&mut *self.outbox.lock())
    }

    pub fn sent_votes(&self) -> Vec<Vote> {
        self.outbox
            .lock()
            .iter()
            .filter_map(|m| match m {
                Outbound::Votes(votes) => Some(votes.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn sent_syncs(&self) -> Vec<(SyncReason, Hash)> {
        self.outbox
            .lock()
            .iter()
            .filter_map(|m| match m {
                Outbound::Sync(reason, hint) => Some((*reason, *hint)),
                _ => None,
            })
            .collect()
    }
}

impl Transport for TestTransport {
    fn broadcast_votes(&self, votes: Vec<Vote>) {
        self.outbox.lock().push(Outbound::Votes(votes));
    }

    fn broadcast_value(&self, value: &Hash) {
        self.outbox.lock().push(Outbound::Value(*value));
    }

    fn broadcast_next_votes_bundle(&self, votes: Vec<Vote>) {
        self.outbox.lock().push(Outbound::NextVotesBundle(votes));
    }

    fn request_sync(&self, reason: SyncReason, hint: &Hash) {
        self.outbox.lock().push(Outbound::Sync(reason, *hint));
    }
}

pub struct TestNode {
    pub keypair: KeyPair,
    pub manager: PbftManager<MemoryStorage>,
    pub handle: PbftHandle<MemoryStorage>,
    pub db: Arc<Db>,
    pub chain: Arc<TestChain>,
    pub transport: Arc<TestTransport>,
}

impl TestNode {
    pub fn new(
        id: u64,
        keypair: KeyPair,
        config: PbftConfig,
        db: Arc<Db>,
        stake: Arc<StaticStake>,
        clock: &ManualClock,
    ) -> Self {
        let chain = Arc::new(TestChain::new(id));
        let transport = Arc::new(TestTransport::default());
        let manager = PbftManager::new(
            config,
            keypair.clone(),
            db.clone(),
            PbftContext {
                chain: chain.clone(),
                eligibility: stake,
                transport: transport.clone(),
                clock: Arc::new(clock.clone()),
            },
        )
        .unwrap();
        let handle = manager.handle();
        TestNode {
            keypair,
            manager,
            handle,
            db,
            chain,
            transport,
        }
    }
}

pub struct Cluster {
    pub clock: ManualClock,
    pub keys: Vec<KeyPair>,
    pub stake: Arc<StaticStake>,
    pub nodes: Vec<TestNode>,
}

impl Cluster {
    pub fn new(n: usize, config: PbftConfig) -> Self {
        let clock = ManualClock::new();
        let keys = test_keys(n);
        let stake = Arc::new(StaticStake::equal(&keys, 1));
        let nodes = keys
            .iter()
            .enumerate()
            .map(|(i, kp)| {
                let db = Arc::new(ConsensusDb::new(MemoryStorage::new()));
                TestNode::new(i as u64, kp.clone(), config.clone(), db, stake.clone(), &clock)
            })
            .collect();
        Cluster {
            clock,
            keys,
            stake,
            nodes,
        }
    }

    pub fn start(&mut self) {
        for node in &mut self.nodes {
            node.manager.initial_state().unwrap();
        }
    }

    /// Hand every outbound message to every other node
    pub fn deliver(&mut self) -> usize {
        let mut delivered = 0;
        for from in 0..self.nodes.len() {
            for message in self.nodes[from].transport.drain() {
                delivered += 1;
                for (to, node) in self.nodes.iter().enumerate() {
                    if to == from {
                        continue;
                    }
                    match &message {
                        Outbound::Votes(votes) => {
                            for vote in votes {
                                let _ = node.handle.submit_external_vote(vote.clone());
                            }
                        }
                        Outbound::Value(value) => node.chain.hold(*value),
                        Outbound::NextVotesBundle(votes) => {
                            let _ = node.handle.submit_synced_next_votes(votes);
                        }
                        Outbound::Sync(..) => {}
                    }
                }
            }
        }
        delivered
    }

    /// Tick every node that is due until nothing moves at the current time
    pub fn settle(&mut self) {
        for _ in 0..1_000 {
            let mut ran = false;
            for node in &mut self.nodes {
                ran |= node.manager.tick().unwrap();
            }
            let delivered = self.deliver();
            if !ran && delivered == 0 {
                return;
            }
        }
        panic!("committee did not settle at {} ms", self.clock.now_ms());
    }

    /// Advance time until `done` holds or `max_ms` of simulated time passed
    pub fn run_until(&mut self, max_ms: u64, mut done: impl FnMut(&Cluster) -> bool) -> bool {
        let deadline = self.clock.now_ms() + max_ms;
        loop {
            self.settle();
            if done(self) {
                return true;
            }
            if self.clock.now_ms() >= deadline {
                return false;
            }
            let wait = self
                .nodes
                .iter()
                .map(|n| n.manager.time_to_next_step_ms())
                .min()
                .unwrap_or(1)
                .max(1);
            self.clock.advance(wait);
        }
    }

    pub fn rounds(&self) -> Vec<u64> {
        self.nodes.iter().map(|n| n.manager.round()).collect()
    }

    pub fn min_finalized(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| n.chain.finalized().len())
            .min()
            .unwrap_or(0)
    }
}
