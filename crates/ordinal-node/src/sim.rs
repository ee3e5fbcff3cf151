//! In-memory collaborators of a simulated committee

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ordinal_consensus::{
    CertifiedValue, ConsensusDb, ConsensusError, Eligibility, PbftHandle, SyncReason, Transport,
    ValueSource, Vote,
};
use ordinal_core::{
    hash_tagged, serialize, Hash, KeyPair, Period, Proposal, ProposalHeader, PublicKey, StakeSnapshot,
};
use ordinal_state::{FileStorage, Storage, WriteBatch};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Every proposal ever made in the simulation, keyed by hash. Stands in
/// for content a validator could fetch from the network.
#[derive(Default)]
pub struct SimulatedDag {
    proposals: RwLock<HashMap<Hash, Proposal>>,
}

impl SimulatedDag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anchor block the DAG offers for `period`
    pub fn anchor(&self, period: Period) -> Hash {
        hash_tagged(b"ordinal/sim/anchor", &[&period.to_be_bytes()])
    }

    pub fn publish(&self, hash: Hash, proposal: Proposal) {
        self.proposals.write().insert(hash, proposal);
    }

    pub fn get(&self, hash: &Hash) -> Option<Proposal> {
        self.proposals.read().get(hash).cloned()
    }
}

const PROPOSAL_PREFIX: &[u8] = b"sim/proposal/";

fn proposal_key(hash: &Hash) -> Vec<u8> {
    [PROPOSAL_PREFIX, hash.as_bytes().as_slice()].concat()
}

/// Canonical chain of one validator. Every proposal it has seen is kept in
/// `store` so that a restarted validator can serve and finish them.
pub struct SimulatedChain {
    keypair: KeyPair,
    dag: Arc<SimulatedDag>,
    store: Mutex<Box<dyn Storage>>,
    known: RwLock<HashMap<Hash, Proposal>>,
    finalized: RwLock<Vec<Hash>>,
    synced: Mutex<VecDeque<CertifiedValue>>,
}

impl SimulatedChain {
    pub fn new(keypair: KeyPair, dag: Arc<SimulatedDag>, store: Box<dyn Storage>) -> Self {
        SimulatedChain {
            keypair,
            dag,
            store: Mutex::new(store),
            known: RwLock::new(HashMap::new()),
            finalized: RwLock::new(Vec::new()),
            synced: Mutex::new(VecDeque::new()),
        }
    }

    /// Reload stored proposals into the DAG and rebuild the finalized
    /// sequence from the certified values in `db`
    pub fn restore<S: Storage>(&self, db: &ConsensusDb<S>) -> Result<(), ConsensusError> {
        let stored = self.store.lock().scan_prefix(PROPOSAL_PREFIX);
        {
            let mut known = self.known.write();
            for (key, bytes) in stored {
                let Some(hash) = Hash::from_slice(&key[PROPOSAL_PREFIX.len()..]) else {
                    continue;
                };
                let proposal: Proposal = serialize::from_bytes(&bytes)?;
                self.dag.publish(hash, proposal.clone());
                known.insert(hash, proposal);
            }
        }

        let Some((head, _)) = db.chain_head()? else {
            return Ok(());
        };
        let mut finalized = self.finalized.write();
        finalized.clear();
        for period in 1..=head {
            match db.certified_value(period)? {
                Some(certified) => finalized.push(certified.value),
                None => {
                    return Err(ConsensusError::InvariantViolation(format!(
                        "certified value of period {} missing below head {}",
                        period, head
                    )))
                }
            }
        }
        info!(
            "Restored {} finalized periods and {} proposals",
            finalized.len(),
            self.known.read().len()
        );
        Ok(())
    }

    fn remember(&self, hash: Hash, proposal: Proposal) {
        if self.known.read().contains_key(&hash) {
            return;
        }
        match serialize::to_bytes(&proposal) {
            Ok(bytes) => {
                let mut batch = WriteBatch::new();
                batch.put(proposal_key(&hash), bytes);
                if let Err(e) = self.store.lock().write(batch) {
                    warn!("Cannot store proposal {}: {}", hash.short(), e);
                }
            }
            Err(e) => warn!("Cannot encode proposal {}: {}", hash.short(), e),
        }
        self.known.write().insert(hash, proposal);
    }

    /// Content for `hash` arrived from the network
    pub fn receive_value(&self, hash: &Hash) {
        if let Some(proposal) = self.dag.get(hash) {
            self.remember(*hash, proposal);
        }
    }

    pub fn enqueue_synced(&self, certified: CertifiedValue) {
        self.receive_value(&certified.value);
        self.synced.lock().push_back(certified);
    }

    pub fn has_synced(&self) -> bool {
        !self.synced.lock().is_empty()
    }

    pub fn finalized(&self) -> Vec<Hash> {
        self.finalized.read().clone()
    }

    pub fn finalized_len(&self) -> usize {
        self.finalized.read().len()
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl ValueSource for SimulatedChain {
    fn candidate_value(&self, _round: u64) -> Option<Hash> {
        let period = self.finalized_period() + 1;
        let header = ProposalHeader {
            prev_hash: self.last_finalized_value(),
            anchor: self.dag.anchor(period),
            period,
            proposer: self.keypair.public,
            timestamp: Self::now_ms(),
        };
        let proposal = match Proposal::new_signed(header, &self.keypair) {
            Ok(proposal) => proposal,
            Err(e) => {
                warn!("Cannot sign proposal: {}", e);
                return None;
            }
        };
        let hash = match proposal.hash() {
            Ok(hash) => hash,
            Err(e) => {
                warn!("Cannot hash proposal: {}", e);
                return None;
            }
        };
        self.dag.publish(hash, proposal.clone());
        self.remember(hash, proposal);
        Some(hash)
    }

    fn is_value_available(&self, value: &Hash) -> bool {
        self.known.read().contains_key(value)
    }

    fn is_value_valid(&self, value: &Hash) -> bool {
        let Some(proposal) = self.known.read().get(value).cloned() else {
            return false;
        };
        if let Err(e) = proposal.verify_signature() {
            warn!("Proposal {} has a bad signature: {}", value.short(), e);
            return false;
        }
        proposal.header.period == self.finalized_period() + 1
            && proposal.header.prev_hash == self.last_finalized_value()
            && proposal.header.anchor == self.dag.anchor(proposal.header.period)
    }

    fn is_finalized(&self, value: &Hash) -> bool {
        self.finalized.read().contains(value)
    }

    fn finalized_period(&self) -> Period {
        self.finalized.read().len() as Period
    }

    fn last_finalized_value(&self) -> Hash {
        self.finalized.read().last().copied().unwrap_or(Hash::ZERO)
    }

    fn commit(&self, value: &Hash, cert_votes: &[Vote]) -> Result<Period, ConsensusError> {
        let mut finalized = self.finalized.write();
        finalized.push(*value);
        let period = finalized.len() as Period;
        debug!(
            "Executed period {} ({}) with {} cert votes",
            period,
            value.short(),
            cert_votes.len()
        );
        Ok(period)
    }

    fn next_synced(&self) -> Option<CertifiedValue> {
        self.synced.lock().front().cloned()
    }

    fn pop_synced(&self) {
        self.synced.lock().pop_front();
    }

    fn clear_synced(&self) {
        self.synced.lock().clear();
    }
}

/// Stake table that never changes across periods
pub struct StakeEligibility {
    snapshot: StakeSnapshot,
}

impl StakeEligibility {
    pub fn new(snapshot: StakeSnapshot) -> Self {
        StakeEligibility { snapshot }
    }
}

impl Eligibility for StakeEligibility {
    fn total_weight(&self, _period: Period) -> Result<u64, ConsensusError> {
        Ok(self.snapshot.total_weight())
    }

    fn weight_of(&self, validator: &PublicKey, _period: Period) -> Result<u64, ConsensusError> {
        Ok(self.snapshot.weight_of(validator))
    }
}

/// Gossip payloads. Votes travel in wire encoding.
#[derive(Debug, Clone)]
pub enum Message {
    Votes(Vec<Vec<u8>>),
    Value(Hash),
    NextVotesBundle(Vec<Vec<u8>>),
    SyncRequest(SyncReason, Hash),
}

#[derive(Debug)]
pub struct Envelope {
    pub from: usize,
    pub message: Message,
}

/// Outbound side of one validator
pub struct SimulatedTransport {
    index: usize,
    tx: mpsc::UnboundedSender<Envelope>,
    syncing: Arc<AtomicBool>,
}

impl SimulatedTransport {
    pub fn new(index: usize, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        SimulatedTransport {
            index,
            tx,
            syncing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn syncing_flag(&self) -> Arc<AtomicBool> {
        self.syncing.clone()
    }

    fn send(&self, message: Message) {
        if self.tx.send(Envelope { from: self.index, message }).is_err() {
            debug!("Router gone, dropping message from validator {}", self.index);
        }
    }

    fn encode(votes: &[Vote]) -> Vec<Vec<u8>> {
        votes
            .iter()
            .filter_map(|v| match v.to_bytes() {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!("Cannot encode {}: {}", v, e);
                    None
                }
            })
            .collect()
    }
}

impl Transport for SimulatedTransport {
    fn broadcast_votes(&self, votes: Vec<Vote>) {
        self.send(Message::Votes(Self::encode(&votes)));
    }

    fn broadcast_value(&self, value: &Hash) {
        self.send(Message::Value(*value));
    }

    fn broadcast_next_votes_bundle(&self, votes: Vec<Vote>) {
        self.send(Message::NextVotesBundle(Self::encode(&votes)));
    }

    fn request_sync(&self, reason: SyncReason, hint: &Hash) {
        self.syncing.store(true, Ordering::SeqCst);
        self.send(Message::SyncRequest(reason, *hint));
    }

    fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }
}

/// Receiving side of one validator
pub struct Peer {
    pub handle: PbftHandle<FileStorage>,
    pub chain: Arc<SimulatedChain>,
    pub db: Arc<ConsensusDb<FileStorage>>,
    pub syncing: Arc<AtomicBool>,
}

fn decode(bytes: &[Vec<u8>]) -> Vec<Vote> {
    bytes
        .iter()
        .filter_map(|b| match Vote::from_bytes(b) {
            Ok(vote) => Some(vote),
            Err(e) => {
                warn!("Undecodable vote: {}", e);
                None
            }
        })
        .collect()
}

fn report(from: usize, to: usize, err: &ConsensusError) {
    if err.is_fatal() {
        error!("Validator {} halted on data from validator {}: {}", to, from, err);
    } else if err.is_peer_fault() {
        warn!("Validator {} rejects data from validator {}: {}", to, from, err);
    } else {
        debug!("Validator {} could not take data from validator {}: {}", to, from, err);
    }
}

fn deliver(peers: &[Peer], envelope: &Envelope) {
    let from = envelope.from;
    match &envelope.message {
        Message::Votes(bytes) => {
            let votes = decode(bytes);
            for (to, peer) in peers.iter().enumerate().filter(|(to, _)| *to != from) {
                for vote in &votes {
                    if let Err(e) = peer.handle.submit_external_vote(vote.clone()) {
                        report(from, to, &e);
                    }
                }
            }
        }
        Message::Value(hash) => {
            for (_, peer) in peers.iter().enumerate().filter(|(to, _)| *to != from) {
                peer.chain.receive_value(hash);
            }
        }
        Message::NextVotesBundle(bytes) => {
            let votes = decode(bytes);
            for (to, peer) in peers.iter().enumerate().filter(|(to, _)| *to != from) {
                if let Err(e) = peer.handle.submit_synced_next_votes(&votes) {
                    report(from, to, &e);
                }
            }
        }
        Message::SyncRequest(reason, hint) => serve_sync(peers, from, *reason, hint),
    }
}

/// Answer a sync request from the peer with the longest chain
fn serve_sync(peers: &[Peer], from: usize, reason: SyncReason, hint: &Hash) {
    let requester = &peers[from];
    requester.chain.receive_value(hint);

    let have = requester.chain.finalized_period();
    let best = peers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != from)
        .max_by_key(|(_, p)| p.chain.finalized_period());

    if let Some((index, source)) = best {
        let available = source.chain.finalized_period();
        if available > have && !requester.chain.has_synced() {
            info!(
                "Syncing validator {} ({:?}) periods {}..={} from validator {}",
                from,
                reason,
                have + 1,
                available,
                index
            );
            for period in have + 1..=available {
                match source.db.certified_value(period) {
                    Ok(Some(certified)) => requester.chain.enqueue_synced(certified),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Validator {} cannot read period {}: {}", index, period, e);
                        break;
                    }
                }
            }
        }

        let (round, _) = requester.handle.current_round_and_step();
        if let Some(votes) = source.handle.next_votes_for_sync(round) {
            if let Err(e) = requester.handle.submit_synced_next_votes(&votes) {
                report(index, from, &e);
            }
        }
    }
    requester.syncing.store(false, Ordering::SeqCst);
}

/// Deliver every envelope to its recipients after `delay`
pub async fn route(mut rx: mpsc::UnboundedReceiver<Envelope>, peers: Arc<Vec<Peer>>, delay: Duration) {
    while let Some(envelope) = rx.recv().await {
        let peers = peers.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            deliver(&peers, &envelope);
        });
    }
    debug!("Router stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordinal_state::MemoryStorage;

    fn chain(seed: u64, dag: &Arc<SimulatedDag>) -> SimulatedChain {
        SimulatedChain::new(
            KeyPair::from_seed("sim-test", seed),
            dag.clone(),
            Box::new(MemoryStorage::new()),
        )
    }

    #[test]
    fn test_candidate_is_known_locally_only() {
        let dag = Arc::new(SimulatedDag::new());
        let proposer = chain(0, &dag);
        let other = chain(1, &dag);

        let value = proposer.candidate_value(2).unwrap();
        assert!(proposer.is_value_available(&value));
        assert!(proposer.is_value_valid(&value));
        assert!(!other.is_value_available(&value));

        other.receive_value(&value);
        assert!(other.is_value_valid(&value));
    }

    #[test]
    fn test_stale_proposal_is_invalid_after_commit() {
        let dag = Arc::new(SimulatedDag::new());
        let a = chain(0, &dag);
        let first = a.candidate_value(2).unwrap();
        let second = a.candidate_value(2).unwrap();

        assert_eq!(a.commit(&first, &[]).unwrap(), 1);
        assert!(a.is_finalized(&first));
        assert!(!a.is_value_valid(&second));
        let next = a.candidate_value(3).unwrap();
        assert!(a.is_value_valid(&next));
    }

    #[test]
    fn test_restore_reloads_proposals_and_chain() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("chain.db");
        let db = ConsensusDb::new(MemoryStorage::new());
        let keypair = KeyPair::from_seed("sim-test", 0);

        let value = {
            let dag = Arc::new(SimulatedDag::new());
            let store = FileStorage::new(&store_path).unwrap();
            let a = SimulatedChain::new(keypair.clone(), dag, Box::new(store));
            let value = a.candidate_value(2).unwrap();
            a.commit(&value, &[]).unwrap();
            let mut batch = db.batch();
            batch.set_chain_head(1, value).unwrap();
            batch
                .set_certified_value(1, &CertifiedValue { value, cert_votes: Vec::new() })
                .unwrap();
            db.commit(batch).unwrap();
            value
        };

        let dag = Arc::new(SimulatedDag::new());
        let store = FileStorage::new(&store_path).unwrap();
        let restored = SimulatedChain::new(keypair, dag.clone(), Box::new(store));
        restored.restore(&db).unwrap();

        assert_eq!(restored.finalized(), vec![value]);
        assert!(restored.is_value_available(&value));
        assert!(dag.get(&value).is_some());
    }

    #[test]
    fn test_synced_queue_order() {
        let dag = Arc::new(SimulatedDag::new());
        let a = chain(0, &dag);
        for i in 0..3u8 {
            a.enqueue_synced(CertifiedValue {
                value: hash_tagged(b"test", &[&[i]]),
                cert_votes: Vec::new(),
            });
        }
        assert_eq!(a.next_synced().unwrap().value, hash_tagged(b"test", &[&[0]]));
        a.pop_synced();
        assert_eq!(a.next_synced().unwrap().value, hash_tagged(b"test", &[&[1]]));
        a.clear_synced();
        assert!(!a.has_synced());
    }

    #[test]
    fn test_stake_eligibility() {
        let keys: Vec<KeyPair> = (0..3).map(|i| KeyPair::from_seed("sim-test", i)).collect();
        let snapshot = StakeSnapshot::new(
            0,
            keys.iter().map(|k| ordinal_core::StakeEntry {
                validator: k.public,
                weight: 2,
            }),
        );
        let eligibility = StakeEligibility::new(snapshot);
        assert_eq!(eligibility.total_weight(7).unwrap(), 6);
        assert_eq!(eligibility.weight_of(&keys[1].public, 7).unwrap(), 2);
        assert_eq!(
            eligibility
                .weight_of(&KeyPair::from_seed("sim-test", 9).public, 0)
                .unwrap(),
            0
        );
    }
}
