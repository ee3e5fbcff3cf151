use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use ordinal_consensus::{
    ConsensusDb, ConsensusError, PbftContext, PbftHandle, PbftManager, SystemClock, VoteManager,
};
use ordinal_core::Hash;
use ordinal_state::FileStorage;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::NodeConfig;
use crate::sim::{route, Peer, SimulatedChain, SimulatedDag, SimulatedTransport, StakeEligibility};

const PROGRESS_INTERVAL_MS: u64 = 100;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Validators {first} and {second} finalized different values at period {period}")]
    Diverged {
        first: usize,
        second: usize,
        period: usize,
    },

    #[error("Driver of validator {index} halted: {reason}")]
    DriverHalted { index: usize, reason: String },
}

/// Outcome of a committee run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub finalized: Vec<usize>,
    pub rounds: Vec<u64>,
    pub head: Option<String>,
}

struct Validator {
    handle: PbftHandle<FileStorage>,
    join: JoinHandle<Result<(), ConsensusError>>,
    chain: Arc<SimulatedChain>,
}

/// An in-process committee of validators sharing a simulated network
pub struct Node {
    config: NodeConfig,
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Node { config })
    }

    /// Consensus database and proposal store of validator `index`
    fn open_storage(&self, index: usize) -> Result<(Arc<ConsensusDb<FileStorage>>, FileStorage)> {
        let dir = self.config.validator_dir(index);
        std::fs::create_dir_all(&dir)?;
        let db = ConsensusDb::new(FileStorage::new(dir.join("consensus.db"))?);
        let chain = FileStorage::new(dir.join("chain.db"))?;
        Ok((Arc::new(db), chain))
    }

    /// Run until every validator finalized the configured number of periods
    pub async fn run(self) -> Result<RunSummary> {
        let keys = self.config.keypairs()?;
        let eligibility = Arc::new(StakeEligibility::new(self.config.stake_snapshot(&keys)));
        let dag = Arc::new(SimulatedDag::new());
        let (tx, rx) = mpsc::unbounded_channel();

        info!(
            "Starting committee of {} validators (lambda {} ms)",
            keys.len(),
            self.config.pbft.lambda_ms_min
        );

        let mut validators = Vec::with_capacity(keys.len());
        let mut peers = Vec::with_capacity(keys.len());
        for (index, keypair) in keys.into_iter().enumerate() {
            let (db, store) = self.open_storage(index)?;
            let chain = Arc::new(SimulatedChain::new(keypair.clone(), dag.clone(), Box::new(store)));
            chain.restore(&db)?;
            let transport = SimulatedTransport::new(index, tx.clone());
            let syncing = transport.syncing_flag();

            info!("Validator {}: {}", index, keypair.public);
            let manager = PbftManager::new(
                self.config.pbft.clone(),
                keypair,
                db.clone(),
                PbftContext {
                    chain: chain.clone(),
                    eligibility: eligibility.clone(),
                    transport: Arc::new(transport),
                    clock: Arc::new(SystemClock::new()),
                },
            )?;
            let (handle, join) = manager.start()?;

            peers.push(Peer {
                handle: handle.clone(),
                chain: chain.clone(),
                db,
                syncing,
            });
            validators.push(Validator {
                handle,
                join,
                chain,
            });
        }
        drop(tx);

        let delay = Duration::from_millis(self.config.network_delay_ms);
        let router = tokio::spawn(route(rx, Arc::new(peers), delay));

        let outcome = self.wait_for_periods(&validators).await;

        for validator in &validators {
            validator.handle.stop();
        }
        router.abort();

        let mut halted = None;
        let mut summary = RunSummary {
            finalized: Vec::new(),
            rounds: Vec::new(),
            head: None,
        };
        let mut chains = Vec::new();
        for (index, validator) in validators.into_iter().enumerate() {
            summary.rounds.push(validator.handle.current_round_and_step().0);
            chains.push(validator.chain.finalized());
            let joined = tokio::task::spawn_blocking(move || validator.join.join()).await?;
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Validator {} stopped with: {}", index, e);
                    halted.get_or_insert(RunError::DriverHalted {
                        index,
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    halted.get_or_insert(RunError::DriverHalted {
                        index,
                        reason: "driver thread panicked".to_string(),
                    });
                }
            }
        }

        if let Some(err) = halted {
            return Err(err.into());
        }
        outcome?;
        check_agreement(&chains)?;

        summary.finalized = chains.iter().map(Vec::len).collect();
        summary.head = chains
            .iter()
            .max_by_key(|c| c.len())
            .and_then(|c| c.last())
            .map(Hash::to_hex);
        info!(
            "Committee stopped: finalized {:?}, rounds {:?}",
            summary.finalized, summary.rounds
        );
        Ok(summary)
    }

    async fn wait_for_periods(&self, validators: &[Validator]) -> Result<()> {
        let target = self.config.periods as usize;
        let mut interval = tokio::time::interval(Duration::from_millis(PROGRESS_INTERVAL_MS));
        let mut reported = 0;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted, stopping committee");
                    return Ok(());
                }
            }

            if let Some(index) = validators.iter().position(|v| v.handle.is_stopped()) {
                warn!("Driver of validator {} is no longer running", index);
                return Ok(());
            }

            let done = validators
                .iter()
                .map(|v| v.chain.finalized_len())
                .min()
                .unwrap_or(0);
            if done > reported {
                info!("All validators finalized period {}", done);
                reported = done;
            }
            if done >= target {
                return Ok(());
            }
        }
    }
}

/// Every pair of finalized sequences must agree on their common prefix
fn check_agreement(chains: &[Vec<Hash>]) -> Result<(), RunError> {
    let Some(reference) = chains.iter().max_by_key(|c| c.len()) else {
        return Ok(());
    };
    let first = chains.iter().position(|c| c.len() == reference.len()).unwrap_or(0);
    for (second, chain) in chains.iter().enumerate() {
        if let Some(period) = chain.iter().zip(reference).position(|(a, b)| a != b) {
            return Err(RunError::Diverged {
                first,
                second,
                period: period + 1,
            });
        }
    }
    Ok(())
}

/// Persisted consensus state of every validator
pub fn inspect(config: &NodeConfig) -> Result<serde_json::Value> {
    let mut validators = Vec::with_capacity(config.validators);
    for index in 0..config.validators {
        let path = config.validator_dir(index).join("consensus.db");
        if !path.exists() {
            validators.push(serde_json::json!({ "index": index, "initialized": false }));
            continue;
        }
        let db = ConsensusDb::new(FileStorage::new(path)?);
        let round = db.round()?.unwrap_or(1);
        let next_votes = if round > 1 { db.next_votes(round - 1)? } else { Vec::new() };
        let next_votes: serde_json::Value = serde_json::from_str(&VoteManager::<FileStorage>::votes_json(&next_votes)?)?;
        let head = db.chain_head()?;
        validators.push(serde_json::json!({
            "index": index,
            "initialized": true,
            "round": round,
            "step": db.step()?.unwrap_or(1),
            "period": head.map(|(period, _)| period).unwrap_or(0),
            "head": head.map(|(_, value)| value.to_hex()),
            "previous_round_next_votes": next_votes,
        }));
    }
    Ok(serde_json::json!({ "validators": validators }))
}
