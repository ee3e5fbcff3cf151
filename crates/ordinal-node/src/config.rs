use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use ordinal_consensus::PbftConfig;
use ordinal_core::{KeyPair, StakeEntry, StakeSnapshot};
use serde::{Deserialize, Serialize};

/// Label the committee keys are derived from when none are configured
const KEY_SEED_LABEL: &str = "ordinal/local-committee";

/// Simulated committee configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory; validator `i` persists under `validator-i/`
    pub data_dir: PathBuf,

    /// Number of in-process validators
    pub validators: usize,

    /// Stake units per validator. Missing entries default to 1.
    pub stake: Vec<u64>,

    /// Validator secret keys (hex). Derived from the index when empty.
    pub validator_keys: Vec<String>,

    /// Stop after this many finalized periods
    pub periods: u64,

    /// One-way delay of the simulated network in milliseconds
    pub network_delay_ms: u64,

    /// Consensus parameters shared by every validator
    pub pbft: PbftConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: PathBuf::from("./ordinal-data"),
            validators: 4,
            stake: Vec::new(),
            validator_keys: Vec::new(),
            periods: 5,
            network_delay_ms: 20,
            pbft: PbftConfig {
                lambda_ms_min: 500,
                committee_size: 4,
                ..PbftConfig::default()
            },
        }
    }
}

impl NodeConfig {
    /// Load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.validators == 0 {
            bail!("at least one validator is required");
        }
        if !self.validator_keys.is_empty() && self.validator_keys.len() != self.validators {
            bail!(
                "{} validator keys configured for {} validators",
                self.validator_keys.len(),
                self.validators
            );
        }
        if self.stake.len() > self.validators {
            bail!("{} stake entries for {} validators", self.stake.len(), self.validators);
        }
        if self.pbft.lambda_ms_min == 0 {
            bail!("pbft.lambda_ms_min must be positive");
        }
        Ok(())
    }

    pub fn validator_dir(&self, index: usize) -> PathBuf {
        self.data_dir.join(format!("validator-{}", index))
    }

    pub fn keypairs(&self) -> Result<Vec<KeyPair>> {
        if self.validator_keys.is_empty() {
            return Ok((0..self.validators as u64)
                .map(|i| KeyPair::from_seed(KEY_SEED_LABEL, i))
                .collect());
        }
        self.validator_keys
            .iter()
            .map(|hex| KeyPair::from_secret_hex(hex).map_err(|e| anyhow::anyhow!(e)))
            .collect()
    }

    pub fn stake_snapshot(&self, keys: &[KeyPair]) -> StakeSnapshot {
        StakeSnapshot::new(
            0,
            keys.iter().enumerate().map(|(i, kp)| StakeEntry {
                validator: kp.public,
                weight: self.stake.get(i).copied().unwrap_or(1),
            }),
        )
    }
}

/// Sample configuration with freshly generated validator keys
pub fn generate_sample_config() -> NodeConfig {
    let config = NodeConfig::default();
    let validator_keys = (0..config.validators)
        .map(|_| KeyPair::generate().secret.to_hex())
        .collect();
    NodeConfig {
        validator_keys,
        ..config
    }
}
