use serde::{Deserialize, Serialize};

/// Timing and committee parameters of the PBFT state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PbftConfig {
    /// Base step duration (LAMBDA) in milliseconds
    pub lambda_ms_min: u64,
    /// Upper bound on the sortition threshold
    pub committee_size: u64,
    /// Poll period of the certify and second-finish states
    pub polling_interval_ms: u64,
    /// Steps after which the node starts asking peers for help
    pub max_steps: u64,
    pub max_wait_for_soft_voted_block_steps: u64,
    pub max_wait_for_next_voted_block_steps: u64,
    /// Rounds to wait for a proposal's content before dropping the own starting value
    pub max_wait_rounds_for_proposal_block: u64,
    pub next_votes_rebroadcast_interval_steps: u64,
}

impl Default for PbftConfig {
    fn default() -> Self {
        PbftConfig {
            lambda_ms_min: 2000,
            committee_size: 5,
            polling_interval_ms: 100,
            max_steps: 13,
            max_wait_for_soft_voted_block_steps: 20,
            max_wait_for_next_voted_block_steps: 20,
            max_wait_rounds_for_proposal_block: 5,
            next_votes_rebroadcast_interval_steps: 100,
        }
    }
}

impl PbftConfig {
    /// Give-up threshold for a soft-voted value whose content never arrives
    pub fn max_wait_for_soft_voted_block_ms(&self) -> u64 {
        self.max_wait_for_soft_voted_block_steps
            .saturating_mul(2)
            .saturating_mul(self.lambda_ms_min)
    }

    pub fn max_wait_for_next_voted_block_ms(&self) -> u64 {
        self.max_wait_for_next_voted_block_steps
            .saturating_mul(2)
            .saturating_mul(self.lambda_ms_min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_wait_thresholds() {
        let config = PbftConfig::default();
        assert_eq!(config.max_wait_for_soft_voted_block_ms(), 80_000);
        assert_eq!(config.max_wait_for_next_voted_block_ms(), 80_000);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PbftConfig = serde_json::from_str(r#"{"lambda_ms_min": 500}"#).unwrap();
        assert_eq!(config.lambda_ms_min, 500);
        assert_eq!(config.committee_size, 5);
        assert_eq!(config.max_steps, 13);
    }
}
