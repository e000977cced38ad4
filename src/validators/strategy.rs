//! Validator compensation/selection strategies

use crate::validators::{BlockSummary, ValidatorSet, ValidatorSetDelta};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyError(pub String);

impl fmt::Display for StrategyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "strategy error: {}", self.0)
    }
}

impl std::error::Error for StrategyError {}

/// Policy deciding how the validator set changes after each block.
///
/// Implementations must be deterministic: nodes that committed the same
/// blocks must compute identical deltas.
pub trait Strategy: Send + Sync {
    fn compute(
        &self,
        block: &BlockSummary,
        current: &ValidatorSet,
    ) -> Result<ValidatorSetDelta, StrategyError>;

    fn name(&self) -> &str;
}

/// Keeps the initial validator set forever
#[derive(Debug, Clone, Default)]
pub struct StaticStrategy;

impl Strategy for StaticStrategy {
    fn compute(
        &self,
        _block: &BlockSummary,
        _current: &ValidatorSet,
    ) -> Result<ValidatorSetDelta, StrategyError> {
        Ok(ValidatorSetDelta::new())
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Credits the block proposer with voting power for producing the block
#[derive(Debug, Clone)]
pub struct CompensationStrategy {
    reward_per_block: u64,
    reward_per_tx: u64,
    max_power: u64,
}

impl Default for CompensationStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl CompensationStrategy {
    pub fn new() -> Self {
        CompensationStrategy {
            reward_per_block: 1,
            reward_per_tx: 0,
            max_power: 1_000_000,
        }
    }

    pub fn with_block_reward(mut self, reward: u64) -> Self {
        self.reward_per_block = reward;
        self
    }

    pub fn with_tx_reward(mut self, reward: u64) -> Self {
        self.reward_per_tx = reward;
        self
    }

    pub fn with_max_power(mut self, max_power: u64) -> Self {
        self.max_power = max_power;
        self
    }
}

impl Strategy for CompensationStrategy {
    fn compute(
        &self,
        block: &BlockSummary,
        current: &ValidatorSet,
    ) -> Result<ValidatorSetDelta, StrategyError> {
        let mut delta = ValidatorSetDelta::new();
        let proposer = match &block.proposer {
            Some(proposer) => proposer,
            None => return Ok(delta),
        };
        let power = match current.power(proposer) {
            Some(power) if power < self.max_power => power,
            _ => return Ok(delta),
        };

        let tx_reward = self
            .reward_per_tx
            .checked_mul(block.tx_hashes.len() as u64)
            .ok_or_else(|| StrategyError(format!("tx reward overflow at height {}", block.height)))?;
        let reward = self.reward_per_block.saturating_add(tx_reward);
        let updated = power.saturating_add(reward).min(self.max_power);

        if updated != power {
            delta.put(proposer, updated);
        }
        Ok(delta)
    }

    fn name(&self) -> &str {
        "compensation"
    }
}
