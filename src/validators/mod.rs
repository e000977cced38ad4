//! Validator set lifecycle
//!
//! The roster is registered once at InitChain (or restored from committed
//! state) and changed only through EndBlock: the configured [`Strategy`]
//! computes a delta over the block just finished, and the resulting set is
//! installed under a single write lock once that block commits.

use crate::codec::TxHash;
use crate::error::FatalCondition;
use crate::types::{Validator, ValidatorUpdate};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

pub mod strategy;

pub use strategy::{CompensationStrategy, StaticStrategy, Strategy, StrategyError};

/// What the strategy gets to see about the block being finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSummary {
    pub height: u64,
    pub time: u64,
    pub proposer: Option<String>,
    pub tx_hashes: Vec<TxHash>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatorSet {
    powers: BTreeMap<String, u64>,
}

impl ValidatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set, rejecting empty keys, zero power and duplicates
    pub fn from_validators(validators: &[Validator]) -> Result<Self, String> {
        let mut powers = BTreeMap::new();
        for validator in validators {
            if validator.pub_key.trim().is_empty() {
                return Err("validator with empty public key".to_string());
            }
            if validator.power == 0 {
                return Err(format!("validator {} has zero power", validator.pub_key));
            }
            if powers
                .insert(validator.pub_key.clone(), validator.power)
                .is_some()
            {
                return Err(format!("duplicate validator {}", validator.pub_key));
            }
        }
        Ok(ValidatorSet { powers })
    }

    pub fn power(&self, pub_key: &str) -> Option<u64> {
        self.powers.get(pub_key).copied()
    }

    pub fn len(&self) -> usize {
        self.powers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.powers.is_empty()
    }

    pub fn total_power(&self) -> u64 {
        self.powers.values().fold(0u64, |acc, p| acc.saturating_add(*p))
    }

    /// Members sorted by public key
    pub fn validators(&self) -> Vec<Validator> {
        self.powers
            .iter()
            .map(|(pub_key, power)| Validator::new(pub_key, *power))
            .collect()
    }

    pub fn apply(&mut self, delta: &ValidatorSetDelta) {
        for (pub_key, power) in &delta.updates {
            if *power == 0 {
                self.powers.remove(pub_key);
            } else {
                self.powers.insert(pub_key.clone(), *power);
            }
        }
    }
}

/// Changes to the roster; a power of zero removes the validator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatorSetDelta {
    updates: BTreeMap<String, u64>,
}

impl ValidatorSetDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, pub_key: &str, power: u64) {
        self.updates.insert(pub_key.to_string(), power);
    }

    pub fn remove(&mut self, pub_key: &str) {
        self.updates.insert(pub_key.to_string(), 0);
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Updates sorted by public key
    pub fn into_updates(self) -> Vec<ValidatorUpdate> {
        self.updates
            .into_iter()
            .map(|(pub_key, power)| Validator { pub_key, power })
            .collect()
    }
}

/// Outcome of EndBlock: the updates reported to consensus and the set they produce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorTransition {
    pub updates: Vec<ValidatorUpdate>,
    pub next: ValidatorSet,
}

struct Roster {
    registered: bool,
    set: ValidatorSet,
}

pub struct ValidatorManager {
    strategy: Arc<dyn Strategy>,
    roster: RwLock<Roster>,
}

impl ValidatorManager {
    pub fn new(strategy: Arc<dyn Strategy>) -> Self {
        ValidatorManager {
            strategy,
            roster: RwLock::new(Roster {
                registered: false,
                set: ValidatorSet::new(),
            }),
        }
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Register the genesis validator set. Allowed once.
    pub fn set_validators(&self, initial: &[Validator]) -> Result<(), FatalCondition> {
        let mut roster = self.roster.write();
        if roster.registered {
            return Err(FatalCondition::ValidatorSet(
                "initial validator set already registered".to_string(),
            ));
        }
        if initial.is_empty() {
            return Err(FatalCondition::ValidatorSet(
                "initial validator set is empty".to_string(),
            ));
        }

        let set = ValidatorSet::from_validators(initial).map_err(FatalCondition::ValidatorSet)?;
        info!(
            validators = set.len(),
            total_power = set.total_power(),
            strategy = self.strategy.name(),
            "Validators: initial set registered"
        );
        roster.set = set;
        roster.registered = true;
        Ok(())
    }

    /// Reload a set persisted with committed blocks. An empty set leaves the
    /// manager waiting for InitChain.
    pub fn restore(&self, stored: &[Validator]) -> Result<(), FatalCondition> {
        if stored.is_empty() {
            return Ok(());
        }
        let set = ValidatorSet::from_validators(stored)
            .map_err(|e| FatalCondition::ValidatorSet(format!("stored set: {}", e)))?;
        info!(
            validators = set.len(),
            total_power = set.total_power(),
            "Validators: restored from committed state"
        );

        let mut roster = self.roster.write();
        roster.set = set;
        roster.registered = true;
        Ok(())
    }

    /// Compute the validator updates for the block just finished.
    ///
    /// The roster is left untouched; the returned transition is installed
    /// with [`ValidatorManager::apply`] once the block is committed.
    pub fn compute_updates(
        &self,
        block: &BlockSummary,
    ) -> Result<ValidatorTransition, FatalCondition> {
        let roster = self.roster.read();
        let delta = self.strategy.compute(block, &roster.set).map_err(|e| {
            error!(height = block.height, error = %e, "Validators: strategy failed");
            FatalCondition::ValidatorSet(e.to_string())
        })?;

        let mut next = roster.set.clone();
        next.apply(&delta);
        if !roster.set.is_empty() && next.is_empty() {
            error!(height = block.height, "Validators: update would remove every validator");
            return Err(FatalCondition::ValidatorSet(format!(
                "update at height {} removes every validator",
                block.height
            )));
        }

        Ok(ValidatorTransition {
            updates: delta.into_updates(),
            next,
        })
    }

    /// Install the set produced by a committed block
    pub fn apply(&self, next: ValidatorSet) {
        let mut roster = self.roster.write();
        if roster.set != next {
            info!(
                validators = next.len(),
                total_power = next.total_power(),
                "Validators: set updated"
            );
        }
        roster.set = next;
    }

    pub fn validators(&self) -> Vec<Validator> {
        self.roster.read().set.validators()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingStrategy;

    impl Strategy for FailingStrategy {
        fn compute(
            &self,
            _block: &BlockSummary,
            _current: &ValidatorSet,
        ) -> Result<ValidatorSetDelta, StrategyError> {
            Err(StrategyError("reward table missing".to_string()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    struct EvictAll;

    impl Strategy for EvictAll {
        fn compute(
            &self,
            _block: &BlockSummary,
            current: &ValidatorSet,
        ) -> Result<ValidatorSetDelta, StrategyError> {
            let mut delta = ValidatorSetDelta::new();
            for validator in current.validators() {
                delta.remove(&validator.pub_key);
            }
            Ok(delta)
        }

        fn name(&self) -> &str {
            "evict-all"
        }
    }

    fn summary(height: u64, proposer: &str, txs: usize) -> BlockSummary {
        BlockSummary {
            height,
            time: 100 + height,
            proposer: Some(proposer.to_string()),
            tx_hashes: (0..txs).map(|i| TxHash::of(&[i as u8])).collect(),
        }
    }

    fn genesis() -> Vec<Validator> {
        vec![Validator::new("v2", 20), Validator::new("v1", 10)]
    }

    #[test]
    fn test_set_validators_once() {
        let manager = ValidatorManager::new(Arc::new(StaticStrategy));
        manager.set_validators(&genesis()).unwrap();
        assert_eq!(
            manager.validators(),
            vec![Validator::new("v1", 10), Validator::new("v2", 20)]
        );
        assert!(manager.set_validators(&genesis()).is_err());
    }

    #[test]
    fn test_set_validators_rejects_bad_input() {
        let manager = ValidatorManager::new(Arc::new(StaticStrategy));
        assert!(manager.set_validators(&[]).is_err());
        assert!(manager.set_validators(&[Validator::new("", 1)]).is_err());
        assert!(manager.set_validators(&[Validator::new("v1", 0)]).is_err());
        assert!(manager
            .set_validators(&[Validator::new("v1", 1), Validator::new("v1", 2)])
            .is_err());

        // Rejections leave the manager open for a valid registration.
        assert!(manager.set_validators(&genesis()).is_ok());
    }

    #[test]
    fn test_static_strategy_keeps_set() {
        let manager = ValidatorManager::new(Arc::new(StaticStrategy));
        manager.set_validators(&genesis()).unwrap();
        let transition = manager.compute_updates(&summary(1, "v1", 2)).unwrap();
        assert!(transition.updates.is_empty());
        assert_eq!(transition.next.validators(), manager.validators());
    }

    #[test]
    fn test_updates_are_applied_and_deterministic() {
        let run = || {
            let strategy = CompensationStrategy::new().with_tx_reward(1);
            let manager = ValidatorManager::new(Arc::new(strategy));
            manager.set_validators(&genesis()).unwrap();
            let mut all = Vec::new();
            for height in 1..=4 {
                let proposer = if height % 2 == 0 { "v1" } else { "v2" };
                let transition = manager
                    .compute_updates(&summary(height, proposer, height as usize))
                    .unwrap();
                all.push(transition.updates);
                manager.apply(transition.next);
            }
            (all, manager.validators())
        };

        let (first_updates, first_set) = run();
        let (second_updates, second_set) = run();
        assert_eq!(
            serde_json::to_vec(&first_updates).unwrap(),
            serde_json::to_vec(&second_updates).unwrap()
        );
        assert_eq!(first_set, second_set);
        // v2 proposed heights 1 and 3: 20 + (1+1) + (1+3)
        assert_eq!(first_set[1], Validator::new("v2", 26));
    }

    #[test]
    fn test_updates_wait_for_apply() {
        let manager = ValidatorManager::new(Arc::new(CompensationStrategy::new()));
        manager.set_validators(&genesis()).unwrap();

        let transition = manager.compute_updates(&summary(1, "v1", 0)).unwrap();
        assert_eq!(transition.updates, vec![Validator::new("v1", 11)]);
        assert_eq!(manager.validators()[0], Validator::new("v1", 10));

        // Recomputing an uncommitted block does not credit twice.
        assert_eq!(manager.compute_updates(&summary(1, "v1", 0)).unwrap(), transition);

        manager.apply(transition.next);
        assert_eq!(manager.validators()[0], Validator::new("v1", 11));
    }

    #[test]
    fn test_restore_registers_stored_set() {
        let manager = ValidatorManager::new(Arc::new(StaticStrategy));
        manager.restore(&[]).unwrap();
        assert!(manager.validators().is_empty());

        manager.restore(&genesis()).unwrap();
        assert_eq!(manager.validators().len(), 2);
        assert!(manager.set_validators(&genesis()).is_err());

        let other = ValidatorManager::new(Arc::new(StaticStrategy));
        assert!(other.restore(&[Validator::new("v1", 0)]).is_err());
    }

    #[test]
    fn test_strategy_failure_is_fatal_and_leaves_set() {
        let manager = ValidatorManager::new(Arc::new(FailingStrategy));
        manager.set_validators(&genesis()).unwrap();
        assert!(matches!(
            manager.compute_updates(&summary(1, "v1", 0)),
            Err(FatalCondition::ValidatorSet(_))
        ));
        assert_eq!(manager.validators().len(), 2);
    }

    #[test]
    fn test_emptying_the_set_is_fatal() {
        let manager = ValidatorManager::new(Arc::new(EvictAll));
        manager.set_validators(&genesis()).unwrap();
        assert!(manager.compute_updates(&summary(1, "v1", 0)).is_err());
        assert_eq!(manager.validators().len(), 2);
    }

    #[test]
    fn test_delta_removal() {
        let mut set = ValidatorSet::from_validators(&genesis()).unwrap();
        let mut delta = ValidatorSetDelta::new();
        delta.remove("v1");
        delta.put("v3", 5);
        set.apply(&delta);
        assert_eq!(set.power("v1"), None);
        assert_eq!(set.power("v3"), Some(5));
        assert_eq!(set.total_power(), 25);
    }
}
