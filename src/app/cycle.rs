//! Consensus-connection state: the phase machine and the block under assembly

use crate::codec::TxHash;
use crate::error::{AbciError, FatalCondition};
use crate::types::Header;
use crate::validators::{BlockSummary, ValidatorSet};
use serde::Serialize;
use std::fmt;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// No backend attached yet.
    Uninitialized,
    /// Waiting for BeginBlock.
    Ready,
    /// Between BeginBlock and EndBlock; DeliverTx allowed.
    InBlock,
    /// EndBlock done; only Commit allowed.
    BlockEnded,
    /// A fatal condition stopped block production.
    Halted,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
struct BlockInProgress {
    height: u64,
    /// BlockTime: set by BeginBlock, read by Commit
    time: u64,
    proposer: Option<String>,
    hash: Vec<u8>,
    collected: Vec<TxHash>,
    /// Validator set computed at EndBlock, installed only if Commit succeeds
    staged: Option<ValidatorSet>,
}

/// Owned exclusively by the consensus connection
#[derive(Debug)]
pub(crate) struct ConsensusCycle {
    state: CycleState,
    block: Option<BlockInProgress>,
    blocks_committed: u64,
}

impl ConsensusCycle {
    pub(crate) fn new() -> Self {
        ConsensusCycle {
            state: CycleState::Uninitialized,
            block: None,
            blocks_committed: 0,
        }
    }

    pub(crate) fn state(&self) -> CycleState {
        self.state
    }

    pub(crate) fn attach(&mut self) -> Result<(), AbciError> {
        if self.state != CycleState::Uninitialized {
            return Err(AbciError::AlreadyInitialized);
        }
        self.state = CycleState::Ready;
        Ok(())
    }

    /// Fail unless the machine is in `expected`
    pub(crate) fn ensure(&self, expected: CycleState, call: &str) -> Result<(), AbciError> {
        match self.state {
            state if state == expected => Ok(()),
            CycleState::Uninitialized => Err(AbciError::NotInitialized),
            CycleState::Halted => Err(FatalCondition::Halted.into()),
            state => Err(FatalCondition::ProtocolViolation(format!(
                "{} received while {}, expected {}",
                call, state, expected
            ))
            .into()),
        }
    }

    pub(crate) fn begin(&mut self, hash: &[u8], header: &Header) {
        self.block = Some(BlockInProgress {
            height: header.height,
            time: header.time,
            proposer: header.proposer.clone(),
            hash: hash.to_vec(),
            collected: Vec::new(),
            staged: None,
        });
        self.state = CycleState::InBlock;
    }

    pub(crate) fn height(&self) -> Option<u64> {
        self.block.as_ref().map(|b| b.height)
    }

    pub(crate) fn block_time(&self) -> Option<u64> {
        self.block.as_ref().map(|b| b.time)
    }

    pub(crate) fn block_hash(&self) -> Option<&[u8]> {
        self.block.as_ref().map(|b| b.hash.as_slice())
    }

    pub(crate) fn collected(&self) -> usize {
        self.block.as_ref().map(|b| b.collected.len()).unwrap_or(0)
    }

    /// Record a transaction accepted by the backend for this block
    pub(crate) fn collect(&mut self, tx: TxHash) {
        if let Some(block) = self.block.as_mut() {
            block.collected.push(tx);
        }
    }

    pub(crate) fn summary(&self) -> Option<BlockSummary> {
        self.block.as_ref().map(|b| BlockSummary {
            height: b.height,
            time: b.time,
            proposer: b.proposer.clone(),
            tx_hashes: b.collected.clone(),
        })
    }

    pub(crate) fn end(&mut self, next: ValidatorSet) {
        if let Some(block) = self.block.as_mut() {
            block.staged = Some(next);
        }
        self.state = CycleState::BlockEnded;
    }

    pub(crate) fn staged(&self) -> Option<&ValidatorSet> {
        self.block.as_ref().and_then(|b| b.staged.as_ref())
    }

    /// Close the committed block, handing back the set it staged
    pub(crate) fn finish(&mut self) -> Option<ValidatorSet> {
        let staged = self.block.take().and_then(|b| b.staged);
        self.blocks_committed += 1;
        self.state = CycleState::Ready;
        staged
    }

    /// Stop block production, dropping the block in progress and its staged set
    pub(crate) fn halt(&mut self) {
        self.block = None;
        self.state = CycleState::Halted;
    }

    pub(crate) fn blocks_committed(&self) -> u64 {
        self.blocks_committed
    }
}
