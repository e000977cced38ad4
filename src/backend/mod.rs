//! Backend gateway: the adapter's narrow view of the chain backend
//!
//! The backend owns transaction execution, state storage and block assembly.
//! The adapter only reads its committed state, asks it to validate, queues
//! transactions for the block under assembly, and triggers block production.
//!
//! ## Structure
//! - `store.rs` - SQLite persistence for committed blocks
//! - `ledger.rs` - Reference nonce-ledger backend used by the binary and tests

use crate::codec::{Transaction, TxHash};
use crate::types::Validator;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub mod ledger;
pub mod store;

pub use ledger::LedgerBackend;
pub use store::{BlockStore, StoreError};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    pub fn zero() -> Self {
        BlockHash([0u8; 32])
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).ok()?;
            bytes[i] = u8::from_str_radix(pair, 16).ok()?;
        }
        Some(BlockHash(bytes))
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// A committed block. Immutable once produced by [`Backend::make_block`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub height: u64,
    pub hash: BlockHash,
    pub previous_hash: BlockHash,
    pub timestamp: u64,
    pub tx_hashes: Vec<TxHash>,
}

/// Read-only view of committed backend state at `height`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub height: u64,
    /// Next expected nonce per sender
    pub nonces: BTreeMap<String, u64>,
}

impl Snapshot {
    pub fn next_nonce(&self, sender: &str) -> u64 {
        self.nonces.get(sender).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
pub enum BackendError {
    /// The transaction is not acceptable against the relevant state.
    Rejected(String),
    /// Block assembly could not complete.
    BlockAssembly(String),
    Store(StoreError),
    Transport(reqwest::Error),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Rejected(e) => write!(f, "{}", e),
            BackendError::BlockAssembly(e) => write!(f, "block assembly failed: {}", e),
            BackendError::Store(e) => write!(f, "{}", e),
            BackendError::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<StoreError> for BackendError {
    fn from(err: StoreError) -> Self {
        BackendError::Store(err)
    }
}

/// Operations the adapter needs from the chain backend.
///
/// `validate_tx` must read committed state only; `submit` and `make_block`
/// are only ever called from the consensus connection.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Latest committed block and the snapshot after it, `None` before the first commit
    async fn current_state(&self) -> Option<(Block, Snapshot)>;

    /// Check a transaction against the latest committed snapshot without mutating it
    async fn validate_tx(&self, tx: &Transaction) -> Result<(), BackendError>;

    /// Queue a transaction for the block under assembly
    async fn submit(&self, tx: Transaction) -> Result<(), BackendError>;

    /// Drop everything queued since the last block
    async fn discard_pending(&self);

    /// Finalize everything queued since the last block, returning the new block's hash.
    /// `validators` is the set in force after this block and is stored atomically with it.
    async fn make_block(
        &self,
        timestamp: u64,
        validators: &[Validator],
    ) -> Result<BlockHash, BackendError>;

    /// Validator set stored with the latest committed block, empty before the first commit
    fn validators(&self) -> Vec<Validator>;

    /// Transport handle used to forward queries
    fn http_client(&self) -> reqwest::Client;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_hash_hex_roundtrip() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        bytes[31] = 0x01;
        let hash = BlockHash(bytes);
        assert_eq!(BlockHash::from_hex(&hash.to_hex()), Some(hash));
        assert_eq!(BlockHash::from_hex("abc"), None);
        assert_eq!(BlockHash::from_hex(&"zz".repeat(32)), None);
    }

    #[test]
    fn test_snapshot_next_nonce_defaults_to_zero() {
        let mut snapshot = Snapshot::default();
        assert_eq!(snapshot.next_nonce("alice"), 0);
        snapshot.nonces.insert("alice".to_string(), 4);
        assert_eq!(snapshot.next_nonce("alice"), 4);
    }
}
