//! Reference nonce-ledger backend
//!
//! A transaction from `sender` is valid when its nonce equals the sender's
//! next expected nonce. CheckTx-style validation reads committed state only;
//! submissions are checked against committed state plus everything already
//! queued for the block under assembly.

use crate::backend::{Backend, BackendError, Block, BlockHash, BlockStore, Snapshot, StoreError};
use crate::codec::{Transaction, TxHash};
use crate::types::Validator;
use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Default)]
struct LedgerState {
    latest: Option<Block>,
    committed: Snapshot,
    /// Validator set stored with `latest`
    validators: Vec<Validator>,
    pending: Vec<Transaction>,
    pending_hashes: HashSet<TxHash>,
    /// Next nonce per sender including queued transactions
    pending_nonces: BTreeMap<String, u64>,
}

impl LedgerState {
    fn expected_pending_nonce(&self, sender: &str) -> u64 {
        self.pending_nonces
            .get(sender)
            .copied()
            .unwrap_or_else(|| self.committed.next_nonce(sender))
    }

    fn clear_pending(&mut self) {
        self.pending.clear();
        self.pending_hashes.clear();
        self.pending_nonces.clear();
    }
}

pub struct LedgerBackend {
    store: BlockStore,
    state: RwLock<LedgerState>,
    client: reqwest::Client,
}

impl LedgerBackend {
    /// Open the ledger at `db_path`, rebuilding committed state from the store
    pub fn open(db_path: &str, query_timeout: Duration) -> Result<Self, BackendError> {
        let store = BlockStore::open(db_path)?;
        if !store.verify_chain()? {
            return Err(BackendError::Store(StoreError::InvalidData(format!(
                "stored chain at {} is not contiguous",
                db_path
            ))));
        }

        let latest = store.get_latest_block()?;
        let committed = Snapshot {
            height: latest.as_ref().map(|b| b.height).unwrap_or(0),
            nonces: store.load_nonces()?,
        };
        let validators = store.load_validators()?;

        let client = reqwest::Client::builder()
            .user_agent(concat!("abci-chain-adapter/", env!("CARGO_PKG_VERSION")))
            .timeout(query_timeout)
            .build()
            .map_err(BackendError::Transport)?;

        info!(
            db_path,
            height = committed.height,
            blocks = store.block_count()?,
            accounts = committed.nonces.len(),
            validators = validators.len(),
            "Ledger: opened"
        );

        Ok(LedgerBackend {
            store,
            state: RwLock::new(LedgerState {
                latest,
                committed,
                validators,
                ..LedgerState::default()
            }),
            client,
        })
    }

    pub fn in_memory() -> Result<Self, BackendError> {
        Self::open(":memory:", Duration::from_secs(10))
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    pub fn pending_count(&self) -> usize {
        self.state.read().pending.len()
    }

    fn block_hash(previous: &BlockHash, height: u64, timestamp: u64, txs: &[TxHash]) -> BlockHash {
        let mut hasher = Sha256::new();
        hasher.update(previous.0);
        hasher.update(height.to_be_bytes());
        hasher.update(timestamp.to_be_bytes());
        for tx in txs {
            hasher.update(tx.as_bytes());
        }
        BlockHash(hasher.finalize().into())
    }
}

#[async_trait]
impl Backend for LedgerBackend {
    async fn current_state(&self) -> Option<(Block, Snapshot)> {
        let state = self.state.read();
        state
            .latest
            .clone()
            .map(|block| (block, state.committed.clone()))
    }

    async fn validate_tx(&self, tx: &Transaction) -> Result<(), BackendError> {
        let state = self.state.read();
        let expected = state.committed.next_nonce(tx.sender());
        if tx.nonce() != expected {
            return Err(BackendError::Rejected(format!(
                "invalid nonce for {}: expected {}, got {}",
                tx.sender(),
                expected,
                tx.nonce()
            )));
        }
        Ok(())
    }

    async fn submit(&self, tx: Transaction) -> Result<(), BackendError> {
        let mut state = self.state.write();
        if state.pending_hashes.contains(&tx.hash) {
            debug!(tx = %tx.hash, "Ledger: duplicate submission ignored");
            return Ok(());
        }

        let expected = state.expected_pending_nonce(tx.sender());
        if tx.nonce() != expected {
            return Err(BackendError::Rejected(format!(
                "invalid nonce for {}: expected {}, got {}",
                tx.sender(),
                expected,
                tx.nonce()
            )));
        }

        state
            .pending_nonces
            .insert(tx.sender().to_string(), expected + 1);
        state.pending_hashes.insert(tx.hash);
        state.pending.push(tx);
        Ok(())
    }

    async fn discard_pending(&self) {
        let mut state = self.state.write();
        if !state.pending.is_empty() {
            warn!(txs = state.pending.len(), "Ledger: discarding queued transactions");
        }
        state.clear_pending();
    }

    async fn make_block(
        &self,
        timestamp: u64,
        validators: &[Validator],
    ) -> Result<BlockHash, BackendError> {
        let mut state = self.state.write();
        let height = state.committed.height + 1;
        let previous_hash = state
            .latest
            .as_ref()
            .map(|b| b.hash)
            .unwrap_or_else(BlockHash::zero);
        if let Some(latest) = &state.latest {
            if timestamp < latest.timestamp {
                warn!(
                    height,
                    timestamp,
                    previous = latest.timestamp,
                    "Ledger: block time went backwards"
                );
            }
        }

        let tx_hashes: Vec<TxHash> = state.pending.iter().map(|tx| tx.hash).collect();
        let block = Block {
            height,
            hash: Self::block_hash(&previous_hash, height, timestamp, &tx_hashes),
            previous_hash,
            timestamp,
            tx_hashes,
        };

        // Pending state survives a failed write so nothing is half-applied.
        self.store
            .commit_block(&block, &state.pending_nonces, validators)?;

        let advanced = std::mem::take(&mut state.pending_nonces);
        state.committed.nonces.extend(advanced);
        state.committed.height = height;
        state.latest = Some(block.clone());
        state.validators = validators.to_vec();
        state.clear_pending();

        Ok(block.hash)
    }

    fn validators(&self) -> Vec<Validator> {
        self.state.read().validators.clone()
    }

    fn http_client(&self) -> reqwest::Client {
        self.client.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode, TxBody};
    use serde_json::json;

    fn tx(sender: &str, nonce: u64) -> Transaction {
        decode(&encode(&TxBody {
            sender: sender.to_string(),
            nonce,
            payload: json!({"memo": "test"}),
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_ledger_has_no_state() {
        let ledger = LedgerBackend::in_memory().unwrap();
        assert!(ledger.current_state().await.is_none());
    }

    #[tokio::test]
    async fn test_validate_reads_committed_state_only() {
        let ledger = LedgerBackend::in_memory().unwrap();
        ledger.submit(tx("alice", 0)).await.unwrap();

        // Still nonce 0 until the block is made.
        assert!(ledger.validate_tx(&tx("alice", 0)).await.is_ok());
        assert!(ledger.validate_tx(&tx("alice", 1)).await.is_err());

        ledger.make_block(100, &[]).await.unwrap();
        assert!(ledger.validate_tx(&tx("alice", 0)).await.is_err());
        assert!(ledger.validate_tx(&tx("alice", 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_submit_chains_nonces_within_block() {
        let ledger = LedgerBackend::in_memory().unwrap();
        ledger.submit(tx("alice", 0)).await.unwrap();
        ledger.submit(tx("alice", 1)).await.unwrap();
        assert!(matches!(
            ledger.submit(tx("alice", 3)).await,
            Err(BackendError::Rejected(_))
        ));
        assert_eq!(ledger.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_submit_is_ignored() {
        let ledger = LedgerBackend::in_memory().unwrap();
        ledger.submit(tx("alice", 0)).await.unwrap();
        ledger.submit(tx("alice", 0)).await.unwrap();
        assert_eq!(ledger.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_make_block_advances_height() {
        let ledger = LedgerBackend::in_memory().unwrap();
        ledger.submit(tx("alice", 0)).await.unwrap();
        let first = ledger.make_block(100, &[]).await.unwrap();
        let second = ledger.make_block(101, &[]).await.unwrap();
        assert_ne!(first, second);

        let (block, snapshot) = ledger.current_state().await.unwrap();
        assert_eq!(block.height, 2);
        assert_eq!(block.hash, second);
        assert_eq!(block.previous_hash, first);
        assert!(block.tx_hashes.is_empty());
        assert_eq!(snapshot.height, 2);
        assert_eq!(snapshot.next_nonce("alice"), 1);
        assert_eq!(ledger.pending_count(), 0);
        assert!(ledger.store().verify_chain().unwrap());
    }

    #[tokio::test]
    async fn test_discarded_transactions_never_reach_a_block() {
        let ledger = LedgerBackend::in_memory().unwrap();
        ledger.submit(tx("alice", 0)).await.unwrap();
        ledger.submit(tx("alice", 1)).await.unwrap();
        ledger.discard_pending().await;
        assert_eq!(ledger.pending_count(), 0);

        // Queued nonces are rolled back with the transactions.
        ledger.submit(tx("bob", 0)).await.unwrap();
        assert!(ledger.submit(tx("alice", 2)).await.is_err());
        ledger.make_block(100, &[]).await.unwrap();

        let (block, snapshot) = ledger.current_state().await.unwrap();
        assert_eq!(block.tx_hashes, vec![tx("bob", 0).hash]);
        assert_eq!(snapshot.next_nonce("alice"), 0);
        assert_eq!(snapshot.next_nonce("bob"), 1);
    }

    #[tokio::test]
    async fn test_block_hash_is_deterministic() {
        let a = LedgerBackend::in_memory().unwrap();
        let b = LedgerBackend::in_memory().unwrap();
        for ledger in [&a, &b] {
            ledger.submit(tx("alice", 0)).await.unwrap();
            ledger.submit(tx("bob", 0)).await.unwrap();
        }
        assert_eq!(a.make_block(42, &[]).await.unwrap(), b.make_block(42, &[]).await.unwrap());
    }

    #[tokio::test]
    async fn test_reopen_restores_state() {
        let path = std::env::temp_dir().join(format!("ledger_reopen_{}.db", std::process::id()));
        let path = path.to_string_lossy().to_string();
        std::fs::remove_file(&path).ok();

        {
            let ledger = LedgerBackend::open(&path, Duration::from_secs(1)).unwrap();
            ledger.submit(tx("alice", 0)).await.unwrap();
            ledger
                .make_block(100, &[Validator::new("v1", 10)])
                .await
                .unwrap();
        }

        let ledger = LedgerBackend::open(&path, Duration::from_secs(1)).unwrap();
        let (block, snapshot) = ledger.current_state().await.unwrap();
        assert_eq!(block.height, 1);
        assert_eq!(snapshot.next_nonce("alice"), 1);
        assert_eq!(ledger.validators(), vec![Validator::new("v1", 10)]);

        std::fs::remove_file(&path).ok();
    }
}
