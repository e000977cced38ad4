use crate::backend::{Block, BlockHash};
use crate::codec::TxHash;
use crate::types::Validator;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Error type for block persistence
#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Serialization(String),
    InvalidData(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "SQLite error: {}", e),
            StoreError::Serialization(e) => write!(f, "Serialization error: {}", e),
            StoreError::InvalidData(e) => write!(f, "Invalid data: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Sqlite(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

const SELECT_BLOCK: &str = "SELECT height, hash, prev_hash, timestamp, txs_json FROM blocks";

/// SQLite store for committed blocks
#[derive(Clone)]
pub struct BlockStore {
    conn: Arc<Mutex<Connection>>,
}

impl BlockStore {
    /// Open (or create) the store at `path`; `":memory:"` keeps it in memory
    pub fn open(path: &str) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = BlockStore {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocks (
                height      INTEGER PRIMARY KEY,
                hash        TEXT NOT NULL UNIQUE,
                prev_hash   TEXT NOT NULL,
                timestamp   INTEGER NOT NULL,
                txs_json    TEXT NOT NULL,
                created_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_blocks_hash ON blocks(hash)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS accounts (
                sender      TEXT PRIMARY KEY,
                next_nonce  INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS validators (
                pub_key     TEXT PRIMARY KEY,
                power       INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    /// Persist a block, the account nonces it advanced and the validator set in
    /// force after it, all in one SQLite transaction
    pub fn commit_block(
        &self,
        block: &Block,
        nonces: &BTreeMap<String, u64>,
        validators: &[Validator],
    ) -> StoreResult<()> {
        let txs_json = serde_json::to_string(&block.tx_hashes)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let timestamp = i64::try_from(block.timestamp).map_err(|_| {
            StoreError::InvalidData(format!(
                "timestamp {} at height {} out of range",
                block.timestamp, block.height
            ))
        })?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO blocks (height, hash, prev_hash, timestamp, txs_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                block.height,
                block.hash.to_hex(),
                block.previous_hash.to_hex(),
                timestamp,
                txs_json
            ],
        )?;
        for (sender, next_nonce) in nonces {
            tx.execute(
                "INSERT INTO accounts (sender, next_nonce) VALUES (?1, ?2)
                 ON CONFLICT(sender) DO UPDATE SET next_nonce = excluded.next_nonce",
                params![sender, next_nonce],
            )?;
        }
        tx.execute("DELETE FROM validators", [])?;
        for validator in validators {
            tx.execute(
                "INSERT INTO validators (pub_key, power) VALUES (?1, ?2)",
                params![validator.pub_key, validator.power],
            )?;
        }
        tx.commit()?;

        info!(
            height = block.height,
            hash = %block.hash,
            txs = block.tx_hashes.len(),
            validators = validators.len(),
            "Store: block committed"
        );
        Ok(())
    }

    pub fn load_nonces(&self) -> StoreResult<BTreeMap<String, u64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT sender, next_nonce FROM accounts")?;
        let rows = stmt.query_map([], |row| {
            let sender: String = row.get(0)?;
            let next_nonce: u64 = row.get(1)?;
            Ok((sender, next_nonce))
        })?;

        let mut nonces = BTreeMap::new();
        for row in rows {
            let (sender, next_nonce) = row?;
            nonces.insert(sender, next_nonce);
        }
        Ok(nonces)
    }

    /// Validator set stored with the latest block, sorted by public key
    pub fn load_validators(&self) -> StoreResult<Vec<Validator>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT pub_key, power FROM validators ORDER BY pub_key")?;
        let rows = stmt.query_map([], |row| {
            let pub_key: String = row.get(0)?;
            let power: u64 = row.get(1)?;
            Ok(Validator { pub_key, power })
        })?;

        let mut validators = Vec::new();
        for row in rows {
            validators.push(row?);
        }
        Ok(validators)
    }

    #[cfg(test)]
    pub fn get_block(&self, height: u64) -> StoreResult<Option<Block>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{} WHERE height = ?1", SELECT_BLOCK))?;
        let raw = stmt.query_row([height], RawBlock::from_row).optional()?;
        raw.map(RawBlock::into_block).transpose()
    }

    pub fn get_latest_block(&self) -> StoreResult<Option<Block>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{} ORDER BY height DESC LIMIT 1", SELECT_BLOCK))?;
        let raw = stmt.query_row([], RawBlock::from_row).optional()?;
        raw.map(RawBlock::into_block).transpose()
    }

    /// Every stored block in ascending height order
    pub fn load_all(&self) -> StoreResult<Vec<Block>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{} ORDER BY height ASC", SELECT_BLOCK))?;
        let rows = stmt.query_map([], RawBlock::from_row)?;

        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(row?.into_block()?);
        }
        debug!(count = blocks.len(), "Store: loaded blocks");
        Ok(blocks)
    }

    pub fn block_count(&self) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Check that heights are contiguous from 1 and each block links to its parent
    pub fn verify_chain(&self) -> StoreResult<bool> {
        let blocks = self.load_all()?;
        let mut expected_parent = BlockHash::zero();
        for (i, block) in blocks.iter().enumerate() {
            if block.height != i as u64 + 1 || block.previous_hash != expected_parent {
                return Ok(false);
            }
            expected_parent = block.hash;
        }
        Ok(true)
    }
}

struct RawBlock {
    height: u64,
    hash: String,
    prev_hash: String,
    timestamp: i64,
    txs_json: String,
}

impl RawBlock {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawBlock {
            height: row.get(0)?,
            hash: row.get(1)?,
            prev_hash: row.get(2)?,
            timestamp: row.get(3)?,
            txs_json: row.get(4)?,
        })
    }

    fn into_block(self) -> StoreResult<Block> {
        let hash = BlockHash::from_hex(&self.hash)
            .ok_or_else(|| StoreError::InvalidData(format!("bad hash at height {}", self.height)))?;
        let previous_hash = BlockHash::from_hex(&self.prev_hash).ok_or_else(|| {
            StoreError::InvalidData(format!("bad parent hash at height {}", self.height))
        })?;
        let tx_hashes: Vec<TxHash> = serde_json::from_str(&self.txs_json)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let timestamp = u64::try_from(self.timestamp).map_err(|_| {
            StoreError::InvalidData(format!("negative timestamp at height {}", self.height))
        })?;

        Ok(Block {
            height: self.height,
            hash,
            previous_hash,
            timestamp,
            tx_hashes,
        })
    }
}
