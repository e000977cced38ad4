//! Transaction codec
//!
//! Transactions travel as a UTF-8 JSON object:
//! `{"sender": "...", "nonce": 0, "payload": <any json>}`.
//! Decoding is pure: the same bytes always yield the same [`Transaction`],
//! and bytes that do not match the format never yield a partial one.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Largest accepted encoded transaction.
pub const MAX_TX_BYTES: usize = 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxHash(pub [u8; 32]);

impl TxHash {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        TxHash(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TxBody {
    pub sender: String,
    pub nonce: u64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A decoded transaction together with the hash of its raw encoding
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub hash: TxHash,
    pub body: TxBody,
}

impl Transaction {
    pub fn sender(&self) -> &str {
        &self.body.sender
    }

    pub fn nonce(&self) -> u64 {
        self.body.nonce
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Empty,
    TooLarge(usize),
    Malformed(String),
    MissingSender,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Empty => write!(f, "empty transaction"),
            DecodeError::TooLarge(len) => write!(
                f,
                "transaction is {} bytes, maximum is {}",
                len, MAX_TX_BYTES
            ),
            DecodeError::Malformed(e) => write!(f, "malformed transaction: {}", e),
            DecodeError::MissingSender => write!(f, "transaction sender cannot be empty"),
        }
    }
}

impl std::error::Error for DecodeError {}

pub fn decode(bytes: &[u8]) -> Result<Transaction, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() > MAX_TX_BYTES {
        return Err(DecodeError::TooLarge(bytes.len()));
    }

    let body: TxBody =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    if body.sender.trim().is_empty() {
        return Err(DecodeError::MissingSender);
    }

    Ok(Transaction {
        hash: TxHash::of(bytes),
        body,
    })
}

pub fn encode(body: &TxBody) -> Vec<u8> {
    // Serializing a TxBody cannot fail: every field is plain data.
    serde_json::to_vec(body).unwrap_or_default()
}
