//! Protocol request/response envelopes exchanged with the consensus engine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Value reported in `ResponseInfo::data`
pub const INFO_DATA: &str = "ABCIChain";

/// Result codes, numbered as in the legacy ABCI result set.
/// `ProtocolViolation` and `NotInitialized` belong to the adapter itself.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(into = "u32", try_from = "u32")]
pub enum Code {
    Ok,
    InternalError,
    EncodingError,
    UnknownRequest,
    ProtocolViolation,
    NotInitialized,
}

impl Code {
    pub fn value(self) -> u32 {
        match self {
            Code::Ok => 0,
            Code::InternalError => 1,
            Code::EncodingError => 2,
            Code::UnknownRequest => 6,
            Code::ProtocolViolation => 100,
            Code::NotInitialized => 101,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Code::Ok
    }
}

impl From<Code> for u32 {
    fn from(code: Code) -> Self {
        code.value()
    }
}

impl TryFrom<u32> for Code {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Code::Ok),
            1 => Ok(Code::InternalError),
            2 => Ok(Code::EncodingError),
            6 => Ok(Code::UnknownRequest),
            100 => Ok(Code::ProtocolViolation),
            101 => Ok(Code::NotInitialized),
            other => Err(format!("unknown result code {}", other)),
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.value())
    }
}

/// Result of CheckTx, DeliverTx and Commit
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AbciResult {
    pub code: Code,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub log: String,
}

impl AbciResult {
    pub fn ok() -> Self {
        Self::ok_with_data(Vec::new(), "")
    }

    pub fn ok_with_data(data: Vec<u8>, log: &str) -> Self {
        AbciResult {
            code: Code::Ok,
            data,
            log: log.to_string(),
        }
    }

    pub fn error(code: Code, log: &str) -> Self {
        AbciResult {
            code,
            data: Vec::new(),
            log: log.to_string(),
        }
    }

    /// Appends `detail` to the log, separated by a newline when the log is not empty.
    pub fn append_log(mut self, detail: &str) -> Self {
        if !self.log.is_empty() {
            self.log.push('\n');
        }
        self.log.push_str(detail);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResponseInfo {
    pub data: String,
    pub last_block_height: u64,
    #[serde(with = "base64_bytes")]
    pub last_block_app_hash: Vec<u8>,
}

impl ResponseInfo {
    /// The "no prior state" answer the consensus engine expects from a fresh node.
    pub fn genesis() -> Self {
        ResponseInfo {
            data: INFO_DATA.to_string(),
            last_block_height: 0,
            last_block_app_hash: Vec::new(),
        }
    }
}

/// Subset of the consensus engine's block header the adapter consumes
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub height: u64,
    /// Block time in seconds since the Unix epoch
    pub time: u64,
    #[serde(default)]
    pub proposer: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Validator {
    pub pub_key: String,
    pub power: u64,
}

impl Validator {
    pub fn new(pub_key: &str, power: u64) -> Self {
        Validator {
            pub_key: pub_key.to_string(),
            power,
        }
    }
}

/// A power of zero removes the validator from the set.
pub type ValidatorUpdate = Validator;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseEndBlock {
    pub validator_updates: Vec<ValidatorUpdate>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RequestQuery {
    pub path: String,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResponseQuery {
    pub code: Code,
    #[serde(default, with = "base64_bytes")]
    pub value: Vec<u8>,
    #[serde(default)]
    pub log: String,
}

impl ResponseQuery {
    pub fn error(code: Code, log: String) -> Self {
        ResponseQuery {
            code,
            value: Vec::new(),
            log,
        }
    }
}

/// Serde adapter carrying byte fields as standard base64 strings.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
