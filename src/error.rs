use crate::backend::BackendError;
use crate::codec::DecodeError;
use crate::types::{AbciResult, Code};
use std::fmt;

/// Conditions after which this node cannot safely keep producing blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalCondition {
    /// A consensus-connection call arrived out of order.
    ProtocolViolation(String),
    /// The initial validator set was rejected or an update could not be computed.
    ValidatorSet(String),
    /// Block assembly failed at Commit.
    CommitFailed(String),
    /// Block production already stopped after an earlier fatal condition.
    Halted,
}

impl fmt::Display for FatalCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalCondition::ProtocolViolation(e) => write!(f, "protocol violation: {}", e),
            FatalCondition::ValidatorSet(e) => write!(f, "validator set failure: {}", e),
            FatalCondition::CommitFailed(e) => write!(f, "commit failed: {}", e),
            FatalCondition::Halted => write!(f, "block production halted"),
        }
    }
}

/// Errors surfaced by the adapter's protocol handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbciError {
    NotInitialized,
    AlreadyInitialized,
    Encoding(String),
    /// The backend rejected a decoded transaction.
    Validation(String),
    Internal(String),
    Fatal(FatalCondition),
}

impl AbciError {
    pub fn code(&self) -> Code {
        match self {
            AbciError::NotInitialized => Code::NotInitialized,
            AbciError::AlreadyInitialized => Code::ProtocolViolation,
            AbciError::Encoding(_) => Code::EncodingError,
            AbciError::Validation(_) => Code::UnknownRequest,
            AbciError::Internal(_) => Code::InternalError,
            AbciError::Fatal(FatalCondition::ProtocolViolation(_))
            | AbciError::Fatal(FatalCondition::Halted) => Code::ProtocolViolation,
            AbciError::Fatal(_) => Code::InternalError,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, AbciError::Fatal(_))
    }

    pub fn into_result(self) -> AbciResult {
        AbciResult::error(self.code(), &self.to_string())
    }
}

impl fmt::Display for AbciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbciError::NotInitialized => write!(f, "application has no backend attached"),
            AbciError::AlreadyInitialized => write!(f, "application already has a backend attached"),
            AbciError::Encoding(e) => write!(f, "encoding error: {}", e),
            AbciError::Validation(e) => write!(f, "unknown request: {}", e),
            AbciError::Internal(e) => write!(f, "internal error: {}", e),
            AbciError::Fatal(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for AbciError {}

impl From<DecodeError> for AbciError {
    fn from(err: DecodeError) -> Self {
        AbciError::Encoding(err.to_string())
    }
}

impl From<BackendError> for AbciError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Rejected(detail) => AbciError::Validation(detail),
            other => AbciError::Internal(other.to_string()),
        }
    }
}

impl From<FatalCondition> for AbciError {
    fn from(condition: FatalCondition) -> Self {
        AbciError::Fatal(condition)
    }
}

pub type AppResult<T> = Result<T, AbciError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(AbciError::Encoding("x".into()).code(), Code::EncodingError);
        assert_eq!(AbciError::Validation("x".into()).code(), Code::UnknownRequest);
        assert_eq!(AbciError::Internal("x".into()).code(), Code::InternalError);
        assert_eq!(
            AbciError::Fatal(FatalCondition::ProtocolViolation("x".into())).code(),
            Code::ProtocolViolation
        );
        assert_eq!(
            AbciError::Fatal(FatalCondition::CommitFailed("x".into())).code(),
            Code::InternalError
        );
    }

    #[test]
    fn test_backend_rejection_maps_to_validation() {
        let err: AbciError = BackendError::Rejected("bad nonce".into()).into();
        assert_eq!(err, AbciError::Validation("bad nonce".into()));

        let err: AbciError = BackendError::BlockAssembly("disk full".into()).into();
        assert!(matches!(err, AbciError::Internal(_)));
    }

    #[test]
    fn test_into_result_carries_detail() {
        let result = AbciError::Validation("invalid nonce".into()).into_result();
        assert_eq!(result.code, Code::UnknownRequest);
        assert!(result.log.contains("invalid nonce"));
    }
}
